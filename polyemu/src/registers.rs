use crate::{
    arch::RegId,
    errors::{EmulatorError, Result},
};
use std::collections::BTreeMap;

pub trait Registers {
    fn read(&self, reg: impl Into<RegId>) -> Result<u64>;
    fn write(&mut self, reg: impl Into<RegId>, value: u64) -> Result<()>;
    fn pc(&self) -> Result<u64>;
    fn set_pc(&mut self, value: u64) -> Result<()>;
    /// Non-zero registers only.
    fn save_registers(&self) -> Result<RegisterState>;
    /// Registers missing from `state` are zeroed.
    fn restore_registers(&mut self, state: &RegisterState) -> Result<()>;
}

pub trait StackRegister {
    fn sp(&self) -> Result<u64>;
    fn set_sp(&mut self, value: u64) -> Result<()>;

    /// increment stack pointer by `delta`.
    /// Return new stack pointer
    fn incr_sp(&mut self, delta: i64) -> Result<u64> {
        let cur = self.sp()?;
        let new_sp = cur
            .checked_add_signed(delta)
            .ok_or_else(|| EmulatorError::InvalidState("stack pointer overflow".into()))?;
        self.set_sp(new_sp)?;
        Ok(new_sp)
    }
}

pub type RegisterState = BTreeMap<RegId, u64>;

/// Dense register storage indexed by register id.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RegisterFile {
    values: Vec<u64>,
}

impl RegisterFile {
    pub fn new(count: usize) -> Self {
        Self {
            values: vec![0; count],
        }
    }

    pub fn get(&self, reg: RegId) -> Result<u64> {
        usize::try_from(reg)
            .ok()
            .and_then(|i| self.values.get(i))
            .copied()
            .ok_or_else(|| EmulatorError::InvalidRegister(reg.to_string()))
    }

    pub fn set(&mut self, reg: RegId, value: u64) -> Result<()> {
        let slot = usize::try_from(reg)
            .ok()
            .and_then(|i| self.values.get_mut(i))
            .ok_or_else(|| EmulatorError::InvalidRegister(reg.to_string()))?;
        *slot = value;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::RegisterFile;

    #[test]
    fn test_register_file_bounds() {
        let mut regs = RegisterFile::new(4);
        regs.set(3, 7).unwrap();
        assert_eq!(regs.get(3).unwrap(), 7);
        assert!(regs.get(4).is_err());
        assert!(regs.set(-1, 0).is_err());
    }
}
