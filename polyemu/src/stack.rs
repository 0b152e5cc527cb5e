use crate::{
    engine::Machine,
    errors::{EmulatorError, Result},
    memory::Memory,
    registers::StackRegister,
    utils::align,
};

/// Pointer-sized stack operations on the guest stack of the current thread.
pub trait Stack {
    /// Push one pointer-sized value, returns the new sp.
    fn stack_push(&mut self, value: u64) -> Result<u64>;

    fn stack_pop(&mut self) -> Result<u64>;

    /// Read the pointer at `sp + offset` without moving sp. The offset is in
    /// bytes and may be negative.
    fn stack_read(&self, offset: i64) -> Result<u64>;
    fn stack_write(&mut self, offset: i64, value: u64) -> Result<()>;

    /// Copy `s` below sp and move sp to it, aligned down to `alignment`
    /// (pointer size when `None`).
    fn aligned_push_bytes(&mut self, s: impl AsRef<[u8]>, alignment: Option<u64>) -> Result<u64>;

    fn aligned_push_str(&mut self, s: &str) -> Result<u64> {
        let mut b = s.as_bytes().to_vec();
        b.push(0);
        self.aligned_push_bytes(&b, None)
    }
}

fn offset_sp(sp: u64, offset: i64) -> Result<u64> {
    sp.checked_add_signed(offset)
        .ok_or_else(|| EmulatorError::InvalidState("stack offset overflow".into()))
}

impl Stack for Machine {
    fn stack_push(&mut self, value: u64) -> Result<u64> {
        let ps = self.pointer_size();
        let new_sp = self.incr_sp(-(ps as i64))?;
        self.write_ptr(new_sp, value, Some(ps))?;
        Ok(new_sp)
    }

    fn stack_pop(&mut self) -> Result<u64> {
        let ps = self.pointer_size();
        let v = self.read_ptr(self.sp()?, Some(ps))?;
        self.incr_sp(ps as i64)?;
        Ok(v)
    }

    fn stack_read(&self, offset: i64) -> Result<u64> {
        let addr = offset_sp(self.sp()?, offset)?;
        self.read_ptr(addr, None)
    }

    fn stack_write(&mut self, offset: i64, value: u64) -> Result<()> {
        let addr = offset_sp(self.sp()?, offset)?;
        self.write_ptr(addr, value, None)
    }

    fn aligned_push_bytes(&mut self, s: impl AsRef<[u8]>, alignment: Option<u64>) -> Result<u64> {
        let alignment = alignment.unwrap_or_else(|| self.pointer_size() as u64);
        let data = s.as_ref();
        let top = self
            .sp()?
            .checked_sub(data.len() as u64)
            .ok_or_else(|| EmulatorError::InvalidState("stack underflow".into()))?;
        let top = align(top, alignment);
        Memory::write(self, top, data)?;
        self.set_sp(top)?;
        Ok(top)
    }
}
