#[cfg(feature = "unicorn")]
pub mod unicorn;

use crate::{
    arch::{ArchInfo, RegId},
    errors::{EmulatorError, Result},
    memory::{Access, AddressSpace, Memory, Permission, Placement, PointerSizeT},
    registers::{RegisterState, Registers, StackRegister},
    utils::Packer,
};
use serde::{Deserialize, Serialize};
use std::{
    ops::Range,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

/// Memory as seen by the cpu engine while it executes an instruction.
pub trait Bus {
    fn fetch(&mut self, addr: u64, size: usize) -> Result<Vec<u8>>;
    fn read(&mut self, addr: u64, size: usize) -> Result<Vec<u8>>;
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()>;
    fn address_space(&mut self) -> &mut AddressSpace;
}

impl Bus for AddressSpace {
    fn fetch(&mut self, addr: u64, size: usize) -> Result<Vec<u8>> {
        AddressSpace::fetch(self, addr, size)
    }
    fn read(&mut self, addr: u64, size: usize) -> Result<Vec<u8>> {
        AddressSpace::read(self, addr, size)
    }
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        AddressSpace::write(self, addr, data)
    }
    fn address_space(&mut self) -> &mut AddressSpace {
        self
    }
}

/// CPU-level exception raised by the engine. The faulting instruction did not retire.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CpuException {
    AccessViolation {
        address: u64,
        size: u64,
        access: Access,
    },
    IllegalInstruction,
    DivideByZero,
    GeneralProtection,
    Halt,
}

impl CpuException {
    /// Translate a bus error into the exception the instruction raises.
    pub fn from_bus_error(e: EmulatorError) -> Result<Self> {
        match e {
            EmulatorError::AccessViolation {
                address,
                size,
                access,
            } => Ok(CpuException::AccessViolation {
                address,
                size,
                access,
            }),
            other => Err(other),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Trap {
    /// Software interrupt `n`; pc is past the instruction.
    Interrupt(u32),
    /// `syscall`/`sysenter` style instruction; pc is past the instruction.
    Syscall,
    /// pc still points at the faulting instruction.
    Exception(CpuException),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StepOutcome {
    Executed,
    Trap(Trap),
}

/// Stop condition for batched execution.
#[derive(Clone, Debug, Default)]
pub struct StopCondition {
    pub max_instructions: u64,
    pub until: Option<u64>,
    /// stop before executing any address in these ranges.
    pub breaks: Vec<Range<u64>>,
    pub cancel: Option<Arc<AtomicBool>>,
    pub deadline: Option<Instant>,
}

impl StopCondition {
    fn should_break(&self, pc: u64) -> bool {
        self.until == Some(pc) || self.breaks.iter().any(|r| r.contains(&pc))
    }
    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(false)
            || self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BatchEnd {
    /// instruction budget used up.
    Exhausted,
    /// pc reached `until` or a break range.
    Break,
    Cancelled,
    Trap(Trap),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunOutcome {
    /// retired instructions, including a trapping `int`/`syscall`.
    pub executed: u64,
    pub end: BatchEnd,
}

/// Adapter over an instruction-level cpu emulator.
pub trait CpuEngine {
    fn arch(&self) -> ArchInfo;
    fn reg_read(&self, reg: RegId) -> Result<u64>;
    fn reg_write(&mut self, reg: RegId, value: u64) -> Result<()>;
    /// Execute exactly one instruction at pc.
    fn step(&mut self, bus: &mut dyn Bus) -> Result<StepOutcome>;
    /// Drop any translated/decoded code overlapping the range.
    fn invalidate_code_cache(&mut self, addr: u64, len: u64);

    fn run_until(&mut self, bus: &mut dyn Bus, stop: &StopCondition) -> Result<RunOutcome> {
        let pc_reg = self.arch().pc_reg();
        let mut executed = 0;
        loop {
            if executed >= stop.max_instructions {
                return Ok(RunOutcome {
                    executed,
                    end: BatchEnd::Exhausted,
                });
            }
            if stop.should_break(self.reg_read(pc_reg)?) {
                return Ok(RunOutcome {
                    executed,
                    end: BatchEnd::Break,
                });
            }
            if stop.cancelled() {
                return Ok(RunOutcome {
                    executed,
                    end: BatchEnd::Cancelled,
                });
            }
            match self.step(bus)? {
                StepOutcome::Executed => executed += 1,
                StepOutcome::Trap(trap) => {
                    if !matches!(trap, Trap::Exception(_)) {
                        executed += 1;
                    }
                    return Ok(RunOutcome {
                        executed,
                        end: BatchEnd::Trap(trap),
                    });
                }
            }
        }
    }
}

/// The emulated machine: cpu plus the address space it executes in.
pub struct Machine {
    pub arch: ArchInfo,
    pub cpu: Box<dyn CpuEngine>,
    pub mem: AddressSpace,
}

impl Machine {
    pub fn new(cpu: Box<dyn CpuEngine>) -> Self {
        let arch = cpu.arch();
        Self {
            arch,
            mem: AddressSpace::for_pointer_size(arch.pointer_size()),
            cpu,
        }
    }

    pub fn packer(&self) -> Packer {
        Packer::new(self.arch.endian(), self.arch.pointer_size())
    }

    pub fn pointer_size(&self) -> PointerSizeT {
        self.arch.pointer_size()
    }

    /// Named, non-zero register values.
    pub fn named_registers(&self) -> Result<std::collections::BTreeMap<String, u64>> {
        let mut out = std::collections::BTreeMap::new();
        for (id, name) in self.arch.arch.registers() {
            out.insert(name.to_string(), self.cpu.reg_read(id)?);
        }
        Ok(out)
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        Ok(self.read_ptr(addr, Some(4))? as u32)
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<()> {
        self.write_ptr(addr, value as u64, Some(4))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        self.read_ptr(addr, Some(8))
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<()> {
        self.write_ptr(addr, value, Some(8))
    }
}

impl Registers for Machine {
    fn read(&self, reg: impl Into<RegId>) -> Result<u64> {
        self.cpu.reg_read(reg.into())
    }
    fn write(&mut self, reg: impl Into<RegId>, value: u64) -> Result<()> {
        self.cpu.reg_write(reg.into(), value)
    }
    fn pc(&self) -> Result<u64> {
        self.cpu.reg_read(self.arch.pc_reg())
    }

    fn set_pc(&mut self, value: u64) -> Result<()> {
        self.cpu.reg_write(self.arch.pc_reg(), value)
    }
    fn save_registers(&self) -> Result<RegisterState> {
        let mut reg_values = RegisterState::default();
        for (reg, _) in self.arch.arch.registers() {
            let reg_v = self.cpu.reg_read(reg)?;
            if reg_v != 0 {
                reg_values.insert(reg, reg_v);
            }
        }
        Ok(reg_values)
    }
    fn restore_registers(&mut self, state: &RegisterState) -> Result<()> {
        for (reg, _) in self.arch.arch.registers() {
            self.cpu
                .reg_write(reg, state.get(&reg).copied().unwrap_or_default())?;
        }
        Ok(())
    }
}

impl StackRegister for Machine {
    fn sp(&self) -> Result<u64> {
        self.cpu.reg_read(self.arch.sp_reg())
    }

    fn set_sp(&mut self, value: u64) -> Result<()> {
        self.cpu.reg_write(self.arch.sp_reg(), value)
    }
}

impl Memory for Machine {
    fn mem_map(
        &mut self,
        placement: Placement,
        size: u64,
        perms: Permission,
        info: Option<String>,
    ) -> Result<u64> {
        self.mem.map(
            placement,
            size,
            perms,
            info.unwrap_or_else(|| "[mapped]".to_string()),
        )
    }
    fn mem_unmap(&mut self, addr: u64, size: u64) -> Result<()> {
        self.mem.unmap(addr, size)?;
        self.cpu.invalidate_code_cache(addr, size);
        Ok(())
    }
    fn is_mapped(&self, addr: u64, size: u64) -> bool {
        self.mem.is_mapped(addr, size)
    }
    fn mprotect(&mut self, addr: u64, size: u64, perm: Permission) -> Result<()> {
        self.mem.protect(addr, size, perm)
    }

    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.mem.check_access(addr, len as u64, Access::Read)?;
        self.mem.peek(addr, len)
    }
    fn read_ptr(&self, address: u64, pointersize: Option<PointerSizeT>) -> Result<u64> {
        let pointersize = pointersize.unwrap_or_else(|| self.pointer_size());
        let data = Memory::read(self, address, pointersize as usize)?;
        let packer = Packer::new(self.arch.endian(), pointersize);
        Ok(packer.unpack(data))
    }
    fn write(&mut self, address: u64, bytes: impl AsRef<[u8]>) -> Result<()> {
        self.mem.write(address, bytes.as_ref())
    }

    fn write_ptr(
        &mut self,
        address: u64,
        value: u64,
        pointersize: Option<PointerSizeT>,
    ) -> Result<()> {
        let pointersize = pointersize.unwrap_or_else(|| self.pointer_size());

        let packer = Packer::new(self.arch.endian(), pointersize);
        Memory::write(self, address, packer.pack(value))
    }
}
