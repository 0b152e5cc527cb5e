use crate::{
    arch::{
        ArchType, RegId, RegisterArm, RegisterArm64, RegisterMips, RegisterRiscv, RegisterX86,
        RegisterX8664,
    },
    engine::Machine,
    errors::{EmulatorError, Result},
    memory::{Memory, PointerSizeT},
    os::OsType,
    registers::{Registers, StackRegister},
    stack::Stack,
};
use anyhow::anyhow;

/// Function calling convention: where arguments live and how to return.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CallingConventionCommon {
    retreg: RegId,
    argregs: Vec<RegId>,
    arg_on_stack_num: usize,
    shadow: usize,
    retaddr_on_stack: bool,
    /// holds the return address when it is not on the stack
    retaddr_reg: Option<RegId>,
    /// native address size in bytes
    address_size: PointerSizeT,
}

impl CallingConventionCommon {
    pub fn new(
        ret_reg: impl Into<RegId>,
        arg_regs: Vec<RegId>,
        arg_on_stack: usize,
        shadow: usize,
        ret_addr_on_stack: bool,
        retaddr_reg: Option<RegId>,
        address_size: PointerSizeT,
    ) -> Self {
        Self {
            retreg: ret_reg.into(),
            argregs: arg_regs,
            arg_on_stack_num: arg_on_stack,
            shadow,
            retaddr_on_stack: ret_addr_on_stack,
            retaddr_reg,
            address_size,
        }
    }

    /// The native function calling convention of `arch` under `os`.
    pub fn native(arch: ArchType, os: OsType) -> Self {
        let ps = arch.pointer_size();
        match arch {
            ArchType::X86 => Self::new(RegisterX86::EAX, vec![], 16, 0, true, None, ps),
            ArchType::X8664 if os == OsType::Windows => Self::new(
                RegisterX8664::RAX,
                regs([
                    RegisterX8664::RCX,
                    RegisterX8664::RDX,
                    RegisterX8664::R8,
                    RegisterX8664::R9,
                ]),
                12,
                4,
                true,
                None,
                ps,
            ),
            ArchType::X8664 => Self::new(
                RegisterX8664::RAX,
                regs([
                    RegisterX8664::RDI,
                    RegisterX8664::RSI,
                    RegisterX8664::RDX,
                    RegisterX8664::RCX,
                    RegisterX8664::R8,
                    RegisterX8664::R9,
                ]),
                10,
                0,
                true,
                None,
                ps,
            ),
            ArchType::Arm => Self::new(
                RegisterArm::R0,
                regs([RegisterArm::R0, RegisterArm::R1, RegisterArm::R2, RegisterArm::R3]),
                12,
                0,
                false,
                Some(RegisterArm::LR.into()),
                ps,
            ),
            ArchType::Arm64 => Self::new(
                RegisterArm64::X0,
                regs([
                    RegisterArm64::X0,
                    RegisterArm64::X1,
                    RegisterArm64::X2,
                    RegisterArm64::X3,
                    RegisterArm64::X4,
                    RegisterArm64::X5,
                    RegisterArm64::X6,
                    RegisterArm64::X7,
                ]),
                8,
                0,
                false,
                Some(RegisterArm64::LR.into()),
                ps,
            ),
            ArchType::Mips => Self::new(
                RegisterMips::V0,
                regs([
                    RegisterMips::A0,
                    RegisterMips::A1,
                    RegisterMips::A2,
                    RegisterMips::A3,
                ]),
                12,
                4,
                false,
                Some(RegisterMips::RA.into()),
                ps,
            ),
            ArchType::Riscv64 => Self::new(
                RegisterRiscv::A0,
                regs([
                    RegisterRiscv::A0,
                    RegisterRiscv::A1,
                    RegisterRiscv::A2,
                    RegisterRiscv::A3,
                    RegisterRiscv::A4,
                    RegisterRiscv::A5,
                    RegisterRiscv::A6,
                    RegisterRiscv::A7,
                ]),
                8,
                0,
                false,
                Some(RegisterRiscv::RA.into()),
                ps,
            ),
        }
    }

    pub fn get_return_value(&self, core: &impl Registers) -> Result<u64> {
        core.read(self.retreg)
    }
    pub fn set_return_value(&self, core: &mut impl Registers, val: u64) -> Result<()> {
        core.write(self.retreg, val)
    }

    /// Reserve slots for function arguments.
    ///
    /// This may be used to stage a new frame before executing a native function.
    pub fn reserve(&self, core: &mut impl StackRegister, nslots: usize) -> Result<()> {
        let si = nslots.saturating_sub(self.argregs.len());
        let sp_change = ((self.shadow + si) * self.address_size as usize) as i64;
        core.incr_sp(-sp_change)?;
        Ok(())
    }

    fn get_param_access(&self, index: usize) -> std::result::Result<RegId, u64> {
        if index < self.argregs.len() {
            return Ok(self.argregs[index]);
        }
        let si = index - self.argregs.len();
        Err((self.retaddr_on_stack as usize + self.shadow + si) as u64 * self.address_size as u64)
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.arg_on_stack_num + self.argregs.len() {
            Err(anyhow!(
                "tried to access arg {}, but only {} args are supported",
                index,
                self.arg_on_stack_num + self.argregs.len()
            ))?;
        }
        Ok(())
    }

    /// Read a value of native size from the specified argument slot.
    ///
    /// Only valid at function entry, before the callee touched the stack.
    pub fn get_raw_param(&self, core: &Machine, index: usize, argbits: Option<u64>) -> Result<u64> {
        self.check_index(index)?;
        let v = match self.get_param_access(index) {
            Ok(reg) => Registers::read(core, reg)?,
            Err(s) => Stack::stack_read(core, s as i64)?,
        };

        Ok(match argbits {
            Some(bits) if bits < 64 => v & ((1 << bits) - 1),
            _ => v,
        })
    }

    pub fn set_raw_param(
        &self,
        core: &mut Machine,
        index: usize,
        value: u64,
        argbits: Option<u64>,
    ) -> Result<()> {
        self.check_index(index)?;
        let v = match argbits {
            Some(bits) if bits < 64 => value & ((1 << bits) - 1),
            _ => value,
        };
        match self.get_param_access(index) {
            Ok(reg) => Registers::write(core, reg, v)?,
            Err(s) => Stack::stack_write(core, s as i64, v)?,
        }
        Ok(())
    }

    /// Leave an emulated function: set the return value, drop `cleanup`
    /// stack slots (stdcall) and jump back to the caller.
    pub fn return_from_call(&self, core: &mut Machine, value: u64, cleanup: usize) -> Result<u64> {
        self.set_return_value(core, value)?;
        let ret = if self.retaddr_on_stack {
            let ret = core.stack_pop()?;
            core.incr_sp((cleanup * self.address_size as usize) as i64)?;
            ret
        } else {
            let reg = self
                .retaddr_reg
                .ok_or_else(|| EmulatorError::InvalidState("no return address register".into()))?;
            Registers::read(core, reg)?
        };
        core.set_pc(ret)?;
        Ok(ret)
    }

    /// Return address of the call that was just made.
    pub fn return_address(&self, core: &Machine) -> Result<u64> {
        match (self.retaddr_on_stack, self.retaddr_reg) {
            (true, _) => core.stack_read(0),
            (false, Some(reg)) => Registers::read(core, reg),
            (false, None) => Err(EmulatorError::InvalidState("no return address".into())),
        }
    }

    /// Stage a call to `target` that returns to `ret`.
    pub fn setup_call(&self, core: &mut Machine, target: u64, args: &[u64], ret: u64) -> Result<()> {
        self.reserve(core, args.len())?;
        for (i, arg) in args.iter().enumerate() {
            if i < self.argregs.len() {
                self.set_raw_param(core, i, *arg, None)?;
            } else {
                let offset = (self.shadow + i - self.argregs.len()) * self.address_size as usize;
                Stack::stack_write(core, offset as i64, *arg)?;
            }
        }
        if self.retaddr_on_stack {
            core.stack_push(ret)?;
        } else if let Some(reg) = self.retaddr_reg {
            Registers::write(core, reg, ret)?;
        }
        core.set_pc(target)
    }
}

fn regs<R: Into<RegId>, const N: usize>(r: [R; N]) -> Vec<RegId> {
    r.into_iter().map(Into::into).collect()
}

/// How a syscall reports failure to the guest.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorConvention {
    /// `-errno` in the return register.
    NegErrno,
    /// errno in the return register, error flag in a second register.
    FlagRegister { flag: RegId },
    /// errno in the return register, carry flag set in the flags register.
    CarryFlag { flags: RegId },
}

/// Syscall argument/return convention for an (os, arch) pair.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyscallAbi {
    pub number: RegId,
    pub args: Vec<RegId>,
    pub ret: RegId,
    pub errors: ErrorConvention,
    /// offset of the first stack-passed argument from sp (mips o32).
    pub stack_args_offset: Option<u64>,
    word_mask: u64,
}

impl SyscallAbi {
    pub fn for_target(os: OsType, arch: ArchType) -> Result<Self> {
        let word_mask = if arch.pointer_size() == 4 {
            u32::MAX as u64
        } else {
            u64::MAX
        };
        let (number, args, ret, errors, stack_args_offset) = match (os, arch) {
            (OsType::Linux, ArchType::X86) => (
                RegisterX86::EAX.into(),
                regs([
                    RegisterX86::EBX,
                    RegisterX86::ECX,
                    RegisterX86::EDX,
                    RegisterX86::ESI,
                    RegisterX86::EDI,
                    RegisterX86::EBP,
                ]),
                RegisterX86::EAX.into(),
                ErrorConvention::NegErrno,
                None,
            ),
            (OsType::Linux, ArchType::X8664) => (
                RegisterX8664::RAX.into(),
                amd64_syscall_args(),
                RegisterX8664::RAX.into(),
                ErrorConvention::NegErrno,
                None,
            ),
            (OsType::FreeBSD | OsType::MacOS, ArchType::X8664) => (
                RegisterX8664::RAX.into(),
                amd64_syscall_args(),
                RegisterX8664::RAX.into(),
                ErrorConvention::CarryFlag {
                    flags: RegisterX8664::RFLAGS.into(),
                },
                None,
            ),
            (OsType::Linux, ArchType::Arm) => (
                RegisterArm::R7.into(),
                regs([
                    RegisterArm::R0,
                    RegisterArm::R1,
                    RegisterArm::R2,
                    RegisterArm::R3,
                    RegisterArm::R4,
                    RegisterArm::R5,
                ]),
                RegisterArm::R0.into(),
                ErrorConvention::NegErrno,
                None,
            ),
            (OsType::Linux, ArchType::Arm64) => (
                RegisterArm64::X8.into(),
                regs([
                    RegisterArm64::X0,
                    RegisterArm64::X1,
                    RegisterArm64::X2,
                    RegisterArm64::X3,
                    RegisterArm64::X4,
                    RegisterArm64::X5,
                ]),
                RegisterArm64::X0.into(),
                ErrorConvention::NegErrno,
                None,
            ),
            (OsType::Linux, ArchType::Mips) => (
                RegisterMips::V0.into(),
                regs([
                    RegisterMips::A0,
                    RegisterMips::A1,
                    RegisterMips::A2,
                    RegisterMips::A3,
                ]),
                RegisterMips::V0.into(),
                ErrorConvention::FlagRegister {
                    flag: RegisterMips::A3.into(),
                },
                Some(16),
            ),
            (OsType::Linux, ArchType::Riscv64) => (
                RegisterRiscv::A7.into(),
                regs([
                    RegisterRiscv::A0,
                    RegisterRiscv::A1,
                    RegisterRiscv::A2,
                    RegisterRiscv::A3,
                    RegisterRiscv::A4,
                    RegisterRiscv::A5,
                ]),
                RegisterRiscv::A0.into(),
                ErrorConvention::NegErrno,
                None,
            ),
            (os, arch) => {
                return Err(EmulatorError::UnsupportedFormat(format!(
                    "no syscall abi for {} on {}",
                    os, arch
                )))
            }
        };
        Ok(Self {
            number,
            args,
            ret,
            errors,
            stack_args_offset,
            word_mask,
        })
    }

    pub fn syscall_number(&self, core: &Machine) -> Result<u64> {
        Registers::read(core, self.number)
    }

    /// Read `count` syscall arguments.
    pub fn read_args(&self, core: &Machine, count: usize) -> Result<Vec<u64>> {
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let v = match self.args.get(i) {
                Some(reg) => Registers::read(core, *reg)?,
                None => match self.stack_args_offset {
                    Some(base) => {
                        let ps = core.pointer_size() as u64;
                        let addr = core.sp()? + base + (i - self.args.len()) as u64 * ps;
                        core.read_ptr(addr, None).unwrap_or_default()
                    }
                    None => 0,
                },
            };
            out.push(v & self.word_mask);
        }
        Ok(out)
    }

    /// Write a syscall result back per the error convention.
    pub fn write_result(&self, core: &mut Machine, result: std::result::Result<u64, u64>) -> Result<()> {
        match (self.errors, result) {
            (ErrorConvention::NegErrno, Ok(v)) => Registers::write(core, self.ret, v & self.word_mask),
            (ErrorConvention::NegErrno, Err(errno)) => {
                Registers::write(core, self.ret, (errno as i64).wrapping_neg() as u64 & self.word_mask)
            }
            (ErrorConvention::FlagRegister { flag }, r) => {
                let (v, f) = match r {
                    Ok(v) => (v, 0),
                    Err(errno) => (errno, 1),
                };
                Registers::write(core, self.ret, v & self.word_mask)?;
                Registers::write(core, flag, f)
            }
            (ErrorConvention::CarryFlag { flags }, r) => {
                let cur = Registers::read(core, flags)?;
                let (v, f) = match r {
                    Ok(v) => (v, cur & !crate::arch::x86::FLAG_CF),
                    Err(errno) => (errno, cur | crate::arch::x86::FLAG_CF),
                };
                Registers::write(core, self.ret, v)?;
                Registers::write(core, flags, f)
            }
        }
    }
}

fn amd64_syscall_args() -> Vec<RegId> {
    regs([
        RegisterX8664::RDI,
        RegisterX8664::RSI,
        RegisterX8664::RDX,
        RegisterX8664::R10,
        RegisterX8664::R8,
        RegisterX8664::R9,
    ])
}

#[cfg(test)]
mod test {
    use super::{CallingConventionCommon, SyscallAbi};
    use crate::{
        arch::{ArchType, RegisterX86},
        engine::Machine,
        memory::{Permission, Placement},
        os::OsType,
        registers::{Registers, StackRegister},
        stack::Stack,
        testing::TinyX86,
    };

    fn machine() -> Machine {
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X86)));
        m.mem
            .map(Placement::Fixed(0x10000), 0x1000, Permission::READ | Permission::WRITE, "[stack]")
            .unwrap();
        m.set_sp(0x11000).unwrap();
        m
    }

    #[test]
    fn test_stdcall_args_and_return() {
        let mut m = machine();
        let cc = CallingConventionCommon::native(ArchType::X86, OsType::Windows);
        m.stack_push(7).unwrap();
        m.stack_push(5).unwrap();
        m.stack_push(0x4000).unwrap(); // return address
        assert_eq!(cc.get_raw_param(&m, 0, None).unwrap(), 5);
        assert_eq!(cc.get_raw_param(&m, 1, None).unwrap(), 7);
        cc.return_from_call(&mut m, 42, 2).unwrap();
        assert_eq!(m.pc().unwrap(), 0x4000);
        assert_eq!(m.sp().unwrap(), 0x11000);
        assert_eq!(Registers::read(&m, RegisterX86::EAX).unwrap(), 42);
    }

    #[test]
    fn test_neg_errno_is_word_sized() {
        let mut m = machine();
        let abi = SyscallAbi::for_target(OsType::Linux, ArchType::X86).unwrap();
        abi.write_result(&mut m, Err(9)).unwrap();
        assert_eq!(Registers::read(&m, RegisterX86::EAX).unwrap(), 0xffff_fff7);
    }

    #[test]
    fn test_unsupported_abi() {
        assert!(SyscallAbi::for_target(OsType::MacOS, ArchType::Arm).is_err());
    }
}
