//! Linux-only syscalls: threads, futexes and tls setup.

use super::{posix, syscall::SysCalls, thread::WaitReason, Effect, Errno, Kernel, Outcome, SysOutcome, GUEST_PID};
use crate::{
    arch::{ArchType, RegisterArm, RegisterArm64, RegisterMips, RegisterRiscv, RegisterX86, RegisterX8664},
    engine::Machine,
    errors::Result,
    registers::{Registers, StackRegister},
};
use log::{debug, warn};

const CLONE_VM: u64 = 0x100;
const CLONE_THREAD: u64 = 0x10000;
const CLONE_SETTLS: u64 = 0x80000;
const CLONE_PARENT_SETTID: u64 = 0x100000;
const CLONE_CHILD_CLEARTID: u64 = 0x200000;
const CLONE_CHILD_SETTID: u64 = 0x0100_0000;

const FUTEX_WAIT: u64 = 0;
const FUTEX_WAKE: u64 = 1;
const FUTEX_REQUEUE: u64 = 3;
const FUTEX_CMP_REQUEUE: u64 = 4;
const FUTEX_WAIT_BITSET: u64 = 9;
const FUTEX_WAKE_BITSET: u64 = 10;

const ARCH_SET_GS: u64 = 0x1001;
const ARCH_SET_FS: u64 = 0x1002;
const ARCH_GET_FS: u64 = 0x1003;
const ARCH_GET_GS: u64 = 0x1004;

/// gdt slot handed out for `set_thread_area(-1)`.
const TLS_GDT_ENTRY: u32 = 12;

pub(crate) fn dispatch(
    k: &mut Kernel,
    m: &mut Machine,
    call: SysCalls,
    args: &[u64],
) -> Option<SysOutcome> {
    let a = |i: usize| args.get(i).copied().unwrap_or_default();
    use SysCalls::*;
    Some(match call {
        // `exit` ends only the calling thread, `exit_group` the process
        EXIT => Ok(Outcome::with_effect(0, Effect::ExitThread(a(0)))),
        CLONE => clone(k, m, args),
        FUTEX => futex(k, m, a(0), a(1), a(2)),
        SET_TID_ADDRESS => {
            if let Some(t) = k.state.threads.current_mut() {
                t.clear_child_tid = a(0);
            }
            Ok(Outcome::ok(k.current_tid()))
        }
        SET_ROBUST_LIST => Ok(Outcome::ok(0)),
        ARCH_PRCTL => arch_prctl(m, a(0), a(1)),
        SET_THREAD_AREA => set_thread_area(k, m, a(0)),
        SET_TLS => sys_set_tls(k, m, a(0)),
        TKILL => posix::kill(GUEST_PID, a(1)),
        TGKILL => posix::kill(GUEST_PID, a(2)),
        _ => return None,
    })
}

/// Point the thread pointer at `tls`. On x86 `tls` is a `user_desc`.
fn set_tls(k: &Kernel, m: &mut Machine, tls: u64) -> Result<()> {
    match k.arch {
        ArchType::X86 => {
            let base = m.read_u32(tls.wrapping_add(4))? as u64;
            Registers::write(m, RegisterX86::GS_BASE, base)
        }
        ArchType::X8664 => Registers::write(m, RegisterX8664::FS_BASE, tls),
        ArchType::Arm => Registers::write(m, RegisterArm::C13_C0_3, tls),
        ArchType::Arm64 => Registers::write(m, RegisterArm64::TPIDR_EL0, tls),
        ArchType::Mips => Registers::write(m, RegisterMips::CP0_USERLOCAL, tls),
        ArchType::Riscv64 => Registers::write(m, RegisterRiscv::TP, tls),
    }
}

fn sys_set_tls(k: &Kernel, m: &mut Machine, tls: u64) -> SysOutcome {
    set_tls(k, m, tls)?;
    Ok(Outcome::ok(0))
}

fn set_thread_area(k: &mut Kernel, m: &mut Machine, addr: u64) -> SysOutcome {
    match k.arch {
        ArchType::Mips => {
            Registers::write(m, RegisterMips::CP0_USERLOCAL, addr)?;
            Ok(Outcome::ok(0))
        }
        ArchType::X86 => {
            if m.read_u32(addr)? == u32::MAX {
                m.write_u32(addr, TLS_GDT_ENTRY)?;
            }
            set_tls(k, m, addr)?;
            Ok(Outcome::ok(0))
        }
        _ => Err(Errno::ENOSYS),
    }
}

fn arch_prctl(m: &mut Machine, code: u64, addr: u64) -> SysOutcome {
    match code {
        ARCH_SET_FS => Registers::write(m, RegisterX8664::FS_BASE, addr)?,
        ARCH_SET_GS => Registers::write(m, RegisterX8664::GS_BASE, addr)?,
        ARCH_GET_FS => {
            let v = Registers::read(m, RegisterX8664::FS_BASE)?;
            m.write_u64(addr, v)?;
        }
        ARCH_GET_GS => {
            let v = Registers::read(m, RegisterX8664::GS_BASE)?;
            m.write_u64(addr, v)?;
        }
        _ => return Err(Errno::EINVAL),
    }
    Ok(Outcome::ok(0))
}

/// Thread creation. Only `CLONE_VM | CLONE_THREAD` clones are supported;
/// the child starts from the parent's registers with a zero result.
fn clone(k: &mut Kernel, m: &mut Machine, args: &[u64]) -> SysOutcome {
    let a = |i: usize| args.get(i).copied().unwrap_or_default();
    let flags = a(0);
    if flags & (CLONE_VM | CLONE_THREAD) != CLONE_VM | CLONE_THREAD {
        warn!("clone({:#x}) without a shared address space is not supported", flags);
        return Err(Errno::ENOSYS);
    }
    let stack = a(1);
    let (ptid, ctid, tls) = match k.arch {
        ArchType::X8664 => (a(2), a(3), a(4)),
        _ => (a(2), a(4), a(3)),
    };

    let parent = m.save_registers()?;
    let abi = k.syscall_abi()?.clone();
    abi.write_result(m, Ok(0))?;
    if stack != 0 {
        m.set_sp(stack)?;
    }
    if flags & CLONE_SETTLS != 0 {
        set_tls(k, m, tls)?;
    }
    let child = m.save_registers()?;
    m.restore_registers(&parent)?;

    let clear_tid = match flags & CLONE_CHILD_CLEARTID {
        0 => 0,
        _ => ctid,
    };
    let tid = k.state.threads.spawn(child, clear_tid);
    if flags & CLONE_PARENT_SETTID != 0 {
        m.write_u32(ptid, tid as u32)?;
    }
    if flags & CLONE_CHILD_SETTID != 0 {
        m.write_u32(ctid, tid as u32)?;
    }
    debug!("clone -> thread {} stack {:#x}", tid, stack);
    Ok(Outcome::ok(tid))
}

fn futex(k: &mut Kernel, m: &mut Machine, addr: u64, op: u64, val: u64) -> SysOutcome {
    match op & 0x7f {
        FUTEX_WAIT | FUTEX_WAIT_BITSET => {
            if m.read_u32(addr)? != val as u32 {
                return Err(Errno::EAGAIN);
            }
            Ok(Outcome::with_effect(
                0,
                Effect::Block {
                    reason: WaitReason::Futex { addr },
                    restart: false,
                },
            ))
        }
        FUTEX_WAKE | FUTEX_WAKE_BITSET | FUTEX_REQUEUE | FUTEX_CMP_REQUEUE => {
            Ok(Outcome::ok(k.state.threads.futex_wake(addr, val)))
        }
        other => {
            warn!("futex op {} not supported", other);
            Err(Errno::ENOSYS)
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        arch::{ArchType, RegisterX86, RegisterX8664},
        config::{EmuConfig, MemoryLayout},
        engine::Machine,
        memory::{Permission, Placement},
        os::{syscall::syscall_number, thread::WaitReason, Effect, Errno, Kernel, OsType},
        registers::{Registers, StackRegister},
        testing::TinyX86,
    };

    const DATA: u64 = 0x20000;

    fn setup() -> (Kernel, Machine) {
        let layout = MemoryLayout::default_for(OsType::Linux, 8);
        let k = Kernel::new(OsType::Linux, ArchType::X8664, &EmuConfig::default(), layout, "/a").unwrap();
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X8664)));
        m.mem
            .map(Placement::Fixed(DATA), 0x1000, Permission::READ | Permission::WRITE, "data")
            .unwrap();
        (k, m)
    }

    fn nr(name: &str) -> u64 {
        syscall_number(OsType::Linux, ArchType::X8664, name).unwrap()
    }

    #[test]
    fn test_clone_creates_thread_with_zero_result() {
        let (mut k, mut m) = setup();
        m.set_sp(0x7000).unwrap();
        Registers::write(&mut m, RegisterX8664::RAX, nr("clone")).unwrap();
        // CLONE_VM | CLONE_THREAD | CLONE_SETTLS | CLONE_PARENT_SETTID
        let flags = 0x100 | 0x10000 | 0x80000 | 0x100000;
        let out = k
            .handle_syscall(&mut m, nr("clone"), &[flags, 0x9000, DATA, 0, 0x4444, 0])
            .unwrap();
        let tid = out.value.unwrap();
        assert_ne!(tid, k.current_tid());
        assert_eq!(m.read_u32(DATA).unwrap() as u64, tid);
        // the parent keeps its registers
        assert_eq!(m.sp().unwrap(), 0x7000);

        let child = &k.state.threads.get(tid).unwrap().regs;
        assert_eq!(child.get(&(RegisterX8664::RSP as i32)), Some(&0x9000));
        assert_eq!(child.get(&(RegisterX8664::FS_BASE as i32)), Some(&0x4444));
        assert_eq!(child.get(&(RegisterX8664::RAX as i32)), None);

        // fork-like clones are refused
        let out = k.handle_syscall(&mut m, nr("clone"), &[17, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(out.value, Err(Errno::ENOSYS));
    }

    #[test]
    fn test_futex_wait_and_wake() {
        let (mut k, mut m) = setup();
        m.write_u32(DATA, 5).unwrap();
        let out = k.handle_syscall(&mut m, nr("futex"), &[DATA, 0, 4, 0, 0, 0]).unwrap();
        assert_eq!(out.value, Err(Errno::EAGAIN));
        let out = k.handle_syscall(&mut m, nr("futex"), &[DATA, 0x80, 5, 0, 0, 0]).unwrap();
        assert_eq!(
            out.effect,
            Effect::Block {
                reason: WaitReason::Futex { addr: DATA },
                restart: false
            }
        );
        k.state.threads.block_current(WaitReason::Futex { addr: DATA });
        let out = k.handle_syscall(&mut m, nr("futex"), &[DATA, 1, 1, 0, 0, 0]).unwrap();
        assert_eq!(out.value, Ok(1));
    }

    #[test]
    fn test_arch_prctl_and_thread_exit() {
        let (mut k, mut m) = setup();
        let out = k.handle_syscall(&mut m, nr("arch_prctl"), &[0x1002, 0x1234]).unwrap();
        assert_eq!(out.value, Ok(0));
        k.handle_syscall(&mut m, nr("arch_prctl"), &[0x1003, DATA]).unwrap();
        assert_eq!(m.read_u64(DATA).unwrap(), 0x1234);

        let out = k.handle_syscall(&mut m, nr("exit"), &[3]).unwrap();
        assert_eq!(out.effect, Effect::ExitThread(3));
        let out = k.handle_syscall(&mut m, nr("exit_group"), &[4]).unwrap();
        assert_eq!(out.effect, Effect::ExitProcess(4));
        let out = k.handle_syscall(&mut m, nr("tgkill"), &[1000, 1000, 6]).unwrap();
        assert_eq!(out.effect, Effect::ExitProcess(134));
    }

    #[test]
    fn test_x86_thread_area_sets_gs_base() {
        let layout = MemoryLayout::default_for(OsType::Linux, 4);
        let mut k = Kernel::new(OsType::Linux, ArchType::X86, &EmuConfig::default(), layout, "/a").unwrap();
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X86)));
        m.mem
            .map(Placement::Fixed(DATA), 0x1000, Permission::READ | Permission::WRITE, "data")
            .unwrap();
        // user_desc { entry_number = -1, base_addr }
        m.write_u32(DATA, u32::MAX).unwrap();
        m.write_u32(DATA + 4, 0x5000).unwrap();
        let n = syscall_number(OsType::Linux, ArchType::X86, "set_thread_area").unwrap();
        let out = k.handle_syscall(&mut m, n, &[DATA]).unwrap();
        assert_eq!(out.value, Ok(0));
        assert_eq!(m.read_u32(DATA).unwrap(), super::TLS_GDT_ENTRY);
        assert_eq!(Registers::read(&m, RegisterX86::GS_BASE).unwrap(), 0x5000);

        let out = k.handle_syscall(&mut m, n, &[0x9000_0000]).unwrap();
        assert_eq!(out.value, Err(Errno::EFAULT));
    }
}
