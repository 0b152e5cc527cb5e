//! FreeBSD and macOS specific syscalls.

use super::{posix, syscall::SysCalls, Effect, Errno, Kernel, OsType, Outcome, SysOutcome, GUEST_PID};
use crate::{arch::RegisterX8664, engine::Machine, memory::Memory, registers::Registers};
use log::debug;

const AMD64_GET_FSBASE: u64 = 128;
const AMD64_SET_FSBASE: u64 = 129;
const AMD64_GET_GSBASE: u64 = 130;
const AMD64_SET_GSBASE: u64 = 131;

const CTL_KERN: u32 = 1;
const CTL_HW: u32 = 6;
const KERN_OSTYPE: u32 = 1;
const KERN_OSRELEASE: u32 = 2;
const KERN_HOSTNAME: u32 = 10;
const KERN_ARND: u32 = 37;
const HW_MACHINE: u32 = 1;
const HW_NCPU: u32 = 3;
const HW_PAGESIZE: u32 = 7;

pub(crate) fn dispatch(
    k: &mut Kernel,
    m: &mut Machine,
    call: SysCalls,
    args: &[u64],
) -> Option<SysOutcome> {
    let a = |i: usize| args.get(i).copied().unwrap_or_default();
    use SysCalls::*;
    Some(match call {
        EXIT => Ok(Outcome::with_effect(0, Effect::ExitProcess(a(0)))),
        SYSARCH => sysarch(m, a(0), a(1)),
        ISSETUGID => Ok(Outcome::ok(0)),
        THR_SELF => {
            let tid = k.current_tid();
            m.write_u64(a(0), tid).map_err(Errno::from).map(|_| Outcome::ok(0))
        }
        THR_EXIT => {
            if a(0) != 0 {
                // `long *state` is set and woken for joiners
                if m.write_u64(a(0), 1).is_ok() {
                    k.state.threads.futex_wake(a(0), u64::MAX);
                }
            }
            Ok(Outcome::with_effect(0, Effect::ExitThread(0)))
        }
        THR_KILL => posix::kill(GUEST_PID, a(1)),
        THREAD_SELFID => Ok(Outcome::ok(k.current_tid())),
        GETENTROPY => {
            if a(1) > 256 {
                return Some(Err(Errno::EIO));
            }
            let bytes = k.state.rng.fill(a(1) as usize);
            k.write_bytes(m, a(0), &bytes).map(|_| Outcome::ok(0))
        }
        __SYSCTL => sysctl(k, m, a(0), a(1), a(2), a(3)),
        _ => return None,
    })
}

fn sysarch(m: &mut Machine, op: u64, parms: u64) -> SysOutcome {
    match op {
        AMD64_SET_FSBASE | AMD64_SET_GSBASE => {
            let base = m.read_ptr(parms, Some(8))?;
            let reg = match op {
                AMD64_SET_FSBASE => RegisterX8664::FS_BASE,
                _ => RegisterX8664::GS_BASE,
            };
            Registers::write(m, reg, base)?;
        }
        AMD64_GET_FSBASE | AMD64_GET_GSBASE => {
            let reg = match op {
                AMD64_GET_FSBASE => RegisterX8664::FS_BASE,
                _ => RegisterX8664::GS_BASE,
            };
            let base = Registers::read(m, reg)?;
            m.write_u64(parms, base)?;
        }
        _ => return Err(Errno::EINVAL),
    }
    Ok(Outcome::ok(0))
}

/// The handful of sysctl nodes libc start-up code asks for.
fn sysctl_value(k: &mut Kernel, name: &[u32], want: usize) -> Option<Vec<u8>> {
    let cstr = |s: &str| {
        let mut v = s.as_bytes().to_vec();
        v.push(0);
        v
    };
    let int = |v: u32| v.to_le_bytes().to_vec();
    Some(match name {
        [CTL_KERN, KERN_OSTYPE] => cstr(match k.os {
            OsType::MacOS => "Darwin",
            _ => "FreeBSD",
        }),
        [CTL_KERN, KERN_OSRELEASE] => cstr(match k.os {
            OsType::MacOS => "21.6.0",
            _ => "13.1-RELEASE",
        }),
        [CTL_KERN, KERN_HOSTNAME] => cstr("polyemu"),
        [CTL_KERN, KERN_ARND] => k.state.rng.fill(want.min(256)),
        [CTL_HW, HW_MACHINE] => cstr("amd64"),
        [CTL_HW, HW_NCPU] => int(1),
        [CTL_HW, HW_PAGESIZE] => int(crate::PAGE_SIZE as u32),
        _ => return None,
    })
}

fn sysctl(k: &mut Kernel, m: &mut Machine, name: u64, namelen: u64, oldp: u64, oldlenp: u64) -> SysOutcome {
    if namelen == 0 || namelen > 24 {
        return Err(Errno::EINVAL);
    }
    let mut mib = vec![];
    for i in 0..namelen {
        mib.push(m.read_u32(name + 4 * i)?);
    }
    let want = match oldlenp {
        0 => 0,
        p => m.read_ptr(p, Some(8))? as usize,
    };
    let value = match sysctl_value(k, &mib, want) {
        Some(v) => v,
        None => {
            debug!("sysctl {:?} unknown", mib);
            return Err(Errno::ENOENT);
        }
    };
    if oldp != 0 {
        if want < value.len() {
            return Err(Errno::ENOMEM);
        }
        Memory::write(m, oldp, &value)?;
    }
    if oldlenp != 0 {
        m.write_u64(oldlenp, value.len() as u64)?;
    }
    Ok(Outcome::ok(0))
}
