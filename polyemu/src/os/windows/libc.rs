//! C runtime stubs bound to imports no loaded library provides. These are
//! cdecl everywhere, the caller pops its own arguments.

use super::params;
use crate::{
    engine::Machine,
    errors::Result,
    os::{ApiOutcome, Effect, Kernel},
    utils::read_cstring,
};
use log::debug;

pub(crate) fn call(k: &mut Kernel, m: &mut Machine, symbol: &str) -> Result<Option<ApiOutcome>> {
    let out = match symbol {
        "puts" => {
            let p = params(k, m, 1)?;
            let mut line = read_cstring(&*m, p[0])?.into_bytes();
            line.push(b'\n');
            match k.write_stdio(1, &line) {
                Ok(()) => ApiOutcome::ret(line.len() as u64, 0),
                // EOF
                Err(_) => ApiOutcome::ret(m.arch.word_mask(), 0),
            }
        }
        "strlen" => {
            let p = params(k, m, 1)?;
            let s = read_cstring(&*m, p[0])?;
            ApiOutcome::ret(s.len() as u64, 0)
        }
        "exit" | "_exit" => {
            let p = params(k, m, 1)?;
            ApiOutcome {
                value: 0,
                cleanup: 0,
                effect: Effect::ExitProcess(p[0] & 0xffff_ffff),
            }
        }
        "malloc" => {
            let p = params(k, m, 1)?;
            let addr = k.state.heap.alloc(m, p[0])?.unwrap_or_default();
            ApiOutcome::ret(addr, 0)
        }
        "calloc" => {
            let p = params(k, m, 2)?;
            let size = p[0].saturating_mul(p[1]);
            let addr = match k.state.heap.alloc(m, size)? {
                Some(addr) => {
                    // freed blocks are handed out again, clear them
                    m.mem.write_raw(addr, &vec![0u8; size as usize])?;
                    addr
                }
                None => 0,
            };
            ApiOutcome::ret(addr, 0)
        }
        "free" => {
            let p = params(k, m, 1)?;
            if p[0] != 0 && !k.state.heap.free(p[0]) {
                debug!("free of unknown block {:#x}", p[0]);
            }
            ApiOutcome::ret(0, 0)
        }
        _ => return Ok(None),
    };
    debug!("{} -> {:#x}", symbol, out.value);
    Ok(Some(out))
}

#[cfg(test)]
mod test {
    use super::call;
    use crate::{
        arch::ArchType,
        config::{EmuConfig, MemoryLayout},
        engine::Machine,
        memory::{Memory, Permission, Placement},
        os::{Effect, Kernel, OsType, StdioMode},
        registers::StackRegister,
        stack::Stack,
        testing::TinyX86,
    };

    const DATA: u64 = 0x20000;

    fn setup() -> (Kernel, Machine) {
        let mut config = EmuConfig::default();
        config.stdio = StdioMode::Capture;
        let layout = MemoryLayout::default_for(OsType::Windows, 4);
        let k = Kernel::new(OsType::Windows, ArchType::X86, &config, layout, "C:\\a.exe").unwrap();
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X86)));
        m.mem
            .map(Placement::Fixed(0), 0x10000, Permission::READ | Permission::WRITE, "stack")
            .unwrap();
        m.mem
            .map(Placement::Fixed(DATA), 0x1000, Permission::READ | Permission::WRITE, "data")
            .unwrap();
        (k, m)
    }

    fn cdecl(k: &mut Kernel, m: &mut Machine, symbol: &str, args: &[u64]) -> crate::os::ApiOutcome {
        m.set_sp(0x8000).unwrap();
        for a in args.iter().rev() {
            m.stack_push(*a).unwrap();
        }
        m.stack_push(0x1234).unwrap();
        call(k, m, symbol).unwrap().unwrap()
    }

    #[test]
    fn test_puts_and_strlen() {
        let (mut k, mut m) = setup();
        Memory::write(&mut m, DATA, b"hello\0").unwrap();
        let out = cdecl(&mut k, &mut m, "puts", &[DATA]);
        assert_eq!((out.value, out.cleanup), (6, 0));
        assert_eq!(k.captured_stdout(), b"hello\n");
        assert_eq!(cdecl(&mut k, &mut m, "strlen", &[DATA]).value, 5);
        assert_eq!(
            cdecl(&mut k, &mut m, "exit", &[2]).effect,
            Effect::ExitProcess(2)
        );
        assert!(call(&mut k, &mut m, "printf").unwrap().is_none());
    }

    #[test]
    fn test_calloc_clears_reused_blocks() {
        let (mut k, mut m) = setup();
        let a = cdecl(&mut k, &mut m, "malloc", &[16]).value;
        Memory::write(&mut m, a, [0xffu8; 16]).unwrap();
        cdecl(&mut k, &mut m, "free", &[a]);
        let b = cdecl(&mut k, &mut m, "calloc", &[4, 4]).value;
        assert_eq!(a, b);
        assert_eq!(Memory::read(&m, b, 16).unwrap(), vec![0u8; 16]);
    }
}
