//! Initial process state: stack, arguments and the per-OS entry contract.

use super::{ImageSet, LoadInfo, StubTable};
use crate::{
    arch::{ArchType, RegisterX86, RegisterX8664},
    engine::Machine,
    errors::{EmulatorError, Result},
    memory::{Permission, Placement},
    os::{Kernel, OsType, GUEST_PID, GUEST_UID},
    registers::{Registers, StackRegister},
    stack::Stack,
    utils::{align, align_up, Packer},
    PAGE_SIZE,
};
use bytes::{BufMut, BytesMut};
use goblin::container::Endian;
use log::debug;

/// auxiliary vector types
/// see: https://man7.org/linux/man-pages/man3/getauxval.3.html
#[allow(non_camel_case_types)]
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
enum AUXV {
    AT_NULL = 0,
    AT_PHDR = 3,
    AT_PHENT = 4,
    AT_PHNUM = 5,
    AT_PAGESZ = 6,
    AT_BASE = 7,
    AT_FLAGS = 8,
    AT_ENTRY = 9,
    AT_UID = 11,
    AT_EUID = 12,
    AT_GID = 13,
    AT_EGID = 14,
    AT_PLATFORM = 15,
    AT_HWCAP = 16,
    AT_CLKTCK = 17,
    AT_SECURE = 23,
    AT_RANDOM = 25,
    AT_HWCAP2 = 26,
    AT_EXECFN = 31,
}

/// FreeBSD reuses 15 for the executable path.
const AT_FREEBSD_EXECPATH: u64 = 15;

/// Stubs the guest reaches by returning or jumping into them. The bytes are
/// `int3` so a stray jump that skips the stub check still traps.
pub fn map_stub_region(m: &mut Machine, k: &Kernel) -> Result<()> {
    let range = k.state.stubs.range();
    let size = StubTable::region_size();
    m.mem
        .map(Placement::Fixed(range.start), size, Permission::READ | Permission::EXEC, "[stubs]")?;
    m.mem.write_raw(range.start, &vec![0xcc; size as usize])?;
    Ok(())
}

fn map_stack(m: &mut Machine, k: &Kernel) -> Result<u64> {
    let base = k.layout.stack_address;
    let size = k.layout.stack_size;
    m.mem
        .map(Placement::Fixed(base), size, Permission::READ | Permission::WRITE, "[stack]")?;
    let top = base + size;
    m.set_sp(top)?;
    Ok(top)
}

/// Push `strings` NUL terminated, returning their addresses in order.
fn push_strings<'s>(m: &mut Machine, strings: impl IntoIterator<Item = &'s str>) -> Result<Vec<u64>> {
    let mut out = vec![];
    for s in strings {
        out.push(m.aligned_push_str(s)?);
    }
    Ok(out)
}

fn put_vector(table: &mut BytesMut, packer: &Packer, values: &[u64]) {
    for v in values {
        table.put_slice(&packer.pack(*v));
    }
    // add a nullptr sentinel
    table.put_slice(&packer.pack(0));
}

fn platform(arch: ArchType) -> &'static str {
    match arch {
        ArchType::X86 => "i686",
        ArchType::X8664 => "x86_64",
        ArchType::Arm => "v7l",
        ArchType::Arm64 => "aarch64",
        ArchType::Mips => "mips",
        ArchType::Riscv64 => "riscv64",
    }
}

/// Prepare registers and stack so that executing from `info.entry` behaves
/// like a freshly exec'd process of the target OS.
pub fn bootstrap(
    m: &mut Machine,
    k: &mut Kernel,
    images: &ImageSet,
    info: &mut LoadInfo,
    argv: &[String],
) -> Result<()> {
    let main = images
        .main()
        .ok_or_else(|| EmulatorError::InvalidState("no main image".into()))?;
    let top = map_stack(m, k)?;
    let argv: Vec<String> = match argv.is_empty() {
        true => vec![main.path.clone()],
        false => argv.to_vec(),
    };
    let env: Vec<String> = k.env.iter().map(|(key, v)| format!("{}={}", key, v)).collect();
    match k.os {
        OsType::Linux | OsType::FreeBSD => start_elf(m, k, info, &argv, &env)?,
        OsType::MacOS => start_macos(m, k, info, &argv, &env)?,
        OsType::Windows => start_windows(m, k, main.base, info, top)?,
    }
    k.set_brk(align_up(info.brk, PAGE_SIZE));
    info.stack_pointer = m.sp()?;
    debug!(
        "process entry {:#x}, sp {:#x}, brk {:#x}",
        info.entry, info.stack_pointer, k.state.brk
    );
    Ok(())
}

/// argc, argv, envp and the aux vector at sp, as the SysV ABIs expect.
fn start_elf(m: &mut Machine, k: &mut Kernel, info: &LoadInfo, argv: &[String], env: &[String]) -> Result<()> {
    let packer = m.packer();
    let argv_ptrs = push_strings(m, argv.iter().map(String::as_str))?;
    let env_ptrs = push_strings(m, env.iter().map(String::as_str))?;
    let execfn = m.aligned_push_str(&argv[0])?;
    let random = k.state.rng.fill(16);
    let randdata_addr = m.aligned_push_bytes(&random, None)?;
    let platform_addr = m.aligned_push_str(platform(m.arch.arch))?;

    let mut elf_table = BytesMut::new();
    // write argc
    elf_table.put_slice(&packer.pack(argv_ptrs.len() as u64));
    put_vector(&mut elf_table, &packer, &argv_ptrs);
    put_vector(&mut elf_table, &packer, &env_ptrs);

    let aux_entries: Vec<(u64, u64)> = match k.os {
        OsType::FreeBSD => vec![
            (AUXV::AT_PHDR as u64, info.phdr),
            (AUXV::AT_PHENT as u64, info.phent),
            (AUXV::AT_PHNUM as u64, info.phnum),
            (AUXV::AT_PAGESZ as u64, PAGE_SIZE),
            (AUXV::AT_BASE as u64, 0),
            (AUXV::AT_FLAGS as u64, 0),
            (AUXV::AT_ENTRY as u64, info.entry),
            (AT_FREEBSD_EXECPATH, execfn),
            (AUXV::AT_NULL as u64, 0),
        ],
        _ => vec![
            (
                AUXV::AT_HWCAP as u64,
                match (m.pointer_size(), m.arch.endian()) {
                    (8, _) => 0x078bfbfd,
                    (_, Endian::Big) => 0xd7b81f,
                    _ => 0x1fb8d7,
                },
            ),
            (AUXV::AT_PAGESZ as u64, PAGE_SIZE),
            (AUXV::AT_CLKTCK as u64, 100),
            // following three: store aux vector data for gdb use
            (AUXV::AT_PHDR as u64, info.phdr),
            (AUXV::AT_PHENT as u64, info.phent),
            (AUXV::AT_PHNUM as u64, info.phnum),
            (AUXV::AT_BASE as u64, 0),
            (AUXV::AT_FLAGS as u64, 0),
            (AUXV::AT_ENTRY as u64, info.entry),
            (AUXV::AT_UID as u64, GUEST_UID),
            (AUXV::AT_EUID as u64, GUEST_UID),
            (AUXV::AT_GID as u64, GUEST_UID),
            (AUXV::AT_EGID as u64, GUEST_UID),
            (AUXV::AT_SECURE as u64, 0),
            (AUXV::AT_RANDOM as u64, randdata_addr),
            (AUXV::AT_HWCAP2 as u64, 0),
            (AUXV::AT_EXECFN as u64, execfn),
            (AUXV::AT_PLATFORM as u64, platform_addr),
            (AUXV::AT_NULL as u64, 0),
        ],
    };
    for (key, value) in aux_entries {
        elf_table.put_slice(&packer.pack(key));
        elf_table.put_slice(&packer.pack(value));
    }
    // write elf table
    let sp = Stack::aligned_push_bytes(m, elf_table.as_ref(), Some(0x10))?;
    if k.os == OsType::FreeBSD && m.arch.arch == ArchType::X8664 {
        // FreeBSD's _start takes the table pointer in rdi
        Registers::write(m, RegisterX8664::RDI, sp)?;
    }
    m.set_pc(info.entry)
}

/// LC_MAIN entries are called as `main(argc, argv, envp, apple)` and return
/// into the exit stub; LC_UNIXTHREAD entries find the vectors at sp.
fn start_macos(m: &mut Machine, k: &mut Kernel, info: &LoadInfo, argv: &[String], env: &[String]) -> Result<()> {
    let packer = m.packer();
    let argv_ptrs = push_strings(m, argv.iter().map(String::as_str))?;
    let env_ptrs = push_strings(m, env.iter().map(String::as_str))?;
    let exe = format!("executable_path={}", k.state.exe_path);
    let apple_ptrs = push_strings(m, [exe.as_str()])?;

    if !info.entry_is_main {
        let mut table = BytesMut::new();
        table.put_slice(&packer.pack(argv_ptrs.len() as u64));
        put_vector(&mut table, &packer, &argv_ptrs);
        put_vector(&mut table, &packer, &env_ptrs);
        put_vector(&mut table, &packer, &apple_ptrs);
        Stack::aligned_push_bytes(m, table.as_ref(), Some(0x10))?;
        return m.set_pc(info.entry);
    }

    let ps = packer.pointer_size() as u64;
    let mut vectors = BytesMut::new();
    put_vector(&mut vectors, &packer, &argv_ptrs);
    put_vector(&mut vectors, &packer, &env_ptrs);
    put_vector(&mut vectors, &packer, &apple_ptrs);
    let argv_addr = Stack::aligned_push_bytes(m, vectors.as_ref(), Some(0x10))?;
    let envp_addr = argv_addr + (argv_ptrs.len() as u64 + 1) * ps;
    let apple_addr = envp_addr + (env_ptrs.len() as u64 + 1) * ps;
    let exit = k.state.stubs.stub_for(StubTable::INTERNAL, StubTable::PROCESS_EXIT)?;
    k.cc.setup_call(
        m,
        info.entry,
        &[argv_ptrs.len() as u64, argv_addr, envp_addr, apple_addr],
        exit,
    )
}

/// Windows entry points are called with a return address into the exit
/// stub. The TEB/PEB pages carry the fields guest code reads through fs/gs.
fn start_windows(m: &mut Machine, k: &mut Kernel, image_base: u64, info: &LoadInfo, top: u64) -> Result<()> {
    let packer = m.packer();
    let ps = packer.pointer_size() as u64;
    let stack_end = k.layout.stack_address + k.layout.stack_size;
    let teb = m.mem.map(
        Placement::Auto { min: stack_end },
        2 * PAGE_SIZE,
        Permission::READ | Permission::WRITE,
        "[teb]",
    )?;
    let peb = teb + PAGE_SIZE;
    let tid = k.current_tid();
    // (offset, value) per pointer width
    let teb_fields: [(u64, u64); 8] = if ps == 4 {
        [
            (0x00, 0xffff_ffff),
            (0x04, top),
            (0x08, k.layout.stack_address),
            (0x18, teb),
            (0x20, GUEST_PID),
            (0x24, tid),
            (0x30, peb),
            (0x34, 0),
        ]
    } else {
        [
            (0x00, 0),
            (0x08, top),
            (0x10, k.layout.stack_address),
            (0x30, teb),
            (0x40, GUEST_PID),
            (0x48, tid),
            (0x60, peb),
            (0x68, 0),
        ]
    };
    for (offset, value) in teb_fields {
        m.mem.write_raw(teb + offset, &packer.pack(value))?;
    }
    // PEB.ImageBaseAddress
    m.mem.write_raw(peb + 2 * ps, &packer.pack(image_base))?;
    match m.arch.arch {
        ArchType::X86 => Registers::write(m, RegisterX86::FS_BASE, teb)?,
        _ => Registers::write(m, RegisterX8664::GS_BASE, teb)?,
    }

    m.set_sp(align(top - 0x100, 0x10u64))?;
    let exit = k.state.stubs.stub_for(StubTable::INTERNAL, StubTable::PROCESS_EXIT)?;
    k.cc.setup_call(m, info.entry, &[], exit)
}
