//! ELF executables and shared objects.
//! See [How programs get run: ELF binaries](https://lwn.net/Articles/631631/).

use super::{basename, file_slice, goblin_error, warn_unsupported_reloc, ImageFormat, Import, LoadedImage, Segment};
use crate::{
    arch::ArchType,
    engine::Machine,
    errors::{EmulatorError, Result},
    memory::{Permission, Placement},
    os::OsType,
    utils::{align, align_up, seg_perm_to_prot},
    PAGE_SIZE,
};
use goblin::elf::{
    header::{EM_386, EM_AARCH64, EM_ARM, EM_MIPS, EM_RISCV, EM_X86_64, ET_DYN, ET_EXEC},
    program_header::{PT_LOAD, PT_PHDR},
    Elf,
};
use log::debug;
use std::collections::BTreeMap;

const EI_OSABI: usize = 7;
const ELFOSABI_FREEBSD: u8 = 9;
const STB_GLOBAL: u8 = 1;
const STB_WEAK: u8 = 2;

pub fn arch_of(machine: u16) -> Result<ArchType> {
    Ok(match machine {
        EM_386 => ArchType::X86,
        EM_X86_64 => ArchType::X8664,
        EM_ARM => ArchType::Arm,
        EM_AARCH64 => ArchType::Arm64,
        EM_MIPS => ArchType::Mips,
        EM_RISCV => ArchType::Riscv64,
        other => {
            return Err(EmulatorError::UnsupportedFormat(format!(
                "ELF machine {} is not supported",
                other
            )))
        }
    })
}

pub fn os_of(elf: &Elf) -> OsType {
    match elf.header.e_ident[EI_OSABI] {
        ELFOSABI_FREEBSD => OsType::FreeBSD,
        _ => OsType::Linux,
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum RelocKind {
    None,
    /// B + A
    Relative,
    /// S + A
    Absolute,
    /// S, the addend of REL entries is ignored
    Bind,
}

fn reloc_kind(arch: ArchType, r_type: u32) -> Option<RelocKind> {
    use RelocKind::*;
    Some(match (arch, r_type) {
        (_, 0) => None,
        (ArchType::X8664, 1) | (ArchType::X86, 1) => Absolute,
        (ArchType::X8664 | ArchType::X86, 6 | 7) => Bind,
        (ArchType::X8664 | ArchType::X86, 8) => Relative,
        (ArchType::Arm, 2) => Absolute,
        (ArchType::Arm, 21 | 22) => Bind,
        (ArchType::Arm, 23) => Relative,
        (ArchType::Arm64, 257) => Absolute,
        (ArchType::Arm64, 1025 | 1026) => Bind,
        (ArchType::Arm64, 1027) => Relative,
        (ArchType::Riscv64, 2) => Absolute,
        (ArchType::Riscv64, 3) => Relative,
        (ArchType::Riscv64, 5) => Bind,
        _ => return Option::None,
    })
}

/// Merged page ranges of the load segments.
#[derive(Clone, Debug)]
struct LoadRegion {
    begin: u64,
    end: u64,
    perms: Permission,
}

pub struct ElfLoad {
    pub image: LoadedImage,
    pub phdr: u64,
    pub phent: u64,
    pub phnum: u64,
}

/// Map an ELF image. Position independent images go to the first free range
/// at or above `preferred`.
pub fn load(m: &mut Machine, data: &[u8], path: &str, is_main: bool, preferred: u64) -> Result<ElfLoad> {
    let elf = Elf::parse(data).map_err(goblin_error)?;
    let arch = arch_of(elf.header.e_machine)?;
    if arch != m.arch.arch {
        return Err(EmulatorError::UnsupportedFormat(format!(
            "{} is a {} image, the cpu is {}",
            path, arch, m.arch.arch
        )));
    }
    if elf.header.e_type != ET_EXEC && elf.header.e_type != ET_DYN {
        return Err(EmulatorError::UnsupportedFormat(format!(
            "ELF type {} is not loadable",
            elf.header.e_type
        )));
    }

    // get list of loadable segments which will be loaded into memory.
    let load_segments = {
        let mut load_segments = elf
            .program_headers
            .iter()
            .filter(|h| h.p_type == PT_LOAD)
            .collect::<Vec<_>>();
        load_segments.sort_by_key(|p| p.p_vaddr);
        load_segments
    };
    if load_segments.is_empty() {
        return Err(EmulatorError::MalformedImage(format!("{} has no loadable segment", path)));
    }
    let limit = m.mem.limit();
    for seg in &load_segments {
        file_slice(data, seg.p_offset, seg.p_filesz, "segment")?;
        if seg.p_filesz > seg.p_memsz {
            return Err(EmulatorError::MalformedImage(
                "segment file size exceeds its memory size".into(),
            ));
        }
        match seg.p_vaddr.checked_add(seg.p_memsz) {
            Some(end) if end <= limit => {}
            _ => {
                return Err(EmulatorError::MalformedImage(format!(
                    "segment [{:#x}, +{:#x}) lies outside the address space",
                    seg.p_vaddr, seg.p_memsz
                )))
            }
        }
    }

    let low = align(load_segments[0].p_vaddr, PAGE_SIZE);
    let high = load_segments
        .iter()
        .map(|s| align_up(s.p_vaddr + s.p_memsz, PAGE_SIZE))
        .max()
        .unwrap_or(low);
    let bias = match elf.header.e_type {
        // may wrap when the image lands below its link address
        ET_DYN => m.mem.find_free(high - low, preferred)?.wrapping_sub(low),
        _ => 0,
    };

    let mut load_regions: Vec<LoadRegion> = Vec::new();
    let mut prev_end = 0u64;
    for seg in &load_segments {
        if seg.p_vaddr < prev_end {
            return Err(EmulatorError::MalformedImage(
                "invalid elf file, segment intersect.".to_string(),
            ));
        }
        prev_end = seg.p_vaddr + seg.p_memsz;
        let lbound = align(bias.wrapping_add(seg.p_vaddr), PAGE_SIZE);
        let ubound = align_up(bias.wrapping_add(seg.p_vaddr + seg.p_memsz), PAGE_SIZE);
        let perms = seg_perm_to_prot(seg.p_flags);
        match load_regions.last_mut() {
            // two segments sharing a page
            Some(prev) if lbound < prev.end => {
                prev.end = prev.end.max(ubound);
                prev.perms |= perms;
            }
            Some(prev) if lbound == prev.end && perms == prev.perms => prev.end = ubound,
            _ => load_regions.push(LoadRegion {
                begin: lbound,
                end: ubound,
                perms,
            }),
        }
    }

    let name = basename(path).to_string();
    for region in &load_regions {
        m.mem.map(
            Placement::Fixed(region.begin),
            region.end - region.begin,
            region.perms,
            name.clone(),
        )?;
    }
    for seg in &load_segments {
        let bytes = file_slice(data, seg.p_offset, seg.p_filesz, "segment")?;
        m.mem.write_raw(bias.wrapping_add(seg.p_vaddr), bytes)?;
    }

    let imports = relocate(m, &elf, arch, bias)?;
    let exports = exports(&elf, bias, is_main);

    let phdr = match elf.program_headers.iter().find(|h| h.p_type == PT_PHDR) {
        Some(h) => bias.wrapping_add(h.p_vaddr),
        None => {
            let first = load_segments[0];
            bias.wrapping_add(first.p_vaddr)
                .wrapping_sub(first.p_offset)
                .wrapping_add(elf.header.e_phoff)
        }
    };
    let base = load_regions[0].begin;
    let end = load_regions.last().map(|r| r.end).unwrap_or(base);
    debug!(
        "{}: {} load regions, bias {:#x}, {} imports, {} exports",
        name,
        load_regions.len(),
        bias,
        imports.len(),
        exports.len()
    );
    Ok(ElfLoad {
        image: LoadedImage {
            name,
            path: path.to_string(),
            format: ImageFormat::Elf,
            entry: bias.wrapping_add(elf.header.e_entry),
            base,
            size: end - base,
            segments: load_regions
                .iter()
                .map(|r| Segment {
                    address: r.begin,
                    size: r.end - r.begin,
                    perms: r.perms,
                })
                .collect(),
            imports,
            exports,
            is_main,
            needed: elf.libraries.iter().map(|l| l.to_string()).collect(),
        },
        phdr,
        phent: elf.header.e_phentsize as u64,
        phnum: elf.header.e_phnum as u64,
    })
}

/// Apply load-base relocations now; symbol relocations become imports the
/// linker binds once every library is mapped.
fn relocate(m: &mut Machine, elf: &Elf, arch: ArchType, bias: u64) -> Result<Vec<Import>> {
    let packer = m.packer();
    let ps = m.pointer_size() as usize;
    let mask = m.arch.word_mask();
    let mut imports = vec![];
    let relocs = elf
        .dynrelas
        .iter()
        .chain(elf.dynrels.iter())
        .chain(elf.pltrelocs.iter());
    for reloc in relocs {
        let at = bias.wrapping_add(reloc.r_offset);
        let kind = match reloc_kind(arch, reloc.r_type) {
            Some(kind) => kind,
            None => {
                warn_unsupported_reloc("ELF", reloc.r_type, at);
                continue;
            }
        };
        let implicit = |m: &mut Machine| -> Result<i64> {
            Ok(packer.unpack(m.mem.read_raw(at, ps)?) as i64)
        };
        match kind {
            RelocKind::None => {}
            RelocKind::Relative => {
                let addend = match reloc.r_addend {
                    Some(a) => a,
                    None => implicit(m)?,
                };
                let value = bias.wrapping_add(addend as u64) & mask;
                m.mem.write_raw(at, &packer.pack(value))?;
            }
            RelocKind::Absolute | RelocKind::Bind => {
                let addend = match (kind, reloc.r_addend) {
                    (RelocKind::Bind, _) => 0,
                    (_, Some(a)) => a,
                    (_, None) => implicit(m)?,
                };
                let symbol = elf
                    .dynsyms
                    .get(reloc.r_sym)
                    .and_then(|s| elf.dynstrtab.get_at(s.st_name))
                    .unwrap_or_default();
                if symbol.is_empty() {
                    m.mem.write_raw(at, &packer.pack(addend as u64 & mask))?;
                    continue;
                }
                imports.push(Import {
                    library: String::new(),
                    symbol: symbol.to_string(),
                    slot: at,
                    addend,
                    bound: None,
                });
            }
        }
    }
    Ok(imports)
}

/// Defined global symbols. The main image also exposes its static symbol
/// table so hooks can name functions in stripped-of-dynamic binaries.
fn exports(elf: &Elf, bias: u64, is_main: bool) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    let tables = [(&elf.dynsyms, &elf.dynstrtab, true), (&elf.syms, &elf.strtab, is_main)];
    for (syms, strtab, wanted) in tables {
        if !wanted {
            continue;
        }
        for sym in syms.iter() {
            if sym.st_shndx == 0 || sym.st_value == 0 {
                continue;
            }
            if !matches!(sym.st_bind(), STB_GLOBAL | STB_WEAK) {
                continue;
            }
            match strtab.get_at(sym.st_name) {
                Some(name) if !name.is_empty() => {
                    out.entry(name.to_string()).or_insert(bias.wrapping_add(sym.st_value));
                }
                _ => {}
            }
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::load;
    use crate::{
        arch::ArchType,
        engine::Machine,
        errors::EmulatorError,
        memory::{Memory, Permission, Placement},
        testing::{images, TinyX86},
    };

    #[test]
    fn test_load_static_exec() {
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X86)));
        let code = [0xb8, 1, 0, 0, 0, 0xcd, 0x80];
        let data = images::elf_exec(ArchType::X86, 0x8048000, &code);
        let loaded = load(&mut m, &data, "/bin/exit", true, 0).unwrap();
        let image = &loaded.image;
        assert_eq!(image.name, "exit");
        assert_eq!(image.entry, 0x8048000 + images::ELF_CODE_OFFSET);
        assert_eq!(image.base, 0x8048000);
        assert_eq!(Memory::read(&m, image.entry, code.len()).unwrap(), code);
        let region = m.mem.region_at(image.entry).unwrap();
        assert_eq!(region.perms, Permission::READ | Permission::EXEC);
        assert_eq!(loaded.phnum, 1);
        assert_eq!(loaded.phdr, 0x8048000 + 0x34);
    }

    #[test]
    fn test_wrong_arch_and_collision() {
        let data = images::elf_exec(ArchType::X8664, 0x400000, &[0x90]);
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X86)));
        assert!(matches!(
            load(&mut m, &data, "/a", true, 0),
            Err(EmulatorError::UnsupportedFormat(_))
        ));

        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X8664)));
        m.mem
            .map(Placement::Fixed(0x400000), 0x1000, Permission::READ, "taken")
            .unwrap();
        assert!(matches!(
            load(&mut m, &data, "/a", true, 0),
            Err(EmulatorError::CollisionError { .. })
        ));
    }

    #[test]
    fn test_truncated_segment_is_malformed() {
        let mut data = images::elf_exec(ArchType::X8664, 0x400000, &[0x90; 16]);
        data.truncate(data.len() - 8);
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X8664)));
        assert!(matches!(
            load(&mut m, &data, "/a", true, 0),
            Err(EmulatorError::MalformedImage(_))
        ));
        assert_eq!(m.mem.regions().count(), 0);
    }

    #[test]
    fn test_segment_past_the_address_space_is_malformed() {
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X8664)));
        let data = images::elf_exec(ArchType::X8664, 0xffff_ffff_ffff_f000, &[0x90]);
        assert!(matches!(
            load(&mut m, &data, "/a", true, 0),
            Err(EmulatorError::MalformedImage(_))
        ));
        let data = images::elf_exec(ArchType::X8664, 0x7fff_ffff_f000, &[0x90; 0x2000]);
        assert!(matches!(
            load(&mut m, &data, "/a", true, 0),
            Err(EmulatorError::MalformedImage(_))
        ));
        assert_eq!(m.mem.regions().count(), 0);
    }

    #[test]
    fn test_relocations_fix_up_slots() {
        let slot = |i: u64| images::ELF_DYN_DATA + i * 8;
        let data = images::elf_dyn64(
            &["libc.so.6"],
            &[("local_fn", images::ELF_DYN_CODE + 0x10)],
            &[
                (slot(0), 8, "", images::ELF_DYN_CODE as i64),
                (slot(1), 1, "", 0x1234),
                (slot(2), 7, "local_fn", 4),
                (slot(3), 1, "local_fn", 4),
                (slot(4), 6, "puts", 0),
                // R_X86_64_IRELATIVE is left alone
                (slot(5), 37, "", 0x40),
            ],
            &[0x90, 0xc3],
        );
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X8664)));
        let loaded = load(&mut m, &data, "/lib/libx.so", false, 0x7000_0000).unwrap();
        let image = &loaded.image;
        let base = image.base;
        assert_eq!(base, 0x7000_0000);
        assert_eq!(image.entry, base + images::ELF_DYN_CODE);
        assert_eq!(image.needed, vec!["libc.so.6"]);
        assert_eq!(m.read_u64(base + slot(0)).unwrap(), base + images::ELF_DYN_CODE);
        assert_eq!(m.read_u64(base + slot(1)).unwrap(), 0x1234);
        assert_eq!(m.read_u64(base + slot(5)).unwrap(), 0);

        let imports: Vec<(&str, u64, i64)> = image
            .imports
            .iter()
            .map(|i| (i.symbol.as_str(), i.slot, i.addend))
            .collect();
        assert_eq!(
            imports,
            vec![
                ("local_fn", base + slot(2), 0),
                ("local_fn", base + slot(3), 4),
                ("puts", base + slot(4), 0),
            ]
        );
        assert!(image.imports.iter().all(|i| i.library.is_empty() && i.bound.is_none()));
        assert_eq!(image.exports.get("local_fn"), Some(&(base + images::ELF_DYN_CODE + 0x10)));
        assert!(!image.exports.contains_key("puts"));
    }
}
