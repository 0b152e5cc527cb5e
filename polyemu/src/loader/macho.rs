//! Thin Mach-O executables. Segments are mapped at their link address and
//! dylib imports are bound like any other import; dyld itself never runs.

use super::{basename, file_slice, goblin_error, ImageFormat, Import, LoadedImage, Segment};
use crate::{
    arch::ArchType,
    engine::Machine,
    errors::{EmulatorError, Result},
    memory::Placement,
    utils::{align, align_up, posix_prot_to_perm},
    PAGE_SIZE,
};
use goblin::mach::{exports::ExportInfo, MachO};
use log::debug;
use std::collections::BTreeMap;

const CPU_TYPE_X86: u32 = 7;
const CPU_ARCH_ABI64: u32 = 0x0100_0000;
const CPU_TYPE_ARM: u32 = 12;

pub fn arch_of(cputype: u32) -> Result<ArchType> {
    match cputype {
        CPU_TYPE_X86 => Ok(ArchType::X86),
        t if t == CPU_TYPE_X86 | CPU_ARCH_ABI64 => Ok(ArchType::X8664),
        t if t == CPU_TYPE_ARM | CPU_ARCH_ABI64 => Ok(ArchType::Arm64),
        other => Err(EmulatorError::UnsupportedFormat(format!(
            "Mach-O cpu type {:#x} is not supported",
            other
        ))),
    }
}

/// C symbols carry a leading underscore in Mach-O.
fn c_name(symbol: &str) -> &str {
    symbol.strip_prefix('_').unwrap_or(symbol)
}

/// Returns the image and whether its entry is a `main` to call (LC_MAIN).
pub fn load(m: &mut Machine, data: &[u8], path: &str) -> Result<(LoadedImage, bool)> {
    let macho = MachO::parse(data, 0).map_err(goblin_error)?;
    let arch = arch_of(macho.header.cputype)?;
    if arch != m.arch.arch {
        return Err(EmulatorError::UnsupportedFormat(format!(
            "{} is a {} image, the cpu is {}",
            path, arch, m.arch.arch
        )));
    }
    let name = basename(path).to_string();

    let mut mapped = vec![];
    for seg in macho.segments.iter() {
        let segname = seg.name().map_err(goblin_error)?;
        if segname == "__PAGEZERO" || seg.vmsize == 0 {
            continue;
        }
        match seg.vmaddr.checked_add(seg.vmsize) {
            Some(end) if end <= m.mem.limit() => mapped.push((seg, segname, end)),
            _ => {
                return Err(EmulatorError::MalformedImage(format!(
                    "segment {} [{:#x}, +{:#x}) lies outside the address space",
                    segname, seg.vmaddr, seg.vmsize
                )))
            }
        }
    }

    let mut segments = vec![];
    let mut text_base = None;
    for (seg, segname, end) in mapped {
        let start = align(seg.vmaddr, PAGE_SIZE);
        let size = align_up(end, PAGE_SIZE) - start;
        let perms = posix_prot_to_perm(seg.initprot as u64);
        m.mem.map(Placement::Fixed(start), size, perms, format!("{}:{}", name, segname))?;
        let bytes = file_slice(data, seg.fileoff, seg.filesize.min(seg.vmsize), segname)?;
        m.mem.write_raw(seg.vmaddr, bytes)?;
        if segname == "__TEXT" {
            text_base = Some(seg.vmaddr);
        }
        segments.push(Segment {
            address: start,
            size,
            perms,
        });
    }
    let base = segments
        .iter()
        .map(|s| s.address)
        .min()
        .ok_or_else(|| EmulatorError::MalformedImage(format!("{} has no segment to map", path)))?;
    let end = segments.iter().map(|s| s.address + s.size).max().unwrap_or(base);

    let imports = macho
        .imports()
        .map_err(goblin_error)?
        .into_iter()
        .map(|i| Import {
            library: i.dylib.to_string(),
            symbol: c_name(i.name).to_string(),
            slot: i.address,
            addend: i.addend,
            bound: None,
        })
        .collect::<Vec<_>>();
    let text_base = text_base.unwrap_or(base);
    let mut exports = BTreeMap::new();
    for export in macho.exports().map_err(goblin_error)? {
        if matches!(export.info, ExportInfo::Reexport { .. }) {
            continue;
        }
        exports.insert(c_name(&export.name).to_string(), text_base + export.offset);
    }
    debug!(
        "{}: {} segments, {} imports, {} exports",
        name,
        segments.len(),
        imports.len(),
        exports.len()
    );
    let image = LoadedImage {
        name,
        path: path.to_string(),
        format: ImageFormat::MachO,
        // goblin already turned the LC_MAIN offset into an address
        entry: macho.entry,
        base,
        size: end - base,
        segments,
        imports,
        exports,
        is_main: true,
        // the first entry names the image itself
        needed: macho.libs.iter().skip(1).map(|l| l.to_string()).collect(),
    };
    Ok((image, !macho.old_style_entry))
}

#[cfg(test)]
mod test {
    use super::{arch_of, c_name, load};
    use crate::{
        arch::ArchType,
        engine::Machine,
        errors::EmulatorError,
        memory::{Memory, Permission},
        testing::{images, TinyX86},
    };

    const LIBSYSTEM: &str = "/usr/lib/libSystem.B.dylib";

    #[test]
    fn test_arch_of() {
        assert_eq!(arch_of(0x0100_0007).unwrap(), ArchType::X8664);
        assert_eq!(arch_of(0x0100_000c).unwrap(), ArchType::Arm64);
        assert!(matches!(arch_of(18), Err(EmulatorError::UnsupportedFormat(_))));
        assert_eq!(c_name("_main"), "main");
        assert_eq!(c_name("start"), "start");
    }

    #[test]
    fn test_truncated_header() {
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X8664)));
        // 64-bit magic followed by nothing useful
        let data = [0xcf, 0xfa, 0xed, 0xfe, 7, 0, 0, 1];
        assert!(load(&mut m, &data, "/bin/a").is_err());
        assert_eq!(m.mem.regions().count(), 0);
    }

    #[test]
    fn test_load_main_entry_with_binds() {
        let text = images::MACHO_TEXT;
        let data = images::macho64(text, &[0x90, 0xc3], &[(LIBSYSTEM, "puts"), (LIBSYSTEM, "exit")], false);
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X8664)));
        let (image, entry_is_main) = load(&mut m, &data, "/bin/hello").unwrap();
        assert!(entry_is_main);
        assert_eq!(image.name, "hello");
        assert_eq!(image.base, text);
        assert_eq!(image.entry, text + images::MACHO_CODE_OFFSET);
        assert_eq!(Memory::read(&m, image.entry, 2).unwrap(), [0x90, 0xc3]);
        assert_eq!(
            m.mem.region_at(image.entry).unwrap().perms,
            Permission::READ | Permission::EXEC
        );
        let data_segment = text + images::MACHO_DATA_OFFSET;
        assert_eq!(
            m.mem.region_at(data_segment).unwrap().perms,
            Permission::READ | Permission::WRITE
        );

        let imports: Vec<(&str, &str, u64)> = image
            .imports
            .iter()
            .map(|i| (i.library.as_str(), i.symbol.as_str(), i.slot))
            .collect();
        assert_eq!(
            imports,
            vec![
                (LIBSYSTEM, "puts", data_segment),
                (LIBSYSTEM, "exit", data_segment + 8)
            ]
        );
        assert_eq!(image.exports.get("main"), Some(&(text + images::MACHO_CODE_OFFSET)));
        assert_eq!(image.needed, vec![LIBSYSTEM]);
    }

    #[test]
    fn test_main_entry_of_a_low_linked_image() {
        // __DATA's file range covers the entry offset here
        let data = images::macho64(0x1000, &[0xc3], &[], false);
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X8664)));
        let (image, entry_is_main) = load(&mut m, &data, "/bin/low").unwrap();
        assert!(entry_is_main);
        assert_eq!(image.entry, 0x1000 + images::MACHO_CODE_OFFSET);
        assert!(image.imports.is_empty());
        assert!(image.needed.is_empty());
    }

    #[test]
    fn test_unixthread_entry() {
        let text = images::MACHO_TEXT;
        let data = images::macho64(text, &[0xc3], &[(LIBSYSTEM, "exit")], true);
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X8664)));
        let (image, entry_is_main) = load(&mut m, &data, "/bin/old").unwrap();
        assert!(!entry_is_main);
        assert_eq!(image.entry, text + images::MACHO_CODE_OFFSET);
        assert_eq!(image.imports.len(), 1);
    }

    #[test]
    fn test_segment_past_the_address_space_is_malformed() {
        let data = images::macho64(0x7fff_ffff_f000, &[0xc3], &[], false);
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X8664)));
        assert!(matches!(
            load(&mut m, &data, "/bin/high"),
            Err(EmulatorError::MalformedImage(_))
        ));
        assert_eq!(m.mem.regions().count(), 0);
    }
}
