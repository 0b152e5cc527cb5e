//! PE32 / PE32+ images.

use super::{basename, file_slice, goblin_error, warn_unsupported_reloc, ImageFormat, Import, LoadedImage, Segment};
use crate::{
    arch::ArchType,
    engine::Machine,
    errors::{EmulatorError, Result},
    memory::{Permission, Placement},
    utils::{align, align_up},
    PAGE_SIZE,
};
use byteorder::{ByteOrder, LittleEndian};
use goblin::pe::PE;
use log::{debug, info};
use std::collections::BTreeMap;

const IMAGE_FILE_MACHINE_I386: u16 = 0x14c;
const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
const IMAGE_REL_BASED_DIR64: u16 = 10;

/// Raw data pointers are rounded down to the minimum file alignment.
const RAW_ALIGNMENT: u64 = 0x200;

pub fn arch_of(machine: u16) -> Result<ArchType> {
    match machine {
        IMAGE_FILE_MACHINE_I386 => Ok(ArchType::X86),
        IMAGE_FILE_MACHINE_AMD64 => Ok(ArchType::X8664),
        other => Err(EmulatorError::UnsupportedFormat(format!(
            "PE machine {:#x} is not supported",
            other
        ))),
    }
}

fn section_perms(characteristics: u32) -> Permission {
    let mut perms = Permission::NONE;
    if characteristics & IMAGE_SCN_MEM_READ != 0 {
        perms |= Permission::READ;
    }
    if characteristics & IMAGE_SCN_MEM_WRITE != 0 {
        perms |= Permission::WRITE;
    }
    if characteristics & IMAGE_SCN_MEM_EXECUTE != 0 {
        perms |= Permission::EXEC;
    }
    perms
}

/// Map a PE image at its preferred base. When that range is taken the image
/// is rebased above `fallback` using its base relocations.
pub fn load(m: &mut Machine, data: &[u8], path: &str, is_main: bool, fallback: u64) -> Result<LoadedImage> {
    let pe = PE::parse(data).map_err(goblin_error)?;
    let arch = arch_of(pe.header.coff_header.machine)?;
    if arch != m.arch.arch {
        return Err(EmulatorError::UnsupportedFormat(format!(
            "{} is a {} image, the cpu is {}",
            path, arch, m.arch.arch
        )));
    }
    let optional = pe
        .header
        .optional_header
        .as_ref()
        .ok_or_else(|| EmulatorError::MalformedImage("missing optional header".into()))?;
    let image_size = align_up(optional.windows_fields.size_of_image as u64, PAGE_SIZE);
    let headers_size = optional.windows_fields.size_of_headers as u64;
    let relocs = optional
        .data_directories
        .get_base_relocation_table()
        .as_ref()
        .map(|d| (d.virtual_address as u64, d.size as u64))
        .filter(|(_, size)| *size > 0);

    let name = basename(path).to_string();
    let preferred = pe.image_base as u64;
    let rw = Permission::READ | Permission::WRITE;
    let base = match m.mem.map(Placement::Fixed(preferred), image_size, rw, name.clone()) {
        Ok(base) => base,
        Err(EmulatorError::CollisionError { .. }) | Err(EmulatorError::OutOfSpace { .. })
            if relocs.is_some() =>
        {
            let base = m.mem.map(Placement::Auto { min: fallback }, image_size, rw, name.clone())?;
            info!("{} rebased from {:#x} to {:#x}", name, preferred, base);
            base
        }
        Err(e) => return Err(e),
    };

    let headers = file_slice(data, 0, headers_size.min(data.len() as u64), "headers")?;
    m.mem.write_raw(base, headers)?;
    for section in &pe.sections {
        let size = match section.virtual_size {
            0 => section.size_of_raw_data,
            vs => vs.min(section.size_of_raw_data),
        } as u64;
        if size == 0 {
            continue;
        }
        let offset = align(section.pointer_to_raw_data as u64, RAW_ALIGNMENT);
        let raw = file_slice(data, offset, size, "section")?;
        if section.virtual_address as u64 + size > image_size {
            return Err(EmulatorError::MalformedImage(format!(
                "section at rva {:#x} lies outside the image",
                section.virtual_address
            )));
        }
        m.mem.write_raw(base + section.virtual_address as u64, raw)?;
    }

    if base != preferred {
        if let Some((rva, size)) = relocs {
            rebase(m, base, rva, size, base.wrapping_sub(preferred))?;
        }
    }

    // headers stay readable, sections get their own protection
    let mut segments = vec![Segment {
        address: base,
        size: align_up(headers_size.max(1), PAGE_SIZE),
        perms: Permission::READ,
    }];
    for section in &pe.sections {
        let vsize = section.virtual_size.max(section.size_of_raw_data) as u64;
        let start = base + align(section.virtual_address as u64, PAGE_SIZE);
        let end = (start + align_up(vsize, PAGE_SIZE)).min(base + image_size);
        if end <= start {
            continue;
        }
        segments.push(Segment {
            address: start,
            size: end - start,
            perms: section_perms(section.characteristics),
        });
    }
    for segment in &segments {
        m.mem.protect(segment.address, segment.size, segment.perms)?;
    }

    let imports = pe
        .imports
        .iter()
        .map(|i| Import {
            library: i.dll.to_string(),
            symbol: i.name.to_string(),
            slot: base + i.offset as u64,
            addend: 0,
            bound: None,
        })
        .collect::<Vec<_>>();
    let mut exports = BTreeMap::new();
    for export in &pe.exports {
        if export.reexport.is_some() {
            continue;
        }
        if let Some(name) = export.name {
            exports.insert(name.to_string(), base + export.rva as u64);
        }
    }
    debug!(
        "{}: {} sections, {} imports, {} exports",
        name,
        pe.sections.len(),
        imports.len(),
        exports.len()
    );
    Ok(LoadedImage {
        name,
        path: path.to_string(),
        format: ImageFormat::Pe,
        entry: match pe.entry {
            0 => 0,
            rva => base + rva as u64,
        },
        base,
        size: image_size,
        segments,
        imports,
        exports,
        is_main,
        needed: pe.libraries.iter().map(|l| l.to_string()).collect(),
    })
}

/// Apply the base relocation blocks at `rva`.
fn rebase(m: &mut Machine, base: u64, rva: u64, size: u64, delta: u64) -> Result<()> {
    let table = m.mem.read_raw(base + rva, size as usize)?;
    let mut cursor = 0usize;
    while cursor + 8 <= table.len() {
        let page = LittleEndian::read_u32(&table[cursor..]) as u64;
        let block = LittleEndian::read_u32(&table[cursor + 4..]) as usize;
        if block < 8 || cursor + block > table.len() {
            return Err(EmulatorError::MalformedImage("bad base relocation block".into()));
        }
        for entry in table[cursor + 8..cursor + block].chunks_exact(2) {
            let entry = LittleEndian::read_u16(entry);
            let at = base + page + (entry & 0xfff) as u64;
            match entry >> 12 {
                IMAGE_REL_BASED_ABSOLUTE => {}
                IMAGE_REL_BASED_HIGHLOW => {
                    let v = LittleEndian::read_u32(&m.mem.read_raw(at, 4)?);
                    m.mem.write_raw(at, &v.wrapping_add(delta as u32).to_le_bytes())?;
                }
                IMAGE_REL_BASED_DIR64 => {
                    let v = LittleEndian::read_u64(&m.mem.read_raw(at, 8)?);
                    m.mem.write_raw(at, &v.wrapping_add(delta).to_le_bytes())?;
                }
                other => warn_unsupported_reloc("PE", other as u32, at),
            }
        }
        cursor += block;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::load;
    use crate::{
        arch::ArchType,
        engine::Machine,
        memory::{Memory, Permission, Placement},
        errors::EmulatorError,
        testing::{images, TinyX86},
    };

    #[test]
    fn test_load_pe32_with_imports() {
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X86)));
        let code = [0x90, 0xc3];
        let data = images::pe32(
            0x400000,
            &code,
            &[("kernel32.dll", &["ExitProcess", "Sleep"]), ("msvcrt.dll", &["puts"])],
        );
        let image = load(&mut m, &data, "C:\\app.exe", true, 0x1000_0000).unwrap();
        assert_eq!(image.name, "app.exe");
        assert_eq!(image.base, 0x400000);
        assert_eq!(image.entry, 0x400000 + images::PE_TEXT_RVA);
        assert_eq!(Memory::read(&m, image.entry, 2).unwrap(), code);
        assert_eq!(
            m.mem.region_at(image.entry).unwrap().perms,
            Permission::READ | Permission::EXEC
        );
        let symbols: Vec<(&str, &str)> = image
            .imports
            .iter()
            .map(|i| (i.library.as_str(), i.symbol.as_str()))
            .collect();
        assert_eq!(
            symbols,
            vec![
                ("kernel32.dll", "ExitProcess"),
                ("kernel32.dll", "Sleep"),
                ("msvcrt.dll", "puts")
            ]
        );
        // IAT slots are distinct and live inside the image
        assert!(image.imports.iter().all(|i| image.contains(i.slot)));
        assert_ne!(image.imports[0].slot, image.imports[1].slot);
        assert_eq!(image.needed, vec!["kernel32.dll", "msvcrt.dll"]);
    }

    #[test]
    fn test_collision_without_relocations() {
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X86)));
        m.mem
            .map(Placement::Fixed(0x400000), 0x1000, Permission::READ, "taken")
            .unwrap();
        let data = images::pe32(0x400000, &[0xc3], &[]);
        assert!(matches!(
            load(&mut m, &data, "a.exe", true, 0x1000_0000),
            Err(EmulatorError::CollisionError { .. })
        ));
    }

    #[test]
    fn test_rebase_applies_base_relocations() {
        let mut code = vec![];
        code.extend_from_slice(&0x0040_1008u32.to_le_bytes());
        code.extend_from_slice(&0x0040_2000u32.to_le_bytes());
        code.extend_from_slice(&[0x90, 0xc3]);
        let data = images::pe32_with_relocs(0x400000, &code, &[("kernel32.dll", &["ExitProcess"])], &[0, 4]);

        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X86)));
        let image = load(&mut m, &data, "app.exe", true, 0x1000_0000).unwrap();
        let text = image.base + images::PE_TEXT_RVA;
        assert_eq!(image.base, 0x400000);
        assert_eq!(m.read_u32(text).unwrap(), 0x0040_1008);

        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X86)));
        m.mem
            .map(Placement::Fixed(0x400000), 0x1000, Permission::READ, "taken")
            .unwrap();
        let image = load(&mut m, &data, "app.exe", true, 0x1000_0000).unwrap();
        let text = image.base + images::PE_TEXT_RVA;
        assert_eq!(image.base, 0x1000_0000);
        assert_eq!(image.entry, text);
        assert_eq!(m.read_u32(text).unwrap(), 0x1000_1008);
        assert_eq!(m.read_u32(text + 4).unwrap(), 0x1000_2000);
        assert_eq!(Memory::read(&m, text + 8, 2).unwrap(), [0x90, 0xc3]);
        assert!(image.imports.iter().all(|i| image.contains(i.slot)));
    }
}
