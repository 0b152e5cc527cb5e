//! Executable loading and linking: maps images into the address space, binds
//! imports against loaded libraries or emulated stubs, and prepares the
//! initial process state.

pub mod elf;
pub mod macho;
pub mod pe;
pub mod process;
pub mod raw;

use crate::{
    arch::{ArchInfo, ArchType},
    config::EmuConfig,
    engine::Machine,
    errors::{EmulatorError, Result},
    memory::{Permission, PointerSizeT},
    os::{fs::FileSystem, windows, Kernel, OsType},
};
use goblin::{container::Endian, mach::Mach, Object};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    ops::Range,
};
use strum::Display;

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ImageFormat {
    Elf,
    Pe,
    MachO,
    Raw,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    pub address: u64,
    pub size: u64,
    pub perms: Permission,
}

/// A pointer slot the linker fills with the address of `symbol`.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct Import {
    /// empty for flat namespaces (ELF)
    pub library: String,
    pub symbol: String,
    pub slot: u64,
    pub addend: i64,
    /// address the slot was bound to
    pub bound: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct LoadedImage {
    /// file name, used for library lookups
    pub name: String,
    /// guest path
    pub path: String,
    pub format: ImageFormat,
    pub entry: u64,
    pub base: u64,
    pub size: u64,
    pub segments: Vec<Segment>,
    pub imports: Vec<Import>,
    pub exports: BTreeMap<String, u64>,
    pub is_main: bool,
    /// libraries this image depends on, in declaration order
    pub needed: Vec<String>,
}

impl LoadedImage {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    /// Highest mapped address, the program break starts past it.
    pub fn end(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.address + s.size)
            .max()
            .unwrap_or(self.base + self.size)
    }
}

/// Images of a process in load order: the main binary first, then its
/// dependencies breadth first.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageSet {
    images: Vec<LoadedImage>,
}

impl ImageSet {
    pub fn push(&mut self, image: LoadedImage) {
        self.images.push(image);
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoadedImage> {
        self.images.iter()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn main(&self) -> Option<&LoadedImage> {
        self.images.iter().find(|i| i.is_main)
    }

    /// Case-insensitive match on the file name.
    pub fn by_name(&self, name: &str) -> Option<&LoadedImage> {
        let name = basename(name);
        self.images
            .iter()
            .find(|i| i.name.eq_ignore_ascii_case(name))
    }

    pub fn by_base(&self, base: u64) -> Option<&LoadedImage> {
        self.images.iter().find(|i| i.base == base)
    }

    pub fn containing(&self, addr: u64) -> Option<&LoadedImage> {
        self.images.iter().find(|i| i.contains(addr))
    }

    /// First image in load order exporting `symbol`.
    pub fn resolve_export(&self, symbol: &str) -> Option<u64> {
        self.images
            .iter()
            .find_map(|i| i.exports.get(symbol).copied())
    }
}

pub(crate) fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

const STUB_SLOT: u64 = 0x10;
/// stubs per table
const STUB_CAPACITY: u64 = 0x1000;

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
struct StubEntry {
    library: String,
    symbol: String,
}

/// Addresses standing in for emulated library functions. Reaching one of them
/// hands control to the OS layer instead of executing guest code.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct StubTable {
    base: u64,
    pointer_size: PointerSizeT,
    entries: Vec<StubEntry>,
    /// libraries handed out by `LoadLibrary` without a loaded image
    handles: Vec<String>,
}

impl StubTable {
    /// Library name of stubs the emulator itself returns through.
    pub const INTERNAL: &'static str = "polyemu";
    pub const PROCESS_EXIT: &'static str = "process_exit";
    pub const THREAD_EXIT: &'static str = "thread_exit";

    pub fn new(stub_address: u64, pointer_size: PointerSizeT) -> Self {
        Self {
            base: stub_address,
            pointer_size,
            entries: vec![],
            handles: vec![],
        }
    }

    pub fn range(&self) -> Range<u64> {
        self.base..self.base + Self::region_size()
    }

    pub fn region_size() -> u64 {
        STUB_SLOT * STUB_CAPACITY
    }

    pub fn find(&self, library: &str, symbol: &str) -> Option<u64> {
        self.entries
            .iter()
            .position(|e| e.library == library && e.symbol == symbol)
            .map(|i| self.base + i as u64 * STUB_SLOT)
    }

    /// Any stub for `symbol`, whatever library it was imported from.
    pub fn find_symbol(&self, symbol: &str) -> Option<u64> {
        self.entries
            .iter()
            .position(|e| e.symbol == symbol)
            .map(|i| self.base + i as u64 * STUB_SLOT)
    }

    /// Address of the stub for `library!symbol`, allocated on first use.
    pub fn stub_for(&mut self, library: &str, symbol: &str) -> Result<u64> {
        if let Some(addr) = self.find(library, symbol) {
            return Ok(addr);
        }
        if self.entries.len() as u64 >= STUB_CAPACITY {
            return Err(EmulatorError::OutOfSpace { size: STUB_SLOT });
        }
        self.entries.push(StubEntry {
            library: library.to_string(),
            symbol: symbol.to_string(),
        });
        let addr = self.base + (self.entries.len() as u64 - 1) * STUB_SLOT;
        debug!("stub {}!{} at {:#x}", library, symbol, addr);
        Ok(addr)
    }

    pub fn lookup(&self, addr: u64) -> Option<(&str, &str)> {
        if !self.range().contains(&addr) || (addr - self.base) % STUB_SLOT != 0 {
            return None;
        }
        self.entries
            .get(((addr - self.base) / STUB_SLOT) as usize)
            .map(|e| (e.library.as_str(), e.symbol.as_str()))
    }

    /// Module handle for an emulated library; handles live past the stub
    /// region so they never alias a stub or an image.
    pub fn library_handle(&mut self, library: &str) -> u64 {
        let index = match self.handles.iter().position(|l| l == library) {
            Some(i) => i,
            None => {
                self.handles.push(library.to_string());
                self.handles.len() - 1
            }
        };
        self.range().end + index as u64 * crate::PAGE_SIZE
    }

    pub fn library_for_handle(&self, handle: u64) -> Option<&str> {
        let end = self.range().end;
        if handle < end || (handle - end) % crate::PAGE_SIZE != 0 {
            return None;
        }
        self.handles
            .get(((handle - end) / crate::PAGE_SIZE) as usize)
            .map(String::as_str)
    }

    pub fn pointer_size(&self) -> PointerSizeT {
        self.pointer_size
    }
}

/// What a binary is and where it runs, decided before the cpu exists.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Probe {
    pub format: ImageFormat,
    pub arch: ArchInfo,
    pub os: OsType,
}

pub(crate) fn goblin_error(e: goblin::error::Error) -> EmulatorError {
    match e {
        goblin::error::Error::BadMagic(magic) => {
            EmulatorError::UnsupportedFormat(format!("unknown magic {:#x}", magic))
        }
        other => EmulatorError::MalformedImage(other.to_string()),
    }
}

/// Identify format, cpu and OS of `data`. A configured arch/os wins over what
/// the image says.
pub fn probe(data: &[u8], config: &EmuConfig) -> Result<Probe> {
    let (format, arch, os) = match config.format {
        Some(ImageFormat::Raw) => {
            let arch = config.arch.ok_or_else(|| {
                EmulatorError::UnsupportedFormat("raw images need an explicit arch".into())
            })?;
            (ImageFormat::Raw, ArchInfo::default_for(arch), OsType::Linux)
        }
        _ => {
            if data.len() < 16 {
                return Err(EmulatorError::UnsupportedFormat(format!(
                    "{} bytes is too short for any image",
                    data.len()
                )));
            }
            match Object::parse(data).map_err(goblin_error)? {
                Object::Elf(elf) => {
                    let arch = elf::arch_of(elf.header.e_machine)?;
                    let endian = if elf.little_endian {
                        Endian::Little
                    } else {
                        Endian::Big
                    };
                    (ImageFormat::Elf, ArchInfo::new(arch, endian), elf::os_of(&elf))
                }
                Object::PE(pe) => {
                    let arch = pe::arch_of(pe.header.coff_header.machine)?;
                    (ImageFormat::Pe, ArchInfo::default_for(arch), OsType::Windows)
                }
                Object::Mach(Mach::Binary(macho)) => {
                    let arch = macho::arch_of(macho.header.cputype)?;
                    (ImageFormat::MachO, ArchInfo::default_for(arch), OsType::MacOS)
                }
                Object::Mach(Mach::Fat(_)) => {
                    return Err(EmulatorError::UnsupportedFormat(
                        "universal binaries are not supported, extract one slice".into(),
                    ))
                }
                Object::Archive(_) => {
                    return Err(EmulatorError::UnsupportedFormat("static archive".into()))
                }
                Object::Unknown(magic) => {
                    return Err(EmulatorError::UnsupportedFormat(format!(
                        "unknown magic {:#x}",
                        magic
                    )))
                }
            }
        }
    };
    let arch = match (config.arch, config.big_endian) {
        (Some(a), Some(be)) => ArchInfo {
            arch: a,
            big_endian: be,
        },
        (Some(a), None) if a != arch.arch => ArchInfo::default_for(a),
        (None, Some(be)) => ArchInfo {
            arch: arch.arch,
            big_endian: be,
        },
        _ => arch,
    };
    Ok(Probe {
        format,
        arch,
        os: config.os.unwrap_or(os),
    })
}

/// Where the process starts after loading.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LoadInfo {
    pub entry: u64,
    pub stack_pointer: u64,
    pub brk: u64,
    /// program headers of the main ELF image, for the aux vector
    pub phdr: u64,
    pub phent: u64,
    pub phnum: u64,
    /// the entry is a C `main` to be called rather than jumped to
    pub entry_is_main: bool,
}

/// Loads the main image and its dependencies into one address space.
pub struct Loader<'a> {
    pub m: &'a mut Machine,
    pub k: &'a mut Kernel,
}

impl Loader<'_> {
    /// Map the main binary, its libraries and bind every import. Nothing is
    /// runnable if this fails.
    pub fn load_program(&mut self, probe: &Probe, path: &str, data: &[u8]) -> Result<(ImageSet, LoadInfo)> {
        let mut images = ImageSet::default();
        let mut info = LoadInfo::default();
        process::map_stub_region(self.m, self.k)?;
        let main = match probe.format {
            ImageFormat::Elf => {
                let loaded = elf::load(self.m, data, path, true, self.k.layout.load_address)?;
                info.phdr = loaded.phdr;
                info.phent = loaded.phent;
                info.phnum = loaded.phnum;
                loaded.image
            }
            ImageFormat::Pe => pe::load(self.m, data, path, true, self.k.layout.load_address)?,
            ImageFormat::MachO => {
                let (image, entry_is_main) = macho::load(self.m, data, path)?;
                info.entry_is_main = entry_is_main;
                image
            }
            ImageFormat::Raw => raw::load(self.m, data, path, self.k.layout.load_address)?,
        };
        info!(
            "loaded {} ({}) at {:#x}, entry {:#x}",
            main.path, main.format, main.base, main.entry
        );
        info.entry = main.entry;
        info.brk = main.end();
        images.push(main);
        self.load_dependencies(probe, &mut images)?;
        self.bind_imports(&mut images)?;
        Ok((images, info))
    }

    /// Breadth-first over `needed` lists; a library is loaded once even when
    /// dependencies are circular. Missing libraries are left to the stubs.
    fn load_dependencies(&mut self, probe: &Probe, images: &mut ImageSet) -> Result<()> {
        let mut queue: VecDeque<String> = images
            .iter()
            .flat_map(|i| i.needed.iter().cloned())
            .collect();
        let mut seen: BTreeSet<String> = images.iter().map(|i| i.name.to_ascii_lowercase()).collect();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.to_ascii_lowercase()) {
                continue;
            }
            if probe.format == ImageFormat::Pe
                && windows::EMULATED_LIBRARIES.contains(&windows::normalize_library(&name).as_str())
            {
                continue;
            }
            let (guest, data) = match self.find_library(probe, &name) {
                Some(found) => found,
                None => {
                    debug!("library {} not found, its imports go to stubs", name);
                    continue;
                }
            };
            let mmap_base = self.k.state.mmap_next;
            let image = match probe.format {
                ImageFormat::Elf => elf::load(self.m, &data, &guest, false, mmap_base)?.image,
                ImageFormat::Pe => pe::load(self.m, &data, &guest, false, mmap_base)?,
                _ => continue,
            };
            info!("loaded library {} at {:#x}", image.path, image.base);
            self.k.state.mmap_next = self.k.state.mmap_next.max(image.end());
            queue.extend(image.needed.iter().cloned());
            images.push(image);
        }
        Ok(())
    }

    fn library_dirs(probe: &Probe) -> Vec<String> {
        match probe.format {
            ImageFormat::Pe => vec!["/".into(), "/Windows/System32".into(), "/Windows".into()],
            _ => {
                let triplet = match probe.arch.arch {
                    ArchType::X86 => "i386-linux-gnu",
                    ArchType::X8664 => "x86_64-linux-gnu",
                    ArchType::Arm => "arm-linux-gnueabihf",
                    ArchType::Arm64 => "aarch64-linux-gnu",
                    ArchType::Mips => "mips-linux-gnu",
                    ArchType::Riscv64 => "riscv64-linux-gnu",
                };
                vec![
                    "/lib".into(),
                    "/usr/lib".into(),
                    "/lib64".into(),
                    "/usr/lib64".into(),
                    format!("/lib/{}", triplet),
                    format!("/usr/lib/{}", triplet),
                ]
            }
        }
    }

    fn find_library(&self, probe: &Probe, name: &str) -> Option<(String, Vec<u8>)> {
        for dir in Self::library_dirs(probe) {
            let guest = format!("{}/{}", dir.trim_end_matches('/'), name);
            let host = match self.k.fs.resolve_guest_path("/", &guest) {
                Ok(h) => h,
                Err(_) => continue,
            };
            if let Ok(data) = std::fs::read(&host) {
                return Some((guest, data));
            }
        }
        None
    }

    /// Fill every import slot. A named library is searched first, then every
    /// image in load order, then an emulated stub is bound.
    fn bind_imports(&mut self, images: &mut ImageSet) -> Result<()> {
        let packer = self.m.packer();
        let mut bound = vec![];
        for (index, image) in images.iter().enumerate() {
            for (slot_index, import) in image.imports.iter().enumerate() {
                let named = match import.library.as_str() {
                    "" => None,
                    lib => images.by_name(lib).and_then(|i| i.exports.get(&import.symbol).copied()),
                };
                let target = match named.or_else(|| images.resolve_export(&import.symbol)) {
                    Some(addr) => addr,
                    None => self.k.state.stubs.stub_for(&import.library, &import.symbol)?,
                };
                let value = target.wrapping_add(import.addend as u64) & self.m.arch.word_mask();
                self.m.mem.write_raw(import.slot, &packer.pack(value))?;
                bound.push((index, slot_index, target));
            }
        }
        let unresolved = bound
            .iter()
            .filter(|(_, _, t)| self.k.state.stubs.range().contains(t))
            .count();
        if unresolved > 0 {
            debug!("{} imports bound to stubs", unresolved);
        }
        for (index, slot_index, target) in bound {
            if let Some(import) = images
                .images
                .get_mut(index)
                .and_then(|i| i.imports.get_mut(slot_index))
            {
                import.bound = Some(target);
            }
        }
        Ok(())
    }
}

/// Check a file range against the image size.
pub(crate) fn file_slice<'d>(data: &'d [u8], offset: u64, size: u64, what: &str) -> Result<&'d [u8]> {
    let end = offset
        .checked_add(size)
        .filter(|end| *end <= data.len() as u64)
        .ok_or_else(|| {
            EmulatorError::MalformedImage(format!(
                "{} [{:#x}, +{:#x}) lies outside the {:#x} byte file",
                what,
                offset,
                size,
                data.len()
            ))
        })?;
    Ok(&data[offset as usize..end as usize])
}

pub(crate) fn warn_unsupported_reloc(kind: &str, r_type: u32, at: u64) {
    warn!("skipping unsupported {} relocation {} at {:#x}", kind, r_type, at);
}
