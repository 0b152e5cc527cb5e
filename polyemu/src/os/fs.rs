use crate::{
    arch::ArchType,
    os::{Errno, OsType},
    utils::Packer,
};
use goblin::container::Endian;
use std::{
    fs::Metadata,
    os::unix::fs::MetadataExt,
    path::{Component, Path, PathBuf},
};

/// Maps guest paths onto the host.
pub trait FileSystem {
    /// `path` is absolute or relative to the guest `cwd`.
    fn resolve_guest_path(&self, cwd: &str, path: &str) -> std::result::Result<PathBuf, Errno>;
}

/// Guest `/` is a host directory; paths never escape it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RootFs {
    root: PathBuf,
}

impl RootFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalize to an absolute guest path without `.`/`..`.
    pub fn guest_absolute(cwd: &str, path: &str) -> String {
        let joined = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", cwd.trim_end_matches('/'), path)
        };
        let mut parts: Vec<&str> = vec![];
        for c in Path::new(&joined).components() {
            match c {
                Component::Normal(p) => parts.push(p.to_str().unwrap_or_default()),
                Component::ParentDir => {
                    parts.pop();
                }
                _ => {}
            }
        }
        format!("/{}", parts.join("/"))
    }
}

impl FileSystem for RootFs {
    fn resolve_guest_path(&self, cwd: &str, path: &str) -> std::result::Result<PathBuf, Errno> {
        if path.is_empty() {
            return Err(Errno::ENOENT);
        }
        let abs = Self::guest_absolute(cwd, path);
        Ok(self.root.join(abs.trim_start_matches('/')))
    }
}

/// `open` flags decoded from the target's numbering.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
    pub directory: bool,
}

impl OpenFlags {
    pub fn decode(os: OsType, arch: ArchType, raw: u64) -> Self {
        // (append, create, truncate, exclusive, directory)
        let bits: (u64, u64, u64, u64, u64) = match (os, arch) {
            (OsType::Linux, ArchType::Mips) => (0x8, 0x100, 0x200, 0x400, 0x10000),
            (OsType::Linux, ArchType::Arm | ArchType::Arm64) => {
                (0o2000, 0o100, 0o1000, 0o200, 0o40000)
            }
            (OsType::Linux, _) => (0o2000, 0o100, 0o1000, 0o200, 0o200000),
            (OsType::FreeBSD, _) => (0x8, 0x200, 0x400, 0x800, 0x20000),
            (_, _) => (0x8, 0x200, 0x400, 0x800, 0x100000),
        };
        let acc = raw & 3;
        Self {
            read: acc == 0 || acc == 2,
            write: acc == 1 || acc == 2,
            append: raw & bits.0 != 0,
            create: raw & bits.1 != 0,
            truncate: raw & bits.2 != 0,
            exclusive: raw & bits.3 != 0,
            directory: raw & bits.4 != 0,
        }
    }
}

/// Target-neutral view of `struct stat`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct GuestStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u64,
    pub nlink: u64,
    pub uid: u64,
    pub gid: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: u64,
    pub atime_ns: u64,
    pub mtime: u64,
    pub mtime_ns: u64,
    pub ctime: u64,
    pub ctime_ns: u64,
}

pub const S_IFCHR: u64 = 0o020000;

impl GuestStat {
    pub fn from_metadata(md: &Metadata) -> Self {
        Self {
            dev: md.dev(),
            ino: md.ino(),
            mode: md.mode() as u64,
            nlink: md.nlink(),
            uid: md.uid() as u64,
            gid: md.gid() as u64,
            rdev: md.rdev(),
            size: md.size(),
            blksize: md.blksize(),
            blocks: md.blocks(),
            atime: md.atime() as u64,
            atime_ns: md.atime_nsec() as u64,
            mtime: md.mtime() as u64,
            mtime_ns: md.mtime_nsec() as u64,
            ctime: md.ctime() as u64,
            ctime_ns: md.ctime_nsec() as u64,
        }
    }

    /// A terminal-like character device.
    pub fn character_device() -> Self {
        Self {
            dev: 0x16,
            ino: 3,
            mode: S_IFCHR | 0o620,
            nlink: 1,
            rdev: 0x8800,
            blksize: 1024,
            ..Default::default()
        }
    }
}

#[derive(Copy, Clone, Debug)]
enum Field {
    Dev,
    Ino,
    Mode,
    Nlink,
    Uid,
    Gid,
    Rdev,
    Size,
    Blksize,
    Blocks,
    Atime,
    AtimeNs,
    Mtime,
    MtimeNs,
    Ctime,
    CtimeNs,
}

/// Binary layout of a `stat` structure: total size and (field, offset, width).
pub struct StatLayout {
    size: usize,
    fields: &'static [(Field, usize, u8)],
}

use Field::*;

const LINUX_X8664: StatLayout = StatLayout {
    size: 144,
    fields: &[
        (Dev, 0, 8),
        (Ino, 8, 8),
        (Nlink, 16, 8),
        (Mode, 24, 4),
        (Uid, 28, 4),
        (Gid, 32, 4),
        (Rdev, 40, 8),
        (Size, 48, 8),
        (Blksize, 56, 8),
        (Blocks, 64, 8),
        (Atime, 72, 8),
        (AtimeNs, 80, 8),
        (Mtime, 88, 8),
        (MtimeNs, 96, 8),
        (Ctime, 104, 8),
        (CtimeNs, 112, 8),
    ],
};

/// asm-generic, used by arm64 and riscv64.
const LINUX_GENERIC64: StatLayout = StatLayout {
    size: 128,
    fields: &[
        (Dev, 0, 8),
        (Ino, 8, 8),
        (Mode, 16, 4),
        (Nlink, 20, 4),
        (Uid, 24, 4),
        (Gid, 28, 4),
        (Rdev, 32, 8),
        (Size, 48, 8),
        (Blksize, 56, 4),
        (Blocks, 64, 8),
        (Atime, 72, 8),
        (AtimeNs, 80, 8),
        (Mtime, 88, 8),
        (MtimeNs, 96, 8),
        (Ctime, 104, 8),
        (CtimeNs, 112, 8),
    ],
};

/// Old 32-bit `struct stat` of i386 and arm.
const LINUX_OLD32: StatLayout = StatLayout {
    size: 64,
    fields: &[
        (Dev, 0, 4),
        (Ino, 4, 4),
        (Mode, 8, 2),
        (Nlink, 10, 2),
        (Uid, 12, 2),
        (Gid, 14, 2),
        (Rdev, 16, 4),
        (Size, 20, 4),
        (Blksize, 24, 4),
        (Blocks, 28, 4),
        (Atime, 32, 4),
        (AtimeNs, 36, 4),
        (Mtime, 40, 4),
        (MtimeNs, 44, 4),
        (Ctime, 48, 4),
        (CtimeNs, 52, 4),
    ],
};

/// i386 `stat64` is packed.
const LINUX_X86_STAT64: StatLayout = StatLayout {
    size: 96,
    fields: &[
        (Dev, 0, 8),
        (Ino, 12, 4),
        (Mode, 16, 4),
        (Nlink, 20, 4),
        (Uid, 24, 4),
        (Gid, 28, 4),
        (Rdev, 32, 8),
        (Size, 44, 8),
        (Blksize, 52, 4),
        (Blocks, 56, 8),
        (Atime, 64, 4),
        (AtimeNs, 68, 4),
        (Mtime, 72, 4),
        (MtimeNs, 76, 4),
        (Ctime, 80, 4),
        (CtimeNs, 84, 4),
        (Ino, 88, 8),
    ],
};

const LINUX_ARM_STAT64: StatLayout = StatLayout {
    size: 104,
    fields: &[
        (Dev, 0, 8),
        (Ino, 12, 4),
        (Mode, 16, 4),
        (Nlink, 20, 4),
        (Uid, 24, 4),
        (Gid, 28, 4),
        (Rdev, 32, 8),
        (Size, 48, 8),
        (Blksize, 56, 4),
        (Blocks, 64, 8),
        (Atime, 72, 4),
        (AtimeNs, 76, 4),
        (Mtime, 80, 4),
        (MtimeNs, 84, 4),
        (Ctime, 88, 4),
        (CtimeNs, 92, 4),
        (Ino, 96, 8),
    ],
};

const LINUX_MIPS_STAT: StatLayout = StatLayout {
    size: 144,
    fields: &[
        (Dev, 0, 4),
        (Ino, 16, 4),
        (Mode, 20, 4),
        (Nlink, 24, 4),
        (Uid, 28, 4),
        (Gid, 32, 4),
        (Rdev, 36, 4),
        (Size, 48, 4),
        (Atime, 56, 4),
        (AtimeNs, 60, 4),
        (Mtime, 64, 4),
        (MtimeNs, 68, 4),
        (Ctime, 72, 4),
        (CtimeNs, 76, 4),
        (Blksize, 80, 4),
        (Blocks, 84, 4),
    ],
};

const LINUX_MIPS_STAT64: StatLayout = StatLayout {
    size: 104,
    fields: &[
        (Dev, 0, 4),
        (Ino, 16, 8),
        (Mode, 24, 4),
        (Nlink, 28, 4),
        (Uid, 32, 4),
        (Gid, 36, 4),
        (Rdev, 40, 4),
        (Size, 56, 8),
        (Atime, 64, 4),
        (AtimeNs, 68, 4),
        (Mtime, 72, 4),
        (MtimeNs, 76, 4),
        (Ctime, 80, 4),
        (CtimeNs, 84, 4),
        (Blksize, 88, 4),
        (Blocks, 96, 8),
    ],
};

const FREEBSD_X8664: StatLayout = StatLayout {
    size: 224,
    fields: &[
        (Dev, 0, 8),
        (Ino, 8, 8),
        (Nlink, 16, 8),
        (Mode, 24, 2),
        (Uid, 28, 4),
        (Gid, 32, 4),
        (Rdev, 40, 8),
        (Atime, 48, 8),
        (AtimeNs, 56, 8),
        (Mtime, 64, 8),
        (MtimeNs, 72, 8),
        (Ctime, 80, 8),
        (CtimeNs, 88, 8),
        (Size, 112, 8),
        (Blocks, 120, 8),
        (Blksize, 128, 4),
    ],
};

const MACOS_X8664: StatLayout = StatLayout {
    size: 144,
    fields: &[
        (Dev, 0, 4),
        (Mode, 4, 2),
        (Nlink, 6, 2),
        (Ino, 8, 8),
        (Uid, 16, 4),
        (Gid, 20, 4),
        (Rdev, 24, 4),
        (Atime, 32, 8),
        (AtimeNs, 40, 8),
        (Mtime, 48, 8),
        (MtimeNs, 56, 8),
        (Ctime, 64, 8),
        (CtimeNs, 72, 8),
        (Size, 96, 8),
        (Blocks, 104, 8),
        (Blksize, 112, 4),
    ],
};

impl StatLayout {
    /// Layout for `stat`/`fstat`/`lstat`/`newfstatat` (`wide` for the `*64` variants).
    pub fn for_target(os: OsType, arch: ArchType, wide: bool) -> &'static StatLayout {
        match (os, arch, wide) {
            (OsType::FreeBSD, _, _) => &FREEBSD_X8664,
            (OsType::MacOS, _, _) => &MACOS_X8664,
            (_, ArchType::X8664, _) => &LINUX_X8664,
            (_, ArchType::Arm64 | ArchType::Riscv64, _) => &LINUX_GENERIC64,
            (_, ArchType::Mips, false) => &LINUX_MIPS_STAT,
            (_, ArchType::Mips, true) => &LINUX_MIPS_STAT64,
            (_, ArchType::X86, true) => &LINUX_X86_STAT64,
            (_, ArchType::Arm, true) => &LINUX_ARM_STAT64,
            (_, ArchType::X86 | ArchType::Arm, false) => &LINUX_OLD32,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn encode(&self, st: &GuestStat, endian: Endian) -> Vec<u8> {
        let mut out = vec![0u8; self.size];
        for (field, offset, width) in self.fields {
            let v = match field {
                Dev => st.dev,
                Ino => st.ino,
                Mode => st.mode,
                Nlink => st.nlink,
                Uid => st.uid,
                Gid => st.gid,
                Rdev => st.rdev,
                Size => st.size,
                Blksize => st.blksize,
                Blocks => st.blocks,
                Atime => st.atime,
                AtimeNs => st.atime_ns,
                Mtime => st.mtime,
                MtimeNs => st.mtime_ns,
                Ctime => st.ctime,
                CtimeNs => st.ctime_ns,
            };
            let bytes = Packer::new(endian, *width).pack(v);
            out[*offset..*offset + *width as usize].copy_from_slice(&bytes);
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::{FileSystem, GuestStat, OpenFlags, RootFs, StatLayout};
    use crate::{
        arch::ArchType,
        os::{Errno, OsType},
    };
    use goblin::container::Endian;
    use std::path::PathBuf;

    #[test]
    fn test_paths_stay_inside_rootfs() {
        let fs = RootFs::new("/srv/root");
        assert_eq!(
            fs.resolve_guest_path("/", "/etc/passwd").unwrap(),
            PathBuf::from("/srv/root/etc/passwd")
        );
        assert_eq!(
            fs.resolve_guest_path("/home/u", "../../../../etc/hosts").unwrap(),
            PathBuf::from("/srv/root/etc/hosts")
        );
        assert_eq!(
            fs.resolve_guest_path("/tmp", "./a/./b").unwrap(),
            PathBuf::from("/srv/root/tmp/a/b")
        );
        assert_eq!(fs.resolve_guest_path("/", ""), Err(Errno::ENOENT));
    }

    #[test]
    fn test_open_flags_per_target() {
        let linux = OpenFlags::decode(OsType::Linux, ArchType::X8664, 0o1101);
        assert!(linux.write && linux.create && linux.truncate && !linux.read);
        let mips = OpenFlags::decode(OsType::Linux, ArchType::Mips, 0x102);
        assert!(mips.read && mips.write && mips.create && !mips.truncate);
        let mac = OpenFlags::decode(OsType::MacOS, ArchType::X8664, 0x209);
        assert!(mac.append && mac.create && mac.write);
    }

    #[test]
    fn test_stat_encoding() {
        let st = GuestStat {
            size: 0x1234,
            mode: 0o100644,
            ..Default::default()
        };
        let layout = StatLayout::for_target(OsType::Linux, ArchType::X8664, false);
        let b = layout.encode(&st, Endian::Little);
        assert_eq!(b.len(), 144);
        assert_eq!(&b[48..50], &[0x34, 0x12]);
        assert_eq!(&b[24..28], &0o100644u32.to_le_bytes());

        let layout = StatLayout::for_target(OsType::Linux, ArchType::Mips, true);
        let b = layout.encode(&st, Endian::Big);
        assert_eq!(&b[56..64], &0x1234u64.to_be_bytes());
    }
}
