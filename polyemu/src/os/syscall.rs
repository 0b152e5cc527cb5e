use crate::{arch::ArchType, os::OsType};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use strum::{EnumString, EnumVariantNames, IntoStaticStr};

const SYSCALL_TABLE: &str = include_str!("syscall_table.json");

/// macOS BSD syscalls carry this class in the number register.
pub const MACOS_UNIX_CLASS: u64 = 0x2000000;

fn parse_syscall_table(data: &str) -> HashMap<String, BTreeMap<u64, String>> {
    // the table is compiled in, a parse failure is a build defect
    serde_json::from_str(data).unwrap_or_else(|e| panic!("bad syscall table: {}", e))
}

lazy_static! {
    pub static ref SYSCALL: HashMap<String, BTreeMap<u64, String>> =
        parse_syscall_table(SYSCALL_TABLE);
}

fn table_key(os: OsType, arch: ArchType) -> String {
    let arch = match arch {
        ArchType::X86 => "x86",
        ArchType::X8664 => "x8664",
        ArchType::Arm => "arm",
        ArchType::Arm64 => "arm64",
        ArchType::Mips => "mips",
        ArchType::Riscv64 => "riscv64",
    };
    format!("{}-{}", os, arch)
}

/// Strip OS-specific class bits from a raw syscall number.
pub fn normalize_number(os: OsType, number: u64) -> u64 {
    match os {
        OsType::MacOS if number & 0xff000000 == MACOS_UNIX_CLASS => number & 0xffffff,
        _ => number,
    }
}

/// Name of syscall `number` on the target, if the table knows it.
pub fn syscall_name(os: OsType, arch: ArchType, number: u64) -> Option<&'static str> {
    SYSCALL
        .get(&table_key(os, arch))
        .and_then(|t| t.get(&normalize_number(os, number)))
        .map(|s| s.as_str())
}

/// Number of syscall `name` on the target.
pub fn syscall_number(os: OsType, arch: ArchType, name: &str) -> Option<u64> {
    let number = SYSCALL
        .get(&table_key(os, arch))?
        .iter()
        .find(|(_, v)| v.as_str() == name)
        .map(|(k, _)| *k)?;
    Some(match os {
        OsType::MacOS => number | MACOS_UNIX_CLASS,
        _ => number,
    })
}

#[allow(non_camel_case_types)]
#[derive(
    Debug,
    Clone,
    Copy,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    EnumVariantNames,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SysCalls {
    READ,
    WRITE,
    READV,
    WRITEV,
    PREAD64,
    PWRITE64,
    OPEN,
    OPENAT,
    CLOSE,
    LSEEK,
    _LLSEEK,
    STAT,
    FSTAT,
    LSTAT,
    NEWFSTATAT,
    STAT64,
    FSTAT64,
    LSTAT64,
    FSTATAT64,
    ACCESS,
    FACCESSAT,
    READLINK,
    READLINKAT,
    GETCWD,
    CHDIR,
    DUP,
    DUP2,
    DUP3,
    PIPE,
    PIPE2,
    IOCTL,
    FCNTL,
    FCNTL64,
    BRK,
    MMAP,
    MMAP2,
    OLD_MMAP,
    MUNMAP,
    MPROTECT,
    MREMAP,
    MADVISE,
    EXIT,
    EXIT_GROUP,
    GETPID,
    GETTID,
    GETPPID,
    GETUID,
    GETEUID,
    GETGID,
    GETEGID,
    GETUID32,
    GETEUID32,
    GETGID32,
    GETEGID32,
    UNAME,
    SYSINFO,
    GETRLIMIT,
    UGETRLIMIT,
    PRLIMIT64,
    SET_TID_ADDRESS,
    SET_ROBUST_LIST,
    ARCH_PRCTL,
    SET_THREAD_AREA,
    SET_TLS,
    RT_SIGACTION,
    RT_SIGPROCMASK,
    RT_SIGRETURN,
    SIGALTSTACK,
    POLL,
    NANOSLEEP,
    CLOCK_NANOSLEEP,
    CLOCK_GETTIME,
    GETTIMEOFDAY,
    TIME,
    GETRANDOM,
    FUTEX,
    CLONE,
    SCHED_YIELD,
    SCHED_GETAFFINITY,
    TKILL,
    TGKILL,
    KILL,
    SOCKET,
    BIND,
    LISTEN,
    ACCEPT,
    ACCEPT4,
    CONNECT,
    SENDTO,
    RECVFROM,
    // BSD family
    SYSARCH,
    ISSETUGID,
    THR_SELF,
    THR_EXIT,
    THR_KILL,
    THREAD_SELFID,
    GETENTROPY,
    __SYSCTL,
}
