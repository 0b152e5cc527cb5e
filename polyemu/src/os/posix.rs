//! Syscalls shared by the POSIX targets.

use super::{
    fs::{FileSystem, GuestStat, OpenFlags, RootFs, StatLayout},
    objects::EmulatedObject,
    syscall::SysCalls,
    thread::WaitReason,
    Effect, Errno, Kernel, OsType, Outcome, SysOutcome, GUEST_PID, GUEST_UID, IO_CHUNK,
};
use crate::{
    arch::ArchType,
    engine::Machine,
    memory::{Access, Backing, Memory, Permission, Placement},
    utils::{checked_align_up, posix_prot_to_perm, read_cstring, sign_extend, Packer},
    PAGE_SIZE,
};
use log::{debug, warn};
use std::{
    fs::OpenOptions,
    io::{Read, Seek, SeekFrom, Write},
    net::{TcpListener, TcpStream},
    path::PathBuf,
};

const S_IFIFO: u64 = 0o010000;
const S_IFSOCK: u64 = 0o140000;

const SEEK_SET: u64 = 0;
const SEEK_CUR: u64 = 1;
const SEEK_END: u64 = 2;

const F_DUPFD: u64 = 0;
const F_GETFD: u64 = 1;
const F_GETFL: u64 = 3;
const F_DUPFD_CLOEXEC: u64 = 1030;

const AF_INET: u64 = 2;
const MREMAP_MAYMOVE: u64 = 1;

const POLLIN: u64 = 1;
const POLLOUT: u64 = 4;
const POLLNVAL: u64 = 0x20;

/// Largest count a single read or write transfers, as on Linux.
const MAX_RW_COUNT: u64 = 0x7fff_f000;
/// Per call cap of getrandom.
const MAX_RANDOM_LEN: u64 = (1 << 25) - 1;

/// Outcome of reading from an object.
pub(crate) enum Io {
    Done(Vec<u8>),
    Wait(WaitReason),
}

pub(crate) fn dispatch(k: &mut Kernel, m: &mut Machine, call: SysCalls, args: &[u64]) -> SysOutcome {
    let a = |i: usize| args.get(i).copied().unwrap_or_default();
    use SysCalls::*;
    match call {
        READ => read(k, m, a(0), a(1), a(2)),
        WRITE => write(k, m, a(0), a(1), a(2)),
        READV => readv(k, m, a(0), a(1), a(2)),
        WRITEV => writev(k, m, a(0), a(1), a(2)),
        PREAD64 | PWRITE64 => {
            let offset = split_offset(k, m, args, 3);
            if call == PREAD64 {
                pread(k, m, a(0), a(1), a(2), offset)
            } else {
                pwrite(k, m, a(0), a(1), a(2), offset)
            }
        }
        OPEN => open(k, m, at_fdcwd(k.os) as u64, a(0), a(1)),
        OPENAT => open(k, m, a(0), a(1), a(2)),
        CLOSE => close(k, a(0)),
        LSEEK => lseek(k, a(0), sarg(m, a(1)), a(2)).map(Outcome::ok),
        _LLSEEK => {
            let offset = ((a(1) << 32) | (a(2) & 0xffff_ffff)) as i64;
            let pos = lseek(k, a(0), offset, a(4))?;
            m.write_u64(a(3), pos)?;
            Ok(Outcome::ok(0))
        }
        STAT | LSTAT | STAT64 | LSTAT64 => {
            let wide = matches!(call, STAT64 | LSTAT64);
            let follow = matches!(call, STAT | STAT64);
            stat_path(k, m, at_fdcwd(k.os) as u64, a(0), a(1), follow, wide)
        }
        FSTAT | FSTAT64 => fstat(k, m, a(0), a(1), call == FSTAT64),
        NEWFSTATAT | FSTATAT64 => fstatat(k, m, a(0), a(1), a(2), a(3), call == FSTATAT64),
        ACCESS => access(k, m, at_fdcwd(k.os) as u64, a(0)),
        FACCESSAT => access(k, m, a(0), a(1)),
        READLINK => readlink(k, m, at_fdcwd(k.os) as u64, a(0), a(1), a(2)),
        READLINKAT => readlink(k, m, a(0), a(1), a(2), a(3)),
        GETCWD => getcwd(k, m, a(0), a(1)),
        CHDIR => chdir(k, m, a(0)),
        DUP => {
            let obj = object(k, a(0))?;
            Ok(Outcome::ok(k.state.objects.insert(obj)))
        }
        DUP2 | DUP3 => {
            let obj = object(k, a(0))?;
            if a(0) == a(1) {
                return match call {
                    DUP3 => Err(Errno::EINVAL),
                    _ => Ok(Outcome::ok(a(1))),
                };
            }
            release_handle(k, a(1));
            k.state.objects.insert_at(a(1), obj);
            Ok(Outcome::ok(a(1)))
        }
        PIPE => pipe(k, m, a(0), true),
        PIPE2 => pipe(k, m, a(0), false),
        IOCTL => {
            object(k, a(0))?;
            debug!("ioctl({}, {:#x}) -> ENOTTY", a(0), a(1));
            Err(Errno::ENOTTY)
        }
        FCNTL | FCNTL64 => fcntl(k, a(0), a(1), a(2)),
        BRK => brk(k, m, a(0)),
        MMAP => mmap(k, m, a(0), a(1), a(2), a(3), a(4), a(5)),
        MMAP2 => {
            let offset = a(5).checked_mul(PAGE_SIZE).ok_or(Errno::EINVAL)?;
            mmap(k, m, a(0), a(1), a(2), a(3), a(4), offset)
        }
        OLD_MMAP => {
            let mut v = [0u64; 6];
            for (i, slot) in v.iter_mut().enumerate() {
                let addr = a(0).checked_add(4 * i as u64).ok_or(Errno::EFAULT)?;
                *slot = m.read_u32(addr)? as u64;
            }
            mmap(k, m, v[0], v[1], v[2], v[3], v[4], v[5])
        }
        MUNMAP => {
            if a(0) % PAGE_SIZE != 0 || a(1) == 0 {
                return Err(Errno::EINVAL);
            }
            let len = checked_align_up(a(1), PAGE_SIZE).ok_or(Errno::EINVAL)?;
            m.mem_unmap(a(0), len)?;
            Ok(Outcome::ok(0))
        }
        MPROTECT => {
            let len = checked_align_up(a(1), PAGE_SIZE).ok_or(Errno::ENOMEM)?;
            if !m.is_mapped(a(0), len) {
                return Err(Errno::ENOMEM);
            }
            m.mprotect(a(0), len, posix_prot_to_perm(a(2)))?;
            Ok(Outcome::ok(0))
        }
        MREMAP => mremap(k, m, a(0), a(1), a(2), a(3)),
        MADVISE => Ok(Outcome::ok(0)),
        EXIT | EXIT_GROUP => Ok(Outcome::with_effect(0, Effect::ExitProcess(a(0)))),
        GETPID => Ok(Outcome::ok(GUEST_PID)),
        GETTID | THREAD_SELFID => Ok(Outcome::ok(k.current_tid())),
        GETPPID => Ok(Outcome::ok(1)),
        GETUID | GETEUID | GETGID | GETEGID | GETUID32 | GETEUID32 | GETGID32 | GETEGID32 => {
            Ok(Outcome::ok(GUEST_UID))
        }
        UNAME => uname(k, m, a(0)),
        SYSINFO => sysinfo(k, m, a(0)),
        GETRLIMIT | UGETRLIMIT => {
            let (cur, max) = rlimit(m, a(0));
            m.write_ptr(a(1), cur, None)?;
            m.write_ptr(a(1) + m.pointer_size() as u64, max, None)?;
            Ok(Outcome::ok(0))
        }
        PRLIMIT64 => {
            if a(3) != 0 {
                let (cur, max) = rlimit(m, a(1));
                let mask = m.arch.word_mask();
                let infinite = |v: u64| if v == mask { u64::MAX } else { v };
                m.write_u64(a(3), infinite(cur))?;
                m.write_u64(a(3) + 8, infinite(max))?;
            }
            Ok(Outcome::ok(0))
        }
        RT_SIGACTION => sigaction(k, m, a(0), a(1), a(2)),
        RT_SIGPROCMASK => {
            if a(2) != 0 {
                let len = if a(3) == 0 { 8 } else { a(3).min(128) };
                k.write_bytes(m, a(2), &vec![0u8; len as usize])?;
            }
            Ok(Outcome::ok(0))
        }
        RT_SIGRETURN | SIGALTSTACK => {
            warn!("{:?} is not emulated, signals are never delivered", call);
            Ok(Outcome::ok(0))
        }
        POLL => poll(k, m, a(0), a(1), sarg(m, a(2))),
        NANOSLEEP => {
            let ns = read_timespec(m, a(0))?;
            Ok(sleep_until(k.state.clock.now_ns().saturating_add(ns)))
        }
        CLOCK_NANOSLEEP => {
            let ns = read_timespec(m, a(2))?;
            let until = if a(1) & 1 != 0 {
                // TIMER_ABSTIME
                match a(0) {
                    0 => ns,
                    _ => (k.state.clock.now_ns() - k.state.clock.uptime_ns()).saturating_add(ns),
                }
            } else {
                k.state.clock.now_ns().saturating_add(ns)
            };
            Ok(sleep_until(until))
        }
        CLOCK_GETTIME => {
            let ns = match a(0) {
                0 => k.state.clock.now_ns(),
                _ => k.state.clock.uptime_ns(),
            };
            write_pair(m, a(1), ns / 1_000_000_000, ns % 1_000_000_000)?;
            Ok(Outcome::ok(0))
        }
        GETTIMEOFDAY => {
            if a(0) != 0 {
                let ns = k.state.clock.now_ns();
                write_pair(m, a(0), ns / 1_000_000_000, (ns % 1_000_000_000) / 1000)?;
            }
            Ok(Outcome::ok(0))
        }
        TIME => {
            let secs = k.state.clock.now_ns() / 1_000_000_000;
            if a(0) != 0 {
                m.write_ptr(a(0), secs, None)?;
            }
            Ok(Outcome::ok(secs))
        }
        GETRANDOM => {
            let len = a(1).min(MAX_RANDOM_LEN);
            m.mem.check_access(a(0), len, Access::Write)?;
            let bytes = k.state.rng.fill(len as usize);
            k.write_bytes(m, a(0), &bytes)?;
            Ok(Outcome::ok(len))
        }
        SCHED_YIELD => Ok(Outcome::with_effect(0, Effect::Yield)),
        SCHED_GETAFFINITY => {
            let len = m.pointer_size() as u64;
            if a(1) < len {
                return Err(Errno::EINVAL);
            }
            let mut mask = vec![0u8; len as usize];
            mask[0] = 1;
            k.write_bytes(m, a(2), &mask)?;
            Ok(Outcome::ok(len))
        }
        KILL => kill(a(0), a(1)),
        SOCKET => socket(k, a(0), a(1)),
        BIND => bind(k, m, a(0), a(1)),
        LISTEN => listen(k, a(0)),
        ACCEPT | ACCEPT4 => accept(k, m, a(0), a(1), a(2)),
        CONNECT => connect(k, m, a(0), a(1)),
        SENDTO => write(k, m, a(0), a(1), a(2)),
        RECVFROM => read(k, m, a(0), a(1), a(2)),
        other => {
            warn!("{:?} has no handler on {}", other, k.os);
            Err(Errno::ENOSYS)
        }
    }
}

/// Pointer-width signed argument.
pub(crate) fn sarg(m: &Machine, v: u64) -> i64 {
    sign_extend(v, m.pointer_size() as u32 * 8)
}

fn at_fdcwd(os: OsType) -> i64 {
    match os {
        OsType::MacOS => -2,
        _ => -100,
    }
}

/// 64-bit offset argument starting at `index`; 32-bit targets pass it in a
/// register pair, aligned to an even register on arm and mips.
fn split_offset(k: &Kernel, m: &Machine, args: &[u64], index: usize) -> u64 {
    let a = |i: usize| args.get(i).copied().unwrap_or_default();
    if m.pointer_size() == 8 {
        return a(index);
    }
    let index = match k.arch {
        ArchType::Arm | ArchType::Mips if index % 2 == 1 => index + 1,
        _ => index,
    };
    let (lo, hi) = if m.arch.big_endian {
        (a(index + 1), a(index))
    } else {
        (a(index), a(index + 1))
    };
    (hi << 32) | (lo & 0xffff_ffff)
}

fn guest_path(m: &Machine, addr: u64) -> Result<String, Errno> {
    if addr == 0 {
        return Err(Errno::EFAULT);
    }
    Ok(read_cstring(m, addr)?)
}

fn object(k: &Kernel, fd: u64) -> Result<EmulatedObject, Errno> {
    k.state.objects.get(fd).cloned().ok_or(Errno::EBADF)
}

/// Resolve `path` against `dirfd` to a (guest, host) path pair.
fn resolve_at(k: &Kernel, m: &Machine, dirfd: u64, path: &str) -> Result<(String, PathBuf), Errno> {
    let base = if path.starts_with('/') || sarg(m, dirfd) == at_fdcwd(k.os) {
        k.state.cwd.clone()
    } else {
        match k.state.objects.get(dirfd) {
            Some(EmulatedObject::File {
                guest_path,
                directory: true,
                ..
            }) => guest_path.clone(),
            Some(_) => return Err(Errno::ENOTDIR),
            None => return Err(Errno::EBADF),
        }
    };
    let host = k.fs.resolve_guest_path(&base, path)?;
    Ok((RootFs::guest_absolute(&base, path), host))
}

fn release_handle(k: &mut Kernel, fd: u64) {
    if let Some(EmulatedObject::Socket { id, .. }) = k.state.objects.remove(fd) {
        if !k.state.objects.socket_in_use(id) {
            k.host.close(id);
        }
    }
}

pub(crate) fn read_object(k: &mut Kernel, fd: u64, len: usize) -> Result<Io, Errno> {
    match object(k, fd)? {
        EmulatedObject::Stdio { stream: 0 } => Ok(Io::Done(k.read_stdin(len)?)),
        EmulatedObject::File {
            host_path,
            offset,
            readable,
            directory,
            ..
        } => {
            if directory {
                return Err(Errno::EISDIR);
            }
            if !readable {
                return Err(Errno::EBADF);
            }
            let data = read_file_at(&host_path, offset, len)?;
            if let Some(EmulatedObject::File { offset, .. }) = k.state.objects.get_mut(fd) {
                *offset += data.len() as u64;
            }
            Ok(Io::Done(data))
        }
        EmulatedObject::Pipe {
            id,
            write_end: false,
        } => {
            let has_writer = k.state.objects.pipe_has_writer(id);
            let buf = k.state.objects.pipe_buffer(id).ok_or(Errno::EBADF)?;
            if buf.is_empty() {
                return Ok(match has_writer {
                    true => Io::Wait(WaitReason::Pipe { id }),
                    false => Io::Done(vec![]),
                });
            }
            let n = len.min(buf.len());
            Ok(Io::Done(buf.drain(..n).collect()))
        }
        EmulatedObject::Socket { id, .. } => {
            let stream = k.host.streams.get_mut(&id).ok_or(Errno::ENOTCONN)?;
            let mut buf = vec![0u8; len.min(IO_CHUNK)];
            let n = stream.read(&mut buf)?;
            buf.truncate(n);
            Ok(Io::Done(buf))
        }
        _ => Err(Errno::EBADF),
    }
}

pub(crate) fn write_object(k: &mut Kernel, fd: u64, data: &[u8]) -> Result<u64, Errno> {
    match object(k, fd)? {
        EmulatedObject::Stdio { stream } if stream == 1 || stream == 2 => {
            k.write_stdio(stream, data)?;
            Ok(data.len() as u64)
        }
        EmulatedObject::File {
            host_path,
            offset,
            writable,
            append,
            ..
        } => {
            if !writable {
                return Err(Errno::EBADF);
            }
            let mut f = OpenOptions::new().write(true).open(&host_path)?;
            let pos = if append {
                f.seek(SeekFrom::End(0))?
            } else {
                f.seek(SeekFrom::Start(offset))?
            };
            f.write_all(data)?;
            if let Some(EmulatedObject::File { offset, .. }) = k.state.objects.get_mut(fd) {
                *offset = pos + data.len() as u64;
            }
            Ok(data.len() as u64)
        }
        EmulatedObject::Pipe { id, write_end: true } => {
            let has_reader = k.state.objects.handles().any(
                |(_, o)| matches!(o, EmulatedObject::Pipe { id: i, write_end: false } if *i == id),
            );
            if !has_reader {
                return Err(Errno::EPIPE);
            }
            let buf = k.state.objects.pipe_buffer(id).ok_or(Errno::EBADF)?;
            buf.extend(data.iter().copied());
            Ok(data.len() as u64)
        }
        EmulatedObject::Socket { id, .. } => {
            let stream = k.host.streams.get_mut(&id).ok_or(Errno::ENOTCONN)?;
            stream.write_all(data)?;
            Ok(data.len() as u64)
        }
        _ => Err(Errno::EBADF),
    }
}

fn read_file_at(path: &PathBuf, offset: u64, len: usize) -> Result<Vec<u8>, Errno> {
    let mut f = std::fs::File::open(path)?;
    f.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    f.take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Clamp a read count to the writable room at `buf`; no room at all is a fault.
fn read_room(m: &Machine, buf: u64, count: u64) -> Result<u64, Errno> {
    let count = count.min(MAX_RW_COUNT);
    match m.mem.accessible_len(buf, count, Access::Write) {
        0 if count > 0 => Err(Errno::EFAULT),
        room => Ok(room),
    }
}

fn read(k: &mut Kernel, m: &mut Machine, fd: u64, buf: u64, count: u64) -> SysOutcome {
    let count = read_room(m, buf, count)?;
    match read_object(k, fd, count as usize)? {
        Io::Done(data) => {
            k.write_bytes(m, buf, &data)?;
            Ok(Outcome::ok(data.len() as u64))
        }
        Io::Wait(reason) => Ok(Outcome::retry_after(reason)),
    }
}

fn write(k: &mut Kernel, m: &mut Machine, fd: u64, buf: u64, count: u64) -> SysOutcome {
    let data = k.read_bytes(m, buf, count)?;
    Ok(Outcome::ok(write_object(k, fd, &data)?))
}

fn iovecs(m: &Machine, iov: u64, count: u64) -> Result<Vec<(u64, u64)>, Errno> {
    let ps = m.pointer_size() as u64;
    let mut out = vec![];
    for i in 0..count.min(1024) {
        let base = m.read_ptr(iov + i * 2 * ps, None)?;
        let len = m.read_ptr(iov + i * 2 * ps + ps, None)?;
        out.push((base, len));
    }
    Ok(out)
}

fn readv(k: &mut Kernel, m: &mut Machine, fd: u64, iov: u64, count: u64) -> SysOutcome {
    let vecs = iovecs(m, iov, count)?;
    let total = vecs
        .iter()
        .fold(0u64, |total, (_, len)| total.saturating_add(*len))
        .min(MAX_RW_COUNT);
    let data = match read_object(k, fd, total as usize)? {
        Io::Done(data) => data,
        Io::Wait(reason) => return Ok(Outcome::retry_after(reason)),
    };
    let mut done = 0usize;
    for (base, len) in vecs {
        if done >= data.len() {
            break;
        }
        let n = (len as usize).min(data.len() - done);
        k.write_bytes(m, base, &data[done..done + n])?;
        done += n;
    }
    Ok(Outcome::ok(done as u64))
}

fn writev(k: &mut Kernel, m: &mut Machine, fd: u64, iov: u64, count: u64) -> SysOutcome {
    let mut data = vec![];
    for (base, len) in iovecs(m, iov, count)? {
        data.extend(k.read_bytes(m, base, len)?);
    }
    Ok(Outcome::ok(write_object(k, fd, &data)?))
}

fn pread(k: &mut Kernel, m: &mut Machine, fd: u64, buf: u64, count: u64, offset: u64) -> SysOutcome {
    match object(k, fd)? {
        EmulatedObject::File {
            host_path,
            readable: true,
            directory: false,
            ..
        } => {
            let count = read_room(m, buf, count)?;
            let data = read_file_at(&host_path, offset, count as usize)?;
            k.write_bytes(m, buf, &data)?;
            Ok(Outcome::ok(data.len() as u64))
        }
        EmulatedObject::File { .. } => Err(Errno::EBADF),
        _ => Err(Errno::ESPIPE),
    }
}

fn pwrite(k: &mut Kernel, m: &mut Machine, fd: u64, buf: u64, count: u64, offset: u64) -> SysOutcome {
    match object(k, fd)? {
        EmulatedObject::File {
            host_path,
            writable: true,
            ..
        } => {
            let data = k.read_bytes(m, buf, count)?;
            let mut f = OpenOptions::new().write(true).open(&host_path)?;
            f.seek(SeekFrom::Start(offset))?;
            f.write_all(&data)?;
            Ok(Outcome::ok(data.len() as u64))
        }
        EmulatedObject::File { .. } => Err(Errno::EBADF),
        _ => Err(Errno::ESPIPE),
    }
}

fn open(k: &mut Kernel, m: &mut Machine, dirfd: u64, path: u64, flags: u64) -> SysOutcome {
    let path = guest_path(m, path)?;
    let (guest, host) = resolve_at(k, m, dirfd, &path)?;
    let fl = OpenFlags::decode(k.os, k.arch, flags);
    debug!("open({}, {:?}) -> {}", guest, fl, host.display());
    let obj = if host.is_dir() {
        if fl.write {
            return Err(Errno::EISDIR);
        }
        EmulatedObject::File {
            guest_path: guest,
            host_path: host,
            offset: 0,
            readable: true,
            writable: false,
            append: false,
            directory: true,
        }
    } else {
        if fl.directory {
            return Err(match host.exists() {
                true => Errno::ENOTDIR,
                false => Errno::ENOENT,
            });
        }
        let mut opts = OpenOptions::new();
        opts.read(fl.read)
            .write(fl.write || fl.create || fl.truncate)
            .truncate(fl.truncate && fl.write);
        if fl.create && fl.exclusive {
            opts.create_new(true);
        } else {
            opts.create(fl.create);
        }
        opts.open(&host)?;
        EmulatedObject::File {
            guest_path: guest,
            host_path: host,
            offset: 0,
            readable: fl.read,
            writable: fl.write,
            append: fl.append,
            directory: false,
        }
    };
    Ok(Outcome::ok(k.state.objects.insert(obj)))
}

fn close(k: &mut Kernel, fd: u64) -> SysOutcome {
    object(k, fd)?;
    release_handle(k, fd);
    Ok(Outcome::ok(0))
}

fn lseek(k: &mut Kernel, fd: u64, offset: i64, whence: u64) -> Result<u64, Errno> {
    let (host_path, current) = match object(k, fd)? {
        EmulatedObject::File {
            host_path, offset, ..
        } => (host_path, offset),
        _ => return Err(Errno::ESPIPE),
    };
    let base = match whence {
        SEEK_SET => 0,
        SEEK_CUR => current as i64,
        SEEK_END => std::fs::metadata(&host_path)?.len() as i64,
        _ => return Err(Errno::EINVAL),
    };
    let pos = base.checked_add(offset).filter(|p| *p >= 0).ok_or(Errno::EINVAL)? as u64;
    if let Some(EmulatedObject::File { offset, .. }) = k.state.objects.get_mut(fd) {
        *offset = pos;
    }
    Ok(pos)
}

fn object_stat(obj: &EmulatedObject) -> Result<GuestStat, Errno> {
    Ok(match obj {
        EmulatedObject::Stdio { .. } => GuestStat::character_device(),
        EmulatedObject::File { host_path, .. } => GuestStat::from_metadata(&std::fs::metadata(host_path)?),
        EmulatedObject::Pipe { .. } => GuestStat {
            mode: S_IFIFO | 0o600,
            nlink: 1,
            blksize: PAGE_SIZE,
            ..Default::default()
        },
        EmulatedObject::Socket { .. } => GuestStat {
            mode: S_IFSOCK | 0o777,
            nlink: 1,
            blksize: PAGE_SIZE,
            ..Default::default()
        },
        _ => return Err(Errno::EBADF),
    })
}

fn write_stat(k: &Kernel, m: &mut Machine, buf: u64, st: &GuestStat, wide: bool) -> SysOutcome {
    let layout = StatLayout::for_target(k.os, k.arch, wide);
    k.write_bytes(m, buf, &layout.encode(st, m.arch.endian()))?;
    Ok(Outcome::ok(0))
}

fn stat_path(
    k: &mut Kernel,
    m: &mut Machine,
    dirfd: u64,
    path: u64,
    buf: u64,
    follow: bool,
    wide: bool,
) -> SysOutcome {
    let path = guest_path(m, path)?;
    let (_, host) = resolve_at(k, m, dirfd, &path)?;
    let md = if follow {
        std::fs::metadata(&host)?
    } else {
        std::fs::symlink_metadata(&host)?
    };
    write_stat(k, m, buf, &GuestStat::from_metadata(&md), wide)
}

fn fstat(k: &mut Kernel, m: &mut Machine, fd: u64, buf: u64, wide: bool) -> SysOutcome {
    let st = object_stat(&object(k, fd)?)?;
    write_stat(k, m, buf, &st, wide)
}

fn fstatat(
    k: &mut Kernel,
    m: &mut Machine,
    dirfd: u64,
    path: u64,
    buf: u64,
    flags: u64,
    wide: bool,
) -> SysOutcome {
    let (nofollow, empty_path) = match k.os {
        OsType::FreeBSD => (0x200, 0x4000),
        OsType::MacOS => (0x20, 0x400),
        _ => (0x100, 0x1000),
    };
    if flags & empty_path != 0 && m.read(path, 1).map(|b| b[0] == 0).unwrap_or(false) {
        return fstat(k, m, dirfd, buf, wide);
    }
    stat_path(k, m, dirfd, path, buf, flags & nofollow == 0, wide)
}

fn access(k: &mut Kernel, m: &mut Machine, dirfd: u64, path: u64) -> SysOutcome {
    let path = guest_path(m, path)?;
    let (_, host) = resolve_at(k, m, dirfd, &path)?;
    match host.exists() {
        true => Ok(Outcome::ok(0)),
        false => Err(Errno::ENOENT),
    }
}

fn readlink(k: &mut Kernel, m: &mut Machine, dirfd: u64, path: u64, buf: u64, size: u64) -> SysOutcome {
    let path = guest_path(m, path)?;
    let target = if path == "/proc/self/exe" {
        k.state.exe_path.clone()
    } else {
        let (_, host) = resolve_at(k, m, dirfd, &path)?;
        let link = std::fs::read_link(&host).map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidInput => Errno::EINVAL,
            _ => Errno::from_io(&e),
        })?;
        match link.strip_prefix(k.fs.root()) {
            Ok(inside) => format!("/{}", inside.display()),
            Err(_) => link.display().to_string(),
        }
    };
    let bytes = target.as_bytes();
    let n = bytes.len().min(size as usize);
    k.write_bytes(m, buf, &bytes[..n])?;
    Ok(Outcome::ok(n as u64))
}

fn getcwd(k: &mut Kernel, m: &mut Machine, buf: u64, size: u64) -> SysOutcome {
    let mut cwd = k.state.cwd.clone().into_bytes();
    cwd.push(0);
    if (cwd.len() as u64) > size {
        return Err(Errno::ERANGE);
    }
    k.write_bytes(m, buf, &cwd)?;
    Ok(Outcome::ok(match k.os {
        OsType::Linux => cwd.len() as u64,
        _ => 0,
    }))
}

fn chdir(k: &mut Kernel, m: &mut Machine, path: u64) -> SysOutcome {
    let path = guest_path(m, path)?;
    let (guest, host) = resolve_at(k, m, at_fdcwd(k.os) as u64, &path)?;
    if !host.exists() {
        return Err(Errno::ENOENT);
    }
    if !host.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    k.state.cwd = guest;
    Ok(Outcome::ok(0))
}

fn pipe(k: &mut Kernel, m: &mut Machine, fds: u64, legacy: bool) -> SysOutcome {
    let (r, w) = k.state.objects.new_pipe();
    let in_registers = legacy && matches!((k.os, k.arch), (OsType::Linux, ArchType::Mips) | (OsType::MacOS, _));
    if in_registers {
        k.set_second_result(m, w)?;
        return Ok(Outcome::ok(r));
    }
    let written = m.write_u32(fds, r as u32).and_then(|_| m.write_u32(fds + 4, w as u32));
    if let Err(e) = written {
        k.state.objects.remove(r);
        k.state.objects.remove(w);
        return Err(e.into());
    }
    Ok(Outcome::ok(0))
}

fn fcntl(k: &mut Kernel, fd: u64, cmd: u64, arg: u64) -> SysOutcome {
    let obj = object(k, fd)?;
    match cmd {
        F_DUPFD | F_DUPFD_CLOEXEC => Ok(Outcome::ok(k.state.objects.insert_from(arg, obj))),
        F_GETFD => Ok(Outcome::ok(0)),
        F_GETFL => Ok(Outcome::ok(match obj {
            EmulatedObject::File {
                readable: true,
                writable: true,
                ..
            } => 2,
            EmulatedObject::File { writable: true, .. } => 1,
            EmulatedObject::Pipe { write_end: true, .. } => 1,
            EmulatedObject::Stdio { stream: 1 | 2 } => 1,
            EmulatedObject::Socket { .. } => 2,
            _ => 0,
        })),
        _ => Ok(Outcome::ok(0)),
    }
}

fn brk(k: &mut Kernel, m: &mut Machine, addr: u64) -> SysOutcome {
    let cur = k.state.brk;
    if addr == 0 || addr < k.state.brk_start {
        return Ok(Outcome::ok(cur));
    }
    let (cur_end, new_end) = match (checked_align_up(cur, PAGE_SIZE), checked_align_up(addr, PAGE_SIZE)) {
        (Some(cur_end), Some(new_end)) => (cur_end, new_end),
        _ => return Ok(Outcome::ok(cur)),
    };
    if new_end > cur_end {
        let grown = m.mem.map(
            Placement::Fixed(cur_end),
            new_end - cur_end,
            Permission::READ | Permission::WRITE,
            "[brk]",
        );
        if grown.is_err() {
            debug!("brk({:#x}) collides, heap stays at {:#x}", addr, cur);
            return Ok(Outcome::ok(cur));
        }
    } else if new_end < cur_end {
        m.mem_unmap(new_end, cur_end - new_end)?;
    }
    k.state.brk = addr;
    Ok(Outcome::ok(addr))
}

/// (MAP_FIXED, MAP_ANONYMOUS) for the target.
fn mmap_flags(os: OsType, arch: ArchType) -> (u64, u64) {
    match (os, arch) {
        (OsType::Linux, ArchType::Mips) => (0x10, 0x800),
        (OsType::Linux, _) => (0x10, 0x20),
        _ => (0x10, 0x1000),
    }
}

#[allow(clippy::too_many_arguments)]
fn mmap(
    k: &mut Kernel,
    m: &mut Machine,
    addr: u64,
    len: u64,
    prot: u64,
    flags: u64,
    fd: u64,
    offset: u64,
) -> SysOutcome {
    if len == 0 {
        return Err(Errno::EINVAL);
    }
    let (map_fixed, map_anon) = mmap_flags(k.os, k.arch);
    let size = checked_align_up(len, PAGE_SIZE).ok_or(Errno::ENOMEM)?;
    let perms = posix_prot_to_perm(prot);
    let file = if flags & map_anon == 0 {
        match object(k, fd)? {
            EmulatedObject::File {
                guest_path,
                host_path,
                directory: false,
                ..
            } => Some((guest_path, host_path)),
            _ => return Err(Errno::EACCES),
        }
    } else {
        None
    };
    let (tag, backing) = match &file {
        Some((guest, _)) => (
            guest.clone(),
            Backing::File {
                path: guest.clone(),
                offset,
            },
        ),
        None => ("[mmap anonymous]".to_string(), Backing::Anonymous),
    };
    let base = if flags & map_fixed != 0 {
        if addr % PAGE_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        m.mem_unmap(addr, size)?;
        m.mem.map_with(Placement::Fixed(addr), size, perms, tag, backing)?
    } else {
        let hint = match addr {
            0 => k.state.mmap_next,
            _ => checked_align_up(addr, PAGE_SIZE).unwrap_or(k.state.mmap_next),
        };
        let base = m
            .mem
            .map_with(Placement::Auto { min: hint }, size, perms, tag.clone(), backing.clone())
            .or_else(|_| {
                m.mem
                    .map_with(Placement::Auto { min: k.layout.mmap_address }, size, perms, tag, backing)
            })?;
        if addr == 0 {
            k.state.mmap_next = k.state.mmap_next.max(base + size);
        }
        base
    };
    if let Some((_, host)) = file {
        let data = read_file_at(&host, offset, len as usize)?;
        m.mem.write_raw(base, &data)?;
    }
    Ok(Outcome::ok(base))
}

fn mremap(k: &mut Kernel, m: &mut Machine, old: u64, old_size: u64, new_size: u64, flags: u64) -> SysOutcome {
    let (old_size, new_size) = match (checked_align_up(old_size, PAGE_SIZE), checked_align_up(new_size, PAGE_SIZE)) {
        (Some(old_size), Some(new_size)) => (old_size, new_size),
        _ => return Err(Errno::EINVAL),
    };
    if old % PAGE_SIZE != 0 || new_size == 0 {
        return Err(Errno::EINVAL);
    }
    if !m.is_mapped(old, old_size) {
        return Err(Errno::EFAULT);
    }
    if new_size <= old_size {
        if new_size < old_size {
            m.mem_unmap(old + new_size, old_size - new_size)?;
        }
        return Ok(Outcome::ok(old));
    }
    let info = m.mem.region_at(old).cloned().ok_or(Errno::EFAULT)?;
    if m.mem
        .map(Placement::Fixed(old + old_size), new_size - old_size, info.perms, info.tag.clone())
        .is_ok()
    {
        return Ok(Outcome::ok(old));
    }
    if flags & MREMAP_MAYMOVE == 0 {
        return Err(Errno::ENOMEM);
    }
    let data = m.mem.read_raw(old, old_size as usize)?;
    let base = m.mem.map(
        Placement::Auto {
            min: k.state.mmap_next,
        },
        new_size,
        info.perms,
        info.tag,
    )?;
    m.mem.write_raw(base, &data)?;
    m.mem_unmap(old, old_size)?;
    k.state.mmap_next = k.state.mmap_next.max(base + new_size);
    Ok(Outcome::ok(base))
}

fn uname(k: &mut Kernel, m: &mut Machine, buf: u64) -> SysOutcome {
    let machine = match k.arch {
        ArchType::X86 => "i686",
        ArchType::X8664 => "x86_64",
        ArchType::Arm => "armv7l",
        ArchType::Arm64 => "aarch64",
        ArchType::Mips => "mips",
        ArchType::Riscv64 => "riscv64",
    };
    let fields = ["Linux", "polyemu", "5.15.0", "#1 SMP", machine, ""];
    let mut out = vec![0u8; 65 * fields.len()];
    for (i, f) in fields.iter().enumerate() {
        out[i * 65..i * 65 + f.len()].copy_from_slice(f.as_bytes());
    }
    k.write_bytes(m, buf, &out)?;
    Ok(Outcome::ok(0))
}

fn sysinfo(k: &mut Kernel, m: &mut Machine, buf: u64) -> SysOutcome {
    let ps = m.pointer_size() as u64;
    k.write_bytes(m, buf, &vec![0u8; (14 * ps + 8) as usize])?;
    let uptime = k.state.clock.uptime_ns() / 1_000_000_000;
    m.write_ptr(buf, uptime, None)?;
    // totalram, freeram
    m.write_ptr(buf + 4 * ps, 0x4000_0000, None)?;
    m.write_ptr(buf + 5 * ps, 0x2000_0000, None)?;
    m.write_ptr(buf + 10 * ps, 1, Some(2))?;
    m.write_ptr(buf + 13 * ps, 1, Some(4))?;
    Ok(Outcome::ok(0))
}

/// (soft, hard) limit of resource `res`.
fn rlimit(m: &Machine, res: u64) -> (u64, u64) {
    let infinity = m.arch.word_mask();
    match res {
        // RLIMIT_STACK
        3 => (8 << 20, infinity),
        // RLIMIT_NOFILE
        7 => (1024, 4096),
        _ => (infinity, infinity),
    }
}

fn sigaction(k: &mut Kernel, m: &mut Machine, sig: u64, act: u64, oact: u64) -> SysOutcome {
    let ps = m.pointer_size() as u64;
    if oact != 0 {
        let old = k.state.sigactions.get(&sig).cloned().unwrap_or_else(|| vec![0; 4]);
        for (i, v) in old.iter().enumerate() {
            m.write_ptr(oact + i as u64 * ps, *v, None)?;
        }
    }
    if act != 0 {
        let mut words = vec![];
        for i in 0..4 {
            words.push(m.read_ptr(act + i * ps, None)?);
        }
        debug!("rt_sigaction({}) handler {:#x} recorded", sig, words[0]);
        k.state.sigactions.insert(sig, words);
    }
    Ok(Outcome::ok(0))
}

fn poll(k: &mut Kernel, m: &mut Machine, fds: u64, nfds: u64, timeout: i64) -> SysOutcome {
    let mut ready = 0;
    let mut waiting_on = None;
    for i in 0..nfds.min(1024) {
        let entry = fds + i * 8;
        let fd = sign_extend(m.read_u32(entry)? as u64, 32);
        let events = m.read_ptr(entry + 4, Some(2))?;
        let revents = if fd < 0 {
            0
        } else {
            match k.state.objects.get(fd as u64) {
                None => POLLNVAL,
                Some(EmulatedObject::Pipe {
                    id,
                    write_end: false,
                }) => {
                    if k.state.objects.pipe_ready(*id) {
                        events & POLLIN
                    } else {
                        waiting_on = Some(*id);
                        0
                    }
                }
                Some(_) => events & (POLLIN | POLLOUT),
            }
        };
        m.write_ptr(entry + 6, revents, Some(2))?;
        if revents != 0 {
            ready += 1;
        }
    }
    match (ready, waiting_on) {
        (0, Some(id)) if timeout != 0 => Ok(Outcome::retry_after(WaitReason::Pipe { id })),
        _ => Ok(Outcome::ok(ready)),
    }
}

fn read_timespec(m: &Machine, addr: u64) -> Result<u64, Errno> {
    let ps = m.pointer_size() as u64;
    let secs = m.read_ptr(addr, None)?;
    let nsecs = m.read_ptr(addr + ps, None)?;
    Ok(secs.saturating_mul(1_000_000_000).saturating_add(nsecs))
}

fn write_pair(m: &mut Machine, addr: u64, a: u64, b: u64) -> Result<(), Errno> {
    let ps = m.pointer_size() as u64;
    m.write_ptr(addr, a, None)?;
    m.write_ptr(addr + ps, b, None)?;
    Ok(())
}

fn sleep_until(until_ns: u64) -> Outcome {
    Outcome::with_effect(
        0,
        Effect::Block {
            reason: WaitReason::Sleep { until_ns },
            restart: false,
        },
    )
}

/// Fatal signals aimed at the process end it; others are dropped.
pub(crate) fn kill(pid: u64, sig: u64) -> SysOutcome {
    const FATAL: [u64; 4] = [6, 9, 11, 15];
    if sig == 0 {
        return Ok(Outcome::ok(0));
    }
    if (pid == GUEST_PID || pid == 0) && FATAL.contains(&sig) {
        return Ok(Outcome::with_effect(0, Effect::ExitProcess(128 + sig)));
    }
    warn!("signal {} to {} dropped", sig, pid);
    Ok(Outcome::ok(0))
}

fn socket(k: &mut Kernel, domain: u64, kind: u64) -> SysOutcome {
    let stream = match k.arch {
        ArchType::Mips => 2,
        _ => 1,
    };
    if domain != AF_INET {
        return Err(Errno::EAFNOSUPPORT);
    }
    if kind & 0xf != stream {
        return Err(Errno::EINVAL);
    }
    let id = k.state.objects.next_id();
    Ok(Outcome::ok(k.state.objects.insert(EmulatedObject::Socket {
        id,
        domain,
        kind: kind & 0xf,
    })))
}

fn socket_id(k: &Kernel, fd: u64) -> Result<u64, Errno> {
    match object(k, fd)? {
        EmulatedObject::Socket { id, .. } => Ok(id),
        _ => Err(Errno::ENOTSOCK),
    }
}

fn read_sockaddr(m: &Machine, addr: u64) -> Result<String, Errno> {
    let raw = m.read(addr, 8)?;
    let port = u16::from_be_bytes([raw[2], raw[3]]);
    Ok(format!("{}.{}.{}.{}:{}", raw[4], raw[5], raw[6], raw[7], port))
}

fn bind(k: &mut Kernel, m: &mut Machine, fd: u64, addr: u64) -> SysOutcome {
    let id = socket_id(k, fd)?;
    let addr = read_sockaddr(m, addr)?;
    debug!("bind({}) -> {}", fd, addr);
    k.host.bound.insert(id, addr);
    Ok(Outcome::ok(0))
}

fn listen(k: &mut Kernel, fd: u64) -> SysOutcome {
    let id = socket_id(k, fd)?;
    let addr = k.host.bound.remove(&id).ok_or(Errno::EINVAL)?;
    let listener = TcpListener::bind(&addr)?;
    k.host.listeners.insert(id, listener);
    Ok(Outcome::ok(0))
}

fn accept(k: &mut Kernel, m: &mut Machine, fd: u64, addr: u64, addrlen: u64) -> SysOutcome {
    let id = socket_id(k, fd)?;
    let listener = k.host.listeners.get(&id).ok_or(Errno::EINVAL)?;
    let (stream, peer) = listener.accept()?;
    let new_id = k.state.objects.next_id();
    k.host.streams.insert(new_id, stream);
    let new_fd = k.state.objects.insert(EmulatedObject::Socket {
        id: new_id,
        domain: AF_INET,
        kind: 1,
    });
    if addr != 0 {
        let mut sa = vec![0u8; 16];
        sa[..2].copy_from_slice(&Packer::new(m.arch.endian(), 2).pack(AF_INET));
        sa[2..4].copy_from_slice(&peer.port().to_be_bytes());
        if let std::net::IpAddr::V4(ip) = peer.ip() {
            sa[4..8].copy_from_slice(&ip.octets());
        }
        k.write_bytes(m, addr, &sa)?;
        if addrlen != 0 {
            m.write_u32(addrlen, 16)?;
        }
    }
    Ok(Outcome::ok(new_fd))
}

fn connect(k: &mut Kernel, m: &mut Machine, fd: u64, addr: u64) -> SysOutcome {
    let id = socket_id(k, fd)?;
    let addr = read_sockaddr(m, addr)?;
    let stream = TcpStream::connect(&addr)?;
    k.host.streams.insert(id, stream);
    Ok(Outcome::ok(0))
}
