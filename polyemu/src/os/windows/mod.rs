//! Emulated Win32 API: the kernel32 subset guests use at start-up plus
//! threads, events, virtual memory and the process heap.

pub mod libc;
pub mod registry;

use super::{
    objects::EmulatedObject,
    posix::{read_object, write_object, Io},
    thread::WaitReason,
    ApiOutcome, Effect, Errno, Kernel, GUEST_PID,
};
use crate::{
    engine::Machine,
    errors::Result,
    loader::{ImageSet, StubTable},
    memory::{Memory, Permission, Placement},
    registers::{Registers, StackRegister},
    utils::{align, checked_align_up, read_cstring},
    PAGE_SIZE,
};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs::OpenOptions};

const ERROR_FILE_NOT_FOUND: u32 = 2;
const ERROR_PATH_NOT_FOUND: u32 = 3;
const ERROR_ACCESS_DENIED: u32 = 5;
const ERROR_INVALID_HANDLE: u32 = 6;
const ERROR_NOT_ENOUGH_MEMORY: u32 = 8;
const ERROR_GEN_FAILURE: u32 = 31;
const ERROR_FILE_EXISTS: u32 = 80;
const ERROR_INVALID_PARAMETER: u32 = 87;
const ERROR_BROKEN_PIPE: u32 = 109;
const ERROR_MOD_NOT_FOUND: u32 = 126;
const ERROR_PROC_NOT_FOUND: u32 = 127;
const ERROR_INVALID_ADDRESS: u32 = 487;

const GENERIC_READ: u64 = 0x8000_0000;
const GENERIC_WRITE: u64 = 0x4000_0000;

const MEM_COMMIT: u64 = 0x1000;
const MEM_RELEASE: u64 = 0x8000;

const WAIT_OBJECT_0: u64 = 0;
const WAIT_TIMEOUT: u64 = 0x102;
const WAIT_FAILED: u64 = 0xffff_ffff;

const HEAP_ZERO_MEMORY: u64 = 8;
const THREAD_STACK_SIZE: u64 = 0x10000;

/// Libraries whose exports are emulated rather than loaded from disk.
pub const EMULATED_LIBRARIES: [&str; 6] = [
    "kernel32.dll",
    "advapi32.dll",
    "msvcrt.dll",
    "ucrtbase.dll",
    "ntdll.dll",
    "user32.dll",
];

/// Lower-cased library name with a `.dll` suffix.
pub fn normalize_library(name: &str) -> String {
    let name = name.rsplit(['\\', '/']).next().unwrap_or(name).to_ascii_lowercase();
    match name.contains('.') {
        true => name,
        false => format!("{}.dll", name),
    }
}

/// First-fit allocator behind `HeapAlloc` and the libc `malloc` stubs. The
/// heap region is mapped on first use.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Eq, PartialEq)]
pub struct HeapState {
    pub base: u64,
    pub size: u64,
    next: u64,
    mapped: bool,
    /// live blocks, address -> size
    blocks: BTreeMap<u64, u64>,
    free: BTreeMap<u64, u64>,
}

impl HeapState {
    pub fn new(base: u64, size: u64) -> Self {
        Self {
            base,
            size: if size == 0 { 0x0100_0000 } else { size },
            next: base,
            ..Default::default()
        }
    }

    /// Map the heap if needed and return its base.
    pub fn ensure(&mut self, m: &mut Machine) -> Result<u64> {
        if !self.mapped {
            let placement = match self.base {
                0 => Placement::Auto { min: 0x1000_0000 },
                base => Placement::Fixed(base),
            };
            self.base = m
                .mem
                .map(placement, self.size, Permission::READ | Permission::WRITE, "[heap]")?;
            self.next = self.base;
            self.mapped = true;
        }
        Ok(self.base)
    }

    pub fn alloc(&mut self, m: &mut Machine, size: u64) -> Result<Option<u64>> {
        self.ensure(m)?;
        let size = match checked_align_up(size.max(1), 16u64) {
            Some(size) => size,
            None => return Ok(None),
        };
        let reuse = self.free.iter().find(|(_, s)| **s >= size).map(|(a, s)| (*a, *s));
        let addr = match reuse {
            Some((addr, avail)) => {
                self.free.remove(&addr);
                if avail > size {
                    self.free.insert(addr + size, avail - size);
                }
                addr
            }
            None => {
                if self.next.saturating_add(size) > self.base + self.size {
                    return Ok(None);
                }
                let addr = self.next;
                self.next += size;
                addr
            }
        };
        self.blocks.insert(addr, size);
        Ok(Some(addr))
    }

    pub fn free(&mut self, addr: u64) -> bool {
        match self.blocks.remove(&addr) {
            Some(size) => {
                self.free.insert(addr, size);
                true
            }
            None => false,
        }
    }

    pub fn block_size(&self, addr: u64) -> Option<u64> {
        self.blocks.get(&addr).copied()
    }
}

/// The first `n` arguments of the emulated function being entered.
pub(crate) fn params(k: &Kernel, m: &Machine, n: usize) -> Result<Vec<u64>> {
    (0..n).map(|i| k.cc.get_raw_param(m, i, None)).collect()
}

/// Stack slots the callee pops: stdcall on 32-bit, nothing on x64.
pub(crate) fn stdcall(k: &Kernel, nargs: usize) -> usize {
    match k.arch.pointer_size() {
        4 => nargs,
        _ => 0,
    }
}

fn last_error_for(e: Errno) -> u32 {
    match e {
        Errno::ENOENT => ERROR_FILE_NOT_FOUND,
        Errno::ENOTDIR => ERROR_PATH_NOT_FOUND,
        Errno::EACCES | Errno::EISDIR | Errno::EPERM => ERROR_ACCESS_DENIED,
        Errno::EBADF => ERROR_INVALID_HANDLE,
        Errno::ENOMEM => ERROR_NOT_ENOUGH_MEMORY,
        Errno::EEXIST => ERROR_FILE_EXISTS,
        Errno::EINVAL | Errno::EFAULT => ERROR_INVALID_PARAMETER,
        Errno::EPIPE => ERROR_BROKEN_PIPE,
        _ => ERROR_GEN_FAILURE,
    }
}

fn win_prot_to_perm(prot: u64) -> Permission {
    match prot & 0xff {
        0x02 => Permission::READ,
        0x04 | 0x08 => Permission::READ | Permission::WRITE,
        0x10 => Permission::EXEC,
        0x20 => Permission::READ | Permission::EXEC,
        0x40 | 0x80 => Permission::ALL,
        _ => Permission::NONE,
    }
}

fn perm_to_win_prot(perm: Permission) -> u64 {
    let r = perm.contains(Permission::READ);
    let w = perm.contains(Permission::WRITE);
    let x = perm.contains(Permission::EXEC);
    match (r, w, x) {
        (_, true, true) => 0x40,
        (_, true, false) => 0x04,
        (true, false, true) => 0x20,
        (false, false, true) => 0x10,
        (true, false, false) => 0x02,
        _ => 0x01,
    }
}

/// `C:\dir\file` to a guest posix path.
fn guest_path(name: &str) -> String {
    let name = match name.as_bytes() {
        [d, b':', ..] if d.is_ascii_alphabetic() => &name[2..],
        _ => name,
    };
    name.replace('\\', "/")
}

struct Api<'a> {
    k: &'a mut Kernel,
    m: &'a mut Machine,
}

impl Api<'_> {
    fn args(&self, n: usize) -> Result<Vec<u64>> {
        params(&*self.k, &*self.m, n)
    }

    fn ret(&self, value: u64, nargs: usize) -> ApiOutcome {
        ApiOutcome::ret(value, stdcall(&*self.k, nargs))
    }

    fn fail(&mut self, error: u32, value: u64, nargs: usize) -> ApiOutcome {
        self.k.state.last_error = error;
        self.ret(value, nargs)
    }

    fn invalid_handle_value(&self) -> u64 {
        self.m.arch.word_mask()
    }

    fn get_std_handle(&mut self) -> Result<ApiOutcome> {
        let p = self.args(1)?;
        let which = p[0] as u32 as i32;
        Ok(match which {
            -12..=-10 => self.ret(0x10 + (-10 - which) as u64, 1),
            _ => {
                let v = self.invalid_handle_value();
                self.fail(ERROR_INVALID_PARAMETER, v, 1)
            }
        })
    }

    fn write_file(&mut self) -> Result<ApiOutcome> {
        let p = self.args(5)?;
        let data = match self.k.read_bytes(&*self.m, p[1], p[2] & 0xffff_ffff) {
            Ok(d) => d,
            Err(e) => return Ok(self.fail(last_error_for(e), 0, 5)),
        };
        Ok(match write_object(self.k, p[0], &data) {
            Ok(n) => {
                if p[3] != 0 {
                    self.m.write_u32(p[3], n as u32)?;
                }
                self.ret(1, 5)
            }
            Err(e) => self.fail(last_error_for(e), 0, 5),
        })
    }

    fn read_file(&mut self) -> Result<ApiOutcome> {
        let p = self.args(5)?;
        Ok(match read_object(self.k, p[0], (p[2] & 0xffff_ffff) as usize) {
            Ok(Io::Done(data)) => {
                if let Err(e) = self.k.write_bytes(self.m, p[1], &data) {
                    return Ok(self.fail(last_error_for(e), 0, 5));
                }
                if p[3] != 0 {
                    self.m.write_u32(p[3], data.len() as u32)?;
                }
                self.ret(1, 5)
            }
            Ok(Io::Wait(reason)) => ApiOutcome {
                value: 0,
                cleanup: stdcall(&*self.k, 5),
                effect: Effect::Block {
                    reason,
                    restart: true,
                },
            },
            Err(Errno::EPIPE) => self.fail(ERROR_BROKEN_PIPE, 0, 5),
            Err(e) => self.fail(last_error_for(e), 0, 5),
        })
    }

    fn create_file(&mut self) -> Result<ApiOutcome> {
        let p = self.args(7)?;
        let name = read_cstring(&*self.m, p[0])?;
        let (access, disposition) = (p[1], p[4] & 0xffff_ffff);
        let readable = access & GENERIC_READ != 0 || access == 0;
        let writable = access & GENERIC_WRITE != 0;
        let path = guest_path(&name);
        let host = match crate::os::fs::FileSystem::resolve_guest_path(&self.k.fs, &self.k.state.cwd, &path) {
            Ok(h) => h,
            Err(e) => {
                let v = self.invalid_handle_value();
                return Ok(self.fail(last_error_for(e), v, 7));
            }
        };
        let mut opts = OpenOptions::new();
        opts.read(readable);
        match disposition {
            // CREATE_NEW
            1 => opts.write(true).create_new(true),
            // CREATE_ALWAYS
            2 => opts.write(true).create(true).truncate(true),
            // OPEN_ALWAYS
            4 => opts.write(true).create(true),
            // TRUNCATE_EXISTING
            5 => opts.write(true).truncate(true),
            _ => opts.write(writable),
        };
        let directory = host.is_dir();
        if !directory {
            if let Err(e) = opts.open(&host) {
                let v = self.invalid_handle_value();
                return Ok(self.fail(last_error_for(Errno::from_io(&e)), v, 7));
            }
        }
        debug!("CreateFileA({}) -> {}", name, host.display());
        let handle = self.k.state.objects.insert(EmulatedObject::File {
            guest_path: crate::os::fs::RootFs::guest_absolute(&self.k.state.cwd, &path),
            host_path: host,
            offset: 0,
            readable,
            writable,
            append: false,
            directory,
        });
        Ok(self.ret(handle, 7))
    }

    fn close_handle(&mut self) -> Result<ApiOutcome> {
        let p = self.args(1)?;
        Ok(match self.k.state.objects.remove(p[0]) {
            Some(EmulatedObject::Socket { id, .. }) => {
                if !self.k.state.objects.socket_in_use(id) {
                    self.k.host.close(id);
                }
                self.ret(1, 1)
            }
            Some(_) => self.ret(1, 1),
            None => self.fail(ERROR_INVALID_HANDLE, 0, 1),
        })
    }

    fn virtual_alloc(&mut self) -> Result<ApiOutcome> {
        let p = self.args(4)?;
        let (addr, size, kind, prot) = (p[0], p[1], p[2], p[3]);
        if size == 0 {
            return Ok(self.fail(ERROR_INVALID_PARAMETER, 0, 4));
        }
        let base = align(addr, PAGE_SIZE);
        let len = match addr.checked_add(size).and_then(|end| checked_align_up(end, PAGE_SIZE)) {
            Some(end) => end - base,
            None => return Ok(self.fail(ERROR_INVALID_PARAMETER, 0, 4)),
        };
        if addr != 0 && kind & MEM_COMMIT != 0 && self.m.is_mapped(base, len) {
            // committing reserved pages
            return Ok(self.ret(addr, 4));
        }
        let perms = win_prot_to_perm(prot);
        let placement = match addr {
            0 => Placement::Auto {
                min: self.k.state.mmap_next,
            },
            _ => Placement::Fixed(base),
        };
        Ok(match self.m.mem.map(placement, len, perms, "[VirtualAlloc]") {
            Ok(mapped) => {
                if addr == 0 {
                    self.k.state.mmap_next = self.k.state.mmap_next.max(mapped + len);
                }
                self.ret(mapped, 4)
            }
            Err(e) => {
                debug!("VirtualAlloc({:#x}, {:#x}) failed: {}", addr, size, e);
                self.fail(ERROR_INVALID_ADDRESS, 0, 4)
            }
        })
    }

    fn virtual_free(&mut self) -> Result<ApiOutcome> {
        let p = self.args(3)?;
        if p[2] & MEM_RELEASE == 0 {
            return Ok(self.ret(1, 3));
        }
        let region = self.m.mem.region_at(p[0]).map(|r| (r.base, r.size));
        Ok(match region {
            Some((base, size)) if base == p[0] => {
                self.m.mem_unmap(base, size)?;
                self.ret(1, 3)
            }
            _ => self.fail(ERROR_INVALID_ADDRESS, 0, 3),
        })
    }

    fn virtual_protect(&mut self) -> Result<ApiOutcome> {
        let p = self.args(4)?;
        let base = align(p[0], PAGE_SIZE);
        let len = match p[0].checked_add(p[1].max(1)).and_then(|end| checked_align_up(end, PAGE_SIZE)) {
            Some(end) => end - base,
            None => return Ok(self.fail(ERROR_INVALID_PARAMETER, 0, 4)),
        };
        let old = match self.m.mem.region_at(base) {
            Some(r) => perm_to_win_prot(r.perms),
            None => return Ok(self.fail(ERROR_INVALID_ADDRESS, 0, 4)),
        };
        if self.m.mprotect(base, len, win_prot_to_perm(p[2])).is_err() {
            return Ok(self.fail(ERROR_INVALID_ADDRESS, 0, 4));
        }
        if p[3] != 0 {
            self.m.write_u32(p[3], old as u32)?;
        }
        Ok(self.ret(1, 4))
    }

    fn heap_alloc(&mut self) -> Result<ApiOutcome> {
        let p = self.args(3)?;
        Ok(match self.k.state.heap.alloc(self.m, p[2])? {
            Some(addr) => {
                if p[1] & HEAP_ZERO_MEMORY != 0 {
                    let size = self.k.state.heap.block_size(addr).unwrap_or_default();
                    self.m.mem.write_raw(addr, &vec![0u8; size as usize])?;
                }
                self.ret(addr, 3)
            }
            None => self.fail(ERROR_NOT_ENOUGH_MEMORY, 0, 3),
        })
    }

    fn module_handle(&mut self, images: &ImageSet, name: &str, nargs: usize) -> ApiOutcome {
        let lib = normalize_library(name);
        if let Some(image) = images.by_name(&lib) {
            return self.ret(image.base, nargs);
        }
        if EMULATED_LIBRARIES.contains(&lib.as_str()) {
            let handle = self.k.state.stubs.library_handle(&lib);
            return self.ret(handle, nargs);
        }
        self.fail(ERROR_MOD_NOT_FOUND, 0, nargs)
    }

    fn get_proc_address(&mut self, images: &ImageSet) -> Result<ApiOutcome> {
        let p = self.args(2)?;
        if p[1] < 0x10000 {
            warn!("GetProcAddress by ordinal {} is not supported", p[1]);
            return Ok(self.fail(ERROR_PROC_NOT_FOUND, 0, 2));
        }
        let name = read_cstring(&*self.m, p[1])?;
        if let Some(image) = images.by_base(p[0]) {
            return Ok(match image.exports.get(&name) {
                Some(addr) => self.ret(*addr, 2),
                None => self.fail(ERROR_PROC_NOT_FOUND, 0, 2),
            });
        }
        let lib = self.k.state.stubs.library_for_handle(p[0]).map(str::to_string);
        Ok(match lib {
            Some(lib) => {
                let stub = self.k.state.stubs.stub_for(&lib, &name)?;
                self.ret(stub, 2)
            }
            None => self.fail(ERROR_INVALID_HANDLE, 0, 2),
        })
    }

    fn create_thread(&mut self) -> Result<ApiOutcome> {
        let p = self.args(6)?;
        let (stack_size, start, param, tid_out) = (p[1], p[2], p[3], p[5]);
        let min = self.k.state.mmap_next;
        let mapped = checked_align_up(stack_size.max(THREAD_STACK_SIZE), PAGE_SIZE).and_then(|size| {
            self.m
                .mem
                .map(Placement::Auto { min }, size, Permission::READ | Permission::WRITE, "[thread stack]")
                .ok()
                .map(|stack| (stack, size))
        });
        let (stack, size) = match mapped {
            Some(mapped) => mapped,
            None => return Ok(self.fail(ERROR_NOT_ENOUGH_MEMORY, 0, 6)),
        };
        self.k.state.mmap_next = self.k.state.mmap_next.max(stack + size);
        let exit_stub = self
            .k
            .state
            .stubs
            .stub_for(StubTable::INTERNAL, StubTable::THREAD_EXIT)?;

        let parent = self.m.save_registers()?;
        self.m.set_sp(stack + size - 0x100)?;
        self.k.cc.setup_call(self.m, start, &[param], exit_stub)?;
        let child = self.m.save_registers()?;
        self.m.restore_registers(&parent)?;

        let tid = self.k.state.threads.spawn(child, 0);
        let handle = self.k.state.objects.insert(EmulatedObject::Thread { tid });
        if tid_out != 0 {
            self.m.write_u32(tid_out, tid as u32)?;
        }
        debug!("CreateThread({:#x}, {:#x}) -> tid {}", start, param, tid);
        Ok(self.ret(handle, 6))
    }

    fn set_event(&mut self, signal: bool) -> Result<ApiOutcome> {
        let p = self.args(1)?;
        Ok(match self.k.state.objects.get_mut(p[0]) {
            Some(EmulatedObject::Event { signaled, .. }) => {
                *signaled = signal;
                self.ret(1, 1)
            }
            _ => self.fail(ERROR_INVALID_HANDLE, 0, 1),
        })
    }

    fn wait_for_single_object(&mut self) -> Result<ApiOutcome> {
        let p = self.args(2)?;
        let (handle, timeout) = (p[0], p[1] & 0xffff_ffff);
        let reason = match self.k.state.objects.get(handle).cloned() {
            Some(EmulatedObject::Event {
                manual_reset,
                signaled: true,
            }) => {
                if !manual_reset {
                    if let Some(EmulatedObject::Event { signaled, .. }) = self.k.state.objects.get_mut(handle) {
                        *signaled = false;
                    }
                }
                return Ok(self.ret(WAIT_OBJECT_0, 2));
            }
            Some(EmulatedObject::Event { .. }) => WaitReason::Event { handle },
            Some(EmulatedObject::Thread { tid }) => {
                let done = self.k.state.threads.get(tid).map(|t| t.is_exited()).unwrap_or(true);
                if done {
                    return Ok(self.ret(WAIT_OBJECT_0, 2));
                }
                WaitReason::Join { tid }
            }
            _ => return Ok(self.fail(ERROR_INVALID_HANDLE, WAIT_FAILED, 2)),
        };
        if timeout == 0 {
            return Ok(self.ret(WAIT_TIMEOUT, 2));
        }
        Ok(ApiOutcome {
            value: 0,
            cleanup: stdcall(&*self.k, 2),
            effect: Effect::Block {
                reason,
                restart: true,
            },
        })
    }
}

/// kernel32 and advapi32 functions; `None` for symbols not emulated here.
pub(crate) fn call(
    k: &mut Kernel,
    m: &mut Machine,
    images: &ImageSet,
    library: &str,
    symbol: &str,
) -> Result<Option<ApiOutcome>> {
    if let Some(out) = registry::call(k, m, symbol)? {
        return Ok(Some(out));
    }
    let mut api = Api { k, m };
    let out = match symbol {
        "ExitProcess" => {
            let p = api.args(1)?;
            ApiOutcome {
                value: 0,
                cleanup: stdcall(&*api.k, 1),
                effect: Effect::ExitProcess(p[0] & 0xffff_ffff),
            }
        }
        "ExitThread" => {
            let p = api.args(1)?;
            ApiOutcome {
                value: 0,
                cleanup: stdcall(&*api.k, 1),
                effect: Effect::ExitThread(p[0] & 0xffff_ffff),
            }
        }
        "GetStdHandle" => api.get_std_handle()?,
        "WriteFile" => api.write_file()?,
        "ReadFile" => api.read_file()?,
        "CreateFileA" => api.create_file()?,
        "CloseHandle" => api.close_handle()?,
        "GetLastError" => api.ret(api.k.state.last_error as u64, 0),
        "SetLastError" => {
            let p = api.args(1)?;
            api.k.state.last_error = p[0] as u32;
            api.ret(0, 1)
        }
        "VirtualAlloc" => api.virtual_alloc()?,
        "VirtualFree" => api.virtual_free()?,
        "VirtualProtect" => api.virtual_protect()?,
        "GetProcessHeap" => {
            let heap = api.k.state.heap.ensure(api.m)?;
            api.ret(heap, 0)
        }
        "HeapAlloc" => api.heap_alloc()?,
        "HeapFree" => {
            let p = api.args(3)?;
            match api.k.state.heap.free(p[2]) {
                true => api.ret(1, 3),
                false => api.fail(ERROR_INVALID_PARAMETER, 0, 3),
            }
        }
        "GetModuleHandleA" => {
            let p = api.args(1)?;
            match p[0] {
                0 => {
                    let base = images.main().map(|i| i.base).unwrap_or_default();
                    api.ret(base, 1)
                }
                addr => {
                    let name = read_cstring(&*api.m, addr)?;
                    api.module_handle(images, &name, 1)
                }
            }
        }
        "LoadLibraryA" => {
            let p = api.args(1)?;
            let name = read_cstring(&*api.m, p[0])?;
            api.module_handle(images, &name, 1)
        }
        "GetProcAddress" => api.get_proc_address(images)?,
        "Sleep" => {
            let p = api.args(1)?;
            let until_ns = api.k.state.clock.now_ns().saturating_add((p[0] & 0xffff_ffff) * 1_000_000);
            ApiOutcome {
                value: 0,
                cleanup: stdcall(&*api.k, 1),
                effect: Effect::Block {
                    reason: WaitReason::Sleep { until_ns },
                    restart: false,
                },
            }
        }
        "GetTickCount" => {
            let ms = api.k.state.clock.uptime_ns() / 1_000_000;
            api.ret(ms & 0xffff_ffff, 0)
        }
        "GetCurrentProcessId" => api.ret(GUEST_PID, 0),
        "GetCurrentThreadId" => api.ret(api.k.current_tid(), 0),
        "CreateThread" => api.create_thread()?,
        "CreateEventA" => {
            let p = api.args(4)?;
            let handle = api.k.state.objects.insert(EmulatedObject::Event {
                manual_reset: p[1] & 0xff != 0,
                signaled: p[2] & 0xff != 0,
            });
            api.ret(handle, 4)
        }
        "SetEvent" => api.set_event(true)?,
        "ResetEvent" => api.set_event(false)?,
        "WaitForSingleObject" => api.wait_for_single_object()?,
        _ => return Ok(None),
    };
    debug!(
        "{}!{} -> {:#x} pc: {:#x}",
        library,
        symbol,
        out.value,
        api.m.pc().unwrap_or_default()
    );
    Ok(Some(out))
}
