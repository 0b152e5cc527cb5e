pub mod bsd;
pub mod clock;
pub mod fs;
pub mod linux;
pub mod objects;
pub mod posix;
pub mod syscall;
pub mod thread;
pub mod windows;

use crate::{
    arch::{ArchType, RegisterMips},
    cc::{CallingConventionCommon, SyscallAbi},
    config::{EmuConfig, MemoryLayout, PolicyConfig},
    engine::{Machine, Trap},
    errors::{EmulatorError, Result},
    loader::{ImageSet, StubTable},
    memory::Memory,
    registers::Registers,
};
use clock::{DeterministicRng, VirtualClock};
use fs::RootFs;
use log::{debug, info, warn};
use objects::{EmulatedObject, HostHandles, ObjectTable};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    io::Write,
    str::FromStr,
};
use strum::{Display, EnumString};
use syscall::SysCalls;
use thread::{Scheduler, ThreadStatus, WaitReason};
use windows::{registry::Registry, HeapState};

#[derive(
    Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OsType {
    Linux,
    FreeBSD,
    MacOS,
    Windows,
}

/// What to do with a syscall number no handler knows.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnknownSyscallPolicy {
    /// log and return 0
    #[default]
    Ignore,
    Strict,
}

/// What to do when the guest calls an import nothing provides.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnresolvedSymbolPolicy {
    /// log and return 0
    Permissive,
    #[default]
    Strict,
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StdioMode {
    #[default]
    Inherit,
    Capture,
}

/// pid of the guest process, also the tid of its main thread.
pub const GUEST_PID: u64 = 1000;
pub const GUEST_UID: u64 = 1000;
/// Most bytes one host read on a stream pulls in; stream reads may be short.
pub(crate) const IO_CHUNK: usize = 0x10000;

/// Guest-visible error numbers; the value written back depends on the target.
#[allow(clippy::upper_case_acronyms)]
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Display)]
pub enum Errno {
    EPERM,
    ENOENT,
    ESRCH,
    EINTR,
    EIO,
    EBADF,
    ECHILD,
    EAGAIN,
    ENOMEM,
    EACCES,
    EFAULT,
    EEXIST,
    ENOTDIR,
    EISDIR,
    EINVAL,
    EMFILE,
    ENOTTY,
    ESPIPE,
    EPIPE,
    ERANGE,
    ENOSYS,
    ENOTSOCK,
    EAFNOSUPPORT,
    EADDRINUSE,
    ENOTCONN,
    ETIMEDOUT,
    ECONNREFUSED,
}

impl Errno {
    pub fn code(self, os: OsType, arch: ArchType) -> u64 {
        use Errno::*;
        let generic = match self {
            EPERM => 1,
            ENOENT => 2,
            ESRCH => 3,
            EINTR => 4,
            EIO => 5,
            EBADF => 9,
            ECHILD => 10,
            EAGAIN => 11,
            ENOMEM => 12,
            EACCES => 13,
            EFAULT => 14,
            EEXIST => 17,
            ENOTDIR => 20,
            EISDIR => 21,
            EINVAL => 22,
            EMFILE => 24,
            ENOTTY => 25,
            ESPIPE => 29,
            EPIPE => 32,
            ERANGE => 34,
            ENOSYS => 38,
            ENOTSOCK => 88,
            EAFNOSUPPORT => 97,
            EADDRINUSE => 98,
            ENOTCONN => 107,
            ETIMEDOUT => 110,
            ECONNREFUSED => 111,
        };
        match (os, arch) {
            (OsType::Linux, ArchType::Mips) => match self {
                ENOSYS => 89,
                ENOTSOCK => 95,
                EAFNOSUPPORT => 124,
                EADDRINUSE => 125,
                ENOTCONN => 134,
                ETIMEDOUT => 145,
                ECONNREFUSED => 146,
                _ => generic,
            },
            (OsType::FreeBSD | OsType::MacOS, _) => match self {
                EAGAIN => 35,
                ENOSYS => 78,
                ENOTSOCK => 38,
                EAFNOSUPPORT => 47,
                EADDRINUSE => 48,
                ENOTCONN => 57,
                ETIMEDOUT => 60,
                ECONNREFUSED => 61,
                _ => generic,
            },
            _ => generic,
        }
    }

    pub fn from_io(e: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => Errno::ENOENT,
            ErrorKind::PermissionDenied => Errno::EACCES,
            ErrorKind::AlreadyExists => Errno::EEXIST,
            ErrorKind::WouldBlock => Errno::EAGAIN,
            ErrorKind::InvalidInput => Errno::EINVAL,
            ErrorKind::BrokenPipe => Errno::EPIPE,
            ErrorKind::ConnectionRefused => Errno::ECONNREFUSED,
            ErrorKind::NotConnected => Errno::ENOTCONN,
            ErrorKind::AddrInUse => Errno::EADDRINUSE,
            ErrorKind::TimedOut => Errno::ETIMEDOUT,
            ErrorKind::Interrupted => Errno::EINTR,
            _ => match e.raw_os_error() {
                Some(20) => Errno::ENOTDIR,
                Some(21) => Errno::EISDIR,
                Some(9) => Errno::EBADF,
                _ => Errno::EIO,
            },
        }
    }
}

impl From<EmulatorError> for Errno {
    fn from(e: EmulatorError) -> Self {
        match e {
            EmulatorError::AccessViolation { .. } => Errno::EFAULT,
            EmulatorError::OutOfSpace { .. } => Errno::ENOMEM,
            EmulatorError::Io(e) => Errno::from_io(&e),
            _ => Errno::EINVAL,
        }
    }
}

impl From<std::io::Error> for Errno {
    fn from(e: std::io::Error) -> Self {
        Errno::from_io(&e)
    }
}

/// Scheduling side effect of a syscall or api call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Effect {
    None,
    ExitProcess(u64),
    ExitThread(u64),
    /// Suspend the calling thread. With `restart` the call is re-issued once
    /// the thread wakes, otherwise it completes with the outcome's value.
    Block { reason: WaitReason, restart: bool },
    Yield,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Outcome {
    pub value: std::result::Result<u64, Errno>,
    pub effect: Effect,
}

impl Outcome {
    pub fn ok(value: u64) -> Self {
        Self {
            value: Ok(value),
            effect: Effect::None,
        }
    }

    pub fn err(errno: Errno) -> Self {
        Self {
            value: Err(errno),
            effect: Effect::None,
        }
    }

    pub fn with_effect(value: u64, effect: Effect) -> Self {
        Self {
            value: Ok(value),
            effect,
        }
    }

    /// Wait on `reason`, then run the call again.
    pub fn retry_after(reason: WaitReason) -> Self {
        Self::with_effect(
            0,
            Effect::Block {
                reason,
                restart: true,
            },
        )
    }
}

pub type SysOutcome = std::result::Result<Outcome, Errno>;

/// Result of an emulated library function.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApiOutcome {
    pub value: u64,
    /// argument slots the callee pops (stdcall).
    pub cleanup: usize,
    pub effect: Effect,
}

impl ApiOutcome {
    pub fn ret(value: u64, cleanup: usize) -> Self {
        Self {
            value,
            cleanup,
            effect: Effect::None,
        }
    }
}

/// The serialisable part of the emulated OS, captured by checkpoints.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KernelState {
    pub objects: ObjectTable,
    pub threads: Scheduler,
    pub clock: VirtualClock,
    pub rng: DeterministicRng,
    pub stubs: StubTable,
    pub brk_start: u64,
    pub brk: u64,
    pub mmap_next: u64,
    /// signal number -> raw sigaction words, recorded only
    pub sigactions: BTreeMap<u64, Vec<u64>>,
    pub cwd: String,
    pub exe_path: String,
    pub exit_code: Option<u64>,
    pub last_error: u32,
    pub registry: Registry,
    pub heap: HeapState,
    #[serde(with = "hex::serde")]
    pub stdout: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub stderr: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub stdin: Vec<u8>,
    pub stdin_pos: usize,
}

/// Per-session OS emulation: syscall/api dispatch over the guest's objects,
/// threads and files.
pub struct Kernel {
    pub os: OsType,
    pub arch: ArchType,
    abi: Option<SyscallAbi>,
    pub cc: CallingConventionCommon,
    pub policy: PolicyConfig,
    pub layout: MemoryLayout,
    pub fs: RootFs,
    pub stdio: StdioMode,
    pub env: BTreeMap<String, String>,
    pub state: KernelState,
    pub host: HostHandles,
}

impl Kernel {
    pub fn new(
        os: OsType,
        arch: ArchType,
        config: &EmuConfig,
        layout: MemoryLayout,
        exe_path: &str,
    ) -> Result<Self> {
        let abi = match os {
            OsType::Windows => None,
            _ => Some(SyscallAbi::for_target(os, arch)?),
        };
        let objects = match os {
            OsType::Windows => ObjectTable::with_stdio(0x10, 0x10),
            _ => ObjectTable::with_stdio(0, 0),
        };
        let rootfs = config
            .rootfs
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        let state = KernelState {
            objects,
            threads: Scheduler::new(GUEST_PID),
            clock: VirtualClock::new(config.clock_base),
            rng: DeterministicRng::new(config.random_seed),
            stubs: StubTable::new(layout.stub_address, arch.pointer_size()),
            brk_start: 0,
            brk: 0,
            mmap_next: layout.mmap_address,
            sigactions: BTreeMap::new(),
            cwd: RootFs::guest_absolute("/", &config.cwd),
            exe_path: exe_path.to_string(),
            exit_code: None,
            last_error: 0,
            registry: Registry::from_config(&config.registry),
            heap: HeapState::new(layout.heap_address, layout.heap_size),
            stdout: vec![],
            stderr: vec![],
            stdin: vec![],
            stdin_pos: 0,
        };
        Ok(Self {
            os,
            arch,
            abi,
            cc: CallingConventionCommon::native(arch, os),
            policy: config.policy,
            layout,
            fs: RootFs::new(rootfs),
            stdio: config.stdio,
            env: config.env.clone(),
            state,
            host: HostHandles::default(),
        })
    }

    pub fn syscall_abi(&self) -> Result<&SyscallAbi> {
        self.abi.as_ref().ok_or_else(|| {
            EmulatorError::UnsupportedFormat(format!("{} has no raw syscall interface", self.os))
        })
    }

    /// Software interrupt the arch uses for syscalls.
    pub fn syscall_interrupt(&self) -> u32 {
        match self.arch {
            ArchType::X86 | ArchType::X8664 => 0x80,
            ArchType::Mips => 17,
            ArchType::Arm | ArchType::Arm64 => 2,
            ArchType::Riscv64 => 8,
        }
    }

    pub fn is_syscall_trap(&self, trap: &Trap) -> bool {
        if self.abi.is_none() {
            return false;
        }
        match trap {
            Trap::Syscall => true,
            Trap::Interrupt(n) => *n == self.syscall_interrupt(),
            Trap::Exception(_) => false,
        }
    }

    /// Length of the trapping instruction, to re-issue a restarted call.
    pub fn syscall_insn_len(&self) -> u64 {
        match self.arch {
            ArchType::X86 | ArchType::X8664 => 2,
            _ => 4,
        }
    }

    pub fn set_brk(&mut self, start: u64) {
        self.state.brk_start = start;
        self.state.brk = start;
    }

    pub fn exit_code(&self) -> Option<u64> {
        self.state.exit_code
    }

    pub fn current_tid(&self) -> u64 {
        self.state.threads.current()
    }

    pub fn captured_stdout(&self) -> &[u8] {
        &self.state.stdout
    }

    pub fn captured_stderr(&self) -> &[u8] {
        &self.state.stderr
    }

    /// Bytes served to guest reads of stdin in capture mode.
    pub fn push_stdin(&mut self, data: &[u8]) {
        self.state.stdin.extend_from_slice(data);
    }

    pub(crate) fn write_stdio(&mut self, stream: u8, data: &[u8]) -> std::result::Result<(), Errno> {
        match (self.stdio, stream) {
            (StdioMode::Capture, 2) => self.state.stderr.extend_from_slice(data),
            (StdioMode::Capture, _) => self.state.stdout.extend_from_slice(data),
            (StdioMode::Inherit, 2) => {
                let mut err = std::io::stderr();
                err.write_all(data)?;
                err.flush()?;
            }
            (StdioMode::Inherit, _) => {
                let mut out = std::io::stdout();
                out.write_all(data)?;
                out.flush()?;
            }
        }
        Ok(())
    }

    pub(crate) fn read_stdin(&mut self, len: usize) -> std::result::Result<Vec<u8>, Errno> {
        match self.stdio {
            StdioMode::Capture => {
                let start = self.state.stdin_pos.min(self.state.stdin.len());
                let end = start.saturating_add(len).min(self.state.stdin.len());
                self.state.stdin_pos = end;
                Ok(self.state.stdin[start..end].to_vec())
            }
            StdioMode::Inherit => {
                use std::io::Read;
                let mut buf = vec![0u8; len.min(IO_CHUNK)];
                let n = std::io::stdin().read(&mut buf)?;
                buf.truncate(n);
                Ok(buf)
            }
        }
    }

    /// Run the handler for syscall `number`.
    ///
    /// Guest-visible failures come back as an errno in the outcome; an `Err`
    /// only for the strict unknown-syscall policy or an emulator failure.
    pub fn handle_syscall(&mut self, m: &mut Machine, number: u64, args: &[u64]) -> Result<Outcome> {
        let name = syscall::syscall_name(self.os, self.arch, number);
        let call = match name.map(SysCalls::from_str) {
            Some(Ok(call)) => call,
            _ => return self.unknown_syscall(m, number),
        };
        let outcome = match self.os {
            OsType::FreeBSD | OsType::MacOS => match bsd::dispatch(self, m, call, args) {
                Some(r) => r,
                None => posix::dispatch(self, m, call, args),
            },
            _ => match linux::dispatch(self, m, call, args) {
                Some(r) => r,
                None => posix::dispatch(self, m, call, args),
            },
        };
        let outcome = match outcome {
            Ok(o) => o,
            Err(errno) => Outcome::err(errno),
        };
        debug!(
            "{}({}) = {:?} pc: {:#x}",
            name.unwrap_or_default(),
            args.iter()
                .map(|a| format!("{:#x}", a))
                .collect::<Vec<_>>()
                .join(", "),
            outcome.value,
            m.pc().unwrap_or_default()
        );
        Ok(outcome)
    }

    fn unknown_syscall(&mut self, m: &Machine, number: u64) -> Result<Outcome> {
        match self.policy.unknown_syscall {
            UnknownSyscallPolicy::Ignore => {
                warn!(
                    "ignoring unknown syscall {} pc: {:#x}",
                    number,
                    m.pc().unwrap_or_default()
                );
                Ok(Outcome::ok(0))
            }
            UnknownSyscallPolicy::Strict => Err(EmulatorError::NotImplementedSyscall {
                os: self.os.to_string(),
                number,
            }),
        }
    }

    /// Run the emulated library function behind a stub. `None` when nothing
    /// implements `library!symbol`.
    pub fn call_api(
        &mut self,
        m: &mut Machine,
        images: &ImageSet,
        library: &str,
        symbol: &str,
    ) -> Result<Option<ApiOutcome>> {
        if library == StubTable::INTERNAL {
            let code = self.cc.get_return_value(m)?;
            return Ok(match symbol {
                StubTable::PROCESS_EXIT => Some(ApiOutcome {
                    value: code,
                    cleanup: 0,
                    effect: Effect::ExitProcess(code),
                }),
                StubTable::THREAD_EXIT => Some(ApiOutcome {
                    value: code,
                    cleanup: 0,
                    effect: Effect::ExitThread(code),
                }),
                _ => None,
            });
        }
        if let Some(outcome) = windows::libc::call(self, m, symbol)? {
            return Ok(Some(outcome));
        }
        match self.os {
            OsType::Windows => windows::call(self, m, images, library, symbol),
            _ => Ok(None),
        }
    }

    /// Make threads runnable whose wait has finished.
    pub fn wake_threads(&mut self) {
        let now = self.state.clock.now_ns();
        let objects = &self.state.objects;
        let mut consumed = BTreeSet::new();
        self.state.threads.wake_ready(|reason, statuses| match reason {
            WaitReason::Futex { .. } => false,
            WaitReason::Sleep { until_ns } => now >= *until_ns,
            WaitReason::Join { tid } => !matches!(
                statuses.get(tid),
                Some(ThreadStatus::Runnable | ThreadStatus::Blocked { .. })
            ),
            WaitReason::Pipe { id } => objects.pipe_ready(*id),
            WaitReason::Event { handle } => match objects.get(*handle) {
                Some(EmulatedObject::Event {
                    manual_reset,
                    signaled: true,
                }) => {
                    // an auto-reset event releases a single waiter, whose
                    // restarted wait resets it
                    *manual_reset || consumed.insert(*handle)
                }
                Some(EmulatedObject::Event { .. }) => false,
                _ => true,
            },
        });
    }

    /// Put thread `tid` on the cpu.
    pub fn switch_to(&mut self, m: &mut Machine, tid: u64) -> Result<()> {
        let current = self.state.threads.current();
        if current == tid {
            return Ok(());
        }
        let regs = m.save_registers()?;
        if let Some(t) = self.state.threads.get_mut(current) {
            t.regs = regs;
        }
        let next = self
            .state
            .threads
            .get(tid)
            .ok_or_else(|| EmulatorError::InvalidState(format!("no thread {}", tid)))?
            .regs
            .clone();
        m.restore_registers(&next)?;
        self.state.threads.set_current(tid);
        debug!("switch thread {} -> {}", current, tid);
        Ok(())
    }

    /// Pick the next thread to run after a block, exit or yield. When only
    /// sleepers remain the clock skips to the earliest wake-up. Returns false
    /// when no thread can ever run again.
    pub fn schedule(&mut self, m: &mut Machine) -> Result<bool> {
        loop {
            self.wake_threads();
            if let Some(tid) = self.state.threads.next_runnable() {
                self.switch_to(m, tid)?;
                return Ok(true);
            }
            match self.state.threads.earliest_sleeper() {
                Some(until) => self.state.clock.advance_to(until),
                None => return Ok(false),
            }
        }
    }

    /// Time-slice: hand the cpu to the next runnable thread, if any.
    pub fn preempt(&mut self, m: &mut Machine) -> Result<()> {
        self.wake_threads();
        if self.state.threads.runnable_count() > 1 {
            if let Some(tid) = self.state.threads.next_runnable() {
                self.switch_to(m, tid)?;
            }
        }
        Ok(())
    }

    /// Terminate the current thread. Returns true if that ended the process.
    pub fn exit_thread(&mut self, m: &mut Machine, code: u64) -> Result<bool> {
        let tid = self.state.threads.current();
        let clear_child_tid = self
            .state
            .threads
            .get(tid)
            .map(|t| t.clear_child_tid)
            .unwrap_or_default();
        self.state.threads.exit(tid, code);
        debug!("thread {} exits with {}", tid, code);
        if clear_child_tid != 0 {
            if m.write_u32(clear_child_tid, 0).is_ok() {
                self.state.threads.futex_wake(clear_child_tid, u64::MAX);
            }
        }
        if self.state.threads.live_count() == 0 {
            self.exit_process(code);
            return Ok(true);
        }
        Ok(false)
    }

    /// Process exit: every thread stops and every object is released.
    pub fn exit_process(&mut self, code: u64) {
        info!("process exits with code {}", code);
        self.state.exit_code = Some(code);
        let tids: Vec<u64> = self.state.threads.threads().map(|t| t.tid).collect();
        for tid in tids {
            if !self.state.threads.get(tid).map(|t| t.is_exited()).unwrap_or(true) {
                self.state.threads.exit(tid, code);
            }
        }
        self.release_objects();
    }

    fn release_objects(&mut self) {
        self.state.objects.clear();
        self.host.clear();
    }

    /// Swap in a checkpointed state; host sockets no descriptor refers to any
    /// more are closed.
    pub fn restore_state(&mut self, state: KernelState) {
        self.state = state;
        let live: Vec<u64> = self
            .host
            .listeners
            .keys()
            .chain(self.host.streams.keys())
            .chain(self.host.bound.keys())
            .copied()
            .filter(|id| !self.state.objects.socket_in_use(*id))
            .collect();
        for id in live {
            self.host.close(id);
        }
    }

    /// Release every emulated object, used at session teardown.
    pub fn teardown(&mut self) {
        self.release_objects();
    }

    /// Write the second return register some targets use (pipe on MIPS).
    pub(crate) fn set_second_result(&self, m: &mut Machine, value: u64) -> Result<()> {
        match (self.os, self.arch) {
            (OsType::Linux, ArchType::Mips) => Registers::write(m, RegisterMips::V1, value),
            (OsType::MacOS | OsType::FreeBSD, ArchType::X8664) => {
                Registers::write(m, crate::arch::RegisterX8664::RDX, value)
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn read_bytes(&self, m: &Machine, addr: u64, len: u64) -> std::result::Result<Vec<u8>, Errno> {
        if len == 0 {
            return Ok(vec![]);
        }
        Ok(Memory::read(m, addr, len as usize)?)
    }

    pub(crate) fn write_bytes(&self, m: &mut Machine, addr: u64, data: &[u8]) -> std::result::Result<(), Errno> {
        if data.is_empty() {
            return Ok(());
        }
        Ok(Memory::write(m, addr, data)?)
    }
}
