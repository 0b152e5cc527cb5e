use crate::{
    controller::FaultKind,
    engine::{Bus, CpuException, Machine},
    errors::{EmulatorError, Result},
    memory::{Access, AddressSpace, Permission},
};
use log::trace;
use serde::{Deserialize, Serialize};
use std::ops::Range;

pub type HookId = u64;

/// What a callback asks the run loop to do next.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HookAction {
    Continue,
    /// Stop the run with `Stopped(HookRequest)`.
    Stop,
    Pause,
    /// Unregister this hook after the current event.
    Remove,
}

impl HookAction {
    fn rank(self) -> u8 {
        match self {
            HookAction::Continue | HookAction::Remove => 0,
            HookAction::Pause => 1,
            HookAction::Stop => 2,
        }
    }

    /// The stronger of two requests; `Remove` counts as `Continue`.
    pub fn merge(self, other: HookAction) -> HookAction {
        let (a, b) = (self.normalize(), other.normalize());
        if b.rank() > a.rank() {
            b
        } else {
            a
        }
    }

    fn normalize(self) -> HookAction {
        match self {
            HookAction::Remove => HookAction::Continue,
            other => other,
        }
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    Code,
    Block,
    MemRead,
    MemWrite,
    SyscallEnter,
    SyscallExit,
    Interrupt,
    Exception,
    Api,
}

/// A guest memory access seen by memory hooks.
///
/// Write hooks run before the bytes are committed and may veto the write or
/// replace `data`. Read hooks run after the read.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemAccess {
    pub pc: u64,
    pub address: u64,
    pub access: Access,
    pub data: Vec<u8>,
    pub vetoed: bool,
}

/// errno on failure.
pub type SysResult = std::result::Result<u64, u64>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyscallEvent {
    pub number: u64,
    pub name: Option<String>,
    pub args: Vec<u64>,
    /// Set by an enter hook to skip the emulated handler.
    pub result: Option<SysResult>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceptionEvent {
    pub exception: CpuException,
    /// Set by a hook that repaired the state; execution resumes at pc.
    pub handled: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ApiCall {
    pub library: String,
    pub symbol: String,
    pub address: u64,
    /// Set by a hook to return this value without running the function.
    pub result: Option<u64>,
}

pub type CodeCallback = Box<dyn FnMut(&mut Machine, u64) -> HookAction>;
pub type MemCallback = Box<dyn FnMut(&mut MemAccess) -> HookAction>;
pub type SyscallCallback = Box<dyn FnMut(&mut Machine, &mut SyscallEvent) -> HookAction>;
pub type InterruptCallback = Box<dyn FnMut(&mut Machine, u32) -> HookAction>;
pub type ExceptionCallback = Box<dyn FnMut(&mut Machine, &mut ExceptionEvent) -> HookAction>;
pub type ApiCallback = Box<dyn FnMut(&mut Machine, &mut ApiCall) -> HookAction>;

enum Callback {
    Code(CodeCallback),
    Block(CodeCallback),
    MemRead(MemCallback),
    MemWrite(MemCallback),
    SyscallEnter(SyscallCallback),
    SyscallExit(SyscallCallback),
    Interrupt(InterruptCallback),
    Exception(ExceptionCallback),
    Api(ApiCallback),
}

impl Callback {
    fn kind(&self) -> HookKind {
        match self {
            Callback::Code(_) => HookKind::Code,
            Callback::Block(_) => HookKind::Block,
            Callback::MemRead(_) => HookKind::MemRead,
            Callback::MemWrite(_) => HookKind::MemWrite,
            Callback::SyscallEnter(_) => HookKind::SyscallEnter,
            Callback::SyscallExit(_) => HookKind::SyscallExit,
            Callback::Interrupt(_) => HookKind::Interrupt,
            Callback::Exception(_) => HookKind::Exception,
            Callback::Api(_) => HookKind::Api,
        }
    }
}

/// When a hook applies.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HookCondition {
    Always,
    Range(Range<u64>),
    Syscall(u64),
    Interrupt(u32),
    Fault(FaultKind),
}

impl HookCondition {
    /// `[begin, end)`, or everything when `begin >= end`.
    pub fn range(begin: u64, end: u64) -> Self {
        if begin >= end {
            HookCondition::Always
        } else {
            HookCondition::Range(begin..end)
        }
    }

    fn covers(&self, addr: u64, len: u64) -> bool {
        match self {
            HookCondition::Always => true,
            HookCondition::Range(r) => addr < r.end && addr.saturating_add(len.max(1)) > r.start,
            _ => false,
        }
    }
}

struct HookEntry {
    id: HookId,
    condition: HookCondition,
    callback: Callback,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct HookDescription {
    pub id: HookId,
    pub kind: HookKind,
}

/// Registered instrumentation. Hooks of one kind fire in registration order.
#[derive(Default)]
pub struct HookRegistry {
    entries: Vec<HookEntry>,
    next_id: HookId,
    /// strongest action requested by memory hooks during the current step.
    pending: Option<HookAction>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            entries: vec![],
            next_id: 1,
            pending: None,
        }
    }

    fn add(&mut self, condition: HookCondition, callback: Callback) -> HookId {
        let id = self.next_id;
        self.next_id += 1;
        trace!("add {:?} hook {} {:?}", callback.kind(), id, condition);
        self.entries.push(HookEntry {
            id,
            condition,
            callback,
        });
        id
    }

    pub fn add_code_hook(
        &mut self,
        begin: u64,
        end: u64,
        callback: impl FnMut(&mut Machine, u64) -> HookAction + 'static,
    ) -> HookId {
        self.add(
            HookCondition::range(begin, end),
            Callback::Code(Box::new(callback)),
        )
    }

    pub fn add_block_hook(
        &mut self,
        begin: u64,
        end: u64,
        callback: impl FnMut(&mut Machine, u64) -> HookAction + 'static,
    ) -> HookId {
        self.add(
            HookCondition::range(begin, end),
            Callback::Block(Box::new(callback)),
        )
    }

    pub fn add_mem_read_hook(
        &mut self,
        begin: u64,
        end: u64,
        callback: impl FnMut(&mut MemAccess) -> HookAction + 'static,
    ) -> HookId {
        self.add(
            HookCondition::range(begin, end),
            Callback::MemRead(Box::new(callback)),
        )
    }

    pub fn add_mem_write_hook(
        &mut self,
        begin: u64,
        end: u64,
        callback: impl FnMut(&mut MemAccess) -> HookAction + 'static,
    ) -> HookId {
        self.add(
            HookCondition::range(begin, end),
            Callback::MemWrite(Box::new(callback)),
        )
    }

    /// `number` None hooks every syscall.
    pub fn add_syscall_enter_hook(
        &mut self,
        number: Option<u64>,
        callback: impl FnMut(&mut Machine, &mut SyscallEvent) -> HookAction + 'static,
    ) -> HookId {
        let condition = number.map_or(HookCondition::Always, HookCondition::Syscall);
        self.add(condition, Callback::SyscallEnter(Box::new(callback)))
    }

    pub fn add_syscall_exit_hook(
        &mut self,
        number: Option<u64>,
        callback: impl FnMut(&mut Machine, &mut SyscallEvent) -> HookAction + 'static,
    ) -> HookId {
        let condition = number.map_or(HookCondition::Always, HookCondition::Syscall);
        self.add(condition, Callback::SyscallExit(Box::new(callback)))
    }

    pub fn add_intr_hook(
        &mut self,
        number: Option<u32>,
        callback: impl FnMut(&mut Machine, u32) -> HookAction + 'static,
    ) -> HookId {
        let condition = number.map_or(HookCondition::Always, HookCondition::Interrupt);
        self.add(condition, Callback::Interrupt(Box::new(callback)))
    }

    pub fn add_exception_hook(
        &mut self,
        kind: Option<FaultKind>,
        callback: impl FnMut(&mut Machine, &mut ExceptionEvent) -> HookAction + 'static,
    ) -> HookId {
        let condition = kind.map_or(HookCondition::Always, HookCondition::Fault);
        self.add(condition, Callback::Exception(Box::new(callback)))
    }

    /// Hook calls reaching `address`, an export or an import stub.
    pub fn add_api_hook(
        &mut self,
        address: u64,
        callback: impl FnMut(&mut Machine, &mut ApiCall) -> HookAction + 'static,
    ) -> HookId {
        self.add(
            HookCondition::Range(address..address + 1),
            Callback::Api(Box::new(callback)),
        )
    }

    pub fn remove_hook(&mut self, id: HookId) -> Result<()> {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        if self.entries.len() == before {
            return Err(EmulatorError::InvalidState(format!("no hook {}", id)));
        }
        trace!("removed hook {}", id);
        Ok(())
    }

    pub fn list(&self) -> Vec<HookDescription> {
        self.entries
            .iter()
            .map(|e| HookDescription {
                id: e.id,
                kind: e.callback.kind(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn has(&self, kind: HookKind) -> bool {
        self.entries.iter().any(|e| e.callback.kind() == kind)
    }

    /// Instruction-level hooks force single stepping.
    pub fn needs_stepping(&self) -> bool {
        self.entries.iter().any(|e| {
            matches!(
                e.callback.kind(),
                HookKind::Code | HookKind::Block | HookKind::MemRead | HookKind::MemWrite
            )
        })
    }

    pub fn has_block_hooks(&self) -> bool {
        self.has(HookKind::Block)
    }

    /// Addresses the batch runner must stop at so api hooks can fire.
    pub fn api_addresses(&self) -> Vec<u64> {
        self.entries
            .iter()
            .filter_map(|e| match (&e.callback, &e.condition) {
                (Callback::Api(_), HookCondition::Range(r)) => Some(r.start),
                _ => None,
            })
            .collect()
    }

    /// Run matching callbacks in registration order, drop those that asked
    /// for removal, and return the strongest requested action.
    fn dispatch(
        &mut self,
        matches: impl Fn(&HookCondition, &Callback) -> bool,
        mut call: impl FnMut(&mut Callback) -> HookAction,
    ) -> HookAction {
        let mut action = HookAction::Continue;
        let mut removed = vec![];
        for entry in self.entries.iter_mut() {
            if !matches(&entry.condition, &entry.callback) {
                continue;
            }
            let a = call(&mut entry.callback);
            if a == HookAction::Remove {
                removed.push(entry.id);
            }
            action = action.merge(a);
        }
        if !removed.is_empty() {
            self.entries.retain(|e| !removed.contains(&e.id));
        }
        action
    }

    pub fn fire_code(&mut self, machine: &mut Machine, pc: u64) -> HookAction {
        self.dispatch(
            |cond, cb| matches!(cb, Callback::Code(_)) && cond.covers(pc, 1),
            |cb| match cb {
                Callback::Code(f) => f(machine, pc),
                _ => HookAction::Continue,
            },
        )
    }

    pub fn fire_block(&mut self, machine: &mut Machine, pc: u64) -> HookAction {
        self.dispatch(
            |cond, cb| matches!(cb, Callback::Block(_)) && cond.covers(pc, 1),
            |cb| match cb {
                Callback::Block(f) => f(machine, pc),
                _ => HookAction::Continue,
            },
        )
    }

    pub fn has_api_hook(&self, address: u64) -> bool {
        self.entries.iter().any(|e| {
            matches!(e.callback, Callback::Api(_)) && e.condition.covers(address, 1)
        })
    }

    pub fn fire_api(&mut self, machine: &mut Machine, call: &mut ApiCall) -> HookAction {
        let address = call.address;
        self.dispatch(
            |cond, cb| matches!(cb, Callback::Api(_)) && cond.covers(address, 1),
            |cb| match cb {
                Callback::Api(f) => f(machine, call),
                _ => HookAction::Continue,
            },
        )
    }

    fn fire_syscall(
        &mut self,
        machine: &mut Machine,
        event: &mut SyscallEvent,
        enter: bool,
    ) -> HookAction {
        let number = event.number;
        self.dispatch(
            |cond, cb| {
                let kind_ok = if enter {
                    matches!(cb, Callback::SyscallEnter(_))
                } else {
                    matches!(cb, Callback::SyscallExit(_))
                };
                kind_ok
                    && match cond {
                        HookCondition::Always => true,
                        HookCondition::Syscall(n) => *n == number,
                        _ => false,
                    }
            },
            |cb| match cb {
                Callback::SyscallEnter(f) | Callback::SyscallExit(f) => f(machine, event),
                _ => HookAction::Continue,
            },
        )
    }

    pub fn fire_syscall_enter(&mut self, machine: &mut Machine, event: &mut SyscallEvent) -> HookAction {
        self.fire_syscall(machine, event, true)
    }

    pub fn fire_syscall_exit(&mut self, machine: &mut Machine, event: &mut SyscallEvent) -> HookAction {
        self.fire_syscall(machine, event, false)
    }

    /// Returns whether any interrupt hook was registered for `intno`.
    pub fn fire_interrupt(&mut self, machine: &mut Machine, intno: u32) -> (bool, HookAction) {
        let mut seen = false;
        let action = self.dispatch(
            |cond, cb| {
                matches!(cb, Callback::Interrupt(_))
                    && match cond {
                        HookCondition::Always => true,
                        HookCondition::Interrupt(n) => *n == intno,
                        _ => false,
                    }
            },
            |cb| match cb {
                Callback::Interrupt(f) => {
                    seen = true;
                    f(machine, intno)
                }
                _ => HookAction::Continue,
            },
        );
        (seen, action)
    }

    pub fn fire_exception(&mut self, machine: &mut Machine, event: &mut ExceptionEvent) -> HookAction {
        let kind = FaultKind::from(&event.exception);
        self.dispatch(
            |cond, cb| {
                matches!(cb, Callback::Exception(_))
                    && match cond {
                        HookCondition::Always => true,
                        HookCondition::Fault(k) => *k == kind,
                        _ => false,
                    }
            },
            |cb| match cb {
                Callback::Exception(f) => f(machine, event),
                _ => HookAction::Continue,
            },
        )
    }

    fn fire_mem(&mut self, access: &mut MemAccess) -> HookAction {
        let (address, len, kind) = (access.address, access.data.len() as u64, access.access);
        let action = self.dispatch(
            |cond, cb| {
                let kind_ok = match kind {
                    Access::Write => matches!(cb, Callback::MemWrite(_)),
                    _ => matches!(cb, Callback::MemRead(_)),
                };
                kind_ok && cond.covers(address, len)
            },
            |cb| match cb {
                Callback::MemRead(f) | Callback::MemWrite(f) => f(access),
                _ => HookAction::Continue,
            },
        );
        self.pending = Some(self.pending.unwrap_or(HookAction::Continue).merge(action));
        action
    }

    /// Action requested by memory hooks since the last call.
    pub fn take_pending(&mut self) -> HookAction {
        self.pending.take().unwrap_or(HookAction::Continue)
    }
}

/// The address space as seen by the cpu while hooks are live.
pub struct HookedBus<'a> {
    pub mem: &'a mut AddressSpace,
    pub hooks: &'a mut HookRegistry,
    /// pc of the executing instruction.
    pub pc: u64,
}

impl Bus for HookedBus<'_> {
    fn fetch(&mut self, addr: u64, size: usize) -> Result<Vec<u8>> {
        self.mem.fetch(addr, size)
    }

    fn read(&mut self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let data = self.mem.read(addr, size)?;
        if !self.hooks.has(HookKind::MemRead) {
            return Ok(data);
        }
        let mut access = MemAccess {
            pc: self.pc,
            address: addr,
            access: Access::Read,
            data,
            vetoed: false,
        };
        self.hooks.fire_mem(&mut access);
        Ok(access.data)
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        if !self.hooks.has(HookKind::MemWrite) {
            return self.mem.write(addr, data);
        }
        // a write that would fault never reaches the hooks
        self.mem
            .check_access(addr, data.len() as u64, Access::Write)?;
        let mut access = MemAccess {
            pc: self.pc,
            address: addr,
            access: Access::Write,
            data: data.to_vec(),
            vetoed: false,
        };
        self.hooks.fire_mem(&mut access);
        if access.vetoed {
            trace!("write of {} bytes at {:#x} vetoed", data.len(), addr);
            // an engine that already committed the store gets the old bytes back
            self.mem.mark_sync(addr, data.len() as u64);
            return Ok(());
        }
        access.data.resize(data.len(), 0);
        self.mem.write(addr, &access.data)
    }

    fn address_space(&mut self) -> &mut AddressSpace {
        self.mem
    }
}

/// Overwrite code or data in place and drop stale translations.
///
/// The range must lie inside one region that is writable or marked patchable.
pub fn patch(machine: &mut Machine, address: u64, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    let len = bytes.len() as u64;
    let violation = || EmulatorError::access_violation(address, len, Access::Write);
    let region = machine.mem.region_at(address).ok_or_else(violation)?;
    let end = address.checked_add(len).ok_or_else(violation)?;
    if end > region.end() {
        return Err(violation());
    }
    if !(region.perms.contains(Permission::WRITE) || region.patchable) {
        return Err(violation());
    }
    log::debug!("patch {:#x} <- {}", address, hex::encode(bytes));
    machine.mem.write_raw(address, bytes)?;
    machine.cpu.invalidate_code_cache(address, len);
    Ok(())
}
