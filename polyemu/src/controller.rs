//! The run loop: drives the cpu engine, routes traps to the OS layer and the
//! hooks, and owns the execution state machine.

use crate::{
    emulator::Emulator,
    engine::{BatchEnd, CpuException, Machine, StepOutcome, StopCondition, Trap},
    errors::{EmulatorError, Result},
    hooks::{ApiCall, ExceptionEvent, HookAction, HookedBus, SyscallEvent},
    memory::Access,
    os::{syscall::syscall_name, ApiOutcome, Effect, UnresolvedSymbolPolicy},
    registers::Registers,
};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use strum::Display;

/// Instructions a thread runs before the scheduler may switch.
pub const TIME_SLICE: u64 = 10_000;

/// Longest instruction we report bytes for.
const MAX_INSN_LEN: usize = 16;

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FaultKind {
    AccessViolation,
    IllegalInstruction,
    DivideByZero,
    GeneralProtection,
    Halt,
    UnhandledInterrupt,
    UnresolvedSymbol,
    NotImplementedSyscall,
    /// every thread waits on something that never happens.
    Deadlock,
    /// the emulator itself failed while handling the guest.
    Internal,
}

impl From<&CpuException> for FaultKind {
    fn from(e: &CpuException) -> Self {
        match e {
            CpuException::AccessViolation { .. } => FaultKind::AccessViolation,
            CpuException::IllegalInstruction => FaultKind::IllegalInstruction,
            CpuException::DivideByZero => FaultKind::DivideByZero,
            CpuException::GeneralProtection => FaultKind::GeneralProtection,
            CpuException::Halt => FaultKind::Halt,
        }
    }
}

/// Machine state at the point a guest fault stopped the process.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct FaultReport {
    pub kind: FaultKind,
    pub address: u64,
    pub pc: u64,
    /// bytes at pc, fewer when pc is near the end of a region.
    #[serde(with = "hex::serde")]
    pub insn: Vec<u8>,
    pub tid: u64,
    pub registers: BTreeMap<String, u64>,
    pub detail: String,
}

impl FaultReport {
    pub fn capture(m: &Machine, kind: FaultKind, address: u64, tid: u64, detail: String) -> Self {
        let pc = m.pc().unwrap_or_default();
        let insn = (1..=MAX_INSN_LEN)
            .rev()
            .find_map(|len| m.mem.peek(pc, len).ok())
            .unwrap_or_default();
        Self {
            kind,
            address,
            pc,
            insn,
            tid,
            registers: m.named_registers().unwrap_or_default(),
            detail,
        }
    }
}

impl Display for FaultReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {:#x} (pc {:#x}, thread {})",
            self.kind, self.address, self.pc, self.tid
        )?;
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    Exited { code: u64 },
    Fault(Box<FaultReport>),
    HookRequest,
    /// a run bound was exceeded; the session can be resumed.
    Timeout,
    /// stop request through the control handle.
    Cancelled,
}

impl StopReason {
    /// The process is gone, running again makes no sense.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopReason::Exited { .. } | StopReason::Fault(_))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PauseReason {
    Requested,
    Hook,
    Breakpoint { address: u64 },
    Watchpoint { address: u64, access: Access },
    /// the requested instruction count or address was reached.
    Reached,
    Restored,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum EmuState {
    Idle,
    Running,
    Paused(PauseReason),
    Stopped(StopReason),
}

impl EmuState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EmuState::Stopped(r) if r.is_terminal())
    }
}

/// How far a single `run` goes.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
#[serde(tag = "until", content = "value", rename_all = "snake_case")]
pub enum RunUntil {
    /// this many more retired instructions.
    Count(u64),
    Address(u64),
    Forever,
}

/// Bounds whose excess ends the run with `Stopped(Timeout)`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RunLimits {
    pub max_instructions: Option<u64>,
    pub timeout: Option<Duration>,
}

impl RunLimits {
    pub fn instructions(n: u64) -> Self {
        Self {
            max_instructions: Some(n),
            timeout: None,
        }
    }

    pub fn wall_clock(timeout: Duration) -> Self {
        Self {
            max_instructions: None,
            timeout: Some(timeout),
        }
    }
}

/// Thread-safe stop/pause requests, applied at the next instruction boundary.
#[derive(Clone, Debug, Default)]
pub struct ControlHandle {
    /// set for any pending request, the batch runner polls it.
    pending: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ControlRequest {
    Pause,
    Stop,
}

impl ControlHandle {
    pub fn pause(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.pending.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn take(&self) -> Option<ControlRequest> {
        if !self.pending.swap(false, Ordering::SeqCst) {
            return None;
        }
        match self.stop.swap(false, Ordering::SeqCst) {
            true => Some(ControlRequest::Stop),
            false => Some(ControlRequest::Pause),
        }
    }

    pub(crate) fn clear(&self) {
        self.pending.store(false, Ordering::SeqCst);
        self.stop.store(false, Ordering::SeqCst);
    }

    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        self.pending.clone()
    }
}

/// Run-loop bookkeeping owned by the session.
#[derive(Clone, Debug)]
pub(crate) struct ExecState {
    pub state: EmuState,
    /// retired guest instructions, stub dispatches count as one.
    pub retired: u64,
    pub breakpoints: BTreeSet<u64>,
    /// a pause at this pc already reported its breakpoint.
    pub skip_break_at: Option<u64>,
    /// hooks at this pc already fired before the last stop.
    pub skip_hooks_at: Option<u64>,
    /// the next instruction starts a basic block.
    pub block_start: bool,
    /// breakpoints and automatic checkpoints are off while replaying.
    pub replaying: bool,
}

impl Default for ExecState {
    fn default() -> Self {
        Self {
            state: EmuState::Idle,
            retired: 0,
            breakpoints: BTreeSet::new(),
            skip_break_at: None,
            skip_hooks_at: None,
            block_start: true,
            replaying: false,
        }
    }
}

/// Limits of one `run` call, in absolute retired counts.
struct RunPlan {
    start: u64,
    target: Option<u64>,
    until: Option<u64>,
    budget_end: Option<u64>,
    deadline: Option<Instant>,
}

fn action_state(action: HookAction) -> Option<EmuState> {
    match action {
        HookAction::Stop => Some(EmuState::Stopped(StopReason::HookRequest)),
        HookAction::Pause => Some(EmuState::Paused(PauseReason::Hook)),
        HookAction::Continue | HookAction::Remove => None,
    }
}

impl Emulator {
    /// Execute until `until`, a bound in `limits`, a hook, a control request or
    /// the end of the process.
    pub fn run(&mut self, until: RunUntil, limits: RunLimits) -> Result<EmuState> {
        self.ensure_live()?;
        if let EmuState::Stopped(reason) = &self.exec.state {
            if reason.is_terminal() {
                return Err(EmulatorError::InvalidState(format!(
                    "the process has stopped: {:?}",
                    reason
                )));
            }
        }
        self.control.clear();
        self.exec.state = EmuState::Running;
        let start = self.exec.retired;
        let plan = RunPlan {
            start,
            target: match until {
                RunUntil::Count(n) => Some(start.saturating_add(n)),
                _ => None,
            },
            until: match until {
                RunUntil::Address(a) => Some(a),
                _ => None,
            },
            budget_end: limits.max_instructions.map(|n| start.saturating_add(n)),
            deadline: limits.timeout.map(|t| Instant::now() + t),
        };
        debug!(
            "run {:?} from pc {:#x}, retired {}",
            until,
            self.machine.pc()?,
            start
        );
        let result = self.run_loop(&plan);
        let state = match result {
            Ok(state) => state,
            Err(e) => {
                let report = FaultReport::capture(
                    &self.machine,
                    FaultKind::Internal,
                    self.machine.pc().unwrap_or_default(),
                    self.kernel.current_tid(),
                    e.to_string(),
                );
                warn!("run aborted: {}", report);
                self.exec.state = EmuState::Stopped(StopReason::Fault(Box::new(report)));
                return Err(e);
            }
        };
        debug!(
            "run ends {:?} after {} instructions",
            state,
            self.exec.retired - start
        );
        self.exec.state = state.clone();
        Ok(state)
    }

    /// Run to the end of the process and return its exit code.
    pub fn run_to_completion(&mut self, limits: RunLimits) -> Result<u64> {
        match self.run(RunUntil::Forever, limits)? {
            EmuState::Stopped(StopReason::Exited { code }) => Ok(code),
            EmuState::Stopped(StopReason::Fault(report)) => Err(EmulatorError::Fault(report)),
            EmuState::Stopped(StopReason::Timeout) => Err(EmulatorError::Timeout),
            other => Err(EmulatorError::InvalidState(format!(
                "run ended early: {:?}",
                other
            ))),
        }
    }

    fn run_loop(&mut self, plan: &RunPlan) -> Result<EmuState> {
        loop {
            if let Some(state) = self.at_boundary(plan)? {
                return Ok(state);
            }
            let before = self.exec.retired;
            let stop = self.advance(plan)?;
            if before / TIME_SLICE != self.exec.retired / TIME_SLICE && !self.finished() {
                self.kernel.preempt(&mut self.machine)?;
                self.exec.block_start = true;
            }
            if let Some(state) = stop {
                return Ok(state);
            }
        }
    }

    fn finished(&self) -> bool {
        self.kernel.exit_code().is_some()
    }

    /// Checks made between two instructions.
    fn at_boundary(&mut self, plan: &RunPlan) -> Result<Option<EmuState>> {
        if let Some(request) = self.control.take() {
            return Ok(Some(match request {
                ControlRequest::Pause => EmuState::Paused(PauseReason::Requested),
                ControlRequest::Stop => EmuState::Stopped(StopReason::Cancelled),
            }));
        }
        let retired = self.exec.retired;
        if plan.target.map_or(false, |t| retired >= t) {
            return Ok(Some(EmuState::Paused(PauseReason::Reached)));
        }
        if plan.budget_end.map_or(false, |b| retired >= b)
            || plan.deadline.map_or(false, |d| Instant::now() >= d)
        {
            info!("run bound exceeded after {} instructions", retired - plan.start);
            return Ok(Some(EmuState::Stopped(StopReason::Timeout)));
        }
        let pc = self.machine.pc()?;
        if plan.until == Some(pc) && retired > plan.start {
            return Ok(Some(EmuState::Paused(PauseReason::Reached)));
        }
        if !self.exec.replaying
            && self.exec.breakpoints.contains(&pc)
            && self.exec.skip_break_at != Some(pc)
        {
            self.exec.skip_break_at = Some(pc);
            return Ok(Some(EmuState::Paused(PauseReason::Breakpoint { address: pc })));
        }
        if let Some(interval) = self.config.checkpoint_interval.filter(|i| *i > 0) {
            if !self.exec.replaying
                && retired % interval == 0
                && self.chain.head_retired() != Some(retired)
            {
                let id = self.checkpoint()?;
                trace!("automatic checkpoint {} at {}", id, retired);
            }
        }
        Ok(None)
    }

    /// Make progress by one stub dispatch, one hooked instruction or one
    /// batch.
    fn advance(&mut self, plan: &RunPlan) -> Result<Option<EmuState>> {
        let pc = self.machine.pc()?;
        let skip_hooks = self.exec.skip_hooks_at.take() == Some(pc);
        let skip_break = self.exec.skip_break_at.take() == Some(pc);

        if self.kernel.state.stubs.range().contains(&pc) {
            return self.dispatch_stub(pc, skip_hooks);
        }
        if !skip_hooks && self.hooks.has_api_hook(pc) {
            if let Some(state) = self.fire_export_hook(pc)? {
                return Ok(Some(state));
            }
            if self.machine.pc()? != pc {
                return Ok(None);
            }
        }
        if self.hooks.needs_stepping() {
            return self.step_hooked(pc, skip_hooks);
        }

        let mut breaks = vec![self.kernel.state.stubs.range()];
        breaks.extend(self.hooks.api_addresses().into_iter().map(|a| a..a + 1));
        if !self.exec.replaying {
            breaks.extend(self.exec.breakpoints.iter().map(|b| *b..*b + 1));
        }
        let must_step = skip_hooks
            || skip_break
            || plan.until == Some(pc)
            || breaks.iter().any(|r| r.contains(&pc));
        let max = if must_step { 1 } else { self.batch_size(plan) };
        let stop = StopCondition {
            max_instructions: max,
            until: if must_step { None } else { plan.until },
            breaks: if must_step { vec![] } else { breaks },
            cancel: Some(self.control.flag()),
            deadline: plan.deadline,
        };
        let outcome = self.machine.cpu.run_until(&mut self.machine.mem, &stop)?;
        self.retire(outcome.executed);
        if outcome.executed > 0 {
            self.exec.block_start = false;
        }
        match outcome.end {
            BatchEnd::Trap(trap) => self.handle_trap(trap),
            BatchEnd::Exhausted | BatchEnd::Break | BatchEnd::Cancelled => Ok(None),
        }
    }

    /// Largest batch that ends on every boundary the loop must observe.
    fn batch_size(&self, plan: &RunPlan) -> u64 {
        let retired = self.exec.retired;
        let mut max = TIME_SLICE - retired % TIME_SLICE;
        for end in [plan.target, plan.budget_end].into_iter().flatten() {
            max = max.min(end.saturating_sub(retired));
        }
        if let Some(interval) = self.config.checkpoint_interval.filter(|i| *i > 0) {
            max = max.min(interval - retired % interval);
        }
        max.max(1)
    }

    fn retire(&mut self, n: u64) {
        self.exec.retired += n;
        self.kernel.state.clock.icount = self.exec.retired;
    }

    fn step_hooked(&mut self, pc: u64, skip_hooks: bool) -> Result<Option<EmuState>> {
        if !skip_hooks {
            let mut action = HookAction::Continue;
            if self.exec.block_start && self.hooks.has_block_hooks() {
                action = action.merge(self.hooks.fire_block(&mut self.machine, pc));
            }
            action = action.merge(self.hooks.fire_code(&mut self.machine, pc));
            if let Some(state) = action_state(action) {
                self.exec.skip_hooks_at = Some(pc);
                self.exec.skip_break_at = Some(pc);
                return Ok(Some(state));
            }
            // a hook redirected execution
            if self.machine.pc()? != pc {
                self.exec.block_start = true;
                return Ok(None);
            }
        }
        let outcome = {
            let Machine { cpu, mem, .. } = &mut self.machine;
            let mut bus = HookedBus {
                mem,
                hooks: &mut self.hooks,
                pc,
            };
            cpu.step(&mut bus)?
        };
        let pending = self.hooks.take_pending();
        match outcome {
            StepOutcome::Executed => {
                self.retire(1);
                let next = self.machine.pc()?;
                self.exec.block_start = next < pc || next > pc + MAX_INSN_LEN as u64;
                Ok(action_state(pending))
            }
            StepOutcome::Trap(trap) => {
                if !matches!(trap, Trap::Exception(_)) {
                    self.retire(1);
                }
                self.exec.block_start = true;
                let state = self.handle_trap(trap)?;
                Ok(state.or_else(|| action_state(pending)))
            }
        }
    }

    fn handle_trap(&mut self, trap: Trap) -> Result<Option<EmuState>> {
        let syscall = self.kernel.is_syscall_trap(&trap);
        match trap {
            Trap::Exception(e) => self.handle_exception(e),
            Trap::Interrupt(n) => {
                let (seen, action) = self.hooks.fire_interrupt(&mut self.machine, n);
                if syscall {
                    if let Some(state) = self.handle_syscall()? {
                        return Ok(Some(state));
                    }
                } else if !seen {
                    let pc = self.machine.pc()?;
                    return self
                        .fault(FaultKind::UnhandledInterrupt, pc, format!("interrupt {:#x}", n))
                        .map(Some);
                }
                Ok(action_state(action))
            }
            Trap::Syscall if syscall => self.handle_syscall(),
            Trap::Syscall => {
                let pc = self.machine.pc()?;
                self.fault(
                    FaultKind::UnhandledInterrupt,
                    pc,
                    format!("{} has no syscall instruction interface", self.kernel.os),
                )
                .map(Some)
            }
        }
    }

    fn handle_exception(&mut self, exception: CpuException) -> Result<Option<EmuState>> {
        let mut event = ExceptionEvent {
            exception: exception.clone(),
            handled: false,
        };
        let action = self.hooks.fire_exception(&mut self.machine, &mut event);
        if event.handled {
            trace!("exception {:?} handled by a hook", exception);
            self.exec.block_start = true;
            return Ok(action_state(action));
        }
        let address = match &exception {
            CpuException::AccessViolation { address, .. } => *address,
            _ => self.machine.pc()?,
        };
        let detail = match &exception {
            CpuException::AccessViolation { size, access, .. } => {
                format!("{:?} of {} bytes", access, size)
            }
            _ => String::new(),
        };
        self.fault(FaultKind::from(&exception), address, detail).map(Some)
    }

    /// Stop the process on a guest fault. Its objects are released like on
    /// any other termination.
    fn fault(&mut self, kind: FaultKind, address: u64, detail: String) -> Result<EmuState> {
        let report = FaultReport::capture(
            &self.machine,
            kind,
            address,
            self.kernel.current_tid(),
            detail,
        );
        warn!("guest fault: {}", report);
        self.kernel.teardown();
        Ok(EmuState::Stopped(StopReason::Fault(Box::new(report))))
    }

    fn handle_syscall(&mut self) -> Result<Option<EmuState>> {
        let (os, arch) = (self.kernel.os, self.kernel.arch);
        let abi = self.kernel.syscall_abi()?.clone();
        let number = abi.syscall_number(&self.machine)?;
        let args = abi.read_args(&self.machine, 6)?;
        let mut event = SyscallEvent {
            number,
            name: syscall_name(os, arch, number).map(str::to_string),
            args,
            result: None,
        };
        let mut action = self.hooks.fire_syscall_enter(&mut self.machine, &mut event);
        let (result, effect) = match event.result {
            Some(r) => (r, Effect::None),
            None => match self.kernel.handle_syscall(&mut self.machine, number, &event.args) {
                Ok(outcome) => (outcome.value.map_err(|e| e.code(os, arch)), outcome.effect),
                Err(EmulatorError::NotImplementedSyscall { .. }) => {
                    let pc = self.machine.pc()?.wrapping_sub(self.kernel.syscall_insn_len());
                    return self
                        .fault(
                            FaultKind::NotImplementedSyscall,
                            pc,
                            format!("{} syscall {}", os, number),
                        )
                        .map(Some);
                }
                Err(e) => return Err(e),
            },
        };
        event.result = Some(result);
        match effect {
            Effect::Block { restart: true, .. } => {}
            Effect::ExitProcess(_) | Effect::ExitThread(_) => {}
            _ => {
                action = action.merge(self.hooks.fire_syscall_exit(&mut self.machine, &mut event));
                abi.write_result(&mut self.machine, event.result.unwrap_or(result))?;
            }
        }
        if let Effect::Block { restart: true, .. } = effect {
            let pc = self.machine.pc()?;
            self.machine.set_pc(pc - self.kernel.syscall_insn_len())?;
        }
        if let Some(state) = self.apply_effect(effect)? {
            return Ok(Some(state));
        }
        Ok(action_state(action))
    }

    /// Calls reaching an exported function hooked by symbol.
    fn fire_export_hook(&mut self, pc: u64) -> Result<Option<EmuState>> {
        let (library, symbol) = match self.images.containing(pc) {
            Some(image) => (
                image.name.clone(),
                image
                    .exports
                    .iter()
                    .find(|(_, a)| **a == pc)
                    .map(|(s, _)| s.clone())
                    .unwrap_or_default(),
            ),
            None => (String::new(), String::new()),
        };
        let mut call = ApiCall {
            library,
            symbol,
            address: pc,
            result: None,
        };
        let action = self.hooks.fire_api(&mut self.machine, &mut call);
        if let Some(value) = call.result {
            self.kernel.cc.return_from_call(&mut self.machine, value, 0)?;
            self.retire(1);
            self.exec.block_start = true;
            return Ok(action_state(action));
        }
        if action_state(action).is_some() {
            self.exec.skip_hooks_at = Some(pc);
            self.exec.skip_break_at = Some(pc);
        }
        Ok(action_state(action))
    }

    fn dispatch_stub(&mut self, pc: u64, skip_hooks: bool) -> Result<Option<EmuState>> {
        let (library, symbol) = match self.kernel.state.stubs.lookup(pc) {
            Some((l, s)) => (l.to_string(), s.to_string()),
            None => {
                return self
                    .fault(
                        FaultKind::IllegalInstruction,
                        pc,
                        "jump into the stub area".to_string(),
                    )
                    .map(Some)
            }
        };
        self.exec.block_start = true;
        let mut action = HookAction::Continue;
        if !skip_hooks && self.hooks.has_api_hook(pc) {
            let mut call = ApiCall {
                library: library.clone(),
                symbol: symbol.clone(),
                address: pc,
                result: None,
            };
            action = self.hooks.fire_api(&mut self.machine, &mut call);
            if let Some(value) = call.result {
                trace!("{}!{} replaced by a hook: {:#x}", library, symbol, value);
                self.kernel.cc.return_from_call(&mut self.machine, value, 0)?;
                self.retire(1);
                return Ok(action_state(action));
            }
            if let Some(state) = action_state(action) {
                self.exec.skip_hooks_at = Some(pc);
                return Ok(Some(state));
            }
        }
        let outcome = match self
            .kernel
            .call_api(&mut self.machine, &self.images, &library, &symbol)
        {
            Ok(Some(outcome)) => outcome,
            Ok(None) | Err(EmulatorError::UnresolvedSymbol { .. }) => {
                match self.kernel.policy.unresolved_symbol {
                    UnresolvedSymbolPolicy::Permissive => {
                        warn!("{}!{} is not emulated, returning 0", library, symbol);
                        ApiOutcome::ret(0, 0)
                    }
                    UnresolvedSymbolPolicy::Strict => {
                        return self
                            .fault(
                                FaultKind::UnresolvedSymbol,
                                pc,
                                format!("{}!{}", library, symbol),
                            )
                            .map(Some)
                    }
                }
            }
            Err(e) => return Err(e),
        };
        self.retire(1);
        match outcome.effect {
            Effect::Block { restart: true, .. }
            | Effect::ExitProcess(_)
            | Effect::ExitThread(_) => {}
            _ => {
                self.kernel
                    .cc
                    .return_from_call(&mut self.machine, outcome.value, outcome.cleanup)?;
            }
        }
        if let Some(state) = self.apply_effect(outcome.effect)? {
            return Ok(Some(state));
        }
        Ok(action_state(action))
    }

    /// Scheduling consequences of a syscall or api call, once its result is
    /// written back.
    fn apply_effect(&mut self, effect: Effect) -> Result<Option<EmuState>> {
        match effect {
            Effect::None => Ok(None),
            Effect::Yield => {
                self.kernel.preempt(&mut self.machine)?;
                self.exec.block_start = true;
                Ok(None)
            }
            Effect::ExitProcess(code) => {
                self.kernel.exit_process(code);
                Ok(Some(EmuState::Stopped(StopReason::Exited { code })))
            }
            Effect::ExitThread(code) => {
                if self.kernel.exit_thread(&mut self.machine, code)? {
                    return Ok(Some(EmuState::Stopped(StopReason::Exited { code })));
                }
                self.reschedule()
            }
            Effect::Block { reason, .. } => {
                trace!("thread {} blocks on {:?}", self.kernel.current_tid(), reason);
                self.kernel.state.threads.block_current(reason);
                self.reschedule()
            }
        }
    }

    fn reschedule(&mut self) -> Result<Option<EmuState>> {
        self.exec.block_start = true;
        if self.kernel.schedule(&mut self.machine)? {
            return Ok(None);
        }
        let pc = self.machine.pc()?;
        self.fault(
            FaultKind::Deadlock,
            pc,
            "no thread can make progress".to_string(),
        )
        .map(Some)
    }
}

#[cfg(test)]
mod test {
    use super::{ControlHandle, EmuState, FaultKind, PauseReason, RunLimits, RunUntil, StopReason};
    use crate::{
        arch::{ArchType, RegisterX86},
        config::EmuConfig,
        emulator::Emulator,
        engine::CpuException,
        errors::EmulatorError,
        hooks::HookAction,
        memory::{Access, Memory},
        os::{UnknownSyscallPolicy, UnresolvedSymbolPolicy},
        registers::Registers,
        testing::{asm, images, TinyX86},
    };
    use std::{cell::RefCell, rc::Rc, time::Duration};

    fn raw_config() -> EmuConfig {
        let mut config = EmuConfig::from_toml(
            r#"
            arch = "x86"
            os = "linux"
            format = "raw"
            stdio = "capture"
            [memory]
            load_address = 0x1000
            "#,
        )
        .unwrap();
        config.random_seed = 7;
        config
    }

    fn raw(code: &[u8], config: EmuConfig) -> Emulator {
        Emulator::from_bytes(config, "/flat.bin", code, &[], |arch| {
            Ok(Box::new(TinyX86::new(arch.arch)))
        })
        .unwrap()
    }

    /// `eax = 1; ebx = code; int 0x80`
    fn exit_code(code: u32) -> Vec<u8> {
        asm::concat(&[asm::mov_eax(1), asm::mov_r32(3, code), asm::int80()])
    }

    #[test]
    fn test_flat_exit() {
        let code = asm::concat(&[asm::mov_eax(1), asm::int80()]);
        let mut emu = raw(&code, raw_config());
        Registers::write(&mut emu.machine, RegisterX86::EBX, 1).unwrap();
        let state = emu.run(RunUntil::Forever, RunLimits::default()).unwrap();
        assert_eq!(state, EmuState::Stopped(StopReason::Exited { code: 1 }));
        assert_eq!(emu.kernel().exit_code(), Some(1));
        assert!(emu.kernel().state.objects.is_empty());
        // a finished process cannot run again
        assert!(matches!(
            emu.run(RunUntil::Forever, RunLimits::default()),
            Err(EmulatorError::InvalidState(_))
        ));
    }

    #[test]
    fn test_unknown_syscall_is_ignored() {
        let code = asm::concat(&[asm::mov_eax(0x3ff), asm::int80(), exit_code(0)]);
        let mut emu = raw(&code, raw_config());
        let layout = emu.machine.mem.layout();
        let objects = emu.kernel().state.objects.clone();
        assert!(!objects.is_empty());

        let state = emu.run(RunUntil::Count(2), RunLimits::default()).unwrap();
        assert_eq!(state, EmuState::Paused(PauseReason::Reached));
        assert_eq!(emu.machine.pc().unwrap(), 0x1007);
        assert_eq!(Registers::read(&emu.machine, RegisterX86::EAX).unwrap(), 0);
        assert_eq!(emu.kernel().state.objects, objects);
        assert_eq!(emu.machine.mem.layout(), layout);

        assert_eq!(emu.run_to_completion(RunLimits::default()).unwrap(), 0);
    }

    #[test]
    fn test_unknown_syscall_strict() {
        let mut config = raw_config();
        config.policy.unknown_syscall = UnknownSyscallPolicy::Strict;
        let code = asm::concat(&[asm::mov_eax(0x3ff), asm::int80()]);
        let mut emu = raw(&code, config);
        match emu.run(RunUntil::Forever, RunLimits::default()).unwrap() {
            EmuState::Stopped(StopReason::Fault(report)) => {
                assert_eq!(report.kind, FaultKind::NotImplementedSyscall);
                assert_eq!(report.address, 0x1005);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fault_report() {
        // ud2
        let mut emu = raw(&[0x90, 0x0f, 0x0b], raw_config());
        let err = emu.run_to_completion(RunLimits::default()).unwrap_err();
        match err {
            EmulatorError::Fault(report) => {
                assert_eq!(report.kind, FaultKind::IllegalInstruction);
                assert_eq!((report.pc, report.address), (0x1001, 0x1001));
                assert_eq!(&report.insn[..2], &[0x0f, 0x0b]);
                assert_eq!(report.registers["eip"], 0x1001);
                assert_eq!(report.tid, crate::os::GUEST_PID);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(emu.state().is_terminal());
    }

    #[test]
    fn test_exception_hook_repairs() {
        // store to an unmapped address, then exit 3
        let code = asm::concat(&[asm::store_eax(0x0900_0000), exit_code(3)]);
        let mut emu = raw(&code, raw_config());
        let seen = Rc::new(RefCell::new(vec![]));
        let s = seen.clone();
        emu.hooks_mut()
            .add_exception_hook(Some(FaultKind::AccessViolation), move |m, event| {
                s.borrow_mut().push(event.exception.clone());
                let pc = m.pc().unwrap();
                m.set_pc(pc + 5).unwrap();
                event.handled = true;
                HookAction::Continue
            });
        assert_eq!(emu.run_to_completion(RunLimits::default()).unwrap(), 3);
        assert_eq!(
            seen.borrow().as_slice(),
            &[CpuException::AccessViolation {
                address: 0x0900_0000,
                size: 4,
                access: Access::Write
            }]
        );
    }

    #[test]
    fn test_instruction_bound_is_resumable() {
        // spin: jmp $
        let mut emu = raw(&asm::jmp8(-2), raw_config());
        let state = emu.run(RunUntil::Forever, RunLimits::instructions(500)).unwrap();
        assert_eq!(state, EmuState::Stopped(StopReason::Timeout));
        assert_eq!(emu.retired(), 500);
        let state = emu.run(RunUntil::Count(20), RunLimits::default()).unwrap();
        assert_eq!(state, EmuState::Paused(PauseReason::Reached));
        assert_eq!(emu.retired(), 520);
        let err = emu
            .run_to_completion(RunLimits::wall_clock(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, EmulatorError::Timeout));
    }

    #[test]
    fn test_control_handle_pauses() {
        let mut emu = raw(&asm::jmp8(-2), raw_config());
        let control: ControlHandle = emu.control();
        let fired = Rc::new(RefCell::new(0));
        let f = fired.clone();
        emu.hooks_mut().add_code_hook(0x1000, 0x1002, move |_, _| {
            *f.borrow_mut() += 1;
            if *f.borrow() == 3 {
                control.pause();
            }
            HookAction::Continue
        });
        let state = emu.run(RunUntil::Forever, RunLimits::default()).unwrap();
        assert_eq!(state, EmuState::Paused(PauseReason::Requested));
        assert_eq!(emu.retired(), 3);
        emu.control().stop();
        let state = emu.run(RunUntil::Count(2), RunLimits::default()).unwrap();
        // requests made before a run starts are dropped
        assert_eq!(state, EmuState::Paused(PauseReason::Reached));
    }

    #[test]
    fn test_code_hook_fires_once_per_execution() {
        let code = asm::concat(&[asm::nop(), asm::nop(), asm::nop(), exit_code(0)]);
        let order = Rc::new(RefCell::new(vec![]));
        let mut emu = raw(&code, raw_config());
        for tag in ["a", "b"] {
            let o = order.clone();
            emu.hooks_mut().add_code_hook(0x1001, 0x1002, move |_, pc| {
                o.borrow_mut().push((tag, pc));
                HookAction::Continue
            });
        }
        for _ in 0..4 {
            emu.run(RunUntil::Count(1), RunLimits::default()).unwrap();
        }
        assert_eq!(order.borrow().as_slice(), &[("a", 0x1001), ("b", 0x1001)]);
    }

    #[test]
    fn test_hook_stop_and_resume() {
        let code = asm::concat(&[asm::nop(), asm::nop(), exit_code(9)]);
        let mut emu = raw(&code, raw_config());
        let hits = Rc::new(RefCell::new(0));
        let h = hits.clone();
        emu.hooks_mut().add_code_hook(0x1001, 0x1002, move |_, _| {
            *h.borrow_mut() += 1;
            HookAction::Stop
        });
        let state = emu.run(RunUntil::Forever, RunLimits::default()).unwrap();
        assert_eq!(state, EmuState::Stopped(StopReason::HookRequest));
        assert_eq!(emu.machine.pc().unwrap(), 0x1001);
        assert_eq!(emu.run_to_completion(RunLimits::default()).unwrap(), 9);
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn test_breakpoint_and_address_target() {
        let code = asm::concat(&[asm::nop(), asm::nop(), asm::nop(), exit_code(0)]);
        let mut emu = raw(&code, raw_config());
        emu.add_breakpoint(0x1002);
        let state = emu.run(RunUntil::Forever, RunLimits::default()).unwrap();
        assert_eq!(state, EmuState::Paused(PauseReason::Breakpoint { address: 0x1002 }));
        let state = emu.run(RunUntil::Address(0x1003), RunLimits::default()).unwrap();
        assert_eq!(state, EmuState::Paused(PauseReason::Reached));
        assert_eq!(emu.machine.pc().unwrap(), 0x1003);
        assert!(emu.remove_breakpoint(0x1002));
        assert_eq!(emu.run_to_completion(RunLimits::default()).unwrap(), 0);
    }

    #[test]
    fn test_syscall_hooks_replace_result() {
        // getpid (20), result in eax, then exit with it
        let code = asm::concat(&[
            asm::mov_eax(20),
            asm::int80(),
            vec![0x89, 0xc3], // mov ebx, eax
            asm::mov_eax(1),
            asm::int80(),
        ]);
        let mut emu = raw(&code, raw_config());
        let names = Rc::new(RefCell::new(vec![]));
        let n = names.clone();
        emu.hooks_mut().add_syscall_exit_hook(Some(20), move |_, event| {
            n.borrow_mut().push(event.name.clone());
            event.result = Some(Ok(77));
            HookAction::Continue
        });
        assert_eq!(emu.run_to_completion(RunLimits::default()).unwrap(), 77);
        assert_eq!(names.borrow().as_slice(), &[Some("getpid".to_string())]);
    }

    #[test]
    fn test_unhandled_interrupt() {
        let mut emu = raw(&[0xcd, 0x21], raw_config());
        match emu.run(RunUntil::Forever, RunLimits::default()).unwrap() {
            EmuState::Stopped(StopReason::Fault(report)) => {
                assert_eq!(report.kind, FaultKind::UnhandledInterrupt)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn windows_exe(imports: &[(&str, &[&str])], code: &[u8]) -> Emulator {
        let data = images::pe32(0x400000, code, imports);
        let mut config = EmuConfig::default();
        config.stdio = crate::os::StdioMode::Capture;
        Emulator::from_bytes(config, "C:\\app.exe", &data, &[], |arch| {
            Ok(Box::new(TinyX86::new(arch.arch)))
        })
        .unwrap()
    }

    /// IAT slot of the n-th import of the first dll in `images::pe32` output.
    fn iat_slot(emu: &Emulator, symbol: &str) -> u32 {
        emu.images()
            .main()
            .unwrap()
            .imports
            .iter()
            .find(|i| i.symbol == symbol)
            .unwrap()
            .slot as u32
    }

    #[test]
    fn test_unresolved_import_policies() {
        let probe = windows_exe(&[("foo.dll", &["Missing"])], &[0xc3]);
        let slot = iat_slot(&probe, "Missing");
        let code = asm::concat(&[asm::call_abs_indirect(slot), vec![0xc3]]);

        let mut strict = windows_exe(&[("foo.dll", &["Missing"])], &code);
        match strict.run(RunUntil::Forever, RunLimits::default()).unwrap() {
            EmuState::Stopped(StopReason::Fault(report)) => {
                assert_eq!(report.kind, FaultKind::UnresolvedSymbol);
                assert_eq!(report.detail, "foo.dll!Missing");
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut permissive = windows_exe(&[("foo.dll", &["Missing"])], &code);
        permissive.kernel_mut().policy.unresolved_symbol = UnresolvedSymbolPolicy::Permissive;
        // returning from the entry point lands on the exit stub
        assert_eq!(permissive.run_to_completion(RunLimits::default()).unwrap(), 0);
    }

    #[test]
    fn test_symbol_hook_replaces_result() {
        let probe = windows_exe(&[("foo.dll", &["Answer"])], &[0xc3]);
        let slot = iat_slot(&probe, "Answer");
        // eax = Answer(); return eax as the exit code
        let code = asm::concat(&[asm::call_abs_indirect(slot), vec![0xc3]]);
        let mut emu = windows_exe(&[("foo.dll", &["Answer"])], &code);
        let calls = Rc::new(RefCell::new(vec![]));
        let c = calls.clone();
        emu.hook_symbol("Answer", move |_, call| {
            c.borrow_mut().push(call.library.clone());
            call.result = Some(42);
            HookAction::Continue
        })
        .unwrap();
        assert!(emu.hook_symbol("Nowhere", |_, _| HookAction::Continue).is_err());
        assert_eq!(emu.run_to_completion(RunLimits::default()).unwrap(), 42);
        assert_eq!(calls.borrow().as_slice(), &["foo.dll".to_string()]);
    }

    #[test]
    fn test_memory_hook_sees_guest_write() {
        let code = asm::concat(&[asm::mov_eax(0xabcd), asm::store_eax(0x1800), exit_code(0)]);
        let mut emu = raw(&code, raw_config());
        let writes = Rc::new(RefCell::new(vec![]));
        let w = writes.clone();
        emu.hooks_mut().add_mem_write_hook(0x1800, 0x1804, move |access| {
            w.borrow_mut().push((access.pc, access.address, access.data.clone()));
            access.data = vec![1, 2, 3, 4];
            HookAction::Continue
        });
        assert_eq!(emu.run_to_completion(RunLimits::default()).unwrap(), 0);
        assert_eq!(
            writes.borrow().as_slice(),
            &[(0x1005, 0x1800, vec![0xcd, 0xab, 0, 0])]
        );
        assert_eq!(Memory::read(&emu.machine, 0x1800, 4).unwrap(), vec![1, 2, 3, 4]);
    }
}
