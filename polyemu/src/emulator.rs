//! The session object: one loaded program with its machine, OS state, hooks
//! and checkpoints. Nothing here is global, sessions are independent.

use crate::{
    arch::ArchInfo,
    config::EmuConfig,
    controller::{ControlHandle, EmuState, ExecState, PauseReason, RunLimits, RunUntil, StopReason},
    engine::{CpuEngine, Machine},
    errors::{EmulatorError, Result},
    hooks::{self, ApiCall, HookAction, HookId, HookRegistry},
    loader::{self, process, ImageFormat, ImageSet, LoadInfo, Loader},
    memory::{Memory, RegionInfo},
    os::Kernel,
    registers::Registers,
    snapshot::{CheckpointChain, CheckpointSummary, SessionFile},
};
use log::{debug, info};
use std::path::Path;

/// Engine compiled into this build, picked once the image names its cpu.
pub fn native_engine(arch: ArchInfo) -> Result<Box<dyn CpuEngine>> {
    #[cfg(feature = "unicorn")]
    {
        Ok(Box::new(crate::engine::unicorn::UnicornEngine::new(arch)?))
    }
    #[cfg(not(feature = "unicorn"))]
    {
        Err(EmulatorError::Engine(format!(
            "no cpu engine for {} in this build, enable the `unicorn` feature",
            arch.arch
        )))
    }
}

pub struct Emulator {
    pub(crate) config: EmuConfig,
    pub machine: Machine,
    pub(crate) kernel: Kernel,
    pub(crate) hooks: HookRegistry,
    pub(crate) images: ImageSet,
    pub(crate) load_info: LoadInfo,
    pub(crate) format: ImageFormat,
    pub(crate) exe_path: String,
    pub(crate) exec: ExecState,
    pub(crate) control: ControlHandle,
    pub(crate) chain: CheckpointChain,
    torn_down: bool,
}

impl Emulator {
    /// Load `data` as the program found at `guest_path` and prepare its
    /// first thread. A load failure leaves nothing behind.
    pub fn from_bytes(
        config: EmuConfig,
        guest_path: &str,
        data: &[u8],
        argv: &[String],
        engine: impl FnOnce(ArchInfo) -> Result<Box<dyn CpuEngine>>,
    ) -> Result<Self> {
        let probe = loader::probe(data, &config)?;
        info!(
            "{}: {} image for {} on {}",
            guest_path, probe.format, probe.arch.arch, probe.os
        );
        let mut machine = Machine::new(engine(probe.arch)?);
        machine.mem.set_budget(config.memory.budget());
        let layout = config.memory.resolve(probe.os, probe.arch.pointer_size());
        let mut kernel = Kernel::new(probe.os, probe.arch.arch, &config, layout, guest_path)?;
        let (images, mut load_info) = Loader {
            m: &mut machine,
            k: &mut kernel,
        }
        .load_program(&probe, guest_path, data)?;
        process::bootstrap(&mut machine, &mut kernel, &images, &mut load_info, argv)?;
        // loading is not guest activity
        machine.mem.take_dirty();
        Ok(Self {
            config,
            machine,
            kernel,
            hooks: HookRegistry::new(),
            images,
            load_info,
            format: probe.format,
            exe_path: guest_path.to_string(),
            exec: ExecState::default(),
            control: ControlHandle::default(),
            chain: CheckpointChain::default(),
            torn_down: false,
        })
    }

    /// Load a host file with the engine compiled into this build.
    pub fn from_file(config: EmuConfig, path: impl AsRef<Path>, argv: &[String]) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        Self::from_bytes(config, &path.to_string_lossy(), &data, argv, native_engine)
    }

    pub(crate) fn ensure_live(&self) -> Result<()> {
        match self.torn_down {
            true => Err(EmulatorError::SessionTornDown),
            false => Ok(()),
        }
    }

    pub fn state(&self) -> &EmuState {
        &self.exec.state
    }

    /// Retired guest instructions since load.
    pub fn retired(&self) -> u64 {
        self.exec.retired
    }

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn config(&self) -> &EmuConfig {
        &self.config
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    pub fn images(&self) -> &ImageSet {
        &self.images
    }

    pub fn load_info(&self) -> &LoadInfo {
        &self.load_info
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn exit_code(&self) -> Option<u64> {
        self.kernel.exit_code()
    }

    pub fn regions(&self) -> Vec<RegionInfo> {
        self.machine.mem.layout()
    }

    pub fn add_breakpoint(&mut self, address: u64) {
        debug!("breakpoint at {:#x}", address);
        self.exec.breakpoints.insert(address);
    }

    pub fn remove_breakpoint(&mut self, address: u64) -> bool {
        self.exec.breakpoints.remove(&address)
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = u64> + '_ {
        self.exec.breakpoints.iter().copied()
    }

    /// Hook calls to an export of a loaded image or an import stub, by name.
    pub fn hook_symbol(
        &mut self,
        symbol: &str,
        callback: impl FnMut(&mut Machine, &mut ApiCall) -> HookAction + 'static,
    ) -> Result<HookId> {
        self.ensure_live()?;
        let address = self
            .images
            .resolve_export(symbol)
            .or_else(|| self.kernel.state.stubs.find_symbol(symbol))
            .ok_or_else(|| EmulatorError::UnresolvedSymbol {
                library: String::new(),
                symbol: symbol.to_string(),
            })?;
        debug!("hook {} at {:#x}", symbol, address);
        Ok(self.hooks.add_api_hook(address, callback))
    }

    pub fn read_register(&self, name: &str) -> Result<u64> {
        self.ensure_live()?;
        let reg = self
            .machine
            .arch
            .arch
            .reg_by_name(name)
            .ok_or_else(|| EmulatorError::InvalidRegister(name.to_string()))?;
        Registers::read(&self.machine, reg)
    }

    pub fn write_register(&mut self, name: &str, value: u64) -> Result<()> {
        self.ensure_live()?;
        let reg = self
            .machine
            .arch
            .arch
            .reg_by_name(name)
            .ok_or_else(|| EmulatorError::InvalidRegister(name.to_string()))?;
        Registers::write(&mut self.machine, reg, value)
    }

    pub fn registers(&self) -> Result<std::collections::BTreeMap<String, u64>> {
        self.ensure_live()?;
        self.machine.named_registers()
    }

    /// Guest-permission checked read.
    pub fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.ensure_live()?;
        Memory::read(&self.machine, address, len)
    }

    /// Guest-permission checked write.
    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.ensure_live()?;
        Memory::write(&mut self.machine, address, data)?;
        self.machine.cpu.invalidate_code_cache(address, data.len() as u64);
        Ok(())
    }

    /// Read mapped memory whatever its protection.
    pub fn peek(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.ensure_live()?;
        self.machine.mem.peek(address, len)
    }

    /// Write mapped memory whatever its protection, as a debugger does.
    pub fn poke(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.ensure_live()?;
        self.machine.mem.write_raw(address, data)?;
        self.machine.cpu.invalidate_code_cache(address, data.len() as u64);
        Ok(())
    }

    pub fn patch(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        self.ensure_live()?;
        hooks::patch(&mut self.machine, address, bytes)
    }

    /// Capture the current state; a second call with no execution in between
    /// returns the same id.
    pub fn checkpoint(&mut self) -> Result<u64> {
        self.ensure_live()?;
        self.chain
            .capture(&mut self.machine, &self.kernel, self.exec.retired)
    }

    /// Go back to checkpoint `id`. Later checkpoints stay available.
    pub fn restore(&mut self, id: u64) -> Result<EmuState> {
        self.ensure_live()?;
        let retired = self.chain.restore(id, &mut self.machine, &mut self.kernel)?;
        self.exec.retired = retired;
        self.exec.skip_break_at = None;
        self.exec.skip_hooks_at = None;
        self.exec.block_start = true;
        self.exec.state = EmuState::Paused(PauseReason::Restored);
        Ok(self.exec.state.clone())
    }

    pub fn checkpoints(&self) -> Vec<CheckpointSummary> {
        self.chain.list()
    }

    /// Forget every checkpoint; the next one is a full image.
    pub fn reset_checkpoints(&mut self) {
        self.chain.reset();
    }

    /// Execute `n` instructions, ignoring breakpoints at the current pc.
    pub fn step(&mut self, n: u64) -> Result<EmuState> {
        self.run(RunUntil::Count(n), RunLimits::default())
    }

    /// Move `n` instructions back: restore the nearest earlier checkpoint and
    /// replay forward to the target count.
    pub fn step_back(&mut self, n: u64) -> Result<EmuState> {
        self.ensure_live()?;
        let target = self.exec.retired.saturating_sub(n);
        let (id, at) = self
            .chain
            .nearest_before(target)
            .map(|cp| (cp.id, cp.retired))
            .ok_or_else(|| {
                EmulatorError::InvalidState(format!("no checkpoint at or before {}", target))
            })?;
        debug!("step back to {} from checkpoint {} at {}", target, id, at);
        self.restore(id)?;
        if target == at {
            return Ok(self.exec.state.clone());
        }
        self.exec.replaying = true;
        let result = self.replay_to(target);
        self.exec.replaying = false;
        result
    }

    fn replay_to(&mut self, target: u64) -> Result<EmuState> {
        loop {
            let left = target - self.exec.retired;
            let state = self.run(RunUntil::Count(left), RunLimits::default())?;
            match state {
                // hooks fire again while replaying, pauses they ask for are skipped
                EmuState::Paused(PauseReason::Hook) | EmuState::Stopped(StopReason::HookRequest)
                    if self.exec.retired < target => {}
                other => return Ok(other),
            }
        }
    }

    /// Write the whole checkpoint chain, ending in the current state, so
    /// `load_session` can rebuild this session elsewhere.
    pub fn save_session(&mut self, path: impl AsRef<Path>) -> Result<u64> {
        let head = self.checkpoint()?;
        let file = SessionFile {
            version: SessionFile::VERSION,
            arch: self.machine.arch,
            os: self.kernel.os,
            format: self.format,
            exe_path: self.exe_path.clone(),
            config: self.config.clone(),
            images: self.images.clone(),
            load_info: self.load_info,
            head,
            checkpoints: self.chain.checkpoints().to_vec(),
        };
        std::fs::write(path.as_ref(), file.to_json()?)?;
        info!(
            "saved {} checkpoints to {}",
            self.chain.len(),
            path.as_ref().display()
        );
        Ok(head)
    }

    /// A fresh session positioned at the head checkpoint of a saved one.
    pub fn load_session(
        path: impl AsRef<Path>,
        engine: impl FnOnce(ArchInfo) -> Result<Box<dyn CpuEngine>>,
    ) -> Result<Self> {
        let file = SessionFile::from_json(&std::fs::read_to_string(path.as_ref())?)?;
        let mut machine = Machine::new(engine(file.arch)?);
        machine.mem.set_budget(file.config.memory.budget());
        let layout = file.config.memory.resolve(file.os, file.arch.pointer_size());
        let kernel = Kernel::new(file.os, file.arch.arch, &file.config, layout, &file.exe_path)?;
        let chain = CheckpointChain::from_checkpoints(file.checkpoints)?;
        let mut emu = Self {
            config: file.config,
            machine,
            kernel,
            hooks: HookRegistry::new(),
            images: file.images,
            load_info: file.load_info,
            format: file.format,
            exe_path: file.exe_path,
            exec: ExecState::default(),
            control: ControlHandle::default(),
            chain,
            torn_down: false,
        };
        emu.restore(file.head)?;
        Ok(emu)
    }

    /// Release guest resources and memory. Every later operation fails with
    /// `SessionTornDown`.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        info!("tearing down session for {}", self.exe_path);
        self.kernel.teardown();
        self.machine.mem.clear();
        self.hooks = HookRegistry::new();
        self.chain.reset();
        self.torn_down = true;
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        self.kernel.teardown();
    }
}
