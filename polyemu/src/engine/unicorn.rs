//! Cpu engine backed by unicorn. The address space stays the source of truth:
//! unicorn holds a copy of every non-mmio region, host-side changes are pushed
//! before each run and guest writes are pulled back after it.

use super::{BatchEnd, Bus, CpuEngine, CpuException, RunOutcome, StepOutcome, StopCondition, Trap};
use crate::{
    arch::{ArchInfo, ArchType, RegId, RegisterX86},
    errors::{EmulatorError, Result},
    memory::{Access, AddressSpace, Backing, Permission},
    utils::align,
    PAGE_SIZE,
};
use log::{trace, warn};
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    ops::Range,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use unicorn_engine::{
    unicorn_const::{uc_error, Arch, HookType, MemType, Mode, Permission as UcPermission},
    InsnSysX86, RegisterARM, RegisterARM64, RegisterMIPS, RegisterRISCV, RegisterX86 as UcX86, Unicorn,
};

/// Instructions between two wall-clock checks.
const DEADLINE_POLL: u64 = 1024;

fn uc_perms(perms: Permission) -> UcPermission {
    let mut p = UcPermission::NONE;
    if perms.contains(Permission::READ) {
        p |= UcPermission::READ;
    }
    if perms.contains(Permission::WRITE) {
        p |= UcPermission::WRITE;
    }
    if perms.contains(Permission::EXEC) {
        p |= UcPermission::EXEC;
    }
    p
}

/// Unicorn register ids in the declaration order of our register enums.
fn register_table(arch: ArchType) -> Vec<i32> {
    use UcX86 as X;
    match arch {
        ArchType::X86 => [
            X::EAX,
            X::ECX,
            X::EDX,
            X::EBX,
            X::ESP,
            X::EBP,
            X::ESI,
            X::EDI,
            X::EIP,
            X::EFLAGS,
            X::CS,
            X::SS,
            X::DS,
            X::ES,
            X::FS,
            X::GS,
            X::FS_BASE,
            X::GS_BASE,
        ]
        .iter()
        .map(|r| *r as i32)
        .collect(),
        ArchType::X8664 => [
            X::RAX,
            X::RBX,
            X::RCX,
            X::RDX,
            X::RSI,
            X::RDI,
            X::RBP,
            X::RSP,
            X::R8,
            X::R9,
            X::R10,
            X::R11,
            X::R12,
            X::R13,
            X::R14,
            X::R15,
            X::RIP,
            X::RFLAGS,
            X::CS,
            X::SS,
            X::DS,
            X::ES,
            X::FS,
            X::GS,
            X::FS_BASE,
            X::GS_BASE,
        ]
        .iter()
        .map(|r| *r as i32)
        .collect(),
        ArchType::Arm => {
            let mut regs: Vec<i32> = (0..13).map(|i| RegisterARM::R0 as i32 + i).collect();
            regs.extend(
                [
                    RegisterARM::SP,
                    RegisterARM::LR,
                    RegisterARM::PC,
                    RegisterARM::CPSR,
                    RegisterARM::C13_C0_3,
                ]
                .iter()
                .map(|r| *r as i32),
            );
            regs
        }
        ArchType::Arm64 => {
            let mut regs: Vec<i32> = (0..29).map(|i| RegisterARM64::X0 as i32 + i).collect();
            regs.extend(
                [
                    RegisterARM64::FP,
                    RegisterARM64::LR,
                    RegisterARM64::SP,
                    RegisterARM64::PC,
                    RegisterARM64::NZCV,
                    RegisterARM64::TPIDR_EL0,
                ]
                .iter()
                .map(|r| *r as i32),
            );
            regs
        }
        ArchType::Mips => {
            let mut regs: Vec<i32> = (0..32).map(|i| RegisterMIPS::R0 as i32 + i).collect();
            regs.extend(
                [
                    RegisterMIPS::PC,
                    RegisterMIPS::HI,
                    RegisterMIPS::LO,
                    RegisterMIPS::CP0_USERLOCAL,
                ]
                .iter()
                .map(|r| *r as i32),
            );
            regs
        }
        ArchType::Riscv64 => {
            let mut regs: Vec<i32> = (0..32).map(|i| RegisterRISCV::X0 as i32 + i).collect();
            regs.push(RegisterRISCV::PC as i32);
            regs
        }
    }
}

/// State shared with the hook closures during one `emu_start`.
#[derive(Default)]
struct RunState {
    breaks: Vec<Range<u64>>,
    until: Option<u64>,
    cancel: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
    executed: u64,
    last_pc: u64,
    end: Option<BatchEnd>,
    trap: Option<Trap>,
    fault: Option<CpuException>,
    /// guest accesses in program order; reads only while stepping.
    accesses: Vec<(Access, u64, usize)>,
    record_reads: bool,
}

impl RunState {
    fn reset(&mut self, stop: &StopCondition, record_reads: bool) {
        *self = RunState {
            breaks: stop.breaks.clone(),
            until: stop.until,
            cancel: stop.cancel.clone(),
            deadline: stop.deadline,
            record_reads,
            ..Default::default()
        };
    }

    /// Checked before each instruction.
    fn stop_before(&mut self, pc: u64) -> bool {
        if self.until == Some(pc) || self.breaks.iter().any(|r| r.contains(&pc)) {
            self.end = Some(BatchEnd::Break);
            return true;
        }
        let cancelled = self
            .cancel
            .as_ref()
            .map_or(false, |c| c.load(Ordering::SeqCst));
        let late = self.executed % DEADLINE_POLL == 0
            && self.deadline.map_or(false, |d| Instant::now() >= d);
        if cancelled || late {
            self.end = Some(BatchEnd::Cancelled);
            return true;
        }
        false
    }
}

fn classify_interrupt(arch: ArchType, intno: u32) -> Trap {
    match (arch, intno) {
        (ArchType::X86 | ArchType::X8664, 0) => Trap::Exception(CpuException::DivideByZero),
        (ArchType::X86 | ArchType::X8664, 6) => Trap::Exception(CpuException::IllegalInstruction),
        (ArchType::X86 | ArchType::X8664, 13) => Trap::Exception(CpuException::GeneralProtection),
        _ => Trap::Interrupt(intno),
    }
}

pub struct UnicornEngine {
    arch: ArchInfo,
    uc: Unicorn<'static, ()>,
    regs: Vec<i32>,
    /// registers unicorn cannot hold in this mode, kept here.
    shadow: BTreeMap<RegId, u64>,
    /// regions mirrored into unicorn: base -> (size, perms).
    mapped: BTreeMap<u64, (u64, Permission)>,
    generation: Option<u64>,
    run: Rc<RefCell<RunState>>,
}

impl UnicornEngine {
    pub fn new(arch: ArchInfo) -> Result<Self> {
        let (uc_arch, mode) = match arch.arch {
            ArchType::X86 => (Arch::X86, Mode::MODE_32),
            ArchType::X8664 => (Arch::X86, Mode::MODE_64),
            ArchType::Arm => (Arch::ARM, Mode::ARM),
            ArchType::Arm64 => (Arch::ARM64, Mode::ARM),
            ArchType::Mips => (Arch::MIPS, Mode::MIPS32),
            ArchType::Riscv64 => (Arch::RISCV, Mode::RISCV64),
        };
        let mode = match arch.big_endian {
            true => mode | Mode::BIG_ENDIAN,
            false => mode,
        };
        let mut uc = Unicorn::new(uc_arch, mode)?;
        let run = Rc::new(RefCell::new(RunState::default()));

        uc.add_code_hook(1, 0, {
            let run = run.clone();
            move |uc, address, _size| {
                let stop = {
                    let mut run = run.borrow_mut();
                    let stop = run.stop_before(address);
                    if !stop {
                        run.executed += 1;
                        run.last_pc = address;
                    }
                    stop
                };
                if stop {
                    let _ = uc.emu_stop();
                }
            }
        })?;
        uc.add_mem_hook(HookType::MEM_WRITE | HookType::MEM_READ_AFTER, 1, 0, {
            let run = run.clone();
            move |_, kind, address, size, _value| {
                let mut run = run.borrow_mut();
                match kind {
                    MemType::WRITE => run.accesses.push((Access::Write, address, size)),
                    MemType::READ_AFTER if run.record_reads => {
                        run.accesses.push((Access::Read, address, size))
                    }
                    _ => {}
                }
                true
            }
        })?;
        uc.add_mem_hook(HookType::MEM_UNMAPPED | HookType::MEM_PROT, 1, 0, {
            let run = run.clone();
            move |_, kind, address, size, _value| {
                let access = match kind {
                    MemType::WRITE_UNMAPPED | MemType::WRITE_PROT => Access::Write,
                    MemType::FETCH_UNMAPPED | MemType::FETCH_PROT => Access::Execute,
                    _ => Access::Read,
                };
                run.borrow_mut().fault = Some(CpuException::AccessViolation {
                    address,
                    size: size as u64,
                    access,
                });
                false
            }
        })?;
        uc.add_intr_hook({
            let run = run.clone();
            let arch = arch.arch;
            move |uc, intno| {
                run.borrow_mut().trap = Some(classify_interrupt(arch, intno));
                let _ = uc.emu_stop();
            }
        })?;
        if arch.arch == ArchType::X8664 {
            uc.add_insn_sys_hook(InsnSysX86::SYSCALL, 1, 0, {
                let run = run.clone();
                move |uc| {
                    run.borrow_mut().trap = Some(Trap::Syscall);
                    let _ = uc.emu_stop();
                }
            })?;
        }
        Ok(Self {
            arch,
            uc,
            regs: register_table(arch.arch),
            shadow: BTreeMap::new(),
            mapped: BTreeMap::new(),
            generation: None,
            run,
        })
    }

    /// 32-bit x86 segment bases need a descriptor table unicorn does not
    /// model for us.
    fn is_shadowed(&self, reg: RegId) -> bool {
        self.arch.arch == ArchType::X86
            && (reg == RegisterX86::FS_BASE as RegId || reg == RegisterX86::GS_BASE as RegId)
    }

    fn uc_reg(&self, reg: RegId) -> Result<i32> {
        usize::try_from(reg)
            .ok()
            .and_then(|i| self.regs.get(i))
            .copied()
            .ok_or_else(|| EmulatorError::InvalidRegister(format!("{} register {}", self.arch.arch, reg)))
    }

    /// Mirror the region layout when it changed since the last run.
    fn sync_layout(&mut self, mem: &AddressSpace) -> Result<()> {
        if self.generation == Some(mem.layout_generation()) {
            return Ok(());
        }
        let wanted: BTreeMap<u64, (u64, Permission)> = mem
            .regions()
            .filter(|r| !matches!(r.backing, Backing::Mmio { .. }))
            .map(|r| (r.base, (r.size, r.perms)))
            .collect();
        for (base, (size, perms)) in &self.mapped {
            if wanted.get(base) != Some(&(*size, *perms)) {
                self.uc.mem_unmap(*base, *size as usize)?;
            }
        }
        for (base, (size, perms)) in &wanted {
            if self.mapped.get(base) != Some(&(*size, *perms)) {
                trace!("unicorn map [{:#x}, +{:#x}) {:?}", base, size, perms);
                self.uc.mem_map(*base, *size as usize, uc_perms(*perms))?;
                self.uc.mem_write(*base, &mem.peek(*base, *size as usize)?)?;
            }
        }
        self.mapped = wanted;
        self.generation = Some(mem.layout_generation());
        Ok(())
    }

    /// Push pages the host side changed.
    fn push_pages(&mut self, mem: &mut AddressSpace) -> Result<()> {
        for page in mem.take_sync_pages() {
            let mirrored = self
                .mapped
                .range(..=page)
                .next_back()
                .map_or(false, |(base, (size, _))| page < base + size);
            if mirrored {
                self.uc.mem_write(page, &mem.peek(page, PAGE_SIZE as usize)?)?;
            }
        }
        Ok(())
    }

    fn start_address(&self) -> Result<u64> {
        let pc = self.reg_read(self.arch.pc_reg())?;
        // thumb state is carried in bit 0 of the start address
        if self.arch.arch == ArchType::Arm {
            let cpsr = self.uc.reg_read(RegisterARM::CPSR)?;
            if cpsr & 0x20 != 0 {
                return Ok(pc | 1);
            }
        }
        Ok(pc)
    }

    fn execute(&mut self, bus: &mut dyn Bus, stop: &StopCondition, stepping: bool) -> Result<RunOutcome> {
        if stop.max_instructions == 0 {
            return Ok(RunOutcome {
                executed: 0,
                end: BatchEnd::Exhausted,
            });
        }
        self.sync_layout(bus.address_space())?;
        self.push_pages(bus.address_space())?;
        self.run.borrow_mut().reset(stop, stepping);
        let begin = self.start_address()?;
        let result = self
            .uc
            .emu_start(begin, u64::MAX, 0, stop.max_instructions as usize);

        let (mut executed, end, trap, fault, last_pc, accesses) = {
            let mut run = self.run.borrow_mut();
            (
                run.executed,
                run.end.take(),
                run.trap.take(),
                run.fault.take(),
                run.last_pc,
                std::mem::take(&mut run.accesses),
            )
        };
        let end = match result {
            Ok(()) => match (trap, end) {
                (Some(Trap::Exception(e)), _) => {
                    executed = executed.saturating_sub(1);
                    BatchEnd::Trap(Trap::Exception(e))
                }
                (Some(trap), _) => BatchEnd::Trap(trap),
                (None, Some(end)) => end,
                (None, None) if executed < stop.max_instructions && self.halted_at(last_pc)? => {
                    executed -= 1;
                    self.reg_write(self.arch.pc_reg(), last_pc)?;
                    BatchEnd::Trap(Trap::Exception(CpuException::Halt))
                }
                (None, None) => BatchEnd::Exhausted,
            },
            Err(e) => {
                let exception = match (e, fault) {
                    (_, Some(fault)) => fault,
                    (uc_error::INSN_INVALID, None) => CpuException::IllegalInstruction,
                    (uc_error::EXCEPTION, None) => CpuException::GeneralProtection,
                    (other, None) => return Err(other.into()),
                };
                executed = executed.saturating_sub(1);
                BatchEnd::Trap(Trap::Exception(exception))
            }
        };
        self.pull_accesses(bus, accesses, stepping)?;
        Ok(RunOutcome { executed, end })
    }

    fn halted_at(&self, pc: u64) -> Result<bool> {
        if !matches!(self.arch.arch, ArchType::X86 | ArchType::X8664) {
            return Ok(false);
        }
        let mut byte = [0u8; 1];
        Ok(self.uc.mem_read(pc, &mut byte).is_ok() && byte[0] == 0xf4)
    }

    /// Bring guest writes into the address space. While stepping they go
    /// through the bus so memory hooks see them, and may veto them.
    fn pull_accesses(&mut self, bus: &mut dyn Bus, accesses: Vec<(Access, u64, usize)>, stepping: bool) -> Result<()> {
        let mut pages = BTreeSet::new();
        for (access, address, size) in accesses {
            match access {
                Access::Write => {
                    let data = self.uc.mem_read_as_vec(address, size)?;
                    if stepping {
                        bus.write(address, &data)?;
                    } else {
                        bus.address_space().write_raw(address, &data)?;
                        let mut page = align(address, PAGE_SIZE);
                        while page < address + size as u64 {
                            pages.insert(page);
                            page += PAGE_SIZE;
                        }
                    }
                }
                _ if stepping => {
                    bus.read(address, size)?;
                }
                _ => {}
            }
        }
        bus.address_space().forget_sync_pages(pages);
        Ok(())
    }
}

impl CpuEngine for UnicornEngine {
    fn arch(&self) -> ArchInfo {
        self.arch
    }

    fn reg_read(&self, reg: RegId) -> Result<u64> {
        if self.is_shadowed(reg) {
            return Ok(self.shadow.get(&reg).copied().unwrap_or_default());
        }
        Ok(self.uc.reg_read(self.uc_reg(reg)?)?)
    }

    fn reg_write(&mut self, reg: RegId, value: u64) -> Result<()> {
        if self.is_shadowed(reg) {
            self.shadow.insert(reg, value);
            return Ok(());
        }
        let id = self.uc_reg(reg)?;
        Ok(self.uc.reg_write(id, value)?)
    }

    fn step(&mut self, bus: &mut dyn Bus) -> Result<StepOutcome> {
        let stop = StopCondition {
            max_instructions: 1,
            ..Default::default()
        };
        let outcome = self.execute(bus, &stop, true)?;
        Ok(match outcome.end {
            BatchEnd::Trap(trap) => StepOutcome::Trap(trap),
            _ => StepOutcome::Executed,
        })
    }

    fn run_until(&mut self, bus: &mut dyn Bus, stop: &StopCondition) -> Result<RunOutcome> {
        self.execute(bus, stop, false)
    }

    fn invalidate_code_cache(&mut self, addr: u64, len: u64) {
        if let Err(e) = self.uc.ctl_remove_cache(addr, addr.saturating_add(len)) {
            warn!("dropping translations at {:#x} failed: {:?}", addr, e);
        }
    }
}
