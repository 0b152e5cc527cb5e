//! Deterministic scripted cpu for unit tests: a small x86/x86-64 subset.

use crate::{
    arch::{ArchInfo, ArchType, RegId, RegisterX86, RegisterX8664},
    engine::{Bus, CpuEngine, CpuException, StepOutcome, Trap},
    errors::{EmulatorError, Result},
    registers::RegisterFile,
};
use goblin::container::Endian;
use std::{cell::Cell, collections::BTreeMap, rc::Rc};

const ZF: u64 = 1 << 6;

#[derive(Copy, Clone, Debug)]
enum Op {
    Nop,
    MovImm { reg: usize, imm: u64 },
    Int(u8),
    Syscall,
    Ud2,
    Hlt,
    Jmp(i64),
    Jz(i64),
    Jnz(i64),
    Call(i64),
    /// `call [abs32]`, or `call [rip+disp32]` in long mode.
    CallIndirect(u64),
    Ret,
    StoreAbs(u64),
    LoadAbs(u64),
    Inc(usize),
    Dec(usize),
    AddImm(u64),
    PushImm(u64),
    Push(usize),
    Pop(usize),
    MovRR { dst: usize, src: usize },
    Store { base: usize, src: usize },
    Load { dst: usize, base: usize },
    Xor { dst: usize, src: usize },
    Div(usize),
}

#[derive(Copy, Clone, Debug)]
struct Insn {
    len: u64,
    wide: bool,
    op: Op,
}

struct Fetcher<'b> {
    bus: &'b mut dyn Bus,
    pc: u64,
    len: u64,
}

impl Fetcher<'_> {
    fn u8(&mut self) -> Result<u8> {
        let b = self.bus.fetch(self.pc + self.len, 1)?[0];
        self.len += 1;
        Ok(b)
    }

    fn u32(&mut self) -> Result<u64> {
        let mut v = 0u64;
        for i in 0..4 {
            v |= (self.u8()? as u64) << (8 * i);
        }
        Ok(v)
    }
}

pub struct TinyX86 {
    arch: ArchInfo,
    regs: RegisterFile,
    cache: BTreeMap<u64, Insn>,
    generation: u64,
    pub invalidations: Rc<Cell<usize>>,
}

impl TinyX86 {
    pub fn new(arch: ArchType) -> Self {
        assert!(matches!(arch, ArchType::X86 | ArchType::X8664));
        Self {
            arch: ArchInfo::new(arch, Endian::Little),
            regs: RegisterFile::new(arch.register_count()),
            cache: BTreeMap::new(),
            generation: u64::MAX,
            invalidations: Rc::new(Cell::new(0)),
        }
    }

    fn long_mode(&self) -> bool {
        self.arch.arch == ArchType::X8664
    }

    /// ModRM register number to register id.
    fn gpr(&self, n: usize) -> RegId {
        if self.long_mode() {
            const MAP: [RegisterX8664; 16] = [
                RegisterX8664::RAX,
                RegisterX8664::RCX,
                RegisterX8664::RDX,
                RegisterX8664::RBX,
                RegisterX8664::RSP,
                RegisterX8664::RBP,
                RegisterX8664::RSI,
                RegisterX8664::RDI,
                RegisterX8664::R8,
                RegisterX8664::R9,
                RegisterX8664::R10,
                RegisterX8664::R11,
                RegisterX8664::R12,
                RegisterX8664::R13,
                RegisterX8664::R14,
                RegisterX8664::R15,
            ];
            MAP[n].into()
        } else {
            n as RegId
        }
    }

    fn flags_reg(&self) -> RegId {
        if self.long_mode() {
            RegisterX8664::RFLAGS.into()
        } else {
            RegisterX86::EFLAGS.into()
        }
    }

    fn get(&self, n: usize) -> u64 {
        self.regs.get(self.gpr(n)).unwrap_or_default()
    }

    fn set(&mut self, n: usize, v: u64, wide: bool) {
        let v = if wide { v } else { v & 0xffff_ffff };
        let _ = self.regs.set(self.gpr(n), v);
    }

    fn set_zf(&mut self, value: u64, wide: bool) {
        let value = if wide { value } else { value & 0xffff_ffff };
        let flags = self.regs.get(self.flags_reg()).unwrap_or_default();
        let flags = if value == 0 { flags | ZF } else { flags & !ZF };
        let _ = self.regs.set(self.flags_reg(), flags);
    }

    fn ptr_size(&self) -> usize {
        if self.long_mode() {
            8
        } else {
            4
        }
    }

    fn decode(&self, bus: &mut dyn Bus, pc: u64) -> Result<Insn> {
        let mut f = Fetcher { bus, pc, len: 0 };
        let mut rex_w = false;
        let mut rex_b = 0usize;
        let mut op = f.u8()?;
        if self.long_mode() && (0x40..=0x4f).contains(&op) {
            rex_w = op & 8 != 0;
            rex_b = ((op & 1) as usize) << 3;
            op = f.u8()?;
        }
        let long = self.long_mode();
        let decoded = match op {
            0x90 => Op::Nop,
            0xb8..=0xbf => {
                let reg = (op - 0xb8) as usize | rex_b;
                let mut imm = f.u32()?;
                if rex_w {
                    imm |= f.u32()? << 32;
                }
                Op::MovImm { reg, imm }
            }
            0xcd => Op::Int(f.u8()?),
            0xcc => Op::Int(3),
            0x0f => match f.u8()? {
                0x05 => Op::Syscall,
                0x0b => Op::Ud2,
                _ => Op::Ud2,
            },
            0xf4 => Op::Hlt,
            0xeb => Op::Jmp(f.u8()? as i8 as i64),
            0x74 => Op::Jz(f.u8()? as i8 as i64),
            0x75 => Op::Jnz(f.u8()? as i8 as i64),
            0xe9 => Op::Jmp(f.u32()? as u32 as i32 as i64),
            0xe8 => Op::Call(f.u32()? as u32 as i32 as i64),
            0xff => {
                let modrm = f.u8()?;
                if modrm != 0x15 {
                    return Err(EmulatorError::Engine("unsupported ff form".into()));
                }
                Op::CallIndirect(f.u32()?)
            }
            0xc3 => Op::Ret,
            0xa3 if !long => Op::StoreAbs(f.u32()?),
            0xa1 if !long => Op::LoadAbs(f.u32()?),
            0x40..=0x47 if !long => Op::Inc((op - 0x40) as usize),
            0x48..=0x4f if !long => Op::Dec((op - 0x48) as usize),
            0x05 => Op::AddImm(f.u32()?),
            0x68 => Op::PushImm(f.u32()? as u32 as i32 as i64 as u64),
            0x50..=0x57 => Op::Push((op - 0x50) as usize | rex_b),
            0x58..=0x5f => Op::Pop((op - 0x58) as usize | rex_b),
            0x89 | 0x8b | 0x31 => {
                let modrm = f.u8()?;
                let md = modrm >> 6;
                let reg = ((modrm >> 3) & 7) as usize;
                let rm = (modrm & 7) as usize | rex_b;
                match (op, md) {
                    (0x89, 3) => Op::MovRR { dst: rm, src: reg },
                    (0x8b, 3) => Op::MovRR { dst: reg, src: rm },
                    (0x31, 3) => Op::Xor { dst: rm, src: reg },
                    (0x89, 0) if rm & 7 != 4 && rm & 7 != 5 => Op::Store { base: rm, src: reg },
                    (0x8b, 0) if rm & 7 != 4 && rm & 7 != 5 => Op::Load { dst: reg, base: rm },
                    _ => return Err(EmulatorError::Engine("unsupported modrm".into())),
                }
            }
            0xf7 => {
                let modrm = f.u8()?;
                if modrm & 0xf8 != 0xf0 {
                    return Err(EmulatorError::Engine("unsupported f7 form".into()));
                }
                Op::Div((modrm & 7) as usize | rex_b)
            }
            _ => return Err(EmulatorError::Engine(format!("unknown opcode {:#x}", op))),
        };
        Ok(Insn {
            len: f.len,
            wide: rex_w,
            op: decoded,
        })
    }

    fn push(&mut self, bus: &mut dyn Bus, value: u64) -> Result<()> {
        let size = self.ptr_size();
        let sp = self.get(4).wrapping_sub(size as u64);
        bus.write(sp, &value.to_le_bytes()[..size])?;
        self.set(4, sp, true);
        Ok(())
    }

    fn pop(&mut self, bus: &mut dyn Bus) -> Result<u64> {
        let size = self.ptr_size();
        let sp = self.get(4);
        let v = le(&bus.read(sp, size)?);
        self.set(4, sp + size as u64, true);
        Ok(v)
    }

    fn execute(&mut self, bus: &mut dyn Bus, pc: u64, insn: Insn) -> Result<StepOutcome> {
        let next = pc + insn.len;
        let wide = insn.wide || matches!(insn.op, Op::Push(_) | Op::Pop(_));
        let width = if insn.wide { 8 } else { 4 };
        let mut new_pc = next;
        let mut outcome = StepOutcome::Executed;
        match insn.op {
            Op::Nop => {}
            Op::MovImm { reg, imm } => self.set(reg, imm, wide),
            Op::Int(n) => outcome = StepOutcome::Trap(Trap::Interrupt(n as u32)),
            Op::Syscall => outcome = StepOutcome::Trap(Trap::Syscall),
            Op::Ud2 => return Ok(exception(CpuException::IllegalInstruction)),
            Op::Hlt => return Ok(exception(CpuException::Halt)),
            Op::Jmp(rel) => new_pc = next.wrapping_add(rel as u64),
            Op::Jz(rel) | Op::Jnz(rel) => {
                let zf = self.regs.get(self.flags_reg()).unwrap_or_default() & ZF != 0;
                if zf == matches!(insn.op, Op::Jz(_)) {
                    new_pc = next.wrapping_add(rel as u64);
                }
            }
            Op::Call(rel) => {
                self.push(bus, next)?;
                new_pc = next.wrapping_add(rel as u64);
            }
            Op::CallIndirect(disp) => {
                let slot = if self.long_mode() {
                    next.wrapping_add(disp as u32 as i32 as i64 as u64)
                } else {
                    disp
                };
                let target = le(&bus.read(slot, self.ptr_size())?);
                self.push(bus, next)?;
                new_pc = target;
            }
            Op::Ret => new_pc = self.pop(bus)?,
            Op::StoreAbs(addr) => bus.write(addr, &(self.get(0) as u32).to_le_bytes())?,
            Op::LoadAbs(addr) => {
                let v = le(&bus.read(addr, 4)?);
                self.set(0, v, false);
            }
            Op::Inc(r) => {
                let v = self.get(r).wrapping_add(1);
                self.set(r, v, false);
                self.set_zf(v, false);
            }
            Op::Dec(r) => {
                let v = self.get(r).wrapping_sub(1);
                self.set(r, v, false);
                self.set_zf(v, false);
            }
            Op::AddImm(imm) => {
                let v = self.get(0).wrapping_add(imm);
                self.set(0, v, wide);
                self.set_zf(v, wide);
            }
            Op::PushImm(imm) => self.push(bus, imm)?,
            Op::Push(r) => {
                let v = self.get(r);
                self.push(bus, v)?
            }
            Op::Pop(r) => {
                let v = self.pop(bus)?;
                self.set(r, v, true);
            }
            Op::MovRR { dst, src } => {
                let v = self.get(src);
                self.set(dst, v, wide);
            }
            Op::Store { base, src } => {
                let v = self.get(src);
                bus.write(self.get(base), &v.to_le_bytes()[..width])?
            }
            Op::Load { dst, base } => {
                let v = le(&bus.read(self.get(base), width)?);
                self.set(dst, v, wide);
            }
            Op::Xor { dst, src } => {
                let v = self.get(dst) ^ self.get(src);
                self.set(dst, v, wide);
                self.set_zf(v, wide);
            }
            Op::Div(r) => {
                let divisor = self.get(r);
                if divisor == 0 {
                    return Ok(exception(CpuException::DivideByZero));
                }
                let eax = self.get(0);
                self.set(0, eax / divisor, wide);
                self.set(2, eax % divisor, wide);
            }
        }
        let _ = self.regs.set(self.arch.pc_reg(), new_pc);
        Ok(outcome)
    }
}

fn exception(e: CpuException) -> StepOutcome {
    StepOutcome::Trap(Trap::Exception(e))
}

fn le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

impl CpuEngine for TinyX86 {
    fn arch(&self) -> ArchInfo {
        self.arch
    }

    fn reg_read(&self, reg: RegId) -> Result<u64> {
        self.regs.get(reg)
    }

    fn reg_write(&mut self, reg: RegId, value: u64) -> Result<()> {
        self.regs.set(reg, value)
    }

    fn step(&mut self, bus: &mut dyn Bus) -> Result<StepOutcome> {
        let generation = bus.address_space().layout_generation();
        if generation != self.generation {
            self.cache.clear();
            self.generation = generation;
        }
        let pc = self.regs.get(self.arch.pc_reg())?;
        let insn = match self.cache.get(&pc) {
            Some(insn) => *insn,
            None => match self.decode(bus, pc) {
                Ok(insn) => {
                    self.cache.insert(pc, insn);
                    insn
                }
                Err(EmulatorError::Engine(_)) => {
                    return Ok(exception(CpuException::IllegalInstruction))
                }
                Err(e) => return Ok(exception(CpuException::from_bus_error(e)?)),
            },
        };
        let saved = self.regs.clone();
        match self.execute(bus, pc, insn) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // the faulting instruction does not retire
                self.regs = saved;
                Ok(exception(CpuException::from_bus_error(e)?))
            }
        }
    }

    fn invalidate_code_cache(&mut self, addr: u64, len: u64) {
        self.invalidations.set(self.invalidations.get() + 1);
        let end = addr.saturating_add(len);
        // an instruction starting up to 15 bytes earlier may overlap the range
        let doomed: Vec<u64> = self
            .cache
            .range(addr.saturating_sub(15)..end)
            .map(|(k, _)| *k)
            .collect();
        for pc in doomed {
            self.cache.remove(&pc);
        }
    }
}

/// Little helper to assemble the subset above.
pub mod asm {
    pub fn mov_eax(imm: u32) -> Vec<u8> {
        mov_r32(0, imm)
    }
    pub fn mov_r32(reg: u8, imm: u32) -> Vec<u8> {
        let mut v = vec![0xb8 + reg];
        v.extend_from_slice(&imm.to_le_bytes());
        v
    }
    pub fn int80() -> Vec<u8> {
        vec![0xcd, 0x80]
    }
    pub fn syscall() -> Vec<u8> {
        vec![0x0f, 0x05]
    }
    pub fn nop() -> Vec<u8> {
        vec![0x90]
    }
    pub fn jmp8(rel: i8) -> Vec<u8> {
        vec![0xeb, rel as u8]
    }
    pub fn call_abs_indirect(slot: u32) -> Vec<u8> {
        let mut v = vec![0xff, 0x15];
        v.extend_from_slice(&slot.to_le_bytes());
        v
    }
    pub fn store_eax(addr: u32) -> Vec<u8> {
        let mut v = vec![0xa3];
        v.extend_from_slice(&addr.to_le_bytes());
        v
    }
    pub fn load_eax(addr: u32) -> Vec<u8> {
        let mut v = vec![0xa1];
        v.extend_from_slice(&addr.to_le_bytes());
        v
    }
    pub fn push_imm(imm: u32) -> Vec<u8> {
        let mut v = vec![0x68];
        v.extend_from_slice(&imm.to_le_bytes());
        v
    }
    pub fn concat(parts: &[Vec<u8>]) -> Vec<u8> {
        parts.concat()
    }
}

/// Byte builders for minimal, well-formed executables.
pub mod images {
    use crate::arch::ArchType;
    use bytes::{BufMut, BytesMut};

    /// File offset (and offset from the load base) of the code.
    pub const ELF_CODE_OFFSET: u64 = 0x80;
    pub const PE_TEXT_RVA: u64 = 0x1000;

    const PE_FILE_ALIGNMENT: usize = 0x200;

    fn machine(arch: ArchType) -> u16 {
        match arch {
            ArchType::X86 => 3,
            ArchType::X8664 => 62,
            ArchType::Arm => 40,
            ArchType::Arm64 => 183,
            ArchType::Mips => 8,
            ArchType::Riscv64 => 243,
        }
    }

    /// Little-endian ET_EXEC with a single R+X segment covering the file.
    pub fn elf_exec(arch: ArchType, base: u64, code: &[u8]) -> Vec<u8> {
        let wide = arch.pointer_size() == 8;
        let size = ELF_CODE_OFFSET + code.len() as u64;
        let mut b = BytesMut::new();
        b.put_slice(&[0x7f, b'E', b'L', b'F', if wide { 2 } else { 1 }, 1, 1, 0]);
        b.put_bytes(0, 8);
        b.put_u16_le(2);
        b.put_u16_le(machine(arch));
        b.put_u32_le(1);
        let word = |b: &mut BytesMut, v: u64| {
            if wide {
                b.put_u64_le(v)
            } else {
                b.put_u32_le(v as u32)
            }
        };
        let (ehsize, phentsize, shentsize) = if wide { (64, 56, 64) } else { (52, 32, 40) };
        word(&mut b, base + ELF_CODE_OFFSET);
        word(&mut b, ehsize as u64);
        word(&mut b, 0);
        b.put_u32_le(0);
        for v in [ehsize, phentsize, 1, shentsize, 0, 0] {
            b.put_u16_le(v);
        }
        // PT_LOAD, PF_R | PF_X
        if wide {
            b.put_u32_le(1);
            b.put_u32_le(5);
            for v in [0, base, base, size, size, 0x1000] {
                b.put_u64_le(v);
            }
        } else {
            for v in [1, 0, base, base, size, size, 5, 0x1000] {
                b.put_u32_le(v as u32);
            }
        }
        b.resize(ELF_CODE_OFFSET as usize, 0);
        b.put_slice(code);
        b.to_vec()
    }

    fn pad(b: &mut BytesMut, alignment: usize) {
        let len = (b.len() + alignment - 1) / alignment * alignment;
        b.resize(len, 0);
    }

    /// PE32 executable: `.text` holding `code` at the entry point and an
    /// `.idata` section importing `imports` (dll, symbols).
    pub fn pe32(image_base: u64, code: &[u8], imports: &[(&str, &[&str])]) -> Vec<u8> {
        pe32_with_relocs(image_base, code, imports, &[])
    }

    /// `pe32` plus a `.reloc` section with one HIGHLOW fixup per `.text`
    /// offset in `fixups`.
    pub fn pe32_with_relocs(image_base: u64, code: &[u8], imports: &[(&str, &[&str])], fixups: &[u16]) -> Vec<u8> {
        let idata_rva = 0x2000u32;
        let reloc_rva = 0x3000u32;
        let text_raw = ((code.len() + PE_FILE_ALIGNMENT - 1) / PE_FILE_ALIGNMENT).max(1) * PE_FILE_ALIGNMENT;

        // .idata: descriptors, then per dll ILT and IAT, then names
        let descriptors = (imports.len() + 1) * 20;
        let mut thunks = vec![];
        let mut cursor = descriptors;
        for (_, symbols) in imports {
            let table = (symbols.len() + 1) * 4;
            thunks.push((cursor, cursor + table));
            cursor += 2 * table;
        }
        let mut names = BytesMut::new();
        let mut hint_names = vec![];
        let mut dll_names = vec![];
        for (dll, symbols) in imports {
            let mut entries = vec![];
            for symbol in *symbols {
                entries.push(idata_rva + (cursor + names.len()) as u32);
                names.put_u16_le(0);
                names.put_slice(symbol.as_bytes());
                names.put_u8(0);
                pad(&mut names, 2);
            }
            hint_names.push(entries);
            dll_names.push(idata_rva + (cursor + names.len()) as u32);
            names.put_slice(dll.as_bytes());
            names.put_u8(0);
            pad(&mut names, 2);
        }
        let mut idata = BytesMut::new();
        for (i, (ilt, iat)) in thunks.iter().enumerate() {
            idata.put_u32_le(idata_rva + *ilt as u32);
            idata.put_u32_le(0);
            idata.put_u32_le(0);
            idata.put_u32_le(dll_names[i]);
            idata.put_u32_le(idata_rva + *iat as u32);
        }
        idata.put_bytes(0, 20);
        for entries in &hint_names {
            // lookup table, then the address table the loader overwrites
            for _ in 0..2 {
                for rva in entries {
                    idata.put_u32_le(*rva);
                }
                idata.put_u32_le(0);
            }
        }
        idata.put_slice(&names);
        let idata_len = idata.len();
        let idata_raw = (idata_len + PE_FILE_ALIGNMENT - 1) / PE_FILE_ALIGNMENT * PE_FILE_ALIGNMENT;

        let reloc = (!fixups.is_empty()).then(|| {
            let mut block = BytesMut::new();
            let entries = (fixups.len() + 1) / 2 * 2;
            block.put_u32_le(PE_TEXT_RVA as u32);
            block.put_u32_le(8 + entries as u32 * 2);
            for offset in fixups {
                block.put_u16_le((3 << 12) | offset);
            }
            // IMAGE_REL_BASED_ABSOLUTE keeps the block 4-aligned
            block.resize(8 + entries * 2, 0);
            block
        });
        let reloc_len = reloc.as_ref().map(|r| r.len()).unwrap_or(0);
        let reloc_raw = (reloc_len + PE_FILE_ALIGNMENT - 1) / PE_FILE_ALIGNMENT * PE_FILE_ALIGNMENT;
        let nsections = if reloc.is_some() { 3 } else { 2 };

        let mut b = BytesMut::new();
        b.put_slice(b"MZ");
        b.resize(0x3c, 0);
        b.put_u32_le(0x40);
        b.put_slice(b"PE\0\0");
        // COFF header
        b.put_u16_le(0x14c);
        b.put_u16_le(nsections);
        b.put_u32_le(0);
        b.put_u32_le(0);
        b.put_u32_le(0);
        b.put_u16_le(0xe0);
        b.put_u16_le(0x0102);
        // optional header, standard fields
        b.put_u16_le(0x10b);
        b.put_u8(0);
        b.put_u8(0);
        b.put_u32_le(text_raw as u32);
        b.put_u32_le((idata_raw + reloc_raw) as u32);
        b.put_u32_le(0);
        b.put_u32_le(PE_TEXT_RVA as u32);
        b.put_u32_le(PE_TEXT_RVA as u32);
        b.put_u32_le(idata_rva);
        // windows fields
        b.put_u32_le(image_base as u32);
        b.put_u32_le(0x1000);
        b.put_u32_le(PE_FILE_ALIGNMENT as u32);
        for v in [4u16, 0, 0, 0, 4, 0] {
            b.put_u16_le(v);
        }
        b.put_u32_le(0);
        b.put_u32_le(if reloc.is_some() { 0x4000 } else { 0x3000 });
        b.put_u32_le(PE_FILE_ALIGNMENT as u32);
        b.put_u32_le(0);
        b.put_u16_le(3);
        b.put_u16_le(0);
        for v in [0x10_0000u32, 0x1000, 0x10_0000, 0x1000, 0, 16] {
            b.put_u32_le(v);
        }
        // data directories: import table and base relocations
        for i in 0..16 {
            match i {
                1 => {
                    b.put_u32_le(idata_rva);
                    b.put_u32_le(descriptors as u32);
                }
                5 if reloc.is_some() => {
                    b.put_u32_le(reloc_rva);
                    b.put_u32_le(reloc_len as u32);
                }
                _ => b.put_u64_le(0),
            }
        }
        let sections = [
            (b".text\0\0\0", code.len(), PE_TEXT_RVA as u32, text_raw, PE_FILE_ALIGNMENT, 0x6000_0020u32),
            (b".idata\0\0", idata_len, idata_rva, idata_raw, PE_FILE_ALIGNMENT + text_raw, 0xc000_0040),
            (
                b".reloc\0\0",
                reloc_len,
                reloc_rva,
                reloc_raw,
                PE_FILE_ALIGNMENT + text_raw + idata_raw,
                0x4200_0040,
            ),
        ];
        for (name, vsize, rva, raw, pointer, characteristics) in sections.into_iter().take(nsections as usize) {
            b.put_slice(name);
            b.put_u32_le(vsize as u32);
            b.put_u32_le(rva);
            b.put_u32_le(raw as u32);
            b.put_u32_le(pointer as u32);
            b.put_u32_le(0);
            b.put_u32_le(0);
            b.put_u16_le(0);
            b.put_u16_le(0);
            b.put_u32_le(characteristics);
        }
        b.resize(PE_FILE_ALIGNMENT, 0);
        b.put_slice(code);
        b.resize(PE_FILE_ALIGNMENT + text_raw, 0);
        b.put_slice(&idata);
        b.resize(PE_FILE_ALIGNMENT + text_raw + idata_raw, 0);
        if let Some(reloc) = reloc {
            b.put_slice(&reloc);
            b.resize(PE_FILE_ALIGNMENT + text_raw + idata_raw + reloc_raw, 0);
        }
        b.to_vec()
    }

    fn intern(b: &mut BytesMut, s: &str) -> u64 {
        let at = b.len() as u64;
        b.put_slice(s.as_bytes());
        b.put_u8(0);
        at
    }

    fn uleb(b: &mut BytesMut, mut v: u64) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                b.put_u8(byte);
                break;
            }
            b.put_u8(byte | 0x80);
        }
    }

    /// Pointer slots of `elf_dyn64` images live here.
    pub const ELF_DYN_DATA: u64 = 0x100;
    pub const ELF_DYN_CODE: u64 = 0x200;
    const ELF_DYN_TABLES: usize = 0x300;

    /// x86-64 ET_DYN linked at 0 with one RWX segment over the whole file.
    /// `exports` are defined symbols (name, offset); relocations are
    /// (offset, type, symbol or "", addend) and may name symbols that are
    /// not exported, which become undefined ones. Every name in `needed`
    /// becomes a DT_NEEDED entry.
    pub fn elf_dyn64(
        needed: &[&str],
        exports: &[(&str, u64)],
        relocs: &[(u64, u32, &str, i64)],
        code: &[u8],
    ) -> Vec<u8> {
        assert!(code.len() <= ELF_DYN_TABLES - ELF_DYN_CODE as usize);
        let mut symbols: Vec<(&str, u64)> = exports.to_vec();
        for (_, _, name, _) in relocs {
            if !name.is_empty() && !symbols.iter().any(|(s, _)| s == name) {
                symbols.push((*name, 0));
            }
        }
        let mut dynstr = BytesMut::new();
        dynstr.put_u8(0);
        let needed_names: Vec<u64> = needed.iter().map(|n| intern(&mut dynstr, n)).collect();
        let symbol_names: Vec<u64> = symbols.iter().map(|(n, _)| intern(&mut dynstr, n)).collect();
        pad(&mut dynstr, 8);

        let nsyms = symbols.len() + 1;
        let dynstr_at = ELF_DYN_TABLES as u64;
        let dynsym_at = dynstr_at + dynstr.len() as u64;
        let hash_at = dynsym_at + nsyms as u64 * 24;
        let rela_at = hash_at + ((12 + nsyms * 4 + 7) / 8 * 8) as u64;
        let dynamic_at = rela_at + relocs.len() as u64 * 24;
        let mut dyns: Vec<(u64, u64)> = needed_names.iter().map(|n| (1, *n)).collect();
        dyns.extend([
            (4, hash_at),
            (5, dynstr_at),
            (10, dynstr.len() as u64),
            (6, dynsym_at),
            (11, 24),
            (7, rela_at),
            (8, relocs.len() as u64 * 24),
            (9, 24),
            (0, 0),
        ]);
        let dynamic_size = dyns.len() as u64 * 16;
        let total = dynamic_at + dynamic_size;

        let mut b = BytesMut::new();
        b.put_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        b.put_bytes(0, 8);
        b.put_u16_le(3);
        b.put_u16_le(machine(ArchType::X8664));
        b.put_u32_le(1);
        b.put_u64_le(ELF_DYN_CODE);
        b.put_u64_le(64);
        b.put_u64_le(0);
        b.put_u32_le(0);
        for v in [64u16, 56, 2, 64, 0, 0] {
            b.put_u16_le(v);
        }
        // PT_LOAD, PF_R | PF_W | PF_X
        b.put_u32_le(1);
        b.put_u32_le(7);
        for v in [0, 0, 0, total, total, 0x1000] {
            b.put_u64_le(v);
        }
        // PT_DYNAMIC
        b.put_u32_le(2);
        b.put_u32_le(6);
        for v in [dynamic_at, dynamic_at, dynamic_at, dynamic_size, dynamic_size, 8] {
            b.put_u64_le(v);
        }
        b.resize(ELF_DYN_CODE as usize, 0);
        b.put_slice(code);
        b.resize(ELF_DYN_TABLES, 0);
        b.put_slice(&dynstr);
        b.put_bytes(0, 24);
        for ((_, value), name) in symbols.iter().zip(&symbol_names) {
            b.put_u32_le(*name as u32);
            // STB_GLOBAL, STT_FUNC
            b.put_u8(0x12);
            b.put_u8(0);
            b.put_u16_le(if *value == 0 { 0 } else { 1 });
            b.put_u64_le(*value);
            b.put_u64_le(0);
        }
        // DT_HASH with a single bucket, only nchain is looked at
        b.put_u32_le(1);
        b.put_u32_le(nsyms as u32);
        b.put_bytes(0, 4 + nsyms * 4);
        b.resize(rela_at as usize, 0);
        for (offset, kind, name, addend) in relocs {
            let sym = symbols
                .iter()
                .position(|(s, _)| !name.is_empty() && s == name)
                .map(|i| i as u64 + 1)
                .unwrap_or(0);
            b.put_u64_le(*offset);
            b.put_u64_le((sym << 32) | *kind as u64);
            b.put_i64_le(*addend);
        }
        for (tag, value) in dyns {
            b.put_u64_le(tag);
            b.put_u64_le(value);
        }
        b.to_vec()
    }

    pub const MACHO_TEXT: u64 = 0x1_0000_0000;
    pub const MACHO_CODE_OFFSET: u64 = 0x400;
    /// `__DATA` follows `__TEXT` and holds one pointer slot per import.
    pub const MACHO_DATA_OFFSET: u64 = 0x1000;

    /// x86-64 MH_EXECUTE: `__PAGEZERO` below `text`, `__TEXT` with `code`,
    /// `__DATA` and a `__LINKEDIT` carrying bind opcodes for `imports` (dylib,
    /// C name) and an export trie for `_main`. The entry is LC_MAIN, or
    /// LC_UNIXTHREAD when `unixthread` is set.
    pub fn macho64(text: u64, code: &[u8], imports: &[(&str, &str)], unixthread: bool) -> Vec<u8> {
        let mut dylibs: Vec<&str> = vec![];
        for (dylib, _) in imports {
            if !dylibs.contains(dylib) {
                dylibs.push(*dylib);
            }
        }

        let mut linkedit = BytesMut::new();
        for (i, (dylib, symbol)) in imports.iter().enumerate() {
            let ordinal = dylibs.iter().position(|d| d == dylib).unwrap_or(0) + 1;
            // SET_DYLIB_ORDINAL_IMM, SET_SYMBOL_TRAILING_FLAGS_IMM
            linkedit.put_u8(0x10 | ordinal as u8);
            linkedit.put_u8(0x40);
            intern(&mut linkedit, &format!("_{}", symbol));
            // SET_TYPE_IMM pointer, SET_SEGMENT_AND_OFFSET_ULEB into __DATA
            linkedit.put_u8(0x51);
            linkedit.put_u8(0x72);
            uleb(&mut linkedit, i as u64 * 8);
            // DO_BIND
            linkedit.put_u8(0x90);
        }
        linkedit.put_u8(0);
        let bind_size = linkedit.len();
        pad(&mut linkedit, 8);
        let export_off = linkedit.len();
        // root: no terminal, one edge to the node at offset 9
        linkedit.put_u8(0);
        linkedit.put_u8(1);
        intern(&mut linkedit, "_main");
        uleb(&mut linkedit, 9);
        let mut terminal = BytesMut::new();
        uleb(&mut terminal, 0);
        uleb(&mut terminal, MACHO_CODE_OFFSET);
        linkedit.put_u8(terminal.len() as u8);
        linkedit.put_slice(&terminal);
        linkedit.put_u8(0);
        let export_size = linkedit.len() - export_off;
        let linkedit_at = 0x2000u64;

        let mut cmds = BytesMut::new();
        let mut ncmds = 0u32;
        let segment = |cmds: &mut BytesMut, name: &str, vmaddr: u64, vmsize: u64, fileoff: u64, filesize: u64, prot: u32| {
            cmds.put_u32_le(0x19);
            cmds.put_u32_le(72);
            let mut segname = [0u8; 16];
            segname[..name.len()].copy_from_slice(name.as_bytes());
            cmds.put_slice(&segname);
            for v in [vmaddr, vmsize, fileoff, filesize] {
                cmds.put_u64_le(v);
            }
            cmds.put_u32_le(prot);
            cmds.put_u32_le(prot);
            cmds.put_u32_le(0);
            cmds.put_u32_le(0);
        };
        segment(&mut cmds, "__PAGEZERO", 0, text, 0, 0, 0);
        segment(&mut cmds, "__TEXT", text, 0x1000, 0, 0x1000, 5);
        segment(&mut cmds, "__DATA", text + MACHO_DATA_OFFSET, 0x1000, MACHO_DATA_OFFSET, 0x1000, 3);
        segment(&mut cmds, "__LINKEDIT", text + linkedit_at, 0x1000, linkedit_at, linkedit.len() as u64, 1);
        ncmds += 4;

        // LC_DYLD_INFO_ONLY
        cmds.put_u32_le(0x8000_0022);
        cmds.put_u32_le(48);
        let bind_off = linkedit_at as u32;
        for v in [0, 0, bind_off, bind_size as u32, 0, 0, 0, 0, bind_off + export_off as u32, export_size as u32] {
            cmds.put_u32_le(v);
        }
        ncmds += 1;

        for dylib in &dylibs {
            let size = (24 + dylib.len() + 1 + 7) / 8 * 8;
            // LC_LOAD_DYLIB
            cmds.put_u32_le(0xc);
            cmds.put_u32_le(size as u32);
            for v in [24u32, 2, 0x1_0000, 0x1_0000] {
                cmds.put_u32_le(v);
            }
            let start = cmds.len();
            cmds.put_slice(dylib.as_bytes());
            cmds.resize(start + size - 24, 0);
            ncmds += 1;
        }

        if unixthread {
            // x86_THREAD_STATE64, rip is the 17th register
            cmds.put_u32_le(0x5);
            cmds.put_u32_le(16 + 42 * 4);
            cmds.put_u32_le(4);
            cmds.put_u32_le(42);
            for i in 0..21 {
                cmds.put_u64_le(if i == 16 { text + MACHO_CODE_OFFSET } else { 0 });
            }
        } else {
            // LC_MAIN
            cmds.put_u32_le(0x8000_0028);
            cmds.put_u32_le(24);
            cmds.put_u64_le(MACHO_CODE_OFFSET);
            cmds.put_u64_le(0);
        }
        ncmds += 1;

        let mut b = BytesMut::new();
        b.put_u32_le(0xfeed_facf);
        b.put_u32_le(0x0100_0007);
        b.put_u32_le(3);
        b.put_u32_le(2);
        b.put_u32_le(ncmds);
        b.put_u32_le(cmds.len() as u32);
        b.put_u32_le(0);
        b.put_u32_le(0);
        b.put_slice(&cmds);
        assert!(b.len() <= MACHO_CODE_OFFSET as usize);
        b.resize(MACHO_CODE_OFFSET as usize, 0);
        b.put_slice(code);
        b.resize(linkedit_at as usize, 0);
        b.put_slice(&linkedit);
        b.to_vec()
    }
}

#[cfg(test)]
mod test {
    use super::{asm, TinyX86};
    use crate::{
        arch::{ArchType, RegisterX86},
        engine::{CpuEngine, CpuException, StepOutcome, Trap},
        memory::{AddressSpace, Permission, Placement},
    };

    #[test]
    fn test_scripted_engine_basics() {
        let mut mem = AddressSpace::new(1 << 32);
        mem.map(Placement::Fixed(0x1000), 0x1000, Permission::ALL, "code")
            .unwrap();
        let code = asm::concat(&[asm::mov_eax(1), asm::nop(), asm::int80(), vec![0x0f, 0x0b]]);
        mem.write(0x1000, &code).unwrap();
        let mut cpu = TinyX86::new(ArchType::X86);
        cpu.reg_write(RegisterX86::EIP.into(), 0x1000).unwrap();
        assert_eq!(cpu.step(&mut mem).unwrap(), StepOutcome::Executed);
        assert_eq!(cpu.reg_read(RegisterX86::EAX.into()).unwrap(), 1);
        cpu.step(&mut mem).unwrap();
        assert_eq!(
            cpu.step(&mut mem).unwrap(),
            StepOutcome::Trap(Trap::Interrupt(0x80))
        );
        assert_eq!(cpu.reg_read(RegisterX86::EIP.into()).unwrap(), 0x1008);
        assert_eq!(
            cpu.step(&mut mem).unwrap(),
            StepOutcome::Trap(Trap::Exception(CpuException::IllegalInstruction))
        );
        assert_eq!(cpu.reg_read(RegisterX86::EIP.into()).unwrap(), 0x1008);
    }
}
