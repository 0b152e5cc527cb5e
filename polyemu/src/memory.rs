use crate::{
    errors::{EmulatorError, Result},
    utils::{align, checked_align_up},
    PAGE_SIZE,
};
use bitflags::bitflags;
use log::trace;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Debug, Formatter},
};

pub type PointerSizeT = u8;

bitflags! {
    #[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash, Default)]
    pub struct Permission: u32 {
        const NONE = 0;
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    fn required(&self) -> Permission {
        match self {
            Access::Read => Permission::READ,
            Access::Write => Permission::WRITE,
            Access::Execute => Permission::EXEC,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backing {
    Anonymous,
    File { path: String, offset: u64 },
    /// `offset` is the distance of the region start from the device start.
    Mmio { device: u64, offset: u64 },
}

/// Memory-mapped device behind an mmio region.
pub trait MmioHandler {
    fn read(&mut self, offset: u64, buf: &mut [u8]);
    fn write(&mut self, offset: u64, data: &[u8]);
}

/// Metadata of a mapped region.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct RegionInfo {
    pub base: u64,
    pub size: u64,
    pub perms: Permission,
    pub tag: String,
    pub backing: Backing,
    /// Code patches may target this region even without `WRITE`.
    #[serde(default)]
    pub patchable: bool,
}

impl RegionInfo {
    pub fn end(&self) -> u64 {
        self.base + self.size
    }
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

#[derive(Clone)]
pub struct MemoryRegion {
    pub info: RegionInfo,
    pub(crate) data: Vec<u8>,
}

impl Debug for MemoryRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:#x}, {:#x}) {:?} {}",
            self.info.base,
            self.info.end(),
            self.info.perms,
            self.info.tag
        )
    }
}

impl MemoryRegion {
    fn split_off(&mut self, at: u64) -> MemoryRegion {
        debug_assert!(at > self.info.base && at < self.info.end());
        let offset = at - self.info.base;
        let mut info = self.info.clone();
        info.base = at;
        info.size = self.info.size - offset;
        info.backing = match &self.info.backing {
            Backing::Anonymous => Backing::Anonymous,
            Backing::File { path, offset: o } => Backing::File {
                path: path.clone(),
                offset: o + offset,
            },
            Backing::Mmio { device, offset: o } => Backing::Mmio {
                device: *device,
                offset: o + offset,
            },
        };
        self.info.size = offset;
        let data = if self.data.is_empty() {
            vec![]
        } else {
            self.data.split_off(offset as usize)
        };
        MemoryRegion { info, data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Where to place a new mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Placement {
    Fixed(u64),
    /// First fit at or above `min`.
    Auto { min: u64 },
}

/// The guest's virtual memory. Regions never overlap; every access resolves
/// through exactly one region per byte or fails before touching anything.
pub struct AddressSpace {
    regions: BTreeMap<u64, MemoryRegion>,
    devices: BTreeMap<u64, Box<dyn MmioHandler>>,
    next_device: u64,
    limit: u64,
    /// pages written or mapped since the last `take_dirty`.
    dirty: BTreeSet<u64>,
    /// pages changed by the host side, to be pushed into engine-side copies.
    sync_pages: BTreeSet<u64>,
    layout_generation: u64,
    /// upper bound on host bytes backing guest regions.
    budget: u64,
}

/// Host memory a guest may back with regions unless configured otherwise.
pub const DEFAULT_MEMORY_BUDGET: u64 = 1 << 30;

impl Debug for AddressSpace {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.regions.values()).finish()
    }
}

impl AddressSpace {
    /// `limit` is the first address past the usable range.
    pub fn new(limit: u64) -> Self {
        Self {
            regions: BTreeMap::new(),
            devices: BTreeMap::new(),
            next_device: 1,
            limit,
            dirty: BTreeSet::new(),
            sync_pages: BTreeSet::new(),
            layout_generation: 0,
            budget: DEFAULT_MEMORY_BUDGET,
        }
    }

    pub fn for_pointer_size(pointer_size: PointerSizeT) -> Self {
        match pointer_size {
            4 => Self::new(1 << 32),
            _ => Self::new(1 << 47),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn set_budget(&mut self, budget: u64) {
        self.budget = budget;
    }

    /// Host bytes currently backing regions.
    pub fn resident(&self) -> u64 {
        self.regions.values().map(|r| r.data.len() as u64).sum()
    }

    pub fn map(
        &mut self,
        placement: Placement,
        size: u64,
        perms: Permission,
        tag: impl Into<String>,
    ) -> Result<u64> {
        self.map_with(placement, size, perms, tag, Backing::Anonymous)
    }

    pub fn map_with(
        &mut self,
        placement: Placement,
        size: u64,
        perms: Permission,
        tag: impl Into<String>,
        backing: Backing,
    ) -> Result<u64> {
        if size == 0 {
            return Err(EmulatorError::InvalidState("zero sized mapping".into()));
        }
        let size = checked_align_up(size, PAGE_SIZE)
            .filter(|size| *size <= self.limit)
            .ok_or(EmulatorError::OutOfSpace { size })?;
        let is_mmio = matches!(backing, Backing::Mmio { .. });
        if !is_mmio && self.resident().saturating_add(size) > self.budget {
            return Err(EmulatorError::OutOfSpace { size });
        }
        let base = match placement {
            Placement::Fixed(base) => {
                if base != align(base, PAGE_SIZE) {
                    return Err(EmulatorError::InvalidState(format!(
                        "unaligned mapping base {:#x}",
                        base
                    )));
                }
                let end = base
                    .checked_add(size)
                    .filter(|end| *end <= self.limit)
                    .ok_or(EmulatorError::OutOfSpace { size })?;
                if self.overlaps(base, end) {
                    return Err(EmulatorError::CollisionError { base, size });
                }
                base
            }
            Placement::Auto { min } => self.find_free(size, min)?,
        };
        let tag = tag.into();
        trace!("map [{:#x}, {:#x}) {:?} {}", base, base + size, perms, tag);
        let data = if is_mmio {
            vec![]
        } else {
            vec![0u8; size as usize]
        };
        self.regions.insert(
            base,
            MemoryRegion {
                info: RegionInfo {
                    base,
                    size,
                    perms,
                    tag,
                    backing,
                    patchable: false,
                },
                data,
            },
        );
        if !is_mmio {
            self.mark_pages(base, size);
        }
        self.layout_generation += 1;
        Ok(base)
    }

    /// Map an mmio device; accesses inside the region are forwarded to `handler`.
    pub fn map_mmio(
        &mut self,
        base: u64,
        size: u64,
        perms: Permission,
        tag: impl Into<String>,
        handler: Box<dyn MmioHandler>,
    ) -> Result<u64> {
        let device = self.next_device;
        let base = self.map_with(
            Placement::Fixed(base),
            size,
            perms,
            tag,
            Backing::Mmio { device, offset: 0 },
        )?;
        self.next_device += 1;
        self.devices.insert(device, handler);
        Ok(base)
    }

    /// First-fit search over free gaps, lowest address first.
    pub fn find_free(&self, size: u64, min: u64) -> Result<u64> {
        let no_space = || EmulatorError::OutOfSpace { size };
        let size = checked_align_up(size, PAGE_SIZE).ok_or_else(no_space)?;
        let mut candidate = checked_align_up(min.max(PAGE_SIZE), PAGE_SIZE).ok_or_else(no_space)?;
        for region in self.regions.values() {
            let info = &region.info;
            if info.end() <= candidate {
                continue;
            }
            if info.base >= candidate && info.base - candidate >= size {
                break;
            }
            candidate = checked_align_up(info.end(), PAGE_SIZE).ok_or_else(no_space)?;
        }
        match candidate.checked_add(size) {
            Some(end) if end <= self.limit => Ok(candidate),
            _ => Err(EmulatorError::OutOfSpace { size }),
        }
    }

    fn overlaps(&self, base: u64, end: u64) -> bool {
        self.regions
            .range(..end)
            .next_back()
            .map(|(_, r)| r.info.end() > base)
            .unwrap_or(false)
    }

    /// Split regions so that `addr` is a region boundary (if it is mapped).
    fn split_at(&mut self, addr: u64) {
        let key = match self.regions.range(..addr).next_back() {
            Some((k, r)) if r.info.end() > addr => *k,
            _ => return,
        };
        if let Some(region) = self.regions.get_mut(&key) {
            let tail = region.split_off(addr);
            self.regions.insert(addr, tail);
        }
    }

    /// Remove every mapping inside `[addr, addr + size)`. Partially covered
    /// regions are split; unmapped holes in the range are ignored.
    pub fn unmap(&mut self, addr: u64, size: u64) -> Result<()> {
        let end = checked_align_up(size, PAGE_SIZE)
            .and_then(|size| addr.checked_add(size))
            .ok_or_else(|| EmulatorError::access_violation(addr, size, Access::Write))?;
        self.split_at(addr);
        self.split_at(end);
        let doomed: Vec<u64> = self.regions.range(addr..end).map(|(k, _)| *k).collect();
        for base in doomed {
            if let Some(region) = self.regions.remove(&base) {
                trace!("unmap {:?}", region);
                if let Backing::Mmio { device, .. } = region.info.backing {
                    if !self.regions.values().any(
                        |r| matches!(r.info.backing, Backing::Mmio { device: d, .. } if d == device),
                    ) {
                        self.devices.remove(&device);
                    }
                }
            }
        }
        self.layout_generation += 1;
        Ok(())
    }

    /// Change permissions of `[addr, addr + size)`. The whole range must be
    /// mapped; nothing changes otherwise.
    pub fn protect(&mut self, addr: u64, size: u64, perms: Permission) -> Result<()> {
        let size = checked_align_up(size, PAGE_SIZE)
            .ok_or_else(|| EmulatorError::access_violation(addr, size, Access::Read))?;
        self.check_mapped(addr, size, Access::Read)?;
        let end = addr + size;
        self.split_at(addr);
        self.split_at(end);
        for (_, region) in self.regions.range_mut(addr..end) {
            region.info.perms = perms;
        }
        self.layout_generation += 1;
        Ok(())
    }

    pub fn set_patchable(&mut self, base: u64, patchable: bool) {
        if let Some(region) = self.regions.get_mut(&base) {
            region.info.patchable = patchable;
        }
    }

    pub fn region_at(&self, addr: u64) -> Option<&RegionInfo> {
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, r)| &r.info)
            .filter(|info| info.contains(addr))
    }

    pub fn regions(&self) -> impl Iterator<Item = &RegionInfo> {
        self.regions.values().map(|r| &r.info)
    }

    pub fn layout(&self) -> Vec<RegionInfo> {
        self.regions().cloned().collect()
    }

    pub fn is_mapped(&self, addr: u64, size: u64) -> bool {
        self.check_mapped(addr, size, Access::Read).is_ok()
    }

    fn check_mapped(&self, addr: u64, size: u64, access: Access) -> Result<()> {
        self.check(addr, size, access, Permission::NONE)
    }

    /// Validate that every byte in the range is mapped with `required` perms.
    fn check(&self, addr: u64, size: u64, access: Access, required: Permission) -> Result<()> {
        let violation = || EmulatorError::access_violation(addr, size, access);
        let end = addr.checked_add(size).ok_or_else(violation)?;
        let mut cur = addr;
        while cur < end {
            let info = self.region_at(cur).ok_or_else(violation)?;
            if !info.perms.contains(required) {
                return Err(violation());
            }
            cur = info.end();
        }
        Ok(())
    }

    /// Length of the leading part of `[addr, addr + max)` that `access` may touch.
    pub fn accessible_len(&self, addr: u64, max: u64, access: Access) -> u64 {
        let end = addr.saturating_add(max);
        let mut cur = addr;
        while cur < end {
            match self.region_at(cur) {
                Some(info) if info.perms.contains(access.required()) => cur = info.end(),
                _ => break,
            }
        }
        cur.min(end) - addr
    }

    pub fn check_access(&self, addr: u64, size: u64, access: Access) -> Result<()> {
        self.check(addr, size, access, access.required())
    }

    pub fn read(&mut self, addr: u64, size: usize) -> Result<Vec<u8>> {
        self.check_access(addr, size as u64, Access::Read)?;
        Ok(self.copy_out(addr, size))
    }

    pub fn fetch(&mut self, addr: u64, size: usize) -> Result<Vec<u8>> {
        self.check_access(addr, size as u64, Access::Execute)?;
        Ok(self.copy_out(addr, size))
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.check_access(addr, data.len() as u64, Access::Write)?;
        self.copy_in(addr, data);
        Ok(())
    }

    /// Read ignoring permissions; the range must still be mapped.
    pub fn read_raw(&mut self, addr: u64, size: usize) -> Result<Vec<u8>> {
        self.check_mapped(addr, size as u64, Access::Read)?;
        Ok(self.copy_out(addr, size))
    }

    /// Write ignoring permissions; the range must still be mapped.
    pub fn write_raw(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        self.check_mapped(addr, data.len() as u64, Access::Write)?;
        self.copy_in(addr, data);
        Ok(())
    }

    /// Immutable read for snapshotting; mmio ranges read as zero.
    pub fn peek(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        self.check_mapped(addr, size as u64, Access::Read)?;
        let mut out = vec![0u8; size];
        let mut cur = addr;
        while cur < addr + size as u64 {
            let region = self.region_entry(cur);
            let chunk_end = region.info.end().min(addr + size as u64);
            if !region.data.is_empty() {
                let src = (cur - region.info.base) as usize;
                let dst = (cur - addr) as usize;
                let len = (chunk_end - cur) as usize;
                out[dst..dst + len].copy_from_slice(&region.data[src..src + len]);
            }
            cur = chunk_end;
        }
        Ok(out)
    }

    fn region_entry(&self, addr: u64) -> &MemoryRegion {
        // callers validated the range first.
        self.regions
            .range(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .unwrap_or_else(|| unreachable!("unmapped address {:#x}", addr))
    }

    fn copy_out(&mut self, addr: u64, size: usize) -> Vec<u8> {
        let mut out = vec![0u8; size];
        let end = addr + size as u64;
        let mut cur = addr;
        while cur < end {
            let key = self.region_entry(cur).info.base;
            let (info, data) = match self.regions.get(&key) {
                Some(r) => (r.info.clone(), &r.data),
                None => break,
            };
            let chunk_end = info.end().min(end);
            let dst = (cur - addr) as usize;
            let len = (chunk_end - cur) as usize;
            match info.backing {
                Backing::Mmio { device, offset } => {
                    if let Some(dev) = self.devices.get_mut(&device) {
                        dev.read(offset + cur - info.base, &mut out[dst..dst + len]);
                    }
                }
                _ => {
                    let src = (cur - info.base) as usize;
                    out[dst..dst + len].copy_from_slice(&data[src..src + len]);
                }
            }
            cur = chunk_end;
        }
        out
    }

    fn copy_in(&mut self, addr: u64, data: &[u8]) {
        let end = addr + data.len() as u64;
        let mut cur = addr;
        while cur < end {
            let key = self.region_entry(cur).info.base;
            let (chunk_end, mmio) = match self.regions.get_mut(&key) {
                Some(region) => {
                    let chunk_end = region.info.end().min(end);
                    let src = (cur - addr) as usize;
                    let len = (chunk_end - cur) as usize;
                    match region.info.backing {
                        Backing::Mmio { device, offset } => (
                            chunk_end,
                            Some((device, offset + cur - region.info.base, src, len)),
                        ),
                        _ => {
                            let dst = (cur - region.info.base) as usize;
                            region.data[dst..dst + len].copy_from_slice(&data[src..src + len]);
                            (chunk_end, None)
                        }
                    }
                }
                None => break,
            };
            match mmio {
                Some((device, offset, src, len)) => {
                    if let Some(dev) = self.devices.get_mut(&device) {
                        dev.write(offset, &data[src..src + len]);
                    }
                }
                None => self.mark_pages(cur, chunk_end - cur),
            }
            cur = chunk_end;
        }
    }

    fn mark_pages(&mut self, addr: u64, size: u64) {
        let mut page = align(addr, PAGE_SIZE);
        while page < addr + size {
            self.dirty.insert(page);
            self.sync_pages.insert(page);
            page += PAGE_SIZE;
        }
    }

    /// Pages touched since the previous call.
    pub fn take_dirty(&mut self) -> BTreeSet<u64> {
        std::mem::take(&mut self.dirty)
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn take_sync_pages(&mut self) -> BTreeSet<u64> {
        std::mem::take(&mut self.sync_pages)
    }

    /// Queue `[addr, addr + len)` for a push into engine-side copies without
    /// touching the dirty set.
    pub fn mark_sync(&mut self, addr: u64, len: u64) {
        let end = addr.saturating_add(len);
        let mut page = align(addr, PAGE_SIZE);
        while page < end {
            self.sync_pages.insert(page);
            page = match page.checked_add(PAGE_SIZE) {
                Some(next) => next,
                None => break,
            };
        }
    }

    /// Pages the engine committed itself need no push-back.
    pub fn forget_sync_pages(&mut self, pages: impl IntoIterator<Item = u64>) {
        for page in pages {
            self.sync_pages.remove(&page);
        }
    }

    pub fn layout_generation(&self) -> u64 {
        self.layout_generation
    }

    /// Replace the whole region set, used by checkpoint restore.
    pub(crate) fn replace_regions(&mut self, regions: Vec<MemoryRegion>) {
        self.regions = regions.into_iter().map(|r| (r.info.base, r)).collect();
        let live: BTreeSet<u64> = self
            .regions
            .values()
            .filter_map(|r| match r.info.backing {
                Backing::Mmio { device, .. } => Some(device),
                _ => None,
            })
            .collect();
        self.devices.retain(|d, _| live.contains(d));
        self.dirty.clear();
        // every byte may differ from what the engine holds
        self.sync_pages.clear();
        let pages: Vec<(u64, u64)> = self
            .regions
            .values()
            .filter(|r| !matches!(r.info.backing, Backing::Mmio { .. }))
            .map(|r| (r.info.base, r.info.size))
            .collect();
        for (base, size) in pages {
            let mut page = base;
            while page < base + size {
                self.sync_pages.insert(page);
                page += PAGE_SIZE;
            }
        }
        self.layout_generation += 1;
    }

    pub(crate) fn region_data(&self, base: u64) -> Option<&MemoryRegion> {
        self.regions.get(&base)
    }

    /// Drop everything, used at teardown.
    pub fn clear(&mut self) {
        self.regions.clear();
        self.devices.clear();
        self.dirty.clear();
        self.sync_pages.clear();
        self.layout_generation += 1;
    }
}

/// Pointer-sized access helpers, packed per the emulated arch.
pub trait Memory {
    fn pagesize(&self) -> u64 {
        PAGE_SIZE
    }
    fn mem_map(
        &mut self,
        placement: Placement,
        size: u64,
        perms: Permission,
        info: Option<String>,
    ) -> Result<u64>;
    fn mem_unmap(&mut self, addr: u64, size: u64) -> Result<()>;
    fn is_mapped(&self, addr: u64, size: u64) -> bool;
    fn mprotect(&mut self, addr: u64, size: u64, perm: Permission) -> Result<()>;
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>>;
    fn read_ptr(&self, address: u64, pointersize: Option<PointerSizeT>) -> Result<u64>;

    fn write(&mut self, address: u64, bytes: impl AsRef<[u8]>) -> Result<()>;
    /// Write an integer value to a memory address.
    /// Bytes written will be packed using emulated architecture properties.
    ///
    /// Args:
    ///  addr: target memory address
    ///  value: integer value to write
    ///  size: pointer size (in bytes): either 1, 2, 4, 8, or None for arch native size
    fn write_ptr(
        &mut self,
        address: u64,
        value: u64,
        pointersize: Option<PointerSizeT>,
    ) -> Result<()>;
}

#[cfg(test)]
mod test {
    use super::*;

    fn space() -> AddressSpace {
        AddressSpace::new(1 << 32)
    }

    #[test]
    fn test_identity_write_is_noop() {
        let mut mem = space();
        mem.map(Placement::Fixed(0x2000), 0x2000, Permission::READ | Permission::WRITE, "a")
            .unwrap();
        mem.write(0x2100, b"hello").unwrap();
        let before = mem.peek(0x2000, 0x2000).unwrap();
        let bytes = mem.read(0x2ffe, 4).unwrap();
        mem.write(0x2ffe, &bytes).unwrap();
        assert_eq!(before, mem.peek(0x2000, 0x2000).unwrap());
    }

    #[test]
    fn test_write_past_region_end_is_not_partial() {
        let mut mem = space();
        mem.map(Placement::Fixed(0x2000), 0x1000, Permission::ALL, "r")
            .unwrap();
        mem.write(0x2ffd, &[1, 2, 3]).unwrap();
        let err = mem.write(0x2ffd, &[9, 9, 9, 9]).unwrap_err();
        assert!(matches!(
            err,
            EmulatorError::AccessViolation {
                address: 0x2ffd,
                size: 4,
                access: Access::Write
            }
        ));
        assert_eq!(mem.read(0x2ffd, 3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_unmapped_access_faults() {
        let mut mem = space();
        mem.map(Placement::Fixed(0x10000), 0x3000, Permission::ALL, "r")
            .unwrap();
        mem.write(0x11000, &[0xaa; 16]).unwrap();
        mem.unmap(0x11000, 0x1000).unwrap();
        for addr in [0x11000u64, 0x11800, 0x11fff] {
            assert!(matches!(
                mem.read(addr, 1),
                Err(EmulatorError::AccessViolation { .. })
            ));
        }
        // neighbours survive the split
        assert!(mem.read(0x10fff, 1).is_ok());
        assert!(mem.read(0x12000, 1).is_ok());
        assert_eq!(mem.regions().count(), 2);
        // a remap starts zeroed, never stale
        mem.map(Placement::Fixed(0x11000), 0x1000, Permission::ALL, "again")
            .unwrap();
        assert_eq!(mem.read(0x11000, 16).unwrap(), vec![0; 16]);
    }

    #[test]
    fn test_collision_and_auto_placement() {
        let mut mem = space();
        mem.map(Placement::Fixed(0x1000), 0x1000, Permission::READ, "a")
            .unwrap();
        mem.map(Placement::Fixed(0x4000), 0x1000, Permission::READ, "b")
            .unwrap();
        assert!(matches!(
            mem.map(Placement::Fixed(0x4000), 0x2000, Permission::READ, "c"),
            Err(EmulatorError::CollisionError { .. })
        ));
        assert!(matches!(
            mem.map(Placement::Fixed(0x0000), 0x2000, Permission::READ, "c"),
            Err(EmulatorError::CollisionError { .. })
        ));
        // first gap that fits two pages is [0x2000, 0x4000)
        let base = mem
            .map(Placement::Auto { min: 0 }, 0x2000, Permission::READ, "d")
            .unwrap();
        assert_eq!(base, 0x2000);
        let base = mem
            .map(Placement::Auto { min: 0 }, 0x1000, Permission::READ, "e")
            .unwrap();
        assert_eq!(base, 0x5000);
    }

    #[test]
    fn test_out_of_space() {
        let mut mem = AddressSpace::new(0x10000);
        mem.map(Placement::Fixed(0x1000), 0xe000, Permission::READ, "a")
            .unwrap();
        assert!(matches!(
            mem.map(Placement::Auto { min: 0 }, 0x2000, Permission::READ, "b"),
            Err(EmulatorError::OutOfSpace { .. })
        ));
    }

    #[test]
    fn test_protect_is_atomic() {
        let mut mem = space();
        mem.map(Placement::Fixed(0x1000), 0x2000, Permission::ALL, "a")
            .unwrap();
        // range runs into unmapped memory, nothing changes
        assert!(mem.protect(0x2000, 0x2000, Permission::READ).is_err());
        assert_eq!(mem.regions().count(), 1);
        mem.write(0x2000, &[1]).unwrap();

        mem.protect(0x2000, 0x1000, Permission::READ).unwrap();
        assert!(mem.write(0x2000, &[1]).is_err());
        assert!(mem.write(0x1fff, &[1]).is_ok());
        assert!(matches!(
            mem.fetch(0x2000, 1),
            Err(EmulatorError::AccessViolation {
                access: Access::Execute,
                ..
            })
        ));
    }

    #[test]
    fn test_access_spanning_adjacent_regions() {
        let mut mem = space();
        mem.map(Placement::Fixed(0x1000), 0x1000, Permission::ALL, "a")
            .unwrap();
        mem.map(Placement::Fixed(0x2000), 0x1000, Permission::ALL, "b")
            .unwrap();
        mem.write(0x1ffe, &[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.read(0x1ffe, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    struct Counter(u8);

    impl MmioHandler for Counter {
        fn read(&mut self, _offset: u64, buf: &mut [u8]) {
            self.0 += 1;
            buf.fill(self.0);
        }
        fn write(&mut self, _offset: u64, data: &[u8]) {
            self.0 = data[0];
        }
    }

    #[test]
    fn test_mmio_forwarding() {
        let mut mem = space();
        mem.map_mmio(0x8000, 0x1000, Permission::READ | Permission::WRITE, "dev", Box::new(Counter(0)))
            .unwrap();
        assert_eq!(mem.read(0x8000, 2).unwrap(), vec![1, 1]);
        mem.write(0x8010, &[40]).unwrap();
        assert_eq!(mem.read(0x8000, 1).unwrap(), vec![41]);
        assert!(!mem.take_dirty().contains(&0x8000));
    }

    #[test]
    fn test_dirty_tracking() {
        let mut mem = space();
        mem.map(Placement::Fixed(0x1000), 0x3000, Permission::ALL, "a")
            .unwrap();
        assert_eq!(mem.take_dirty().len(), 3);
        mem.write(0x2ff0, &[1; 0x20]).unwrap();
        let dirty: Vec<u64> = mem.take_dirty().into_iter().collect();
        assert_eq!(dirty, vec![0x2000, 0x3000]);
    }

    #[test]
    fn test_mapping_beyond_budget_is_refused() {
        let mut mem = space();
        mem.set_budget(0x4000);
        mem.map(Placement::Fixed(0x1000), 0x3000, Permission::ALL, "a")
            .unwrap();
        assert!(matches!(
            mem.map(Placement::Auto { min: 0x10000 }, 0x2000, Permission::ALL, "b"),
            Err(EmulatorError::OutOfSpace { .. })
        ));
        assert!(matches!(
            mem.map(Placement::Auto { min: 0 }, u64::MAX - 0x10, Permission::ALL, "huge"),
            Err(EmulatorError::OutOfSpace { .. })
        ));
        mem.map_mmio(0x20000, 0x10000, Permission::READ, "dev", Box::new(Counter(0)))
            .unwrap();
        mem.unmap(0x1000, 0x1000).unwrap();
        assert_eq!(mem.resident(), 0x2000);
        mem.map(Placement::Auto { min: 0x10000 }, 0x2000, Permission::ALL, "b")
            .unwrap();
    }

    #[test]
    fn test_unaligned_lengths_near_the_top_do_not_wrap() {
        let mut mem = space();
        assert!(mem.unmap(0x1000, u64::MAX).is_err());
        assert!(mem.protect(0x1000, u64::MAX, Permission::READ).is_err());
        assert!(mem.find_free(0x1000, u64::MAX - 0x10).is_err());
    }

    #[test]
    fn test_mark_sync_leaves_dirty_alone() {
        let mut mem = space();
        mem.map(Placement::Fixed(0x1000), 0x2000, Permission::ALL, "a")
            .unwrap();
        mem.take_dirty();
        mem.take_sync_pages();
        mem.mark_sync(0x1ff0, 0x20);
        let pages: Vec<u64> = mem.take_sync_pages().into_iter().collect();
        assert_eq!(pages, vec![0x1000, 0x2000]);
        assert!(!mem.has_dirty());
    }
}
