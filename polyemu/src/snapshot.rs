//! Checkpoints: register and OS state plus page-granular memory diffs,
//! chained by parent id so restore can rebuild memory from the root.

use crate::{
    arch::ArchInfo,
    config::EmuConfig,
    engine::Machine,
    errors::{EmulatorError, Result},
    loader::{ImageFormat, ImageSet, LoadInfo},
    memory::{Backing, MemoryRegion, RegionInfo},
    os::{Kernel, KernelState, OsType},
    registers::{RegisterState, Registers},
    PAGE_SIZE,
};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// Contents of one page.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct Page(#[serde(with = "hex::serde")] pub Vec<u8>);

/// Immutable capture of the process at an instruction boundary.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Checkpoint {
    pub id: u64,
    /// checkpoint the diff is taken against, `None` for a full image.
    pub parent: Option<u64>,
    pub retired: u64,
    /// live registers of the current thread; the others are in `kernel`.
    pub registers: RegisterState,
    pub kernel: KernelState,
    pub layout: Vec<RegionInfo>,
    /// pages written since the parent, keyed by address.
    pub pages: BTreeMap<u64, Page>,
    /// sha1 over everything above.
    pub digest: String,
}

#[derive(Serialize)]
struct DigestInput<'a> {
    id: u64,
    parent: Option<u64>,
    retired: u64,
    registers: &'a RegisterState,
    kernel: &'a KernelState,
    layout: &'a [RegionInfo],
    pages: &'a BTreeMap<u64, Page>,
}

impl Checkpoint {
    fn compute_digest(&self) -> Result<String> {
        let input = DigestInput {
            id: self.id,
            parent: self.parent,
            retired: self.retired,
            registers: &self.registers,
            kernel: &self.kernel,
            layout: &self.layout,
            pages: &self.pages,
        };
        let mut hasher = Sha1::new();
        hasher.update(serde_json::to_vec(&input)?);
        Ok(hex::encode(hasher.finalize()))
    }

    fn verify(&self) -> Result<()> {
        let digest = self.compute_digest()?;
        if digest != self.digest {
            return Err(EmulatorError::CorruptCheckpoint {
                id: self.id,
                reason: format!("digest {} does not match {}", digest, self.digest),
            });
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct CheckpointSummary {
    pub id: u64,
    pub parent: Option<u64>,
    pub retired: u64,
    pub pages: usize,
}

/// Append-only checkpoint sequence of a session. Ids start at 1.
#[derive(Clone, Debug, Default)]
pub struct CheckpointChain {
    checkpoints: Vec<Checkpoint>,
    /// checkpoint the live state descends from.
    head: Option<u64>,
}

impl CheckpointChain {
    pub fn get(&self, id: u64) -> Option<&Checkpoint> {
        id.checked_sub(1)
            .and_then(|i| self.checkpoints.get(i as usize))
    }

    pub fn head(&self) -> Option<u64> {
        self.head
    }

    pub fn head_retired(&self) -> Option<u64> {
        self.head.and_then(|id| self.get(id)).map(|c| c.retired)
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    pub fn list(&self) -> Vec<CheckpointSummary> {
        self.checkpoints
            .iter()
            .map(|c| CheckpointSummary {
                id: c.id,
                parent: c.parent,
                retired: c.retired,
                pages: c.pages.len(),
            })
            .collect()
    }

    /// Drop every checkpoint; the next one is a full image again.
    pub fn reset(&mut self) {
        self.checkpoints.clear();
        self.head = None;
    }

    /// `id` and its ancestors, nearest first.
    fn path(&self, id: u64) -> Result<Vec<&Checkpoint>> {
        let mut path = vec![];
        let mut cur = Some(id);
        while let Some(id) = cur {
            let cp = self.get(id).ok_or(EmulatorError::UnknownCheckpoint(id))?;
            if path.len() > self.checkpoints.len() {
                return Err(EmulatorError::CorruptCheckpoint {
                    id,
                    reason: "parent chain has a cycle".into(),
                });
            }
            path.push(cp);
            cur = cp.parent;
        }
        Ok(path)
    }

    /// Latest checkpoint on the live lineage at or before `retired`.
    pub fn nearest_before(&self, retired: u64) -> Option<&Checkpoint> {
        let head = self.head?;
        self.path(head)
            .ok()?
            .into_iter()
            .find(|c| c.retired <= retired)
    }

    /// Capture the live state. Calling it again with nothing executed in
    /// between returns the same checkpoint.
    pub fn capture(&mut self, m: &mut Machine, k: &Kernel, retired: u64) -> Result<u64> {
        let registers = m.save_registers()?;
        if let Some(head) = self.head.and_then(|id| self.get(id)) {
            if head.retired == retired && !m.mem.has_dirty() && head.registers == registers {
                return Ok(head.id);
            }
        }
        let dirty = m.mem.take_dirty();
        let mut pages = BTreeMap::new();
        for region in m.mem.regions() {
            if matches!(region.backing, Backing::Mmio { .. }) {
                continue;
            }
            let data = match m.mem.region_data(region.base) {
                Some(r) => r.data(),
                None => continue,
            };
            let mut page = region.base;
            while page < region.end() {
                let offset = (page - region.base) as usize;
                let bytes = &data[offset..(offset + PAGE_SIZE as usize).min(data.len())];
                // a full image leaves zero pages out
                let keep = match self.head {
                    None => bytes.iter().any(|b| *b != 0),
                    Some(_) => dirty.contains(&page),
                };
                if keep {
                    pages.insert(page, Page(bytes.to_vec()));
                }
                page += PAGE_SIZE;
            }
        }
        let mut cp = Checkpoint {
            id: self.checkpoints.len() as u64 + 1,
            parent: self.head,
            retired,
            registers,
            kernel: k.state.clone(),
            layout: m.mem.layout(),
            pages,
            digest: String::new(),
        };
        cp.digest = cp.compute_digest()?;
        debug!(
            "checkpoint {} (parent {:?}) at {} with {} pages",
            cp.id,
            cp.parent,
            retired,
            cp.pages.len()
        );
        let id = cp.id;
        self.checkpoints.push(cp);
        self.head = Some(id);
        Ok(id)
    }

    /// Rebuild memory, registers and OS state of checkpoint `id`. Every
    /// checkpoint on the path is verified before live state is touched.
    /// Returns the retired count of the checkpoint.
    pub fn restore(&mut self, id: u64, m: &mut Machine, k: &mut Kernel) -> Result<u64> {
        let path = self.path(id)?;
        for cp in &path {
            cp.verify()?;
        }
        let target = path[0];
        let mut regions = Vec::with_capacity(target.layout.len());
        for info in &target.layout {
            if matches!(info.backing, Backing::Mmio { .. }) {
                regions.push(MemoryRegion {
                    info: info.clone(),
                    data: vec![],
                });
                continue;
            }
            let mut data = vec![0u8; info.size as usize];
            let mut page = info.base;
            while page < info.end() {
                // pages no checkpoint on the path holds are zero
                if let Some(Page(bytes)) = path.iter().find_map(|cp| cp.pages.get(&page)) {
                    let offset = (page - info.base) as usize;
                    let len = bytes.len().min(data.len() - offset);
                    data[offset..offset + len].copy_from_slice(&bytes[..len]);
                }
                page += PAGE_SIZE;
            }
            regions.push(MemoryRegion {
                info: info.clone(),
                data,
            });
        }
        let (registers, kernel, retired) =
            (target.registers.clone(), target.kernel.clone(), target.retired);

        m.mem.replace_regions(regions);
        m.cpu.invalidate_code_cache(0, u64::MAX);
        k.restore_state(kernel);
        m.restore_registers(&registers)?;
        self.head = Some(id);
        info!("restored checkpoint {} at {}", id, retired);
        Ok(retired)
    }

    pub(crate) fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Adopt checkpoints read from a session file after verifying them.
    pub(crate) fn from_checkpoints(checkpoints: Vec<Checkpoint>) -> Result<Self> {
        for (i, cp) in checkpoints.iter().enumerate() {
            if cp.id != i as u64 + 1 || cp.parent.map_or(false, |p| p >= cp.id) {
                return Err(EmulatorError::CorruptCheckpoint {
                    id: cp.id,
                    reason: "checkpoints are out of order".into(),
                });
            }
            cp.verify()?;
        }
        Ok(Self {
            checkpoints,
            head: None,
        })
    }
}

/// Everything needed to rebuild a session from its checkpoints alone.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SessionFile {
    pub version: u32,
    pub arch: ArchInfo,
    pub os: OsType,
    pub format: ImageFormat,
    pub exe_path: String,
    pub config: EmuConfig,
    pub images: ImageSet,
    pub load_info: LoadInfo,
    pub head: u64,
    pub checkpoints: Vec<Checkpoint>,
}

impl SessionFile {
    pub const VERSION: u32 = 1;

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        let file: SessionFile = serde_json::from_str(s)?;
        if file.version != Self::VERSION {
            return Err(EmulatorError::InvalidState(format!(
                "session file version {} is not supported",
                file.version
            )));
        }
        Ok(file)
    }
}

#[cfg(test)]
mod test {
    use super::CheckpointChain;
    use crate::{
        arch::{ArchType, RegisterX86},
        config::{EmuConfig, MemoryLayout},
        engine::Machine,
        errors::EmulatorError,
        memory::{Memory, Permission, Placement},
        os::{Kernel, OsType},
        registers::Registers,
        testing::TinyX86,
    };

    fn setup() -> (Machine, Kernel) {
        let layout = MemoryLayout::default_for(OsType::Linux, 4);
        let k = Kernel::new(OsType::Linux, ArchType::X86, &EmuConfig::default(), layout, "/a").unwrap();
        let mut m = Machine::new(Box::new(TinyX86::new(ArchType::X86)));
        m.mem
            .map(Placement::Fixed(0x1000), 0x3000, Permission::READ | Permission::WRITE, "data")
            .unwrap();
        (m, k)
    }

    #[test]
    fn test_diff_chain_restore() {
        let (mut m, mut k) = setup();
        Memory::write(&mut m, 0x1000, b"root").unwrap();
        Registers::write(&mut m, RegisterX86::EAX, 1).unwrap();
        let mut chain = CheckpointChain::default();
        let root = chain.capture(&mut m, &k, 0).unwrap();
        // only the written page, zero pages are implied
        assert_eq!(chain.get(root).unwrap().pages.len(), 1);
        // nothing ran: same checkpoint
        assert_eq!(chain.capture(&mut m, &k, 0).unwrap(), root);

        Memory::write(&mut m, 0x2004, b"second").unwrap();
        Registers::write(&mut m, RegisterX86::EAX, 2).unwrap();
        let second = chain.capture(&mut m, &k, 10).unwrap();
        let cp = chain.get(second).unwrap();
        assert_eq!(cp.parent, Some(root));
        assert_eq!(cp.pages.keys().copied().collect::<Vec<_>>(), vec![0x2000]);

        m.mem.unmap(0x3000, 0x1000).unwrap();
        Memory::write(&mut m, 0x1000, b"gone").unwrap();
        assert_eq!(chain.restore(root, &mut m, &mut k).unwrap(), 0);
        assert_eq!(Memory::read(&m, 0x1000, 4).unwrap(), b"root");
        assert_eq!(Memory::read(&m, 0x2004, 6).unwrap(), vec![0; 6]);
        assert!(m.mem.is_mapped(0x3000, 0x1000));
        assert_eq!(Registers::read(&m, RegisterX86::EAX).unwrap(), 1);

        // later checkpoints stay addressable
        assert_eq!(chain.restore(second, &mut m, &mut k).unwrap(), 10);
        assert_eq!(Memory::read(&m, 0x2004, 6).unwrap(), b"second");
        assert_eq!(Registers::read(&m, RegisterX86::EAX).unwrap(), 2);

        // restore then capture branches off the restored checkpoint
        chain.restore(root, &mut m, &mut k).unwrap();
        Memory::write(&mut m, 0x1000, b"fork").unwrap();
        let third = chain.capture(&mut m, &k, 5).unwrap();
        assert_eq!(chain.get(third).unwrap().parent, Some(root));
        assert_eq!(chain.nearest_before(7).unwrap().id, third);
        assert_eq!(chain.nearest_before(4).unwrap().id, root);
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_corrupt_checkpoint_is_rejected() {
        let (mut m, mut k) = setup();
        let mut chain = CheckpointChain::default();
        let root = chain.capture(&mut m, &k, 0).unwrap();
        Memory::write(&mut m, 0x1000, b"live").unwrap();
        let second = chain.capture(&mut m, &k, 1).unwrap();
        chain.checkpoints[0].retired = 99;

        Memory::write(&mut m, 0x1000, b"keep").unwrap();
        assert!(matches!(
            chain.restore(second, &mut m, &mut k),
            Err(EmulatorError::CorruptCheckpoint { id, .. }) if id == root
        ));
        // live state untouched
        assert_eq!(Memory::read(&m, 0x1000, 4).unwrap(), b"keep");
        assert!(matches!(
            chain.restore(42, &mut m, &mut k),
            Err(EmulatorError::UnknownCheckpoint(42))
        ));
    }
}
