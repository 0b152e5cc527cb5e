use crate::{
    arch::ArchType,
    errors::Result,
    loader::ImageFormat,
    memory::{PointerSizeT, DEFAULT_MEMORY_BUDGET},
    os::{OsType, StdioMode, UnknownSyscallPolicy, UnresolvedSymbolPolicy},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf};

/// Memory layout overrides; unset fields take per-(os, pointer size) defaults.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Debug, Default)]
#[serde(default)]
pub struct MemoryConfig {
    pub stack_address: Option<u64>,
    pub stack_size: Option<u64>,
    /// base of position independent images, and of raw images
    pub load_address: Option<u64>,
    pub mmap_address: Option<u64>,
    pub interp_address: Option<u64>,
    /// emulated library stubs live here
    pub stub_address: Option<u64>,
    pub heap_address: Option<u64>,
    pub heap_size: Option<u64>,
    /// host bytes the guest's regions may occupy in total
    pub max_memory: Option<u64>,
}

/// Concrete layout after defaults are applied.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Debug)]
pub struct MemoryLayout {
    pub stack_address: u64,
    pub stack_size: u64,
    pub load_address: u64,
    pub mmap_address: u64,
    pub interp_address: u64,
    pub stub_address: u64,
    pub heap_address: u64,
    pub heap_size: u64,
}

impl MemoryLayout {
    pub fn default_for(os: OsType, pointer_size: PointerSizeT) -> Self {
        match (os, pointer_size) {
            (OsType::Windows, 4) => Self {
                stack_address: 0x00f0_0000,
                stack_size: 0x0010_0000,
                load_address: 0x0040_0000,
                mmap_address: 0x5000_0000,
                interp_address: 0,
                stub_address: 0x7f00_0000,
                heap_address: 0x0500_0000,
                heap_size: 0x0100_0000,
            },
            (OsType::Windows, _) => Self {
                stack_address: 0x0000_7ffe_fff0_0000,
                stack_size: 0x0010_0000,
                load_address: 0x0000_0001_4000_0000,
                mmap_address: 0x0000_0005_0000_0000,
                interp_address: 0,
                stub_address: 0x0000_7fff_0000_0000,
                heap_address: 0x0000_0004_0000_0000,
                heap_size: 0x0100_0000,
            },
            (OsType::MacOS, _) => Self {
                stack_address: 0x0000_7ff7_bfe0_0000,
                stack_size: 0x0010_0000,
                load_address: 0x0000_0001_0000_0000,
                mmap_address: 0x0000_7ff8_0000_0000,
                interp_address: 0,
                stub_address: 0x0000_7fff_0000_0000,
                heap_address: 0,
                heap_size: 0,
            },
            (_, 4) => Self {
                stack_address: 0x7ff0_d000,
                stack_size: 0x0003_0000,
                load_address: 0x5655_5000,
                mmap_address: 0x9000_0000,
                interp_address: 0x047b_a000,
                stub_address: 0x7f00_0000,
                heap_address: 0,
                heap_size: 0,
            },
            (_, _) => Self {
                stack_address: 0x0000_7fff_fffd_e000,
                stack_size: 0x0003_0000,
                load_address: 0x0000_5555_5555_4000,
                mmap_address: 0x0000_7fff_b7dd_6000,
                interp_address: 0x0000_7fff_f7dd_5000,
                stub_address: 0x0000_7fff_0000_0000,
                heap_address: 0,
                heap_size: 0,
            },
        }
    }

    pub fn stack_top(&self) -> u64 {
        self.stack_address + self.stack_size
    }
}

impl MemoryConfig {
    pub fn resolve(&self, os: OsType, pointer_size: PointerSizeT) -> MemoryLayout {
        let d = MemoryLayout::default_for(os, pointer_size);
        MemoryLayout {
            stack_address: self.stack_address.unwrap_or(d.stack_address),
            stack_size: self.stack_size.unwrap_or(d.stack_size),
            load_address: self.load_address.unwrap_or(d.load_address),
            mmap_address: self.mmap_address.unwrap_or(d.mmap_address),
            interp_address: self.interp_address.unwrap_or(d.interp_address),
            stub_address: self.stub_address.unwrap_or(d.stub_address),
            heap_address: self.heap_address.unwrap_or(d.heap_address),
            heap_size: self.heap_size.unwrap_or(d.heap_size),
        }
    }

    pub fn budget(&self) -> u64 {
        self.max_memory.unwrap_or(DEFAULT_MEMORY_BUDGET)
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq, Debug, Default)]
#[serde(default)]
pub struct PolicyConfig {
    pub unknown_syscall: UnknownSyscallPolicy,
    pub unresolved_symbol: UnresolvedSymbolPolicy,
}

/// A registry value in the profile: integers become `REG_DWORD`, strings
/// `REG_SZ`, byte arrays `REG_BINARY`.
#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, Debug)]
#[serde(untagged)]
pub enum RegistryValueConfig {
    Dword(u32),
    String(String),
    Binary(Vec<u8>),
}

#[derive(Serialize, Deserialize, Clone, Eq, PartialEq, Debug)]
#[serde(default)]
pub struct EmuConfig {
    pub arch: Option<ArchType>,
    pub big_endian: Option<bool>,
    /// inferred from the image when unset
    pub os: Option<OsType>,
    /// force a format, `raw` needs it
    pub format: Option<ImageFormat>,
    pub memory: MemoryConfig,
    pub policy: PolicyConfig,
    /// take a checkpoint every this many instructions
    pub checkpoint_interval: Option<u64>,
    pub rootfs: Option<PathBuf>,
    pub cwd: String,
    pub stdio: StdioMode,
    /// virtual epoch in seconds
    pub clock_base: u64,
    pub random_seed: u64,
    pub env: BTreeMap<String, String>,
    /// key path -> value name -> value
    pub registry: BTreeMap<String, BTreeMap<String, RegistryValueConfig>>,
}

impl Default for EmuConfig {
    fn default() -> Self {
        Self {
            arch: None,
            big_endian: None,
            os: None,
            format: None,
            memory: MemoryConfig::default(),
            policy: PolicyConfig::default(),
            checkpoint_interval: None,
            rootfs: None,
            cwd: "/".to_string(),
            stdio: StdioMode::default(),
            clock_base: 1_600_000_000,
            random_seed: 0x5eed,
            env: BTreeMap::new(),
            registry: BTreeMap::new(),
        }
    }
}

impl EmuConfig {
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| anyhow::anyhow!("invalid config: {}", e).into())
    }
}
