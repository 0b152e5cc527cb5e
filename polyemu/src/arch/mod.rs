/// Declares a register enum whose discriminants are dense register ids.
macro_rules! register_set {
    ($(#[$meta:meta])* $name:ident { $($reg:ident),* $(,)? }) => {
        $(#[$meta])*
        #[allow(non_camel_case_types, clippy::upper_case_acronyms)]
        #[derive(
            Copy, Clone, Debug, Eq, PartialEq, Hash, strum::EnumString, strum::EnumIter, strum::IntoStaticStr,
        )]
        #[strum(serialize_all = "lowercase")]
        #[repr(i32)]
        pub enum $name {
            $($reg),*
        }

        impl From<$name> for i32 {
            fn from(r: $name) -> i32 {
                r as i32
            }
        }
    };
}

pub mod arm;
pub mod mips;
pub mod riscv;
pub mod x86;

use crate::memory::PointerSizeT;
use goblin::container::Endian;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{Display, EnumString, IntoEnumIterator};

pub use arm::{RegisterArm, RegisterArm64};
pub use mips::RegisterMips;
pub use riscv::RegisterRiscv;
pub use x86::{RegisterX86, RegisterX8664};

/// Register ids are the discriminants of the per-arch register enums.
pub type RegId = i32;

#[derive(
    Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, EnumString, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ArchType {
    X86,
    #[serde(alias = "x86_64")]
    #[strum(to_string = "x86_64", serialize = "x8664")]
    X8664,
    Arm,
    #[serde(alias = "aarch64")]
    #[strum(to_string = "arm64", serialize = "aarch64")]
    Arm64,
    Mips,
    #[serde(alias = "riscv")]
    #[strum(to_string = "riscv64", serialize = "riscv")]
    Riscv64,
}

impl ArchType {
    pub fn pointer_size(&self) -> PointerSizeT {
        match self {
            ArchType::X86 | ArchType::Arm | ArchType::Mips => 4,
            ArchType::X8664 | ArchType::Arm64 | ArchType::Riscv64 => 8,
        }
    }

    pub fn pc_reg(&self) -> RegId {
        match self {
            ArchType::X86 => RegisterX86::EIP.into(),
            ArchType::X8664 => RegisterX8664::RIP.into(),
            ArchType::Arm => RegisterArm::PC.into(),
            ArchType::Arm64 => RegisterArm64::PC.into(),
            ArchType::Mips => RegisterMips::PC.into(),
            ArchType::Riscv64 => RegisterRiscv::PC.into(),
        }
    }

    pub fn sp_reg(&self) -> RegId {
        match self {
            ArchType::X86 => RegisterX86::ESP.into(),
            ArchType::X8664 => RegisterX8664::RSP.into(),
            ArchType::Arm => RegisterArm::SP.into(),
            ArchType::Arm64 => RegisterArm64::SP.into(),
            ArchType::Mips => RegisterMips::SP.into(),
            ArchType::Riscv64 => RegisterRiscv::SP.into(),
        }
    }

    /// Every register of the arch, in id order.
    pub fn registers(&self) -> Vec<(RegId, &'static str)> {
        fn collect<R>() -> Vec<(RegId, &'static str)>
        where
            R: IntoEnumIterator + Into<RegId> + Into<&'static str> + Copy,
        {
            R::iter().map(|r| (r.into(), r.into())).collect()
        }
        match self {
            ArchType::X86 => collect::<RegisterX86>(),
            ArchType::X8664 => collect::<RegisterX8664>(),
            ArchType::Arm => collect::<RegisterArm>(),
            ArchType::Arm64 => collect::<RegisterArm64>(),
            ArchType::Mips => collect::<RegisterMips>(),
            ArchType::Riscv64 => collect::<RegisterRiscv>(),
        }
    }

    pub fn register_count(&self) -> usize {
        self.registers().len()
    }

    pub fn reg_by_name(&self, name: &str) -> Option<RegId> {
        let name = name.to_lowercase();
        match self {
            ArchType::X86 => RegisterX86::from_str(&name).ok().map(Into::into),
            ArchType::X8664 => RegisterX8664::from_str(&name).ok().map(Into::into),
            ArchType::Arm => RegisterArm::from_str(&name).ok().map(Into::into),
            ArchType::Arm64 => RegisterArm64::from_str(&name).ok().map(Into::into),
            ArchType::Mips => RegisterMips::from_str(&name).ok().map(Into::into),
            ArchType::Riscv64 => RegisterRiscv::from_str(&name).ok().map(Into::into),
        }
    }

    pub fn reg_name(&self, reg: RegId) -> Option<&'static str> {
        self.registers()
            .into_iter()
            .find(|(id, _)| *id == reg)
            .map(|(_, name)| name)
    }
}

/// Static description of the emulated cpu.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
pub struct ArchInfo {
    pub arch: ArchType,
    pub big_endian: bool,
}

impl ArchInfo {
    pub fn new(arch: ArchType, endian: Endian) -> Self {
        Self {
            arch,
            big_endian: endian == Endian::Big,
        }
    }

    /// MIPS defaults to big endian.
    pub fn default_for(arch: ArchType) -> Self {
        Self::new(
            arch,
            match arch {
                ArchType::Mips => Endian::Big,
                _ => Endian::Little,
            },
        )
    }

    pub fn endian(&self) -> Endian {
        if self.big_endian {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub fn pointer_size(&self) -> PointerSizeT {
        self.arch.pointer_size()
    }

    pub fn pc_reg(&self) -> RegId {
        self.arch.pc_reg()
    }

    pub fn sp_reg(&self) -> RegId {
        self.arch.sp_reg()
    }

    /// Mask for a native-width value.
    pub fn word_mask(&self) -> u64 {
        match self.pointer_size() {
            4 => u32::MAX as u64,
            _ => u64::MAX,
        }
    }
}
