use bytes::{Buf, BufMut, Bytes, BytesMut};
use goblin::{
    container::Endian,
    elf::program_header::{PF_R, PF_W, PF_X},
};
use num_traits::PrimInt;
use std::fmt::Debug;

use crate::{
    errors::{EmulatorError, Result},
    memory::{Memory, Permission, PointerSizeT},
};

/// Round `value` down to a multiple of `alignment`, a power of two.
pub fn align<T>(value: T, alignment: impl Into<T>) -> T
where
    T: PrimInt + Debug,
{
    let alignment = alignment.into();
    let mask = alignment - T::one();
    debug_assert_eq!(alignment & mask, T::zero());
    value & (!mask)
}

pub fn align_up<T>(value: T, alignment: impl Into<T>) -> T
where
    T: PrimInt + Debug,
{
    let alignment = alignment.into();
    let mask = alignment - T::one();
    debug_assert_eq!(alignment & mask, T::zero());
    (value + mask) & (!mask)
}

/// `align_up` that yields `None` instead of wrapping past the type's range.
pub fn checked_align_up<T>(value: T, alignment: impl Into<T>) -> Option<T>
where
    T: PrimInt + Debug,
{
    let alignment = alignment.into();
    let mask = alignment - T::one();
    debug_assert_eq!(alignment & mask, T::zero());
    value.checked_add(&mask).map(|v| v & (!mask))
}

/// Translate ELF segment perms to region permissions.
pub fn seg_perm_to_prot(perm: u32) -> Permission {
    let mut prot = Permission::NONE;
    if perm & PF_X != 0 {
        prot |= Permission::EXEC;
    }
    if perm & PF_W != 0 {
        prot |= Permission::WRITE;
    }
    if perm & PF_R != 0 {
        prot |= Permission::READ;
    }

    prot
}

/// Translate posix `PROT_*` bits to region permissions.
pub fn posix_prot_to_perm(prot: u64) -> Permission {
    let mut perm = Permission::NONE;
    if prot & 1 != 0 {
        perm |= Permission::READ;
    }
    if prot & 2 != 0 {
        perm |= Permission::WRITE;
    }
    if prot & 4 != 0 {
        perm |= Permission::EXEC;
    }
    perm
}

/// Read a string terminated by `terminator` starting at `address`.
/// The read is capped at `limit` bytes.
pub fn read_string(
    mem: &impl Memory,
    address: u64,
    terminator: &[u8],
    limit: usize,
) -> Result<String> {
    let mut result: Vec<u8> = Vec::new();
    let char_len = terminator.len();

    let mut address = address;
    loop {
        let char = mem.read(address, char_len)?;
        if char == terminator {
            break;
        }
        result.extend(char);
        if result.len() >= limit {
            break;
        }
        address += char_len as u64;
    }
    String::from_utf8(result).map_err(|e| EmulatorError::Custom(anyhow::Error::new(e)))
}

pub fn read_cstring(mem: &impl Memory, address: u64) -> Result<String> {
    read_string(mem, address, &[0], 4096)
}

/// Windows wide strings.
pub fn read_wstring(mem: &impl Memory, address: u64) -> Result<String> {
    let mut units = Vec::new();
    let mut address = address;
    loop {
        let raw = mem.read(address, 2)?;
        let unit = u16::from_le_bytes([raw[0], raw[1]]);
        if unit == 0 || units.len() >= 4096 {
            break;
        }
        units.push(unit);
        address += 2;
    }
    Ok(String::from_utf16_lossy(&units))
}

#[derive(Copy, Clone, Debug)]
pub struct Packer {
    endian: Endian,
    pointer_size: usize,
}

impl Packer {
    pub fn new(endian: Endian, pointer_size: PointerSizeT) -> Self {
        Self {
            endian,
            pointer_size: pointer_size as usize,
        }
    }
    pub fn pack(&self, v: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        match self.endian {
            Endian::Little => {
                buf.put_uint_le(v, self.pointer_size);
            }

            Endian::Big => {
                buf.put_uint(v, self.pointer_size);
            }
        }
        buf.to_vec()
    }
    pub fn unpack(&self, data: Vec<u8>) -> u64 {
        let mut data = Bytes::from(data);

        match self.endian {
            Endian::Little => data.get_uint_le(self.pointer_size),
            Endian::Big => data.get_uint(self.pointer_size),
        }
    }
    pub fn pointer_size(&self) -> usize {
        self.pointer_size
    }
}

/// Sign-extend a value that is `bits` wide.
pub fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}
