//! In-memory registry seeded from the config profile, and the advapi32
//! functions over it.

use super::{params, stdcall};
use crate::{
    config::RegistryValueConfig,
    engine::Machine,
    errors::Result,
    memory::Memory,
    os::{objects::EmulatedObject, ApiOutcome, Kernel},
    utils::read_cstring,
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const REG_SZ: u32 = 1;
pub const REG_BINARY: u32 = 3;
pub const REG_DWORD: u32 = 4;

const ERROR_SUCCESS: u64 = 0;
const ERROR_FILE_NOT_FOUND: u64 = 2;
const ERROR_INVALID_HANDLE: u64 = 6;
const ERROR_ACCESS_DENIED: u64 = 5;
const ERROR_MORE_DATA: u64 = 234;

const ROOTS: [(u64, &str); 4] = [
    (0x8000_0000, "HKEY_CLASSES_ROOT"),
    (0x8000_0001, "HKEY_CURRENT_USER"),
    (0x8000_0002, "HKEY_LOCAL_MACHINE"),
    (0x8000_0003, "HKEY_USERS"),
];

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct RegValue {
    pub name: String,
    pub kind: u32,
    #[serde(with = "hex::serde")]
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, Eq, PartialEq)]
pub struct RegKey {
    pub path: String,
    /// keyed by lower-cased value name
    pub values: BTreeMap<String, RegValue>,
}

/// Keys are case-insensitive; lookups go through the lower-cased path.
#[derive(Serialize, Deserialize, Clone, Debug, Default, Eq, PartialEq)]
pub struct Registry {
    keys: BTreeMap<String, RegKey>,
}

fn canonical(path: &str) -> String {
    let path = path.trim_matches('\\');
    let (root, rest) = path.split_once('\\').unwrap_or((path, ""));
    let root = match root.to_ascii_uppercase().as_str() {
        "HKLM" => "HKEY_LOCAL_MACHINE".to_string(),
        "HKCU" => "HKEY_CURRENT_USER".to_string(),
        "HKCR" => "HKEY_CLASSES_ROOT".to_string(),
        "HKU" => "HKEY_USERS".to_string(),
        other => other.to_string(),
    };
    match rest {
        "" => root,
        rest => format!("{}\\{}", root, rest),
    }
}

fn lookup_key(path: &str) -> String {
    canonical(path).to_ascii_lowercase()
}

impl Registry {
    pub fn from_config(profile: &BTreeMap<String, BTreeMap<String, RegistryValueConfig>>) -> Self {
        let mut reg = Self::default();
        for (path, values) in profile {
            reg.create(path);
            for (name, value) in values {
                let (kind, data) = match value {
                    RegistryValueConfig::Dword(v) => (REG_DWORD, v.to_le_bytes().to_vec()),
                    RegistryValueConfig::String(s) => {
                        let mut data = s.as_bytes().to_vec();
                        data.push(0);
                        (REG_SZ, data)
                    }
                    RegistryValueConfig::Binary(b) => (REG_BINARY, b.clone()),
                };
                reg.set_value(path, name, kind, data);
            }
        }
        reg
    }

    pub fn root_name(hkey: u64) -> Option<&'static str> {
        ROOTS.iter().find(|(k, _)| *k == hkey & 0xffff_ffff).map(|(_, n)| *n)
    }

    pub fn exists(&self, path: &str) -> bool {
        let path = canonical(path);
        !path.contains('\\') || self.keys.contains_key(&path.to_ascii_lowercase())
    }

    /// Create `path` and its parents; true if the key is new.
    pub fn create(&mut self, path: &str) -> bool {
        let path = canonical(path);
        let mut created = false;
        let mut prefix = String::new();
        for (i, part) in path.split('\\').enumerate() {
            if i > 0 {
                prefix.push('\\');
            }
            prefix.push_str(part);
            if i == 0 {
                continue;
            }
            let key = prefix.to_ascii_lowercase();
            if !self.keys.contains_key(&key) {
                self.keys.insert(
                    key,
                    RegKey {
                        path: prefix.clone(),
                        values: BTreeMap::new(),
                    },
                );
                created = true;
            }
        }
        created
    }

    pub fn set_value(&mut self, path: &str, name: &str, kind: u32, data: Vec<u8>) -> bool {
        match self.keys.get_mut(&lookup_key(path)) {
            Some(key) => {
                key.values.insert(
                    name.to_ascii_lowercase(),
                    RegValue {
                        name: name.to_string(),
                        kind,
                        data,
                    },
                );
                true
            }
            None => false,
        }
    }

    pub fn query_value(&self, path: &str, name: &str) -> Option<&RegValue> {
        self.keys
            .get(&lookup_key(path))?
            .values
            .get(&name.to_ascii_lowercase())
    }

    pub fn delete_value(&mut self, path: &str, name: &str) -> bool {
        self.keys
            .get_mut(&lookup_key(path))
            .and_then(|k| k.values.remove(&name.to_ascii_lowercase()))
            .is_some()
    }

    /// Delete a key without subkeys.
    pub fn delete_key(&mut self, path: &str) -> std::result::Result<(), u64> {
        let key = lookup_key(path);
        if !self.keys.contains_key(&key) {
            return Err(ERROR_FILE_NOT_FOUND);
        }
        let child = format!("{}\\", key);
        if self.keys.keys().any(|k| k.starts_with(&child)) {
            return Err(ERROR_ACCESS_DENIED);
        }
        self.keys.remove(&key);
        Ok(())
    }
}

/// Full path behind an open key handle or a predefined root.
fn key_path(k: &Kernel, hkey: u64) -> Option<String> {
    if let Some(root) = Registry::root_name(hkey) {
        return Some(root.to_string());
    }
    match k.state.objects.get(hkey) {
        Some(EmulatedObject::RegistryKey { path }) => Some(path.clone()),
        _ => None,
    }
}

fn subkey_path(k: &Kernel, m: &Machine, hkey: u64, subkey: u64) -> Result<Option<String>> {
    let base = match key_path(k, hkey) {
        Some(b) => b,
        None => return Ok(None),
    };
    if subkey == 0 {
        return Ok(Some(base));
    }
    let sub = read_cstring(m, subkey)?;
    Ok(Some(match sub.trim_matches('\\') {
        "" => base,
        sub => format!("{}\\{}", base, sub),
    }))
}

fn open_handle(k: &mut Kernel, m: &mut Machine, path: String, out: u64) -> Result<()> {
    let handle = k.state.objects.insert(EmulatedObject::RegistryKey {
        path: canonical(&path),
    });
    m.write_ptr(out, handle, None)
}

/// advapi32 registry functions; `None` for other symbols.
pub(crate) fn call(k: &mut Kernel, m: &mut Machine, symbol: &str) -> Result<Option<ApiOutcome>> {
    let (nargs, status) = match symbol {
        "RegOpenKeyExA" | "RegOpenKeyA" => {
            let n = if symbol == "RegOpenKeyA" { 3 } else { 5 };
            let p = params(k, m, n)?;
            let out = p[n - 1];
            let status = match subkey_path(k, m, p[0], p[1])? {
                None => ERROR_INVALID_HANDLE,
                Some(path) if k.state.registry.exists(&path) => {
                    open_handle(k, m, path, out)?;
                    ERROR_SUCCESS
                }
                Some(_) => ERROR_FILE_NOT_FOUND,
            };
            (n, status)
        }
        "RegCreateKeyExA" => {
            let p = params(k, m, 9)?;
            let status = match subkey_path(k, m, p[0], p[1])? {
                None => ERROR_INVALID_HANDLE,
                Some(path) => {
                    let created = k.state.registry.create(&path);
                    open_handle(k, m, path, p[7])?;
                    if p[8] != 0 {
                        m.write_u32(p[8], if created { 1 } else { 2 })?;
                    }
                    ERROR_SUCCESS
                }
            };
            (9, status)
        }
        "RegSetValueExA" => {
            let p = params(k, m, 6)?;
            let name = match p[1] {
                0 => String::new(),
                addr => read_cstring(&*m, addr)?,
            };
            let data = match p[5] {
                0 => vec![],
                len => Memory::read(m, p[4], len as usize)?,
            };
            let status = match key_path(k, p[0]) {
                Some(path) if k.state.registry.set_value(&path, &name, p[3] as u32, data) => ERROR_SUCCESS,
                Some(_) => ERROR_FILE_NOT_FOUND,
                None => ERROR_INVALID_HANDLE,
            };
            (6, status)
        }
        "RegQueryValueExA" => {
            let p = params(k, m, 6)?;
            let name = match p[1] {
                0 => String::new(),
                addr => read_cstring(&*m, addr)?,
            };
            let value = key_path(k, p[0]).map(|path| k.state.registry.query_value(&path, &name).cloned());
            let status = match value {
                None => ERROR_INVALID_HANDLE,
                Some(None) => ERROR_FILE_NOT_FOUND,
                Some(Some(v)) => {
                    if p[3] != 0 {
                        m.write_u32(p[3], v.kind)?;
                    }
                    let mut status = ERROR_SUCCESS;
                    if p[5] != 0 {
                        let room = m.read_u32(p[5])? as usize;
                        if p[4] != 0 {
                            if room < v.data.len() {
                                status = ERROR_MORE_DATA;
                            } else {
                                Memory::write(m, p[4], &v.data)?;
                            }
                        }
                        m.write_u32(p[5], v.data.len() as u32)?;
                    }
                    status
                }
            };
            (6, status)
        }
        "RegDeleteValueA" => {
            let p = params(k, m, 2)?;
            let name = read_cstring(&*m, p[1])?;
            let status = match key_path(k, p[0]) {
                Some(path) if k.state.registry.delete_value(&path, &name) => ERROR_SUCCESS,
                Some(_) => ERROR_FILE_NOT_FOUND,
                None => ERROR_INVALID_HANDLE,
            };
            (2, status)
        }
        "RegDeleteKeyA" => {
            let p = params(k, m, 2)?;
            let status = match subkey_path(k, m, p[0], p[1])? {
                Some(path) => match k.state.registry.delete_key(&path) {
                    Ok(()) => ERROR_SUCCESS,
                    Err(e) => e,
                },
                None => ERROR_INVALID_HANDLE,
            };
            (2, status)
        }
        "RegCloseKey" => {
            let p = params(k, m, 1)?;
            let status = match k.state.objects.get(p[0]) {
                Some(EmulatedObject::RegistryKey { .. }) => {
                    k.state.objects.remove(p[0]);
                    ERROR_SUCCESS
                }
                _ if Registry::root_name(p[0]).is_some() => ERROR_SUCCESS,
                _ => ERROR_INVALID_HANDLE,
            };
            (1, status)
        }
        _ => return Ok(None),
    };
    debug!("{} -> {}", symbol, status);
    Ok(Some(ApiOutcome::ret(status, stdcall(k, nargs))))
}
