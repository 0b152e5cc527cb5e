//! Multi-OS, multi-arch user-mode binary emulation around a pluggable CPU
//! engine: loaders, OS emulation, hooks, checkpoints and a debug front end.

pub mod arch;
pub mod cc;
pub mod config;
pub mod controller;
pub mod debugger;
pub mod emulator;
pub mod engine;
pub mod errors;
pub mod hooks;
pub mod loader;
pub mod memory;
pub mod os;
pub mod registers;
pub mod snapshot;
pub mod stack;
pub mod utils;

#[cfg(test)]
mod testing;

pub use controller::{ControlHandle, EmuState, PauseReason, RunLimits, RunUntil, StopReason};
pub use emulator::Emulator;
pub use errors::{EmulatorError, Result};

pub const PAGE_SIZE: u64 = 0x1000;

/// Parse a `KEY=VALUE` command line pair.
pub fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}
