//! Remote debugging: a JSON request/response protocol, one message per line,
//! answered synchronously against a live session.

mod server;

pub use server::{serve, serve_tcp};

use crate::{
    controller::{EmuState, PauseReason, RunLimits, RunUntil},
    emulator::Emulator,
    errors::Result,
    hooks::{HookAction, HookId},
    loader::ImageFormat,
    memory::{Access, RegionInfo},
    registers::Registers,
    snapshot::CheckpointSummary,
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    rc::Rc,
};

fn one() -> u64 {
    1
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    Read,
    Write,
    ReadWrite,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    SetBreakpoint {
        address: u64,
    },
    ClearBreakpoint {
        address: u64,
    },
    SetWatchpoint {
        address: u64,
        #[serde(default = "one")]
        size: u64,
        access: WatchKind,
    },
    ClearWatchpoint {
        address: u64,
    },
    /// run until a stop, or until pc reaches `until`.
    Continue {
        #[serde(default)]
        until: Option<u64>,
    },
    Step {
        #[serde(default = "one")]
        count: u64,
    },
    StepBackward {
        #[serde(default = "one")]
        count: u64,
    },
    ReadRegister {
        name: String,
    },
    WriteRegister {
        name: String,
        value: u64,
    },
    ReadRegisters,
    ReadMemory {
        address: u64,
        size: u64,
    },
    WriteMemory {
        address: u64,
        #[serde(with = "hex::serde")]
        data: Vec<u8>,
    },
    StopReason,
    Checkpoint,
    Restore {
        id: u64,
    },
    ListCheckpoints,
    Regions,
    Images,
    /// pause a running session, delivered out of band by the server.
    Interrupt,
    Kill,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct ImageSummary {
    pub name: String,
    pub path: String,
    pub format: ImageFormat,
    pub base: u64,
    pub size: u64,
    pub entry: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok,
    State {
        state: EmuState,
        pc: u64,
        retired: u64,
    },
    Register {
        name: String,
        value: u64,
    },
    Registers {
        registers: BTreeMap<String, u64>,
    },
    Memory {
        address: u64,
        #[serde(with = "hex::serde")]
        data: Vec<u8>,
    },
    Checkpoint {
        id: u64,
    },
    Checkpoints {
        checkpoints: Vec<CheckpointSummary>,
    },
    Regions {
        regions: Vec<RegionInfo>,
    },
    Images {
        images: Vec<ImageSummary>,
    },
    Error {
        message: String,
    },
}

/// A debug session over one emulator.
pub struct Debugger {
    emu: Emulator,
    watchpoints: BTreeMap<u64, Vec<HookId>>,
    /// address and kind of the access that tripped a watchpoint.
    watch_hit: Rc<RefCell<Option<(u64, Access)>>>,
    killed: bool,
}

impl Debugger {
    /// Takes a checkpoint of the initial state so stepping backward always
    /// has somewhere to start from.
    pub fn new(mut emu: Emulator) -> Result<Self> {
        if emu.checkpoints().is_empty() {
            emu.checkpoint()?;
        }
        Ok(Self {
            emu,
            watchpoints: BTreeMap::new(),
            watch_hit: Rc::new(RefCell::new(None)),
            killed: false,
        })
    }

    pub fn emulator(&self) -> &Emulator {
        &self.emu
    }

    pub fn into_inner(self) -> Emulator {
        self.emu
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    pub fn handle(&mut self, request: Request) -> Response {
        debug!("debug request {:?}", request);
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        }
    }

    fn dispatch(&mut self, request: Request) -> Result<Response> {
        let emu = &mut self.emu;
        Ok(match request {
            Request::SetBreakpoint { address } => {
                emu.add_breakpoint(address);
                Response::Ok
            }
            Request::ClearBreakpoint { address } => {
                emu.remove_breakpoint(address);
                Response::Ok
            }
            Request::SetWatchpoint {
                address,
                size,
                access,
            } => {
                self.set_watchpoint(address, size.max(1), access);
                Response::Ok
            }
            Request::ClearWatchpoint { address } => {
                for id in self.watchpoints.remove(&address).unwrap_or_default() {
                    self.emu.hooks_mut().remove_hook(id)?;
                }
                Response::Ok
            }
            Request::Continue { until } => {
                let until = until.map_or(RunUntil::Forever, RunUntil::Address);
                let state = emu.run(until, RunLimits::default())?;
                self.after_run(state)?
            }
            Request::Step { count } => {
                let state = emu.step(count)?;
                self.after_run(state)?
            }
            Request::StepBackward { count } => {
                emu.step_back(count)?;
                self.state()?
            }
            Request::ReadRegister { name } => Response::Register {
                value: emu.read_register(&name)?,
                name,
            },
            Request::WriteRegister { name, value } => {
                emu.write_register(&name, value)?;
                Response::Ok
            }
            Request::ReadRegisters => Response::Registers {
                registers: emu.registers()?,
            },
            Request::ReadMemory { address, size } => Response::Memory {
                address,
                data: emu.peek(address, size as usize)?,
            },
            Request::WriteMemory { address, data } => {
                emu.poke(address, &data)?;
                Response::Ok
            }
            Request::StopReason => self.state()?,
            Request::Checkpoint => Response::Checkpoint {
                id: emu.checkpoint()?,
            },
            Request::Restore { id } => {
                emu.restore(id)?;
                self.state()?
            }
            Request::ListCheckpoints => Response::Checkpoints {
                checkpoints: emu.checkpoints(),
            },
            Request::Regions => Response::Regions {
                regions: emu.regions(),
            },
            Request::Images => Response::Images {
                images: emu
                    .images()
                    .iter()
                    .map(|i| ImageSummary {
                        name: i.name.clone(),
                        path: i.path.clone(),
                        format: i.format,
                        base: i.base,
                        size: i.size,
                        entry: i.entry,
                    })
                    .collect(),
            },
            // nothing is running between requests
            Request::Interrupt => Response::Ok,
            Request::Kill => {
                emu.teardown();
                self.killed = true;
                Response::Ok
            }
        })
    }

    fn set_watchpoint(&mut self, address: u64, size: u64, kind: WatchKind) {
        let end = address.saturating_add(size);
        let mut ids = vec![];
        if matches!(kind, WatchKind::Read | WatchKind::ReadWrite) {
            let hit = self.watch_hit.clone();
            ids.push(self.emu.hooks_mut().add_mem_read_hook(address, end, move |a| {
                hit.borrow_mut().replace((a.address, a.access));
                HookAction::Pause
            }));
        }
        if matches!(kind, WatchKind::Write | WatchKind::ReadWrite) {
            let hit = self.watch_hit.clone();
            ids.push(self.emu.hooks_mut().add_mem_write_hook(address, end, move |a| {
                hit.borrow_mut().replace((a.address, a.access));
                HookAction::Pause
            }));
        }
        self.watchpoints.entry(address).or_default().extend(ids);
    }

    /// A hook pause caused by a watchpoint is reported as one.
    fn after_run(&mut self, state: EmuState) -> Result<Response> {
        let hit = self.watch_hit.borrow_mut().take();
        if let (EmuState::Paused(PauseReason::Hook), Some((address, access))) = (&state, hit) {
            self.emu.exec.state = EmuState::Paused(PauseReason::Watchpoint { address, access });
        }
        self.state()
    }

    fn state(&self) -> Result<Response> {
        Ok(Response::State {
            state: self.emu.state().clone(),
            pc: self.emu.machine.pc()?,
            retired: self.emu.retired(),
        })
    }

    pub fn breakpoints(&self) -> BTreeSet<u64> {
        self.emu.breakpoints().collect()
    }
}
