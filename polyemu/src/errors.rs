use crate::{controller::FaultReport, memory::Access};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("malformed image: {0}")]
    MalformedImage(String),
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("unresolved symbol {library}!{symbol}")]
    UnresolvedSymbol { library: String, symbol: String },
    #[error("access violation: {access:?} of {size} bytes at {address:#x}")]
    AccessViolation {
        address: u64,
        size: u64,
        access: Access,
    },
    #[error("out of address space, requested {size:#x} bytes")]
    OutOfSpace { size: u64 },
    #[error("mapping [{base:#x}, +{size:#x}) collides with an existing region")]
    CollisionError { base: u64, size: u64 },
    #[error("syscall {number} not implemented for {os}")]
    NotImplementedSyscall { os: String, number: u64 },
    #[error("guest fault: {0}")]
    Fault(Box<FaultReport>),
    #[error("run timed out")]
    Timeout,
    #[error("session has been torn down")]
    SessionTornDown,
    #[error("checkpoint {id} is corrupt: {reason}")]
    CorruptCheckpoint { id: u64, reason: String },
    #[error("no such checkpoint {0}")]
    UnknownCheckpoint(u64),
    #[error("invalid register {0}")]
    InvalidRegister(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("cpu engine error: {0}")]
    Engine(String),
    #[error("loader error {0}")]
    LoaderError(#[from] goblin::error::Error),
    #[error("io error {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error {0}")]
    Serde(#[from] serde_json::Error),
    #[error("custom error {0}")]
    Custom(#[from] anyhow::Error),
}

impl EmulatorError {
    pub fn access_violation(address: u64, size: u64, access: Access) -> Self {
        Self::AccessViolation {
            address,
            size,
            access,
        }
    }
}

#[cfg(feature = "unicorn")]
impl From<unicorn_engine::unicorn_const::uc_error> for EmulatorError {
    fn from(e: unicorn_engine::unicorn_const::uc_error) -> Self {
        Self::Engine(format!("{:?}", e))
    }
}

pub type Result<T> = std::result::Result<T, EmulatorError>;
