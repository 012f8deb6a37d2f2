use std::io;

use thiserror::Error;

/// Every failure the runtime reports. All of them are raised synchronously at
/// the call that caused them; nothing is retried internally.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("index {index} is out of range for a view of length {length}")]
    OutOfRange { index: usize, length: usize },

    #[error("out of memory: no free run can hold {requested} cells")]
    OutOfMemory { requested: usize },

    #[error("machine part '{0}' is missing")]
    MissingPart(&'static str),

    #[error("object has been disposed")]
    Disposed,

    #[error("address 0x{0:08X} does not select a known segment")]
    AddressingError(u32),

    #[error("script '{0}' was not found")]
    ScriptNotFound(String),

    #[error("invalid module: {0}")]
    InvalidModule(String),

    #[error("invalid instruction opcode 0x{0:02X}")]
    InvalidInstruction(u8),

    #[error("branch target {target} is outside a program of {length} instructions")]
    InvalidBranch { target: i32, length: usize },

    #[error("unknown peripheral function id {0}")]
    UnknownPeripheralFunction(i32),

    #[error("watchdog expired after {elapsed_ms}ms (threshold {threshold_ms}ms)")]
    Watchdog { elapsed_ms: u64, threshold_ms: u64 },

    #[error("thread '{0}' panicked")]
    Panicked(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type VmResult<T> = Result<T, VmError>;

impl VmError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}
