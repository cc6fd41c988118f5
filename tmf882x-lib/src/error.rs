use std::io;
use thiserror::Error;

use crate::chip::Mode;

/// Failure reported by a bus transport, enable line or interrupt line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no acknowledge from device at register {register:#04x}")]
    Nack { register: u8 },

    #[error("bus I/O failure: {0}")]
    Bus(String),

    #[error("line control failure: {0}")]
    Line(String),
}

/// The primary error type for the `tmf882x-lib` library.
#[derive(Error, Debug)]
pub enum TofError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("Output queue overflow: message of {len} bytes does not fit in {capacity} bytes")]
    Overflow { len: usize, capacity: usize },

    #[error("Malformed message: {0}")]
    Format(String),

    #[error("Device is in {actual} mode, expected {expected}")]
    State { expected: Mode, actual: Mode },

    #[error("Operation would block")]
    WouldBlock,

    #[error("No data available")]
    NoData,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Command {command:#04x} failed with status {status:#04x}")]
    Command { command: u8, status: u8 },

    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    #[error("Operation cancelled by device teardown")]
    Cancelled,
}

impl TofError {
    /// True for the errors a non-blocking caller should retry later.
    pub fn is_would_block(&self) -> bool {
        matches!(self, TofError::WouldBlock | TofError::NoData)
    }
}

pub type Result<T, E = TofError> = std::result::Result<T, E>;
