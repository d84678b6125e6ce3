// src/io/error.rs
//
// Error types shared by the Modbus client, server and codec.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio_modbus::ExceptionCode;

/// Errors raised by the register codec.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("value {value} is out of range for {data_type}")]
    OutOfRange { data_type: String, value: String },

    #[error("{data_type} expects a {expected} value")]
    WrongKind {
        data_type: String,
        expected: &'static str,
    },

    #[error("address {address} with {words} word(s) exceeds the 65535 register space")]
    AddressOverflow { address: u32, words: u32 },
}

/// Errors raised by the Modbus client, server and transports.
#[derive(Debug, Error)]
pub enum ModbusError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("Modbus exception: {0:?}")]
    Exception(ExceptionCode),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Conflict(String),

    #[error("No available port found (tried {attempts} ports starting at {start})")]
    NoAvailablePort { start: u16, attempts: u16 },

    #[error("No server found with id {0}")]
    ServerNotFound(String),

    #[error("Settings error: {0}")]
    Settings(String),
}

impl ModbusError {
    /// True when the error means the underlying connection is gone and the
    /// transport must be reopened before it can be used again.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            ModbusError::ConnectionClosed(_) | ModbusError::NotConnected => true,
            ModbusError::Io(e) => io_error_is_connection_lost(e),
            _ => false,
        }
    }

    /// True when the error is a per-operation timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            ModbusError::Timeout(_) => true,
            ModbusError::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }
}

/// Classify an IO error as a lost connection.
pub fn io_error_is_connection_lost(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

impl From<tokio_modbus::Error> for ModbusError {
    fn from(e: tokio_modbus::Error) -> Self {
        match e {
            tokio_modbus::Error::Transport(io_err) => {
                if io_error_is_connection_lost(&io_err) {
                    ModbusError::ConnectionClosed(io_err.to_string())
                } else {
                    ModbusError::Io(io_err)
                }
            }
            other => ModbusError::Protocol(other.to_string()),
        }
    }
}

impl From<serialport::Error> for ModbusError {
    fn from(e: serialport::Error) -> Self {
        ModbusError::Serial(e.to_string())
    }
}
