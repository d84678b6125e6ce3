// src/io/mod.rs
//
// Modbus IO: register codec, transports, client and server emulator.
// Shared types used by more than one side live here.

pub mod codec;
mod error;
pub mod modbus_client;
pub mod modbus_server;
pub mod pdu;
pub mod serial;
pub mod transport;

pub use codec::{DataType, RegisterValue, RegisterWords};
pub use error::{CodecError, ModbusError};
pub use modbus_client::{
    ClientState, ConnectState, ModbusClient, ReconnectPolicy, RegisterData, ScanUnitIdResult,
    Transaction, WriteParams, WriteValue,
};
pub use modbus_server::{ModbusServer, RegisterParams, RegisterVector};

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Shared Types
// ============================================================================

/// The four Modbus address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    Coils,
    DiscreteInputs,
    InputRegisters,
    HoldingRegisters,
}

impl RegisterType {
    /// Probe order used by the unit ID scanner.
    pub const SCAN_ORDER: [RegisterType; 4] = [
        RegisterType::Coils,
        RegisterType::DiscreteInputs,
        RegisterType::HoldingRegisters,
        RegisterType::InputRegisters,
    ];

    /// Coils and discrete inputs carry single bits rather than 16-bit words.
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterType::Coils | RegisterType::DiscreteInputs)
    }

    /// Largest quantity a single read request may ask for.
    pub fn max_read_quantity(&self) -> u16 {
        if self.is_bit() {
            2000
        } else {
            125
        }
    }

    /// Function code of the read request for this class.
    pub fn read_function_code(&self) -> u8 {
        match self {
            RegisterType::Coils => pdu::FC_READ_COILS,
            RegisterType::DiscreteInputs => pdu::FC_READ_DISCRETE_INPUTS,
            RegisterType::HoldingRegisters => pdu::FC_READ_HOLDING_REGISTERS,
            RegisterType::InputRegisters => pdu::FC_READ_INPUT_REGISTERS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RegisterType::Coils => "coils",
            RegisterType::DiscreteInputs => "discrete_inputs",
            RegisterType::InputRegisters => "input_registers",
            RegisterType::HoldingRegisters => "holding_registers",
        }
    }
}

impl std::fmt::Display for RegisterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Get current time in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Get current time in milliseconds since UNIX epoch
pub fn now_ms() -> u64 {
    now_us() / 1000
}
