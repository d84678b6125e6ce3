// src/io/serial/utils.rs
//
// Serial line settings and their conversion to serialport/tokio-serial types.

use serde::{Deserialize, Serialize};
use serialport::{DataBits, Parity as SpParity, StopBits};
use tokio_serial::SerialStream;

use crate::io::modbus_client::RtuParams;
use crate::io::ModbusError;

// ============================================================================
// Types
// ============================================================================

/// Parity setting for the RTU line
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// Convert our Parity enum to serialport crate's Parity type
pub fn to_serialport_parity(p: Parity) -> SpParity {
    match p {
        Parity::None => SpParity::None,
        Parity::Odd => SpParity::Odd,
        Parity::Even => SpParity::Even,
    }
}

/// Convert data bits count to serialport crate's DataBits type.
/// Modbus RTU only defines 7 and 8 bit characters.
pub fn to_serialport_data_bits(bits: u8) -> Result<DataBits, ModbusError> {
    match bits {
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(ModbusError::InvalidArgument(format!(
            "unsupported data bits: {}",
            other
        ))),
    }
}

/// Convert stop bits count to serialport crate's StopBits type
pub fn to_serialport_stop_bits(bits: u8) -> Result<StopBits, ModbusError> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => Err(ModbusError::InvalidArgument(format!(
            "unsupported stop bits: {}",
            other
        ))),
    }
}

/// Open the RTU device described by `params` as an async serial stream.
pub fn open_serial_stream(params: &RtuParams) -> Result<SerialStream, ModbusError> {
    if params.com.is_empty() {
        return Err(ModbusError::InvalidArgument("no serial device configured".into()));
    }
    let builder = tokio_serial::new(&params.com, params.baud_rate)
        .parity(to_serialport_parity(params.parity))
        .data_bits(to_serialport_data_bits(params.data_bits)?)
        .stop_bits(to_serialport_stop_bits(params.stop_bits)?);

    SerialStream::open(&builder)
        .map_err(|e| ModbusError::Serial(format!("{}: {}", params.com, e)))
}

// ============================================================================
// Tests
// ============================================================================
