// src/io/serial/mod.rs
//
// Serial line helpers for the Modbus RTU transport: line settings and
// conversion to the serialport types, plus port enumeration and validation.

mod ports;
mod utils;

pub use ports::{list_serial_ports, validate_serial_port, PortValidation, SerialPortInfo};
pub use utils::{
    open_serial_stream, to_serialport_data_bits, to_serialport_parity, to_serialport_stop_bits,
    Parity,
};
