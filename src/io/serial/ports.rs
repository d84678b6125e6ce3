// src/io/serial/ports.rs
//
// Serial port enumeration and validation.

use serde::Serialize;

use crate::events::{emit_message, EventEmitter, MessageVariant};

/// Information about an available serial port
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// Verdict of `validate_serial_port`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PortValidation {
    pub valid: bool,
    pub message: String,
}

fn enumerate() -> Result<Vec<SerialPortInfo>, serialport::Error> {
    let ports = serialport::available_ports()?;

    Ok(ports
        .into_iter()
        // macOS lists every device twice; only the calling unit (/dev/cu.*) opens without carrier
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    "USB",
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                serialport::SerialPortType::BluetoothPort => ("Bluetooth", None, None, None, None, None),
                serialport::SerialPortType::PciPort => ("PCI", None, None, None, None, None),
                serialport::SerialPortType::Unknown => ("Unknown", None, None, None, None, None),
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type: port_type.to_string(),
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}

/// List the serial ports present on this machine.
/// Enumeration failure yields an empty list and an error notification.
pub fn list_serial_ports(emitter: &dyn EventEmitter) -> Vec<SerialPortInfo> {
    match enumerate() {
        Ok(ports) => ports,
        Err(e) => {
            emit_message(
                emitter,
                MessageVariant::Error,
                "Serial",
                format!("Failed to list serial ports: {}", e),
            );
            Vec::new()
        }
    }
}

/// Check that `path` names an enumerated port and that it can be opened.
pub fn validate_serial_port(path: &str) -> PortValidation {
    let ports = match enumerate() {
        Ok(ports) => ports,
        Err(e) => {
            return PortValidation {
                valid: false,
                message: format!("Failed to list serial ports: {}", e),
            }
        }
    };
    let known: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
    validate_against(path, &known, |name| {
        serialport::new(name, 9600)
            .open()
            .map(|_| ())
            .map_err(|e| e.to_string())
    })
}

fn validate_against(
    path: &str,
    known: &[String],
    try_open: impl FnOnce(&str) -> Result<(), String>,
) -> PortValidation {
    let Some(name) = known.iter().find(|p| p.eq_ignore_ascii_case(path)) else {
        return PortValidation {
            valid: false,
            message: format!("Serial port {} not found", path),
        };
    };

    match try_open(name) {
        Ok(()) => PortValidation {
            valid: true,
            message: format!("Serial port {} is available", name),
        },
        Err(e) => {
            tlog!("[Serial] Failed to open {}: {}", name, e);
            PortValidation {
                valid: false,
                message: format!("Serial port {} not found or not available", name),
            }
        }
    }
}
