// src/io/modbus_client/config.rs
//
// Caller-owned configuration for the Modbus client: how to reach the device,
// which block of registers to read, and how to interpret individual addresses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::io::codec::DataType;
use crate::io::serial::Parity;
use crate::io::RegisterType;

// ============================================================================
// Connection
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Rtu,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    502
}
fn default_tcp_timeout_ms() -> u64 {
    3000
}
fn default_com() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_true() -> bool {
    true
}
fn default_unit_id() -> u8 {
    1
}

/// Modbus TCP endpoint
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TcpParams {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection establishment timeout
    #[serde(default = "default_tcp_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for TcpParams {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_ms: default_tcp_timeout_ms(),
        }
    }
}

/// Modbus RTU serial line
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RtuParams {
    /// Device path (`/dev/ttyUSB0`, `COM3`)
    #[serde(default = "default_com")]
    pub com: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Open the device on connect; when off the first request opens it
    #[serde(default = "default_true")]
    pub auto_open: bool,
}

impl Default for RtuParams {
    fn default() -> Self {
        Self {
            com: default_com(),
            baud_rate: default_baud_rate(),
            parity: Parity::None,
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            auto_open: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub tcp: TcpParams,
    #[serde(default)]
    pub rtu: RtuParams,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            tcp: TcpParams::default(),
            rtu: RtuParams::default(),
            unit_id: default_unit_id(),
        }
    }
}

impl ConnectionConfig {
    /// Human readable endpoint for messages (`127.0.0.1:502`, `/dev/ttyUSB0@9600`).
    pub fn describe(&self) -> String {
        match self.transport {
            TransportKind::Tcp => format!("{}:{}", self.tcp.host, self.tcp.port),
            TransportKind::Rtu => format!("{}@{}", self.rtu.com, self.rtu.baud_rate),
        }
    }
}

// ============================================================================
// Register window
// ============================================================================

fn default_register_type() -> RegisterType {
    RegisterType::HoldingRegisters
}
fn default_length() -> u16 {
    10
}
fn default_poll_rate_ms() -> u64 {
    1000
}
fn default_read_timeout_ms() -> u64 {
    1000
}

/// The block of registers that reads and polling operate on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterConfig {
    #[serde(default = "default_register_type")]
    pub register_type: RegisterType,
    #[serde(default)]
    pub address: u16,
    #[serde(default = "default_length")]
    pub length: u16,
    #[serde(default = "default_poll_rate_ms")]
    pub poll_rate_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub little_endian: bool,
    /// Only read addresses that have a mapping entry
    #[serde(default)]
    pub read_configured_only: bool,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            register_type: default_register_type(),
            address: 0,
            length: default_length(),
            poll_rate_ms: default_poll_rate_ms(),
            timeout_ms: default_read_timeout_ms(),
            little_endian: false,
            read_configured_only: false,
        }
    }
}

impl RegisterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_rate(&self) -> Duration {
        Duration::from_millis(self.poll_rate_ms)
    }
}

// ============================================================================
// Mapping
// ============================================================================

/// How one address should be interpreted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub address: u16,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling_factor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Start a new read request after this entry
    #[serde(default)]
    pub group_end: bool,
}

impl MappingEntry {
    pub fn new(address: u16, data_type: DataType) -> Self {
        Self {
            address,
            data_type,
            scaling_factor: None,
            comment: None,
            group_end: false,
        }
    }
}

/// Address-keyed register mapping. Serialised as a list of entries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<MappingEntry>", into = "Vec<MappingEntry>")]
pub struct RegisterMapping(BTreeMap<u16, MappingEntry>);

impl From<Vec<MappingEntry>> for RegisterMapping {
    fn from(entries: Vec<MappingEntry>) -> Self {
        Self(entries.into_iter().map(|e| (e.address, e)).collect())
    }
}

impl From<RegisterMapping> for Vec<MappingEntry> {
    fn from(mapping: RegisterMapping) -> Self {
        mapping.0.into_values().collect()
    }
}

impl RegisterMapping {
    pub fn get(&self, address: u16) -> Option<&MappingEntry> {
        self.0.get(&address)
    }

    pub fn insert(&mut self, entry: MappingEntry) {
        self.0.insert(entry.address, entry);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Contiguous `(start, quantity)` read requests covering every mapped
    /// address inside `[address, address + length)`.
    ///
    /// Adjacent or overlapping entries share a request until one is marked
    /// `group_end` or the request would exceed `max_quantity`. Register
    /// classes count each entry's data type width; bit classes count one.
    pub fn read_groups(
        &self,
        address: u16,
        length: u16,
        register_type: RegisterType,
        max_quantity: u16,
    ) -> Vec<(u16, u16)> {
        let window_start = address as u32;
        let window_end = window_start + length as u32;
        let max = max_quantity.max(1) as u32;

        let mut groups = Vec::new();
        // (start, end exclusive, closed by group_end)
        let mut current: Option<(u32, u32, bool)> = None;

        for entry in self.0.range(address..).map(|(_, e)| e) {
            let start = entry.address as u32;
            if start >= window_end {
                break;
            }
            let width = if register_type.is_bit() {
                1
            } else {
                entry.data_type.words() as u32
            };
            let end = (start + width).min(65536);

            current = match current {
                Some((g_start, g_end, closed))
                    if !closed && start <= g_end && end.max(g_end) - g_start <= max =>
                {
                    Some((g_start, end.max(g_end), entry.group_end))
                }
                Some((g_start, g_end, _)) => {
                    groups.push((g_start as u16, (g_end - g_start) as u16));
                    Some((start, end, entry.group_end))
                }
                None => Some((start, end, entry.group_end)),
            };
        }
        if let Some((g_start, g_end, _)) = current {
            groups.push((g_start as u16, (g_end - g_start) as u16));
        }
        groups
    }
}

/// Split `[address, address + length)` into requests of at most `max_quantity`.
pub fn split_range(address: u16, length: u16, max_quantity: u16) -> Vec<(u16, u16)> {
    let end = (address as u32 + length as u32).min(65536);
    let max = max_quantity.max(1) as u32;
    let mut ranges = Vec::new();
    let mut start = address as u32;
    while start < end {
        let quantity = (end - start).min(max);
        ranges.push((start as u16, quantity as u16));
        start += quantity;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(entries: &[(u16, DataType, bool)]) -> RegisterMapping {
        entries
            .iter()
            .map(|&(address, data_type, group_end)| MappingEntry {
                group_end,
                ..MappingEntry::new(address, data_type)
            })
            .collect::<Vec<_>>()
            .into()
    }

    #[test]
    fn test_adjacent_entries_share_a_request() {
        let m = mapping(&[
            (0, DataType::Int16, false),
            (1, DataType::Float, false),
            (3, DataType::UInt16, false),
            (10, DataType::Int16, false),
        ]);
        let groups = m.read_groups(0, 20, RegisterType::HoldingRegisters, 125);
        assert_eq!(groups, vec![(0, 4), (10, 1)]);
    }

    #[test]
    fn test_group_end_splits() {
        let m = mapping(&[(0, DataType::Int16, true), (1, DataType::Int16, false)]);
        let groups = m.read_groups(0, 10, RegisterType::HoldingRegisters, 125);
        assert_eq!(groups, vec![(0, 1), (1, 1)]);
    }

    #[test]
    fn test_window_and_max_quantity() {
        let m = mapping(&[
            (5, DataType::Int16, false),
            (6, DataType::Int16, false),
            (7, DataType::Int16, false),
            (50, DataType::Int16, false),
        ]);
        assert_eq!(
            m.read_groups(6, 10, RegisterType::HoldingRegisters, 125),
            vec![(6, 2)]
        );
        assert_eq!(
            m.read_groups(0, 10, RegisterType::HoldingRegisters, 2),
            vec![(5, 2), (7, 1)]
        );
    }

    #[test]
    fn test_bit_classes_ignore_data_type_width() {
        let m = mapping(&[(0, DataType::Double, false), (1, DataType::Int16, false)]);
        assert_eq!(m.read_groups(0, 10, RegisterType::Coils, 2000), vec![(0, 2)]);
    }

    #[test]
    fn test_split_range() {
        assert_eq!(split_range(0, 300, 125), vec![(0, 125), (125, 125), (250, 50)]);
        assert_eq!(split_range(65530, 10, 125), vec![(65530, 6)]);
        assert!(split_range(10, 0, 125).is_empty());
    }

    #[test]
    fn test_mapping_serialises_as_list() {
        let m = mapping(&[(3, DataType::Int32, false)]);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json[0]["address"], 3);
        assert_eq!(json[0]["data_type"], "int32");
        let back: RegisterMapping = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }
}
