// src/settings.rs
//
// Persistent application settings, stored as TOML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::io::modbus_client::{ConnectionConfig, RegisterConfig, RegisterMapping};
use crate::io::{ModbusError, RegisterParams};

fn default_server_port() -> u16 {
    502
}

/// Configuration of one emulated unit.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UnitSettings {
    pub unit_id: u8,
    #[serde(default)]
    pub registers: Vec<RegisterParams>,
    /// Coil addresses set on start
    #[serde(default)]
    pub coils: Vec<u16>,
    /// Discrete input addresses set on start
    #[serde(default)]
    pub discrete_inputs: Vec<u16>,
}

/// One server instance started by `serve`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub id: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default)]
    pub little_endian: bool,
    #[serde(default)]
    pub units: Vec<UnitSettings>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct AppSettings {
    /// Mirror `tlog!` output into this directory when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub registers: RegisterConfig,
    #[serde(default)]
    pub mapping: RegisterMapping,
    #[serde(default)]
    pub servers: Vec<ServerSettings>,
}

/// Load settings from `path`. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<AppSettings, ModbusError> {
    if !path.exists() {
        tlog!("[settings] {} not found, using defaults", path.display());
        return Ok(AppSettings::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ModbusError::Settings(format!("Failed to read settings: {}", e)))?;

    toml::from_str(&content)
        .map_err(|e| ModbusError::Settings(format!("Failed to parse settings: {}", e)))
}

/// Write settings to `path`, creating the parent directory if needed.
pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), ModbusError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            ModbusError::Settings(format!("Failed to create settings directory: {}", e))
        })?;
    }

    let content = toml::to_string_pretty(settings)
        .map_err(|e| ModbusError::Settings(format!("Failed to serialize settings: {}", e)))?;

    std::fs::write(path, content)
        .map_err(|e| ModbusError::Settings(format!("Failed to write settings: {}", e)))
}
