// src/io/modbus_client/scanner.rs
//
// Unit-ID sweeps and register scans.
//
// Both scans run sequentially on the shared transport, emit progress after
// every step and check their stop flag after every await. A failing probe
// is recorded and the scan moves on.

use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::reader::{build_rows, RegisterData};
use super::ModbusClient;
use crate::events::{BackendEvent, MessageVariant, ScanProgressPayload};
use crate::io::{ModbusError, RegisterType};

/// Pause between scan steps so stop requests and UI updates get a turn.
const SCAN_STEP_DELAY: Duration = Duration::from_millis(5);

// ============================================================================
// Types
// ============================================================================

fn default_scan_timeout_ms() -> u64 {
    500
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitIdScanParams {
    pub start: u8,
    pub end: u8,
    #[serde(default)]
    pub address: u16,
    #[serde(default = "default_probe_length")]
    pub length: u16,
    pub register_types: Vec<RegisterType>,
    #[serde(default = "default_scan_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_probe_length() -> u16 {
    1
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterScanParams {
    pub start: u16,
    pub end: u16,
    /// Addresses per request
    pub length: u16,
    #[serde(default = "default_scan_timeout_ms")]
    pub timeout_ms: u64,
}

/// Result of probing one register class on one unit.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub register_type: RegisterType,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-unit result of a unit-ID sweep.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScanUnitIdResult {
    pub unit_id: u8,
    pub probes: Vec<ProbeOutcome>,
}

impl ScanUnitIdResult {
    /// Whether the unit answered any probe.
    pub fn responded(&self) -> bool {
        self.probes.iter().any(|p| p.ok)
    }
}

// ============================================================================
// Scans
// ============================================================================

impl ModbusClient {
    fn check_can_scan(&self) -> Result<(), ModbusError> {
        let state = self.state();
        if state.polling {
            self.message(MessageVariant::Warning, "Cannot scan while polling");
            return Err(ModbusError::Conflict("polling is active".into()));
        }
        if state.scanning() {
            self.message(MessageVariant::Warning, "A scan is already running");
            return Err(ModbusError::Conflict("a scan is active".into()));
        }
        if !self.is_connected() {
            self.message(MessageVariant::Warning, "Not connected");
            return Err(ModbusError::NotConnected);
        }
        Ok(())
    }

    fn emit_progress(&self, progress: f64) {
        self.emit(BackendEvent::ScanProgress(ScanProgressPayload {
            progress: progress.clamp(0.0, 100.0),
        }));
    }

    /// Probe every unit id in `start..=end` with each requested class, in
    /// the fixed order coils, discrete inputs, holding, input registers.
    pub async fn scan_unit_ids(
        &self,
        params: UnitIdScanParams,
    ) -> Result<Vec<ScanUnitIdResult>, ModbusError> {
        self.check_can_scan()?;
        if params.start > params.end || params.length == 0 {
            return Err(ModbusError::InvalidArgument(format!(
                "invalid unit id scan range {}..={} with length {}",
                params.start, params.end, params.length
            )));
        }
        let classes: Vec<RegisterType> = RegisterType::SCAN_ORDER
            .into_iter()
            .filter(|rt| params.register_types.contains(rt))
            .collect();
        if classes.is_empty() {
            return Err(ModbusError::InvalidArgument(
                "no register types selected".into(),
            ));
        }

        let inner = &self.inner;
        inner.stop_unit_scan.store(false, Ordering::SeqCst);
        self.update_state(|s| s.scanning_unit_id = true);
        self.message(
            MessageVariant::Info,
            format!("Scanning unit IDs {}-{}", params.start, params.end),
        );

        let timeout = Duration::from_millis(params.timeout_ms);
        let total = (params.end as usize - params.start as usize + 1) * classes.len();
        let mut done = 0usize;
        let mut results = Vec::new();
        let mut cancelled = false;

        'units: for unit_id in params.start..=params.end {
            let mut result = ScanUnitIdResult {
                unit_id,
                probes: Vec::with_capacity(classes.len()),
            };
            for &register_type in &classes {
                let quantity = params.length.min(register_type.max_read_quantity());
                let outcome = self
                    .read_range(unit_id, register_type, params.address, quantity, timeout)
                    .await;
                result.probes.push(ProbeOutcome {
                    register_type,
                    ok: outcome.is_ok(),
                    error: outcome.err().map(|e| e.to_string()),
                });

                done += 1;
                self.emit_progress(done as f64 / total as f64 * 100.0);
                if inner.stop_unit_scan.load(Ordering::SeqCst) {
                    cancelled = true;
                    break 'units;
                }
            }

            self.emit(BackendEvent::ScanUnitIdResult(result.clone()));
            results.push(result);

            tokio::time::sleep(SCAN_STEP_DELAY).await;
            if inner.stop_unit_scan.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
        }

        // Put the configured unit back on the transport
        let unit_id = self.connection_config().unit_id;
        self.transport().lock().await.set_unit_id(unit_id);

        self.update_state(|s| s.scanning_unit_id = false);
        let found = results.iter().filter(|r| r.responded()).count();
        let summary = format!("{} of {} unit IDs responded", found, results.len());
        if cancelled {
            self.message(MessageVariant::Info, format!("Unit ID scan stopped: {}", summary));
        } else {
            self.message(MessageVariant::Success, format!("Unit ID scan finished: {}", summary));
        }
        Ok(results)
    }

    /// Request the running unit-ID scan to stop after its in-flight probe.
    pub fn stop_scanning_unit_ids(&self) {
        self.inner.stop_unit_scan.store(true, Ordering::SeqCst);
    }

    /// Read `start..=end` of the configured register class in steps of
    /// `length` and keep the non-zero registers and set bits.
    pub async fn scan_registers(
        &self,
        params: RegisterScanParams,
    ) -> Result<Vec<RegisterData>, ModbusError> {
        self.check_can_scan()?;
        if params.start > params.end || params.length == 0 {
            return Err(ModbusError::InvalidArgument(format!(
                "invalid register scan range {}..={} with length {}",
                params.start, params.end, params.length
            )));
        }

        let config = self.register_config();
        let mapping = self.mapping();
        let register_type = config.register_type;
        let unit_id = self.connection_config().unit_id;
        let timeout = Duration::from_millis(params.timeout_ms);
        let chunk = params.length.min(register_type.max_read_quantity()) as u32;

        let inner = &self.inner;
        inner.stop_register_scan.store(false, Ordering::SeqCst);
        self.update_state(|s| s.scanning_registers = true);
        self.message(
            MessageVariant::Info,
            format!(
                "Scanning {} {}-{}",
                register_type, params.start, params.end
            ),
        );

        let start = params.start as u32;
        let end = params.end as u32;
        let span = (end - start + 1) as f64;
        let mut address = start;
        let mut found = Vec::new();
        let mut cancelled = false;

        while address <= end {
            let quantity = chunk.min(end + 1 - address);
            match self
                .read_range(unit_id, register_type, address as u16, quantity as u16, timeout)
                .await
            {
                Ok(values) => {
                    let rows: Vec<RegisterData> = build_rows(
                        address as u16,
                        &values,
                        register_type,
                        config.little_endian,
                        &mapping,
                        true,
                    )
                    .into_iter()
                    .filter(RegisterData::is_interesting)
                    .collect();
                    if !rows.is_empty() {
                        self.emit(BackendEvent::RegisterData(rows.clone()));
                        found.extend(rows);
                    }
                }
                Err(e) => {
                    tlog!("[ModbusClient] Scan of {} x{} failed: {}", address, quantity, e);
                }
            }

            address += quantity;
            self.emit_progress((address - start) as f64 / span * 100.0);
            if inner.stop_register_scan.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
            tokio::time::sleep(SCAN_STEP_DELAY).await;
            if inner.stop_register_scan.load(Ordering::SeqCst) {
                cancelled = true;
                break;
            }
        }

        self.update_state(|s| s.scanning_registers = false);
        let summary = format!("{} non-zero {}", found.len(), register_type);
        if cancelled {
            self.message(MessageVariant::Info, format!("Register scan stopped: {}", summary));
        } else {
            self.message(MessageVariant::Success, format!("Register scan finished: {}", summary));
        }
        Ok(found)
    }

    /// Request the running register scan to stop after its in-flight chunk.
    pub fn stop_scanning_registers(&self) {
        self.inner.stop_register_scan.store(true, Ordering::SeqCst);
    }
}
