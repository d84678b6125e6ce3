// src/io/modbus_client/reader.rs
//
// Reads, polling and transaction logging.
//
// A read covers a window of one register class. The window is either split
// into protocol-sized requests or, when only configured addresses are read,
// grouped into contiguous runs of mapped registers. Each request is logged
// as a transaction; the decoded rows are emitted as `register-data`.

use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use super::config::{split_range, RegisterMapping};
use super::{lock, ConnectState, ModbusClient};
use crate::events::{BackendEvent, MessageVariant};
use crate::io::codec::{self, registers_to_bytes, DataType, RegisterWords, TypedValue};
use crate::io::pdu::WireCapture;
use crate::io::{now_us, ModbusError, RegisterType};

// ============================================================================
// Types
// ============================================================================

/// One decoded address from a read or scan.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RegisterData {
    pub address: u16,
    pub register_type: RegisterType,
    /// Raw bytes of this address (2 for registers, 1 for bits)
    pub buffer: Vec<u8>,
    pub hex: String,
    /// Every interpretation starting at this register
    #[serde(skip_serializing_if = "Option::is_none")]
    pub words: Option<RegisterWords>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bit: Option<bool>,
    /// Mapped data type, if the address has a mapping entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<TypedValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaled_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub is_scan: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RegisterData {
    fn error_row(address: u16, register_type: RegisterType, error: &ModbusError) -> Self {
        Self {
            address,
            register_type,
            buffer: Vec::new(),
            hex: String::new(),
            words: None,
            bit: None,
            data_type: None,
            value: None,
            scaled_value: None,
            comment: None,
            is_scan: false,
            error: Some(error.to_string()),
        }
    }

    /// A set bit, or a register with any non-zero byte.
    pub fn is_interesting(&self) -> bool {
        match self.bit {
            Some(bit) => bit,
            None => self.buffer.iter().any(|b| *b != 0),
        }
    }
}

/// Log record of one request/response exchange.
#[derive(Clone, Debug, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub timestamp_us: u64,
    pub unit_id: u8,
    pub function_code: u8,
    pub address: u16,
    pub quantity: u16,
    /// Request PDU as hex, unit id first
    pub request: String,
    /// Response PDUs as hex
    pub responses: Vec<String>,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Raw result of one read request.
pub(crate) enum RangeValues {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

/// Turn one request's values into rows, applying the mapping.
pub(crate) fn build_rows(
    start: u16,
    values: &RangeValues,
    register_type: RegisterType,
    little_endian: bool,
    mapping: &RegisterMapping,
    is_scan: bool,
) -> Vec<RegisterData> {
    let blank = |address: u16| RegisterData {
        address,
        register_type,
        buffer: Vec::new(),
        hex: String::new(),
        words: None,
        bit: None,
        data_type: None,
        value: None,
        scaled_value: None,
        comment: None,
        is_scan,
        error: None,
    };

    let mut rows: Vec<RegisterData> = match values {
        RangeValues::Bits(bits) => bits
            .iter()
            .enumerate()
            .map(|(i, &bit)| {
                let buffer = vec![bit as u8];
                RegisterData {
                    hex: hex::encode(&buffer),
                    buffer,
                    bit: Some(bit),
                    ..blank(start.wrapping_add(i as u16))
                }
            })
            .collect(),
        RangeValues::Words(registers) => {
            let bytes = registers_to_bytes(registers);
            codec::decode(&bytes, little_endian)
                .into_iter()
                .zip(bytes.chunks(2))
                .enumerate()
                .map(|(i, (words, chunk))| RegisterData {
                    buffer: chunk.to_vec(),
                    hex: hex::encode(chunk),
                    words: Some(words),
                    ..blank(start.wrapping_add(i as u16))
                })
                .collect()
        }
    };

    for row in rows.iter_mut() {
        let Some(entry) = mapping.get(row.address) else {
            continue;
        };
        row.data_type = Some(entry.data_type);
        row.comment = entry.comment.clone();
        if let Some(words) = &row.words {
            row.value = words.select(entry.data_type);
            row.scaled_value = match (entry.scaling_factor, row.value.as_ref()) {
                (Some(factor), Some(value)) => value.as_f64().map(|v| v * factor),
                _ => None,
            };
        }
    }
    rows
}

#[derive(Clone, Copy, PartialEq)]
enum ReadMode {
    Manual,
    Poll,
}

// ============================================================================
// Reads
// ============================================================================

impl ModbusClient {
    /// Issue one read request on the shared transport and log it.
    pub(crate) async fn read_range(
        &self,
        unit_id: u8,
        register_type: RegisterType,
        address: u16,
        quantity: u16,
        timeout: Duration,
    ) -> Result<RangeValues, ModbusError> {
        let transport = self.transport();
        let (result, capture) = {
            let mut t = transport.lock().await;
            t.set_unit_id(unit_id);
            t.set_timeout(timeout);
            let result = match register_type {
                RegisterType::Coils => t.read_coils(address, quantity).await.map(RangeValues::Bits),
                RegisterType::DiscreteInputs => t
                    .read_discrete_inputs(address, quantity)
                    .await
                    .map(RangeValues::Bits),
                RegisterType::HoldingRegisters => t
                    .read_holding_registers(address, quantity)
                    .await
                    .map(RangeValues::Words),
                RegisterType::InputRegisters => t
                    .read_input_registers(address, quantity)
                    .await
                    .map(RangeValues::Words),
            };
            (result, t.take_capture())
        };

        self.log_transaction(
            unit_id,
            register_type.read_function_code(),
            address,
            quantity,
            result.as_ref().err(),
            capture,
        );
        if let Err(e) = &result {
            self.handle_transport_error(e);
        }
        result
    }

    /// Emit a transaction record for the exchange just performed.
    pub(crate) fn log_transaction(
        &self,
        unit_id: u8,
        function_code: u8,
        address: u16,
        quantity: u16,
        error: Option<&ModbusError>,
        capture: Option<WireCapture>,
    ) {
        let capture = capture.unwrap_or_default();
        let transaction = Transaction {
            id: Uuid::new_v4(),
            timestamp_us: now_us(),
            unit_id,
            function_code,
            address,
            quantity,
            request: hex::encode(&capture.request),
            responses: capture.responses.iter().map(hex::encode).collect(),
            timed_out: error.is_some_and(|e| e.is_timeout()),
            error: error.map(|e| e.to_string()),
        };
        if let Some(e) = &transaction.error {
            tlog!(
                "[ModbusClient] Unit {} FC{} @{} x{} failed: {}",
                unit_id,
                function_code,
                address,
                quantity,
                e
            );
        }
        self.emit(BackendEvent::Transaction(transaction));
    }

    /// Read `length` addresses of `register_type` starting at `address`.
    /// Rejected while polling.
    pub async fn read(
        &self,
        address: u16,
        length: u16,
        register_type: RegisterType,
    ) -> Result<Vec<RegisterData>, ModbusError> {
        if self.state().polling {
            self.message(MessageVariant::Warning, "Cannot read while polling");
            return Err(ModbusError::Conflict("polling is active".into()));
        }
        self.read_window(address, length, register_type, ReadMode::Manual)
            .await
    }

    /// Read the window described by the register config.
    pub async fn read_configured(&self) -> Result<Vec<RegisterData>, ModbusError> {
        let config = self.register_config();
        self.read(config.address, config.length, config.register_type)
            .await
    }

    async fn read_window(
        &self,
        address: u16,
        length: u16,
        register_type: RegisterType,
        mode: ReadMode,
    ) -> Result<Vec<RegisterData>, ModbusError> {
        if !self.is_connected() {
            // Connecting is kept so a pending reconnect is not clobbered
            if self.state().connect_state != ConnectState::Connecting {
                self.set_connect_state(ConnectState::Disconnected);
            }
            if mode == ReadMode::Manual {
                self.message(MessageVariant::Warning, "Not connected");
            }
            return Err(ModbusError::NotConnected);
        }

        let config = self.register_config();
        let mapping = self.mapping();
        let unit_id = self.connection_config().unit_id;
        let max = register_type.max_read_quantity();
        let grouped = config.read_configured_only;

        let ranges = if grouped {
            mapping.read_groups(address, length, register_type, max)
        } else {
            split_range(address, length, max)
        };
        if ranges.is_empty() {
            if mode == ReadMode::Manual {
                self.message(MessageVariant::Warning, "No registers to read in this range");
            }
            return Ok(Vec::new());
        }

        let mut rows = Vec::new();
        let mut first_error: Option<ModbusError> = None;
        for (i, &(start, quantity)) in ranges.iter().enumerate() {
            match self
                .read_range(unit_id, register_type, start, quantity, config.timeout())
                .await
            {
                Ok(values) => rows.extend(build_rows(
                    start,
                    &values,
                    register_type,
                    config.little_endian,
                    &mapping,
                    false,
                )),
                Err(e) => {
                    let lost = e.is_connection_lost();
                    // A lost link fails every range not yet read as well
                    let failed = if lost { &ranges[i..] } else { &ranges[i..=i] };
                    if grouped {
                        for &(start, quantity) in failed {
                            rows.extend((0..quantity).map(|offset| {
                                RegisterData::error_row(start + offset, register_type, &e)
                            }));
                        }
                    }
                    first_error.get_or_insert(e);
                    if lost {
                        break;
                    }
                }
            }
        }

        if !rows.is_empty() {
            self.emit(BackendEvent::RegisterData(rows.clone()));
        }
        match first_error {
            Some(e) => {
                self.message(MessageVariant::Error, format!("Read failed: {}", e));
                if grouped {
                    Ok(rows)
                } else {
                    Err(e)
                }
            }
            None => Ok(rows),
        }
    }

    // ========================================================================
    // Polling
    // ========================================================================

    /// Start the poll loop: read the configured window, wait the poll rate,
    /// repeat. The next read is only scheduled after the previous one finished.
    pub async fn start_polling(&self) -> Result<(), ModbusError> {
        let state = self.state();
        if state.polling {
            self.message(MessageVariant::Warning, "Polling is already active");
            return Ok(());
        }
        if state.scanning() {
            self.message(MessageVariant::Warning, "Cannot poll while scanning");
            return Err(ModbusError::Conflict("a scan is active".into()));
        }
        if !self.is_connected() {
            self.message(MessageVariant::Warning, "Not connected");
            return Err(ModbusError::NotConnected);
        }

        // A previous loop may still be finishing its in-flight read
        let previous = lock(&self.inner.poll_task).take();
        if let Some(handle) = previous {
            let _ = handle.await;
        }

        self.update_state(|s| s.polling = true);
        let config = self.register_config();
        self.message(
            MessageVariant::Info,
            format!("Polling every {}ms", config.poll_rate_ms),
        );

        let client = self.clone();
        let handle = tokio::spawn(async move { client.poll_loop().await });
        *lock(&self.inner.poll_task) = Some(handle);
        Ok(())
    }

    /// Stop the poll loop. An in-flight read completes but nothing new is scheduled.
    pub fn stop_polling(&self) {
        if !self.state().polling {
            return;
        }
        self.update_state(|s| s.polling = false);
        self.inner.poll_wake.notify_waiters();
        self.message(MessageVariant::Info, "Polling stopped");
    }

    async fn poll_loop(&self) {
        let mut reads = 0u64;
        loop {
            if !self.state().polling {
                break;
            }
            let config = self.register_config();
            match self.state().connect_state {
                ConnectState::Connected => {
                    let result = self
                        .read_window(config.address, config.length, config.register_type, ReadMode::Poll)
                        .await;
                    reads += 1;
                    if reads == 1 {
                        if let Ok(rows) = &result {
                            tlog!("[ModbusClient] First poll OK: {} rows", rows.len());
                        }
                    }
                }
                // Reconnect in progress; keep the loop alive
                ConnectState::Connecting => {}
                ConnectState::Disconnected | ConnectState::Disconnecting => {
                    self.update_state(|s| s.polling = false);
                    self.message(MessageVariant::Warning, "Polling stopped: not connected");
                    break;
                }
            }

            if !self.state().polling {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(config.poll_rate()) => {}
                _ = self.inner.poll_wake.notified() => {}
            }
        }
        tlog!("[ModbusClient] Poll loop exited after {} reads", reads);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::super::mock::{mock_factory, MockDevice, MockFault};
    use super::super::{MappingEntry, ReconnectPolicy, RegisterConfig};
    use super::*;
    use crate::events::{ChannelEmitter, EventEmitter, NullEmitter};
    use std::sync::Arc;

    fn connected_client(device: &Arc<std::sync::Mutex<MockDevice>>) -> ModbusClient {
        ModbusClient::with_transport(
            Arc::new(NullEmitter),
            mock_factory(device.clone()),
            ReconnectPolicy::default(),
        )
    }

    #[test]
    fn test_build_rows_applies_mapping() {
        let mut mapping = RegisterMapping::default();
        mapping.insert(MappingEntry {
            scaling_factor: Some(0.1),
            comment: Some("temperature".into()),
            ..MappingEntry::new(0, DataType::Int32)
        });
        let rows = build_rows(
            0,
            &RangeValues::Words(vec![1, 4464]),
            RegisterType::HoldingRegisters,
            false,
            &mapping,
            false,
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].hex, "0001");
        assert_eq!(rows[0].value, Some(TypedValue::Int32(70000)));
        assert_eq!(rows[0].scaled_value, Some(7000.0));
        assert_eq!(rows[0].comment.as_deref(), Some("temperature"));
        assert_eq!(rows[1].address, 1);
        assert!(rows[1].data_type.is_none());
    }

    #[test]
    fn test_interesting_rows() {
        let rows = build_rows(
            10,
            &RangeValues::Bits(vec![false, true]),
            RegisterType::Coils,
            false,
            &RegisterMapping::default(),
            true,
        );
        assert!(!rows[0].is_interesting());
        assert!(rows[1].is_interesting());
        assert_eq!(rows[1].address, 11);
        assert!(rows[1].is_scan);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_not_connected() {
        let device = MockDevice::shared();
        let client = connected_client(&device);
        let err = client
            .read(0, 10, RegisterType::HoldingRegisters)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::NotConnected));
        assert!(lock(&device).requests.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_splits_large_windows() {
        let device = MockDevice::shared();
        lock(&device).holding.insert(130, 7);
        let client = connected_client(&device);
        client.connect().await.unwrap();

        let rows = client
            .read(0, 300, RegisterType::HoldingRegisters)
            .await
            .unwrap();
        assert_eq!(rows.len(), 300);
        assert_eq!(rows[130].buffer, vec![0, 7]);
        let requests: Vec<_> = lock(&device).requests.iter().map(|r| (r.2, r.3)).collect();
        assert_eq!(requests, vec![(0, 125), (125, 125), (250, 50)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_configured_only_groups_requests() {
        let device = MockDevice::shared();
        let client = connected_client(&device);
        client.set_register_config(RegisterConfig {
            read_configured_only: true,
            ..RegisterConfig::default()
        });
        client.set_mapping(
            vec![
                MappingEntry::new(0, DataType::Int16),
                MappingEntry::new(1, DataType::Float),
                MappingEntry::new(20, DataType::UInt16),
            ]
            .into(),
        );
        client.connect().await.unwrap();

        let rows = client
            .read(0, 50, RegisterType::HoldingRegisters)
            .await
            .unwrap();
        let requests: Vec<_> = lock(&device).requests.iter().map(|r| (r.2, r.3)).collect();
        assert_eq!(requests, vec![(0, 3), (20, 1)]);
        assert_eq!(rows.len(), 4);
    }

    fn grouped_client(device: &Arc<std::sync::Mutex<MockDevice>>) -> ModbusClient {
        let client = connected_client(device);
        client.set_register_config(RegisterConfig {
            read_configured_only: true,
            ..RegisterConfig::default()
        });
        client.set_mapping(
            vec![
                MappingEntry::new(0, DataType::Int16),
                MappingEntry::new(1, DataType::Int16),
                MappingEntry::new(20, DataType::UInt16),
                MappingEntry::new(40, DataType::UInt16),
            ]
            .into(),
        );
        client
    }

    #[tokio::test(start_paused = true)]
    async fn test_grouped_read_failed_range_becomes_error_rows() {
        let device = MockDevice::shared();
        lock(&device).faults.insert(20, MockFault::Exception);
        lock(&device).holding.insert(40, 9);
        let client = grouped_client(&device);
        client.connect().await.unwrap();

        let rows = client
            .read(0, 50, RegisterType::HoldingRegisters)
            .await
            .unwrap();
        let requests: Vec<_> = lock(&device).requests.iter().map(|r| (r.2, r.3)).collect();
        assert_eq!(requests, vec![(0, 2), (20, 1), (40, 1)]);

        let addresses: Vec<u16> = rows.iter().map(|r| r.address).collect();
        assert_eq!(addresses, vec![0, 1, 20, 40]);
        assert!(rows[0].error.is_none() && rows[1].error.is_none());
        assert!(rows[2].error.is_some());
        assert!(rows[3].error.is_none());
        assert_eq!(rows[3].buffer, vec![0, 9]);
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_grouped_read_lost_link_marks_remaining_ranges() {
        let device = MockDevice::shared();
        lock(&device).faults.insert(20, MockFault::LinkDown);
        let client = grouped_client(&device);
        client.connect().await.unwrap();

        let rows = client
            .read(0, 50, RegisterType::HoldingRegisters)
            .await
            .unwrap();
        // Nothing is sent after the link dropped
        let requests: Vec<_> = lock(&device).requests.iter().map(|r| (r.2, r.3)).collect();
        assert_eq!(requests, vec![(0, 2), (20, 1)]);

        let failed: Vec<u16> = rows
            .iter()
            .filter(|r| r.error.is_some())
            .map(|r| r.address)
            .collect();
        assert_eq!(failed, vec![20, 40]);
        assert_eq!(rows.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_emits_rows_and_transaction() {
        let device = MockDevice::shared();
        lock(&device).input.insert(2, 0x1234);
        let (emitter, mut rx) = ChannelEmitter::new();
        let client = ModbusClient::with_transport(
            emitter as Arc<dyn EventEmitter>,
            mock_factory(device.clone()),
            ReconnectPolicy::default(),
        );
        client.connect().await.unwrap();
        client.read(2, 1, RegisterType::InputRegisters).await.unwrap();

        let mut saw_rows = false;
        let mut saw_transaction = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                BackendEvent::RegisterData(rows) => {
                    saw_rows = true;
                    assert_eq!(rows[0].hex, "1234");
                }
                BackendEvent::Transaction(t) => {
                    saw_transaction = true;
                    assert_eq!(t.function_code, 4);
                    assert_eq!(t.request, "010400020001");
                    assert!(t.error.is_none());
                }
                _ => {}
            }
        }
        assert!(saw_rows && saw_transaction);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_rejected_while_polling() {
        let device = MockDevice::shared();
        let client = connected_client(&device);
        client.connect().await.unwrap();
        client.start_polling().await.unwrap();

        let err = client
            .read(0, 1, RegisterType::HoldingRegisters)
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Conflict(_)));
        client.stop_polling();
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_never_overlaps_reads() {
        let device = MockDevice::shared();
        // Every read outlasts the poll interval
        lock(&device).read_delay = Duration::from_millis(250);
        let client = connected_client(&device);
        client.set_register_config(RegisterConfig {
            poll_rate_ms: 100,
            timeout_ms: 1000,
            ..RegisterConfig::default()
        });
        client.connect().await.unwrap();
        client.start_polling().await.unwrap();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        client.stop_polling();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let device = lock(&device);
        assert_eq!(device.max_in_flight, 1);
        // 250ms read + 100ms gap per cycle
        assert!(device.requests.len() >= 2 && device.requests.len() <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_polling_prevents_next_read() {
        let device = MockDevice::shared();
        let client = connected_client(&device);
        client.set_register_config(RegisterConfig {
            poll_rate_ms: 1000,
            ..RegisterConfig::default()
        });
        client.connect().await.unwrap();
        client.start_polling().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lock(&device).requests.len(), 1);

        client.stop_polling();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(lock(&device).requests.len(), 1);
        assert!(!client.state().polling);
    }
}
