// src/io/modbus_server/mod.rs
//
// Modbus server (slave emulator).
//
// A `ModbusServer` is a registry of independent server instances keyed by
// an opaque id. Each instance owns one TCP listener, the register arrays of
// every unit it serves, and the value generators writing into them. Remote
// requests are answered through a `RegisterVector` shared with the listener.

mod data;
mod generator;
mod service;

pub use data::{Notifier, ServerData, UnitData, ADDRESS_SPACE};
pub use generator::{random_value, GeneratorSource, GeneratorSpec, ValueGenerator};
pub use service::{ModbusService, RegisterVector};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};

use crate::events::{emit_message, MessageVariant, SharedEmitter};
use crate::io::codec::{self, check_address_range, DataType, RegisterValue};
use crate::io::{ModbusError, RegisterType};

/// Port tried first when none is given.
pub const DEFAULT_PORT: u16 = 502;
/// Consecutive ports tried before giving up.
pub const MAX_BIND_ATTEMPTS: u16 = 100;

// ============================================================================
// Configuration Types
// ============================================================================

fn default_interval_ms() -> u64 {
    1000
}

/// Where a configured register gets its value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueSource {
    /// Written once
    Fixed { value: RegisterValue },
    /// Random value in `[min, max]` every `interval_ms`
    Range {
        min: f64,
        max: f64,
        #[serde(default = "default_interval_ms")]
        interval_ms: u64,
    },
    /// UTF-8 text packed into `length` registers
    Text {
        text: String,
        length: u16,
        #[serde(default)]
        interval_ms: u64,
    },
}

/// One configured server register.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisterParams {
    pub address: u16,
    pub register_type: RegisterType,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(flatten)]
    pub source: ValueSource,
}

/// One configured coil or discrete input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoolParams {
    pub address: u16,
    pub register_type: RegisterType,
    pub value: bool,
}

/// Generators are unique per unit, class and start address.
type GeneratorKey = (u8, RegisterType, u16);

struct ServerInstance {
    port: Option<u16>,
    listener: Option<JoinHandle<()>>,
    data: ServerData,
    notifier: Notifier,
    generators: HashMap<GeneratorKey, ValueGenerator>,
}

impl ServerInstance {
    fn vector(&self) -> RegisterVector {
        RegisterVector::new(self.data.clone(), self.notifier.clone())
    }

    /// Dispose every generator matching `filter`.
    fn dispose_generators(&mut self, filter: impl Fn(&GeneratorKey) -> bool) -> usize {
        let keys: Vec<GeneratorKey> = self.generators.keys().filter(|k| filter(k)).copied().collect();
        for key in &keys {
            if let Some(generator) = self.generators.remove(key) {
                generator.dispose();
            }
        }
        keys.len()
    }
}

// ============================================================================
// Server Registry
// ============================================================================

struct ServerInner {
    emitter: SharedEmitter,
    instances: tokio::sync::Mutex<HashMap<String, ServerInstance>>,
}

/// Registry of server instances. Clones share the registry.
#[derive(Clone)]
pub struct ModbusServer {
    inner: Arc<ServerInner>,
}

impl ModbusServer {
    pub fn new(emitter: SharedEmitter) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                emitter,
                instances: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    fn message(&self, variant: MessageVariant, message: impl Into<String>) {
        emit_message(self.inner.emitter.as_ref(), variant, "ModbusServer", message);
    }

    fn not_found(&self, id: &str) -> ModbusError {
        self.message(MessageVariant::Error, format!("No server found with id {}", id));
        ModbusError::ServerNotFound(id.to_string())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start (or restart) the listener of instance `id`, binding the first
    /// free port at or after `port` (502 by default). Returns the bound port.
    pub async fn create_server(&self, id: &str, port: Option<u16>) -> Result<u16, ModbusError> {
        let mut instances = self.inner.instances.lock().await;
        let instance = instances.entry(id.to_string()).or_insert_with(|| ServerInstance {
            port: None,
            listener: None,
            data: ServerData::default(),
            notifier: Notifier::new(id, self.inner.emitter.clone()),
            generators: HashMap::new(),
        });
        self.start_listener(id, instance, port.unwrap_or(DEFAULT_PORT))
            .await
    }

    async fn start_listener(
        &self,
        id: &str,
        instance: &mut ServerInstance,
        start_port: u16,
    ) -> Result<u16, ModbusError> {
        self.close_listener(id, instance).await;

        let (listener, port) = bind_with_fallback(start_port).await.map_err(|e| {
            self.message(MessageVariant::Error, format!("Server {}: {}", id, e));
            e
        })?;
        instance.port = Some(port);
        instance.listener = Some(spawn_listener(id, listener, instance.vector()));
        self.message(
            MessageVariant::Success,
            format!("Server {} listening on port {}", id, port),
        );
        Ok(port)
    }

    async fn close_listener(&self, id: &str, instance: &mut ServerInstance) {
        let Some(handle) = instance.listener.take() else {
            return;
        };
        handle.abort();
        match handle.await {
            Err(e) if e.is_panic() => self.message(
                MessageVariant::Error,
                format!("Server {} listener failed while closing: {}", id, e),
            ),
            _ => tlog!("[ModbusServer] {} listener closed", id),
        }
    }

    /// Close and forget instance `id`.
    pub async fn delete_server(&self, id: &str) -> Result<(), ModbusError> {
        let mut instances = self.inner.instances.lock().await;
        let Some(mut instance) = instances.remove(id) else {
            return Err(self.not_found(id));
        };
        self.close_listener(id, &mut instance).await;
        // Dropping stops the timers; the arrays go away with the instance
        instance.generators.clear();
        self.message(MessageVariant::Info, format!("Server {} deleted", id));
        Ok(())
    }

    /// Dispose every generator and rebind the previously bound port.
    /// No-op for an instance that never bound a port.
    pub async fn reset_server(&self, id: &str) -> Result<(), ModbusError> {
        let mut instances = self.inner.instances.lock().await;
        let Some(instance) = instances.get_mut(id) else {
            return Err(self.not_found(id));
        };
        let Some(port) = instance.port else {
            return Ok(());
        };
        let disposed = instance.dispose_generators(|_| true);
        tlog!("[ModbusServer] {} reset, {} generators disposed", id, disposed);
        self.start_listener(id, instance, port).await.map(|_| ())
    }

    /// Move instance `id` to a new port.
    pub async fn set_port(&self, id: &str, port: u16) -> Result<u16, ModbusError> {
        let mut instances = self.inner.instances.lock().await;
        let Some(instance) = instances.get_mut(id) else {
            return Err(self.not_found(id));
        };
        self.start_listener(id, instance, port).await
    }

    /// Port the instance is listening on.
    pub async fn port(&self, id: &str) -> Option<u16> {
        self.inner.instances.lock().await.get(id).and_then(|i| i.port)
    }

    pub async fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.instances.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Request vector of instance `id`.
    pub async fn vector(&self, id: &str) -> Option<RegisterVector> {
        self.inner.instances.lock().await.get(id).map(|i| i.vector())
    }

    /// Delete every instance.
    pub async fn shutdown(&self) {
        for id in self.server_ids().await {
            let _ = self.delete_server(&id).await;
        }
    }

    // ------------------------------------------------------------------------
    // Numeric registers
    // ------------------------------------------------------------------------

    /// Configure one register: a fixed value is written once, a range or a
    /// text starts a value generator (replacing any at that address).
    pub async fn add_register(
        &self,
        id: &str,
        unit_id: u8,
        params: RegisterParams,
        little_endian: bool,
    ) -> Result<(), ModbusError> {
        let mut instances = self.inner.instances.lock().await;
        let Some(instance) = instances.get_mut(id) else {
            return Err(self.not_found(id));
        };
        add_register_to(instance, unit_id, params, little_endian)
    }

    /// Dispose the generator at `address` and zero the data type's words.
    pub async fn remove_register(
        &self,
        id: &str,
        unit_id: u8,
        register_type: RegisterType,
        address: u16,
        data_type: DataType,
    ) -> Result<(), ModbusError> {
        if register_type.is_bit() {
            return Err(ModbusError::InvalidArgument(format!(
                "{} are not numeric registers",
                register_type
            )));
        }
        let mut instances = self.inner.instances.lock().await;
        let Some(instance) = instances.get_mut(id) else {
            return Err(self.not_found(id));
        };
        if let Some(generator) = instance.generators.remove(&(unit_id, register_type, address)) {
            generator.dispose();
        }

        let words = codec::words_for(data_type);
        check_address_range(address, words)?;
        let zeros = vec![0u16; words as usize];
        let notifier = instance.notifier.clone();
        instance.data.with_unit(unit_id, |unit| {
            data::store_words(unit, &notifier, unit_id, register_type, address, &zeros)
        });
        Ok(())
    }

    /// Replace the unit's register configuration with `registers`.
    pub async fn sync_registers(
        &self,
        id: &str,
        unit_id: u8,
        registers: Vec<RegisterParams>,
        little_endian: bool,
    ) -> Result<(), ModbusError> {
        let mut instances = self.inner.instances.lock().await;
        let Some(instance) = instances.get_mut(id) else {
            return Err(self.not_found(id));
        };
        let disposed = instance.dispose_generators(|key| key.0 == unit_id);
        tlog!(
            "[ModbusServer] {} unit {}: {} generators disposed, adding {} registers",
            id,
            unit_id,
            disposed,
            registers.len()
        );

        let mut first_error = None;
        for params in registers {
            let address = params.address;
            if let Err(e) = add_register_to(instance, unit_id, params, little_endian) {
                self.message(
                    MessageVariant::Error,
                    format!("Server {} unit {} register {}: {}", id, unit_id, address, e),
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Dispose the unit's generators and zero both register arrays.
    pub async fn reset_registers(&self, id: &str, unit_id: u8) -> Result<(), ModbusError> {
        let mut instances = self.inner.instances.lock().await;
        let Some(instance) = instances.get_mut(id) else {
            return Err(self.not_found(id));
        };
        instance.dispose_generators(|key| key.0 == unit_id);
        let notifier = instance.notifier.clone();
        instance.data.with_unit(unit_id, |unit| {
            for register_type in [RegisterType::HoldingRegisters, RegisterType::InputRegisters] {
                if let Some(words) = unit.words_mut(register_type) {
                    for (address, raw) in words.iter_mut().enumerate() {
                        if *raw != 0 {
                            *raw = 0;
                            notifier.word(unit_id, register_type, address as u16, 0);
                        }
                    }
                }
            }
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Booleans
    // ------------------------------------------------------------------------

    pub async fn set_bool(
        &self,
        id: &str,
        unit_id: u8,
        register_type: RegisterType,
        address: u16,
        value: bool,
    ) -> Result<(), ModbusError> {
        let mut instances = self.inner.instances.lock().await;
        let Some(instance) = instances.get_mut(id) else {
            return Err(self.not_found(id));
        };
        set_bool_in(instance, unit_id, register_type, address, value)
    }

    /// Clear every coil and discrete input of the unit.
    pub async fn reset_bools(&self, id: &str, unit_id: u8) -> Result<(), ModbusError> {
        let mut instances = self.inner.instances.lock().await;
        let Some(instance) = instances.get_mut(id) else {
            return Err(self.not_found(id));
        };
        reset_bools_in(instance, unit_id);
        Ok(())
    }

    /// Replace the unit's boolean configuration with `bools`.
    pub async fn sync_bools(
        &self,
        id: &str,
        unit_id: u8,
        bools: Vec<BoolParams>,
    ) -> Result<(), ModbusError> {
        let mut instances = self.inner.instances.lock().await;
        let Some(instance) = instances.get_mut(id) else {
            return Err(self.not_found(id));
        };
        reset_bools_in(instance, unit_id);
        for b in bools {
            set_bool_in(instance, unit_id, b.register_type, b.address, b.value)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    /// Copy of `length` words of a unit, `None` if the instance or unit does not exist.
    pub async fn registers(
        &self,
        id: &str,
        unit_id: u8,
        register_type: RegisterType,
        address: u16,
        length: u16,
    ) -> Option<Vec<u16>> {
        let instances = self.inner.instances.lock().await;
        let start = address as usize;
        let end = (start + length as usize).min(ADDRESS_SPACE);
        instances.get(id)?.data.with_existing(unit_id, |unit| {
            unit.words(register_type).map(|w| w[start..end].to_vec())
        })?
    }

    pub async fn holding_registers(&self, id: &str, unit_id: u8, address: u16, length: u16) -> Option<Vec<u16>> {
        self.registers(id, unit_id, RegisterType::HoldingRegisters, address, length)
            .await
    }

    pub async fn input_registers(&self, id: &str, unit_id: u8, address: u16, length: u16) -> Option<Vec<u16>> {
        self.registers(id, unit_id, RegisterType::InputRegisters, address, length)
            .await
    }

    /// Copy of `length` bits of a unit.
    pub async fn bools(
        &self,
        id: &str,
        unit_id: u8,
        register_type: RegisterType,
        address: u16,
        length: u16,
    ) -> Option<Vec<bool>> {
        let instances = self.inner.instances.lock().await;
        let start = address as usize;
        let end = (start + length as usize).min(ADDRESS_SPACE);
        instances.get(id)?.data.with_existing(unit_id, |unit| {
            unit.bits(register_type).map(|b| b[start..end].to_vec())
        })?
    }

    /// Number of live generators of instance `id`.
    pub async fn generator_count(&self, id: &str) -> usize {
        self.inner
            .instances
            .lock()
            .await
            .get(id)
            .map_or(0, |i| i.generators.len())
    }
}

// ============================================================================
// Instance helpers
// ============================================================================

fn add_register_to(
    instance: &mut ServerInstance,
    unit_id: u8,
    params: RegisterParams,
    little_endian: bool,
) -> Result<(), ModbusError> {
    if params.register_type.is_bit() {
        return Err(ModbusError::InvalidArgument(format!(
            "{} take boolean values",
            params.register_type
        )));
    }
    let key = (unit_id, params.register_type, params.address);
    // One generator per address, whatever replaces it
    if let Some(previous) = instance.generators.remove(&key) {
        tlog!(
            "[ModbusServer] Replacing generator at unit {} {} @{}",
            unit_id,
            params.register_type,
            params.address
        );
        previous.dispose();
    }

    let (source, interval_ms) = match params.source {
        ValueSource::Fixed { value } => {
            let words = codec::encode(params.data_type, &value, little_endian)?;
            check_address_range(params.address, words.len() as u16)?;
            let notifier = instance.notifier.clone();
            instance.data.with_unit(unit_id, |unit| {
                data::store_words(
                    unit,
                    &notifier,
                    unit_id,
                    params.register_type,
                    params.address,
                    &words,
                )
            });
            return Ok(());
        }
        ValueSource::Range {
            min,
            max,
            interval_ms,
        } => (GeneratorSource::Random { min, max }, interval_ms),
        ValueSource::Text {
            text,
            length,
            interval_ms,
        } => (GeneratorSource::Text { text, length }, interval_ms),
    };

    let spec = GeneratorSpec {
        unit_id,
        register_type: params.register_type,
        address: params.address,
        data_type: params.data_type,
        little_endian,
        source,
        interval: Duration::from_millis(interval_ms),
    };
    let generator = ValueGenerator::start(spec, instance.data.clone(), instance.notifier.clone())?;
    instance.generators.insert(key, generator);
    Ok(())
}

fn set_bool_in(
    instance: &mut ServerInstance,
    unit_id: u8,
    register_type: RegisterType,
    address: u16,
    value: bool,
) -> Result<(), ModbusError> {
    let notifier = instance.notifier.clone();
    instance.data.with_unit(unit_id, |unit| {
        let Some(bits) = unit.bits_mut(register_type) else {
            return Err(ModbusError::InvalidArgument(format!(
                "{} are not boolean",
                register_type
            )));
        };
        bits[address as usize] = value;
        notifier.bit(unit_id, register_type, address, value);
        Ok(())
    })
}

fn reset_bools_in(instance: &mut ServerInstance, unit_id: u8) {
    let notifier = instance.notifier.clone();
    instance.data.with_unit(unit_id, |unit| {
        for register_type in [RegisterType::Coils, RegisterType::DiscreteInputs] {
            if let Some(bits) = unit.bits_mut(register_type) {
                for (address, bit) in bits.iter_mut().enumerate() {
                    if *bit {
                        *bit = false;
                        notifier.bit(unit_id, register_type, address as u16, false);
                    }
                }
            }
        }
    });
}

// ============================================================================
// Listener
// ============================================================================

/// Bind `0.0.0.0:start_port`, moving to the next port while the address is in use.
async fn bind_with_fallback(start_port: u16) -> Result<(TcpListener, u16), ModbusError> {
    for attempt in 0..MAX_BIND_ATTEMPTS {
        let Some(port) = start_port.checked_add(attempt) else {
            break;
        };
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                let bound = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                return Ok((listener, bound));
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                tlog!("[ModbusServer] Port {} in use, trying next", port);
            }
            Err(e) => return Err(ModbusError::Io(e)),
        }
    }
    Err(ModbusError::NoAvailablePort {
        start: start_port,
        attempts: MAX_BIND_ATTEMPTS,
    })
}

/// Serve Modbus TCP on `listener` until the task is aborted.
fn spawn_listener(id: &str, listener: TcpListener, vector: RegisterVector) -> JoinHandle<()> {
    let id = id.to_string();
    tokio::spawn(async move {
        let server = Server::new(listener);

        let on_connected = move |stream, socket_addr| {
            let vector = vector.clone();
            async move {
                accept_tcp_connection(stream, socket_addr, move |peer| {
                    tlog!("[ModbusServer] Client connected from {}", peer);
                    Ok(Some(ModbusService::new(vector.clone())))
                })
            }
        };
        let on_process_error = |err| {
            tlog!("[ModbusServer] Connection error: {}", err);
        };

        if let Err(e) = server.serve(&on_connected, on_process_error).await {
            tlog!("[ModbusServer] {} listener stopped: {}", id, e);
        }
    })
}
