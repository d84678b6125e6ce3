// src/lib.rs
//
// modscope: Modbus TCP/RTU client and multi-unit server emulator.
//
// The host drives everything through `Backend`, either by calling its methods
// directly or by dispatching serialised `Command`s, and observes the result
// through the `EventEmitter` it supplied.

#[macro_use]
pub mod logging;
pub mod events;
pub mod io;
pub mod settings;

use serde::Deserialize;
use serde_json::Value;

use events::SharedEmitter;
use io::codec::DataType;
use io::modbus_client::{
    ConnectionConfig, RegisterConfig, RegisterMapping, RegisterScanParams, UnitIdScanParams,
};
use io::modbus_server::BoolParams;
use io::serial::{list_serial_ports, validate_serial_port};
use io::{ModbusClient, ModbusError, ModbusServer, RegisterParams, RegisterType, WriteParams};
use settings::{AppSettings, ServerSettings};

// ============================================================================
// Commands
// ============================================================================

/// One request from the host, as `{"command": "...", "args": {...}}`.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum Command {
    // Client
    GetConnectionConfig,
    UpdateConnectionConfig(ConnectionConfig),
    UpdateRegisterConfig(RegisterConfig),
    GetClientState,
    SetRegisterMapping(RegisterMapping),
    Connect,
    Disconnect,
    Read {
        address: u16,
        length: u16,
        register_type: RegisterType,
    },
    StartPolling,
    StopPolling,
    Write(WriteParams),
    ScanUnitIds(UnitIdScanParams),
    StopScanningUnitIds,
    ScanRegisters(RegisterScanParams),
    StopScanningRegisters,
    ListSerialPorts,
    ValidateSerialPort {
        path: String,
    },

    // Server
    CreateServer {
        id: String,
        #[serde(default)]
        port: Option<u16>,
    },
    DeleteServer {
        id: String,
    },
    ResetServer {
        id: String,
    },
    SetPort {
        id: String,
        port: u16,
    },
    AddRegister {
        id: String,
        unit_id: u8,
        params: RegisterParams,
        #[serde(default)]
        little_endian: bool,
    },
    RemoveRegister {
        id: String,
        unit_id: u8,
        register_type: RegisterType,
        address: u16,
        data_type: DataType,
    },
    SyncRegisters {
        id: String,
        unit_id: u8,
        registers: Vec<RegisterParams>,
        #[serde(default)]
        little_endian: bool,
    },
    ResetRegisters {
        id: String,
        unit_id: u8,
    },
    SetBool {
        id: String,
        unit_id: u8,
        register_type: RegisterType,
        address: u16,
        value: bool,
    },
    ResetBools {
        id: String,
        unit_id: u8,
    },
    SyncBools {
        id: String,
        unit_id: u8,
        bools: Vec<BoolParams>,
    },
}

// ============================================================================
// Backend
// ============================================================================

/// The client and the server registry behind one event emitter.
#[derive(Clone)]
pub struct Backend {
    emitter: SharedEmitter,
    client: ModbusClient,
    server: ModbusServer,
}

impl Backend {
    pub fn new(emitter: SharedEmitter) -> Self {
        Self {
            client: ModbusClient::new(emitter.clone()),
            server: ModbusServer::new(emitter.clone()),
            emitter,
        }
    }

    pub fn client(&self) -> &ModbusClient {
        &self.client
    }

    pub fn server(&self) -> &ModbusServer {
        &self.server
    }

    /// Load the client side of the settings: connection, register window and mapping.
    pub fn apply_settings(&self, settings: &AppSettings) {
        self.client.set_connection_config(settings.connection.clone());
        self.client.set_register_config(settings.registers.clone());
        self.client.set_mapping(settings.mapping.clone());
    }

    /// Create a server instance and load its units. Returns the bound port.
    pub async fn start_server(&self, settings: &ServerSettings) -> Result<u16, ModbusError> {
        let port = self
            .server
            .create_server(&settings.id, Some(settings.port))
            .await?;

        for unit in &settings.units {
            self.server
                .sync_registers(
                    &settings.id,
                    unit.unit_id,
                    unit.registers.clone(),
                    settings.little_endian,
                )
                .await?;

            let coils = unit.coils.iter().map(|&address| BoolParams {
                address,
                register_type: RegisterType::Coils,
                value: true,
            });
            let inputs = unit.discrete_inputs.iter().map(|&address| BoolParams {
                address,
                register_type: RegisterType::DiscreteInputs,
                value: true,
            });
            self.server
                .sync_bools(&settings.id, unit.unit_id, coils.chain(inputs).collect())
                .await?;
        }

        tlog!(
            "[Backend] Server {} ready on port {} with {} unit(s)",
            settings.id,
            port,
            settings.units.len()
        );
        Ok(port)
    }

    /// Stop polling, disconnect the client and delete every server instance.
    pub async fn shutdown(&self) {
        self.client.stop_polling();
        if self.client.state().connect_state != io::ConnectState::Disconnected {
            self.client.disconnect().await;
        }
        self.server.shutdown().await;
    }

    /// Run one command and return its JSON result (`null` for commands that
    /// only report through events).
    pub async fn dispatch(&self, command: Command) -> Result<Value, ModbusError> {
        tlog!("[Backend] {:?}", command);
        match command {
            Command::GetConnectionConfig => to_value(&self.client.connection_config()),
            Command::UpdateConnectionConfig(config) => {
                self.client.set_connection_config(config);
                Ok(Value::Null)
            }
            Command::UpdateRegisterConfig(config) => {
                self.client.set_register_config(config);
                Ok(Value::Null)
            }
            Command::GetClientState => to_value(&self.client.state()),
            Command::SetRegisterMapping(mapping) => {
                self.client.set_mapping(mapping);
                Ok(Value::Null)
            }
            Command::Connect => {
                self.client.connect().await?;
                Ok(Value::Null)
            }
            Command::Disconnect => {
                self.client.disconnect().await;
                Ok(Value::Null)
            }
            Command::Read {
                address,
                length,
                register_type,
            } => to_value(&self.client.read(address, length, register_type).await?),
            Command::StartPolling => {
                self.client.start_polling().await?;
                Ok(Value::Null)
            }
            Command::StopPolling => {
                self.client.stop_polling();
                Ok(Value::Null)
            }
            Command::Write(params) => {
                self.client.write(params).await?;
                Ok(Value::Null)
            }
            Command::ScanUnitIds(params) => to_value(&self.client.scan_unit_ids(params).await?),
            Command::StopScanningUnitIds => {
                self.client.stop_scanning_unit_ids();
                Ok(Value::Null)
            }
            Command::ScanRegisters(params) => {
                to_value(&self.client.scan_registers(params).await?)
            }
            Command::StopScanningRegisters => {
                self.client.stop_scanning_registers();
                Ok(Value::Null)
            }
            Command::ListSerialPorts => to_value(&list_serial_ports(self.emitter.as_ref())),
            Command::ValidateSerialPort { path } => to_value(&validate_serial_port(&path)),

            Command::CreateServer { id, port } => {
                to_value(&self.server.create_server(&id, port).await?)
            }
            Command::DeleteServer { id } => {
                self.server.delete_server(&id).await?;
                Ok(Value::Null)
            }
            Command::ResetServer { id } => {
                self.server.reset_server(&id).await?;
                Ok(Value::Null)
            }
            Command::SetPort { id, port } => to_value(&self.server.set_port(&id, port).await?),
            Command::AddRegister {
                id,
                unit_id,
                params,
                little_endian,
            } => {
                self.server
                    .add_register(&id, unit_id, params, little_endian)
                    .await?;
                Ok(Value::Null)
            }
            Command::RemoveRegister {
                id,
                unit_id,
                register_type,
                address,
                data_type,
            } => {
                self.server
                    .remove_register(&id, unit_id, register_type, address, data_type)
                    .await?;
                Ok(Value::Null)
            }
            Command::SyncRegisters {
                id,
                unit_id,
                registers,
                little_endian,
            } => {
                self.server
                    .sync_registers(&id, unit_id, registers, little_endian)
                    .await?;
                Ok(Value::Null)
            }
            Command::ResetRegisters { id, unit_id } => {
                self.server.reset_registers(&id, unit_id).await?;
                Ok(Value::Null)
            }
            Command::SetBool {
                id,
                unit_id,
                register_type,
                address,
                value,
            } => {
                self.server
                    .set_bool(&id, unit_id, register_type, address, value)
                    .await?;
                Ok(Value::Null)
            }
            Command::ResetBools { id, unit_id } => {
                self.server.reset_bools(&id, unit_id).await?;
                Ok(Value::Null)
            }
            Command::SyncBools { id, unit_id, bools } => {
                self.server.sync_bools(&id, unit_id, bools).await?;
                Ok(Value::Null)
            }
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ModbusError> {
    serde_json::to_value(value).map_err(|e| ModbusError::Protocol(format!("serialise result: {}", e)))
}
