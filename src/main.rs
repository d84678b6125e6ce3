// src/main.rs
//
// Headless front end: every backend event is printed through `tlog!`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use modscope_lib::events::LogEmitter;
use modscope_lib::io::codec::DataType;
use modscope_lib::io::modbus_client::{RegisterScanParams, TransportKind, UnitIdScanParams};
use modscope_lib::io::{ModbusError, RegisterType, WriteParams, WriteValue};
use modscope_lib::logging::{init_file_logging, stop_file_logging};
use modscope_lib::settings::{load_settings, ServerSettings};
use modscope_lib::{tlog, Backend};

/// Modbus TCP/RTU client and server emulator
#[derive(Parser)]
#[command(name = "modscope")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file
    #[arg(short, long, global = true, default_value = "modscope.toml")]
    config: PathBuf,

    /// Device host (overrides the settings file)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Device TCP port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Serial device; switches the client to RTU
    #[arg(long, global = true)]
    rtu: Option<String>,

    /// Serial baud rate
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Target unit id
    #[arg(short, long, global = true)]
    unit: Option<u8>,

    /// Mirror the log into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server instances listed in the settings file
    Serve {
        /// Serve an empty unit-less instance on this port when none are configured
        #[arg(long, default_value_t = 502)]
        listen: u16,
    },

    /// Read one block of registers
    Read {
        #[arg(short, long, default_value_t = 0)]
        address: u16,
        #[arg(short, long, default_value_t = 10)]
        length: u16,
        #[arg(short = 't', long, default_value = "holding_registers", value_parser = parse_register_type)]
        register_type: RegisterType,
    },

    /// Poll the configured register window
    Poll {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Write a value
    Write {
        #[arg(short, long)]
        address: u16,
        /// JSON literal: 70000, 1.5, true, [true,false] or "text"
        #[arg(short, long)]
        value: String,
        #[arg(short = 't', long, default_value = "holding_registers", value_parser = parse_register_type)]
        register_type: RegisterType,
        #[arg(short, long, default_value = "uint16", value_parser = parse_data_type)]
        data_type: DataType,
        /// Use the single-write function code
        #[arg(long)]
        single: bool,
        #[arg(long)]
        little_endian: bool,
    },

    /// Probe a range of unit ids
    ScanUnits {
        #[arg(long, default_value_t = 1)]
        start: u8,
        #[arg(long, default_value_t = 247)]
        end: u8,
        #[arg(short, long, default_value_t = 0)]
        address: u16,
        #[arg(short, long, default_value_t = 1)]
        length: u16,
        #[arg(long, default_value_t = 500)]
        timeout_ms: u64,
        /// Register classes to probe (all by default)
        #[arg(long = "type", value_parser = parse_register_type)]
        types: Vec<RegisterType>,
    },

    /// Read an address range in chunks and print the non-zero values
    ScanRegisters {
        #[arg(long, default_value_t = 0)]
        start: u16,
        #[arg(long, default_value_t = 65535)]
        end: u16,
        #[arg(short, long, default_value_t = 100)]
        length: u16,
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
    },

    /// List serial ports
    ListPorts,

    /// Check that a serial port exists
    CheckPort { path: String },
}

fn parse_register_type(s: &str) -> Result<RegisterType, String> {
    serde_json::from_value(serde_json::Value::String(s.replace('-', "_")))
        .map_err(|_| format!("unknown register type '{}'", s))
}

fn parse_data_type(s: &str) -> Result<DataType, String> {
    serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
        .map_err(|_| format!("unknown data type '{}'", s))
}

/// JSON literal, or the raw argument as text.
fn parse_write_value(s: &str) -> WriteValue {
    serde_json::from_str(s)
        .unwrap_or_else(|_| WriteValue::Register(modscope_lib::io::RegisterValue::Text(s.into())))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            tlog!("[modscope] {}", e);
            1
        }
    };
    stop_file_logging();
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), ModbusError> {
    let mut settings = load_settings(&cli.config)?;

    if let Some(dir) = cli.log_dir.clone().or_else(|| settings.log_dir.clone()) {
        init_file_logging(&dir).map_err(ModbusError::Settings)?;
    }

    if let Some(host) = cli.host {
        settings.connection.transport = TransportKind::Tcp;
        settings.connection.tcp.host = host;
    }
    if let Some(port) = cli.port {
        settings.connection.tcp.port = port;
    }
    if let Some(com) = cli.rtu {
        settings.connection.transport = TransportKind::Rtu;
        settings.connection.rtu.com = com;
    }
    if let Some(baud) = cli.baud {
        settings.connection.rtu.baud_rate = baud;
    }
    if let Some(unit) = cli.unit {
        settings.connection.unit_id = unit;
    }

    let backend = Backend::new(Arc::new(LogEmitter));
    backend.apply_settings(&settings);
    let client = backend.client();

    match cli.command {
        Commands::Serve { listen } => {
            let servers = if settings.servers.is_empty() {
                vec![ServerSettings {
                    id: "default".into(),
                    port: listen,
                    little_endian: false,
                    units: Vec::new(),
                }]
            } else {
                settings.servers.clone()
            };
            for server in &servers {
                backend.start_server(server).await?;
            }
            wait_for_ctrl_c().await;
        }

        Commands::Read {
            address,
            length,
            register_type,
        } => {
            client.connect().await?;
            let result = client.read(address, length, register_type).await;
            client.disconnect().await;
            let rows = result?;
            tlog!("[modscope] {} row(s) read", rows.len());
        }

        Commands::Poll { seconds } => {
            client.connect().await?;
            client.start_polling().await?;
            match seconds {
                Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
                None => wait_for_ctrl_c().await,
            }
        }

        Commands::Write {
            address,
            value,
            register_type,
            data_type,
            single,
            little_endian,
        } => {
            client.connect().await?;
            let result = client
                .write(WriteParams {
                    address,
                    register_type,
                    value: parse_write_value(&value),
                    data_type,
                    single,
                    little_endian,
                })
                .await;
            // Let the refresh read finish
            tokio::time::sleep(Duration::from_millis(200)).await;
            client.disconnect().await;
            result?;
        }

        Commands::ScanUnits {
            start,
            end,
            address,
            length,
            timeout_ms,
            types,
        } => {
            client.connect().await?;
            let register_types = if types.is_empty() {
                RegisterType::SCAN_ORDER.to_vec()
            } else {
                types
            };
            let result = client
                .scan_unit_ids(UnitIdScanParams {
                    start,
                    end,
                    address,
                    length,
                    register_types,
                    timeout_ms,
                })
                .await;
            client.disconnect().await;
            let found: Vec<u8> = result?
                .iter()
                .filter(|r| r.responded())
                .map(|r| r.unit_id)
                .collect();
            tlog!("[modscope] Responding unit ids: {:?}", found);
        }

        Commands::ScanRegisters {
            start,
            end,
            length,
            timeout_ms,
        } => {
            client.connect().await?;
            let result = client
                .scan_registers(RegisterScanParams {
                    start,
                    end,
                    length,
                    timeout_ms,
                })
                .await;
            client.disconnect().await;
            tlog!("[modscope] {} non-zero value(s) found", result?.len());
        }

        Commands::ListPorts => {
            let ports = modscope_lib::io::serial::list_serial_ports(&LogEmitter);
            for port in ports {
                println!("{}", port.port_name);
            }
        }

        Commands::CheckPort { path } => {
            let verdict = modscope_lib::io::serial::validate_serial_port(&path);
            println!("{}", verdict.message);
            if !verdict.valid {
                return Err(ModbusError::Serial(verdict.message));
            }
        }
    }

    backend.shutdown().await;
    Ok(())
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tlog!("[modscope] Failed to listen for Ctrl-C: {}", e);
    }
}
