// src/io/modbus_client/writer.rs
//
// Writes to coils (FC5/FC15) and holding registers (FC6/FC16).

use serde::{Deserialize, Serialize};

use super::ModbusClient;
use crate::events::MessageVariant;
use crate::io::codec::{self, check_address_range, DataType, RegisterValue};
use crate::io::pdu;
use crate::io::{ModbusError, RegisterType};

/// Value of a write request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WriteValue {
    Coil(bool),
    Coils(Vec<bool>),
    Register(RegisterValue),
}

fn default_data_type() -> DataType {
    DataType::UInt16
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteParams {
    pub address: u16,
    pub register_type: RegisterType,
    pub value: WriteValue,
    #[serde(default = "default_data_type")]
    pub data_type: DataType,
    /// Use the single-item function code (FC5/FC6)
    #[serde(default)]
    pub single: bool,
    #[serde(default)]
    pub little_endian: bool,
}

/// A validated write, ready for the transport.
#[derive(Clone, Debug, PartialEq)]
enum WriteRequest {
    SingleCoil(bool),
    MultipleCoils(Vec<bool>),
    SingleRegister(u16),
    MultipleRegisters(Vec<u16>),
}

impl WriteRequest {
    fn function_code(&self) -> u8 {
        match self {
            WriteRequest::SingleCoil(_) => pdu::FC_WRITE_SINGLE_COIL,
            WriteRequest::MultipleCoils(_) => pdu::FC_WRITE_MULTIPLE_COILS,
            WriteRequest::SingleRegister(_) => pdu::FC_WRITE_SINGLE_REGISTER,
            WriteRequest::MultipleRegisters(_) => pdu::FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    fn quantity(&self) -> u16 {
        match self {
            WriteRequest::SingleCoil(_) | WriteRequest::SingleRegister(_) => 1,
            WriteRequest::MultipleCoils(v) => v.len() as u16,
            WriteRequest::MultipleRegisters(v) => v.len() as u16,
        }
    }
}

/// Pick the function code and encode the payload. No I/O.
fn plan_write(params: &WriteParams) -> Result<WriteRequest, ModbusError> {
    let request = match params.register_type {
        RegisterType::Coils => match &params.value {
            WriteValue::Coil(v) => WriteRequest::SingleCoil(*v),
            WriteValue::Coils(values) if values.len() == 1 => WriteRequest::SingleCoil(values[0]),
            WriteValue::Coils(values) if values.len() > 1 => {
                WriteRequest::MultipleCoils(values.clone())
            }
            WriteValue::Coils(_) => {
                return Err(ModbusError::InvalidArgument("no coil values to write".into()))
            }
            WriteValue::Register(_) => {
                return Err(ModbusError::InvalidArgument(
                    "coil writes take boolean values".into(),
                ))
            }
        },
        RegisterType::HoldingRegisters => {
            let WriteValue::Register(value) = &params.value else {
                return Err(ModbusError::InvalidArgument(
                    "holding register writes take a numeric or text value".into(),
                ));
            };
            if params.single && !params.data_type.is_16bit() {
                return Err(ModbusError::InvalidArgument(format!(
                    "single register writes only support int16/uint16, not {}",
                    params.data_type
                )));
            }
            let words = codec::encode(params.data_type, value, params.little_endian)?;
            match words.as_slice() {
                [word] if params.single => WriteRequest::SingleRegister(*word),
                _ => WriteRequest::MultipleRegisters(words),
            }
        }
        RegisterType::DiscreteInputs | RegisterType::InputRegisters => {
            return Err(ModbusError::InvalidArgument(format!(
                "{} are read-only",
                params.register_type
            )))
        }
    };
    check_address_range(params.address, request.quantity())?;
    Ok(request)
}

impl ModbusClient {
    /// Write a value. Every attempt that reaches the transport is logged as a
    /// transaction. After a successful write the configured window is re-read
    /// unless polling already does so.
    pub async fn write(&self, params: WriteParams) -> Result<(), ModbusError> {
        if !self.is_connected() {
            self.message(MessageVariant::Warning, "Not connected");
            return Err(ModbusError::NotConnected);
        }
        let request = match plan_write(&params) {
            Ok(request) => request,
            Err(e) => {
                self.message(MessageVariant::Warning, format!("Write rejected: {}", e));
                return Err(e);
            }
        };

        let unit_id = self.connection_config().unit_id;
        let timeout = self.register_config().timeout();
        let address = params.address;
        let transport = self.transport();
        let (result, capture) = {
            let mut t = transport.lock().await;
            t.set_unit_id(unit_id);
            t.set_timeout(timeout);
            let result = match &request {
                WriteRequest::SingleCoil(v) => t.write_single_coil(address, *v).await,
                WriteRequest::MultipleCoils(v) => t.write_multiple_coils(address, v).await,
                WriteRequest::SingleRegister(v) => t.write_single_register(address, *v).await,
                WriteRequest::MultipleRegisters(v) => t.write_multiple_registers(address, v).await,
            };
            (result, t.take_capture())
        };
        self.log_transaction(
            unit_id,
            request.function_code(),
            address,
            request.quantity(),
            result.as_ref().err(),
            capture,
        );

        match result {
            Ok(()) => {
                self.message(
                    MessageVariant::Success,
                    format!(
                        "Wrote {} {} at {}",
                        request.quantity(),
                        params.register_type,
                        address
                    ),
                );
                if !self.state().polling {
                    let client = self.clone();
                    tokio::spawn(async move {
                        let _ = client.read_configured().await;
                    });
                }
                Ok(())
            }
            Err(e) => {
                self.message(MessageVariant::Error, format!("Write failed: {}", e));
                self.handle_transport_error(&e);
                Err(e)
            }
        }
    }
}
