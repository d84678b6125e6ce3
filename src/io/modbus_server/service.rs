// src/io/modbus_server/service.rs
//
// Request servicing for a server instance.
//
// `RegisterVector` is the get/set surface over the unit arrays; it validates
// the unit id and address range and reports remote writes through the same
// notifier as local configuration. `ModbusService` adapts it to
// tokio-modbus so each TCP connection answers from the shared arrays.

use std::future;

use tokio_modbus::prelude::*;

use super::data::{store_words, Notifier, ServerData, UnitData, ADDRESS_SPACE};
use crate::io::RegisterType;

// ============================================================================
// Register Vector
// ============================================================================

/// Get/set callbacks over one server instance's unit data.
#[derive(Clone)]
pub struct RegisterVector {
    data: ServerData,
    notifier: Notifier,
}

fn unit(unit_id: u16) -> Result<u8, ExceptionCode> {
    u8::try_from(unit_id).map_err(|_| ExceptionCode::ServerDeviceFailure)
}

fn check_range(address: u16, count: usize) -> Result<(), ExceptionCode> {
    if count == 0 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    if address as usize + count > ADDRESS_SPACE {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(())
}

impl RegisterVector {
    pub fn new(data: ServerData, notifier: Notifier) -> Self {
        Self { data, notifier }
    }

    /// Read from an initialised unit; a unit never configured does not exist.
    fn read<R>(&self, unit_id: u16, f: impl FnOnce(&UnitData) -> R) -> Result<R, ExceptionCode> {
        let unit_id = unit(unit_id)?;
        self.data
            .with_existing(unit_id, |u| f(u))
            .ok_or(ExceptionCode::IllegalDataAddress)
    }

    pub fn read_bits(
        &self,
        unit_id: u16,
        register_type: RegisterType,
        address: u16,
        count: u16,
    ) -> Result<Vec<bool>, ExceptionCode> {
        check_range(address, count as usize)?;
        let start = address as usize;
        self.read(unit_id, |u| {
            u.bits(register_type)
                .map(|bits| bits[start..start + count as usize].to_vec())
        })?
        .ok_or(ExceptionCode::IllegalFunction)
    }

    pub fn read_words(
        &self,
        unit_id: u16,
        register_type: RegisterType,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ExceptionCode> {
        check_range(address, count as usize)?;
        let start = address as usize;
        self.read(unit_id, |u| {
            u.words(register_type)
                .map(|words| words[start..start + count as usize].to_vec())
        })?
        .ok_or(ExceptionCode::IllegalFunction)
    }

    pub fn get_coil(&self, unit_id: u16, address: u16) -> Result<bool, ExceptionCode> {
        Ok(self.read_bits(unit_id, RegisterType::Coils, address, 1)?[0])
    }

    pub fn get_discrete_input(&self, unit_id: u16, address: u16) -> Result<bool, ExceptionCode> {
        Ok(self.read_bits(unit_id, RegisterType::DiscreteInputs, address, 1)?[0])
    }

    pub fn get_input_register(&self, unit_id: u16, address: u16) -> Result<u16, ExceptionCode> {
        Ok(self.read_words(unit_id, RegisterType::InputRegisters, address, 1)?[0])
    }

    pub fn get_holding_register(&self, unit_id: u16, address: u16) -> Result<u16, ExceptionCode> {
        Ok(self.read_words(unit_id, RegisterType::HoldingRegisters, address, 1)?[0])
    }

    /// Remote coil write; initialises the unit if needed.
    pub fn write_coils(&self, unit_id: u16, address: u16, values: &[bool]) -> Result<(), ExceptionCode> {
        let unit_id = unit(unit_id)?;
        check_range(address, values.len())?;
        self.data.with_unit(unit_id, |u| {
            if let Some(coils) = u.bits_mut(RegisterType::Coils) {
                for (offset, &value) in values.iter().enumerate() {
                    let index = address as usize + offset;
                    coils[index] = value;
                    self.notifier
                        .bit(unit_id, RegisterType::Coils, index as u16, value);
                }
            }
        });
        Ok(())
    }

    /// Remote holding register write; initialises the unit if needed.
    pub fn write_holding_registers(
        &self,
        unit_id: u16,
        address: u16,
        values: &[u16],
    ) -> Result<(), ExceptionCode> {
        let unit_id = unit(unit_id)?;
        check_range(address, values.len())?;
        self.data.with_unit(unit_id, |u| {
            store_words(
                u,
                &self.notifier,
                unit_id,
                RegisterType::HoldingRegisters,
                address,
                values,
            )
        });
        Ok(())
    }

    pub fn set_coil(&self, unit_id: u16, address: u16, value: bool) -> Result<(), ExceptionCode> {
        self.write_coils(unit_id, address, &[value])
    }

    pub fn set_holding_register(&self, unit_id: u16, address: u16, value: u16) -> Result<(), ExceptionCode> {
        self.write_holding_registers(unit_id, address, &[value])
    }

    /// Answer one decoded request.
    pub fn handle(&self, unit_id: u8, request: Request<'_>) -> Result<Response, ExceptionCode> {
        let unit_id = unit_id as u16;
        match request {
            Request::ReadCoils(addr, cnt) => self
                .read_bits(unit_id, RegisterType::Coils, addr, cnt)
                .map(Response::ReadCoils),
            Request::ReadDiscreteInputs(addr, cnt) => self
                .read_bits(unit_id, RegisterType::DiscreteInputs, addr, cnt)
                .map(Response::ReadDiscreteInputs),
            Request::ReadHoldingRegisters(addr, cnt) => self
                .read_words(unit_id, RegisterType::HoldingRegisters, addr, cnt)
                .map(Response::ReadHoldingRegisters),
            Request::ReadInputRegisters(addr, cnt) => self
                .read_words(unit_id, RegisterType::InputRegisters, addr, cnt)
                .map(Response::ReadInputRegisters),
            Request::WriteSingleCoil(addr, value) => self
                .set_coil(unit_id, addr, value)
                .map(|_| Response::WriteSingleCoil(addr, value)),
            Request::WriteMultipleCoils(addr, values) => self
                .write_coils(unit_id, addr, &values)
                .map(|_| Response::WriteMultipleCoils(addr, values.len() as u16)),
            Request::WriteSingleRegister(addr, value) => self
                .set_holding_register(unit_id, addr, value)
                .map(|_| Response::WriteSingleRegister(addr, value)),
            Request::WriteMultipleRegisters(addr, values) => self
                .write_holding_registers(unit_id, addr, &values)
                .map(|_| Response::WriteMultipleRegisters(addr, values.len() as u16)),
            other => {
                tlog!(
                    "[ModbusServer] {} unsupported request: {:?}",
                    self.notifier.instance_id(),
                    other
                );
                Err(ExceptionCode::IllegalFunction)
            }
        }
    }
}

// ============================================================================
// tokio-modbus Service
// ============================================================================

/// Per-connection service answering from a `RegisterVector`.
pub struct ModbusService {
    vector: RegisterVector,
}

impl ModbusService {
    pub fn new(vector: RegisterVector) -> Self {
        Self { vector }
    }
}

impl tokio_modbus::server::Service for ModbusService {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let SlaveRequest { slave, request } = req;
        future::ready(self.vector.handle(slave, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEmitter;
    use std::sync::Arc;

    fn vector() -> RegisterVector {
        RegisterVector::new(ServerData::default(), Notifier::new("test", Arc::new(NullEmitter)))
    }

    #[test]
    fn test_unit_id_above_255_is_device_failure() {
        let v = vector();
        assert_eq!(v.get_holding_register(300, 0), Err(ExceptionCode::ServerDeviceFailure));
        assert_eq!(v.set_coil(256, 0, true), Err(ExceptionCode::ServerDeviceFailure));
    }

    #[test]
    fn test_unconfigured_unit_does_not_exist() {
        let v = vector();
        assert_eq!(v.get_holding_register(1, 0), Err(ExceptionCode::IllegalDataAddress));
        assert_eq!(v.get_coil(1, 0), Err(ExceptionCode::IllegalDataAddress));
    }

    #[test]
    fn test_remote_write_initialises_unit() {
        let v = vector();
        v.set_holding_register(1, 10, 77).unwrap();
        assert_eq!(v.get_holding_register(1, 10), Ok(77));
        // Never written, but inside an initialised unit
        assert_eq!(v.get_holding_register(1, 11), Ok(0));
        assert_eq!(v.get_input_register(1, 11), Ok(0));
        assert_eq!(v.get_discrete_input(1, 0), Ok(false));
    }

    #[test]
    fn test_range_checks() {
        let v = vector();
        v.set_coil(1, 0, true).unwrap();
        assert_eq!(
            v.read_words(1, RegisterType::HoldingRegisters, 65535, 2),
            Err(ExceptionCode::IllegalDataAddress)
        );
        assert_eq!(
            v.read_bits(1, RegisterType::Coils, 0, 0),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(v.read_bits(1, RegisterType::Coils, 65535, 1), Ok(vec![false]));
    }

    #[test]
    fn test_handle_dispatch() {
        let v = vector();
        let response = v
            .handle(1, Request::WriteMultipleRegisters(5, vec![1, 2].into()))
            .unwrap();
        assert_eq!(response, Response::WriteMultipleRegisters(5, 2));
        assert_eq!(
            v.handle(1, Request::ReadHoldingRegisters(5, 2)).unwrap(),
            Response::ReadHoldingRegisters(vec![1, 2])
        );
        assert_eq!(
            v.handle(2, Request::ReadCoils(0, 1)),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }
}
