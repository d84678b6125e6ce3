// src/io/pdu.rs
//
// Modbus function codes and PDU byte reconstruction for the transaction log.
//
// tokio-modbus owns the actual framing; it does not expose the bytes it puts
// on the wire. The transport rebuilds the request/response PDUs from the
// typed call and result so every exchange can be logged byte-for-byte
// (unit id prefixed, MBAP/CRC excluded).

use serde::Serialize;
use tokio_modbus::ExceptionCode;

use super::codec::{coils_to_bytes, registers_to_bytes};

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Bit set on the function code of an exception response.
const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Capture
// ============================================================================

/// Raw bytes of the most recent exchange.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WireCapture {
    pub request: Vec<u8>,
    pub responses: Vec<Vec<u8>>,
}

fn header(unit_id: u8, function_code: u8, address: u16) -> Vec<u8> {
    let mut pdu = vec![unit_id, function_code];
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu
}

/// Request for any of the four read function codes.
pub fn read_request(unit_id: u8, function_code: u8, address: u16, quantity: u16) -> Vec<u8> {
    let mut pdu = header(unit_id, function_code, address);
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu
}

/// Response to a register read (FC3/FC4).
pub fn read_registers_response(unit_id: u8, function_code: u8, registers: &[u16]) -> Vec<u8> {
    let data = registers_to_bytes(registers);
    let mut pdu = vec![unit_id, function_code, data.len() as u8];
    pdu.extend(data);
    pdu
}

/// Response to a bit read (FC1/FC2).
pub fn read_bits_response(unit_id: u8, function_code: u8, bits: &[bool]) -> Vec<u8> {
    let data = coils_to_bytes(bits);
    let mut pdu = vec![unit_id, function_code, data.len() as u8];
    pdu.extend(data);
    pdu
}

/// FC5 request; the echo response is identical.
pub fn write_single_coil(unit_id: u8, address: u16, value: bool) -> Vec<u8> {
    let mut pdu = header(unit_id, FC_WRITE_SINGLE_COIL, address);
    pdu.extend_from_slice(if value { &[0xFF, 0x00] } else { &[0x00, 0x00] });
    pdu
}

/// FC6 request; the echo response is identical.
pub fn write_single_register(unit_id: u8, address: u16, value: u16) -> Vec<u8> {
    let mut pdu = header(unit_id, FC_WRITE_SINGLE_REGISTER, address);
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

/// FC15 request.
pub fn write_multiple_coils(unit_id: u8, address: u16, values: &[bool]) -> Vec<u8> {
    let data = coils_to_bytes(values);
    let mut pdu = read_request(unit_id, FC_WRITE_MULTIPLE_COILS, address, values.len() as u16);
    pdu.push(data.len() as u8);
    pdu.extend(data);
    pdu
}

/// FC16 request.
pub fn write_multiple_registers(unit_id: u8, address: u16, values: &[u16]) -> Vec<u8> {
    let data = registers_to_bytes(values);
    let mut pdu = read_request(unit_id, FC_WRITE_MULTIPLE_REGISTERS, address, values.len() as u16);
    pdu.push(data.len() as u8);
    pdu.extend(data);
    pdu
}

/// FC15/FC16 response: address + quantity written.
pub fn write_multiple_response(unit_id: u8, function_code: u8, address: u16, quantity: u16) -> Vec<u8> {
    read_request(unit_id, function_code, address, quantity)
}

/// Exception response: function code with the high bit set, then the code.
pub fn exception_response(unit_id: u8, function_code: u8, code: ExceptionCode) -> Vec<u8> {
    vec![unit_id, function_code | EXCEPTION_FLAG, exception_code_byte(code)]
}

/// Numeric value of an exception code as it appears on the wire.
pub fn exception_code_byte(code: ExceptionCode) -> u8 {
    match code {
        ExceptionCode::IllegalFunction => 0x01,
        ExceptionCode::IllegalDataAddress => 0x02,
        ExceptionCode::IllegalDataValue => 0x03,
        ExceptionCode::ServerDeviceFailure => 0x04,
        ExceptionCode::Acknowledge => 0x05,
        ExceptionCode::ServerDeviceBusy => 0x06,
        ExceptionCode::MemoryParityError => 0x08,
        ExceptionCode::GatewayPathUnavailable => 0x0A,
        ExceptionCode::GatewayTargetDevice => 0x0B,
        _ => 0xFF,
    }
}
