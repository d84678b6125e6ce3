// src/io/codec.rs
//
// Register codec - converts between raw 16-bit Modbus registers and typed values.
//
// Word order: `little_endian` swaps whole registers within a multi-register
// value. Byte order inside each register is always big-endian (MSB first),
// matching standard Modbus.

use serde::{Deserialize, Serialize};

use super::error::CodecError;

/// Float interpretations are rounded to this many decimals.
const FLOAT_DECIMALS: i32 = 5;
/// Double interpretations are rounded to this many decimals.
const DOUBLE_DECIMALS: i32 = 10;

// ============================================================================
// Types
// ============================================================================

/// Data types a register (or run of registers) can be interpreted as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float,
    Int64,
    UInt64,
    Double,
    /// Unix timestamp, whole seconds (32-bit)
    Unix,
    /// Milliseconds since epoch (64-bit)
    DateTime,
    /// UTF-8 bytes packed two per register; length chosen by the caller
    Utf8,
}

impl DataType {
    /// Number of registers a value of this type occupies.
    /// UTF-8 is variable; this returns the single-register minimum.
    pub fn words(&self) -> u16 {
        match self {
            DataType::Int16 | DataType::UInt16 | DataType::Utf8 => 1,
            DataType::Int32 | DataType::UInt32 | DataType::Float | DataType::Unix => 2,
            DataType::Int64 | DataType::UInt64 | DataType::Double | DataType::DateTime => 4,
        }
    }

    /// Whether single-register write (FC6) is allowed for this type.
    pub fn is_16bit(&self) -> bool {
        matches!(self, DataType::Int16 | DataType::UInt16)
    }

    /// Decimal places a generated random value is rounded to.
    pub fn generator_decimals(&self) -> i32 {
        match self {
            DataType::Float | DataType::Double => 2,
            _ => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Int16 => "int16",
            DataType::UInt16 => "uint16",
            DataType::Int32 => "int32",
            DataType::UInt32 => "uint32",
            DataType::Float => "float",
            DataType::Int64 => "int64",
            DataType::UInt64 => "uint64",
            DataType::Double => "double",
            DataType::Unix => "unix",
            DataType::DateTime => "datetime",
            DataType::Utf8 => "utf8",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of registers a value of `data_type` occupies.
pub fn words_for(data_type: DataType) -> u16 {
    data_type.words()
}

/// A value to encode. Numbers keep their integer-ness so 64-bit values
/// survive without passing through `f64`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
}

impl RegisterValue {
    fn as_i128(&self) -> Option<i128> {
        match self {
            RegisterValue::Int(v) => Some(*v as i128),
            RegisterValue::UInt(v) => Some(*v as i128),
            RegisterValue::Float(v) if v.is_finite() => Some(v.trunc() as i128),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            RegisterValue::Int(v) => Some(*v as f64),
            RegisterValue::UInt(v) => Some(*v as f64),
            RegisterValue::Float(v) => Some(*v),
            RegisterValue::Text(_) => None,
        }
    }
}

impl std::fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterValue::Int(v) => write!(f, "{}", v),
            RegisterValue::UInt(v) => write!(f, "{}", v),
            RegisterValue::Float(v) => write!(f, "{}", v),
            RegisterValue::Text(v) => write!(f, "{:?}", v),
        }
    }
}

/// Every interpretation of the register(s) starting at one address.
/// 32-bit fields are present when at least two registers remain in the
/// buffer, 64-bit fields when at least four remain.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterWords {
    pub int16: i16,
    pub uint16: u16,
    pub int32: Option<i32>,
    pub uint32: Option<u32>,
    pub float: Option<f64>,
    pub int64: Option<i64>,
    pub uint64: Option<u64>,
    pub double: Option<f64>,
    /// `uint32` read as epoch seconds (RFC 3339)
    pub unix: Option<String>,
    /// `uint64` read as epoch milliseconds (RFC 3339)
    pub datetime: Option<String>,
    /// The register's two bytes as text, NULs stripped
    pub utf8: String,
}

/// One interpretation picked out of [`RegisterWords`] by data type.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum TypedValue {
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Float(f64),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Unix(String),
    DateTime(String),
    Utf8(String),
}

impl TypedValue {
    /// Numeric view used when applying a scaling factor.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TypedValue::Int16(v) => Some(*v as f64),
            TypedValue::UInt16(v) => Some(*v as f64),
            TypedValue::Int32(v) => Some(*v as f64),
            TypedValue::UInt32(v) => Some(*v as f64),
            TypedValue::Float(v) | TypedValue::Double(v) => Some(*v),
            TypedValue::Int64(v) => Some(*v as f64),
            TypedValue::UInt64(v) => Some(*v as f64),
            TypedValue::Unix(_) | TypedValue::DateTime(_) | TypedValue::Utf8(_) => None,
        }
    }
}

impl RegisterWords {
    /// Select the interpretation for `data_type`, if enough registers were available.
    pub fn select(&self, data_type: DataType) -> Option<TypedValue> {
        match data_type {
            DataType::Int16 => Some(TypedValue::Int16(self.int16)),
            DataType::UInt16 => Some(TypedValue::UInt16(self.uint16)),
            DataType::Int32 => self.int32.map(TypedValue::Int32),
            DataType::UInt32 => self.uint32.map(TypedValue::UInt32),
            DataType::Float => self.float.map(TypedValue::Float),
            DataType::Int64 => self.int64.map(TypedValue::Int64),
            DataType::UInt64 => self.uint64.map(TypedValue::UInt64),
            DataType::Double => self.double.map(TypedValue::Double),
            DataType::Unix => self.unix.clone().map(TypedValue::Unix),
            DataType::DateTime => self.datetime.clone().map(TypedValue::DateTime),
            DataType::Utf8 => Some(TypedValue::Utf8(self.utf8.clone())),
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a big-endian register buffer (2 bytes per register) into one
/// [`RegisterWords`] per register. A trailing odd byte is ignored.
pub fn decode(buffer: &[u8], little_endian: bool) -> Vec<RegisterWords> {
    let count = buffer.len() / 2;
    let mut rows = Vec::with_capacity(count);

    for i in 0..count {
        let word = [buffer[i * 2], buffer[i * 2 + 1]];
        let mut row = RegisterWords {
            int16: i16::from_be_bytes(word),
            uint16: u16::from_be_bytes(word),
            utf8: bytes_to_text(&word),
            ..Default::default()
        };

        if count - i >= 2 {
            let bytes: [u8; 4] = ordered_bytes(&buffer[i * 2..i * 2 + 4], little_endian)
                .try_into()
                .unwrap_or_default();
            let uint32 = u32::from_be_bytes(bytes);
            row.int32 = Some(i32::from_be_bytes(bytes));
            row.uint32 = Some(uint32);
            row.float = Some(round_to(f32::from_be_bytes(bytes) as f64, FLOAT_DECIMALS));
            row.unix = chrono::DateTime::from_timestamp(uint32 as i64, 0).map(|t| t.to_rfc3339());
        }

        if count - i >= 4 {
            let bytes: [u8; 8] = ordered_bytes(&buffer[i * 2..i * 2 + 8], little_endian)
                .try_into()
                .unwrap_or_default();
            let uint64 = u64::from_be_bytes(bytes);
            row.int64 = Some(i64::from_be_bytes(bytes));
            row.uint64 = Some(uint64);
            row.double = Some(round_to(f64::from_be_bytes(bytes), DOUBLE_DECIMALS));
            row.datetime = i64::try_from(uint64)
                .ok()
                .and_then(chrono::DateTime::from_timestamp_millis)
                .map(|t| t.to_rfc3339());
        }

        rows.push(row);
    }

    rows
}

/// Decode a single typed value from its registers (already in wire order).
pub fn decode_value(words: &[u16], data_type: DataType, little_endian: bool) -> Option<TypedValue> {
    if data_type == DataType::Utf8 {
        return Some(TypedValue::Utf8(decode_string(words)));
    }
    if words.len() < data_type.words() as usize {
        return None;
    }
    let bytes = registers_to_bytes(&words[..data_type.words() as usize]);
    decode(&bytes, little_endian)
        .first()
        .and_then(|row| row.select(data_type))
}

/// Reverse whole registers when `little_endian`, keeping bytes inside each register.
fn ordered_bytes(bytes: &[u8], little_endian: bool) -> Vec<u8> {
    if !little_endian {
        return bytes.to_vec();
    }
    bytes
        .chunks_exact(2)
        .rev()
        .flat_map(|w| [w[0], w[1]])
        .collect()
}

fn bytes_to_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| *c != '\0')
        .collect()
}

fn round_to(value: f64, decimals: i32) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let factor = 10f64.powi(decimals);
    let scaled = (value * factor).round() / factor;
    if scaled.is_finite() {
        scaled
    } else {
        value
    }
}

/// Round half away from zero to `decimals` places (used by value generators).
pub fn round_decimals(value: f64, decimals: i32) -> f64 {
    round_to(value, decimals)
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a value into registers ready for a write call.
pub fn encode(
    data_type: DataType,
    value: &RegisterValue,
    little_endian: bool,
) -> Result<Vec<u16>, CodecError> {
    let bytes: Vec<u8> = match data_type {
        DataType::Int16 => (int_in_range(data_type, value, i16::MIN as i128, i16::MAX as i128)?
            as i16)
            .to_be_bytes()
            .to_vec(),
        DataType::UInt16 => (int_in_range(data_type, value, 0, u16::MAX as i128)? as u16)
            .to_be_bytes()
            .to_vec(),
        DataType::Int32 => (int_in_range(data_type, value, i32::MIN as i128, i32::MAX as i128)?
            as i32)
            .to_be_bytes()
            .to_vec(),
        DataType::UInt32 | DataType::Unix => {
            (int_in_range(data_type, value, 0, u32::MAX as i128)? as u32)
                .to_be_bytes()
                .to_vec()
        }
        DataType::Int64 => (int_in_range(data_type, value, i64::MIN as i128, i64::MAX as i128)?
            as i64)
            .to_be_bytes()
            .to_vec(),
        DataType::UInt64 | DataType::DateTime => {
            (int_in_range(data_type, value, 0, u64::MAX as i128)? as u64)
                .to_be_bytes()
                .to_vec()
        }
        DataType::Float => {
            let v = value.as_f64().ok_or(CodecError::WrongKind {
                data_type: data_type.to_string(),
                expected: "numeric",
            })?;
            (v as f32).to_be_bytes().to_vec()
        }
        DataType::Double => {
            let v = value.as_f64().ok_or(CodecError::WrongKind {
                data_type: data_type.to_string(),
                expected: "numeric",
            })?;
            v.to_be_bytes().to_vec()
        }
        DataType::Utf8 => {
            let RegisterValue::Text(text) = value else {
                return Err(CodecError::WrongKind {
                    data_type: data_type.to_string(),
                    expected: "text",
                });
            };
            let length = text.len().div_ceil(2).max(1) as u16;
            return Ok(encode_string(text, length));
        }
    };

    let mut words = bytes_to_registers(&bytes);
    if little_endian {
        words.reverse();
    }
    Ok(words)
}

/// Pack UTF-8 bytes two per register, zero-padding or truncating to
/// exactly `length_in_registers` registers.
pub fn encode_string(text: &str, length_in_registers: u16) -> Vec<u16> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(length_in_registers as usize * 2, 0);
    bytes_to_registers(&bytes)
}

/// Inverse of [`encode_string`]; trailing NULs are dropped.
pub fn decode_string(words: &[u16]) -> String {
    bytes_to_text(&registers_to_bytes(words))
}

fn int_in_range(
    data_type: DataType,
    value: &RegisterValue,
    min: i128,
    max: i128,
) -> Result<i128, CodecError> {
    let v = value.as_i128().ok_or(CodecError::WrongKind {
        data_type: data_type.to_string(),
        expected: "numeric",
    })?;
    if v < min || v > max {
        return Err(CodecError::OutOfRange {
            data_type: data_type.to_string(),
            value: value.to_string(),
        });
    }
    Ok(v)
}

/// Check that `words` registers starting at `address` fit in the 16-bit address space.
pub fn check_address_range(address: u16, words: u16) -> Result<(), CodecError> {
    if address as u32 + words as u32 > 65536 {
        return Err(CodecError::AddressOverflow {
            address: address as u32,
            words: words as u32,
        });
    }
    Ok(())
}

// ============================================================================
// Byte Helpers
// ============================================================================

/// Convert Modbus register values (u16) to bytes in big-endian order.
/// Each register becomes 2 bytes (MSB first), matching standard Modbus byte order.
pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(registers.len() * 2);
    for &reg in registers {
        bytes.push((reg >> 8) as u8); // MSB
        bytes.push((reg & 0xFF) as u8); // LSB
    }
    bytes
}

/// Convert big-endian bytes to registers. A trailing odd byte is zero-padded.
pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)]))
        .collect()
}

/// Convert coil/discrete input values (bool) to packed bytes.
/// 8 coils per byte, LSB first within each byte (Modbus convention).
pub fn coils_to_bytes(coils: &[bool]) -> Vec<u8> {
    let byte_count = coils.len().div_ceil(8);
    let mut bytes = vec![0u8; byte_count];
    for (i, &coil) in coils.iter().enumerate() {
        if coil {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(data_type: DataType, value: RegisterValue, little_endian: bool) -> TypedValue {
        let words = encode(data_type, &value, little_endian).expect("encode failed");
        assert_eq!(words.len(), data_type.words() as usize);
        decode_value(&words, data_type, little_endian).expect("decode failed")
    }

    #[test]
    fn test_words_for() {
        assert_eq!(words_for(DataType::Int16), 1);
        assert_eq!(words_for(DataType::UInt16), 1);
        assert_eq!(words_for(DataType::Float), 2);
        assert_eq!(words_for(DataType::Unix), 2);
        assert_eq!(words_for(DataType::Double), 4);
        assert_eq!(words_for(DataType::DateTime), 4);
    }

    #[test]
    fn test_int32_70000_big_endian() {
        let words = encode(DataType::Int32, &RegisterValue::Int(70000), false).unwrap();
        assert_eq!(words, vec![1, 4464]);
    }

    #[test]
    fn test_little_endian_swaps_whole_registers() {
        let be = encode(DataType::Int32, &RegisterValue::Int(0x1234_5678), false).unwrap();
        let le = encode(DataType::Int32, &RegisterValue::Int(0x1234_5678), true).unwrap();
        assert_eq!(be, vec![0x1234, 0x5678]);
        assert_eq!(le, vec![0x5678, 0x1234]);

        let be64 = encode(DataType::UInt64, &RegisterValue::UInt(0x0102_0304_0506_0708), false)
            .unwrap();
        let le64 = encode(DataType::UInt64, &RegisterValue::UInt(0x0102_0304_0506_0708), true)
            .unwrap();
        let mut reversed = be64.clone();
        reversed.reverse();
        assert_eq!(le64, reversed);
    }

    #[test]
    fn test_roundtrip_integers_both_orders() {
        for le in [false, true] {
            assert_eq!(roundtrip(DataType::Int16, RegisterValue::Int(-1234), le), TypedValue::Int16(-1234));
            assert_eq!(roundtrip(DataType::UInt16, RegisterValue::Int(65535), le), TypedValue::UInt16(65535));
            assert_eq!(roundtrip(DataType::Int32, RegisterValue::Int(-70000), le), TypedValue::Int32(-70000));
            assert_eq!(
                roundtrip(DataType::UInt32, RegisterValue::UInt(4_000_000_000), le),
                TypedValue::UInt32(4_000_000_000)
            );
            assert_eq!(
                roundtrip(DataType::Int64, RegisterValue::Int(i64::MIN + 7), le),
                TypedValue::Int64(i64::MIN + 7)
            );
            assert_eq!(
                roundtrip(DataType::UInt64, RegisterValue::UInt(u64::MAX - 3), le),
                TypedValue::UInt64(u64::MAX - 3)
            );
        }
    }

    #[test]
    fn test_roundtrip_floats_rounded() {
        for le in [false, true] {
            assert_eq!(
                roundtrip(DataType::Float, RegisterValue::Float(3.14159), le),
                TypedValue::Float(3.14159)
            );
            assert_eq!(
                roundtrip(DataType::Double, RegisterValue::Float(-2.718281828459045), le),
                TypedValue::Double(-2.7182818285)
            );
        }
    }

    #[test]
    fn test_timestamps_decode_to_rfc3339() {
        let words = encode(DataType::Unix, &RegisterValue::Int(0), false).unwrap();
        let value = decode_value(&words, DataType::Unix, false).unwrap();
        assert_eq!(value, TypedValue::Unix("1970-01-01T00:00:00+00:00".to_string()));

        let words = encode(DataType::DateTime, &RegisterValue::Int(1500), false).unwrap();
        let value = decode_value(&words, DataType::DateTime, false).unwrap();
        assert_eq!(value, TypedValue::DateTime("1970-01-01T00:00:01.500+00:00".to_string()));
    }

    #[test]
    fn test_decode_partial_interpretations() {
        let bytes = registers_to_bytes(&[0x0001, 0x1170, 0x0000]);
        let rows = decode(&bytes, false);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].int32, Some(70000));
        assert_eq!(rows[0].int64, None);
        assert_eq!(rows[1].uint32, Some(0x1170_0000));
        assert_eq!(rows[2].int32, None);
        assert_eq!(rows[2].uint16, 0);
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(matches!(
            encode(DataType::Int16, &RegisterValue::Int(40000), false),
            Err(CodecError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode(DataType::UInt32, &RegisterValue::Int(-1), false),
            Err(CodecError::OutOfRange { .. })
        ));
        assert!(matches!(
            encode(DataType::Int32, &RegisterValue::Text("x".into()), false),
            Err(CodecError::WrongKind { .. })
        ));
    }

    #[test]
    fn test_encode_string_pads_and_truncates() {
        assert_eq!(encode_string("AB", 2), vec![0x4142, 0x0000]);
        assert_eq!(encode_string("ABCDE", 2), vec![0x4142, 0x4344]);
        assert_eq!(encode_string("ABC", 2), vec![0x4142, 0x4300]);
        assert_eq!(decode_string(&encode_string("hello", 4)), "hello");
    }

    #[test]
    fn test_address_range_check() {
        assert!(check_address_range(65535, 1).is_ok());
        assert!(check_address_range(65534, 2).is_ok());
        assert!(check_address_range(65534, 4).is_err());
    }

    #[test]
    fn test_coils_to_bytes() {
        assert_eq!(coils_to_bytes(&[true, false, true]), vec![0b101]);
        assert_eq!(coils_to_bytes(&[false; 9]), vec![0, 0]);
    }
}
