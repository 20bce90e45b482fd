use thiserror::Error;

use super::registers::{RegisterDef, RegisterFormat};

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("Payload too short, expected {expected} bytes but got {actual}")]
    ShortPayload { expected: usize, actual: usize },
}

/// Big endian IEEE-754, anything not finite is reported as 0.0
pub fn decode_f32(bytes: [u8; 4]) -> f32 {
    let v = f32::from_be_bytes(bytes);
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

pub fn decode_u16(bytes: [u8; 2]) -> u16 {
    u16::from_be_bytes(bytes)
}

pub fn decode_u32(bytes: [u8; 4]) -> u32 {
    u32::from_be_bytes(bytes)
}

/// Unscaled register content as it came from the wire
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue {
    Float(f32),
    Word(u16),
    DoubleWord(u32),
}

impl RawValue {
    pub fn scaled(&self, scaler: f32) -> f32 {
        match self {
            RawValue::Float(v) => v * scaler,
            RawValue::Word(v) => *v as f32 * scaler,
            RawValue::DoubleWord(v) => *v as f32 * scaler,
        }
    }
}

fn take<const N: usize>(payload: &[u8]) -> Result<[u8; N], DecodeError> {
    payload
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or(DecodeError::ShortPayload { expected: N, actual: payload.len() })
}

/// Decode the leading bytes of a register payload according to the register format
pub fn decode_register(def: &RegisterDef, payload: &[u8]) -> Result<RawValue, DecodeError> {
    let v = match def.format {
        RegisterFormat::Float32 => RawValue::Float(decode_f32(take::<4>(payload)?)),
        RegisterFormat::Uint16 => RawValue::Word(decode_u16(take::<2>(payload)?)),
        RegisterFormat::Uint32 => RawValue::DoubleWord(decode_u32(take::<4>(payload)?)),
    };
    Ok(v)
}
