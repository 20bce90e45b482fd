//! Correlation token attached to every bus request.
//!
//! Internally a token is a [`Token`]. Only the bus boundary sees the packed
//! 32 bit form:
//!
//! | bits  | content                                   |
//! |-------|-------------------------------------------|
//! | 0-15  | register address                          |
//! | 16-23 | meter family index + 1                    |
//! | 24-27 | roster slot, added by the scheduler       |
//! | 28    | last request of a polling cycle           |
//! | 29-31 | reserved, zero                            |
//!
//! The connect probe uses the constant [`CONNECT_PROBE`] which stays below
//! 0x10000 while every read token has a non zero family field.

use thiserror::Error;

use crate::models::MeterFamily;

pub const CONNECT_PROBE: u32 = 0x0000_4711;
pub const TOK_FINAL: u32 = 0x1000_0000;

const REGISTER_MASK: u32 = 0x0000_FFFF;
const FAMILY_SHIFT: u32 = 16;
const FAMILY_MASK: u32 = 0x00FF_0000;
const SLOT_SHIFT: u32 = 24;
const SLOT_MASK: u32 = 0x0F00_0000;
const RESERVED_MASK: u32 = 0xE000_0000;

/// Largest slot index that fits the slot field
pub const MAX_SLOT: usize = 0x0F;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("Unknown family field {0:#04x} in token")]
    UnknownFamily(u8),
    #[error("Reserved bits set in token {0:#010x}")]
    ReservedBits(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadToken {
    pub family: MeterFamily,
    pub register: u16,
    pub is_final: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    ConnectProbe,
    Read(ReadToken),
}

impl Token {
    pub fn read(family: MeterFamily, register: u16, is_final: bool) -> Self {
        Token::Read(ReadToken { family, register, is_final })
    }

    pub fn is_final(&self) -> bool {
        match self {
            Token::ConnectProbe => false,
            Token::Read(t) => t.is_final,
        }
    }

    pub fn to_wire(&self) -> u32 {
        match self {
            Token::ConnectProbe => CONNECT_PROBE,
            Token::Read(t) => encode(t.family, t.register, t.is_final),
        }
    }

    /// Expects a wire value without slot bits, see [`strip_slot`]
    pub fn from_wire(wire: u32) -> Result<Self, TokenError> {
        if wire == CONNECT_PROBE {
            return Ok(Token::ConnectProbe);
        }
        let (family, register, is_final) = decode(wire)?;
        Ok(Token::read(family, register, is_final))
    }
}

pub fn encode(family: MeterFamily, register: u16, is_final: bool) -> u32 {
    let mut wire = ((family.index() as u32 + 1) << FAMILY_SHIFT) | register as u32;
    if is_final {
        wire |= TOK_FINAL;
    }
    wire
}

pub fn decode(wire: u32) -> Result<(MeterFamily, u16, bool), TokenError> {
    if wire & (RESERVED_MASK | SLOT_MASK) != 0 {
        return Err(TokenError::ReservedBits(wire));
    }
    let field = ((wire & FAMILY_MASK) >> FAMILY_SHIFT) as u8;
    let family = field
        .checked_sub(1)
        .and_then(MeterFamily::from_index)
        .ok_or(TokenError::UnknownFamily(field))?;
    Ok((family, (wire & REGISTER_MASK) as u16, wire & TOK_FINAL != 0))
}

/// Put the roster slot into the wire token, slots above [`MAX_SLOT`] are truncated
pub fn with_slot(wire: u32, slot: usize) -> u32 {
    wire | (((slot & MAX_SLOT) as u32) << SLOT_SHIFT)
}

/// Split off the scheduler slot bits, returns (slot, token)
pub fn strip_slot(wire: u32) -> (usize, u32) {
    (((wire & SLOT_MASK) >> SLOT_SHIFT) as usize, wire & !SLOT_MASK)
}
