use thiserror::Error;

use crate::models::BusErrorCode;
use super::registers::RegisterKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
}

impl From<RegisterKind> for FunctionCode {
    fn from(kind: RegisterKind) -> Self {
        match kind {
            RegisterKind::Holding => FunctionCode::ReadHoldingRegisters,
            RegisterKind::Input => FunctionCode::ReadInputRegisters,
        }
    }
}

/// One register read as handed to the bus, the token is already packed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRequest {
    pub address: u8,
    pub function: FunctionCode,
    pub register: u16,
    pub count: u16,
    pub token: u32,
}

/// Outcome of exactly one enqueued request
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub address: u8,
    pub token: u32,
    /// Register data bytes (without address, function code and byte count) or the failure
    pub outcome: Result<Vec<u8>, BusErrorCode>,
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Request queue is full")]
    QueueFull,
    #[error("Bus worker is gone")]
    Closed,
    #[error("Unable to build request frame: {0}")]
    Frame(String),
    #[error("Unable to open serial port {port}: {reason}")]
    Open { port: String, reason: String },
}

/// The Modbus client the scheduler talks to. Enqueue never blocks, every
/// accepted request later yields exactly one [`Completion`] on the channel
/// that was handed out when the session was created.
pub trait BusSession {
    fn enqueue(&self, request: BusRequest) -> Result<(), BusError>;
}
