use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Number of phase slots kept per meter, single phase meters only use slot 0
pub const PHASES: usize = 3;

/// The meter model, it decides which registers are read and how they are decoded
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MeterFamily {
    SDM630,
    SDM230,
    SDM220,
    SDM120,
    SDM72D,
    DDM,
    FINDER,
    UNKNOWN,
}

impl MeterFamily {
    pub const ALL: [MeterFamily; 8] = [
        MeterFamily::SDM630,
        MeterFamily::SDM230,
        MeterFamily::SDM220,
        MeterFamily::SDM120,
        MeterFamily::SDM72D,
        MeterFamily::DDM,
        MeterFamily::FINDER,
        MeterFamily::UNKNOWN,
    ];

    /// Position of the family inside the token family field (before the +1 offset)
    pub fn index(&self) -> u8 {
        match self {
            MeterFamily::SDM630 => 0,
            MeterFamily::SDM230 => 1,
            MeterFamily::SDM220 => 2,
            MeterFamily::SDM120 => 3,
            MeterFamily::SDM72D => 4,
            MeterFamily::DDM => 5,
            MeterFamily::FINDER => 6,
            MeterFamily::UNKNOWN => 7,
        }
    }

    pub fn from_index(index: u8) -> Option<Self> {
        return MeterFamily::ALL.get(index as usize).copied();
    }

    /// Serial stop bits the family expects, all of them use 8 data bits without parity
    pub fn stop_bits(&self) -> u8 {
        match self {
            MeterFamily::FINDER => 2,
            _ => 1,
        }
    }
}

impl std::fmt::Display for MeterFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", family_to_text(*self))
    }
}

impl std::str::FromStr for MeterFamily {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(text_to_family(s))
    }
}

pub fn family_to_text(family: MeterFamily) -> &'static str {
    match family {
        MeterFamily::SDM630 => "SDM630",
        MeterFamily::SDM230 => "SDM230",
        MeterFamily::SDM220 => "SDM220",
        MeterFamily::SDM120 => "SDM120",
        MeterFamily::SDM72D => "SDM72D",
        MeterFamily::DDM => "DDM",
        MeterFamily::FINDER => "FINDER",
        MeterFamily::UNKNOWN => "unknown",
    }
}

/// Anything we do not know ends up as UNKNOWN
pub fn text_to_family(text: &str) -> MeterFamily {
    match text.trim().to_uppercase().as_str() {
        "SDM630" => MeterFamily::SDM630,
        "SDM230" => MeterFamily::SDM230,
        "SDM220" => MeterFamily::SDM220,
        "SDM120" => MeterFamily::SDM120,
        "SDM72D" => MeterFamily::SDM72D,
        "DDM" => MeterFamily::DDM,
        "FINDER" => MeterFamily::FINDER,
        _ => MeterFamily::UNKNOWN,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Probing,
    Connected,
}

/// Failure classes reported by the bus for a single request
#[derive(Error, Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BusErrorCode {
    #[error("Response timeout")]
    Timeout,
    #[error("CRC mismatch")]
    CrcMismatch,
    #[error("Malformed frame")]
    MalformedFrame,
    #[error("Device exception {0:#04x}")]
    DeviceException(u8),
    #[error("Serial transport failure")]
    Transport,
}

/// Decoded values of one meter, all values are kept finite
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MeasurementSnapshot {
    /// V
    pub voltage: [f32; PHASES],
    /// A
    pub current: [f32; PHASES],
    /// W
    pub power: [f32; PHASES],
    /// VA
    pub apparent_power: [f32; PHASES],
    /// VAr
    pub reactive_power: [f32; PHASES],
    /// V, line to neutral
    pub average_voltage: f32,
    /// A
    pub average_current: f32,
    /// W
    pub total_power: f32,
    /// VAr
    pub total_reactive_power: f32,
    /// Hz
    pub frequency: f32,
    /// kWh
    pub energy_in: f32,
    /// kWh
    pub energy_out: f32,
    pub firmware_version: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ErrorCounters {
    pub total_errors: u32,
    pub cycles_completed: u32,
    pub last_error: Option<BusErrorCode>,
}

/// Read only view of a meter as handed out to the display and the json api
#[derive(Debug, Clone, Serialize)]
pub struct MeterReadout {
    pub slot: usize,
    pub address: u8,
    pub device: String,
    pub connected: bool,
    pub state: ConnectionState,
    pub voltage: [f32; PHASES],
    pub current: [f32; PHASES],
    pub power: [f32; PHASES],
    pub apparent_power: [f32; PHASES],
    pub reactive_power: [f32; PHASES],
    pub average_voltage: f32,
    pub average_current: f32,
    pub total_power: f32,
    pub total_reactive_power: f32,
    pub frequency: f32,
    pub energy_in: f32,
    pub energy_out: f32,
    pub firmware_version: u16,
    pub cycles: u32,
    pub errors: u32,
    pub last_error: Option<BusErrorCode>,
    pub last_update: Option<DateTime<Utc>>,
}
