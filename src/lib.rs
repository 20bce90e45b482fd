//! Modbus RTU power meter poller
//!
//! Polls Eastron SDM, Finder and DDM energy meters on one serial bus,
//! matches the responses back to the requesting meter and keeps a decoded
//! snapshot plus connection health per meter.

pub mod models;
pub mod config;
pub mod metering_modbus;

// Re-export common types for easier access
pub use models::{family_to_text, text_to_family, ConnectionState, MeterFamily, MeterReadout};
pub use config::{Config, ConfigError};
pub use metering_modbus::ModbusManager;
pub use metering_modbus::meter::Meter;
pub use metering_modbus::roster::MeterRoster;
pub use metering_modbus::scheduler::PollScheduler;
