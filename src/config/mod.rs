use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::metering_modbus::registers::descriptor;
use crate::metering_modbus::roster::MAX_METERS;
use crate::models::{text_to_family, MeterFamily};

/// Locations checked when no explicit config file is given
pub const CONFIG_PATHS: [&str; 2] = ["config/meterpoll.yaml", "meterpoll.yaml"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read the config on {0}")]
    NotFound(String),
    #[error("Unable to read config file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("Unable to parse config file: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("No meters configured")]
    NoMeters,
    #[error("At most {max} meters are supported, got {count}")]
    TooManyMeters { count: usize, max: usize },
    #[error("Meter type {0} is not known")]
    UnknownMeterType(String),
    #[error("Bus address {0} is outside 1..=247")]
    InvalidAddress(u8),
    #[error("Bus address {0} is used more than once")]
    DuplicateAddress(u8),
    #[error("Invalid bus setting: {0}")]
    InvalidBus(String),
}

fn bus_baud_rate_default() -> u32 { return 9600 }
fn bus_timeout_ms_default() -> u64 { return 2000 }
fn bus_queue_depth_default() -> usize { return 32 }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct BusConfig {
    pub port: String,
    #[serde(default="bus_baud_rate_default")]
    pub baud_rate: u32,
    #[serde(default="bus_timeout_ms_default")]
    pub timeout_ms: u64,
    /* derived from the meters when missing */
    #[serde(default)]
    pub stop_bits: Option<u8>,
    #[serde(default="bus_queue_depth_default")]
    pub queue_depth: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct MeterConfig {
    pub meter: String,
    pub address: u8,
}

impl MeterConfig {
    pub fn family(&self) -> MeterFamily {
        return text_to_family(&self.meter);
    }
}

fn poll_interval_sec_default() -> u64 { return 10 }
fn report_interval_sec_default() -> u64 { return 60 }
fn meters_default() -> Vec<MeterConfig> { return Vec::new() }

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    pub bus: BusConfig,
    #[serde(default="poll_interval_sec_default")]
    pub poll_interval_sec: u64,
    #[serde(default="report_interval_sec_default")]
    pub report_interval_sec: u64,
    #[serde(default="meters_default")]
    pub meters: Vec<MeterConfig>,
}

impl Config {
    /// Load the given file, or the first of [`CONFIG_PATHS`] that exists
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path: PathBuf = match path {
            Some(p) => p.to_path_buf(),
            None => CONFIG_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
                .ok_or_else(|| ConfigError::NotFound(CONFIG_PATHS.join(" or ")))?,
        };

        let display = path.display().to_string();
        let mut file = File::open(&path).map_err(|e| ConfigError::Io { path: display.clone(), source: e })?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(|e| ConfigError::Io { path: display.clone(), source: e })?;

        info!("Loading config from {}", display);
        return Config::parse(&contents);
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let c: Config = serde_yml::from_str(contents)?;
        c.validate()?;
        return Ok(c);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.meters.is_empty() {
            return Err(ConfigError::NoMeters);
        }
        if self.meters.len() > MAX_METERS {
            return Err(ConfigError::TooManyMeters { count: self.meters.len(), max: MAX_METERS });
        }

        let mut seen = HashSet::new();
        for m in self.meters.iter() {
            if m.family() == MeterFamily::UNKNOWN {
                return Err(ConfigError::UnknownMeterType(m.meter.clone()));
            }
            if m.address == 0 || m.address > 247 {
                return Err(ConfigError::InvalidAddress(m.address));
            }
            if !seen.insert(m.address) {
                return Err(ConfigError::DuplicateAddress(m.address));
            }
        }

        if self.bus.baud_rate == 0 {
            return Err(ConfigError::InvalidBus("baud_rate must not be 0".to_string()));
        }
        if self.bus.queue_depth == 0 {
            return Err(ConfigError::InvalidBus("queue_depth must not be 0".to_string()));
        }
        if let Some(s) = self.bus.stop_bits {
            if s != 1 && s != 2 {
                return Err(ConfigError::InvalidBus(format!("stop_bits must be 1 or 2, got {}", s)));
            }
        }
        if self.poll_interval_sec == 0 {
            return Err(ConfigError::InvalidBus("poll_interval_sec must not be 0".to_string()));
        }

        let framings: HashSet<u8> = self.meters.iter().map(|m| m.family().stop_bits()).collect();
        if framings.len() > 1 && self.bus.stop_bits.is_none() {
            warn!("Meters on the bus expect different stop bits, using {} from the first meter", self.stop_bits());
        }
        Ok(())
    }

    /// Explicit setting wins, otherwise the framing of the first meter
    pub fn stop_bits(&self) -> u8 {
        if let Some(s) = self.bus.stop_bits {
            return s;
        }
        return self.meters.first().map(|m| m.family().stop_bits()).unwrap_or(1);
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.bus.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_sec)
    }

    /// Requests one polling cycle puts on the bus at most, a full batch or
    /// a probe per meter
    pub fn requests_per_cycle(&self) -> usize {
        return self.meters.iter().map(|m| descriptor(m.family()).batch().count().max(1)).sum();
    }

    /// Depth of the request queue, never below two cycles so a cycle that
    /// is still running late on timeouts does not cut off the next one
    pub fn queue_depth(&self) -> usize {
        return self.bus.queue_depth.max(2 * self.requests_per_cycle());
    }

    /// (family, address) per roster slot
    pub fn roster_entries(&self) -> Vec<(MeterFamily, u8)> {
        return self.meters.iter().map(|m| (m.family(), m.address)).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r"
bus:
  port: /dev/ttyUSB0
meters:
  - meter: SDM630
    address: 1
  - meter: finder
    address: 2
";

    #[test]
    fn test_parse_with_defaults() {
        let c = Config::parse(EXAMPLE).unwrap();
        assert_eq!(c.bus.port, "/dev/ttyUSB0");
        assert_eq!(c.bus.baud_rate, 9600);
        assert_eq!(c.timeout(), Duration::from_millis(2000));
        assert_eq!(c.bus.queue_depth, 32);
        assert_eq!(c.poll_interval(), Duration::from_secs(10));
        assert_eq!(c.report_interval_sec, 60);
        assert_eq!(c.roster_entries(), vec![(MeterFamily::SDM630, 1), (MeterFamily::FINDER, 2)]);
        /* first meter decides */
        assert_eq!(c.stop_bits(), 1);
    }

    #[test]
    fn test_queue_holds_full_cycles() {
        let c = Config::parse(&EXAMPLE.replace("finder", "SDM630")).unwrap();
        assert_eq!(c.requests_per_cycle(), 44);
        assert_eq!(c.queue_depth(), 88);

        /* FINDER polls 6 registers */
        let c = Config::parse(EXAMPLE).unwrap();
        assert_eq!(c.requests_per_cycle(), 28);
        assert_eq!(c.queue_depth(), 56);

        let c = Config::parse(&EXAMPLE.replace("port: /dev/ttyUSB0", "port: /dev/ttyUSB0\n  queue_depth: 200")).unwrap();
        assert_eq!(c.queue_depth(), 200);

        let c = Config::parse("bus:\n  port: /dev/ttyS1\nmeters:\n  - meter: DDM\n    address: 1\n").unwrap();
        assert_eq!(c.requests_per_cycle(), 1);
        assert_eq!(c.queue_depth(), 32);
    }

    #[test]
    fn test_explicit_stop_bits() {
        let c = Config::parse(&format!("{}\n", EXAMPLE.replace("port: /dev/ttyUSB0", "port: /dev/ttyUSB0\n  stop_bits: 2"))).unwrap();
        assert_eq!(c.stop_bits(), 2);
    }

    #[test]
    fn test_reject_unknown_meter() {
        let r = Config::parse(&EXAMPLE.replace("SDM630", "XYZ1"));
        assert!(matches!(r, Err(ConfigError::UnknownMeterType(m)) if m == "XYZ1"));
    }

    #[test]
    fn test_reject_duplicate_address() {
        let r = Config::parse(&EXAMPLE.replace("address: 2", "address: 1"));
        assert!(matches!(r, Err(ConfigError::DuplicateAddress(1))));
    }

    #[test]
    fn test_reject_broadcast_address() {
        let r = Config::parse(&EXAMPLE.replace("address: 2", "address: 0"));
        assert!(matches!(r, Err(ConfigError::InvalidAddress(0))));
    }

    #[test]
    fn test_reject_too_many_meters() {
        let mut yaml = "bus:\n  port: /dev/ttyS1\nmeters:\n".to_string();
        for a in 1..=5 {
            yaml.push_str(&format!("  - meter: SDM120\n    address: {}\n", a));
        }
        assert!(matches!(Config::parse(&yaml), Err(ConfigError::TooManyMeters { count: 5, max: 4 })));
    }

    #[test]
    fn test_reject_empty() {
        assert!(matches!(Config::parse("bus:\n  port: /dev/ttyS1\n"), Err(ConfigError::NoMeters)));
        assert!(matches!(Config::parse("meters: []\n"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        let r = Config::load(Some(Path::new("/nonexistent/meterpoll.yaml")));
        assert!(matches!(r, Err(ConfigError::Io { .. })));
    }
}
