use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use thiserror::Error;

use crate::models::{
    family_to_text, BusErrorCode, ConnectionState, ErrorCounters, MeasurementSnapshot, MeterFamily, MeterReadout,
};
use super::decode::{decode_register, RawValue};
use super::registers::{descriptor, Measurement, RegisterDef, RegisterKind};
use super::token::Token;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MeterError {
    #[error("Meter at address {0} is not connected")]
    NotConnected(u8),
}

/// A single register read produced by a meter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterRequest {
    pub address: u8,
    pub kind: RegisterKind,
    pub register: u16,
    pub words: u16,
    pub token: Token,
}

/// State of one configured meter on the bus
#[derive(Debug, Clone)]
pub struct Meter {
    family: MeterFamily,
    address: u8,
    state: ConnectionState,
    snapshot: MeasurementSnapshot,
    counters: ErrorCounters,
    last_update: Option<DateTime<Utc>>,
}

impl Meter {
    pub fn new(family: MeterFamily, address: u8) -> Self {
        let mut meter = Meter {
            family,
            address,
            state: ConnectionState::Disconnected,
            snapshot: MeasurementSnapshot::default(),
            counters: ErrorCounters::default(),
            last_update: None,
        };
        meter.configure(family, address);
        meter
    }

    /// Set identity and start over with a clean state
    pub fn configure(&mut self, family: MeterFamily, address: u8) {
        self.family = family;
        self.address = address;
        self.state = ConnectionState::Disconnected;
        self.snapshot = MeasurementSnapshot::default();
        self.counters = ErrorCounters::default();
        self.last_update = None;
    }

    /// One connect attempt, moves the meter to Probing
    pub fn build_connect_request(&mut self) -> MeterRequest {
        let probe = &descriptor(self.family).probe;
        if self.state == ConnectionState::Disconnected {
            debug!("{} at {} probing register {:#06x}", self.family, self.address, probe.register);
        }
        self.state = ConnectionState::Probing;
        MeterRequest {
            address: self.address,
            kind: probe.kind,
            register: probe.register,
            words: probe.words,
            token: Token::ConnectProbe,
        }
    }

    /// The probe never reached the bus, nothing is outstanding anymore
    pub fn abort_probe(&mut self) {
        if self.state == ConnectionState::Probing {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// All reads of one polling cycle, the last one carries the final flag
    pub fn build_poll_batch(&self) -> Result<Vec<MeterRequest>, MeterError> {
        if self.state != ConnectionState::Connected {
            return Err(MeterError::NotConnected(self.address));
        }

        let desc = descriptor(self.family);
        if !desc.supported {
            info!("{} at {} not yet supported", self.family, self.address);
            return Ok(Vec::new());
        }

        let mut batch: Vec<MeterRequest> = desc
            .batch()
            .map(|r| MeterRequest {
                address: self.address,
                kind: r.kind,
                register: r.register,
                words: r.words,
                token: Token::read(self.family, r.register, false),
            })
            .collect();

        if let Some(last) = batch.last_mut() {
            last.token = Token::read(self.family, last.register, true);
        }
        Ok(batch)
    }

    /// Decoding always follows the family of this meter, the family inside the token is informational
    pub fn on_response(&mut self, token: Token, payload: &[u8]) {
        let desc = descriptor(self.family);
        match token {
            Token::ConnectProbe => {
                self.store(&desc.probe, payload);
                if self.state != ConnectionState::Connected {
                    info!("{} at {} connected", self.family, self.address);
                }
                self.state = ConnectionState::Connected;
            }
            Token::Read(read) => {
                if read.family != self.family {
                    debug!(
                        "Token family {} differs from {} at {}, decoding as {}",
                        read.family, self.family, self.address, self.family
                    );
                }
                match desc.find(read.register) {
                    Some(def) => self.store(def, payload),
                    None => warn!(
                        "{} at {} has no register {:#06x}, dropping response",
                        self.family, self.address, read.register
                    ),
                }
                if read.is_final {
                    self.counters.cycles_completed = self.counters.cycles_completed.saturating_add(1);
                }
            }
        }
    }

    /// Any failed request invalidates the whole session until the next probe
    pub fn on_error(&mut self, code: BusErrorCode) {
        self.counters.total_errors = self.counters.total_errors.saturating_add(1);
        self.counters.last_error = Some(code);
        if self.state != ConnectionState::Disconnected {
            warn!("{} at {} disconnected: {}", self.family, self.address, code);
        }
        self.state = ConnectionState::Disconnected;
    }

    fn store(&mut self, def: &RegisterDef, payload: &[u8]) {
        let raw = match decode_register(def, payload) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("{} at {} register {:#06x}: {}", self.family, self.address, def.register, e);
                return;
            }
        };

        let v = raw.scaled(def.scaler);
        self.set(def.measurement, v, raw);

        /* single phase meters without totals report phase 1 as system value */
        if let Some(aggregate) = def.measurement.aggregate() {
            if !descriptor(self.family).polls(aggregate) {
                self.set(aggregate, v, raw);
            }
        }
        self.last_update = Some(Utc::now());
    }

    fn set(&mut self, measurement: Measurement, v: f32, raw: RawValue) {
        let s = &mut self.snapshot;
        let slot = match measurement {
            Measurement::Voltage(p) => s.voltage.get_mut(p),
            Measurement::Current(p) => s.current.get_mut(p),
            Measurement::Power(p) => s.power.get_mut(p),
            Measurement::ApparentPower(p) => s.apparent_power.get_mut(p),
            Measurement::ReactivePower(p) => s.reactive_power.get_mut(p),
            Measurement::AverageVoltage => Some(&mut s.average_voltage),
            Measurement::AverageCurrent => Some(&mut s.average_current),
            Measurement::TotalPower => Some(&mut s.total_power),
            Measurement::TotalReactivePower => Some(&mut s.total_reactive_power),
            Measurement::Frequency => Some(&mut s.frequency),
            Measurement::EnergyImported => Some(&mut s.energy_in),
            Measurement::EnergyExported => Some(&mut s.energy_out),
            Measurement::FirmwareVersion => {
                s.firmware_version = match raw {
                    RawValue::Word(w) => w,
                    other => other.scaled(1.0) as u16,
                };
                None
            }
        };
        if let Some(slot) = slot {
            *slot = v;
        }
    }

    pub fn family(&self) -> MeterFamily {
        self.family
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn snapshot(&self) -> &MeasurementSnapshot {
        &self.snapshot
    }

    pub fn counters(&self) -> &ErrorCounters {
        &self.counters
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn device_name(&self) -> &'static str {
        family_to_text(self.family)
    }

    pub fn readout(&self, slot: usize) -> MeterReadout {
        let s = &self.snapshot;
        MeterReadout {
            slot,
            address: self.address,
            device: self.device_name().to_string(),
            connected: self.is_connected(),
            state: self.state,
            voltage: s.voltage,
            current: s.current,
            power: s.power,
            apparent_power: s.apparent_power,
            reactive_power: s.reactive_power,
            average_voltage: s.average_voltage,
            average_current: s.average_current,
            total_power: s.total_power,
            total_reactive_power: s.total_reactive_power,
            frequency: s.frequency,
            energy_in: s.energy_in,
            energy_out: s.energy_out,
            firmware_version: s.firmware_version,
            cycles: self.counters.cycles_completed,
            errors: self.counters.total_errors,
            last_error: self.counters.last_error,
            last_update: self.last_update,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_modbus::registers::*;

    fn connected(family: MeterFamily, address: u8) -> Meter {
        let mut meter = Meter::new(family, address);
        let _ = meter.build_connect_request();
        meter.on_response(Token::ConnectProbe, &230.0f32.to_be_bytes());
        meter
    }

    #[test]
    fn test_fresh_meter_is_disconnected() {
        let meter = Meter::new(MeterFamily::SDM630, 1);
        assert_eq!(meter.state(), ConnectionState::Disconnected);
        assert_eq!(meter.counters(), &ErrorCounters::default());
        assert_eq!(meter.snapshot(), &MeasurementSnapshot::default());
        assert_eq!(meter.build_poll_batch(), Err(MeterError::NotConnected(1)));
    }

    #[test]
    fn test_sdm230_connect() {
        let mut meter = Meter::new(MeterFamily::SDM230, 1);
        let req = meter.build_connect_request();
        assert_eq!(req.address, 1);
        assert_eq!(req.register, SDM_PHASE_1_VOLTAGE);
        assert_eq!(req.words, 2);
        assert_eq!(req.kind, RegisterKind::Input);
        assert_eq!(req.token, Token::ConnectProbe);
        assert_eq!(meter.state(), ConnectionState::Probing);

        meter.on_response(Token::ConnectProbe, &230.0f32.to_be_bytes());
        assert_eq!(meter.state(), ConnectionState::Connected);
        assert_eq!(meter.snapshot().voltage[0], 230.0);
        assert!(meter.last_update().is_some());
    }

    #[test]
    fn test_finder_probe_reads_firmware() {
        let mut meter = Meter::new(MeterFamily::FINDER, 7);
        let req = meter.build_connect_request();
        assert_eq!(req.register, FINDER_FIRMWARE_VERSION);
        assert_eq!(req.kind, RegisterKind::Holding);
        assert_eq!(req.words, 1);

        meter.on_response(Token::ConnectProbe, &[0x01, 0x02]);
        assert!(meter.is_connected());
        assert_eq!(meter.snapshot().firmware_version, 0x0102);
    }

    #[test]
    fn test_sdm230_batch() {
        let meter = connected(MeterFamily::SDM230, 1);
        let batch = meter.build_poll_batch().unwrap();
        let registers: Vec<u16> = batch.iter().map(|r| r.register).collect();
        assert_eq!(
            registers,
            vec![
                SDM_PHASE_1_VOLTAGE,
                SDM_PHASE_1_CURRENT,
                SDM_PHASE_1_POWER,
                SDM_PHASE_1_APPARENT_POWER,
                SDM_PHASE_1_REACTIVE_POWER,
                SDM_AVERAGE_L_TO_N_VOLTS,
                SDM_AVERAGE_LINE_CURRENT,
                SDM_TOTAL_SYSTEM_POWER,
                SDM_TOTAL_SYSTEM_REACTIVE_POWER,
                SDM_FREQUENCY,
                SDM_IMPORT_ACTIVE_ENERGY,
                SDM_EXPORT_ACTIVE_ENERGY,
            ]
        );
        let finals: Vec<bool> = batch.iter().map(|r| r.token.is_final()).collect();
        assert_eq!(finals.iter().filter(|f| **f).count(), 1);
        assert_eq!(finals.last(), Some(&true));
        assert!(batch.iter().all(|r| r.address == 1 && r.words == 2));
    }

    #[test]
    fn test_sdm_aggregates() {
        let mut meter = connected(MeterFamily::SDM230, 1);
        meter.on_response(Token::read(MeterFamily::SDM230, SDM_AVERAGE_L_TO_N_VOLTS, false), &229.0f32.to_be_bytes());
        meter.on_response(Token::read(MeterFamily::SDM230, SDM_AVERAGE_LINE_CURRENT, false), &3.5f32.to_be_bytes());
        meter.on_response(Token::read(MeterFamily::SDM230, SDM_TOTAL_SYSTEM_POWER, false), &800.0f32.to_be_bytes());
        meter.on_response(
            Token::read(MeterFamily::SDM230, SDM_TOTAL_SYSTEM_REACTIVE_POWER, false),
            &(-12.5f32).to_be_bytes(),
        );
        meter.on_response(Token::read(MeterFamily::SDM230, SDM_PHASE_1_POWER, false), &790.0f32.to_be_bytes());

        let s = meter.snapshot();
        assert_eq!(s.average_voltage, 229.0);
        assert_eq!(s.average_current, 3.5);
        /* phase values do not overwrite polled totals */
        assert_eq!(s.total_power, 800.0);
        assert_eq!(s.power[0], 790.0);
        assert_eq!(s.total_reactive_power, -12.5);

        let r = meter.readout(0);
        assert_eq!(r.total_power, 800.0);
        assert_eq!(r.average_voltage, 229.0);
    }

    #[test]
    fn test_sdm630_batch_covers_phases() {
        let meter = connected(MeterFamily::SDM630, 2);
        let batch = meter.build_poll_batch().unwrap();
        assert_eq!(batch.len(), 22);
        for reg in [SDM_PHASE_2_VOLTAGE, SDM_PHASE_3_CURRENT, SDM_PHASE_3_REACTIVE_POWER] {
            assert!(batch.iter().any(|r| r.register == reg));
        }
        assert_eq!(batch.last().unwrap().token, Token::read(MeterFamily::SDM630, SDM_EXPORT_ACTIVE_ENERGY, true));
    }

    #[test]
    fn test_ddm_emits_nothing() {
        let mut meter = Meter::new(MeterFamily::DDM, 4);
        let req = meter.build_connect_request();
        assert_eq!(req.register, DDM_PHASE_1_VOLTAGE);
        meter.on_response(Token::ConnectProbe, &229.5f32.to_be_bytes());
        assert_eq!(meter.build_poll_batch(), Ok(Vec::new()));
    }

    #[test]
    fn test_decode_into_snapshot() {
        let mut meter = connected(MeterFamily::SDM630, 1);
        meter.on_response(Token::read(MeterFamily::SDM630, SDM_PHASE_3_CURRENT, false), &4.25f32.to_be_bytes());
        meter.on_response(Token::read(MeterFamily::SDM630, SDM_FREQUENCY, false), &50.0f32.to_be_bytes());
        meter.on_response(Token::read(MeterFamily::SDM630, SDM_IMPORT_ACTIVE_ENERGY, false), &1234.5f32.to_be_bytes());
        meter.on_response(Token::read(MeterFamily::SDM630, SDM_EXPORT_ACTIVE_ENERGY, false), &[0x7F, 0xC0, 0, 0]);

        let s = meter.snapshot();
        assert_eq!(s.current[2], 4.25);
        assert_eq!(s.frequency, 50.0);
        assert_eq!(s.energy_in, 1234.5);
        assert_eq!(s.energy_out, 0.0);
    }

    #[test]
    fn test_finder_scaling() {
        let mut meter = connected(MeterFamily::FINDER, 3);
        meter.on_response(Token::read(MeterFamily::FINDER, FINDER_PHASE_1_VOLTAGE, false), &[0x00, 0xE6]);
        meter.on_response(Token::read(MeterFamily::FINDER, FINDER_PHASE_1_CURRENT, false), &[0x00, 0x35]);
        meter.on_response(Token::read(MeterFamily::FINDER, FINDER_PHASE_1_POWER, false), &[0x30, 0x39]);
        meter.on_response(Token::read(MeterFamily::FINDER, FINDER_EXPORT_ACTIVE_ENERGY, true), &[0x00, 0x00, 0x27, 0x10]);

        let s = meter.snapshot();
        assert_eq!(s.voltage[0], 230.0);
        assert!((s.current[0] - 5.3).abs() < 1e-5);
        assert!((s.power[0] - 123.45).abs() < 1e-3);
        assert!((s.energy_out - 100.0).abs() < 1e-4);
        assert_eq!(meter.counters().cycles_completed, 1);

        /* no totals on the bus, phase 1 stands in for them */
        assert_eq!(s.average_voltage, 230.0);
        assert!((s.average_current - 5.3).abs() < 1e-5);
        assert!((s.total_power - 123.45).abs() < 1e-3);
        assert_eq!(s.total_reactive_power, 0.0);
    }

    #[test]
    fn test_counters_saturate() {
        let mut meter = connected(MeterFamily::SDM230, 1);
        meter.counters.cycles_completed = u32::MAX;
        meter.counters.total_errors = u32::MAX;
        meter.on_response(Token::read(MeterFamily::SDM230, SDM_EXPORT_ACTIVE_ENERGY, true), &1.0f32.to_be_bytes());
        meter.on_error(BusErrorCode::Timeout);
        assert_eq!(meter.counters().cycles_completed, u32::MAX);
        assert_eq!(meter.counters().total_errors, u32::MAX);
    }

    #[test]
    fn test_abort_probe() {
        let mut meter = Meter::new(MeterFamily::SDM120, 2);
        let _ = meter.build_connect_request();
        meter.abort_probe();
        assert_eq!(meter.state(), ConnectionState::Disconnected);
        assert_eq!(meter.counters().total_errors, 0);

        /* a connected meter is left alone */
        let mut meter = connected(MeterFamily::SDM120, 2);
        meter.abort_probe();
        assert!(meter.is_connected());
    }

    #[test]
    fn test_error_disconnects() {
        let mut meter = connected(MeterFamily::SDM230, 1);
        for _ in 0..5 {
            meter.on_response(Token::read(MeterFamily::SDM230, SDM_FREQUENCY, false), &50.0f32.to_be_bytes());
        }
        meter.on_error(BusErrorCode::Timeout);
        assert_eq!(meter.state(), ConnectionState::Disconnected);
        assert_eq!(meter.counters().total_errors, 1);
        assert_eq!(meter.counters().last_error, Some(BusErrorCode::Timeout));
        /* measurements stay frozen */
        assert_eq!(meter.snapshot().frequency, 50.0);

        meter.on_error(BusErrorCode::CrcMismatch);
        assert_eq!(meter.counters().total_errors, 2);
        assert_eq!(meter.counters().last_error, Some(BusErrorCode::CrcMismatch));
    }

    #[test]
    fn test_error_while_probing() {
        let mut meter = Meter::new(MeterFamily::SDM120, 9);
        let _ = meter.build_connect_request();
        meter.on_error(BusErrorCode::MalformedFrame);
        assert_eq!(meter.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_cycle_counting() {
        let mut meter = connected(MeterFamily::SDM630, 1);
        let batch = meter.build_poll_batch().unwrap();
        let payload = 1.0f32.to_be_bytes();

        /* deliver out of order, the final one in the middle */
        let mut order: Vec<usize> = (0..batch.len()).collect();
        order.swap(batch.len() - 1, 4);
        for i in order {
            meter.on_response(batch[i].token, &payload);
        }
        assert_eq!(meter.counters().cycles_completed, 1);

        meter.on_response(Token::ConnectProbe, &payload);
        meter.on_response(Token::read(MeterFamily::SDM630, SDM_FREQUENCY, false), &payload);
        assert_eq!(meter.counters().cycles_completed, 1);

        meter.on_response(Token::read(MeterFamily::SDM630, SDM_EXPORT_ACTIVE_ENERGY, true), &payload);
        assert_eq!(meter.counters().cycles_completed, 2);
    }

    #[test]
    fn test_late_response_after_disconnect() {
        let mut meter = connected(MeterFamily::SDM230, 1);
        meter.on_error(BusErrorCode::Timeout);
        meter.on_response(Token::read(MeterFamily::SDM230, SDM_EXPORT_ACTIVE_ENERGY, true), &12.5f32.to_be_bytes());
        assert_eq!(meter.state(), ConnectionState::Disconnected);
        assert_eq!(meter.snapshot().energy_out, 12.5);
        assert_eq!(meter.counters().cycles_completed, 1);
    }

    #[test]
    fn test_short_payload_is_dropped() {
        let mut meter = connected(MeterFamily::SDM230, 1);
        meter.on_response(Token::read(MeterFamily::SDM230, SDM_FREQUENCY, true), &[0x42]);
        assert_eq!(meter.snapshot().frequency, 0.0);
        assert_eq!(meter.counters().cycles_completed, 1);
    }

    #[test]
    fn test_configure_resets() {
        let mut meter = connected(MeterFamily::SDM230, 1);
        meter.on_error(BusErrorCode::Timeout);
        meter.configure(MeterFamily::FINDER, 5);
        assert_eq!(meter.family(), MeterFamily::FINDER);
        assert_eq!(meter.address(), 5);
        assert_eq!(meter.state(), ConnectionState::Disconnected);
        assert_eq!(meter.counters().total_errors, 0);
        assert_eq!(meter.snapshot().voltage[0], 0.0);
    }

    #[test]
    fn test_readout() {
        let meter = connected(MeterFamily::SDM72D, 12);
        let r = meter.readout(2);
        assert_eq!(r.slot, 2);
        assert_eq!(r.address, 12);
        assert_eq!(r.device, "SDM72D");
        assert!(r.connected);
        assert_eq!(r.voltage[0], 230.0);
        assert_eq!(r.last_error, None);
    }
}
