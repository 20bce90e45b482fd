use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::models::{BusErrorCode, ConnectionState};
use super::bus::{BusRequest, BusSession, Completion};
use super::meter::MeterRequest;
use super::roster::MeterRoster;
use super::token::{strip_slot, with_slot, Token};

/// Default polling cadence
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Drives all meters of a roster over one bus session. Completions are
/// applied on the thread calling [`PollScheduler::tick`], so meter state is
/// only ever changed from here.
pub struct PollScheduler<B: BusSession> {
    roster: MeterRoster,
    bus: B,
    completions: UnboundedReceiver<Completion>,
    interval: Duration,
    last_poll: Option<Instant>,
}

impl<B: BusSession> PollScheduler<B> {
    pub fn new(roster: MeterRoster, bus: B, completions: UnboundedReceiver<Completion>) -> Self {
        Self::with_interval(roster, bus, completions, POLL_INTERVAL)
    }

    pub fn with_interval(
        roster: MeterRoster,
        bus: B,
        completions: UnboundedReceiver<Completion>,
        interval: Duration,
    ) -> Self {
        PollScheduler {
            roster,
            bus,
            completions,
            interval,
            last_poll: None,
        }
    }

    pub fn roster(&self) -> &MeterRoster {
        &self.roster
    }

    /// Apply pending completions and start a new cycle when the interval
    /// elapsed. The very first call always starts a cycle. Returns true if
    /// requests were sent.
    pub fn tick(&mut self, now: Instant) -> bool {
        self.drain();

        if let Some(last) = self.last_poll {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }

        self.poll();
        self.last_poll = Some(now);
        true
    }

    /// Apply everything the bus delivered so far, returns the number of completions
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while let Ok(completion) = self.completions.try_recv() {
            match completion.outcome {
                Ok(payload) => self.on_bus_response(completion.address, completion.token, &payload),
                Err(code) => self.on_bus_error(completion.address, completion.token, code),
            }
            count += 1;
        }
        count
    }

    fn poll(&mut self) {
        let mut requests: Vec<(usize, MeterRequest)> = Vec::new();

        /* Build everything under the lock, hand it to the bus afterwards */
        {
            let mut meters = self.roster.write();
            for (slot, meter) in meters.iter_mut().enumerate() {
                match meter.state() {
                    ConnectionState::Connected => match meter.build_poll_batch() {
                        Ok(batch) => requests.extend(batch.into_iter().map(|r| (slot, r))),
                        Err(e) => warn!("Skipping slot {}: {}", slot, e),
                    },
                    /* the probe token is the same every time, only one may be on the bus */
                    ConnectionState::Probing => debug!("Slot {} still waits for its probe", slot),
                    ConnectionState::Disconnected => requests.push((slot, meter.build_connect_request())),
                }
            }
        }

        let mut unsent_probes: Vec<usize> = Vec::new();
        for (slot, req) in requests {
            let bus_req = BusRequest {
                address: req.address,
                function: req.kind.into(),
                register: req.register,
                count: req.words,
                token: with_slot(req.token.to_wire(), slot),
            };
            debug!(
                "Enqueue address {} register {:#06x} count {} token {:08X}",
                bus_req.address, bus_req.register, bus_req.count, bus_req.token
            );
            if let Err(e) = self.bus.enqueue(bus_req) {
                warn!("Error creating request for address {} register {:#06x}: {}", req.address, req.register, e);
                if req.token == Token::ConnectProbe {
                    unsent_probes.push(slot);
                }
            }
        }

        if !unsent_probes.is_empty() {
            let mut meters = self.roster.write();
            for slot in unsent_probes {
                if let Some(meter) = meters.get_mut(slot) {
                    meter.abort_probe();
                }
            }
        }
    }

    fn resolve(address: u8, wire: u32) -> Option<Token> {
        let (_, wire) = strip_slot(wire);
        match Token::from_wire(wire) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("Dropping completion from address {}: {}", address, e);
                None
            }
        }
    }

    /// Route a response to the meter owning `address`
    pub fn on_bus_response(&mut self, address: u8, token: u32, payload: &[u8]) {
        debug!("Response: address={} token={:08X} length={}", address, token, payload.len());
        let Some(token) = Self::resolve(address, token) else {
            return;
        };

        let mut meters = self.roster.write();
        match meters.iter_mut().find(|m| m.address() == address) {
            Some(meter) => meter.on_response(token, payload),
            None => warn!("No meter configured at address {}, dropping response", address),
        }
    }

    /// Route a bus failure to the meter owning `address`
    pub fn on_bus_error(&mut self, address: u8, token: u32, code: BusErrorCode) {
        debug!("Error response: address={} token={:08X} {}", address, token, code);
        if Self::resolve(address, token).is_none() {
            return;
        }

        let mut meters = self.roster.write();
        match meters.iter_mut().find(|m| m.address() == address) {
            Some(meter) => meter.on_error(code),
            None => warn!("No meter configured at address {}, dropping error {}", address, code),
        }
    }
}
