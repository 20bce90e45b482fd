use crate::{config::Config, MeterRoster};
use log::{error, info};
#[cfg(feature = "rtu")]
use log::debug;
#[cfg(feature = "rtu")]
use std::time::{Duration, Instant};
pub mod registers;
pub mod decode;
pub mod token;
pub mod meter;
pub mod roster;
pub mod bus;
pub mod scheduler;
#[cfg(feature = "rtu")]
pub mod rtu;

/// How often the scheduler looks for completions and due cycles
#[cfg(feature = "rtu")]
const TICK: Duration = Duration::from_millis(250);

pub struct ModbusManager {
    #[cfg_attr(not(feature = "rtu"), allow(dead_code))]
    config: Config,
    roster: MeterRoster,
}

impl ModbusManager
{
    pub fn new(config: Config) -> Self {
        let roster = MeterRoster::new(&config.roster_entries());
        return ModbusManager {
            config: config,
            roster: roster,
        }
    }

    /// Handle for readers like the display or the json api
    pub fn roster(&self) -> MeterRoster {
        return self.roster.clone();
    }

    #[cfg(feature = "rtu")]
    pub async fn start_thread(&mut self) -> Result<(), bus::BusError> {
        let (bus, completions) = rtu::RtuBus::open(&self.config)?;

        for (slot, m) in self.config.meters.iter().enumerate() {
            info!("Slot {} device {} at address {}", slot, m.family(), m.address);
        }

        let mut scheduler = scheduler::PollScheduler::with_interval(
            self.roster.clone(),
            bus,
            completions,
            self.config.poll_interval(),
        );

        let report_interval = self.config.report_interval();
        let mut last_report = Instant::now();
        let mut interval = tokio::time::interval(TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Modbus activated with {} meters, polling every {} seconds", self.roster.len(), self.config.poll_interval_sec);
        loop {
            interval.tick().await;
            let now = Instant::now();
            if scheduler.tick(now) {
                debug!("Started polling cycle");
            }

            if now.saturating_duration_since(last_report) >= report_interval {
                report(&self.roster);
                last_report = now;
            }
        }
    }
}

/// Log the current readout of every meter as json
pub fn report(roster: &MeterRoster) {
    for readout in roster.readouts() {
        match serde_json::to_string(&readout) {
            Ok(json) => info!("{}", json),
            Err(e) => error!("Failed to serialize readout of slot {}: {:?}", readout.slot, e),
        }
    }
}
