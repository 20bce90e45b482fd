use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::models::{MeterFamily, MeterReadout};
use super::meter::Meter;

/// Upper bound of meters sharing one bus
pub const MAX_METERS: usize = 4;

/// Shared handle to the configured meters. The scheduler mutates through it,
/// everybody else (display, json api, reporting) only reads.
#[derive(Clone, Default)]
pub struct MeterRoster {
    meters: Arc<RwLock<Vec<Meter>>>,
}

impl MeterRoster {
    /// Build the roster in slot order, entries beyond [`MAX_METERS`] are ignored
    pub fn new(entries: &[(MeterFamily, u8)]) -> Self {
        let meters = entries
            .iter()
            .take(MAX_METERS)
            .map(|(family, address)| Meter::new(*family, *address))
            .collect();
        MeterRoster { meters: Arc::new(RwLock::new(meters)) }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<Meter>> {
        self.meters.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<Meter>> {
        self.meters.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Slot of the meter configured with this bus address
    pub fn slot_of(&self, address: u8) -> Option<usize> {
        self.read().iter().position(|m| m.address() == address)
    }

    pub fn readout(&self, slot: usize) -> Option<MeterReadout> {
        self.read().get(slot).map(|m| m.readout(slot))
    }

    pub fn readouts(&self) -> Vec<MeterReadout> {
        self.read().iter().enumerate().map(|(slot, m)| m.readout(slot)).collect()
    }

    /// Copy of a meter for inspection outside the lock
    pub fn meter(&self, slot: usize) -> Option<Meter> {
        self.read().get(slot).cloned()
    }
}
