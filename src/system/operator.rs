//! Operator input cells
//!
//! The RC decoder (or the board's mode button) publishes the latest switch
//! level and stick positions here; the sampling loop reads them once per
//! cycle. The switch level is an `f32` bit pattern in an atomic; steering and
//! throttle share one critical-section cell so a sample never pairs values
//! from two different publishes.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "defmt")]
use defmt::Format;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::system::record::Controls;

/// One read of all operator inputs
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct OperatorSample {
    /// Mode switch level in `0..=1`
    pub switch: f32,
    /// Steering and throttle, `None` until a receiver publishes them
    pub controls: Option<Controls>,
}

/// Operator input shared between tasks
pub struct OperatorFeed {
    switch: AtomicU32,
    controls: Mutex<CriticalSectionRawMutex, Cell<Option<Controls>>>,
}

impl OperatorFeed {
    pub const fn new() -> Self {
        Self {
            // 0.0f32 is all zero bits
            switch: AtomicU32::new(0),
            controls: Mutex::new(Cell::new(None)),
        }
    }

    /// Publishes the switch level, clamped to `0..=1`
    pub fn publish_switch(&self, level: f32) {
        let level = if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) };
        self.switch.store(level.to_bits(), Ordering::Relaxed);
    }

    /// Publishes steering and throttle
    pub fn publish_controls(&self, controls: Controls) {
        self.controls.lock(|cell| cell.set(Some(controls)));
    }

    /// Stops recording controls, e.g. after a receiver signal loss
    pub fn withdraw_controls(&self) {
        self.controls.lock(|cell| cell.set(None));
    }

    pub fn sample(&self) -> OperatorSample {
        OperatorSample {
            switch: f32::from_bits(self.switch.load(Ordering::Relaxed)),
            controls: self.controls.lock(|cell| cell.get()),
        }
    }
}

impl Default for OperatorFeed {
    fn default() -> Self {
        Self::new()
    }
}
