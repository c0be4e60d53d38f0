//! Operating Mode Management
//!
//! The operator cycles the pipeline through its modes with a momentary switch:
//!
//! ```text
//! Idle -> Preview -> Persist -> Infer -> Idle
//! Error -> Preview -> Error        (no SD card)
//! ```
//!
//! A mode change is evaluated only on a rising edge of the switch (previous
//! sample below 0.5, current sample at or above) and only when the cooldown
//! from the previous change has run out. Side effects belong to the
//! transition, not to the mode: [`ModeController::update`] hands out a
//! [`Transition`] exactly once per accepted edge and the caller performs what
//! it asks for.

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::system::config::SWITCH_THRESHOLD;

/// Pipeline operating modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum OperatingMode {
    /// Durable storage unavailable
    /// - frames are decoded but go nowhere
    /// - next edge offers the preview
    Error,
    /// Frames are decoded but go nowhere
    Idle,
    /// Every frame is rendered as text on the console
    Preview,
    /// Every frame is queued for the session log
    Persist,
    /// Every frame is staged for the inference task
    Infer,
}

impl OperatingMode {
    /// Starting mode for a session
    pub fn initial(storage_available: bool) -> Self {
        if storage_available {
            OperatingMode::Idle
        } else {
            OperatingMode::Error
        }
    }

    /// Mode selected by the next switch edge
    pub fn next(self, storage_available: bool) -> Self {
        match self {
            OperatingMode::Error | OperatingMode::Idle => OperatingMode::Preview,
            OperatingMode::Preview if storage_available => OperatingMode::Persist,
            OperatingMode::Preview => OperatingMode::Error,
            OperatingMode::Persist => OperatingMode::Infer,
            OperatingMode::Infer => OperatingMode::Idle,
        }
    }
}

/// An accepted mode change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Transition {
    pub from: OperatingMode,
    pub to: OperatingMode,
}

impl Transition {
    /// The log writer must flush and sync before logging stops
    pub fn syncs_log(&self) -> bool {
        self.from == OperatingMode::Persist && self.to != OperatingMode::Persist
    }

    /// The inference window must be emptied
    pub fn resets_staging(&self) -> bool {
        self.from == OperatingMode::Infer && self.to != OperatingMode::Infer
    }
}

/// Debounced mode state machine
#[derive(Debug, Clone)]
pub struct ModeController {
    mode: OperatingMode,
    previous_switch: f32,
    cooldown: u8,
    cooldown_ticks: u8,
}

impl ModeController {
    pub const fn new(initial: OperatingMode, cooldown_ticks: u8) -> Self {
        Self {
            mode: initial,
            previous_switch: 0.0,
            cooldown: 0,
            cooldown_ticks,
        }
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    /// Remaining cycles before another edge is honoured
    pub fn cooldown(&self) -> u8 {
        self.cooldown
    }

    /// Feeds one switch sample
    ///
    /// Returns the transition when this sample is an accepted rising edge.
    pub fn update(&mut self, switch: f32, storage_available: bool) -> Option<Transition> {
        let rising = self.previous_switch < SWITCH_THRESHOLD && switch >= SWITCH_THRESHOLD;
        self.previous_switch = switch;

        if !rising || self.cooldown > 0 {
            return None;
        }

        let transition = Transition {
            from: self.mode,
            to: self.mode.next(storage_available),
        };
        self.mode = transition.to;
        self.cooldown = self.cooldown_ticks;
        Some(transition)
    }

    /// Ends an acquisition cycle
    pub fn tick(&mut self) {
        self.cooldown = self.cooldown.saturating_sub(1);
    }
}
