//! Status Indicator Module
//!
//! Fire-and-forget commands for the status LED. Producers call
//! [`Indicator::signal`] and never wait; when the queue is full the command is
//! dropped. The LED task drains the queue into a [`StatusDisplay`], whose
//! [`Arbiter`] decides which command is shown.
//!
//! A clear is ordered with the commands through a generation counter: every
//! queued command carries the number of clears before it, so the LED task
//! never drops a command that was sent after the clear it is catching up on.

use core::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "defmt")]
use defmt::Format;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use crate::system::state::OperatingMode;

/// Commands waiting for the LED task
pub const INDICATOR_QUEUE_DEPTH: usize = 10;

/// Command priority, higher wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum Priority {
    /// Idle animations
    Low,
    /// Drive system status
    Normal,
    /// Pipeline events
    High,
    /// Errors
    Critical,
}

/// Animation of the LED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum Pattern {
    Static,
    /// On/off, `speed_ms` per half period
    Blink,
    /// Fade in and out, `speed_ms` per half period
    Breath,
}

/// 24 bit colour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const RED: Rgb = Rgb::hex(0xFF0000);
    pub const GREEN: Rgb = Rgb::hex(0x00FF00);
    pub const BLUE: Rgb = Rgb::hex(0x0000FF);
    pub const YELLOW: Rgb = Rgb::hex(0xFFFF00);
    pub const PURPLE: Rgb = Rgb::hex(0x400080);
    pub const CYAN: Rgb = Rgb::hex(0x00FFFF);

    pub const fn hex(rgb: u32) -> Self {
        Self {
            r: (rgb >> 16) as u8,
            g: (rgb >> 8) as u8,
            b: rgb as u8,
        }
    }
}

/// One request for the status LED
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct IndicatorCommand {
    pub priority: Priority,
    pub pattern: Pattern,
    pub color: Rgb,
    pub speed_ms: u16,
    /// How long the command is shown, 0 = until replaced
    pub duration_ms: u32,
}

impl IndicatorCommand {
    /// Announcement of a freshly entered mode
    pub fn for_mode(mode: OperatingMode, storage_available: bool) -> Self {
        let (pattern, color, speed_ms, duration_ms) = match mode {
            OperatingMode::Error => (Pattern::Static, Rgb::RED, 0, 2000),
            OperatingMode::Idle => (Pattern::Static, Rgb::GREEN, 0, 2000),
            OperatingMode::Preview if storage_available => (Pattern::Static, Rgb::BLUE, 0, 2000),
            OperatingMode::Preview => (Pattern::Static, Rgb::YELLOW, 0, 2000),
            // blink for as long as the mode lasts
            OperatingMode::Persist => (Pattern::Blink, Rgb::PURPLE, 500, 0),
            OperatingMode::Infer => (Pattern::Blink, Rgb::CYAN, 500, 0),
        };
        Self {
            priority: Priority::High,
            pattern,
            color,
            speed_ms,
            duration_ms,
        }
    }

    /// LED brightness in percent, `elapsed_ms` after the command became active
    pub fn brightness(&self, elapsed_ms: u64) -> u8 {
        let half_period = self.speed_ms.max(1) as u64;
        let phase = elapsed_ms % (2 * half_period);
        match self.pattern {
            Pattern::Static => 100,
            Pattern::Blink if phase < half_period => 100,
            Pattern::Blink => 0,
            Pattern::Breath => {
                // triangle wave, up then down
                let ramp = if phase < half_period {
                    phase
                } else {
                    2 * half_period - phase
                };
                (ramp * 100 / half_period) as u8
            }
        }
    }
}

/// A command as it travels through the queue
///
/// `generation` is the number of [`Indicator::clear`] calls before the
/// command was queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Queued {
    pub command: IndicatorCommand,
    pub generation: u32,
}

/// Queue between the pipeline and the LED task
pub struct Indicator<const N: usize = INDICATOR_QUEUE_DEPTH> {
    queue: Channel<CriticalSectionRawMutex, Queued, N>,
    generation: AtomicU32,
}

impl<const N: usize> Indicator<N> {
    pub const fn new() -> Self {
        Self {
            queue: Channel::new(),
            generation: AtomicU32::new(0),
        }
    }

    /// Queues a command without waiting
    ///
    /// Returns `false` if the queue was full and the command was dropped.
    pub fn signal(
        &self,
        priority: Priority,
        pattern: Pattern,
        color: Rgb,
        speed_ms: u16,
        duration_ms: u32,
    ) -> bool {
        self.send(IndicatorCommand {
            priority,
            pattern,
            color,
            speed_ms,
            duration_ms,
        })
    }

    /// Queues a prepared command without waiting
    pub fn send(&self, command: IndicatorCommand) -> bool {
        let queued = Queued {
            command,
            generation: self.generation(),
        };
        self.queue.try_send(queued).is_ok()
    }

    /// Drops every queued command and tells the LED task to forget the active one
    ///
    /// Commands sent afterwards carry the new generation, so they survive the
    /// LED task catching up with the clear.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        while self.queue.try_receive().is_ok() {}
    }

    /// Number of clears so far
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Waits for the next command
    pub async fn receive(&self) -> Queued {
        self.queue.receive().await
    }

    pub fn try_receive(&self) -> Option<Queued> {
        self.queue.try_receive().ok()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<const N: usize> Default for Indicator<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Picks the command the LED shows
///
/// The active command stays until it expires or a command of at least the
/// same priority arrives.
#[derive(Debug, Default)]
pub struct Arbiter {
    active: Option<(IndicatorCommand, u64)>,
}

impl Arbiter {
    pub const fn new() -> Self {
        Self { active: None }
    }

    /// Offers a command at `now_ms`, returns whether it became active
    pub fn offer(&mut self, command: IndicatorCommand, now_ms: u64) -> bool {
        self.expire(now_ms);
        let accept = match self.active {
            Some((active, _)) => command.priority >= active.priority,
            None => true,
        };
        if accept {
            self.active = Some((command, now_ms));
        }
        accept
    }

    /// Drops the active command once its duration ran out
    ///
    /// Returns `true` if a command expired.
    pub fn expire(&mut self, now_ms: u64) -> bool {
        match self.active {
            Some((command, started))
                if command.duration_ms > 0
                    && now_ms.saturating_sub(started) >= command.duration_ms as u64 =>
            {
                self.active = None;
                true
            }
            _ => false,
        }
    }

    /// Time until the active command expires, `None` if it never does
    pub fn remaining_ms(&self, now_ms: u64) -> Option<u64> {
        match self.active {
            Some((command, started)) if command.duration_ms > 0 => {
                Some((command.duration_ms as u64).saturating_sub(now_ms.saturating_sub(started)))
            }
            _ => None,
        }
    }

    pub fn active(&self) -> Option<IndicatorCommand> {
        self.active.map(|(command, _)| command)
    }

    pub fn reset(&mut self) {
        self.active = None;
    }
}

/// Redraw interval while a pattern animates
pub const FRAME_INTERVAL_MS: u64 = 20;

/// Redraw interval when nothing changes on its own
pub const IDLE_INTERVAL_MS: u64 = 1000;

/// What the LED shows right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct LedOutput {
    pub color: Rgb,
    /// Percent
    pub brightness: u8,
}

/// LED-side state: the arbiter plus the last clear generation seen
#[derive(Debug)]
pub struct StatusDisplay {
    arbiter: Arbiter,
    generation: u32,
    started_ms: u64,
}

impl StatusDisplay {
    pub const fn new(generation: u32) -> Self {
        Self {
            arbiter: Arbiter::new(),
            generation,
            started_ms: 0,
        }
    }

    /// Catches up with clears on the producer side
    ///
    /// Returns `true` if the active command was dropped.
    pub fn sync(&mut self, generation: u32) -> bool {
        if generation == self.generation {
            return false;
        }
        self.generation = generation;
        self.arbiter.reset();
        true
    }

    /// Offers a received command, returns whether it became active
    ///
    /// Commands queued before the last seen clear are ignored. A command
    /// from a newer generation applies that clear first.
    pub fn accept(&mut self, queued: Queued, now_ms: u64) -> bool {
        let age = self.generation.wrapping_sub(queued.generation) as i32;
        if age > 0 {
            return false;
        }
        if age < 0 {
            self.sync(queued.generation);
        }
        let accepted = self.arbiter.offer(queued.command, now_ms);
        if accepted {
            self.started_ms = now_ms;
        }
        accepted
    }

    pub fn active(&self) -> Option<IndicatorCommand> {
        self.arbiter.active()
    }

    /// LED output at `now_ms` and the time until it has to be redrawn
    pub fn render(&mut self, now_ms: u64) -> (Option<LedOutput>, u64) {
        self.arbiter.expire(now_ms);
        let Some(command) = self.arbiter.active() else {
            return (None, IDLE_INTERVAL_MS);
        };
        let output = LedOutput {
            color: command.color,
            brightness: command.brightness(now_ms.saturating_sub(self.started_ms)),
        };
        let expiry = self.arbiter.remaining_ms(now_ms).unwrap_or(IDLE_INTERVAL_MS);
        let wait = match command.pattern {
            Pattern::Static => expiry,
            _ => expiry.min(FRAME_INTERVAL_MS),
        };
        (Some(output), wait)
    }
}
