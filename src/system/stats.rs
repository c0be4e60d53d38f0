//! Pipeline counters and the throughput report

use core::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "defmt")]
use defmt::Format;
use embassy_time::{Duration, Instant};

use crate::system::config::REPORT_INTERVAL;

/// Event counters shared by the sampling loop and the log writer
pub struct PipelineStats {
    frames_accepted: AtomicU32,
    framing_overflows: AtomicU32,
    geometry_rejects: AtomicU32,
    dropped_frames: AtomicU32,
    write_failures: AtomicU32,
}

/// Copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct StatsSnapshot {
    pub frames_accepted: u32,
    pub framing_overflows: u32,
    pub geometry_rejects: u32,
    /// Frames lost on the way to the session log (queue full or write failed)
    pub dropped_frames: u32,
    pub write_failures: u32,
}

impl PipelineStats {
    pub const fn new() -> Self {
        Self {
            frames_accepted: AtomicU32::new(0),
            framing_overflows: AtomicU32::new(0),
            geometry_rejects: AtomicU32::new(0),
            dropped_frames: AtomicU32::new(0),
            write_failures: AtomicU32::new(0),
        }
    }

    pub fn frame_accepted(&self) {
        self.frames_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn framing_overflow(&self) {
        self.framing_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn geometry_rejected(&self) {
        self.geometry_rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// A failed storage call that lost `frames` records
    pub fn write_failed(&self, frames: u32) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
        self.dropped_frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn dropped_frames(&self) -> u32 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_accepted: self.frames_accepted.load(Ordering::Relaxed),
            framing_overflows: self.framing_overflows.load(Ordering::Relaxed),
            geometry_rejects: self.geometry_rejects.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Time spent in each stage of one acquisition cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleTiming {
    pub acquire: Duration,
    pub decode: Duration,
    pub route: Duration,
}

/// Per-second summary of the sampling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct ThroughputReport {
    pub frames_per_sec: u32,
    pub mean_acquire_us: u32,
    pub mean_decode_us: u32,
    pub mean_route_us: u32,
}

/// Accumulates cycle timings until a report is due
#[derive(Debug, Clone)]
pub struct ThroughputWindow {
    started: Instant,
    interval: Duration,
    frames: u32,
    acquire_us: u64,
    decode_us: u64,
    route_us: u64,
}

impl ThroughputWindow {
    pub fn new(now: Instant) -> Self {
        Self::with_interval(now, REPORT_INTERVAL)
    }

    pub fn with_interval(now: Instant, interval: Duration) -> Self {
        Self {
            started: now,
            interval,
            frames: 0,
            acquire_us: 0,
            decode_us: 0,
            route_us: 0,
        }
    }

    pub fn record(&mut self, timing: CycleTiming) {
        self.frames += 1;
        self.acquire_us += timing.acquire.as_micros();
        self.decode_us += timing.decode.as_micros();
        self.route_us += timing.route.as_micros();
    }

    /// Returns the report once the interval has passed and starts a new window
    pub fn poll(&mut self, now: Instant) -> Option<ThroughputReport> {
        let elapsed = now.checked_duration_since(self.started)?;
        if elapsed < self.interval {
            return None;
        }

        let frames = self.frames.max(1) as u64;
        let elapsed_ms = elapsed.as_millis().max(1);
        let report = ThroughputReport {
            frames_per_sec: (self.frames as u64 * 1000 / elapsed_ms) as u32,
            mean_acquire_us: (self.acquire_us / frames) as u32,
            mean_decode_us: (self.decode_us / frames) as u32,
            mean_route_us: (self.route_us / frames) as u32,
        };
        *self = Self::with_interval(now, self.interval);
        Some(report)
    }
}
