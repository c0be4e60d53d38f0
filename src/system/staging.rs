//! Inference staging buffer
//!
//! Rolling window of the last `D` frames in the layout the inference engine
//! expects (`S x S`, normalised to `0..=1`). The sampling loop pushes into the
//! ring; the inference task on the other core works on a snapshot copy so the
//! engine never runs under a lock.
//!
//! Both locks are only held for copies, and the sampling loop never waits
//! longer than `STAGING_LOCK_TIMEOUT` for the ring. At most one snapshot is
//! outstanding: a new one is refused until the inference task calls
//! [`FrameRingBuffer::complete`] with its sequence number.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[cfg(feature = "defmt")]
use defmt::Format;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::with_timeout;

use crate::system::config::{MAX_DEPTH_MM, MIN_DEPTH_MM, STAGING_DEPTH, STAGING_LOCK_TIMEOUT, STAGING_SIDE};
use crate::system::decode::DepthGrid;

/// The staging window used by the firmware
pub type StagingBuffer = FrameRingBuffer<STAGING_DEPTH, STAGING_SIDE>;

/// One pre-processed frame
pub type StagedFrame<const S: usize> = [[f32; S]; S];

/// Orientation fix between the sensor and the model's training data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum Rotation {
    None,
    Clockwise90,
    Half,
    CounterClockwise90,
}

/// Crop, rotate and normalise step applied to every staged frame
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct StagingConfig {
    pub min_mm: f32,
    pub max_mm: f32,
    pub rotation: Rotation,
}

impl StagingConfig {
    pub const fn new(min_mm: f32, max_mm: f32, rotation: Rotation) -> Self {
        Self {
            min_mm,
            max_mm,
            rotation,
        }
    }

    /// Centre-crops `grid` to `S x S`, rotates it and maps distances to `0..=1`
    ///
    /// Cells the source grid does not cover are 0.
    pub fn apply<const S: usize>(&self, grid: &DepthGrid, out: &mut StagedFrame<S>) {
        let geometry = grid.geometry();
        let row_offset = (geometry.rows as isize - S as isize) / 2;
        let col_offset = (geometry.cols as isize - S as isize) / 2;

        for (r, out_row) in out.iter_mut().enumerate() {
            for (c, cell) in out_row.iter_mut().enumerate() {
                let (cr, cc) = match self.rotation {
                    Rotation::None => (r, c),
                    Rotation::Clockwise90 => (S - 1 - c, r),
                    Rotation::Half => (S - 1 - r, S - 1 - c),
                    Rotation::CounterClockwise90 => (c, S - 1 - r),
                };
                let sr = cr as isize + row_offset;
                let sc = cc as isize + col_offset;
                *cell = if sr >= 0
                    && sc >= 0
                    && (sr as usize) < geometry.rows
                    && (sc as usize) < geometry.cols
                {
                    grid.get(sr as usize, sc as usize).map_or(0.0, |mm| self.normalize(mm))
                } else {
                    0.0
                };
            }
        }
    }

    pub fn normalize(&self, mm: f32) -> f32 {
        let span = self.max_mm - self.min_mm;
        if span <= 0.0 {
            return 0.0;
        }
        (mm.clamp(self.min_mm, self.max_mm) - self.min_mm) / span
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self::new(MIN_DEPTH_MM, MAX_DEPTH_MM, Rotation::Clockwise90)
    }
}

struct Ring<const D: usize, const S: usize> {
    frames: [StagedFrame<S>; D],
    write_cursor: usize,
    total_received: u32,
}

/// Copy of the window handed to the inference task
pub struct Snapshot<const D: usize, const S: usize> {
    frames: [StagedFrame<S>; D],
    write_cursor: usize,
    sequence: u32,
}

impl<const D: usize, const S: usize> Snapshot<D, S> {
    /// Frames from oldest to newest
    pub fn ordered(&self) -> impl Iterator<Item = &StagedFrame<S>> + '_ {
        (0..D).map(move |i| &self.frames[(self.write_cursor + i) % D])
    }

    /// Snapshots taken since start-up, this one included
    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Counters of the staging path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct StagingStats {
    /// Frames skipped because the ring lock was not free in time
    pub lock_timeouts: u32,
    /// Snapshot requests refused while one was still pending
    pub refused_pending: u32,
}

/// Mutex-guarded ring of pre-processed frames shared with the inference task
pub struct FrameRingBuffer<const D: usize, const S: usize> {
    ring: Mutex<CriticalSectionRawMutex, Ring<D, S>>,
    snapshot: Mutex<CriticalSectionRawMutex, Snapshot<D, S>>,
    /// Sequence number of the outstanding snapshot, 0 if none
    outstanding: AtomicU32,
    /// A reset that could not take the ring lock in time
    reset_requested: AtomicBool,
    snapshot_ready: Signal<CriticalSectionRawMutex, ()>,
    config: StagingConfig,
    lock_timeouts: AtomicU32,
    refused_pending: AtomicU32,
}

impl<const D: usize, const S: usize> FrameRingBuffer<D, S> {
    pub const fn new(config: StagingConfig) -> Self {
        Self {
            ring: Mutex::new(Ring {
                frames: [[[0.0; S]; S]; D],
                write_cursor: 0,
                total_received: 0,
            }),
            snapshot: Mutex::new(Snapshot {
                frames: [[[0.0; S]; S]; D],
                write_cursor: 0,
                sequence: 0,
            }),
            outstanding: AtomicU32::new(0),
            reset_requested: AtomicBool::new(false),
            snapshot_ready: Signal::new(),
            config,
            lock_timeouts: AtomicU32::new(0),
            refused_pending: AtomicU32::new(0),
        }
    }

    /// Number of frames in a full window
    pub const fn capacity(&self) -> usize {
        D
    }

    /// Pre-processes `grid` into the next slot
    ///
    /// Waits at most `STAGING_LOCK_TIMEOUT` for the lock; on timeout the frame
    /// is skipped and `false` returned.
    pub async fn push(&self, grid: &DepthGrid) -> bool {
        let Ok(mut ring) = with_timeout(STAGING_LOCK_TIMEOUT, self.ring.lock()).await else {
            self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
            debug!("staging lock busy, frame skipped");
            return false;
        };
        self.settle(&mut ring);

        let slot = ring.write_cursor;
        self.config.apply(grid, &mut ring.frames[slot]);
        ring.write_cursor = (slot + 1) % D;
        ring.total_received = ring.total_received.saturating_add(1);
        true
    }

    /// Copies the window for the inference task
    ///
    /// Never waits. Returns `false` while fewer than `D` frames were pushed,
    /// while the previous snapshot is still pending, or if a lock is taken.
    pub fn request_snapshot(&self) -> bool {
        if self.is_pending() {
            self.refused_pending.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let Ok(mut ring) = self.ring.try_lock() else {
            return false;
        };
        self.settle(&mut ring);
        if (ring.total_received as usize) < D {
            return false;
        }
        let Ok(mut snapshot) = self.snapshot.try_lock() else {
            return false;
        };

        snapshot.frames = ring.frames;
        snapshot.write_cursor = ring.write_cursor;
        // 0 means nothing outstanding
        snapshot.sequence = snapshot.sequence.wrapping_add(1).max(1);
        self.outstanding.store(snapshot.sequence, Ordering::Release);
        self.snapshot_ready.signal(());
        true
    }

    /// Waits until a snapshot is pending
    pub async fn wait_snapshot(&self) {
        while !self.is_pending() {
            self.snapshot_ready.wait().await;
        }
    }

    /// Runs `f` on the pending snapshot under the snapshot lock
    ///
    /// Returns `None` if nothing is pending (e.g. the window was reset).
    /// Keep `f` to copying; the engine must run after this returns.
    pub async fn read_snapshot<R>(&self, f: impl FnOnce(&Snapshot<D, S>) -> R) -> Option<R> {
        let snapshot = self.snapshot.lock().await;
        let outstanding = self.outstanding.load(Ordering::Acquire);
        if outstanding == 0 || outstanding != snapshot.sequence {
            return None;
        }
        Some(f(&snapshot))
    }

    /// Releases snapshot `sequence` so the next one can be taken
    ///
    /// Returns `false` if that snapshot was withdrawn by a reset in the
    /// meantime; a newer pending snapshot is left alone.
    pub fn complete(&self, sequence: u32) -> bool {
        sequence != 0
            && self
                .outstanding
                .compare_exchange(sequence, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub fn is_pending(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) != 0
    }

    /// Empties the window
    ///
    /// Drops a pending snapshot at once. The ring is zeroed and its counters
    /// reset if its lock is free within `STAGING_LOCK_TIMEOUT`, otherwise by
    /// the next call that takes the lock. Returns whether the ring was
    /// cleared right away.
    pub async fn reset(&self) -> bool {
        self.outstanding.store(0, Ordering::Release);
        self.snapshot_ready.reset();
        self.reset_requested.store(true, Ordering::Release);

        let Ok(mut ring) = with_timeout(STAGING_LOCK_TIMEOUT, self.ring.lock()).await else {
            self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
            warn!("staging lock busy, reset deferred");
            return false;
        };
        self.settle(&mut ring);
        true
    }

    /// Frames pushed since start-up or the last reset
    pub async fn received(&self) -> u32 {
        let mut ring = self.ring.lock().await;
        self.settle(&mut ring);
        ring.total_received
    }

    /// Applies a deferred reset, `ring` must be the locked ring
    fn settle(&self, ring: &mut Ring<D, S>) {
        if !self.reset_requested.swap(false, Ordering::AcqRel) {
            return;
        }
        for frame in ring.frames.iter_mut() {
            for row in frame.iter_mut() {
                row.fill(0.0);
            }
        }
        ring.write_cursor = 0;
        ring.total_received = 0;
    }

    pub fn stats(&self) -> StagingStats {
        StagingStats {
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            refused_pending: self.refused_pending.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::config::HEADER_SIZE;
    use crate::system::decode::{validate_header, Calibration, FrameDecoder};
    use embassy_futures::block_on;

    fn grid_from(rows: u8, cols: u8, samples: &[u8]) -> DepthGrid {
        let mut raw = vec![0u8; HEADER_SIZE];
        raw[14] = rows;
        raw[15] = cols;
        raw.extend_from_slice(samples);
        raw.extend_from_slice(&[0, 0xDD]);
        let geometry = validate_header(&raw).unwrap();
        let mut grid = DepthGrid::new();
        FrameDecoder::new(Calibration::Identity).decode(&raw, geometry, &mut grid);
        grid
    }

    fn uniform(sample: u8) -> DepthGrid {
        grid_from(4, 4, &[sample; 16])
    }

    fn buffer() -> FrameRingBuffer<3, 2> {
        FrameRingBuffer::new(StagingConfig::new(0.0, 100.0, Rotation::None))
    }

    #[test]
    fn transform_crops_centre_and_rotates() {
        // 4x4 grid with distinct values, crop to the centre 2x2
        let samples: Vec<u8> = (0..16).map(|v| v * 10).collect();
        let grid = grid_from(4, 4, &samples);
        let plain = StagingConfig::new(0.0, 150.0, Rotation::None);
        let mut out = [[0.0; 2]; 2];
        plain.apply(&grid, &mut out);
        // centre cells are 50, 60 / 90, 100
        assert_eq!(out, [[50.0 / 150.0, 60.0 / 150.0], [90.0 / 150.0, 100.0 / 150.0]]);

        let rotated = StagingConfig::new(0.0, 150.0, Rotation::Clockwise90);
        rotated.apply(&grid, &mut out);
        assert_eq!(out, [[90.0 / 150.0, 50.0 / 150.0], [100.0 / 150.0, 60.0 / 150.0]]);
    }

    #[test]
    fn transform_pads_small_frames_and_clamps() {
        let grid = grid_from(1, 1, &[200]);
        let transform = StagingConfig::new(50.0, 150.0, Rotation::None);
        let mut out = [[9.0; 3]; 3];
        transform.apply(&grid, &mut out);
        assert_eq!(out, [[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]]);
        assert_eq!(transform.normalize(10.0), 0.0);
    }

    #[test]
    fn snapshot_needs_a_full_window() {
        let staging = buffer();
        block_on(async {
            for _ in 0..2 {
                assert!(staging.push(&uniform(10)).await);
                assert!(!staging.request_snapshot());
            }
            assert!(staging.push(&uniform(10)).await);
        });
        assert!(staging.request_snapshot());
        assert!(staging.is_pending());
    }

    #[test]
    fn one_snapshot_outstanding_at_a_time() {
        let staging = buffer();
        block_on(async {
            for _ in 0..3 {
                staging.push(&uniform(10)).await;
            }
        });
        assert!(staging.request_snapshot());
        assert!(!staging.request_snapshot());
        assert!(!staging.request_snapshot());
        assert_eq!(staging.stats().refused_pending, 2);

        assert!(staging.complete(1));
        assert!(staging.request_snapshot());
    }

    #[test]
    fn snapshot_is_ordered_oldest_first() {
        let staging = buffer();
        let seen = block_on(async {
            for value in [10, 20, 30, 40, 50] {
                staging.push(&uniform(value)).await;
            }
            assert!(staging.request_snapshot());
            staging.wait_snapshot().await;
            staging
                .read_snapshot(|snapshot| snapshot.ordered().map(|frame| frame[0][0]).collect::<Vec<_>>())
                .await
        });
        assert_eq!(seen, Some(vec![0.3, 0.4, 0.5]));
    }

    #[test]
    fn reset_empties_window_and_pending_flag() {
        let staging = buffer();
        block_on(async {
            for _ in 0..3 {
                staging.push(&uniform(80)).await;
            }
            assert!(staging.request_snapshot());
            staging.reset().await;
            assert!(!staging.is_pending());
            assert_eq!(staging.received().await, 0);
            assert!(staging.read_snapshot(|_| ()).await.is_none());
            assert!(!staging.request_snapshot());

            for _ in 0..3 {
                staging.push(&uniform(20)).await;
            }
            assert!(staging.request_snapshot());
            let first = staging.read_snapshot(|s| s.ordered().next().map(|f| f[1][1])).await;
            assert_eq!(first, Some(Some(0.2)));
        });
    }

    #[test]
    fn stale_completion_keeps_newer_snapshot() {
        let staging = buffer();
        block_on(async {
            for _ in 0..3 {
                staging.push(&uniform(10)).await;
            }
            assert!(staging.request_snapshot());
            let first = staging.read_snapshot(|s| s.sequence()).await;
            assert_eq!(first, Some(1));

            // window reset and refilled while the engine runs on snapshot 1
            staging.reset().await;
            for _ in 0..3 {
                staging.push(&uniform(30)).await;
            }
            assert!(staging.request_snapshot());

            assert!(!staging.complete(1));
            assert!(staging.is_pending());
            assert_eq!(staging.read_snapshot(|s| s.sequence()).await, Some(2));
            assert!(staging.complete(2));
            assert!(!staging.is_pending());
        });
    }

    #[test]
    fn reset_with_busy_lock_is_deferred() {
        let staging = buffer();
        block_on(async {
            for _ in 0..3 {
                staging.push(&uniform(10)).await;
            }
            assert!(staging.request_snapshot());

            let guard = staging.ring.lock().await;
            assert!(!staging.reset().await);
            assert!(!staging.is_pending());
            drop(guard);

            assert_eq!(staging.received().await, 0);
            assert!(!staging.request_snapshot());
            assert!(staging.push(&uniform(10)).await);
            assert_eq!(staging.received().await, 1);
        });
        assert_eq!(staging.stats().lock_timeouts, 1);
    }

    #[test]
    fn busy_lock_skips_push() {
        let staging = buffer();
        block_on(async {
            let guard = staging.ring.lock().await;
            assert!(!staging.push(&uniform(10)).await);
            drop(guard);
            assert!(staging.push(&uniform(10)).await);
        });
        assert_eq!(staging.stats().lock_timeouts, 1);
    }
}
