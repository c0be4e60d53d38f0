//! Pipeline configuration
//!
//! Sizes, markers and timings shared by the acquisition, logging and
//! inference paths. Values match the depth sensor running at binning factor 4
//! (25x25 frames at ~19 fps).

use embassy_time::Duration;

use crate::system::decode::Calibration;
use crate::system::staging::{Rotation, StagingConfig};

/// First start-of-frame marker
pub const FRAME_MARKER_1: u8 = 0x00;
/// Second start-of-frame marker
pub const FRAME_MARKER_2: u8 = 0xFF;
/// End-of-frame marker
pub const FRAME_MARKER_END: u8 = 0xDD;

/// Receive buffer for one frame, markers included
pub const FRAME_BUFFER_SIZE: usize = 12_000;
/// Fixed header at the start of every frame (markers included)
pub const HEADER_SIZE: usize = 20;
/// Checksum byte plus end marker
pub const TRAILER_SIZE: usize = 2;
/// Largest accepted rows/cols value
pub const MAX_IMAGE_SIZE: usize = 100;

/// Pixel binning configured on the sensor
pub const BINNING_FACTOR: u8 = 4;
/// Millimetres per raw unit for the linear calibration
pub const UNIT_VALUE: u8 = 10;
/// Divisor of the sensor's `5.1 * sqrt(x)` encoding
pub const NONLINEAR_DIVISOR: f32 = 5.1;

/// Acquisition cycles during which no further mode change is evaluated
pub const MODE_COOLDOWN_TICKS: u8 = 10;
/// Switch level separating "released" from "pressed"
pub const SWITCH_THRESHOLD: f32 = 0.5;

/// Records the log queue holds before frames get dropped
pub const LOG_QUEUE_DEPTH: usize = 8;
/// Longest formatted CSV line (~3.2 KB for a 25x25 frame)
pub const RECORD_CAPACITY: usize = 4096;
/// Records written between two flushes
pub const FLUSH_EVERY: u16 = 20;
/// Coalescing buffer in front of the SD card (about ten frames)
pub const LOG_BUFFER_SIZE: usize = 32 * 1024;
/// How long a mode exit waits for queue space to post the sync request
pub const SENTINEL_TIMEOUT: Duration = Duration::from_millis(50);

/// Frames kept in the inference window
pub const STAGING_DEPTH: usize = 10;
/// Side length of one pre-processed frame (inference input is side x side)
pub const STAGING_SIDE: usize = 24;
/// Values per pre-processed frame
pub const STAGING_FRAME_LEN: usize = STAGING_SIDE * STAGING_SIDE;
/// Longest wait for the staging lock before the frame is skipped
pub const STAGING_LOCK_TIMEOUT: Duration = Duration::from_millis(2);

/// Nearest distance the preview and the normaliser distinguish
pub const MIN_DEPTH_MM: f32 = 50.0;
/// Farthest distance the preview and the normaliser distinguish
pub const MAX_DEPTH_MM: f32 = 1000.0;

/// Yield between empty polls of the serial source
pub const POLL_YIELD: Duration = Duration::from_millis(1);
/// Interval of the throughput report while logging
pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Session counter file on the card
pub const COUNTER_FILE: &str = "COUNTER.TXT";

/// Runtime-selectable pipeline settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    /// Raw sample to millimetre conversion
    pub calibration: Calibration,
    /// Cycles to ignore the switch after a mode change
    pub cooldown_ticks: u8,
    /// Records between flushes of the session log
    pub flush_every: u16,
    /// Crop, rotation and normalisation of the inference window
    pub staging: StagingConfig,
}

impl PipelineConfig {
    pub const fn new() -> Self {
        Self {
            calibration: Calibration::Linear { unit: UNIT_VALUE as f32 },
            cooldown_ticks: MODE_COOLDOWN_TICKS,
            flush_every: FLUSH_EVERY,
            staging: StagingConfig::new(MIN_DEPTH_MM, MAX_DEPTH_MM, Rotation::Clockwise90),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}
