//! Session log records
//!
//! One CSV line per accepted frame:
//!
//! ```text
//! frame_seq,[steering_millis,throttle_millis,]cols,rows,sample,sample,...\n
//! ```
//!
//! Only integers are formatted on this path; control values are stored as
//! thousandths and samples are truncated to whole millimetres.

use core::fmt::Write;

#[cfg(feature = "defmt")]
use defmt::Format;
use heapless::String;

use crate::system::config::RECORD_CAPACITY;
use crate::system::decode::DepthGrid;

/// Formatted CSV line
pub type FrameLine = String<RECORD_CAPACITY>;

/// Item on the log queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistRecord {
    /// One frame, newline terminated
    Frame(FrameLine),
    /// Zero-length marker: flush and sync, no data
    Sentinel,
}

impl PersistRecord {
    pub fn is_sentinel(&self) -> bool {
        matches!(self, PersistRecord::Sentinel)
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PersistRecord::Frame(line) => line.as_bytes(),
            PersistRecord::Sentinel => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Steering and throttle at the time of the frame, nominally -1..=1
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Controls {
    pub steering: f32,
    pub throttle: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum RecordError {
    /// Line does not fit into `RECORD_CAPACITY`
    TooLong,
}

impl From<core::fmt::Error> for RecordError {
    fn from(_: core::fmt::Error) -> Self {
        RecordError::TooLong
    }
}

/// Formats the current grid as one log line
pub fn format_frame(
    frame_seq: u32,
    controls: Option<Controls>,
    grid: &DepthGrid,
) -> Result<PersistRecord, RecordError> {
    let geometry = grid.geometry();
    let mut line = FrameLine::new();

    write!(line, "{}", frame_seq)?;
    if let Some(controls) = controls {
        write!(line, ",{},{}", to_millis(controls.steering), to_millis(controls.throttle))?;
    }
    write!(line, ",{},{}", geometry.cols, geometry.rows)?;
    for row in grid.rows() {
        for &value in row {
            write!(line, ",{}", value as i32)?;
        }
    }
    line.push('\n').map_err(|_| RecordError::TooLong)?;

    Ok(PersistRecord::Frame(line))
}

fn to_millis(value: f32) -> i32 {
    (value * 1000.0) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::config::HEADER_SIZE;
    use crate::system::decode::{validate_header, Calibration, FrameDecoder};

    fn grid(rows: u8, cols: u8, sample: u8) -> DepthGrid {
        let mut raw = vec![0u8; HEADER_SIZE];
        raw[14] = rows;
        raw[15] = cols;
        raw.extend(std::iter::repeat(sample).take(rows as usize * cols as usize));
        raw.extend_from_slice(&[0, 0xDD]);
        let geometry = validate_header(&raw).unwrap();
        let mut grid = DepthGrid::new();
        FrameDecoder::new(Calibration::Linear { unit: 10.0 }).decode(&raw, geometry, &mut grid);
        grid
    }

    #[test]
    fn line_without_controls() {
        let record = format_frame(7, None, &grid(2, 3, 51)).unwrap();
        assert_eq!(record.as_bytes(), b"7,3,2,510,510,510,510,510,510\n");
    }

    #[test]
    fn controls_are_written_as_thousandths() {
        let controls = Controls {
            steering: -0.25,
            throttle: 1.234,
        };
        let record = format_frame(0, Some(controls), &grid(1, 1, 3)).unwrap();
        assert_eq!(record.as_bytes(), b"0,-250,1234,1,1,30\n");
    }

    #[test]
    fn typical_frame_fits() {
        let record = format_frame(u32::MAX, Some(Controls { steering: -1.0, throttle: -1.0 }), &grid(25, 25, 255));
        assert!(record.is_ok_and(|r| r.len() < RECORD_CAPACITY));
    }

    #[test]
    fn oversized_frame_is_refused() {
        assert_eq!(format_frame(1, None, &grid(100, 100, 255)), Err(RecordError::TooLong));
    }

    #[test]
    fn sentinel_is_zero_length() {
        assert!(PersistRecord::Sentinel.is_empty());
        assert!(PersistRecord::Sentinel.is_sentinel());
    }
}
