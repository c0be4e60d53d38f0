//! Frame decoding
//!
//! Parses the fixed 20 byte header of a reassembled frame, checks the
//! declared geometry and converts the payload into millimetres.
//!
//! # Frame layout
//! ```text
//! offset  size  field
//!  0      2     frame begin flag (the two start markers)
//!  2      2     frame data length (little endian)
//!  4      1     reserved
//!  5      1     output mode
//!  6      1     sensor temperature
//!  7      1     driver temperature
//!  8      4     exposure time
//! 12      1     error code
//! 13      1     reserved
//! 14      1     rows
//! 15      1     cols
//! 16      2     frame id (little endian)
//! 18      1     ISP version
//! 19      1     reserved
//! 20      n     samples, row major, one byte each
//! 20+n    1     checksum
//! 21+n    1     end marker
//! ```

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::system::config::{HEADER_SIZE, MAX_IMAGE_SIZE, NONLINEAR_DIVISOR, TRAILER_SIZE};

/// Declared frame dimensions, both in `1..=MAX_IMAGE_SIZE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Geometry {
    pub rows: usize,
    pub cols: usize,
}

impl Geometry {
    /// Number of meaningful samples
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reasons a frame is dropped before decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum HeaderError {
    /// Frame shorter than the fixed header
    Truncated { len: usize },
    /// Rows or cols zero or above `MAX_IMAGE_SIZE`
    InvalidGeometry { rows: u8, cols: u8 },
}

/// Fixed header fields
///
/// Only the geometry is used by the pipeline; the rest is kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct FrameHeader {
    pub frame_begin_flag: u16,
    pub frame_data_len: u16,
    pub output_mode: u8,
    pub sensor_temp: u8,
    pub driver_temp: u8,
    pub exposure_time: [u8; 4],
    pub error_code: u8,
    pub rows: u8,
    pub cols: u8,
    pub frame_id: u16,
    pub isp_version: u8,
}

impl FrameHeader {
    /// Parses the header from the first bytes of a frame
    pub fn parse(raw: &[u8]) -> Result<Self, HeaderError> {
        if raw.len() < HEADER_SIZE {
            return Err(HeaderError::Truncated { len: raw.len() });
        }
        Ok(Self {
            frame_begin_flag: u16::from_le_bytes([raw[0], raw[1]]),
            frame_data_len: u16::from_le_bytes([raw[2], raw[3]]),
            output_mode: raw[5],
            sensor_temp: raw[6],
            driver_temp: raw[7],
            exposure_time: [raw[8], raw[9], raw[10], raw[11]],
            error_code: raw[12],
            rows: raw[14],
            cols: raw[15],
            frame_id: u16::from_le_bytes([raw[16], raw[17]]),
            isp_version: raw[18],
        })
    }

    /// Declared dimensions, if within bounds
    pub fn geometry(&self) -> Result<Geometry, HeaderError> {
        let (rows, cols) = (self.rows as usize, self.cols as usize);
        if rows == 0 || cols == 0 || rows > MAX_IMAGE_SIZE || cols > MAX_IMAGE_SIZE {
            return Err(HeaderError::InvalidGeometry {
                rows: self.rows,
                cols: self.cols,
            });
        }
        Ok(Geometry { rows, cols })
    }
}

/// Extracts and checks the geometry of a reassembled frame
pub fn validate_header(raw: &[u8]) -> Result<Geometry, HeaderError> {
    FrameHeader::parse(raw)?.geometry()
}

/// Raw sample to millimetre conversion
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum Calibration {
    /// `raw * unit`, sensor configured with `AT+UNIT=<unit>`
    Linear { unit: f32 },
    /// `(raw / divisor)^2`, inverse of the sensor's `divisor * sqrt(x)` encoding
    InverseSqrt { divisor: f32 },
    /// Raw value passed through
    Identity,
}

impl Calibration {
    pub const fn nonlinear() -> Self {
        Calibration::InverseSqrt {
            divisor: NONLINEAR_DIVISOR,
        }
    }

    pub fn to_millimeters(&self, raw: u8) -> f32 {
        let raw = raw as f32;
        match *self {
            Calibration::Linear { unit } => raw * unit,
            Calibration::InverseSqrt { divisor } => {
                let normalized = raw / divisor;
                normalized * normalized
            }
            Calibration::Identity => raw,
        }
    }

    /// Value of the sensor's `AT+UNIT` setting matching this calibration
    pub fn sensor_unit(&self) -> u8 {
        match *self {
            Calibration::Linear { unit } => unit as u8,
            Calibration::InverseSqrt { .. } | Calibration::Identity => 0,
        }
    }
}

/// Distance image of the current frame
///
/// Only the top-left `rows x cols` cells belong to the latest frame.
#[derive(Clone)]
pub struct DepthGrid {
    cells: [[f32; MAX_IMAGE_SIZE]; MAX_IMAGE_SIZE],
    geometry: Geometry,
}

impl DepthGrid {
    pub const fn new() -> Self {
        Self {
            cells: [[0.0; MAX_IMAGE_SIZE]; MAX_IMAGE_SIZE],
            geometry: Geometry { rows: 0, cols: 0 },
        }
    }

    /// Geometry of the last decoded frame
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Millimetre value at (row, col), `None` outside the grid
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        self.cells.get(row).and_then(|r| r.get(col)).copied()
    }

    /// Meaningful part of one row
    pub fn row(&self, row: usize) -> &[f32] {
        &self.cells[row][..self.geometry.cols]
    }

    /// Meaningful rows, top to bottom
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> + '_ {
        (0..self.geometry.rows).map(move |r| self.row(r))
    }
}

impl Default for DepthGrid {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts validated frames into the depth grid
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    calibration: Calibration,
}

impl FrameDecoder {
    pub const fn new(calibration: Calibration) -> Self {
        Self { calibration }
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    /// Writes the samples of `raw` into `grid`
    ///
    /// Samples are taken from after the header up to the trailer. Samples
    /// that fall outside the declared geometry are skipped.
    pub fn decode(&self, raw: &[u8], geometry: Geometry, grid: &mut DepthGrid) {
        let end = raw.len().saturating_sub(TRAILER_SIZE);
        let payload = raw.get(HEADER_SIZE..end).unwrap_or(&[]);

        for (i, &sample) in payload.iter().enumerate() {
            let row = i / geometry.cols;
            let col = i % geometry.cols;
            if row >= geometry.rows {
                break;
            }
            grid.cells[row][col] = self.calibration.to_millimeters(sample);
        }
        grid.geometry = geometry;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::config::{FRAME_MARKER_1, FRAME_MARKER_2, FRAME_MARKER_END};

    fn raw_frame(rows: u8, cols: u8, samples: &[u8]) -> Vec<u8> {
        let mut raw = vec![0u8; HEADER_SIZE];
        raw[0] = FRAME_MARKER_1;
        raw[1] = FRAME_MARKER_2;
        raw[14] = rows;
        raw[15] = cols;
        raw.extend_from_slice(samples);
        raw.push(0x00); // checksum
        raw.push(FRAME_MARKER_END);
        raw
    }

    #[test]
    fn parses_header_fields() {
        let mut raw = raw_frame(25, 25, &[]);
        raw[2] = 0x71;
        raw[3] = 0x02;
        raw[6] = 31;
        raw[16] = 0x34;
        raw[17] = 0x12;
        let header = FrameHeader::parse(&raw).unwrap();
        assert_eq!(header.frame_begin_flag, 0xFF00);
        assert_eq!(header.frame_data_len, 0x0271);
        assert_eq!(header.sensor_temp, 31);
        assert_eq!(header.frame_id, 0x1234);
        assert_eq!(header.geometry(), Ok(Geometry { rows: 25, cols: 25 }));
    }

    #[test]
    fn rejects_out_of_range_geometry() {
        for (rows, cols) in [(0, 25), (25, 0), (101, 25), (25, 101), (0, 0)] {
            let raw = raw_frame(rows, cols, &[1; 4]);
            assert_eq!(
                validate_header(&raw),
                Err(HeaderError::InvalidGeometry { rows, cols })
            );
        }
        assert!(validate_header(&raw_frame(100, 100, &[])).is_ok());
    }

    #[test]
    fn rejects_truncated_frame() {
        let raw = [FRAME_MARKER_1, FRAME_MARKER_2, FRAME_MARKER_END];
        assert_eq!(validate_header(&raw), Err(HeaderError::Truncated { len: 3 }));
    }

    #[test]
    fn linear_frame_decodes_to_uniform_grid() {
        let raw = raw_frame(25, 25, &[51; 625]);
        let geometry = validate_header(&raw).unwrap();
        let mut grid = DepthGrid::new();
        FrameDecoder::new(Calibration::Linear { unit: 10.0 }).decode(&raw, geometry, &mut grid);

        assert_eq!(grid.geometry(), geometry);
        assert_eq!(grid.rows().count(), 25);
        assert!(grid.rows().all(|row| row.len() == 25 && row.iter().all(|&v| v == 510.0)));
    }

    #[test]
    fn calibration_strategies() {
        assert_eq!(Calibration::Linear { unit: 10.0 }.to_millimeters(51), 510.0);
        let nonlinear = Calibration::InverseSqrt { divisor: 5.1 }.to_millimeters(51);
        assert!((nonlinear - 100.0).abs() < 1e-3);
        assert_eq!(Calibration::Identity.to_millimeters(51), 51.0);
        assert_eq!(Calibration::Linear { unit: 10.0 }.sensor_unit(), 10);
        assert_eq!(Calibration::nonlinear().sensor_unit(), 0);
    }

    #[test]
    fn surplus_samples_are_skipped() {
        let raw = raw_frame(2, 2, &[1, 2, 3, 4, 5, 6]);
        let geometry = validate_header(&raw).unwrap();
        let mut grid = DepthGrid::new();
        FrameDecoder::new(Calibration::Identity).decode(&raw, geometry, &mut grid);

        assert_eq!(grid.row(0), &[1.0, 2.0]);
        assert_eq!(grid.row(1), &[3.0, 4.0]);
        assert_eq!(grid.get(2, 0), Some(0.0));
    }

    #[test]
    fn short_payload_leaves_remaining_cells() {
        let raw = raw_frame(2, 2, &[7, 8, 9]);
        let geometry = validate_header(&raw).unwrap();
        let mut grid = DepthGrid::new();
        FrameDecoder::new(Calibration::Identity).decode(&raw, geometry, &mut grid);

        assert_eq!(grid.row(0), &[7.0, 8.0]);
        assert_eq!(grid.row(1), &[9.0, 0.0]);
    }
}
