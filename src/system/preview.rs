//! Text preview of a depth frame
//!
//! Near is blank, far is dense; the host-side frame reader maps the ramp index
//! straight to relative depth. Rows are rendered one at a time into a small
//! line buffer so the console path never needs a frame-sized string.

use heapless::String;

use crate::system::config::{MAX_DEPTH_MM, MAX_IMAGE_SIZE, MIN_DEPTH_MM};
use crate::system::decode::DepthGrid;

/// Printed before the first row
pub const FRAME_START: &str = "FRAME_START";
/// Printed after the last row
pub const FRAME_END: &str = "FRAME_END";

/// Characters from near to far
const RAMP: &[u8] = b" .:-=+*#%@";

/// One rendered grid row
pub type PreviewLine = String<MAX_IMAGE_SIZE>;

/// Character for one distance
pub fn glyph(mm: f32) -> char {
    let span = MAX_DEPTH_MM - MIN_DEPTH_MM;
    let far = (mm.clamp(MIN_DEPTH_MM, MAX_DEPTH_MM) - MIN_DEPTH_MM) / span;
    let last = RAMP.len() - 1;
    RAMP[((far * last as f32) as usize).min(last)] as char
}

/// Renders one grid row
pub fn render_row(values: &[f32]) -> PreviewLine {
    let mut line = PreviewLine::new();
    for &mm in values.iter().take(MAX_IMAGE_SIZE) {
        // capacity equals the widest row
        let _ = line.push(glyph(mm));
    }
    line
}

/// Rendered rows of the current frame, top to bottom
pub fn render(grid: &DepthGrid) -> impl Iterator<Item = PreviewLine> + '_ {
    grid.rows().map(render_row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_ends() {
        assert_eq!(glyph(0.0), ' ');
        assert_eq!(glyph(MIN_DEPTH_MM), ' ');
        assert_eq!(glyph(MAX_DEPTH_MM), '@');
        assert_eq!(glyph(5000.0), '@');
    }

    #[test]
    fn farther_is_denser() {
        let near = RAMP.iter().position(|&c| c as char == glyph(200.0));
        let far = RAMP.iter().position(|&c| c as char == glyph(800.0));
        assert!(far > near);
    }

    #[test]
    fn row_has_one_glyph_per_cell() {
        let line = render_row(&[50.0, 1000.0, 50.0]);
        assert_eq!(line.as_str(), " @ ");
    }
}
