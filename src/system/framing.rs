//! Frame reassembly
//!
//! Byte-at-a-time state machine that cuts complete sensor frames out of the
//! serial stream:
//!
//! ```text
//! WaitMarker1 --0x00--> WaitMarker2 --0xFF--> Collecting --0xDD--> (frame) WaitMarker1
//!                            |                     |
//!                            +--other--> WaitMarker1  +--buffer full--> (overflow) WaitMarker1
//! ```
//!
//! A mismatch while waiting for the second marker always returns to
//! `WaitMarker1`, even when the offending byte is itself a first marker.

#[cfg(feature = "defmt")]
use defmt::Format;

use crate::system::config::{FRAME_BUFFER_SIZE, FRAME_MARKER_1, FRAME_MARKER_2, FRAME_MARKER_END};

/// Non-blocking source of serial bytes
pub trait ByteSource {
    /// Returns the next byte if one is already buffered
    fn poll_byte(&mut self) -> Option<u8>;

    /// Drops everything buffered so far
    fn discard_pending(&mut self);
}

/// Reassembler states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum FramingState {
    WaitMarker1,
    WaitMarker2,
    Collecting,
}

/// Result of feeding one byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum Feed {
    /// Byte consumed, no complete frame yet
    Pending,
    /// End marker seen, the frame is available through [`FrameReassembler::frame`]
    Ready,
    /// Buffer filled without an end marker, partial frame discarded
    Overflow,
}

/// Extracts complete frames from the sensor's byte stream
///
/// `N` is the receive buffer size; frames longer than that are dropped.
pub struct FrameReassembler<const N: usize = FRAME_BUFFER_SIZE> {
    buffer: [u8; N],
    index: usize,
    frame_len: usize,
    state: FramingState,
    overflows: u32,
}

impl<const N: usize> FrameReassembler<N> {
    pub const fn new() -> Self {
        Self {
            buffer: [0; N],
            index: 0,
            frame_len: 0,
            state: FramingState::WaitMarker1,
            overflows: 0,
        }
    }

    /// Consumes a single byte
    pub fn feed(&mut self, byte: u8) -> Feed {
        match self.state {
            FramingState::WaitMarker1 => {
                if byte == FRAME_MARKER_1 {
                    self.index = 0;
                    self.push(byte);
                    self.state = FramingState::WaitMarker2;
                }
                Feed::Pending
            }
            FramingState::WaitMarker2 => {
                if byte == FRAME_MARKER_2 {
                    self.push(byte);
                    self.state = FramingState::Collecting;
                } else {
                    self.state = FramingState::WaitMarker1;
                }
                Feed::Pending
            }
            FramingState::Collecting => {
                self.push(byte);
                if byte == FRAME_MARKER_END {
                    self.frame_len = self.index;
                    self.index = 0;
                    self.state = FramingState::WaitMarker1;
                    Feed::Ready
                } else if self.index >= N {
                    warn!("frame buffer overflow, dropping partial frame");
                    self.overflows = self.overflows.wrapping_add(1);
                    self.index = 0;
                    self.state = FramingState::WaitMarker1;
                    Feed::Overflow
                } else {
                    Feed::Pending
                }
            }
        }
    }

    /// Reads at most one byte from `source`
    ///
    /// Returns `true` once a complete frame is available. Never blocks.
    pub fn poll<S: ByteSource>(&mut self, source: &mut S) -> bool {
        match source.poll_byte() {
            Some(byte) => self.feed(byte) == Feed::Ready,
            None => false,
        }
    }

    /// Forces the state machine back to `WaitMarker1`
    ///
    /// The last completed frame stays readable.
    pub fn reset(&mut self) {
        self.index = 0;
        self.state = FramingState::WaitMarker1;
    }

    /// Last completed frame, markers included
    pub fn frame(&self) -> &[u8] {
        &self.buffer[..self.frame_len]
    }

    pub fn state(&self) -> FramingState {
        self.state
    }

    /// Frames dropped because they outgrew the buffer
    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    fn push(&mut self, byte: u8) {
        // index < N is guaranteed: Collecting resets as soon as index reaches N
        self.buffer[self.index] = byte;
        self.index += 1;
    }
}

impl<const N: usize> Default for FrameReassembler<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Bytes(VecDeque<u8>);

    impl ByteSource for Bytes {
        fn poll_byte(&mut self) -> Option<u8> {
            self.0.pop_front()
        }

        fn discard_pending(&mut self) {
            self.0.clear();
        }
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![FRAME_MARKER_1, FRAME_MARKER_2];
        bytes.extend_from_slice(payload);
        bytes.push(FRAME_MARKER_END);
        bytes
    }

    #[test]
    fn emits_one_frame_from_noisy_stream() {
        let wanted = frame(&[1, 2, 3, 4]);
        let mut stream = vec![0x11, 0x22, 0xDD, 0x7F];
        stream.extend_from_slice(&wanted);
        stream.extend_from_slice(&[0x33, 0x44]);

        let mut reassembler = FrameReassembler::<64>::new();
        let mut ready = 0;
        for byte in stream {
            if reassembler.feed(byte) == Feed::Ready {
                ready += 1;
                assert_eq!(reassembler.frame(), wanted.as_slice());
            }
        }
        assert_eq!(ready, 1);
    }

    #[test]
    fn second_marker_mismatch_resets_without_retesting_byte() {
        let mut reassembler = FrameReassembler::<64>::new();
        assert_eq!(reassembler.feed(FRAME_MARKER_1), Feed::Pending);
        assert_eq!(reassembler.state(), FramingState::WaitMarker2);
        // another 0x00 is not treated as a fresh first marker
        assert_eq!(reassembler.feed(FRAME_MARKER_1), Feed::Pending);
        assert_eq!(reassembler.state(), FramingState::WaitMarker1);
        // so 0xFF now is just noise
        reassembler.feed(FRAME_MARKER_2);
        assert_eq!(reassembler.state(), FramingState::WaitMarker1);
    }

    #[test]
    fn overflow_is_reported_once_and_next_frame_survives() {
        let mut reassembler = FrameReassembler::<16>::new();
        let mut stream = vec![FRAME_MARKER_1, FRAME_MARKER_2];
        stream.extend(std::iter::repeat(0x42).take(40));
        let wanted = frame(&[9, 8, 7]);
        stream.extend_from_slice(&wanted);

        let mut overflows = 0;
        let mut frames = Vec::new();
        for byte in stream {
            match reassembler.feed(byte) {
                Feed::Overflow => overflows += 1,
                Feed::Ready => frames.push(reassembler.frame().to_vec()),
                Feed::Pending => {}
            }
        }
        assert_eq!(overflows, 1);
        assert_eq!(reassembler.overflows(), 1);
        assert_eq!(frames, vec![wanted]);
    }

    #[test]
    fn poll_consumes_one_byte_per_call() {
        let mut source = Bytes(frame(&[5]).into_iter().collect());
        let mut reassembler = FrameReassembler::<16>::new();
        let mut calls = 0;
        while !reassembler.poll(&mut source) {
            calls += 1;
            assert!(calls < 10);
        }
        assert_eq!(calls, 3);
        assert!(!reassembler.poll(&mut source));
    }

    #[test]
    fn reset_mid_frame_discards_partial_bytes() {
        let mut reassembler = FrameReassembler::<32>::new();
        for byte in [FRAME_MARKER_1, FRAME_MARKER_2, 1, 2] {
            reassembler.feed(byte);
        }
        reassembler.reset();
        assert_eq!(reassembler.state(), FramingState::WaitMarker1);
        let wanted = frame(&[3]);
        let ready = wanted.iter().filter(|b| reassembler.feed(**b) == Feed::Ready).count();
        assert_eq!(ready, 1);
        assert_eq!(reassembler.frame(), wanted.as_slice());
    }
}
