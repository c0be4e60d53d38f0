//! Depth-sensor data path for the robot controller
//!
//! Reassembles frames from the depth sensor's serial stream, decodes them into
//! a millimetre grid and fans every accepted frame out to one consumer picked
//! by the operator's mode switch: a textual preview, the session log on the
//! SD card, or the rolling window feeding the inference task on the second core.
//!
//! Everything in here is hardware independent. The firmware binary wires the
//! pieces to the RP2350 peripherals.

#![cfg_attr(not(test), no_std)]

// must come first, the logging macros are textually scoped
mod fmt;

/// Shared types, channels and state machines
pub mod system;
/// Long-running pipeline loops
pub mod task;
