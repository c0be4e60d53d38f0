//! Depth sensor configuration
//!
//! The sensor boots at 115200 baud and is set up with a short series of AT
//! commands, each terminated by `\r`. It does not acknowledge reliably, so
//! every command is followed by a fixed settle time.

use core::fmt::Write;

#[cfg(feature = "defmt")]
use defmt::Format;
use embassy_time::{Duration, Timer};
use heapless::String;

use crate::fmt::Dbg;
use crate::system::config::BINNING_FACTOR;
use crate::system::decode::Calibration;

/// Link rate after power-up
pub const BOOT_BAUD: u32 = 115_200;
/// Link rate selected by [`SensorCommand::Baud`] with [`LINK_BAUD_CODE`]
pub const LINK_BAUD: u32 = 230_400;
/// Sensor code for 230400 baud
pub const LINK_BAUD_CODE: u8 = 3;
/// Display mode streaming frames over the link
pub const DISPLAY_MODE: u8 = 7;
/// Requested frame rate
pub const FRAME_RATE: u8 = 19;

/// Wait after power-up before the first command
pub const POWER_UP_DELAY: Duration = Duration::from_millis(1000);
/// Wait after re-clocking the local UART
pub const RECLOCK_SETTLE: Duration = Duration::from_millis(200);

/// Encoded command line
pub type CommandLine = String<16>;

/// AT commands understood by the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum SensorCommand {
    Baud(u8),
    /// Millimetres per raw unit, 0 selects the non-linear encoding
    Unit(u8),
    Display(u8),
    Fps(u8),
    Binning(u8),
}

impl SensorCommand {
    pub fn encode(&self) -> CommandLine {
        let (name, value) = match *self {
            SensorCommand::Baud(v) => ("BAUD", v),
            SensorCommand::Unit(v) => ("UNIT", v),
            SensorCommand::Display(v) => ("DISP", v),
            SensorCommand::Fps(v) => ("FPS", v),
            SensorCommand::Binning(v) => ("BINN", v),
        };
        let mut line = CommandLine::new();
        // longest line is "AT+BINN=255\r"
        let _ = write!(line, "AT+{}={}\r", name, value);
        line
    }

    /// Time the sensor needs before it accepts the next command
    pub fn settle(&self) -> Duration {
        match self {
            SensorCommand::Baud(_) => Duration::from_millis(200),
            SensorCommand::Unit(_) => Duration::from_millis(2000),
            SensorCommand::Display(_) | SensorCommand::Fps(_) | SensorCommand::Binning(_) => {
                Duration::from_millis(5000)
            }
        }
    }
}

/// Commands sent at boot, in order
pub fn setup_sequence(calibration: Calibration) -> [SensorCommand; 5] {
    [
        SensorCommand::Baud(LINK_BAUD_CODE),
        SensorCommand::Unit(calibration.sensor_unit()),
        SensorCommand::Display(DISPLAY_MODE),
        SensorCommand::Fps(FRAME_RATE),
        SensorCommand::Binning(BINNING_FACTOR),
    ]
}

/// Serial link to the sensor
#[allow(async_fn_in_trait)]
pub trait SensorLink {
    type Error: core::fmt::Debug;

    async fn write_all(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Changes the local baud rate
    fn set_baud_rate(&mut self, baud: u32);

    /// Drops whatever was received so far
    fn discard_input(&mut self);
}

/// Runs the boot sequence
///
/// A failed write is logged and the sequence continues; the sensor keeps its
/// previous setting for that command.
pub async fn configure<L: SensorLink>(link: &mut L, calibration: Calibration) {
    Timer::after(POWER_UP_DELAY).await;

    for command in setup_sequence(calibration) {
        let line = command.encode();
        info!("sensor: {}", line.trim_end());
        if let Err(e) = link.write_all(line.as_bytes()).await {
            warn!("sensor command {:?} failed: {:?}", command, Dbg(&e));
        }
        Timer::after(command.settle()).await;

        if let SensorCommand::Baud(_) = command {
            link.set_baud_rate(LINK_BAUD);
            // garbage from the rate change
            link.discard_input();
            Timer::after(RECLOCK_SETTLE).await;
        }
    }
    info!("sensor ready");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_carriage_return_terminated() {
        assert_eq!(SensorCommand::Baud(3).encode().as_str(), "AT+BAUD=3\r");
        assert_eq!(SensorCommand::Binning(4).encode().as_str(), "AT+BINN=4\r");
        assert_eq!(SensorCommand::Fps(19).encode().as_str(), "AT+FPS=19\r");
    }

    #[test]
    fn unit_follows_calibration() {
        let linear = setup_sequence(Calibration::Linear { unit: 10.0 });
        assert_eq!(linear[1], SensorCommand::Unit(10));
        let nonlinear = setup_sequence(Calibration::nonlinear());
        assert_eq!(nonlinear[1].encode().as_str(), "AT+UNIT=0\r");
    }

    #[test]
    fn baud_switch_comes_first() {
        let sequence = setup_sequence(Calibration::Identity);
        assert_eq!(sequence[0], SensorCommand::Baud(LINK_BAUD_CODE));
        assert_eq!(sequence[4], SensorCommand::Binning(BINNING_FACTOR));
    }
}
