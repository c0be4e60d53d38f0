//! Depth sensor UART
//!
//! Interrupt-driven buffered UART. The receive ring is drained byte by byte by
//! the sampling loop; a frame at binning factor 4 is ~650 bytes, so the ring
//! holds a few frames of backlog that get discarded after each acquisition.

use depth_pipeline::system::framing::ByteSource;
use depth_pipeline::system::sensor_setup::{SensorLink, BOOT_BAUD};
use embassy_rp::uart::{self, BufferedUart};
use embedded_io::{Read, ReadReady, Write};
use static_cell::StaticCell;

use super::resources::{DepthSensorResources, Irqs};

/// Receive ring size
const RX_BUFFER_SIZE: usize = 4096;
/// Transmit ring size, only AT commands go out
const TX_BUFFER_SIZE: usize = 64;

static RX_BUFFER: StaticCell<[u8; RX_BUFFER_SIZE]> = StaticCell::new();
static TX_BUFFER: StaticCell<[u8; TX_BUFFER_SIZE]> = StaticCell::new();

pub struct SensorUart {
    uart: BufferedUart,
}

impl SensorUart {
    pub fn new(r: DepthSensorResources) -> Self {
        let mut config = uart::Config::default();
        config.baudrate = BOOT_BAUD;
        let tx_buffer = TX_BUFFER.init([0; TX_BUFFER_SIZE]);
        let rx_buffer = RX_BUFFER.init([0; RX_BUFFER_SIZE]);
        let uart = BufferedUart::new(r.uart, r.tx_pin, r.rx_pin, Irqs, tx_buffer, rx_buffer, config);
        Self { uart }
    }
}

impl ByteSource for SensorUart {
    fn poll_byte(&mut self) -> Option<u8> {
        if !self.uart.read_ready().unwrap_or(false) {
            return None;
        }
        let mut byte = [0u8; 1];
        match self.uart.read(&mut byte) {
            Ok(1) => Some(byte[0]),
            _ => None,
        }
    }

    fn discard_pending(&mut self) {
        let mut scratch = [0u8; 64];
        while self.uart.read_ready().unwrap_or(false) {
            if !matches!(self.uart.read(&mut scratch), Ok(n) if n > 0) {
                break;
            }
        }
    }
}

impl SensorLink for SensorUart {
    type Error = uart::Error;

    async fn write_all(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        Write::write_all(&mut self.uart, data)?;
        Write::flush(&mut self.uart)
    }

    fn set_baud_rate(&mut self, baud: u32) {
        self.uart.set_baudrate(baud);
    }

    fn discard_input(&mut self) {
        self.discard_pending();
    }
}
