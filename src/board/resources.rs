//! Hardware Resource Management
//!
//! Splits the RP2350 peripherals into one group per task so every task owns
//! exactly the pins it drives.
//!
//! # Resource Groups
//! - Depth sensor: UART0 link
//! - SD card: SPI1 bus and chip select
//! - Status LED: three PWM slices driving the RGB LED
//! - Mode button: momentary switch cycling the pipeline modes

use assign_resources::assign_resources;
use embassy_rp::bind_interrupts;
use embassy_rp::peripherals::{self, UART0};
use embassy_rp::uart::BufferedInterruptHandler;

assign_resources! {
    /// Serial link to the depth sensor
    depth_sensor: DepthSensorResources {
        uart: UART0,
        tx_pin: PIN_0,
        rx_pin: PIN_1,
    },
    /// SD card on SPI1
    sd_card: SdCardResources {
        spi: SPI1,
        sck_pin: PIN_10,
        mosi_pin: PIN_11,
        miso_pin: PIN_12,
        cs_pin: PIN_13,
    },
    /// PWM-controlled RGB status LED
    status_led: StatusLedResources {
        pwm_red: PWM_SLICE1,
        pwm_green: PWM_SLICE2,
        pwm_blue: PWM_SLICE3,
        red_pin: PIN_2,
        green_pin: PIN_4,
        blue_pin: PIN_6,
    },
    /// Momentary mode switch
    mode_button: ModeButtonResources {
        btn: PIN_16,
    },
}

bind_interrupts!(pub struct Irqs {
    UART0_IRQ => BufferedInterruptHandler<UART0>;
});
