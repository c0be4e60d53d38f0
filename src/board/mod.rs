//! RP2350 board glue
pub mod mode_button;
pub mod resources;
pub mod sd_volume;
pub mod sensor_uart;
pub mod status_led;
