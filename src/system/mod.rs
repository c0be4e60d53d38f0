//! Shared pipeline components
pub mod config;
pub mod decode;
pub mod framing;
pub mod indicator;
pub mod operator;
pub mod preview;
pub mod record;
pub mod sensor_setup;
pub mod staging;
pub mod state;
pub mod stats;
pub mod storage;
