pub mod depth_sample;
pub mod inference;
pub mod log_writer;
