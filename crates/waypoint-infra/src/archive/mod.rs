//! Archive format implementations.

pub mod zip_sink;
