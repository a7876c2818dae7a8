//! Sample storage, signal processing and export.
pub mod filter_engine;
pub mod iir_filter;
pub mod sample_buffer;
pub mod storage;
