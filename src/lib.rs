//! # Tilt DAQ Core Library
//!
//! This crate is the core library of the `tilt-daq` application: acquisition from a CAN
//! tri-axial accelerometer, derivation of inclination and dynamic acceleration channels,
//! and CSV export. The binary (`main.rs`) is a thin command-line frontend over it.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: The acquisition state machine, the bus reader thread and the Tokio
//!   service that schedules draining and derived-channel refreshes.
//! - **`command`**: Encoding of the sampling-interval command and of manual frames.
//! - **`config`**: Loading and validating settings from TOML files and environment
//!   variables. See `config::Settings`.
//! - **`data`**: The sample buffer, the Butterworth filters, the derived-channel engine and
//!   CSV storage.
//! - **`error`**: The `DaqError` enum shared by every module.
//! - **`frame`**: Raw CAN frames, the decoded `Sample`, and candump log parsing.
//! - **`hardware`**: The `Transport` capability with a virtual bus and SLCAN adapters.
//! - **`tracing_setup`**: Structured logging initialization.
//! - **`validation`**: Small validation helpers for user-supplied values.

pub mod acquisition;
pub mod command;
pub mod config;
pub mod data;
pub mod error;
pub mod frame;
pub mod hardware;
pub mod tracing_setup;
pub mod validation;
