//! Acquisition lifecycle.
//!
//! - [`producer`]: the reader thread, decoding frames from the transport into a FIFO
//! - [`controller`]: the Idle → Configuring → Acquiring → Stopping state machine that owns
//!   the transport, the sample buffer and the derived channels
//! - [`replay`]: offline decoding of `candump` logs through the same decoder
//! - [`service`]: a Tokio actor that schedules drain and refresh ticks for a controller
//!   and serializes requests from cloneable handles

pub mod controller;
pub mod producer;
pub mod replay;
pub mod service;

pub use controller::{
    AcquisitionController, AcquisitionRequest, AcquisitionState, DerivedSnapshot, DrainOutcome,
    SessionInfo, StartOutcome, StopReport,
};
pub use replay::{replay_candump, Replay};
pub use service::{AcquisitionCommand, AcquisitionEvent, AcquisitionHandle, AcquisitionService};
