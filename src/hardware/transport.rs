//! The bus transport capability and backend selection.
//!
//! A [`Transport`] moves raw frames to and from the bus. The acquisition controller owns
//! exactly one, hands it to the reader thread for the duration of a session, and gets it
//! back when the reader exits. Implementations are therefore `Send` but never shared.
//!
//! The backend is picked once, from [`BusConfig::backend`], by [`build_transport`]; no code
//! path branches on the backend after that.

use crate::config::BusConfig;
use crate::error::AppResult;
#[cfg(not(feature = "instrument_serial"))]
use crate::error::DaqError;
use crate::frame::RawFrame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::virtual_bus::{VirtualBus, SIMULATED_SENSOR_ID};

/// Capability: frame I/O on a CAN bus.
///
/// # Contract
/// - `open` is idempotent once it has succeeded
/// - `poll` waits at most `timeout` and returns `Ok(None)` when nothing arrived
/// - `poll`/`send` on a closed transport return a `Transport` error
/// - `close` never fails; errors while closing are logged
pub trait Transport: Send {
    /// Connects to the bus.
    fn open(&mut self, config: &BusConfig) -> AppResult<()>;

    /// Whether `open` has succeeded and `close` has not been called since.
    fn is_open(&self) -> bool;

    /// Waits up to `timeout` for the next frame.
    fn poll(&mut self, timeout: Duration) -> AppResult<Option<RawFrame>>;

    /// Writes one frame to the bus.
    fn send(&mut self, frame: &RawFrame) -> AppResult<()>;

    /// Disconnects from the bus.
    fn close(&mut self);

    /// Human-readable description used in log messages.
    fn describe(&self) -> String;
}

/// Available transport backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process bus with a simulated accelerometer node.
    #[default]
    Virtual,
    /// Serial-line CAN adapter speaking the SLCAN (Lawicel) protocol.
    Slcan,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Virtual => write!(f, "virtual"),
            TransportKind::Slcan => write!(f, "slcan"),
        }
    }
}

/// Builds the (still closed) transport selected by `config.backend`.
pub fn build_transport(config: &BusConfig) -> AppResult<Box<dyn Transport>> {
    match config.backend {
        TransportKind::Virtual => {
            let bus = VirtualBus::with_simulated_sensor(SIMULATED_SENSOR_ID);
            Ok(Box::new(bus.transport()))
        }
        TransportKind::Slcan => {
            #[cfg(feature = "instrument_serial")]
            {
                Ok(Box::new(super::slcan::SlcanTransport::new()))
            }
            #[cfg(not(feature = "instrument_serial"))]
            {
                Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_virtual_backend() {
        let config = BusConfig::default();
        let mut transport = build_transport(&config).unwrap();
        assert!(!transport.is_open());
        transport.open(&config).unwrap();
        assert!(transport.is_open());
        assert!(transport.describe().contains("virtual"));
        transport.close();
        assert!(!transport.is_open());
    }

    #[cfg(feature = "instrument_serial")]
    #[test]
    fn builds_slcan_backend_closed() {
        let config = BusConfig {
            backend: TransportKind::Slcan,
            channel: "/dev/does-not-exist".into(),
            ..BusConfig::default()
        };
        let mut transport = build_transport(&config).unwrap();
        assert!(!transport.is_open());
        assert!(transport.open(&config).is_err());
    }

    #[test]
    fn kind_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            backend: TransportKind,
        }
        let w: Wrapper = figment::Figment::from(figment::providers::Serialized::default(
            "backend", "slcan",
        ))
        .extract()
        .unwrap();
        assert_eq!(w.backend, TransportKind::Slcan);
        assert_eq!(TransportKind::Virtual.to_string(), "virtual");
    }
}
