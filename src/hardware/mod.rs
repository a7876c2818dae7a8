//! Bus transports.
//!
//! - `transport` - the [`Transport`] capability and backend selection
//! - `virtual_bus` - in-process bus with a simulated accelerometer node
//! - `slcan` - SLCAN line codec and the serial-port transport (`instrument_serial`)

pub mod slcan;
pub mod transport;
pub mod virtual_bus;

pub use slcan::slcan_bitrate_code;
#[cfg(feature = "instrument_serial")]
pub use slcan::{list_ports, SlcanTransport};
pub use transport::{build_transport, Transport, TransportKind};
pub use virtual_bus::{VirtualBus, VirtualTransport, SIMULATED_SENSOR_ID};
