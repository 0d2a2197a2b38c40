// Library interface for the IR gauge daemon and client
// Both binaries, the integration tests, and the benchmarks build on this

pub mod calibration;
pub mod commands;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod packet;
pub mod signal;
pub mod transmit;

pub use calibration::CalibrationTable;
pub use commands::{CommandTable, GaugeCommand};
pub use daemon::config::{self, Config};
pub use error::{ClientError, ConfigurationError, ProtocolError, TransmitError, ValidationError};
pub use packet::Packet;
