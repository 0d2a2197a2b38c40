/// IR gauge broadcast daemon and its client
///
/// - `protocol`: newline-delimited JSON control messages and status tokens
/// - `queue`: the daemon-owned command queue with per-entry repeat counters
/// - `scheduler`: periodic retransmission of queued packets
/// - `server`: Unix socket listener dispatching control messages
/// - `client`: reconnecting client session with replace-on-send semantics
/// - `config`: TOML configuration shared by both sides

pub mod client;
pub mod config;
pub mod protocol;
pub mod queue;
pub mod scheduler;
pub mod server;

pub use client::{ClientOptions, ConnectionState, GaugeClient};
pub use protocol::{ControlRequest, ServerNotice};
pub use queue::{CommandQueue, QueueEntry, SharedQueue, Transmission};
pub use scheduler::Scheduler;
pub use server::{DaemonServer, DaemonState};
