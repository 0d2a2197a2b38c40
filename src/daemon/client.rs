//! Gauge client session
//!
//! A [`GaugeClient`] owns one connection to the daemon and one session
//! thread driving it through
//! `Disconnected → Connecting → Connected → Disconnected`. The session only
//! counts as connected once the daemon says `__connected`. Transport
//! failures go back to `Disconnected` and retry after a fixed delay, for as
//! long as the client lives. A `__disconnect` from the daemon is final and
//! leaves the session `Terminated`.
//!
//! Each client keeps at most one outstanding command at the daemon:
//! sending a new value removes the previous packet before adding the new
//! one. The two messages are written back to back but are not a
//! transaction, so a daemon crash in between can leave zero commands queued.

use crate::calibration::CalibrationTable;
use crate::commands::{CommandTable, GaugeCommand};
use crate::daemon::config::{ClientSettings, Config};
use crate::daemon::protocol::{
    encode_jsonl, read_line_bounded, ControlRequest, LineRead, ServerNotice,
};
use crate::error::{ClientError, ConfigurationError, ValidationError};
use crate::packet::{self, Packet};
use crate::signal::ShutdownSignal;
use std::io::{self, BufReader, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Where the session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Socket open, waiting for `__connected`
    Connecting,
    Connected,
    /// Daemon sent `__disconnect`; no further reconnects
    Terminated,
}

/// Everything needed to build a [`GaugeClient`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub socket_path: PathBuf,
    pub settings: ClientSettings,
    pub commands: CommandTable,
    /// Pause between connection attempts
    pub reconnect_delay: Duration,
    /// Sent as `modFreq`; the daemon default applies when `None`
    pub mod_freq: Option<u32>,
    /// Sent as `pwmPin`; the daemon default applies when `None`
    pub pwm_pin: Option<u8>,
}

impl ClientOptions {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            settings: ClientSettings::default(),
            commands: CommandTable::default(),
            reconnect_delay: ClientSettings::default().reconnect_delay(),
            mod_freq: None,
            pwm_pin: None,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigurationError> {
        Ok(Self {
            socket_path: config.resolve_socket_path()?,
            settings: config.client.clone(),
            commands: config.command_table(),
            reconnect_delay: config.client.reconnect_delay(),
            mod_freq: None,
            pwm_pin: None,
        })
    }
}

struct SessionState {
    connection: ConnectionState,
    /// Write half, present while a socket is open
    stream: Option<UnixStream>,
    last_encoded: Packet,
}

struct Shared {
    state: Mutex<SessionState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_connection(&self, connection: ConnectionState) {
        let mut state = self.lock();
        if state.connection != connection {
            debug!("session state {:?} -> {:?}", state.connection, connection);
            state.connection = connection;
        }
        if connection != ConnectionState::Connected && connection != ConnectionState::Connecting {
            state.stream = None;
        }
        self.changed.notify_all();
    }
}

/// Client for a running `irgauged`
pub struct GaugeClient {
    shared: Arc<Shared>,
    shutdown: ShutdownSignal,
    session: Option<JoinHandle<()>>,
    address: u8,
    repeats: u32,
    mod_freq: Option<u32>,
    pwm_pin: Option<u8>,
    calibration: CalibrationTable,
    commands: CommandTable,
}

impl GaugeClient {
    /// Create the client and start connecting straight away
    pub fn connect(options: ClientOptions) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState {
                connection: ConnectionState::Disconnected,
                stream: None,
                last_encoded: Packet::SENTINEL,
            }),
            changed: Condvar::new(),
        });
        let shutdown = ShutdownSignal::new();

        let session = {
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            let socket_path = options.socket_path.clone();
            let delay = options.reconnect_delay;
            thread::Builder::new()
                .name("irgauge-session".to_string())
                .spawn(move || run_session(&socket_path, delay, &shared, &shutdown))?
        };

        Ok(Self {
            shared,
            shutdown,
            session: Some(session),
            address: options.settings.address,
            repeats: options.settings.repeats,
            mod_freq: options.mod_freq,
            pwm_pin: options.pwm_pin,
            calibration: options.settings.calibration,
            commands: options.commands,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Packet this client last queued, or the sentinel if none
    pub fn last_encoded_command(&self) -> Packet {
        self.shared.lock().last_encoded
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Block until connected, terminated, or `timeout` elapses
    pub fn wait_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        match self.wait_for(timeout, |c| {
            matches!(c, ConnectionState::Connected | ConnectionState::Terminated)
        }) {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Terminated => Err(ClientError::Terminated),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Block until the daemon disconnects us or `timeout` elapses
    pub fn wait_terminated(&self, timeout: Duration) -> bool {
        self.wait_for(timeout, |c| c == ConnectionState::Terminated) == ConnectionState::Terminated
    }

    fn wait_for<F>(&self, timeout: Duration, done: F) -> ConnectionState
    where
        F: Fn(ConnectionState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if done(state.connection) {
                return state.connection;
            }
            let now = Instant::now();
            if now >= deadline {
                return state.connection;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Build a packet addressed to this client's gauge
    pub fn encode_command(&self, command: u8, value: i64) -> Result<Packet, ValidationError> {
        Packet::encode(i64::from(command), value, i64::from(self.address))
    }

    /// Show `value` on the gauge, replacing whatever this client sent before
    ///
    /// A calibrated value outside the 12-bit field encodes to the sentinel
    /// and is skipped; a non-finite value is an error.
    pub fn send_value(&self, value: f64) -> Result<(), ClientError> {
        let raw = self.calibration.map(value)?;
        debug!(value, raw, "mapped gauge value");
        let command = self.commands.code(GaugeCommand::SetRawStepperValue);
        let packet = packet::encode_or_sentinel(i64::from(command), raw, i64::from(self.address));
        self.send_encoded_cmd(packet)
    }

    /// Encode and send an arbitrary command with replace semantics
    pub fn send_command(&self, command: u8, value: i64) -> Result<(), ClientError> {
        let packet = self.encode_command(command, value)?;
        self.send_encoded_cmd(packet)
    }

    /// Replace the outstanding command with `packet`
    ///
    /// The sentinel is logged and skipped; the previous command stays queued.
    pub fn send_encoded_cmd(&self, packet: Packet) -> Result<(), ClientError> {
        if packet.is_sentinel() {
            info!("not sending invalid (zero) packet");
            return Ok(());
        }

        let mut state = self.shared.lock();
        ensure_connected(state.connection)?;

        let mut batch = String::new();
        if !state.last_encoded.is_sentinel() {
            batch.push_str(&encode_jsonl(&ControlRequest::RemoveCmd {
                encoded_command: state.last_encoded,
            })?);
        }
        batch.push_str(&encode_jsonl(&self.add_request(packet, None))?);

        write_batch(&mut state, &batch)?;
        debug!(packet = packet.raw(), previous = state.last_encoded.raw(), "command replaced");
        state.last_encoded = packet;
        Ok(())
    }

    /// Queue `packet` without touching the outstanding command
    pub fn queue_add(&self, packet: Packet, tx_count: Option<u32>) -> Result<(), ClientError> {
        self.send_request(&self.add_request(packet, tx_count))
    }

    pub fn queue_remove(&self, packet: Packet) -> Result<(), ClientError> {
        self.send_request(&ControlRequest::RemoveCmd {
            encoded_command: packet,
        })
    }

    pub fn queue_clear(&self) -> Result<(), ClientError> {
        self.send_request(&ControlRequest::ClearCmdQueue)
    }

    /// Ask the daemon to log its queue
    pub fn queue_dump(&self) -> Result<(), ClientError> {
        self.send_request(&ControlRequest::DumpCmdQueue)
    }

    fn add_request(&self, packet: Packet, tx_count: Option<u32>) -> ControlRequest {
        ControlRequest::AddCmd {
            encoded_command: packet,
            tx_count: Some(tx_count.unwrap_or(self.repeats)),
            mod_freq: self.mod_freq,
            pwm_pin: self.pwm_pin,
        }
    }

    fn send_request(&self, request: &ControlRequest) -> Result<(), ClientError> {
        let line = encode_jsonl(request)?;
        let mut state = self.shared.lock();
        ensure_connected(state.connection)?;
        write_batch(&mut state, &line)?;
        debug!(cmd = request.name(), "control message sent");
        Ok(())
    }

    /// Stop the session and close the connection
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.trigger();
        {
            let state = self.shared.lock();
            if let Some(stream) = &state.stream {
                // Unblocks the session thread's read
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        if let Some(handle) = self.session.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GaugeClient {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ensure_connected(connection: ConnectionState) -> Result<(), ClientError> {
    match connection {
        ConnectionState::Connected => Ok(()),
        ConnectionState::Terminated => Err(ClientError::Terminated),
        _ => Err(ClientError::NotConnected),
    }
}

fn write_batch(state: &mut SessionState, batch: &str) -> Result<(), ClientError> {
    let stream = state.stream.as_mut().ok_or(ClientError::NotConnected)?;
    stream.write_all(batch.as_bytes())?;
    stream.flush()?;
    Ok(())
}

enum SessionEnd {
    /// Transport failed or the daemon went away without notice
    Lost(String),
    /// Daemon sent `__disconnect`
    Terminated,
}

/// Connect, serve, reconnect until shutdown or termination
fn run_session(socket_path: &Path, delay: Duration, shared: &Shared, shutdown: &ShutdownSignal) {
    while !shutdown.is_triggered() {
        match serve_connection(socket_path, shared, shutdown) {
            SessionEnd::Terminated => {
                warn!("daemon requested disconnect, session terminated");
                shared.set_connection(ConnectionState::Terminated);
                return;
            }
            SessionEnd::Lost(reason) => {
                shared.set_connection(ConnectionState::Disconnected);
                if shutdown.is_triggered() {
                    break;
                }
                warn!(
                    "connection to {} lost ({}), retrying in {}s",
                    socket_path.display(),
                    reason,
                    delay.as_secs_f64()
                );
            }
        }
        if shutdown.wait_timeout(delay) {
            break;
        }
    }
    shared.set_connection(ConnectionState::Disconnected);
    debug!("session stopped");
}

fn serve_connection(socket_path: &Path, shared: &Shared, shutdown: &ShutdownSignal) -> SessionEnd {
    let stream = match UnixStream::connect(socket_path) {
        Ok(stream) => stream,
        Err(e) => return SessionEnd::Lost(e.to_string()),
    };
    let reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(e) => return SessionEnd::Lost(e.to_string()),
    };

    {
        let mut state = shared.lock();
        state.connection = ConnectionState::Connecting;
        state.stream = Some(stream);
        shared.changed.notify_all();
    }
    // Checked after publishing the stream so a concurrent stop() either
    // sees the stream or we see its flag
    if shutdown.is_triggered() {
        return SessionEnd::Lost("client shutting down".to_string());
    }

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        match read_line_bounded(&mut reader, &mut buf) {
            Ok(LineRead::Eof) => return SessionEnd::Lost("daemon closed the connection".to_string()),
            Ok(LineRead::TooLong(len)) => warn!("dropping {} byte message from daemon", len),
            Ok(LineRead::Line) => match ServerNotice::parse(&String::from_utf8_lossy(&buf)) {
                ServerNotice::Connected => {
                    info!("connected to daemon at {}", socket_path.display());
                    shared.set_connection(ConnectionState::Connected);
                }
                ServerNotice::Disconnect => return SessionEnd::Terminated,
                ServerNotice::Unknown(message) => {
                    if !message.is_empty() {
                        warn!("unknown message from daemon: {}", message);
                    }
                }
            },
            Err(e) => return SessionEnd::Lost(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::parse_request;
    use std::io::BufRead;
    use std::os::unix::net::UnixListener;

    fn options(socket: &Path) -> ClientOptions {
        let mut options = ClientOptions::new(socket);
        options.reconnect_delay = Duration::from_millis(20);
        options
    }

    fn accept_greeted(listener: &UnixListener) -> (UnixStream, BufReader<UnixStream>) {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"__connected\n").unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        (stream, reader)
    }

    fn read_request(reader: &mut BufReader<UnixStream>) -> ControlRequest {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        parse_request(&line).unwrap()
    }

    #[test]
    fn test_not_connected_without_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let client = GaugeClient::connect(options(&dir.path().join("none.sock"))).unwrap();

        assert!(matches!(
            client.wait_connected(Duration::from_millis(50)),
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(client.send_value(50.0), Err(ClientError::NotConnected)));
        assert!(client.last_encoded_command().is_sentinel());
    }

    #[test]
    fn test_connected_only_after_notice() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("d.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let client = GaugeClient::connect(options(&socket)).unwrap();

        let (mut stream, _) = listener.accept().unwrap();
        assert!(client.wait_connected(Duration::from_millis(100)).is_err());
        assert_ne!(client.state(), ConnectionState::Connected);

        stream.write_all(b"__connected\n").unwrap();
        client.wait_connected(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_send_value_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("d.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let client = GaugeClient::connect(options(&socket)).unwrap();
        let (_stream, mut reader) = accept_greeted(&listener);
        client.wait_connected(Duration::from_secs(5)).unwrap();

        client.send_value(50.0).unwrap();
        let first = Packet::encode(8, 310, 1).unwrap();
        assert_eq!(
            read_request(&mut reader),
            ControlRequest::AddCmd {
                encoded_command: first,
                tx_count: Some(14),
                mod_freq: None,
                pwm_pin: None,
            }
        );

        client.send_value(100.0).unwrap();
        assert_eq!(
            read_request(&mut reader),
            ControlRequest::RemoveCmd {
                encoded_command: first
            }
        );
        let second = Packet::encode(8, 620, 1).unwrap();
        assert!(matches!(
            read_request(&mut reader),
            ControlRequest::AddCmd { encoded_command, .. } if encoded_command == second
        ));
        assert_eq!(client.last_encoded_command(), second);
    }

    #[test]
    fn test_sentinel_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("d.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let client = GaugeClient::connect(options(&socket)).unwrap();
        let (_stream, _reader) = accept_greeted(&listener);
        client.wait_connected(Duration::from_secs(5)).unwrap();

        client.send_encoded_cmd(Packet::SENTINEL).unwrap();
        assert!(client.last_encoded_command().is_sentinel());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("d.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let mut opts = options(&socket);
        // Calibrates past the 12-bit value field above 5
        opts.settings.calibration =
            CalibrationTable::new(vec![(0.0, 0.0), (10.0, 9000.0)]).unwrap();
        let client = GaugeClient::connect(opts).unwrap();
        let (_stream, mut reader) = accept_greeted(&listener);
        client.wait_connected(Duration::from_secs(5)).unwrap();

        assert!(matches!(
            client.send_command(8, 5000),
            Err(ClientError::Validation(ValidationError::ValueOutOfRange(5000)))
        ));
        assert!(matches!(
            client.send_value(f64::NAN),
            Err(ClientError::Validation(ValidationError::NonFiniteValue))
        ));
        // Out of range after calibration encodes to the sentinel and is skipped
        client.send_value(10.0).unwrap();
        assert!(client.last_encoded_command().is_sentinel());

        client.send_value(1.0).unwrap();
        assert!(matches!(
            read_request(&mut reader),
            ControlRequest::AddCmd { encoded_command, .. }
                if encoded_command == Packet::encode(8, 900, 1).unwrap()
        ));
    }

    #[test]
    fn test_queue_operations_leave_outstanding_alone() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("d.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let mut opts = options(&socket);
        opts.pwm_pin = Some(12);
        let client = GaugeClient::connect(opts).unwrap();
        let (_stream, mut reader) = accept_greeted(&listener);
        client.wait_connected(Duration::from_secs(5)).unwrap();

        client.queue_add(Packet::from_raw(77), Some(2)).unwrap();
        assert_eq!(
            read_request(&mut reader),
            ControlRequest::AddCmd {
                encoded_command: Packet::from_raw(77),
                tx_count: Some(2),
                mod_freq: None,
                pwm_pin: Some(12),
            }
        );
        client.queue_remove(Packet::from_raw(77)).unwrap();
        assert_eq!(read_request(&mut reader).name(), "removeCmd");
        client.queue_clear().unwrap();
        assert_eq!(read_request(&mut reader), ControlRequest::ClearCmdQueue);
        client.queue_dump().unwrap();
        assert_eq!(read_request(&mut reader), ControlRequest::DumpCmdQueue);

        assert!(client.last_encoded_command().is_sentinel());
    }

    #[test]
    fn test_unknown_notice_keeps_session() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("d.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let client = GaugeClient::connect(options(&socket)).unwrap();
        let (mut stream, _reader) = accept_greeted(&listener);
        client.wait_connected(Duration::from_secs(5)).unwrap();

        stream.write_all(b"hello there\n").unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_disconnect_notice_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("d.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let client = GaugeClient::connect(options(&socket)).unwrap();
        let (mut stream, _reader) = accept_greeted(&listener);
        client.wait_connected(Duration::from_secs(5)).unwrap();

        stream.write_all(b"__disconnect\n").unwrap();
        assert!(client.wait_terminated(Duration::from_secs(5)));
        assert!(matches!(client.send_value(10.0), Err(ClientError::Terminated)));
        assert!(matches!(
            client.wait_connected(Duration::from_millis(10)),
            Err(ClientError::Terminated)
        ));
    }

    #[test]
    fn test_reconnects_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("d.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let client = GaugeClient::connect(options(&socket)).unwrap();

        let (stream, reader) = accept_greeted(&listener);
        client.wait_connected(Duration::from_secs(5)).unwrap();
        drop(reader);
        stream.shutdown(Shutdown::Both).unwrap();
        drop(stream);

        // Next attempt lands on the same listener
        let (_stream, _reader) = accept_greeted(&listener);
        client.wait_connected(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_encode_command_uses_address() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(&dir.path().join("none.sock"));
        opts.settings.address = 170;
        let client = GaugeClient::connect(opts).unwrap();

        let packet = client.encode_command(15, 0).unwrap();
        assert_eq!(packet.decode().address, 170);
        assert!(client.encode_command(16, 0).is_err());
        client.close();
    }
}
