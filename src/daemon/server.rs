use crate::daemon::config::DaemonSettings;
use crate::daemon::protocol::{
    parse_request, read_line_bounded, ControlRequest, LineRead, ServerNotice, MAX_LINE_LEN,
};
use crate::daemon::queue::{lock_queue, CommandQueue, SharedQueue};
use crate::daemon::scheduler::Scheduler;
use crate::error::ProtocolError;
use crate::signal::ShutdownSignal;
use crate::transmit::Transmitter;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, ErrorKind, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Maximum concurrently connected clients
const MAX_CLIENTS: usize = 64;

/// How long the accept loop idles when no client is waiting
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Identifier for a connected client
pub type ClientId = u64;

/// PID file that sits beside the socket
pub fn pid_path(socket_path: &Path) -> PathBuf {
    socket_path.with_extension("pid")
}

/// State every connection handler shares: the queue and the defaults
/// applied to `addCmd` fields a client leaves out
#[derive(Clone)]
pub struct DaemonState {
    queue: SharedQueue,
    settings: DaemonSettings,
}

impl DaemonState {
    pub fn new(queue: SharedQueue, settings: DaemonSettings) -> Self {
        Self { queue, settings }
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    /// Apply one control message to the queue
    pub fn handle_request(&self, request: ControlRequest) {
        match request {
            ControlRequest::AddCmd {
                encoded_command,
                tx_count,
                mod_freq,
                pwm_pin,
            } => {
                let repeats = tx_count.unwrap_or(self.settings.default_repeats);
                let freq = mod_freq.unwrap_or(self.settings.modulation_frequency);
                let pin = pwm_pin.unwrap_or(self.settings.pwm_pin);
                info!("addCmd({}, {}, {}, {})", encoded_command, repeats, freq, pin);
                lock_queue(&self.queue).add(encoded_command, repeats, freq, pin);
            }
            ControlRequest::RemoveCmd { encoded_command } => {
                info!("removeCmd received for command {}", encoded_command);
                lock_queue(&self.queue).remove(encoded_command);
            }
            ControlRequest::ClearCmdQueue => {
                info!("clearCmdQueue received");
                lock_queue(&self.queue).clear();
            }
            ControlRequest::DumpCmdQueue => {
                info!("dumpCmdQueue received");
                lock_queue(&self.queue).dump();
            }
        }
    }

    /// Parse and apply one line; protocol errors are logged and dropped
    pub fn handle_line(&self, line: &str) -> Result<(), ProtocolError> {
        if line.trim().is_empty() {
            return Ok(());
        }
        match parse_request(line) {
            Ok(request) => {
                self.handle_request(request);
                Ok(())
            }
            Err(ProtocolError::UnknownCommand(cmd)) => {
                warn!(line = line.trim(), "client called with unknown command '{}'", cmd);
                Err(ProtocolError::UnknownCommand(cmd))
            }
            Err(e) => {
                warn!(line = line.trim(), "dropping control message: {}", e);
                Err(e)
            }
        }
    }
}

/// Write halves of connected clients, used to broadcast `__disconnect`
#[derive(Clone, Default)]
struct ClientRegistry {
    streams: Arc<Mutex<HashMap<ClientId, UnixStream>>>,
    next_id: Arc<AtomicU64>,
}

impl ClientRegistry {
    fn len(&self) -> usize {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn insert(&self, stream: UnixStream) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, stream);
        id
    }

    fn remove(&self, id: ClientId) {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Tell every client we are going away and close its socket
    fn disconnect_all(&self) {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let notice = ServerNotice::Disconnect.to_line();
        for (id, stream) in streams.iter_mut() {
            if let Err(e) = stream.write_all(notice.as_bytes()) {
                debug!(client = id, "could not send disconnect: {}", e);
            }
            let _ = stream.shutdown(Shutdown::Both);
        }
        streams.clear();
    }
}

/// Broadcast daemon: control socket listener plus retransmission scheduler
pub struct DaemonServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    state: DaemonState,
    transmitter: Arc<dyn Transmitter>,
    clients: ClientRegistry,
    shutdown: ShutdownSignal,
    tick_interval: Duration,
    stagger: Duration,
}

impl DaemonServer {
    /// Create a new daemon server with an empty queue
    pub fn new(
        socket_path: PathBuf,
        settings: DaemonSettings,
        transmitter: Arc<dyn Transmitter>,
    ) -> Self {
        Self {
            socket_path,
            listener: None,
            tick_interval: settings.tick_interval(),
            stagger: settings.stagger(),
            state: DaemonState::new(CommandQueue::new().shared(), settings),
            transmitter,
            clients: ClientRegistry::default(),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Override the scheduler period and frame spacing
    pub fn with_timing(mut self, tick_interval: Duration, stagger: Duration) -> Self {
        self.tick_interval = tick_interval;
        self.stagger = stagger;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn queue(&self) -> SharedQueue {
        self.state.queue.clone()
    }

    /// Handle for stopping the daemon from another thread
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Start the daemon: signals, socket, PID file, then serve until stopped
    pub fn start(&mut self) -> Result<()> {
        self.shutdown.register_signals()?;
        self.bind_socket()?;
        self.write_pid_file()?;

        info!("irgauge daemon started on {}", self.socket_path.display());

        self.serve()
    }

    /// Run the scheduler and accept loop until shutdown, then clean up
    pub fn serve(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind_socket()?;
        }

        let scheduler = Scheduler::new(
            self.state.queue.clone(),
            self.transmitter.clone(),
            self.tick_interval,
            self.stagger,
            self.shutdown.clone(),
        );
        let scheduler_handle = scheduler.spawn()?;

        let result = self.accept_loop();

        self.shutdown.trigger();
        if scheduler_handle.join().is_err() {
            error!("scheduler thread panicked");
        }

        info!("Shutting down daemon...");
        self.shutdown_gracefully()?;

        result
    }

    /// Bind the Unix socket, clearing a stale one first
    pub fn bind_socket(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            if UnixStream::connect(&self.socket_path).is_ok() {
                return Err(anyhow!(
                    "daemon already running at {}",
                    self.socket_path.display()
                ));
            }
            warn!("removing stale socket {}", self.socket_path.display());
            fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        // Set socket permissions to 0600 (owner read/write only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.socket_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.socket_path, perms)?;
        }

        self.listener = Some(listener);
        Ok(())
    }

    fn accept_loop(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("Socket not bound"))?;

        // Non-blocking so the loop can notice shutdown
        listener.set_nonblocking(true)?;

        while !self.shutdown.is_triggered() {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    stream.set_nonblocking(false)?;

                    if self.clients.len() >= MAX_CLIENTS {
                        warn!("maximum of {} clients reached, rejecting connection", MAX_CLIENTS);
                        continue;
                    }

                    if let Err(e) = self.accept_connection(stream) {
                        warn!("Error accepting connection: {}", e);
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    self.shutdown.wait_timeout(ACCEPT_POLL);
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    self.shutdown.wait_timeout(Duration::from_millis(100));
                }
            }
        }

        self.listener = Some(listener);
        Ok(())
    }

    /// Greet the client and hand the connection to its own thread
    fn accept_connection(&self, stream: UnixStream) -> Result<()> {
        let mut writer = stream.try_clone()?;
        writer.write_all(ServerNotice::Connected.to_line().as_bytes())?;

        let id = self.clients.insert(writer);
        info!(client = id, "client connected");

        let state = self.state.clone();
        let clients = self.clients.clone();
        let spawned = thread::Builder::new()
            .name(format!("irgauge-client-{}", id))
            .spawn(move || {
                serve_client(stream, id, &state);
                clients.remove(id);
            });

        if let Err(e) = spawned {
            self.clients.remove(id);
            return Err(anyhow!("failed to start client thread: {}", e));
        }
        Ok(())
    }

    fn write_pid_file(&self) -> Result<()> {
        fs::write(pid_path(&self.socket_path), std::process::id().to_string())?;
        Ok(())
    }

    fn remove_pid_file(&self) {
        let path = pid_path(&self.socket_path);
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    /// Notify clients, then remove the socket and PID file
    fn shutdown_gracefully(&mut self) -> Result<()> {
        self.clients.disconnect_all();
        self.listener = None;
        self.remove_pid_file();

        if self.socket_path.exists() {
            fs::remove_file(&self.socket_path)?;
        }
        Ok(())
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        self.shutdown.trigger();
        // Only clean up files this instance created
        if self.listener.is_some() {
            self.remove_pid_file();
            let _ = fs::remove_file(&self.socket_path);
        }
    }
}

/// Read control lines until the client hangs up
///
/// Queued commands outlive the connection.
fn serve_client(stream: UnixStream, id: ClientId, state: &DaemonState) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        match read_line_bounded(&mut reader, &mut buf) {
            Ok(LineRead::Eof) => {
                info!(client = id, "session end");
                return;
            }
            Ok(LineRead::Line) => match std::str::from_utf8(&buf) {
                // Errors are already logged; the session carries on
                Ok(line) => {
                    let _ = state.handle_line(line);
                }
                Err(_) => warn!(client = id, "dropping non UTF-8 control message"),
            },
            Ok(LineRead::TooLong(len)) => {
                let e = ProtocolError::Malformed(format!(
                    "line of {} bytes exceeds {} byte limit",
                    len, MAX_LINE_LEN
                ));
                warn!(client = id, "dropping control message: {}", e);
            }
            Err(e) => {
                debug!(client = id, "session read error: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    fn state() -> DaemonState {
        DaemonState::new(CommandQueue::new().shared(), DaemonSettings::default())
    }

    #[test]
    fn test_add_applies_defaults() {
        let state = state();
        state
            .handle_line(r#"{"cmd":"addCmd","encodedCommand":1234}"#)
            .unwrap();

        let snapshot = lock_queue(state.queue()).snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].packet, Packet::from_raw(1234));
        assert_eq!(snapshot[0].remaining_repeats, 14);
        assert_eq!(snapshot[0].mod_frequency, 33_000);
        assert_eq!(snapshot[0].pwm_pin, 18);
    }

    #[test]
    fn test_add_honours_explicit_fields() {
        let state = state();
        state
            .handle_line(r#"{"cmd":"addCmd","encodedCommand":5,"txCount":2,"modFreq":38000,"pwmPin":12}"#)
            .unwrap();

        let entry = lock_queue(state.queue()).snapshot()[0].clone();
        assert_eq!(entry.remaining_repeats, 2);
        assert_eq!(entry.mod_frequency, 38_000);
        assert_eq!(entry.pwm_pin, 12);
    }

    #[test]
    fn test_add_zero_packet_rejected() {
        let state = state();
        state.handle_line(r#"{"cmd":"addCmd","encodedCommand":0}"#).unwrap();
        assert!(lock_queue(state.queue()).is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let state = state();
        for raw in [1, 2, 3] {
            state.handle_request(ControlRequest::AddCmd {
                encoded_command: Packet::from_raw(raw),
                tx_count: None,
                mod_freq: None,
                pwm_pin: None,
            });
        }
        state.handle_line(r#"{"cmd":"removeCmd","encodedCommand":2}"#).unwrap();
        assert!(!lock_queue(state.queue()).contains(Packet::from_raw(2)));
        assert_eq!(lock_queue(state.queue()).len(), 2);

        state.handle_line(r#"{"cmd":"dumpCmdQueue"}"#).unwrap();
        state.handle_line(r#"{"cmd":"clearCmdQueue"}"#).unwrap();
        assert!(lock_queue(state.queue()).is_empty());
    }

    #[test]
    fn test_unknown_and_malformed_lines_are_dropped() {
        let state = state();
        assert!(matches!(
            state.handle_line(r#"{"cmd":"reboot"}"#),
            Err(ProtocolError::UnknownCommand(_))
        ));
        assert!(matches!(
            state.handle_line("{{{"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(state.handle_line("   \n").is_ok());
        assert!(lock_queue(state.queue()).is_empty());
    }

    #[test]
    fn test_pid_path() {
        assert_eq!(
            pid_path(Path::new("/tmp/irgauge/daemon.sock")),
            PathBuf::from("/tmp/irgauge/daemon.pid")
        );
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");

        // A bound-then-dropped listener leaves a dead socket file behind
        drop(UnixListener::bind(&socket).unwrap());
        assert!(socket.exists());

        let mut server = DaemonServer::new(
            socket.clone(),
            DaemonSettings::default(),
            Arc::new(crate::transmit::LogTransmitter),
        );
        server.bind_socket().unwrap();
        assert!(UnixStream::connect(&socket).is_ok());
    }

    #[test]
    fn test_bind_refuses_live_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let _live = UnixListener::bind(&socket).unwrap();

        let mut server = DaemonServer::new(
            socket,
            DaemonSettings::default(),
            Arc::new(crate::transmit::LogTransmitter),
        );
        assert!(server.bind_socket().is_err());
    }
}
