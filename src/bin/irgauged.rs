//! IR gauge broadcast daemon
//!
//! ```bash
//! # Run in the foreground with the log-only emitter
//! irgauged start
//!
//! # Use a config file and drive real hardware
//! irgauged --config /etc/irgauge/config.toml start
//!
//! irgauged status
//! irgauged stop
//! ```

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use irgauge::daemon::server::{pid_path, DaemonServer};
use irgauge::{logging, transmit, Config};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// IR gauge broadcast daemon
#[derive(Parser, Debug)]
#[command(name = "irgauged")]
#[command(version)]
#[command(about = "Queues gauge commands and rebroadcasts them over IR")]
struct Args {
    /// Configuration file (default: $IRGAUGE_CONFIG or ~/.irgauge/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Control socket path, overriding the configuration
    #[arg(short, long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground
    Start,
    /// Signal a running daemon to shut down
    Stop,
    /// Report whether a daemon is running
    Status,
    /// Stop then start
    Restart,
}

fn main() {
    let args = Args::parse();
    logging::init(args.verbose, args.json);

    if let Err(e) = run(&args) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let config = Config::locate(args.config.as_deref()).context("loading configuration")?;
    let socket_path = match &args.socket {
        Some(path) => path.clone(),
        None => config.resolve_socket_path()?,
    };

    match args.command {
        Command::Start => start_daemon(&config, &socket_path),
        Command::Stop => stop_daemon(&socket_path),
        Command::Status => check_status(&socket_path),
        Command::Restart => {
            println!("Stopping daemon...");
            stop_daemon(&socket_path)?;

            // Brief pause to ensure cleanup
            thread::sleep(Duration::from_millis(500));

            println!("Starting daemon...");
            start_daemon(&config, &socket_path)
        }
    }
}

fn start_daemon(config: &Config, socket_path: &Path) -> Result<()> {
    if is_running(socket_path) {
        return Err(anyhow!(
            "daemon is already running at {}; use 'irgauged stop' or 'irgauged restart'",
            socket_path.display()
        ));
    }

    let settings = config.daemon.clone();
    info!(
        pin = settings.pwm_pin,
        frequency = settings.modulation_frequency,
        repeats = settings.default_repeats,
        tick_secs = settings.tick_interval_secs,
        transmitter = ?settings.transmitter,
        "daemon configuration"
    );

    let transmitter = transmit::from_settings(&settings);
    let mut daemon = DaemonServer::new(socket_path.to_path_buf(), settings, transmitter);

    println!("Starting irgauge daemon at {}", socket_path.display());
    println!("Press Ctrl-C to stop the daemon.");

    daemon.start()
}

fn stop_daemon(socket_path: &Path) -> Result<()> {
    if !socket_path.exists() {
        println!("Daemon is not running (socket not found).");
        return Ok(());
    }

    if !is_running(socket_path) {
        // Socket exists but can't connect - likely stale
        println!("Removing stale socket file.");
        fs::remove_file(socket_path)?;
        let _ = fs::remove_file(pid_path(socket_path));
        return Ok(());
    }

    let pid_file = pid_path(socket_path);
    let pid = match read_pid(&pid_file) {
        Some(pid) => pid,
        None => {
            warn!("PID file {} not found or unreadable", pid_file.display());
            eprintln!("You may need to manually kill the daemon process.");
            return Ok(());
        }
    };

    kill(Pid::from_raw(pid), Signal::SIGTERM)
        .with_context(|| format!("sending SIGTERM to PID {}", pid))?;
    println!("Sent shutdown signal to daemon (PID {}).", pid);

    // Wait for socket to be removed (up to 5 seconds)
    for _ in 0..50 {
        thread::sleep(Duration::from_millis(100));
        if !socket_path.exists() {
            println!("Daemon stopped.");
            return Ok(());
        }
    }

    warn!("daemon may not have stopped cleanly");
    Ok(())
}

fn check_status(socket_path: &Path) -> Result<()> {
    if !socket_path.exists() {
        println!("Daemon is not running (socket not found).");
        return Ok(());
    }

    if is_running(socket_path) {
        println!("Daemon is running at {}", socket_path.display());
        if let Some(pid) = read_pid(&pid_path(socket_path)) {
            println!("PID: {}", pid);
        }
    } else {
        println!("Socket file exists but daemon is not responding.");
        println!("This may be a stale socket. Try 'irgauged start' to replace it.");
    }

    Ok(())
}

fn is_running(socket_path: &Path) -> bool {
    socket_path.exists() && UnixStream::connect(socket_path).is_ok()
}

fn read_pid(pid_file: &Path) -> Option<i32> {
    fs::read_to_string(pid_file).ok()?.trim().parse().ok()
}
