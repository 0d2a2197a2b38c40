#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use irgauge::daemon::client::{ClientOptions, GaugeClient};
use irgauge::packet::BROADCAST_ADDRESS;
use irgauge::signal::ShutdownSignal;
use irgauge::{logging, ClientError, CommandTable, Config, Packet};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::{info, warn};

/// Send values and commands to IR gauges through a running irgauged
#[derive(Parser, Debug)]
#[command(name = "irgauge")]
#[command(version)]
#[command(about = "Client for the IR gauge broadcast daemon")]
struct Args {
    /// Configuration file (default: $IRGAUGE_CONFIG or ~/.irgauge/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Control socket path, overriding the configuration
    #[arg(short, long, global = true, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Gauge address
    #[arg(short, long, global = true)]
    address: Option<u8>,

    /// Address every gauge in range instead of one
    #[arg(long, global = true, conflicts_with = "address")]
    broadcast: bool,

    /// PWM pin the daemon should transmit on
    #[arg(long, global = true)]
    pin: Option<u8>,

    /// Carrier frequency in Hz
    #[arg(long, global = true)]
    freq: Option<u32>,

    /// Seconds to wait for the daemon before giving up
    #[arg(long, global = true, default_value_t = 5)]
    timeout: u64,

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
    /// Show a calibrated value on the gauge
    Value { value: f64 },
    /// Send a gauge command by name (e.g. Identify) or number
    Command { name: String, value: i64 },
    /// Queue a pre-encoded packet (decimal or 0x hex)
    Raw {
        packet: Packet,
        /// Repeat count, defaulting to the configured one
        #[arg(short = 'n', long)]
        count: Option<u32>,
    },
    /// Remove a queued packet
    Remove { packet: Packet },
    /// Empty the daemon's queue
    Clear,
    /// Ask the daemon to log its queue
    Dump,
    /// Send the start value, then step through 2..=100 and 1..=100 repeatedly
    Sweep {
        #[arg(long, default_value_t = 50.0)]
        start: f64,
        /// Seconds between values
        #[arg(long, default_value_t = 600)]
        interval_secs: u64,
    },
    /// Print the packet for a command without sending it
    Encode { name: String, value: i64 },
    /// Break a packet into its fields
    Decode { packet: Packet },
    /// Print the raw stepper value for a gauge value
    Calibrate { value: f64 },
    /// List known gauge command names
    Commands,
}

fn main() {
    let args = Args::parse();
    logging::init(args.verbose, args.json);

    match run(args) {
        Ok(()) => {}
        Err(e) => {
            if let Some(ClientError::Terminated) = e.downcast_ref::<ClientError>() {
                eprintln!("Daemon requested disconnect, exiting.");
                process::exit(2);
            }
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::locate(args.config.as_deref()).context("loading configuration")?;
    let mut options = ClientOptions::from_config(&config)?;
    if let Some(socket) = args.socket {
        options.socket_path = socket;
    }
    if let Some(address) = args.address {
        options.settings.address = address;
    }
    if args.broadcast {
        options.settings.address = BROADCAST_ADDRESS;
    }
    options.pwm_pin = args.pin;
    options.mod_freq = args.freq;

    // Offline commands never touch the daemon
    match &args.command {
        Command::Encode { name, value } => {
            let packet = encode_named(&options, name, *value)?;
            println!("{} ({:#010x})", packet, packet);
            return Ok(());
        }
        Command::Decode { packet } => {
            let fields = packet.decode();
            println!("command:  {}", fields.command);
            println!("value:    {}", fields.value);
            println!("address:  {}", fields.address);
            println!(
                "check:    {:#04x} ({})",
                fields.address_complement,
                if fields.address_check_ok { "ok" } else { "mismatch" }
            );
            return Ok(());
        }
        Command::Calibrate { value } => {
            println!("{}", options.settings.calibration.map(*value)?);
            return Ok(());
        }
        Command::Commands => {
            for (name, code) in options.commands.iter() {
                println!("{:>2}  {}", code, name);
            }
            return Ok(());
        }
        _ => {}
    }

    // Reject bad input before waiting on the daemon
    let command_packet = match &args.command {
        Command::Command { name, value } => Some(encode_named(&options, name, *value)?),
        Command::Value { value } => {
            options.settings.calibration.map(*value)?;
            None
        }
        _ => None,
    };

    let client = GaugeClient::connect(options)?;
    client
        .wait_connected(Duration::from_secs(args.timeout))
        .with_context(|| "waiting for irgauged; is it running?")?;

    match args.command {
        Command::Value { value } => client.send_value(value)?,
        Command::Command { .. } => {
            if let Some(packet) = command_packet {
                client.send_encoded_cmd(packet)?;
            }
        }
        Command::Raw { packet, count } => client.queue_add(packet, count)?,
        Command::Remove { packet } => client.queue_remove(packet)?,
        Command::Clear => client.queue_clear()?,
        Command::Dump => client.queue_dump()?,
        Command::Sweep {
            start,
            interval_secs,
        } => sweep(&client, start, Duration::from_secs(interval_secs))?,
        Command::Encode { .. }
        | Command::Decode { .. }
        | Command::Calibrate { .. }
        | Command::Commands => {}
    }

    client.close();
    Ok(())
}

fn resolve_command(commands: &CommandTable, name: &str) -> Result<u8> {
    commands
        .resolve(name)
        .ok_or_else(|| anyhow!("unknown gauge command '{}'", name))
}

/// Resolve `name` and encode it for the configured gauge address
fn encode_named(options: &ClientOptions, name: &str, value: i64) -> Result<Packet> {
    let code = resolve_command(&options.commands, name)?;
    let packet = Packet::encode(i64::from(code), value, i64::from(options.settings.address))?;
    Ok(packet)
}

/// Send `start`, then 2, 3, ... 100, 1, 2, ... until interrupted
fn sweep(client: &GaugeClient, start: f64, interval: Duration) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    shutdown.register_signals()?;

    let mut step = 1;
    let mut value = start;
    loop {
        info!(value, address = client.address(), "sending sweep value");
        match client.send_value(value) {
            Ok(()) => {}
            Err(ClientError::Terminated) => return Err(ClientError::Terminated.into()),
            Err(e) if e.is_transient() => warn!("value {} not sent: {}", value, e),
            Err(e) => return Err(e.into()),
        }

        if shutdown.wait_timeout(interval) {
            return Ok(());
        }
        step = next_sweep_step(step);
        value = f64::from(step);
    }
}

fn next_sweep_step(step: u32) -> u32 {
    if step >= 100 {
        1
    } else {
        step + 1
    }
}
