//! Hardware transmit boundary
//!
//! The daemon only ever talks to the IR LED through [`Transmitter`]. The
//! default backend logs frames; the command backend shells out to a small
//! PWM emitter program that owns the GPIO.

use crate::daemon::config::{DaemonSettings, TransmitterKind};
use crate::error::TransmitError;
use crate::packet::Packet;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

/// Emits one packet on the IR carrier
pub trait Transmitter: Send + Sync {
    fn transmit(&self, packet: Packet, pin: u8, frequency_hz: u32) -> Result<(), TransmitError>;
}

/// Logs each frame without touching hardware
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransmitter;

impl Transmitter for LogTransmitter {
    fn transmit(&self, packet: Packet, pin: u8, frequency_hz: u32) -> Result<(), TransmitError> {
        info!(
            at = %chrono::Local::now().format("%H:%M:%S"),
            packet = packet.raw(),
            pin,
            frequency_hz,
            "Transmitting packet {:#010x}",
            packet
        );
        Ok(())
    }
}

/// Runs `<program> <packet> <pin> <frequency>` for every frame
#[derive(Debug, Clone)]
pub struct CommandTransmitter {
    program: PathBuf,
}

impl CommandTransmitter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Transmitter for CommandTransmitter {
    fn transmit(&self, packet: Packet, pin: u8, frequency_hz: u32) -> Result<(), TransmitError> {
        debug!(program = %self.program.display(), packet = packet.raw(), pin, frequency_hz, "running emitter");

        let status = Command::new(&self.program)
            .arg(packet.raw().to_string())
            .arg(pin.to_string())
            .arg(frequency_hz.to_string())
            .stdin(Stdio::null())
            .status()
            .map_err(|source| TransmitError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(TransmitError::Failed {
                program: self.program.clone(),
                code: status.code(),
            })
        }
    }
}

/// Backend selected by `[daemon] transmitter`
pub fn from_settings(settings: &DaemonSettings) -> Arc<dyn Transmitter> {
    match settings.transmitter {
        TransmitterKind::Log => Arc::new(LogTransmitter),
        TransmitterKind::Command => Arc::new(CommandTransmitter::new(&settings.transmit_program)),
    }
}

/// One emitted frame, as seen by [`RecordingTransmitter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub packet: Packet,
    pub pin: u8,
    pub frequency_hz: u32,
    pub at: Instant,
}

/// Keeps every frame in memory; for tests and dry runs
#[derive(Debug, Default)]
pub struct RecordingTransmitter {
    frames: Mutex<Vec<Frame>>,
    fail: bool,
}

impl RecordingTransmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records frames but reports every transmit as failed
    pub fn failing() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().map(|f| f.clone()).unwrap_or_default()
    }

    /// How many times `packet` went out
    pub fn count(&self, packet: Packet) -> usize {
        self.frames().iter().filter(|f| f.packet == packet).count()
    }
}

impl Transmitter for RecordingTransmitter {
    fn transmit(&self, packet: Packet, pin: u8, frequency_hz: u32) -> Result<(), TransmitError> {
        if let Ok(mut frames) = self.frames.lock() {
            frames.push(Frame {
                packet,
                pin,
                frequency_hz,
                at: Instant::now(),
            });
        }
        if self.fail {
            return Err(TransmitError::Backend("recording transmitter set to fail".to_string()));
        }
        Ok(())
    }
}
