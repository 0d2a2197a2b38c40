//! Retransmission scheduler
//!
//! The only source of outbound IR traffic. On a fixed period it ticks the
//! shared queue and hands the due frames to a short-lived sender thread,
//! which spaces them `stagger` apart so the receivers see distinct frames.
//! The scheduler never waits on that thread, so a slow emitter can neither
//! delay the next tick nor hold the queue lock.

use crate::daemon::queue::{lock_queue, SharedQueue, Transmission};
use crate::signal::ShutdownSignal;
use crate::transmit::Transmitter;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Scheduler {
    queue: SharedQueue,
    transmitter: Arc<dyn Transmitter>,
    interval: Duration,
    stagger: Duration,
    shutdown: ShutdownSignal,
}

impl Scheduler {
    pub fn new(
        queue: SharedQueue,
        transmitter: Arc<dyn Transmitter>,
        interval: Duration,
        stagger: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            queue,
            transmitter,
            interval,
            stagger,
            shutdown,
        }
    }

    /// Tick the queue once and dispatch its due frames
    ///
    /// Returns the sender thread, or `None` if nothing was due.
    pub fn tick(&self) -> Option<JoinHandle<()>> {
        // Guard dropped at the end of this statement
        let due = lock_queue(&self.queue).tick();
        if due.is_empty() {
            return None;
        }
        debug!(frames = due.len(), "scheduler tick");

        let transmitter = self.transmitter.clone();
        let stagger = self.stagger;
        let shutdown = self.shutdown.clone();
        let spawned = thread::Builder::new()
            .name("irgauge-tx".to_string())
            .spawn(move || send_staggered(due, transmitter.as_ref(), stagger, &shutdown));

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("failed to start sender thread, frames dropped this tick: {}", e);
                None
            }
        }
    }

    /// Tick every `interval` until shutdown
    pub fn run(&self) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            stagger_ms = self.stagger.as_millis() as u64,
            "retransmission scheduler started"
        );
        while !self.shutdown.wait_timeout(self.interval) {
            self.tick();
        }
        info!("retransmission scheduler stopped");
    }

    /// Run on a dedicated thread
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("irgauge-scheduler".to_string())
            .spawn(move || self.run())
    }
}

/// Send each frame at `(i + 1) * stagger` from now
///
/// A failing frame is logged and the rest still go out. Frames not yet sent
/// when shutdown is requested are abandoned.
pub fn send_staggered(
    due: Vec<Transmission>,
    transmitter: &dyn Transmitter,
    stagger: Duration,
    shutdown: &ShutdownSignal,
) {
    for tx in due {
        if shutdown.wait_timeout(stagger) {
            debug!("shutdown requested, abandoning pending frames");
            return;
        }
        if let Err(e) = transmitter.transmit(tx.packet, tx.pwm_pin, tx.mod_frequency) {
            warn!(packet = tx.packet.raw(), pin = tx.pwm_pin, "transmit failed: {}", e);
        }
    }
}
