//! Daemon-owned command queue
//!
//! Holds every packet still due for (re)transmission along with its
//! remaining repeat count. The queue is plain data; the server and the
//! scheduler share it behind one [`SharedQueue`] mutex so a control message
//! can never interleave with a tick halfway through.

use crate::packet::Packet;
use chrono::{DateTime, Local};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

/// Queue shared between control handlers and the scheduler
pub type SharedQueue = Arc<Mutex<CommandQueue>>;

/// Lock the queue, recovering the data if a holder panicked
pub fn lock_queue(queue: &SharedQueue) -> MutexGuard<'_, CommandQueue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One queued packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub packet: Packet,
    /// Ticks during which the packet will still be sent
    pub remaining_repeats: u32,
    pub mod_frequency: u32,
    pub pwm_pin: u8,
    pub queued_at: DateTime<Local>,
}

/// A frame the scheduler owes the hardware this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transmission {
    pub packet: Packet,
    pub pwm_pin: u8,
    pub mod_frequency: u32,
}

#[derive(Debug, Default)]
pub struct CommandQueue {
    entries: Vec<QueueEntry>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedQueue {
        Arc::new(Mutex::new(self))
    }

    /// Append an entry; the sentinel packet is refused
    ///
    /// No de-duplication: distinct commands for the same address may be
    /// active together.
    pub fn add(&mut self, packet: Packet, repeats: u32, mod_frequency: u32, pwm_pin: u8) -> bool {
        if packet.is_sentinel() {
            error!("addCmd called without a valid encodedCommand, ignoring");
            return false;
        }
        self.entries.push(QueueEntry {
            packet,
            remaining_repeats: repeats,
            mod_frequency,
            pwm_pin,
            queued_at: Local::now(),
        });
        debug!(packet = packet.raw(), repeats, queued = self.entries.len(), "command queued");
        true
    }

    /// Remove the first entry carrying `packet`
    ///
    /// Missing entries are not an error: the packet may have expired on its
    /// own just before the removal arrived.
    pub fn remove(&mut self, packet: Packet) -> bool {
        match self.entries.iter().position(|e| e.packet == packet) {
            Some(index) => {
                self.entries.remove(index);
                debug!(packet = packet.raw(), index, "command removed");
                true
            }
            None => {
                debug!(packet = packet.raw(), "removeCmd for packet not in queue");
                false
            }
        }
    }

    /// Drop everything; returns how many entries were removed
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        info!(removed, "command queue cleared");
        removed
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry carries `packet`
    pub fn contains(&self, packet: Packet) -> bool {
        self.entries.iter().any(|e| e.packet == packet)
    }

    /// Advance one scheduler tick
    ///
    /// Every entry with repeats left is decremented and yields one
    /// transmission, in queue order. Entries left at zero are evicted
    /// afterwards, so an entry queued with `N` repeats is sent exactly `N`
    /// times and is gone after its `N`th tick. An entry queued with zero
    /// repeats is evicted without being sent.
    pub fn tick(&mut self) -> Vec<Transmission> {
        let mut due = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.remaining_repeats > 0 {
                entry.remaining_repeats -= 1;
                due.push(Transmission {
                    packet: entry.packet,
                    pwm_pin: entry.pwm_pin,
                    mod_frequency: entry.mod_frequency,
                });
            }
        }

        let before = self.entries.len();
        self.entries.retain(|e| e.remaining_repeats > 0);
        let expired = before - self.entries.len();
        if expired > 0 {
            debug!(expired, remaining = self.entries.len(), "expired commands evicted");
        }

        due
    }

    /// Log one line per entry
    pub fn dump(&self) {
        if self.entries.is_empty() {
            info!("command queue is empty");
            return;
        }
        for entry in &self.entries {
            info!(
                "encoded cmd = {}, tx count = {}, freq = {}, PWM pin = {}, queued at {}",
                entry.packet,
                entry.remaining_repeats,
                entry.mod_frequency,
                entry.pwm_pin,
                entry.queued_at.format("%H:%M:%S")
            );
        }
    }
}
