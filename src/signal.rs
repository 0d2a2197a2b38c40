use anyhow::Result;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Longest a waiter sleeps before re-checking the flag. Signal handlers can
/// only set the atomic, not notify the condvar.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Cooperative shutdown flag shared by the accept loop, the scheduler,
/// pending transmits, and client sessions
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    wake: Arc<(Mutex<()>, Condvar)>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag on SIGINT and SIGTERM
    pub fn register_signals(&self) -> Result<()> {
        signal_hook::flag::register(SIGTERM, self.flag.clone())?;
        signal_hook::flag::register(SIGINT, self.flag.clone())?;
        Ok(())
    }

    /// Request shutdown and wake every waiter
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let (lock, cvar) = &*self.wake;
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `timeout` unless shutdown is requested first
    ///
    /// Returns `true` if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.wake;
        let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(POLL_SLICE);
            guard = cvar
                .wait_timeout(guard, slice)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_initial_state() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
    }

    #[test]
    fn test_wait_times_out() {
        let signal = ShutdownSignal::new();
        let start = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_trigger_wakes_waiter() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let triggered = waiter.wait_timeout(Duration::from_secs(10));
            (triggered, start.elapsed())
        });

        thread::sleep(Duration::from_millis(50));
        signal.trigger();

        let (triggered, elapsed) = handle.join().unwrap();
        assert!(triggered);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_register_signals() {
        let signal = ShutdownSignal::new();
        assert!(signal.register_signals().is_ok());
        assert!(!signal.is_triggered());
    }
}
