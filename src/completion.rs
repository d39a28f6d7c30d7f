//! Single-slot completion signal.
//!
//! Re-armed before every request so a wake-up left over from an earlier
//! request is never mistaken for the current one.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::{Duration, Instant};

/// Result of waiting on a [`Completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Fired with `remaining` left of the timeout.
    Fired { remaining: Duration },
    TimedOut,
}

impl WaitOutcome {
    pub fn fired(&self) -> bool {
        matches!(self, WaitOutcome::Fired { .. })
    }
}

pub struct Completion {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Completion {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Reset to "not fired". Call before issuing the request, never after.
    pub fn arm(&self) {
        loop {
            match self.rx.try_recv() {
                Ok(()) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Wake the waiter. Never blocks; firing an already fired signal is a
    /// no-op.
    pub fn fire(&self) {
        // Full means a wake-up is already pending.
        let _ = self.tx.try_send(());
    }

    /// Block until fired or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        let start = Instant::now();
        match self.rx.recv_timeout(timeout) {
            Ok(()) => WaitOutcome::Fired {
                remaining: timeout.saturating_sub(start.elapsed()),
            },
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                WaitOutcome::TimedOut
            }
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
