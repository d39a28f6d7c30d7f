//! Sticky status word shared between the notification path and the
//! transfer phases.
//!
//! Notifications OR their bits in; a phase consumes a condition with
//! `test_and_clear`, so each reported condition is acted on exactly once.

use crate::svc::SvcStatus;
use std::sync::atomic::{AtomicU32, Ordering};

/// Conditions tracked by the status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusKind {
    Ok = 0,
    Busy = 1,
    BufferSubmitted = 2,
    BufferDone = 3,
    Completed = 4,
    Error = 5,
    NoSupport = 6,
}

impl StatusKind {
    pub const ALL: [StatusKind; 7] = [
        StatusKind::Ok,
        StatusKind::Busy,
        StatusKind::BufferSubmitted,
        StatusKind::BufferDone,
        StatusKind::Completed,
        StatusKind::Error,
        StatusKind::NoSupport,
    ];

    const fn mask(self) -> u32 {
        1 << self as u8
    }

    /// Wire bit that reports this condition.
    fn wire(self) -> SvcStatus {
        match self {
            StatusKind::Ok => SvcStatus::OK,
            StatusKind::Busy => SvcStatus::BUSY,
            StatusKind::BufferSubmitted => SvcStatus::BUFFER_SUBMITTED,
            StatusKind::BufferDone => SvcStatus::BUFFER_DONE,
            StatusKind::Completed => SvcStatus::COMPLETED,
            // Invalid parameters are a failed request like any other.
            StatusKind::Error => SvcStatus::ERROR | SvcStatus::INVALID_PARAM,
            StatusKind::NoSupport => SvcStatus::NO_SUPPORT,
        }
    }

    /// Conditions reported by a notification's wire status.
    pub fn decode(status: SvcStatus) -> impl Iterator<Item = StatusKind> {
        Self::ALL
            .into_iter()
            .filter(move |kind| status.intersects(kind.wire()))
    }
}

#[derive(Debug, Default)]
pub struct StatusWord {
    bits: AtomicU32,
}

impl StatusWord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record conditions from a notification. Never clears anything.
    pub fn observe(&self, status: SvcStatus) {
        let mask = StatusKind::decode(status).fold(0, |acc, kind| acc | kind.mask());
        if mask != 0 {
            // Release pairs with the Acquire in `test_and_clear` so the waiter
            // sees every write made before the completion fires.
            self.bits.fetch_or(mask, Ordering::Release);
        }
    }

    /// Consume `kind`: returns whether it was set and clears it.
    pub fn test_and_clear(&self, kind: StatusKind) -> bool {
        let prev = self.bits.fetch_and(!kind.mask(), Ordering::AcqRel);
        prev & kind.mask() != 0
    }

    /// Drop every pending condition.
    pub fn clear_all(&self) {
        self.bits.swap(0, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_and_clear_consumes_once() {
        let word = StatusWord::new();
        word.observe(SvcStatus::BUFFER_DONE);

        assert!(word.test_and_clear(StatusKind::BufferDone));
        assert!(!word.test_and_clear(StatusKind::BufferDone));
    }

    #[test]
    fn test_observe_accumulates() {
        let word = StatusWord::new();
        word.observe(SvcStatus::BUFFER_SUBMITTED);
        word.observe(SvcStatus::BUFFER_DONE);
        word.observe(SvcStatus::BUFFER_SUBMITTED);

        assert!(word.test_and_clear(StatusKind::BufferSubmitted));
        assert!(word.test_and_clear(StatusKind::BufferDone));
        assert!(!word.test_and_clear(StatusKind::Error));
    }

    #[test]
    fn test_clear_leaves_other_bits() {
        let word = StatusWord::new();
        word.observe(SvcStatus::OK | SvcStatus::ERROR);

        assert!(word.test_and_clear(StatusKind::Ok));
        assert!(word.test_and_clear(StatusKind::Error));
    }

    #[test]
    fn test_invalid_param_is_error() {
        let word = StatusWord::new();
        word.observe(SvcStatus::INVALID_PARAM);
        assert!(word.test_and_clear(StatusKind::Error));
    }

    #[test]
    fn test_decode() {
        let kinds: Vec<_> = StatusKind::decode(SvcStatus::OK | SvcStatus::COMPLETED).collect();
        assert_eq!(kinds, vec![StatusKind::Ok, StatusKind::Completed]);
        assert_eq!(StatusKind::decode(SvcStatus::empty()).count(), 0);
    }

    #[test]
    fn test_concurrent_observe_not_lost() {
        let word = Arc::new(StatusWord::new());
        let handles: Vec<_> = [SvcStatus::OK, SvcStatus::BUSY, SvcStatus::COMPLETED]
            .into_iter()
            .map(|bit| {
                let word = Arc::clone(&word);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        word.observe(bit);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(word.test_and_clear(StatusKind::Ok));
        assert!(word.test_and_clear(StatusKind::Busy));
        assert!(word.test_and_clear(StatusKind::Completed));
    }
}
