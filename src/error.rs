//! Error types for the service-channel FPGA manager.

use crate::svc::BufAddr;
use std::fmt;
use thiserror::Error;

/// Transfer phase an error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Probe,
    Initiate,
    Stream,
    Finalize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Probe => "firmware probe",
            Phase::Initiate => "reconfiguration request",
            Phase::Stream => "bitstream streaming",
            Phase::Finalize => "reconfiguration completion",
        };
        f.write_str(name)
    }
}

/// Failure reported by the service channel when a command cannot be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The channel's request queue is full; the command may be retried.
    #[error("service channel queue is full")]
    QueueFull,

    /// The privileged side refused the command this time; it may be retried.
    #[error("service channel rejected the command")]
    Rejected,

    /// The channel has been shut down.
    #[error("service channel is closed")]
    Closed,
}

impl TransportError {
    /// Whether retrying the same command later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::QueueFull | TransportError::Rejected)
    }
}

#[derive(Debug, Error)]
pub enum SvcError {
    /// Every buffer slot is handed to the peer. Absorbed by the stream loop.
    #[error("no service buffers available")]
    NoBuffersAvailable,

    #[error("operation not supported by running firmware: {0}")]
    UnsupportedOperation(&'static str),

    #[error("timeout waiting for {phase}")]
    Timeout { phase: Phase },

    #[error("service layer reported an error during {phase}")]
    TransferError { phase: Phase },

    #[error("unknown buffer {addr} returned from service layer")]
    ProtocolViolation { addr: BufAddr },

    #[error("service channel send failed: {0}")]
    TransportRejected(#[from] TransportError),

    #[error("service memory pool exhausted allocating {size} bytes")]
    OutOfMemory { size: usize },

    #[error("{op} not allowed while {state}")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SvcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SvcError::Timeout {
            phase: Phase::Finalize,
        };
        assert_eq!(
            err.to_string(),
            "timeout waiting for reconfiguration completion"
        );

        let err = SvcError::ProtocolViolation {
            addr: BufAddr(0x1000),
        };
        assert_eq!(
            err.to_string(),
            "unknown buffer 0x1000 returned from service layer"
        );
    }

    #[test]
    fn test_transport_error_conversion() {
        let err: SvcError = TransportError::QueueFull.into();
        assert!(matches!(
            err,
            SvcError::TransportRejected(TransportError::QueueFull)
        ));
        assert!(TransportError::QueueFull.is_transient());
        assert!(TransportError::Rejected.is_transient());
        assert!(!TransportError::Closed.is_transient());
    }
}
