//! Per-transfer state.

use crate::svc::ReconfigFlags;

bitflags::bitflags! {
    /// Image flags supplied by the caller of `begin`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ImageFlags: u32 {
        const PARTIAL_RECONFIG = 1 << 0;
        const BITSTREAM_AUTHENTICATE = 1 << 1;
    }
}

/// How the device is to be configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigMode {
    Full,
    Partial,
    /// Full image, authenticated by the firmware before use.
    Authenticated,
}

impl ConfigMode {
    /// Partial reconfiguration wins when both flags are set.
    pub fn from_flags(flags: ImageFlags) -> Self {
        if flags.contains(ImageFlags::PARTIAL_RECONFIG) {
            ConfigMode::Partial
        } else if flags.contains(ImageFlags::BITSTREAM_AUTHENTICATE) {
            ConfigMode::Authenticated
        } else {
            ConfigMode::Full
        }
    }

    pub fn reconfig_flags(self) -> ReconfigFlags {
        match self {
            ConfigMode::Full => ReconfigFlags::empty(),
            ConfigMode::Partial => ReconfigFlags::PARTIAL,
            ConfigMode::Authenticated => ReconfigFlags::AUTHENTICATE,
        }
    }
}

/// Where the manager is in the initiate / stream / finalize sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Initiating,
    Streaming,
    Finalizing,
    /// A phase failed; only a new `begin` is accepted.
    Failed,
}

impl TransferState {
    pub fn name(&self) -> &'static str {
        match self {
            TransferState::Idle => "idle",
            TransferState::Initiating => "initiating",
            TransferState::Streaming => "streaming",
            TransferState::Finalizing => "finalizing",
            TransferState::Failed => "failed",
        }
    }
}

/// Counters for one transfer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransferStats {
    /// Image bytes handed to the service layer
    pub bytes_sent: u64,

    /// Data submit commands issued
    pub submits: u64,

    /// Data claim commands issued
    pub claims: u64,

    /// Completion status polls issued
    pub status_polls: u64,

    /// Notifications naming a buffer that is not ours
    pub protocol_violations: u64,
}

impl TransferStats {
    pub fn merge(&mut self, other: &TransferStats) {
        self.bytes_sent += other.bytes_sent;
        self.submits += other.submits;
        self.claims += other.claims;
        self.status_polls += other.status_polls;
        self.protocol_violations += other.protocol_violations;
    }
}

/// One image transfer, from `begin` until `finish` returns.
#[derive(Debug)]
pub(crate) struct Session {
    pub mode: ConfigMode,

    /// Image size announced by the caller; 0 when unknown.
    pub image_size: usize,

    pub stats: TransferStats,

    /// Manager-wide violation count when the session started.
    pub violations_at_start: u64,
}
