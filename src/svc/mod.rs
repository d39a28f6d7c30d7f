//! Service channel interface.
//!
//! The privileged side is reached only through a narrow message channel:
//! a command is queued with `send`, and the service layer answers later by
//! invoking the callback registered with that command, possibly several
//! times, from its own context. Data moves through buffers allocated from
//! the service layer's memory pool.
//!
//! ```text
//! +-------------+  send(cmd, cb)   +----------------+
//! | FpgaManager | ---------------> | ServiceChannel | --> secure firmware
//! |             | <--------------- |                |
//! +-------------+  cb(status, addrs)+----------------+
//! ```
//!
//! Nothing here defines how a command reaches the secure monitor; that is
//! the implementor's concern.

pub mod loopback;

use crate::error::{Result, TransportError};
use std::fmt;
use std::sync::Arc;

/// Maximum number of buffer addresses carried by one notification.
pub const MAX_CALLBACK_ADDRS: usize = 4;

/// Firmware version value meaning "no version reported".
pub const INVALID_FIRMWARE_VERSION: u32 = 0xFFFF;

// =============================================================================
// Addresses
// =============================================================================

/// Address of a buffer in the service layer's memory pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufAddr(pub u64);

impl fmt::Display for BufAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Device-visible address of a mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DmaAddr(pub u64);

// =============================================================================
// Status bits (wire encoding)
// =============================================================================

bitflags::bitflags! {
    /// Status bits as reported by the service layer in a notification.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SvcStatus: u32 {
        const OK = 1 << 0;
        const BUFFER_SUBMITTED = 1 << 1;
        const BUFFER_DONE = 1 << 2;
        const COMPLETED = 1 << 3;
        const BUSY = 1 << 4;
        const ERROR = 1 << 5;
        const NO_SUPPORT = 1 << 6;
        const INVALID_PARAM = 1 << 7;
    }
}

// =============================================================================
// Reconfiguration flags (wire encoding)
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReconfigFlags: u32 {
        const PARTIAL = 1 << 0;
        const AUTHENTICATE = 1 << 1;
    }
}

// =============================================================================
// Commands
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Query the running firmware version.
    FirmwareVersion,

    /// Begin a reconfiguration.
    Reconfig { flags: ReconfigFlags },

    /// Hand `len` bytes of the buffer at `addr` to the service layer.
    DataSubmit { addr: BufAddr, len: usize },

    /// Ask the service layer to return every buffer it still holds.
    DataClaim,

    /// Poll whether reconfiguration has completed.
    ReconfigStatus,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::FirmwareVersion => "FIRMWARE_VERSION",
            Command::Reconfig { .. } => "RECONFIG",
            Command::DataSubmit { .. } => "RECONFIG_DATA_SUBMIT",
            Command::DataClaim => "RECONFIG_DATA_CLAIM",
            Command::ReconfigStatus => "RECONFIG_STATUS",
        }
    }

    /// Length of the payload carried with the command.
    pub fn payload_len(&self) -> usize {
        match self {
            Command::Reconfig { .. } => std::mem::size_of::<u32>(),
            Command::DataSubmit { len, .. } => *len,
            _ => 0,
        }
    }
}

// =============================================================================
// Notifications
// =============================================================================

/// Payload of one service layer notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallbackData {
    pub status: SvcStatus,

    /// Buffers the service layer is returning. `None` entries are unused.
    pub addrs: [Option<BufAddr>; MAX_CALLBACK_ADDRS],

    /// Firmware version, only present in replies to `FirmwareVersion`.
    pub version: Option<u32>,
}

impl CallbackData {
    pub fn new(status: SvcStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Attach up to `MAX_CALLBACK_ADDRS` returned buffers.
    pub fn with_addrs(mut self, addrs: &[BufAddr]) -> Self {
        for (slot, addr) in self.addrs.iter_mut().zip(addrs) {
            *slot = Some(*addr);
        }
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn returned_addrs(&self) -> impl Iterator<Item = BufAddr> + '_ {
        self.addrs.iter().flatten().copied()
    }
}

/// Receive callback registered with a command. Runs in the service layer's
/// context and must not block.
pub type Callback = Arc<dyn Fn(&CallbackData) + Send + Sync>;

// =============================================================================
// Channel
// =============================================================================

/// Client side of the secure service channel plus its memory pool.
pub trait ServiceChannel: Send + Sync + 'static {
    /// Queue `command`. `callback` is invoked zero or more times once the
    /// service layer responds.
    fn send(&self, command: Command, callback: Callback) -> std::result::Result<(), TransportError>;

    /// Release the channel's request slot once a response has been handled.
    fn done(&self);

    /// Allocate `size` bytes from the service layer's memory pool.
    fn allocate(&self, size: usize) -> Result<BufAddr>;

    fn free(&self, addr: BufAddr);

    /// Copy `data` into the start of the pool buffer at `addr`.
    fn write_buffer(&self, addr: BufAddr, data: &[u8]) -> Result<()>;

    /// Make `len` bytes at `addr` visible to the device.
    fn map_buffer(&self, addr: BufAddr, _len: usize) -> Result<DmaAddr> {
        Ok(DmaAddr(addr.0))
    }

    fn unmap_buffer(&self, _dma: DmaAddr, _len: usize) {}
}
