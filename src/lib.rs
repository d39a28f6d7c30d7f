//! Bitstream streaming engine for FPGA managers that sit behind a secure
//! service channel.
//!
//! The privileged side accepts image data only through a small pool of
//! pre-registered buffers and reports progress through asynchronous
//! notifications. [`FpgaManager`] turns that into an ordered, reliable
//! byte-stream delivery: `begin`, one or more `write` calls, `finish`.

pub mod completion;
pub mod config;
pub mod error;
pub mod manager;
pub mod pool;
pub mod status;
pub mod svc;

pub use config::{Config, EngineConfig};
pub use error::{Phase, Result, SvcError, TransportError};
pub use manager::{ConfigMode, FpgaManager, ImageFlags, TransferState, TransferStats};
pub use svc::loopback::{LoopbackBehavior, LoopbackService};
pub use svc::{BufAddr, Callback, CallbackData, Command, ServiceChannel, SvcStatus};
