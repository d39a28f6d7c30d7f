//! FPGA manager driving a bitstream through the service channel.
//!
//! Three phases per image, each driven from the caller's thread:
//!
//! ```text
//! begin()   RECONFIG ---------------> OK
//! write()   DATA_SUBMIT(buf) -------> BUFFER_SUBMITTED, BUFFER_DONE(addrs)
//!           DATA_CLAIM -------------> BUFFER_DONE(addrs)
//! finish()  RECONFIG_STATUS --------> BUSY ... COMPLETED | ERROR
//! ```
//!
//! The service layer answers from its own context. Notifications only
//! touch the buffer pool, the sticky status word and the completion
//! signal; the driving thread waits on the signal and then consumes
//! status bits, so no session state is shared with the callback.

mod session;
mod stream;

pub use session::{ConfigMode, ImageFlags, TransferState, TransferStats};

use crate::completion::{Completion, WaitOutcome};
use crate::config::EngineConfig;
use crate::error::{Phase, Result, SvcError};
use crate::pool::BufferPool;
use crate::status::{StatusKind, StatusWord};
use crate::svc::{
    Callback, CallbackData, Command, ServiceChannel, SvcStatus, INVALID_FIRMWARE_VERSION,
};
use session::Session;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// State shared with the notification path.
struct Shared {
    pool: BufferPool,
    status: StatusWord,
    completion: Completion,
    violations: AtomicU64,
}

impl Shared {
    /// Receive callback body: release returned buffers, record status, then
    /// wake the waiter. The wake-up must come last.
    fn on_notify(&self, chan: &dyn ServiceChannel, data: &CallbackData) {
        tracing::trace!("svc notification status={:?}", data.status);

        if data.status.contains(SvcStatus::BUFFER_DONE) {
            for addr in data.returned_addrs() {
                if let Err(e) = self.pool.release(addr, chan) {
                    self.violations.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("{}", e);
                }
            }
        }

        self.status.observe(data.status);
        self.completion.fire();
    }
}

/// Firmware version probe state, used only during attach.
struct Probe {
    version: AtomicU32,
    completion: Completion,
}

impl Probe {
    fn on_version(&self, data: &CallbackData) {
        if data.status == SvcStatus::OK {
            if let Some(version) = data.version {
                self.version.store(version, Ordering::Release);
            }
        } else if data.status.contains(SvcStatus::NO_SUPPORT) {
            tracing::warn!("FW doesn't support bitstream authentication");
        } else {
            tracing::error!("Failed to get FW version {:?}", data.status);
        }
        self.completion.fire();
    }
}

pub struct FpgaManager<C: ServiceChannel> {
    chan: Arc<C>,
    shared: Arc<Shared>,
    config: EngineConfig,
    fw_version: u32,
    state: TransferState,
    session: Option<Session>,
}

impl<C: ServiceChannel> FpgaManager<C> {
    /// Bind to the service channel: probe the firmware version, then
    /// allocate the buffer pool.
    pub fn attach(chan: Arc<C>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let fw_version = Self::probe_firmware(&chan, config.request_timeout())?;
        if fw_version != INVALID_FIRMWARE_VERSION {
            tracing::debug!("running firmware version {}", fw_version);
        }

        let pool = BufferPool::allocate(chan.as_ref(), config.num_buffers, config.buffer_size)
            .inspect_err(|e| tracing::error!("couldn't allocate service buffers: {}", e))?;

        Ok(Self {
            chan,
            shared: Arc::new(Shared {
                pool,
                status: StatusWord::new(),
                completion: Completion::new(),
                violations: AtomicU64::new(0),
            }),
            config,
            fw_version,
            state: TransferState::Idle,
            session: None,
        })
    }

    fn probe_firmware(chan: &Arc<C>, timeout: Duration) -> Result<u32> {
        let probe = Arc::new(Probe {
            version: AtomicU32::new(INVALID_FIRMWARE_VERSION),
            completion: Completion::new(),
        });

        let cb_probe = Arc::clone(&probe);
        let callback: Callback = Arc::new(move |data: &CallbackData| cb_probe.on_version(data));

        probe.completion.arm();
        tracing::debug!("svc send {}", Command::FirmwareVersion.name());
        let result = match chan.send(Command::FirmwareVersion, callback) {
            Ok(()) => match probe.completion.wait(timeout) {
                WaitOutcome::Fired { .. } => Ok(probe.version.load(Ordering::Acquire)),
                WaitOutcome::TimedOut => {
                    tracing::error!("timeout waiting for firmware version");
                    Err(SvcError::Timeout {
                        phase: Phase::Probe,
                    })
                }
            },
            Err(e) => {
                tracing::error!("couldn't get firmware version: {}", e);
                Err(e.into())
            }
        };
        chan.done();
        result
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.chan
    }

    pub fn firmware_version(&self) -> Option<u32> {
        (self.fw_version != INVALID_FIRMWARE_VERSION).then_some(self.fw_version)
    }

    /// Whether the running firmware can authenticate bitstreams.
    pub fn auth_supported(&self) -> bool {
        self.firmware_version().is_some()
    }

    /// Notifications so far that named a buffer outside the pool.
    pub fn protocol_violations(&self) -> u64 {
        self.shared.violations.load(Ordering::Relaxed)
    }

    /// Buffers not currently held by the service layer.
    pub fn free_buffers(&self) -> usize {
        self.shared.pool.count_unlocked()
    }

    fn receive_callback(&self) -> Callback {
        let shared = Arc::clone(&self.shared);
        let chan: Weak<C> = Arc::downgrade(&self.chan);
        Arc::new(move |data: &CallbackData| {
            if let Some(chan) = chan.upgrade() {
                shared.on_notify(chan.as_ref(), data);
            }
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        tracing::debug!(
            "svc send {} payload_len={}",
            command.name(),
            command.payload_len()
        );
        self.chan
            .send(command, self.receive_callback())
            .inspect_err(|e| tracing::debug!("svc send returned {}", e))?;
        Ok(())
    }

    fn fail(&mut self, err: SvcError) -> SvcError {
        self.state = TransferState::Failed;
        self.session = None;
        err
    }

    fn expect_state(&self, op: &'static str, allowed: &[TransferState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SvcError::InvalidState {
                op,
                state: self.state.name(),
            })
        }
    }

    // =========================================================================
    // Initiate
    // =========================================================================

    /// Request reconfiguration for an image of `image_size` bytes (0 if
    /// unknown).
    pub fn begin(&mut self, image_size: usize, flags: ImageFlags) -> Result<()> {
        self.expect_state("begin", &[TransferState::Idle, TransferState::Failed])?;
        self.state = TransferState::Initiating;

        let mode = ConfigMode::from_flags(flags);
        match self.initiate(mode) {
            Ok(()) => {
                self.session = Some(Session {
                    mode,
                    image_size,
                    stats: TransferStats::default(),
                    violations_at_start: self.protocol_violations(),
                });
                self.state = TransferState::Streaming;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn initiate(&self, mode: ConfigMode) -> Result<()> {
        match mode {
            ConfigMode::Partial => tracing::debug!("Requesting partial reconfiguration."),
            ConfigMode::Authenticated => {
                if !self.auth_supported() {
                    tracing::error!("FW doesn't support bitstream authentication");
                    return Err(SvcError::UnsupportedOperation("bitstream authentication"));
                }
                tracing::debug!("Requesting bitstream authentication.");
            }
            ConfigMode::Full => tracing::debug!("Requesting full reconfiguration."),
        }

        let result = self.request_reconfig(mode);
        self.chan.done();
        result
    }

    fn request_reconfig(&self, mode: ConfigMode) -> Result<()> {
        let shared = &self.shared;

        // Conditions left over from an aborted session mean nothing now.
        shared.status.clear_all();
        shared.completion.arm();
        self.send(Command::Reconfig {
            flags: mode.reconfig_flags(),
        })?;

        if !shared.completion.wait(self.config.request_timeout()).fired() {
            tracing::error!("timeout waiting for RECONFIG_REQUEST");
            return Err(SvcError::Timeout {
                phase: Phase::Initiate,
            });
        }

        if !shared.status.test_and_clear(StatusKind::Ok) {
            tracing::error!("RECONFIG_REQUEST not acknowledged");
            return Err(SvcError::Timeout {
                phase: Phase::Initiate,
            });
        }

        shared.pool.unlock_all();
        Ok(())
    }

    // =========================================================================
    // Stream
    // =========================================================================

    /// Stream the next part of the image. Returns once every byte of
    /// `image` has been handed over and every buffer has come back.
    pub fn write(&mut self, image: &[u8]) -> Result<usize> {
        self.expect_state("write", &[TransferState::Streaming])?;

        let mut stats = TransferStats::default();
        match self.stream(image, &mut stats) {
            Ok(()) => {
                if let Some(session) = self.session.as_mut() {
                    session.stats.merge(&stats);
                }
                Ok(image.len())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    // =========================================================================
    // Finalize
    // =========================================================================

    /// Wait for the device to report configuration complete.
    pub fn finish(&mut self) -> Result<TransferStats> {
        self.expect_state("finish", &[TransferState::Streaming])?;
        self.state = TransferState::Finalizing;

        let mut polls = 0;
        let result = self.finalize(&mut polls);
        self.chan.done();

        match result {
            Ok(()) => {
                let session = self.session.take();
                self.state = TransferState::Idle;

                let mut stats = TransferStats::default();
                if let Some(session) = session {
                    if session.image_size != 0
                        && session.stats.bytes_sent != session.image_size as u64
                    {
                        tracing::warn!(
                            "{:?} image announced {} bytes, streamed {}",
                            session.mode,
                            session.image_size,
                            session.stats.bytes_sent
                        );
                    }
                    stats = session.stats;
                    stats.protocol_violations =
                        self.protocol_violations() - session.violations_at_start;
                }
                stats.status_polls = polls;
                Ok(stats)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Poll for completion. Every wait gets only what the previous one left
    /// of the request timeout, so the whole phase is bounded by one
    /// deadline.
    fn finalize(&self, polls: &mut u64) -> Result<()> {
        let shared = &self.shared;
        let mut timeout = self.config.request_timeout();

        loop {
            shared.completion.arm();
            *polls += 1;
            self.send(Command::ReconfigStatus)?;

            match shared.completion.wait(timeout) {
                WaitOutcome::Fired { remaining } => timeout = remaining,
                WaitOutcome::TimedOut => {
                    tracing::error!("timeout waiting for RECONFIG_COMPLETED");
                    return Err(SvcError::Timeout {
                        phase: Phase::Finalize,
                    });
                }
            }

            if shared.status.test_and_clear(StatusKind::Completed) {
                return Ok(());
            }

            if shared.status.test_and_clear(StatusKind::Error) {
                tracing::error!("ERROR - giving up - SVC_STATUS_ERROR");
                return Err(SvcError::TransferError {
                    phase: Phase::Finalize,
                });
            }

            if shared.status.test_and_clear(StatusKind::Busy) {
                tracing::trace!("reconfiguration busy, {:?} left", timeout);
            }
        }
    }

    /// Run a whole transfer: initiate, stream `image`, finalize.
    pub fn load(&mut self, image: &[u8], flags: ImageFlags) -> Result<TransferStats> {
        self.begin(image.len(), flags)?;
        self.write(image)?;
        self.finish()
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Free every buffer the service layer is not holding. Returns true if
    /// the whole pool was released.
    pub fn release_buffers(&self) -> bool {
        self.shared.pool.free_all_idle(self.chan.as_ref())
    }

    /// Claim back buffers the service layer still holds. The claims share
    /// one request timeout.
    fn reclaim_held(&self) {
        let shared = &self.shared;
        let mut timeout = self.config.request_timeout();

        while shared.pool.count_held() > 0 {
            shared.completion.arm();
            if let Err(e) = self.send(Command::DataClaim) {
                tracing::warn!("couldn't claim back service buffers: {}", e);
                break;
            }
            match shared.completion.wait(timeout) {
                WaitOutcome::Fired { remaining } => timeout = remaining,
                WaitOutcome::TimedOut => break,
            }
        }
        self.chan.done();
    }

    fn unbind(&self) -> bool {
        if self.release_buffers() {
            return true;
        }

        self.reclaim_held();
        if self.release_buffers() {
            return true;
        }

        tracing::warn!(
            "{} service buffers still held by the service layer at detach, freeing them",
            self.shared.pool.count_held()
        );
        self.shared.pool.free_all(self.chan.as_ref());
        false
    }

    /// Unbind from the service channel. Buffers the service layer still
    /// holds are claimed back first; any it keeps past the request timeout
    /// are freed regardless. Returns true if every buffer came back.
    pub fn detach(self) -> bool {
        self.unbind()
    }
}

impl<C: ServiceChannel> Drop for FpgaManager<C> {
    fn drop(&mut self) {
        self.unbind();
    }
}
