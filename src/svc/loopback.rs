//! In-process service layer.
//!
//! Serves the service channel from a worker thread the way the secure
//! firmware would: commands are queued, processed in order, and answered
//! through their callbacks from the worker's context. Buffer memory lives
//! in a host-side pool, and every byte handed over with a data submit is
//! appended to the received image.
//!
//! Used for dry runs and for exercising the manager against a slow,
//! lossy or failing peer.

use crate::error::{Result, SvcError, TransportError};
use crate::svc::{
    BufAddr, Callback, CallbackData, Command, DmaAddr, ReconfigFlags, ServiceChannel, SvcStatus,
    MAX_CALLBACK_ADDRS,
};
use bytes::{Bytes, BytesMut};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// First address handed out by the loopback memory pool
const POOL_BASE: u64 = 0x4000_0000;

/// Offset between a pool address and its device mapping
const DMA_OFFSET: u64 = 0x1_0000_0000;

/// How the loopback service layer answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopbackBehavior {
    /// Version reported to the firmware probe. `None` answers NO_SUPPORT.
    pub firmware_version: Option<u32>,

    /// Run as firmware without bitstream authentication, whatever
    /// `firmware_version` says.
    pub no_auth_support: bool,

    /// Return each buffer right after consuming it. When false, buffers
    /// are held until a data claim.
    pub auto_complete: bool,

    /// Status polls answered BUSY before COMPLETED.
    pub busy_polls: u32,

    /// Answer every status poll with BUSY.
    pub never_complete: bool,

    /// Answer status polls with ERROR.
    pub fail_reconfig: bool,

    /// Answer the n-th data submit (1-based) with ERROR.
    pub error_on_submit: Option<u64>,

    /// Refuse the n-th send (1-based) with a full queue.
    pub queue_full_on_send: Option<u64>,

    /// Refuse the n-th send (1-based) with a rejection.
    pub reject_on_send: Option<u64>,

    /// Refuse every send after the n-th with a rejection.
    pub reject_after_send: Option<u64>,

    /// Report the channel closed for every send after the n-th.
    pub close_after_send: Option<u64>,

    /// Return an address outside the pool along with the first buffer.
    pub bogus_return: bool,

    /// Leave reconfiguration requests unanswered.
    pub ignore_reconfig: bool,

    /// Leave data claims unanswered.
    pub ignore_claims: bool,

    /// Delay before each command is processed.
    pub latency_ms: u64,

    /// Bytes available in the memory pool.
    pub pool_capacity: usize,

    /// Commands that may be queued before sends are refused.
    pub queue_depth: usize,
}

impl Default for LoopbackBehavior {
    fn default() -> Self {
        Self {
            firmware_version: Some(1),
            no_auth_support: false,
            auto_complete: true,
            busy_polls: 0,
            never_complete: false,
            fail_reconfig: false,
            error_on_submit: None,
            queue_full_on_send: None,
            reject_on_send: None,
            reject_after_send: None,
            close_after_send: None,
            bogus_return: false,
            ignore_reconfig: false,
            ignore_claims: false,
            latency_ms: 0,
            pool_capacity: 16 * 1024 * 1024,
            queue_depth: 16,
        }
    }
}

struct Request {
    command: Command,
    callback: Callback,
}

#[derive(Default)]
struct Memory {
    buffers: HashMap<BufAddr, Vec<u8>>,
    next: u64,
    used: usize,
}

struct Inner {
    behavior: LoopbackBehavior,
    memory: Mutex<Memory>,
    commands: Mutex<Vec<Command>>,
    image: Mutex<BytesMut>,
    held: Mutex<Vec<BufAddr>>,
    sends: AtomicU64,
    submits: AtomicU64,
    polls: AtomicU64,
    done_calls: AtomicU64,
    live_mappings: AtomicI64,
    bogus_sent: AtomicU64,
}

/// Lock a mutex, recovering the data if a callback panicked while holding it.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct LoopbackService {
    inner: Arc<Inner>,
    tx: Option<Sender<Request>>,
    worker: Option<JoinHandle<()>>,
}

impl LoopbackService {
    pub fn new(behavior: LoopbackBehavior) -> io::Result<Self> {
        let (tx, rx) = bounded(behavior.queue_depth.max(1));
        let inner = Arc::new(Inner {
            behavior,
            memory: Mutex::new(Memory {
                next: POOL_BASE,
                ..Default::default()
            }),
            commands: Mutex::new(Vec::new()),
            image: Mutex::new(BytesMut::new()),
            held: Mutex::new(Vec::new()),
            sends: AtomicU64::new(0),
            submits: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            done_calls: AtomicU64::new(0),
            live_mappings: AtomicI64::new(0),
            bogus_sent: AtomicU64::new(0),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("svc-loopback".into())
            .spawn(move || worker_inner.run(rx))?;

        Ok(Self {
            inner,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Every accepted command, in send order.
    pub fn commands(&self) -> Vec<Command> {
        lock(&self.inner.commands).clone()
    }

    /// Payload lengths of the accepted data submits.
    pub fn submit_lengths(&self) -> Vec<usize> {
        self.commands()
            .into_iter()
            .filter_map(|c| match c {
                Command::DataSubmit { len, .. } => Some(len),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        lock(&self.inner.commands)
            .iter()
            .filter(|c| c.name() == name)
            .count()
    }

    /// Image bytes received since the last reconfiguration request.
    pub fn image(&self) -> Bytes {
        lock(&self.inner.image).clone().freeze()
    }

    /// How many times the client released its request slot.
    pub fn done_calls(&self) -> u64 {
        self.inner.done_calls.load(Ordering::Relaxed)
    }

    /// Buffers currently allocated from the memory pool.
    pub fn live_allocations(&self) -> usize {
        lock(&self.inner.memory).buffers.len()
    }

    pub fn live_mappings(&self) -> i64 {
        self.inner.live_mappings.load(Ordering::Relaxed)
    }
}

impl Drop for LoopbackService {
    fn drop(&mut self) {
        // Disconnect the queue so the worker exits, then wait for it.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            // The last reference can be dropped by a callback on the worker.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl ServiceChannel for LoopbackService {
    fn send(&self, command: Command, callback: Callback) -> std::result::Result<(), TransportError> {
        let n = self.inner.sends.fetch_add(1, Ordering::Relaxed) + 1;
        let behavior = &self.inner.behavior;
        if behavior.close_after_send.is_some_and(|limit| n > limit) {
            return Err(TransportError::Closed);
        }
        if behavior.queue_full_on_send == Some(n) {
            return Err(TransportError::QueueFull);
        }
        if behavior.reject_on_send == Some(n)
            || behavior.reject_after_send.is_some_and(|limit| n > limit)
        {
            return Err(TransportError::Rejected);
        }

        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        // Log before queueing so the record order matches processing order.
        lock(&self.inner.commands).push(command);
        match tx.try_send(Request { command, callback }) {
            Ok(()) => Ok(()),
            Err(e) => {
                lock(&self.inner.commands).pop();
                match e {
                    TrySendError::Full(_) => Err(TransportError::QueueFull),
                    TrySendError::Disconnected(_) => Err(TransportError::Closed),
                }
            }
        }
    }

    fn done(&self) {
        self.inner.done_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn allocate(&self, size: usize) -> Result<BufAddr> {
        let mut memory = lock(&self.inner.memory);
        if memory.used + size > self.inner.behavior.pool_capacity {
            return Err(SvcError::OutOfMemory { size });
        }

        let addr = BufAddr(memory.next);
        memory.next += (size as u64).next_multiple_of(4096);
        memory.used += size;
        memory.buffers.insert(addr, vec![0; size]);
        Ok(addr)
    }

    fn free(&self, addr: BufAddr) {
        let mut memory = lock(&self.inner.memory);
        if let Some(buf) = memory.buffers.remove(&addr) {
            memory.used -= buf.len();
        } else {
            tracing::warn!("loopback: free of unknown buffer {}", addr);
        }
    }

    fn write_buffer(&self, addr: BufAddr, data: &[u8]) -> Result<()> {
        let mut memory = lock(&self.inner.memory);
        let buf = memory
            .buffers
            .get_mut(&addr)
            .ok_or(SvcError::ProtocolViolation { addr })?;
        if data.len() > buf.len() {
            return Err(SvcError::OutOfMemory { size: data.len() });
        }
        buf[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn map_buffer(&self, addr: BufAddr, _len: usize) -> Result<DmaAddr> {
        self.inner.live_mappings.fetch_add(1, Ordering::Relaxed);
        Ok(DmaAddr(addr.0 + DMA_OFFSET))
    }

    fn unmap_buffer(&self, _dma: DmaAddr, _len: usize) {
        self.inner.live_mappings.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Inner {
    fn firmware_version(&self) -> Option<u32> {
        if self.behavior.no_auth_support {
            None
        } else {
            self.behavior.firmware_version
        }
    }

    fn run(&self, rx: Receiver<Request>) {
        while let Ok(req) = rx.recv() {
            if self.behavior.latency_ms > 0 {
                thread::sleep(Duration::from_millis(self.behavior.latency_ms));
            }
            self.handle(req);
        }
    }

    fn reply(&self, callback: &Callback, data: CallbackData) {
        tracing::trace!("loopback: reply {:?}", data.status);
        callback(&data);
    }

    fn handle(&self, req: Request) {
        let Request { command, callback } = req;
        match command {
            Command::FirmwareVersion => match self.firmware_version() {
                Some(version) => {
                    self.reply(&callback, CallbackData::new(SvcStatus::OK).with_version(version))
                }
                None => self.reply(&callback, CallbackData::new(SvcStatus::NO_SUPPORT)),
            },
            Command::Reconfig { flags } => {
                if self.behavior.ignore_reconfig {
                    return;
                }
                if flags.contains(ReconfigFlags::AUTHENTICATE)
                    && self.firmware_version().is_none()
                {
                    self.reply(&callback, CallbackData::new(SvcStatus::NO_SUPPORT));
                    return;
                }
                lock(&self.image).clear();
                lock(&self.held).clear();
                self.polls.store(0, Ordering::Relaxed);
                self.submits.store(0, Ordering::Relaxed);
                self.reply(&callback, CallbackData::new(SvcStatus::OK));
            }
            Command::DataSubmit { addr, len } => self.handle_submit(&callback, addr, len),
            Command::DataClaim => {
                if self.behavior.ignore_claims {
                    return;
                }
                let held = std::mem::take(&mut *lock(&self.held));
                if held.is_empty() {
                    self.reply(&callback, CallbackData::new(SvcStatus::BUSY));
                    return;
                }
                for chunk in held.chunks(MAX_CALLBACK_ADDRS) {
                    self.reply(
                        &callback,
                        CallbackData::new(SvcStatus::BUFFER_DONE).with_addrs(chunk),
                    );
                }
            }
            Command::ReconfigStatus => {
                let polls = self.polls.fetch_add(1, Ordering::Relaxed) + 1;
                let status = if self.behavior.fail_reconfig {
                    SvcStatus::ERROR
                } else if self.behavior.never_complete || polls <= self.behavior.busy_polls as u64
                {
                    SvcStatus::BUSY
                } else {
                    SvcStatus::COMPLETED
                };
                self.reply(&callback, CallbackData::new(status));
            }
        }
    }

    fn handle_submit(&self, callback: &Callback, addr: BufAddr, len: usize) {
        let n = self.submits.fetch_add(1, Ordering::Relaxed) + 1;

        let copied = {
            let memory = lock(&self.memory);
            match memory.buffers.get(&addr) {
                Some(buf) if len <= buf.len() => {
                    lock(&self.image).extend_from_slice(&buf[..len]);
                    true
                }
                _ => false,
            }
        };
        if !copied {
            self.reply(callback, CallbackData::new(SvcStatus::INVALID_PARAM));
            return;
        }

        if self.behavior.error_on_submit == Some(n) {
            // The failed buffer stays with the peer until claimed.
            lock(&self.held).push(addr);
            self.reply(callback, CallbackData::new(SvcStatus::ERROR));
            return;
        }

        self.reply(callback, CallbackData::new(SvcStatus::BUFFER_SUBMITTED));

        if !self.behavior.auto_complete {
            lock(&self.held).push(addr);
            return;
        }

        let mut returned = vec![addr];
        if self.behavior.bogus_return && self.bogus_sent.fetch_add(1, Ordering::Relaxed) == 0 {
            returned.push(BufAddr(0xbad0_0000));
        }
        self.reply(
            callback,
            CallbackData::new(SvcStatus::BUFFER_DONE).with_addrs(&returned),
        );
    }
}
