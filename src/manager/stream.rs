//! Streaming phase.
//!
//! Fills free buffers with image data and submits them until the input is
//! exhausted, then claims outstanding buffers until every one has come
//! back. A full pool or a refused send is backpressure, not failure: the
//! loop retries until `buffer_timeout` passes without progress. Only a
//! closed channel ends the session at once.

use super::{FpgaManager, TransferStats};
use crate::error::{Phase, Result, SvcError};
use crate::pool::SlotHandle;
use crate::status::StatusKind;
use crate::svc::{Command, ServiceChannel};
use std::thread;
use std::time::Instant;

/// Errors that mean "try again shortly".
fn is_backpressure(err: &SvcError) -> bool {
    match err {
        SvcError::NoBuffersAvailable => true,
        SvcError::TransportRejected(e) => e.is_transient(),
        _ => false,
    }
}

impl<C: ServiceChannel> FpgaManager<C> {
    pub(super) fn stream(&self, image: &[u8], stats: &mut TransferStats) -> Result<()> {
        let shared = &self.shared;
        let buffer_timeout = self.config.buffer_timeout();
        let mut offset = 0;
        let mut stalled_since: Option<Instant> = None;

        loop {
            shared.completion.arm();

            let issued = if offset < image.len() {
                self.send_buf(&image[offset..]).map(|sent| {
                    offset += sent;
                    stats.submits += 1;
                    stats.bytes_sent += sent as u64;
                })
            } else {
                if shared.pool.count_unlocked() == shared.pool.len() {
                    return Ok(());
                }
                // Input exhausted but buffers outstanding: make the service
                // layer hand them back.
                self.send(Command::DataClaim).map(|()| stats.claims += 1)
            };

            if let Err(e) = issued {
                if !is_backpressure(&e) {
                    return Err(e);
                }
                let since = *stalled_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= buffer_timeout {
                    tracing::error!("timeout waiting for svc layer buffers ({})", e);
                    return Err(SvcError::Timeout {
                        phase: Phase::Stream,
                    });
                }
                thread::yield_now();
                continue;
            }
            stalled_since = None;

            let outcome = shared.completion.wait(buffer_timeout);

            if shared.status.test_and_clear(StatusKind::BufferDone)
                || shared.status.test_and_clear(StatusKind::BufferSubmitted)
            {
                continue;
            }

            if shared.status.test_and_clear(StatusKind::Error) {
                tracing::error!("ERROR - giving up - SVC_STATUS_ERROR");
                return Err(SvcError::TransferError {
                    phase: Phase::Stream,
                });
            }

            if !outcome.fired() {
                tracing::error!("timeout waiting for svc layer buffers");
                return Err(SvcError::Timeout {
                    phase: Phase::Stream,
                });
            }
        }
    }

    /// Copy up to one buffer of `data` into a free slot and submit it.
    /// Returns the number of bytes handed over.
    fn send_buf(&self, data: &[u8]) -> Result<usize> {
        let pool = &self.shared.pool;
        let slot = pool.acquire()?;
        let xfer_sz = data.len().min(pool.buf_size());

        if let Err(e) = self.submit_slot(slot, &data[..xfer_sz]) {
            if !is_backpressure(&e) {
                tracing::error!("Error while sending data to service layer ({})", e);
            }
            pool.unlock(slot, self.chan.as_ref());
            return Err(e);
        }
        Ok(xfer_sz)
    }

    fn submit_slot(&self, slot: SlotHandle, data: &[u8]) -> Result<()> {
        let pool = &self.shared.pool;
        self.chan.write_buffer(slot.addr, data)?;

        if self.config.device_mapping {
            let dma = self.chan.map_buffer(slot.addr, pool.buf_size())?;
            pool.set_mapping(slot, dma);
        }

        self.send(Command::DataSubmit {
            addr: slot.addr,
            len: data.len(),
        })
    }
}
