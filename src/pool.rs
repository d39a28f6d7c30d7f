//! Fixed pool of service layer buffers.
//!
//! Each slot owns one buffer from the service layer's memory pool plus an
//! in-use lock. A locked slot belongs to the service layer until a
//! notification returns its address; only then may it be refilled or
//! freed. Lock bits are per-slot atomics, so acquiring one slot never
//! contends with releasing another.

use crate::error::{Result, SvcError};
use crate::svc::{BufAddr, DmaAddr, ServiceChannel};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Address value of a slot whose buffer has been freed.
const NO_BUFFER: u64 = 0;

/// Mapping value of a slot that is not mapped for the device.
const NO_MAPPING: u64 = u64::MAX;

struct Slot {
    addr: AtomicU64,
    dma: AtomicU64,
    locked: AtomicBool,
}

impl Slot {
    fn new(addr: BufAddr) -> Self {
        Self {
            addr: AtomicU64::new(addr.0),
            dma: AtomicU64::new(NO_MAPPING),
            locked: AtomicBool::new(false),
        }
    }

    fn addr(&self) -> Option<BufAddr> {
        match self.addr.load(Ordering::Acquire) {
            NO_BUFFER => None,
            addr => Some(BufAddr(addr)),
        }
    }
}

/// A slot locked by [`BufferPool::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    pub index: usize,
    pub addr: BufAddr,
}

pub struct BufferPool {
    slots: Vec<Slot>,
    buf_size: usize,
}

impl BufferPool {
    /// Allocate `count` buffers of `buf_size` bytes from the service layer.
    /// Already allocated buffers are returned if any allocation fails.
    pub fn allocate(chan: &dyn ServiceChannel, count: usize, buf_size: usize) -> Result<Self> {
        let mut addrs = Vec::with_capacity(count);
        for _ in 0..count {
            match chan.allocate(buf_size) {
                Ok(addr) => addrs.push(addr),
                Err(e) => {
                    for addr in addrs {
                        chan.free(addr);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self::from_addrs(addrs, buf_size))
    }

    pub(crate) fn from_addrs(addrs: Vec<BufAddr>, buf_size: usize) -> Self {
        Self {
            slots: addrs.into_iter().map(Slot::new).collect(),
            buf_size,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Capacity of each slot in bytes.
    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Lock the first free slot.
    pub fn acquire(&self) -> Result<SlotHandle> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            match slot.addr() {
                Some(addr) => return Ok(SlotHandle { index, addr }),
                // Freed slots stay locked.
                None => continue,
            }
        }
        Err(SvcError::NoBuffersAvailable)
    }

    /// Record the device mapping of a locked slot.
    pub fn set_mapping(&self, handle: SlotHandle, dma: DmaAddr) {
        self.slots[handle.index].dma.store(dma.0, Ordering::Release);
    }

    /// Unlock a slot this side still owns, e.g. after a failed submit.
    pub fn unlock(&self, handle: SlotHandle, chan: &dyn ServiceChannel) {
        let slot = &self.slots[handle.index];
        self.unmap(slot, chan);
        slot.locked.store(false, Ordering::Release);
    }

    /// Unlock the slot whose buffer the service layer returned.
    ///
    /// An address that matches no slot is a correlation bug between sent
    /// and returned buffers; no lock is touched.
    pub fn release(&self, addr: BufAddr, chan: &dyn ServiceChannel) -> Result<()> {
        let slot = self
            .slots
            .iter()
            .find(|slot| slot.addr() == Some(addr))
            .ok_or(SvcError::ProtocolViolation { addr })?;

        self.unmap(slot, chan);
        slot.locked.store(false, Ordering::Release);
        Ok(())
    }

    fn unmap(&self, slot: &Slot, chan: &dyn ServiceChannel) {
        let dma = slot.dma.swap(NO_MAPPING, Ordering::AcqRel);
        if dma != NO_MAPPING {
            chan.unmap_buffer(DmaAddr(dma), self.buf_size);
        }
    }

    /// Unlock every allocated slot at the start of a new session.
    pub fn unlock_all(&self) {
        for slot in &self.slots {
            if slot.addr().is_some() {
                slot.dma.store(NO_MAPPING, Ordering::Relaxed);
                slot.locked.store(false, Ordering::Release);
            }
        }
    }

    /// Number of slots not held by the service layer.
    pub fn count_unlocked(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !slot.locked.load(Ordering::Acquire))
            .count()
    }

    /// Number of allocated slots still held by the service layer.
    pub fn count_held(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.addr().is_some() && slot.locked.load(Ordering::Acquire))
            .count()
    }

    /// Free the buffer of every unlocked slot. Locked slots are skipped
    /// since the service layer may still be reading them.
    ///
    /// Returns true once every slot's buffer has been freed.
    pub fn free_all_idle(&self, chan: &dyn ServiceChannel) -> bool {
        let mut num_free = 0;
        for slot in &self.slots {
            let Some(addr) = slot.addr() else {
                num_free += 1;
                continue;
            };

            if slot
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                slot.addr.store(NO_BUFFER, Ordering::Release);
                chan.free(addr);
                num_free += 1;
            }
        }
        num_free == self.slots.len()
    }

    /// Free every remaining buffer, held or not. Only for unbinding from the
    /// channel, once nothing more will be claimed back.
    pub fn free_all(&self, chan: &dyn ServiceChannel) {
        for slot in &self.slots {
            slot.locked.store(true, Ordering::Release);
            let addr = slot.addr.swap(NO_BUFFER, Ordering::AcqRel);
            if addr != NO_BUFFER {
                self.unmap(slot, chan);
                chan.free(BufAddr(addr));
            }
        }
    }

    /// Whether `addr` belongs to this pool and is currently locked.
    #[cfg(test)]
    pub fn is_locked(&self, addr: BufAddr) -> Option<bool> {
        self.slots
            .iter()
            .find(|slot| slot.addr() == Some(addr))
            .map(|slot| slot.locked.load(Ordering::Acquire))
    }
}
