//! Fixed-capacity pool of camera image slots

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use tracing::trace;

use super::frame::{FrameBuffer, PixelFormat};
use crate::error::{Result, ZslError};

/// Bounded pool of frame slots, mirroring the image reader's `max_images`.
///
/// Every [`FrameBuffer`] holds one slot; acquiring beyond capacity fails instead of
/// allocating, which is what keeps the history buffer's memory bounded.
#[derive(Clone)]
pub struct FramePool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    capacity: usize,
    outstanding: AtomicUsize,
    next_id: AtomicU64,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u64,
    pub released: u64,
    pub outstanding: usize,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                capacity,
                outstanding: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
                stats: CachePadded::new(Stats::default()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Take a slot for a newly dequeued frame.
    pub fn acquire(
        &self,
        sensor_timestamp: i64,
        data: Bytes,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<FrameBuffer> {
        let slot = self.try_slot()?;
        trace!(slot = slot.id(), sensor_timestamp, "frame slot acquired");
        Ok(FrameBuffer::new(
            slot,
            data,
            width,
            height,
            format,
            sensor_timestamp,
        ))
    }

    fn try_slot(&self) -> Result<SlotGuard> {
        let shared = &self.shared;
        shared
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < shared.capacity).then_some(n + 1)
            })
            .map_err(|_| ZslError::PoolExhausted {
                capacity: shared.capacity,
            })?;
        shared.stats.acquired.fetch_add(1, Ordering::Relaxed);

        Ok(SlotGuard {
            id: shared.next_id.fetch_add(1, Ordering::Relaxed),
            shared: Arc::clone(shared),
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.shared.stats.acquired.load(Ordering::Relaxed),
            released: self.shared.stats.released.load(Ordering::Relaxed),
            outstanding: self.shared.outstanding.load(Ordering::Acquire),
        }
    }
}

/// Ownership of one pool slot; released on drop
pub(crate) struct SlotGuard {
    id: u64,
    shared: Arc<PoolShared>,
}

impl SlotGuard {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard").field("id", &self.id).finish()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.shared.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.shared.stats.released.fetch_add(1, Ordering::Relaxed);
        trace!(slot = self.id, "frame slot released");
    }
}
