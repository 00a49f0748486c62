//! Frames and metadata waiting for their counterpart

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use super::discard;
use crate::capture::{FrameBuffer, FrameMetadata};

/// Number of unmatched items kept per side
pub const PENDING_CAPACITY: usize = 2;

/// Two small oldest-first maps keyed by sensor timestamp.
///
/// An item offered to one side is matched against the other side first; only when no
/// counterpart exists is it parked, evicting (and releasing) the oldest parked item when
/// the side is full.
#[derive(Debug, Default)]
pub struct PendingCorrelation {
    images: VecDeque<FrameBuffer>,
    metadata: VecDeque<Arc<FrameMetadata>>,
}

/// A frame and its metadata, ready to become a history entry
pub type Correlated = (FrameBuffer, Arc<FrameMetadata>);

impl PendingCorrelation {
    pub fn new() -> Self {
        Self {
            images: VecDeque::with_capacity(PENDING_CAPACITY),
            metadata: VecDeque::with_capacity(PENDING_CAPACITY),
        }
    }

    pub fn offer_image(&mut self, image: FrameBuffer) -> Option<Correlated> {
        let ts = image.sensor_timestamp;
        if let Some(pos) = self.metadata.iter().position(|m| m.sensor_timestamp == ts) {
            let meta = self.metadata.remove(pos)?;
            return Some((image, meta));
        }

        if let Some(pos) = self.images.iter().position(|i| i.sensor_timestamp == ts) {
            if let Some(stale) = self.images.remove(pos) {
                discard(stale, ts, "duplicate_image");
            }
        }
        if self.images.len() >= PENDING_CAPACITY {
            if let Some(oldest) = self.images.pop_front() {
                let oldest_ts = oldest.sensor_timestamp;
                discard(oldest, oldest_ts, "pending_overflow");
            }
        }
        self.images.push_back(image);
        None
    }

    pub fn offer_metadata(&mut self, meta: Arc<FrameMetadata>) -> Option<Correlated> {
        let ts = meta.sensor_timestamp;
        if let Some(pos) = self.images.iter().position(|i| i.sensor_timestamp == ts) {
            let image = self.images.remove(pos)?;
            return Some((image, meta));
        }

        self.metadata.retain(|m| m.sensor_timestamp != ts);
        if self.metadata.len() >= PENDING_CAPACITY {
            if let Some(oldest) = self.metadata.pop_front() {
                debug!(
                    sensor_timestamp = oldest.sensor_timestamp,
                    "dropping unmatched metadata"
                );
            }
        }
        self.metadata.push_back(meta);
        None
    }

    pub fn contains(&self, sensor_timestamp: i64) -> bool {
        self.images
            .iter()
            .any(|i| i.sensor_timestamp == sensor_timestamp)
            || self
                .metadata
                .iter()
                .any(|m| m.sensor_timestamp == sensor_timestamp)
    }

    pub fn image_timestamps(&self) -> Vec<i64> {
        self.images.iter().map(|i| i.sensor_timestamp).collect()
    }

    pub fn metadata_timestamps(&self) -> Vec<i64> {
        self.metadata.iter().map(|m| m.sensor_timestamp).collect()
    }

    /// Release every parked image and forget parked metadata.
    pub fn clear(&mut self, reason: &'static str) {
        for image in self.images.drain(..) {
            let ts = image.sensor_timestamp;
            discard(image, ts, reason);
        }
        self.metadata.clear();
    }
}
