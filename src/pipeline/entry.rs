use std::sync::Arc;

use crate::capture::{CapturedFrame, FrameBuffer, FrameMetadata};

/// A camera frame correlated with its capture metadata.
///
/// Only constructed once both halves are present. The entry owns the frame's pool slot,
/// so dropping it releases the buffer.
#[derive(Debug)]
pub struct FrameEntry {
    pub sensor_timestamp: i64,
    /// Arrival time in microseconds, used for tier aging
    pub arrival_us: i64,
    pub buffer: FrameBuffer,
    pub metadata: Arc<FrameMetadata>,
}

impl FrameEntry {
    pub fn new(buffer: FrameBuffer, metadata: Arc<FrameMetadata>, arrival_us: i64) -> Self {
        debug_assert_eq!(buffer.sensor_timestamp, metadata.sensor_timestamp);
        Self {
            sensor_timestamp: buffer.sensor_timestamp,
            arrival_us,
            buffer,
            metadata,
        }
    }

    /// Consumer view sharing this entry's pixel data.
    pub fn to_captured(&self) -> CapturedFrame {
        CapturedFrame {
            sensor_timestamp: self.sensor_timestamp,
            data: self.buffer.data.clone(),
            width: self.buffer.width,
            height: self.buffer.height,
            format: self.buffer.format,
            metadata: Arc::clone(&self.metadata),
        }
    }
}
