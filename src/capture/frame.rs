use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::pool::SlotGuard;

/// Raw camera frame holding one slot of the image pool.
///
/// The slot goes back to its [`FramePool`](super::FramePool) when the buffer is dropped or
/// closed, so a frame can never be discarded without being released.
#[derive(Debug)]
pub struct FrameBuffer {
    /// Pixel data, shared cheaply with consumers of captured frames
    pub data: Bytes,

    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,

    /// Sensor timestamp in nanoseconds, the correlation key with [`FrameMetadata`]
    pub sensor_timestamp: i64,

    slot: SlotGuard,
}

impl FrameBuffer {
    pub(crate) fn new(
        slot: SlotGuard,
        data: Bytes,
        width: u32,
        height: u32,
        format: PixelFormat,
        sensor_timestamp: i64,
    ) -> Self {
        Self {
            data,
            width,
            height,
            stride: width,
            format,
            sensor_timestamp,
            slot,
        }
    }

    /// Index of the pool slot backing this frame
    pub fn slot_index(&self) -> u64 {
        self.slot.id()
    }

    /// Return the buffer to its pool.
    pub fn close(self) {
        drop(self);
    }
}

/// Per-frame capture result
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMetadata {
    pub sensor_timestamp: i64,
    pub sequence: u64,
    pub exposure_time_ns: i64,
    pub sensitivity_iso: i32,
    pub aperture: f32,
}

/// Pixel formats a camera stream can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Yuv420,
    Nv21,
    Private,
    Raw10,
    Jpeg,
    Rgb24,
}

impl PixelFormat {
    /// Whether frames of this format can be reprocessed from the history buffer.
    pub fn supports_zsl(self) -> bool {
        matches!(
            self,
            PixelFormat::Yuv420 | PixelFormat::Nv21 | PixelFormat::Private | PixelFormat::Raw10
        )
    }

    /// Buffer size in bytes for a tightly packed frame.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Yuv420 | PixelFormat::Nv21 | PixelFormat::Private => pixels * 3 / 2,
            PixelFormat::Raw10 => pixels * 5 / 4,
            PixelFormat::Rgb24 => pixels * 3,
            PixelFormat::Jpeg => pixels,
        }
    }
}

/// Frame handed to a ZSL consumer.
///
/// The underlying pool slot stays lent to the in-flight set until the consumer calls
/// `process_done` with [`CapturedFrame::sensor_timestamp`].
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub sensor_timestamp: i64,
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub metadata: Arc<FrameMetadata>,
}
