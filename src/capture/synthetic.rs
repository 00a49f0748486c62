//! Synthetic camera producing frames and capture results at a fixed rate

use std::time::Duration;

use bytes::Bytes;
use tracing::{info, instrument, warn};

use crate::{
    capture::frame::{FrameBuffer, FrameMetadata, PixelFormat},
    capture::pool::FramePool,
    error::{Result, ZslError},
    CaptureConfig,
};

/// Stand-in for a camera device.
///
/// Each [`capture_frame`](Self::capture_frame) dequeues one frame from the pool and the
/// capture result that describes it, with sensor timestamps one frame period apart.
pub struct SyntheticCamera {
    config: CaptureConfig,
    pool: FramePool,
    sequence: u64,
    sensor_timestamp: i64,
    frame_period_ns: i64,
    payload: Bytes,
}

impl SyntheticCamera {
    pub fn new(config: CaptureConfig, pool: FramePool) -> Result<Self> {
        if config.fps == 0 || config.width == 0 || config.height == 0 {
            return Err(ZslError::InvalidArgument(format!(
                "synthetic stream {}x{} @ {} fps",
                config.width, config.height, config.fps
            )));
        }
        info!(
            "Initializing synthetic camera: {}x{} {:?} @ {} fps, {} slots",
            config.width,
            config.height,
            config.format,
            config.fps,
            pool.capacity()
        );

        let payload = Bytes::from(vec![0x80u8; config.format.frame_len(config.width, config.height)]);
        Ok(Self {
            frame_period_ns: 1_000_000_000 / i64::from(config.fps),
            config,
            pool,
            sequence: 0,
            sensor_timestamp: 0,
            payload,
        })
    }

    /// Start sensor timestamps at `origin_ns` instead of zero.
    pub fn with_origin(mut self, origin_ns: i64) -> Self {
        self.sensor_timestamp = origin_ns;
        self
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_nanos(self.frame_period_ns.unsigned_abs())
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Sensor timestamp the next frame will carry
    pub fn next_timestamp(&self) -> i64 {
        self.sensor_timestamp + self.frame_period_ns
    }

    /// Produce the next frame and its capture result.
    ///
    /// When every slot is lent out the frame is skipped, as a real sensor would drop it,
    /// and the timestamp still advances.
    #[instrument(skip(self))]
    pub fn capture_frame(&mut self) -> Result<(FrameBuffer, FrameMetadata)> {
        self.sensor_timestamp += self.frame_period_ns;
        self.sequence += 1;

        let frame = self
            .pool
            .acquire(
                self.sensor_timestamp,
                self.payload.clone(),
                self.config.width,
                self.config.height,
                self.config.format,
            )
            .map_err(|e| {
                warn!(sequence = self.sequence, "frame dropped: {}", e);
                e
            })?;

        let metadata = FrameMetadata {
            sensor_timestamp: self.sensor_timestamp,
            sequence: self.sequence,
            exposure_time_ns: self.frame_period_ns / 2,
            sensitivity_iso: 100,
            aperture: 1.8,
        };
        Ok((frame, metadata))
    }
}
