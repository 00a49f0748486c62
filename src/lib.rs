pub mod capture;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capture::{CapturedFrame, FrameBuffer, FrameMetadata, FramePool, PixelFormat};
pub use error::{ErrorCode, Result, ZslError};
pub use pipeline::{CaptureState, RetentionPolicy, ZslCallback, ZslManager};

use pipeline::pending::PENDING_CAPACITY;

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub zsl: ZslConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load defaults, then an optional TOML file, then `SHUTTERLINE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SHUTTERLINE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}

/// Frame source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    /// Image slots shared by the source and the history buffer
    pub buffer_count: Option<usize>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Yuv420,
            buffer_count: None,
        }
    }
}

/// Parameters of a ZSL session, as passed to [`ZslManager::setup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZslConfig {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Nominal stream frame rate
    pub ref_fps: u32,
    /// Longest shutter-to-frame delay the recent tier must cover
    pub max_delay_ms: u32,
    /// Tier-2 capacity; zero disables the history tier
    pub max_histories: usize,
    /// Minimum arrival spacing of frames kept in the history tier
    pub history_interval_ms: u32,

    /// Tier-1 capacity override; derived from `ref_fps` and `max_delay_ms` when unset
    pub queue_size: Option<usize>,
    /// Tier-1 rate floor override; half a frame period when unset
    pub min_frame_interval_us: Option<i64>,
    /// Device latency subtracted from shutter times before nearest-match lookup
    pub shutter_latency_ns: i64,
}

impl Default for ZslConfig {
    fn default() -> Self {
        Self {
            format: PixelFormat::Yuv420,
            width: 640,
            height: 480,
            ref_fps: 30,
            max_delay_ms: 200,
            max_histories: 2,
            history_interval_ms: 500,
            queue_size: None,
            min_frame_interval_us: None,
            shutter_latency_ns: 0,
        }
    }
}

impl ZslConfig {
    /// Validate the session parameters and resolve the tier limits.
    pub fn retention_policy(&self) -> Result<RetentionPolicy> {
        if self.width == 0 || self.height == 0 {
            return Err(ZslError::InvalidArgument(format!(
                "frame size {}x{}",
                self.width, self.height
            )));
        }
        if !self.format.supports_zsl() {
            return Err(ZslError::InvalidArgument(format!(
                "pixel format {:?} cannot be buffered",
                self.format
            )));
        }
        if self.ref_fps == 0 {
            return Err(ZslError::InvalidArgument("reference fps is zero".into()));
        }

        let recent_capacity = self
            .queue_size
            .unwrap_or(self.ref_fps as usize * self.max_delay_ms as usize / 1000 + 1);
        if recent_capacity < 2 {
            return Err(ZslError::InvalidArgument(format!(
                "queue size {recent_capacity} leaves no room for in-flight frames"
            )));
        }

        let min_frame_interval_us = self
            .min_frame_interval_us
            .unwrap_or(1_000_000 / i64::from(self.ref_fps) / 2);
        if min_frame_interval_us < 0 {
            return Err(ZslError::InvalidArgument(
                "minimum frame interval is negative".into(),
            ));
        }

        Ok(RetentionPolicy {
            recent_capacity,
            history_capacity: self.max_histories,
            min_frame_interval_us,
            history_interval_us: i64::from(self.history_interval_ms) * 1_000,
            shutter_latency_ns: self.shutter_latency_ns,
        })
    }

    /// Image slots needed to keep both tiers and the pending buffers full.
    pub fn recommended_pool_size(&self) -> Result<usize> {
        let policy = self.retention_policy()?;
        Ok(policy.recent_capacity + policy.history_capacity + PENDING_CAPACITY * 2 + 1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Depth of the ingestion channel feeding the worker thread
    pub event_queue_depth: usize,
    pub shutter_presses: u32,
    pub shutter_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            event_queue_depth: 8,
            shutter_presses: 5,
            shutter_interval_ms: 400,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn queue_size_is_derived_from_fps_and_delay() {
        let policy = ZslConfig::default().retention_policy().unwrap();
        assert_eq!(policy.recent_capacity, 7);
        assert_eq!(policy.history_capacity, 2);
        assert_eq!(policy.min_frame_interval_us, 16_666);
        assert_eq!(policy.history_interval_us, 500_000);
    }

    #[test]
    fn overrides_win_over_derived_policy() {
        let config = ZslConfig {
            queue_size: Some(3),
            min_frame_interval_us: Some(0),
            ..ZslConfig::default()
        };
        let policy = config.retention_policy().unwrap();
        assert_eq!(policy.recent_capacity, 3);
        assert_eq!(policy.min_frame_interval_us, 0);
        assert_eq!(config.recommended_pool_size().unwrap(), 3 + 2 + 4 + 1);
    }

    #[test]
    fn rejects_bad_session_parameters() {
        let cases = [
            ZslConfig {
                width: 0,
                ..ZslConfig::default()
            },
            ZslConfig {
                format: PixelFormat::Jpeg,
                ..ZslConfig::default()
            },
            ZslConfig {
                ref_fps: 0,
                ..ZslConfig::default()
            },
            ZslConfig {
                queue_size: Some(1),
                ..ZslConfig::default()
            },
        ];
        for config in cases {
            assert!(matches!(
                config.retention_policy(),
                Err(ZslError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn loads_partial_toml_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[zsl]\nref_fps = 60\nmax_histories = 0\nformat = \"private\"\n\n[pipeline]\nevent_queue_depth = 4"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.zsl.ref_fps, 60);
        assert_eq!(config.zsl.max_histories, 0);
        assert_eq!(config.zsl.format, PixelFormat::Private);
        assert_eq!(config.zsl.max_delay_ms, 200);
        assert_eq!(config.pipeline.event_queue_depth, 4);
        assert_eq!(config.capture.fps, 30);
    }

    #[test]
    fn loads_pipeline_and_pool_settings() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[capture]\nbuffer_count = 12\n\n[pipeline]\nshutter_presses = 2\nshutter_interval_ms = 100"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.capture.buffer_count, Some(12));
        assert_eq!(config.pipeline.shutter_presses, 2);
        assert_eq!(config.pipeline.shutter_interval_ms, 100);
        assert_eq!(config.pipeline.event_queue_depth, 8);
    }
}
