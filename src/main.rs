//! Shutterline demo: a synthetic camera feeding a zero-shutter-lag history buffer

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use flume::{bounded, Sender};
use tracing::{error, info, warn};

use shutterline::capture::{FramePool, SyntheticCamera};
use shutterline::{CapturedFrame, Config, ErrorCode, FrameMetadata, ZslCallback, ZslConfig, ZslManager};

/// Forwards capture results to the main loop
struct ChannelCallback {
    tx: Sender<std::result::Result<CapturedFrame, ErrorCode>>,
}

impl ZslCallback for ChannelCallback {
    fn on_zsl_captured(&self, frame: CapturedFrame) {
        let _ = self.tx.send(Ok(frame));
    }

    fn on_zsl_error(&self, code: ErrorCode) {
        let _ = self.tx.send(Err(code));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shutterline=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Shutterline launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let zsl_config = ZslConfig {
        format: config.capture.format,
        width: config.capture.width,
        height: config.capture.height,
        ref_fps: config.capture.fps,
        ..config.zsl.clone()
    };
    let pool_size = match config.capture.buffer_count {
        Some(count) => count,
        None => zsl_config.recommended_pool_size()?,
    };

    let manager = Arc::new(ZslManager::new(config.pipeline.event_queue_depth)?);
    manager.setup(zsl_config)?;
    manager.start()?;

    let pool = FramePool::new(pool_size);
    let mut camera = SyntheticCamera::new(config.capture.clone(), pool.clone())?;
    let frame_period = camera.frame_period();
    let started = Instant::now();

    // Spawn capture task
    let sink = manager.frame_sink();
    let capture_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(frame_period);
        loop {
            ticker.tick().await;
            match camera.capture_frame() {
                Ok((frame, metadata)) => {
                    sink.on_image_available(frame);
                    sink.on_capture_completed(metadata);
                }
                Err(e) => {
                    warn!("Capture error: {}", e);
                }
            }
        }
    });

    // Let the history fill before the first shutter press
    tokio::time::sleep(Duration::from_millis(
        u64::from(config.zsl.max_delay_ms) + config.pipeline.shutter_interval_ms,
    ))
    .await;

    let outcome = tokio::select! {
        result = shutter_loop(&manager, &pool, &config, frame_period, started) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, releasing buffers");
            Ok(())
        }
    };

    // Buffers go back to the pool on every exit path
    capture_handle.abort();
    let _ = capture_handle.await;
    manager.release();

    info!(pool = ?pool.stats(), "Shutterline shutting down");
    outcome
}

/// Alternate nearest-match and exact-frame shutter presses, returning to idle after each
async fn shutter_loop(
    manager: &Arc<ZslManager>,
    pool: &FramePool,
    config: &Config,
    frame_period: Duration,
    started: Instant,
) -> Result<()> {
    let (tx, rx) = bounded(4);
    let callback = Arc::new(ChannelCallback { tx });

    for press in 0..config.pipeline.shutter_presses {
        let shutter_ns = i64::try_from(started.elapsed().as_nanos())?;

        if press % 2 == 0 {
            manager.capture_zsl(shutter_ns, callback.as_ref());
        } else {
            // Ask for a frame that has not been exposed yet
            let period_ns = i64::try_from(frame_period.as_nanos())?;
            let request = FrameMetadata {
                sensor_timestamp: (shutter_ns / period_ns + 2) * period_ns,
                sequence: 0,
                exposure_time_ns: 0,
                sensitivity_iso: 0,
                aperture: 0.0,
            };
            manager.capture_zsl_request(&request, callback.clone());
        }

        match rx.recv_async().await? {
            Ok(frame) => {
                let lag_ms = (shutter_ns - frame.sensor_timestamp) as f64 / 1e6;
                info!(
                    press,
                    sensor_timestamp = frame.sensor_timestamp,
                    bytes = frame.data.len(),
                    iso = frame.metadata.sensitivity_iso,
                    "captured frame {:.1} ms from shutter",
                    lag_ms
                );
                manager.process_done(frame.sensor_timestamp);
            }
            Err(code) => error!(press, "capture failed with code {}", code.as_i32()),
        }

        manager.flush()?;
        let idle_manager = Arc::clone(manager);
        let idle = tokio::task::spawn_blocking(move || {
            idle_manager.wait_for_idle(Duration::from_millis(5000))
        })
        .await?;
        if !idle {
            return Err(eyre!("ZSL did not return to idle"));
        }

        info!(snapshot = ?manager.snapshot(), pool = ?pool.stats(), "after press {}", press);
        tokio::time::sleep(Duration::from_millis(config.pipeline.shutter_interval_ms)).await;
    }
    Ok(())
}
