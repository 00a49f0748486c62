pub mod entry;
pub mod history;
pub mod in_flight;
pub mod manager;
pub mod pending;
pub mod state;

use tracing::debug;

pub use entry::FrameEntry;
pub use history::{Admission, HistoryQueue, RetentionPolicy};
pub use in_flight::InFlight;
pub use manager::{ExactCapture, FrameSink, ZslCallback, ZslManager, ZslSnapshot};
pub use pending::PendingCorrelation;
pub use state::CaptureState;

/// Release a frame-owning value, recording why it left the pipeline.
pub(crate) fn discard<T>(item: T, sensor_timestamp: i64, reason: &'static str) {
    debug!(sensor_timestamp, reason, "releasing frame");
    metrics::counter!("zsl_frames_released", "reason" => reason).increment(1);
    drop(item);
}
