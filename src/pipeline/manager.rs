//! ZSL capture manager
//!
//! Frames and metadata arrive through a [`FrameSink`] onto a bounded channel drained by a
//! single worker thread, which correlates them and feeds the history queue. Capture
//! requests come from arbitrary threads and share the same core behind one mutex.
//! Consumer callbacks always run after that mutex is released.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, info, instrument, warn};

use super::discard;
use super::entry::FrameEntry;
use super::history::HistoryQueue;
use super::in_flight::InFlight;
use super::pending::PendingCorrelation;
use super::state::CaptureState;
use crate::capture::{CapturedFrame, FrameBuffer, FrameMetadata};
use crate::error::{ErrorCode, Result, ZslError};
use crate::utils::{Clock, MonotonicClock};
use crate::ZslConfig;

/// Receiver of asynchronous capture results
pub trait ZslCallback: Send + Sync {
    fn on_zsl_captured(&self, frame: CapturedFrame);
    fn on_zsl_error(&self, code: ErrorCode);
}

/// Result of an exact-timestamp capture request
#[derive(Debug)]
pub enum ExactCapture {
    Captured(CapturedFrame),
    /// The frame has not arrived yet; the callback fires when it does
    Pending,
}

/// Timestamps held by each container, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZslSnapshot {
    pub state: CaptureState,
    pub pending_images: Vec<i64>,
    pub pending_metadata: Vec<i64>,
    pub recent: Vec<i64>,
    pub history: Vec<i64>,
    pub in_flight: Vec<i64>,
    pub waiting_for: Option<i64>,
}

enum Event {
    Image(FrameBuffer),
    Metadata(FrameMetadata),
    Barrier(flume::Sender<()>),
    Shutdown,
}

struct Waiter {
    sensor_timestamp: i64,
    callback: Arc<dyn ZslCallback>,
}

enum Notification {
    Captured(Arc<dyn ZslCallback>, CapturedFrame),
    Failed(Arc<dyn ZslCallback>, ErrorCode),
}

impl Notification {
    fn deliver(self) {
        match self {
            Notification::Captured(callback, frame) => callback.on_zsl_captured(frame),
            Notification::Failed(callback, code) => callback.on_zsl_error(code),
        }
    }
}

#[derive(Default)]
struct Core {
    state: CaptureState,
    pending: PendingCorrelation,
    history: Option<HistoryQueue>,
    in_flight: InFlight,
    waiter: Option<Waiter>,
    latest_timestamp: Option<i64>,
}

impl Core {
    fn history(&self) -> Result<&HistoryQueue> {
        self.history
            .as_ref()
            .ok_or_else(|| ZslError::InternalState("no retention policy configured".into()))
    }

    fn history_mut(&mut self) -> Result<&mut HistoryQueue> {
        self.history
            .as_mut()
            .ok_or_else(|| ZslError::InternalState("no retention policy configured".into()))
    }

    fn can_admit_more(&self) -> bool {
        self.history
            .as_ref()
            .is_some_and(|h| self.in_flight.can_admit_more(h.policy().recent_capacity))
    }

    fn admit(&mut self, entry: FrameEntry) -> Option<Notification> {
        let ts = entry.sensor_timestamp;
        self.latest_timestamp = Some(self.latest_timestamp.map_or(ts, |latest| latest.max(ts)));

        if self.waiter.as_ref().is_some_and(|w| w.sensor_timestamp == ts) {
            let waiter = self.waiter.take()?;
            debug!(sensor_timestamp = ts, "awaited frame arrived");
            let frame = self.lend(entry);
            return Some(Notification::Captured(waiter.callback, frame));
        }

        let in_flight = self.in_flight.len();
        match self.history.as_mut() {
            Some(history) => {
                history.admit(entry, in_flight);
            }
            None => discard(entry, ts, "not_configured"),
        }

        self.expire_waiter(false)
    }

    /// Whether the awaited frame currently has one half parked for correlation.
    fn waiter_parked(&self) -> bool {
        self.waiter
            .as_ref()
            .is_some_and(|w| self.pending.contains(w.sensor_timestamp))
    }

    /// Fail the outstanding exact request once its frame can no longer arrive: a newer
    /// frame was correlated while no half of the awaited one is parked, or the parked
    /// half was just evicted.
    fn expire_waiter(&mut self, was_parked: bool) -> Option<Notification> {
        let target = self.waiter.as_ref()?.sensor_timestamp;
        if self.pending.contains(target) {
            return None;
        }
        let overtaken = self.latest_timestamp.is_some_and(|latest| latest > target);
        if !(was_parked || overtaken) {
            return None;
        }

        let waiter = self.waiter.take()?;
        warn!(
            requested = target,
            newest = self.latest_timestamp,
            "awaited frame was skipped by the sensor"
        );
        Some(Notification::Failed(
            waiter.callback,
            ErrorCode::NoMatchedImage,
        ))
    }

    /// Move an entry into the in-flight set and enter `Capturing`.
    fn lend(&mut self, entry: FrameEntry) -> CapturedFrame {
        let frame = entry.to_captured();
        self.in_flight.lend(entry);
        let in_flight = self.in_flight.len();
        if let Some(history) = self.history.as_mut() {
            history.enforce_budget(in_flight);
        }
        self.state = CaptureState::Capturing;
        frame
    }

    /// Release everything buffered, cancelling an outstanding exact request.
    fn reset(&mut self, reason: &'static str) -> Option<Notification> {
        if let Some(history) = self.history.as_mut() {
            history.clear(reason);
        }
        self.pending.clear(reason);
        self.latest_timestamp = None;
        self.waiter
            .take()
            .map(|w| Notification::Failed(w.callback, ErrorCode::NoMatchedImage))
    }
}

struct Shared {
    core: Mutex<Core>,
    state_changed: Condvar,
    settings: ArcSwap<ZslConfig>,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_image(&self, image: FrameBuffer) -> Option<Notification> {
        let ts = image.sensor_timestamp;
        let mut core = self.lock();
        if !core.state.accepts_frames() {
            debug!(sensor_timestamp = ts, state = %core.state, "not accepting frames");
            discard(image, ts, "not_accepting");
            return None;
        }

        let settings = self.settings.load();
        if image.width != settings.width
            || image.height != settings.height
            || image.format != settings.format
        {
            warn!(
                sensor_timestamp = ts,
                "frame {}x{} {:?} does not match configured stream {}x{} {:?}",
                image.width,
                image.height,
                image.format,
                settings.width,
                settings.height,
                settings.format
            );
            discard(image, ts, "format_mismatch");
            return None;
        }

        let parked = core.waiter_parked();
        match core.pending.offer_image(image) {
            Some((image, metadata)) => {
                let entry = FrameEntry::new(image, metadata, self.clock.now_us());
                core.admit(entry)
            }
            None => core.expire_waiter(parked),
        }
    }

    fn on_metadata(&self, metadata: FrameMetadata) -> Option<Notification> {
        let mut core = self.lock();
        if !core.state.accepts_frames() {
            debug!(
                sensor_timestamp = metadata.sensor_timestamp,
                state = %core.state,
                "not accepting metadata"
            );
            return None;
        }

        let parked = core.waiter_parked();
        match core.pending.offer_metadata(Arc::new(metadata)) {
            Some((image, metadata)) => {
                let entry = FrameEntry::new(image, metadata, self.clock.now_us());
                core.admit(entry)
            }
            None => core.expire_waiter(parked),
        }
    }
}

fn run_worker(shared: Arc<Shared>, events: flume::Receiver<Event>) {
    debug!("ZSL worker started");
    for event in events.iter() {
        let notification = match event {
            Event::Image(image) => shared.on_image(image),
            Event::Metadata(metadata) => shared.on_metadata(metadata),
            Event::Barrier(done) => {
                let _ = done.send(());
                continue;
            }
            Event::Shutdown => break,
        };
        shared.state_changed.notify_all();
        if let Some(notification) = notification {
            notification.deliver();
        }
    }
    debug!("ZSL worker stopped");
}

/// Ingestion handle given to the frame source.
///
/// Items are queued without blocking; when the worker falls behind and the queue is full,
/// the frame is released on the spot.
#[derive(Clone)]
pub struct FrameSink {
    events: flume::Sender<Event>,
}

impl FrameSink {
    pub fn on_image_available(&self, image: FrameBuffer) {
        let ts = image.sensor_timestamp;
        match self.events.try_send(Event::Image(image)) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(event)) => discard(event, ts, "queue_full"),
            Err(flume::TrySendError::Disconnected(event)) => discard(event, ts, "disconnected"),
        }
    }

    pub fn on_capture_completed(&self, metadata: FrameMetadata) {
        let ts = metadata.sensor_timestamp;
        if self.events.try_send(Event::Metadata(metadata)).is_err() {
            debug!(sensor_timestamp = ts, "metadata dropped, worker queue unavailable");
        }
    }
}

/// Zero-shutter-lag capture manager
pub struct ZslManager {
    shared: Arc<Shared>,
    events: flume::Sender<Event>,
    worker: Option<JoinHandle<()>>,
}

impl ZslManager {
    /// Create a manager with a real monotonic clock.
    pub fn new(event_queue_depth: usize) -> Result<Self> {
        Self::with_clock(event_queue_depth, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(event_queue_depth: usize, clock: Arc<dyn Clock>) -> Result<Self> {
        let shared = Arc::new(Shared {
            core: Mutex::new(Core::default()),
            state_changed: Condvar::new(),
            settings: ArcSwap::from_pointee(ZslConfig::default()),
            clock,
        });
        let (tx, rx) = flume::bounded(event_queue_depth.max(1));

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("zsl-worker".into())
            .spawn(move || run_worker(worker_shared, rx))
            .map_err(|e| ZslError::Unknown(format!("failed to spawn ZSL worker: {e}")))?;

        Ok(Self {
            shared,
            events: tx,
            worker: Some(worker),
        })
    }

    pub fn frame_sink(&self) -> FrameSink {
        FrameSink {
            events: self.events.clone(),
        }
    }

    /// Configure the session. Allowed before the stream starts or after `release`.
    #[instrument(skip(self, config), fields(width = config.width, height = config.height))]
    pub fn setup(&self, config: ZslConfig) -> Result<()> {
        let policy = config.retention_policy()?;
        {
            let mut core = self.shared.lock();
            let next = core.state.on_setup()?;
            core.pending.clear("reconfigure");
            core.history = Some(HistoryQueue::new(policy));
            core.latest_timestamp = None;
            core.state = next;
            self.shared.settings.store(Arc::new(config));
        }
        self.shared.state_changed.notify_all();

        info!(
            recent = policy.recent_capacity,
            history = policy.history_capacity,
            min_frame_interval_us = policy.min_frame_interval_us,
            history_interval_us = policy.history_interval_us,
            "ZSL configured"
        );
        Ok(())
    }

    /// Begin accepting frames.
    pub fn start(&self) -> Result<()> {
        {
            let mut core = self.shared.lock();
            core.state = core.state.on_start()?;
        }
        self.shared.state_changed.notify_all();
        info!("ZSL streaming");
        Ok(())
    }

    /// Take the buffered frame nearest to a shutter time.
    ///
    /// On success the frame is lent to the caller until [`process_done`](Self::process_done)
    /// and the manager stops buffering until the next [`flush`](Self::flush). When no frame
    /// is buffered the queue is reset and `NoMatchedImage` is returned.
    #[instrument(skip(self))]
    pub fn capture_nearest(&self, shutter_ns: i64) -> Result<CapturedFrame> {
        let (result, cancelled) = {
            let mut core = self.shared.lock();
            core.state.ensure_capturable()?;
            if !core.can_admit_more() {
                return Err(ZslError::Busy);
            }

            let latency = core.history()?.policy().shutter_latency_ns;
            let nearest = core.history_mut()?.take_nearest(shutter_ns);
            match nearest {
                Some(entry) => {
                    let delta_us = shutter_ns
                        .saturating_sub(latency)
                        .saturating_sub(entry.sensor_timestamp)
                        / 1_000;
                    metrics::histogram!("zsl_match_delta_us").record(delta_us as f64);
                    debug!(sensor_timestamp = entry.sensor_timestamp, delta_us, "matched frame");
                    (Ok(core.lend(entry)), None)
                }
                None => {
                    warn!("no buffered frame to serve, resetting queue");
                    let cancelled = core.reset("no_match");
                    core.state = CaptureState::Idle;
                    (Err(ZslError::NoMatchedImage), cancelled)
                }
            }
        };
        self.shared.state_changed.notify_all();
        if let Some(notification) = cancelled {
            notification.deliver();
        }
        result
    }

    /// Take the frame with exactly this sensor timestamp.
    ///
    /// If the frame has not been correlated yet, `callback` is stored and fired from the
    /// worker when it is. Only one such request may be outstanding.
    #[instrument(skip(self, callback))]
    pub fn capture_exact(
        &self,
        sensor_timestamp: i64,
        callback: Arc<dyn ZslCallback>,
    ) -> Result<ExactCapture> {
        let (result, cancelled) = {
            let mut core = self.shared.lock();
            core.state.ensure_capturable()?;
            if let Some(waiter) = &core.waiter {
                return Err(ZslError::InternalState(format!(
                    "exact capture of {} already pending",
                    waiter.sensor_timestamp
                )));
            }
            if !core.can_admit_more() {
                return Err(ZslError::Busy);
            }

            let exact = core.history_mut()?.take(sensor_timestamp);
            if let Some(entry) = exact {
                (Ok(ExactCapture::Captured(core.lend(entry))), None)
            } else {
                let upcoming = core
                    .latest_timestamp
                    .map_or(true, |latest| sensor_timestamp > latest)
                    || core.pending.contains(sensor_timestamp);

                if upcoming && !core.state.accepts_frames() {
                    return Err(ZslError::InternalState(format!(
                        "frame {sensor_timestamp} cannot arrive while {}",
                        core.state
                    )));
                }
                if upcoming {
                    debug!(sensor_timestamp, "waiting for requested frame");
                    core.waiter = Some(Waiter {
                        sensor_timestamp,
                        callback,
                    });
                    (Ok(ExactCapture::Pending), None)
                } else {
                    warn!(sensor_timestamp, "requested frame is not buffered, resetting queue");
                    let cancelled = core.reset("no_match");
                    core.state = CaptureState::Idle;
                    (Err(ZslError::NoMatchedImage), cancelled)
                }
            }
        };
        self.shared.state_changed.notify_all();
        if let Some(notification) = cancelled {
            notification.deliver();
        }
        result
    }

    /// Nearest-match capture reporting through `callback`.
    pub fn capture_zsl(&self, shutter_ns: i64, callback: &dyn ZslCallback) {
        match self.capture_nearest(shutter_ns) {
            Ok(frame) => callback.on_zsl_captured(frame),
            Err(e) => {
                warn!("ZSL capture failed: {}", e);
                callback.on_zsl_error(e.code());
            }
        }
    }

    /// Exact-match capture of the frame a request's metadata describes.
    pub fn capture_zsl_request(&self, request: &FrameMetadata, callback: Arc<dyn ZslCallback>) {
        match self.capture_exact(request.sensor_timestamp, Arc::clone(&callback)) {
            Ok(ExactCapture::Captured(frame)) => callback.on_zsl_captured(frame),
            Ok(ExactCapture::Pending) => {}
            Err(e) => {
                warn!("ZSL capture failed: {}", e);
                callback.on_zsl_error(e.code());
            }
        }
    }

    /// Inspect a buffered frame by sensor timestamp without taking it.
    pub fn peek_exact<R>(&self, sensor_timestamp: i64, f: impl FnOnce(&FrameEntry) -> R) -> Option<R> {
        let core = self.shared.lock();
        core.history.as_ref()?.find(sensor_timestamp).map(f)
    }

    /// Release all buffered frames and resume accepting new ones.
    #[instrument(skip(self))]
    pub fn flush(&self) -> Result<()> {
        let cancelled = {
            let mut core = self.shared.lock();
            let next = core.state.on_flush()?;
            let cancelled = core.reset("flush");
            core.state = next;
            cancelled
        };
        self.shared.state_changed.notify_all();
        if let Some(notification) = cancelled {
            notification.deliver();
        }
        Ok(())
    }

    /// Stop buffering without touching frames already buffered or lent out.
    pub fn suspend(&self) -> Result<()> {
        {
            let mut core = self.shared.lock();
            core.state = core.state.on_capture()?;
        }
        self.shared.state_changed.notify_all();
        debug!("ZSL suspended");
        Ok(())
    }

    /// Return a lent frame. Unknown or already returned timestamps are ignored.
    pub fn process_done(&self, sensor_timestamp: i64) {
        let mut core = self.shared.lock();
        if !core.in_flight.release(sensor_timestamp) {
            debug!(sensor_timestamp, "process_done for a frame not in flight");
        }
    }

    /// Tear the session down, releasing every frame including those still lent out.
    #[instrument(skip(self))]
    pub fn release(&self) {
        let cancelled = {
            let mut core = self.shared.lock();
            let cancelled = core.reset("teardown");
            let lent = core.in_flight.clear("teardown");
            if lent > 0 {
                warn!(lent, "released frames still held by consumers");
            }
            core.history = None;
            core.state = CaptureState::Invalid;
            cancelled
        };
        self.shared.state_changed.notify_all();
        if let Some(notification) = cancelled {
            notification.deliver();
        }
        info!("ZSL released");
    }

    /// Whether another capture may be served without exceeding the in-flight limit.
    pub fn can_admit_more(&self) -> bool {
        self.shared.lock().can_admit_more()
    }

    pub fn state(&self) -> CaptureState {
        self.shared.lock().state
    }

    pub fn settings(&self) -> Arc<ZslConfig> {
        self.shared.settings.load_full()
    }

    /// Block until the manager is idle or `timeout` elapses.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let core = self.shared.lock();
        let (core, _) = self
            .shared
            .state_changed
            .wait_timeout_while(core, timeout, |core| core.state != CaptureState::Idle)
            .unwrap_or_else(PoisonError::into_inner);
        core.state == CaptureState::Idle
    }

    /// Wait until every event queued before this call has been processed.
    pub fn sync(&self) -> Result<()> {
        let (done_tx, done_rx) = flume::bounded(1);
        self.events
            .send(Event::Barrier(done_tx))
            .map_err(|_| ZslError::Disconnected)?;
        done_rx.recv().map_err(|_| ZslError::Disconnected)
    }

    pub fn snapshot(&self) -> ZslSnapshot {
        let core = self.shared.lock();
        ZslSnapshot {
            state: core.state,
            pending_images: core.pending.image_timestamps(),
            pending_metadata: core.pending.metadata_timestamps(),
            recent: core
                .history
                .as_ref()
                .map(HistoryQueue::recent_timestamps)
                .unwrap_or_default(),
            history: core
                .history
                .as_ref()
                .map(HistoryQueue::history_timestamps)
                .unwrap_or_default(),
            in_flight: core.in_flight.timestamps(),
            waiting_for: core.waiter.as_ref().map(|w| w.sensor_timestamp),
        }
    }
}

impl Drop for ZslManager {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("ZSL worker panicked");
            }
        }
        self.release();
    }
}
