//! Egress of world model results.
//!
//! [`PoseRepublisher`] turns every pose event into an `estimate ← robot`
//! transform for a [`TransformSink`].  [`MapRepublisher`] keeps only the
//! newest map and emits it at a fixed rate: faster updates overwrite each
//! other, and a map is never emitted twice.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use slamsync_middleware::Observer;
use slamsync_perception::{StampedTransform, TransformSink};
use slamsync_types::{RepublishStats, SyncError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::world_model::{MapEvent, PoseEvent};

#[derive(Default)]
struct Counters {
    emitted: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> RepublishStats {
        RepublishStats {
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PoseRepublisher
// ────────────────────────────────────────────────────────────────────────────

pub struct PoseRepublisher {
    estimate_frame: String,
    robot_frame: String,
    sink: Arc<dyn TransformSink>,
    counters: Counters,
    warn_limiter: DefaultDirectRateLimiter,
}

impl PoseRepublisher {
    pub fn new(
        estimate_frame: impl Into<String>,
        robot_frame: impl Into<String>,
        sink: Arc<dyn TransformSink>,
    ) -> Self {
        Self {
            estimate_frame: estimate_frame.into(),
            robot_frame: robot_frame.into(),
            sink,
            counters: Counters::default(),
            warn_limiter: RateLimiter::direct(Quota::per_second(NonZeroU32::MIN)),
        }
    }

    pub fn stats(&self) -> RepublishStats {
        self.counters.snapshot()
    }
}

impl Observer<PoseEvent> for PoseRepublisher {
    fn name(&self) -> &str {
        "pose_republisher"
    }

    fn observe(&self, event: &PoseEvent) -> Result<(), SyncError> {
        let transform = StampedTransform::new(
            self.estimate_frame.clone(),
            self.robot_frame.clone(),
            event.stamp,
            event.pose,
        );
        match self.sink.send_transform(transform) {
            Ok(()) => {
                self.counters.emitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if self.warn_limiter.check().is_ok() {
                    warn!(frame = %self.robot_frame, error = %err, "robot pose not republished");
                }
                Err(err)
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MapRepublisher
// ────────────────────────────────────────────────────────────────────────────

/// External consumer of map snapshots (e.g. a map broadcaster).
pub trait MapSink<M>: Send + Sync {
    fn publish_map(&self, event: &MapEvent<M>) -> Result<(), SyncError>;
}

/// Rate-limited, retain-latest map emitter.
pub struct MapRepublisher<M> {
    period: Duration,
    sink: Arc<dyn MapSink<M>>,
    latest: Mutex<Option<MapEvent<M>>>,
    counters: Counters,
    closed: AtomicBool,
    shutdown: Notify,
}

impl<M> MapRepublisher<M> {
    /// # Errors
    ///
    /// [`SyncError::Config`] unless `rate_hz` is finite and positive.
    pub fn new(rate_hz: f64, sink: Arc<dyn MapSink<M>>) -> Result<Self, SyncError> {
        if !rate_hz.is_finite() || rate_hz <= 0.0 {
            return Err(SyncError::Config(format!(
                "map publishing rate must be positive, got {rate_hz}"
            )));
        }
        Ok(Self {
            period: Duration::from_secs_f64(1.0 / rate_hz),
            sink,
            latest: Mutex::new(None),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Replace the retained map.  An unemitted predecessor counts as dropped.
    pub fn offer(&self, event: MapEvent<M>) {
        if self.latest().replace(event).is_some() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Emit the retained map, if there is one.  Returns whether anything was
    /// emitted.
    pub fn tick(&self) -> Result<bool, SyncError> {
        let Some(event) = self.latest().take() else {
            return Ok(false);
        };
        match self.sink.publish_map(&event) {
            Ok(()) => {
                self.counters.emitted.fetch_add(1, Ordering::Relaxed);
                debug!(stamp = %event.stamp, "map republished");
                Ok(true)
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Stop a running [`spawn`](Self::spawn) loop.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub fn stats(&self) -> RepublishStats {
        self.counters.snapshot()
    }

    fn latest(&self) -> MutexGuard<'_, Option<MapEvent<M>>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<M: Send + Sync + 'static> MapRepublisher<M> {
    /// Tick on a tokio interval until [`close`](Self::close) is called.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(period_ms = self.period.as_millis() as u64, "map republisher started");
            while !self.closed.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = self.tick() {
                            warn!(error = %err, "map sink rejected snapshot");
                        }
                    }
                    _ = self.shutdown.notified() => {}
                }
            }
            info!("map republisher stopped");
        })
    }
}

impl<M: Send + Sync> Observer<MapEvent<M>> for MapRepublisher<M> {
    fn name(&self) -> &str {
        "map_republisher"
    }

    fn observe(&self, event: &MapEvent<M>) -> Result<(), SyncError> {
        self.offer(event.clone());
        Ok(())
    }
}
