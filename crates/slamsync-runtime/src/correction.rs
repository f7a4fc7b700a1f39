//! Estimate ↔ reference correction publishing.
//!
//! The world model reports the robot pose in the estimate frame
//! (`map ← robot`).  The synchronized topic tells us where the robot was in
//! the reference frame at the same stamp (`odom ← robot`).  The correction
//! written back into the frame graph is
//!
//! ```text
//! map ← odom  =  (map ← robot) ∘ (odom ← robot)⁻¹
//! ```
//!
//! so that later lookups can chain `laser → odom → map`.
//!
//! Pose events may arrive after newer scans were already synchronized, so
//! references are kept in a short stamp-ordered history (bounded by the
//! retention window) and each pose is paired with the reference at its own
//! stamp, interpolated between neighbours when needed.
//!
//! The publication mode is fixed at construction:
//!
//! * [`CorrectionMode::Synchronous`] inserts before `on_pose` returns.
//! * [`CorrectionMode::Asynchronous`] hands the correction to a capacity-1
//!   retain-latest slot drained by a separate [`CorrectionWorker`].  A newer
//!   correction overwrites an unconsumed one.
//!
//! In both modes corrections reach the sink in non-decreasing stamp order.
//! Anything older than what was already published or queued is rejected with
//! [`SyncError::StaleCorrection`] and never inserted.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::TimeDelta;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use slamsync_middleware::{Observer, SynchronizedObservation};
use slamsync_perception::buffer::DEFAULT_RETENTION;
use slamsync_perception::{StampedTransform, Transform3D, TransformSink};
use slamsync_types::{CorrectionStats, Stamp, SyncError, UnavailableReason};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::world_model::PoseEvent;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMode {
    #[default]
    Synchronous,
    Asynchronous,
}

/// Frames the correction relates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionFrames {
    /// Parent of the correction, e.g. `map`.
    pub estimate: String,
    /// Child of the correction, e.g. `odom_combined`.
    pub reference: String,
}

impl CorrectionFrames {
    pub fn new(estimate: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            estimate: estimate.into(),
            reference: reference.into(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Shared core
// ────────────────────────────────────────────────────────────────────────────

struct Ledger {
    /// `reference ← robot` transforms seen on the topic, oldest first.
    references: VecDeque<StampedTransform>,
    retention: TimeDelta,
    last_published: Option<Stamp>,
}

impl Ledger {
    fn new(retention: Duration) -> Self {
        Self {
            references: VecDeque::new(),
            retention: TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX),
            last_published: None,
        }
    }

    fn window_start(&self) -> Option<Stamp> {
        self.references.back()?.stamp.checked_sub_signed(self.retention)
    }

    /// Insert in stamp order; a same-stamp entry is replaced.
    fn record(&mut self, reference: StampedTransform) {
        if self.window_start().is_some_and(|start| reference.stamp < start) {
            return;
        }
        let idx = self.references.partition_point(|r| r.stamp < reference.stamp);
        if self.references.get(idx).is_some_and(|r| r.stamp == reference.stamp) {
            self.references[idx] = reference;
        } else {
            self.references.insert(idx, reference);
        }
        if let Some(start) = self.window_start() {
            while self.references.front().is_some_and(|r| r.stamp < start) {
                self.references.pop_front();
            }
        }
    }

    /// Reference at `stamp`, interpolated between the bracketing entries.
    /// `frame` names the reference frame when nothing was recorded yet.
    fn reference_at(&self, frame: &str, stamp: Stamp) -> Result<Transform3D, UnavailableReason> {
        let (Some(oldest), Some(newest)) = (self.references.front(), self.references.back()) else {
            return Err(UnavailableReason::UnknownFrame(frame.to_string()));
        };
        let idx = self.references.partition_point(|r| r.stamp < stamp);
        if let Some(exact) = self.references.get(idx)
            && exact.stamp == stamp
        {
            return Ok(exact.transform);
        }
        if stamp < oldest.stamp {
            return Err(UnavailableReason::Expired {
                window_start: oldest.stamp,
            });
        }
        let (Some(before), Some(after)) = (
            idx.checked_sub(1).and_then(|i| self.references.get(i)),
            self.references.get(idx),
        ) else {
            return Err(UnavailableReason::NoSample {
                parent: newest.parent_frame.clone(),
                child: newest.child_frame.clone(),
            });
        };
        let span = (after.stamp - before.stamp).num_nanoseconds().unwrap_or(i64::MAX) as f64;
        let offset = (stamp - before.stamp).num_nanoseconds().unwrap_or(0) as f64;
        Ok(before.transform.interpolate(after.transform, (offset / span) as f32))
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    stale: AtomicU64,
    superseded: AtomicU64,
    missing_reference: AtomicU64,
    failed: AtomicU64,
}

struct Core {
    frames: CorrectionFrames,
    sink: Arc<dyn TransformSink>,
    ledger: Mutex<Ledger>,
    counters: Counters,
    warn_limiter: DefaultDirectRateLimiter,
}

impl Core {
    fn new(frames: CorrectionFrames, sink: Arc<dyn TransformSink>) -> Self {
        Self {
            frames,
            sink,
            ledger: Mutex::new(Ledger::new(DEFAULT_RETENTION)),
            counters: Counters::default(),
            warn_limiter: RateLimiter::direct(Quota::per_second(NonZeroU32::MIN)),
        }
    }

    /// Build the correction for `event` from the reference at its stamp.
    fn prepare(&self, event: &PoseEvent) -> Result<StampedTransform, SyncError> {
        let ledger = self.ledger();
        if let Some(latest) = ledger.last_published
            && event.stamp < latest
        {
            return Err(self.stale(event.stamp, latest));
        }
        let reference = match ledger.reference_at(&self.frames.reference, event.stamp) {
            Ok(reference) => reference,
            Err(reason) => {
                self.counters.missing_reference.fetch_add(1, Ordering::Relaxed);
                debug!(stamp = %event.stamp, %reason, "no reference transform for pose event");
                return Err(SyncError::TransformUnavailable {
                    source_frame: self.frames.reference.clone(),
                    target_frame: self.frames.estimate.clone(),
                    stamp: event.stamp,
                    reason,
                });
            }
        };
        let correction = event.pose.compose(reference.inverse());
        Ok(StampedTransform::new(
            self.frames.estimate.clone(),
            self.frames.reference.clone(),
            event.stamp,
            correction,
        ))
    }

    /// Insert into the sink.  The ledger lock is held across the insert so
    /// concurrent commits cannot reorder.
    fn commit(&self, correction: StampedTransform) -> Result<(), SyncError> {
        let mut ledger = self.ledger();
        if let Some(latest) = ledger.last_published
            && correction.stamp < latest
        {
            return Err(self.stale(correction.stamp, latest));
        }
        let stamp = correction.stamp;
        match self.sink.send_transform(correction) {
            Ok(()) => {
                ledger.last_published = Some(stamp);
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                debug!(%stamp, "correction published");
                Ok(())
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    estimate = %self.frames.estimate,
                    reference = %self.frames.reference,
                    error = %err,
                    "correction rejected by sink"
                );
                Err(err)
            }
        }
    }

    fn stale(&self, stamp: Stamp, latest: Stamp) -> SyncError {
        let stale = self.counters.stale.fetch_add(1, Ordering::Relaxed) + 1;
        if self.warn_limiter.check().is_ok() {
            warn!(%stamp, %latest, stale, "discarding out-of-order correction");
        }
        SyncError::StaleCorrection { stamp, latest }
    }

    fn set_reference(&self, reference: StampedTransform) {
        self.ledger().record(reference);
    }

    fn stats(&self) -> CorrectionStats {
        let c = &self.counters;
        CorrectionStats {
            published: c.published.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
            superseded: c.superseded.load(Ordering::Relaxed),
            missing_reference: c.missing_reference.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Retain-latest slot
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct SlotState {
    pending: Option<StampedTransform>,
    closed: bool,
}

enum Offer {
    Stored,
    Superseded,
    Stale(Stamp),
}

#[derive(Default)]
struct LatestSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl LatestSlot {
    fn offer(&self, correction: StampedTransform) -> Offer {
        let offer = {
            let mut state = self.state();
            let offer = match state.pending.as_ref() {
                Some(queued) if correction.stamp < queued.stamp => return Offer::Stale(queued.stamp),
                Some(_) => Offer::Superseded,
                None => Offer::Stored,
            };
            state.pending = Some(correction);
            offer
        };
        self.notify.notify_one();
        offer
    }

    /// `(queued correction, closed)`
    fn take(&self) -> (Option<StampedTransform>, bool) {
        let mut state = self.state();
        (state.pending.take(), state.closed)
    }

    fn close(&self) {
        self.state().closed = true;
        self.notify.notify_one();
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CorrectionPublisher
// ────────────────────────────────────────────────────────────────────────────

enum Publication {
    Inline,
    Deferred(Arc<LatestSlot>),
}

/// Publishes `estimate ← reference` corrections derived from pose events.
///
/// Subscribe it both to the synchronized topic (to track the reference) and
/// to the world model's pose events.
pub struct CorrectionPublisher {
    core: Arc<Core>,
    publication: Publication,
}

impl CorrectionPublisher {
    pub fn synchronous(frames: CorrectionFrames, sink: Arc<dyn TransformSink>) -> Self {
        Self {
            core: Arc::new(Core::new(frames, sink)),
            publication: Publication::Inline,
        }
    }

    /// The returned worker must be driven ([`CorrectionWorker::spawn`] or
    /// [`CorrectionWorker::drain_once`]) for corrections to reach the sink.
    pub fn asynchronous(frames: CorrectionFrames, sink: Arc<dyn TransformSink>) -> (Self, CorrectionWorker) {
        let core = Arc::new(Core::new(frames, sink));
        let slot = Arc::new(LatestSlot::default());
        let worker = CorrectionWorker {
            core: Arc::clone(&core),
            slot: Arc::clone(&slot),
        };
        (
            Self {
                core,
                publication: Publication::Deferred(slot),
            },
            worker,
        )
    }

    /// Worker is `Some` exactly in asynchronous mode.
    pub fn new(
        mode: CorrectionMode,
        frames: CorrectionFrames,
        sink: Arc<dyn TransformSink>,
    ) -> (Self, Option<CorrectionWorker>) {
        match mode {
            CorrectionMode::Synchronous => (Self::synchronous(frames, sink), None),
            CorrectionMode::Asynchronous => {
                let (publisher, worker) = Self::asynchronous(frames, sink);
                (publisher, Some(worker))
            }
        }
    }

    pub fn mode(&self) -> CorrectionMode {
        match self.publication {
            Publication::Inline => CorrectionMode::Synchronous,
            Publication::Deferred(_) => CorrectionMode::Asynchronous,
        }
    }

    pub fn frames(&self) -> &CorrectionFrames {
        &self.core.frames
    }

    /// How far behind the newest reference a pose event may still be
    /// paired.  Defaults to the buffer's default retention.
    pub fn with_reference_retention(self, retention: Duration) -> Self {
        self.core.ledger().retention = TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX);
        self
    }

    /// Record a `reference ← robot` transform.  Entries older than the
    /// retention window behind the newest one are discarded.
    pub fn update_reference(&self, reference: StampedTransform) {
        self.core.set_reference(reference);
    }

    /// Handle one pose event.
    ///
    /// # Errors
    ///
    /// * [`SyncError::StaleCorrection`] when `event` is older than the last
    ///   published (or queued) correction.
    /// * [`SyncError::TransformUnavailable`] when no recorded reference
    ///   covers the event's stamp.
    /// * Whatever the sink returns, in synchronous mode.
    pub fn on_pose(&self, event: &PoseEvent) -> Result<(), SyncError> {
        let correction = self.core.prepare(event)?;
        match &self.publication {
            Publication::Inline => self.core.commit(correction),
            Publication::Deferred(slot) => match slot.offer(correction) {
                Offer::Stored => Ok(()),
                Offer::Superseded => {
                    self.core.counters.superseded.fetch_add(1, Ordering::Relaxed);
                    debug!(stamp = %event.stamp, "queued correction superseded");
                    Ok(())
                }
                Offer::Stale(queued) => Err(self.core.stale(event.stamp, queued)),
            },
        }
    }

    /// Stamp of the newest correction that reached the sink.
    pub fn last_published(&self) -> Option<Stamp> {
        self.core.ledger().last_published
    }

    pub fn stats(&self) -> CorrectionStats {
        self.core.stats()
    }

    /// Let the worker exit once it has published whatever is queued.  No-op
    /// in synchronous mode.
    pub fn close(&self) {
        if let Publication::Deferred(slot) = &self.publication {
            slot.close();
        }
    }
}

impl Drop for CorrectionPublisher {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> Observer<SynchronizedObservation<T>> for CorrectionPublisher {
    fn name(&self) -> &str {
        "correction_reference"
    }

    fn observe(&self, value: &SynchronizedObservation<T>) -> Result<(), SyncError> {
        if value.transform.parent_frame == self.core.frames.reference {
            self.update_reference(value.transform.clone());
        }
        Ok(())
    }
}

impl Observer<PoseEvent> for CorrectionPublisher {
    fn name(&self) -> &str {
        "correction_publisher"
    }

    fn observe(&self, value: &PoseEvent) -> Result<(), SyncError> {
        // Stale and unresolvable events are already counted and logged.
        self.on_pose(value)
            .or_else(|err| if err.is_fatal() { Err(err) } else { Ok(()) })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CorrectionWorker
// ────────────────────────────────────────────────────────────────────────────

/// Background half of an asynchronous [`CorrectionPublisher`].
pub struct CorrectionWorker {
    core: Arc<Core>,
    slot: Arc<LatestSlot>,
}

impl CorrectionWorker {
    /// Publish the queued correction, if any.  Returns whether one was taken.
    pub fn drain_once(&self) -> Result<bool, SyncError> {
        match self.slot.take() {
            (Some(correction), _) => self.core.commit(correction).map(|()| true),
            (None, _) => Ok(false),
        }
    }

    /// Drain until the publisher is dropped.
    pub async fn run(self) {
        info!(
            estimate = %self.core.frames.estimate,
            reference = %self.core.frames.reference,
            "correction worker started"
        );
        loop {
            let (pending, closed) = self.slot.take();
            if let Some(correction) = pending {
                // Failures are counted and logged by commit.
                let _ = self.core.commit(correction);
                continue;
            }
            if closed {
                break;
            }
            self.slot.notify.notified().await;
        }
        info!("correction worker stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
