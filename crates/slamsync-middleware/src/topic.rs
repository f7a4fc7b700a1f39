//! Transform-synchronized observation topic.
//!
//! A [`SynchronizedTopic<T>`] pairs each incoming observation with the
//! transform from its frame into the topic's target frame *at the
//! observation's stamp*, and fans the pair out to its observers.  Observers
//! never see an observation without its transform.
//!
//! Observations whose transform is not yet available are either dropped or
//! parked in a bounded FIFO and retried whenever the buffer changes,
//! depending on the topic's [`UnavailablePolicy`].
//!
//! A pending head that is merely early (no sample past its stamp yet) holds
//! the line.  A head whose frames are unknown or disconnected only holds it
//! until a later observation becomes resolvable, then it is dropped.
//!
//! Delivery is strictly in arrival order.  A single drainer pulls from the
//! ready queue and calls observers with no lock held, so observers may feed
//! the topic re-entrantly without deadlocking.

use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use slamsync_perception::{FrameTransformBuffer, StampedTransform};
use slamsync_types::{Observation, Stamp, SyncError, TopicStats, UnavailableReason};
use tracing::{debug, info, warn};

use crate::registry::{Observer, ObserverRegistry, SubscriptionId};

/// FIFO depth used by [`TopicConfig::new`].
pub const DEFAULT_FILTER_QUEUE_SIZE: usize = 1000;

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// What to do with an observation whose transform is not yet available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailablePolicy {
    /// Discard it immediately.
    Drop,
    /// Park it in a FIFO of at most `capacity` entries; the oldest is evicted
    /// on overflow.
    Retry { capacity: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    /// Used in logs and error values.
    pub name: String,
    /// Frame every delivered transform maps into.
    pub target_frame: String,
    /// Overrides the observation's own `frame_id` as lookup source.
    pub source_frame: Option<String>,
    pub policy: UnavailablePolicy,
}

impl TopicConfig {
    pub fn new(name: impl Into<String>, target_frame: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_frame: target_frame.into(),
            source_frame: None,
            policy: UnavailablePolicy::Retry {
                capacity: DEFAULT_FILTER_QUEUE_SIZE,
            },
        }
    }

    pub fn with_policy(mut self, policy: UnavailablePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_source_frame(mut self, frame: impl Into<String>) -> Self {
        self.source_frame = Some(frame.into());
        self
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.target_frame.is_empty() {
            return Err(SyncError::Config(format!(
                "topic '{}' has an empty target frame",
                self.name
            )));
        }
        if let UnavailablePolicy::Retry { capacity: 0 } = self.policy {
            return Err(SyncError::Config(format!(
                "topic '{}' retry queue capacity must be at least 1",
                self.name
            )));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Delivered value
// ────────────────────────────────────────────────────────────────────────────

/// An observation paired with the transform from its frame into the topic's
/// target frame at the observation's stamp.
pub struct SynchronizedObservation<T> {
    pub observation: Arc<Observation<T>>,
    /// `parent_frame` is the target frame, `child_frame` the source frame.
    pub transform: StampedTransform,
}

impl<T> SynchronizedObservation<T> {
    pub fn stamp(&self) -> Stamp {
        self.observation.stamp
    }

    pub fn payload(&self) -> &T {
        &self.observation.payload
    }
}

impl<T> Clone for SynchronizedObservation<T> {
    fn clone(&self) -> Self {
        Self {
            observation: Arc::clone(&self.observation),
            transform: self.transform.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SynchronizedObservation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizedObservation")
            .field("observation", &self.observation)
            .field("transform", &self.transform)
            .finish()
    }
}

/// What happened to one observation handed to
/// [`SynchronizedTopic::on_observation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationOutcome {
    /// Paired with its transform and queued for delivery.
    Synchronized,
    /// Parked until its transform (or an older pending one) becomes
    /// available.
    Pending,
    /// Discarded; counted in `dropped_unavailable`.
    Dropped,
}

// ────────────────────────────────────────────────────────────────────────────
// SynchronizedTopic
// ────────────────────────────────────────────────────────────────────────────

struct TopicState<T> {
    pending: VecDeque<Arc<Observation<T>>>,
    ready: VecDeque<SynchronizedObservation<T>>,
    draining: bool,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    delivered: AtomicU64,
    dropped_unavailable: AtomicU64,
    overflowed: AtomicU64,
    resolved_after_retry: AtomicU64,
    delivery_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

pub struct SynchronizedTopic<T> {
    config: TopicConfig,
    buffer: Arc<FrameTransformBuffer>,
    observers: ObserverRegistry<SynchronizedObservation<T>>,
    state: Mutex<TopicState<T>>,
    counters: Counters,
    closed: AtomicBool,
    /// Keeps a steady stream of unavailable transforms from flooding the log.
    warn_limiter: DefaultDirectRateLimiter,
}

impl<T> SynchronizedTopic<T> {
    /// # Errors
    ///
    /// [`SyncError::Config`] for an empty target frame or a zero-capacity
    /// retry queue.
    pub fn new(config: TopicConfig, buffer: Arc<FrameTransformBuffer>) -> Result<Self, SyncError> {
        config.validate()?;
        Ok(Self {
            observers: ObserverRegistry::new(config.name.clone()),
            config,
            buffer,
            state: Mutex::new(TopicState {
                pending: VecDeque::new(),
                ready: VecDeque::new(),
                draining: false,
            }),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            warn_limiter: RateLimiter::direct(Quota::per_second(NonZeroU32::MIN)),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    pub fn buffer(&self) -> &Arc<FrameTransformBuffer> {
        &self.buffer
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer<SynchronizedObservation<T>>>) -> SubscriptionId {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Ingest one observation.
    ///
    /// Pending observations are retried first.  While any are still pending,
    /// `observation` queues behind them even if its own transform is already
    /// available, so delivery order always matches arrival order.
    ///
    /// # Errors
    ///
    /// [`SyncError::TopicClosed`] after [`close`](Self::close).
    pub fn on_observation(&self, observation: Arc<Observation<T>>) -> Result<ObservationOutcome, SyncError> {
        if self.is_closed() {
            return Err(SyncError::TopicClosed(self.config.name.clone()));
        }
        bump(&self.counters.received);

        let outcome = {
            let mut state = self.state();
            self.flush_pending(&mut state, Some(&observation));

            let outcome = if state.pending.is_empty() {
                match self.resolve(&observation) {
                    Ok(synced) => {
                        state.ready.push_back(synced);
                        ObservationOutcome::Synchronized
                    }
                    Err(err) => self.defer(&mut state, observation, Some(&err)),
                }
            } else {
                self.defer(&mut state, observation, None)
            };

            if state.draining || state.ready.is_empty() {
                return Ok(outcome);
            }
            state.draining = true;
            outcome
        };

        self.drain();
        Ok(outcome)
    }

    /// Retry the pending FIFO against the current buffer contents.
    ///
    /// Returns how many observations became deliverable.  Called by the
    /// ingress pump whenever the buffer accepts a new transform.
    pub fn retry_pending(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        let resolved = {
            let mut state = self.state();
            let resolved = self.flush_pending(&mut state, None);
            if state.draining || state.ready.is_empty() {
                return resolved;
            }
            state.draining = true;
            resolved
        };
        self.drain();
        resolved
    }

    /// Stop accepting and delivering observations.  Pending observations are
    /// discarded.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.observers.close();
        let discarded = {
            let mut state = self.state();
            let discarded = state.pending.len() + state.ready.len();
            state.pending.clear();
            state.ready.clear();
            discarded
        };
        info!(topic = %self.config.name, discarded, "topic closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn stats(&self) -> TopicStats {
        let c = &self.counters;
        TopicStats {
            received: c.received.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped_unavailable: c.dropped_unavailable.load(Ordering::Relaxed),
            overflowed: c.overflowed.load(Ordering::Relaxed),
            resolved_after_retry: c.resolved_after_retry.load(Ordering::Relaxed),
            delivery_failures: c.delivery_failures.load(Ordering::Relaxed),
            pending: self.pending_len() as u64,
        }
    }

    fn source_of<'a>(&'a self, observation: &'a Observation<T>) -> &'a str {
        self.config
            .source_frame
            .as_deref()
            .unwrap_or(&observation.frame_id)
    }

    fn resolve(&self, observation: &Arc<Observation<T>>) -> Result<SynchronizedObservation<T>, SyncError> {
        let transform = self.buffer.lookup(
            self.source_of(observation),
            &self.config.target_frame,
            observation.stamp,
        )?;
        Ok(SynchronizedObservation {
            observation: Arc::clone(observation),
            transform,
        })
    }

    fn resolves(&self, observation: &Observation<T>) -> bool {
        self.buffer.can_transform(
            self.source_of(observation),
            &self.config.target_frame,
            observation.stamp,
        )
    }

    /// Move resolvable head-of-line entries to the ready queue.  Heads that
    /// fell out of the retention window are discarded, and so are heads with
    /// unknown or disconnected frames once anything behind them (including
    /// `incoming`) resolves.
    fn flush_pending(&self, state: &mut TopicState<T>, incoming: Option<&Arc<Observation<T>>>) -> usize {
        if state.pending.is_empty() {
            return 0;
        }
        let window_start = self.buffer.window_start();
        let mut resolved = 0;
        while let Some(front) = state.pending.front() {
            let err = match self.resolve(front) {
                Ok(synced) => {
                    state.pending.pop_front();
                    state.ready.push_back(synced);
                    resolved += 1;
                    continue;
                }
                Err(err) => err,
            };
            let expired = window_start.is_some_and(|start| front.stamp < start);
            let skippable = !expired
                && is_unreachable(&err)
                && (state.pending.iter().skip(1).any(|o| self.resolves(o))
                    || incoming.is_some_and(|o| self.resolves(o)));
            if !expired && !skippable {
                break;
            }
            if let Some(stuck) = state.pending.pop_front() {
                let dropped = bump(&self.counters.dropped_unavailable);
                if expired {
                    debug!(
                        topic = %self.config.name,
                        stamp = %stuck.stamp,
                        "pending observation expired before its transform arrived"
                    );
                } else {
                    self.report_unavailable(&err, dropped);
                }
            }
        }
        self.counters
            .resolved_after_retry
            .fetch_add(resolved as u64, Ordering::Relaxed);
        resolved
    }

    /// Apply the unavailable policy.  `err` is `None` when the observation is
    /// only queued to keep order behind older pending entries.
    fn defer(
        &self,
        state: &mut TopicState<T>,
        observation: Arc<Observation<T>>,
        err: Option<&SyncError>,
    ) -> ObservationOutcome {
        let capacity = match self.config.policy {
            UnavailablePolicy::Retry { capacity } if !err.is_some_and(is_expired) => capacity,
            _ => {
                let dropped = bump(&self.counters.dropped_unavailable);
                if let Some(err) = err {
                    self.report_unavailable(err, dropped);
                }
                return ObservationOutcome::Dropped;
            }
        };

        state.pending.push_back(observation);
        while state.pending.len() > capacity {
            if let Some(evicted) = state.pending.pop_front() {
                let overflowed = bump(&self.counters.overflowed);
                if self.warn_limiter.check().is_ok() {
                    warn!(
                        topic = %self.config.name,
                        capacity,
                        overflowed,
                        stamp = %evicted.stamp,
                        "pending queue full, evicting oldest observation"
                    );
                }
            }
        }
        ObservationOutcome::Pending
    }

    fn report_unavailable(&self, err: &SyncError, dropped: u64) {
        if self.warn_limiter.check().is_ok() {
            warn!(topic = %self.config.name, error = %err, dropped, "dropping observation without transform");
        } else {
            debug!(topic = %self.config.name, error = %err, "dropping observation without transform");
        }
    }

    /// Deliver everything in the ready queue.  Only the caller that set
    /// `draining` runs this.
    fn drain(&self) {
        loop {
            let next = {
                let mut state = self.state();
                match state.ready.pop_front() {
                    Some(next) => next,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            let report = self.observers.publish(&next);
            if report.delivered > 0 {
                bump(&self.counters.delivered);
            }
            if !report.is_clean() {
                self.counters
                    .delivery_failures
                    .fetch_add(report.failures.len() as u64, Ordering::Relaxed);
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, TopicState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_expired(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::TransformUnavailable {
            reason: UnavailableReason::Expired { .. },
            ..
        }
    )
}

/// Unknown or disconnected frames, as opposed to a stamp the buffer has not
/// caught up with yet.
fn is_unreachable(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::TransformUnavailable {
            reason: UnavailableReason::UnknownFrame(_) | UnavailableReason::Disconnected,
            ..
        }
    )
}

impl<T> fmt::Debug for SynchronizedTopic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizedTopic")
            .field("config", &self.config)
            .field("observers", &self.observers.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::observer_fn;
    use slamsync_perception::Transform3D;
    use slamsync_types::stamp_from_secs;
    use std::time::Duration;

    type Seen = Arc<Mutex<Vec<(f64, u32, f32)>>>;

    fn odom_laser(buffer: &FrameTransformBuffer, secs: f64, x: f32) {
        buffer
            .insert(StampedTransform::new(
                "odom",
                "laser",
                stamp_from_secs(secs),
                Transform3D::planar(x, 0.0, 0.0),
            ))
            .unwrap();
    }

    fn scan(secs: f64, id: u32) -> Arc<Observation<u32>> {
        Observation::new(stamp_from_secs(secs), "laser", id).shared()
    }

    fn collector(topic: &SynchronizedTopic<u32>) -> Seen {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        topic.subscribe(observer_fn("collector", move |s: &SynchronizedObservation<u32>| {
            sink.lock().unwrap().push((
                slamsync_types::stamp_as_secs(s.stamp()),
                *s.payload(),
                s.transform.transform.translation.x,
            ));
            Ok(())
        }));
        seen
    }

    fn topic(policy: UnavailablePolicy) -> (Arc<FrameTransformBuffer>, SynchronizedTopic<u32>) {
        let buffer = Arc::new(FrameTransformBuffer::new(Duration::from_secs(5)));
        let config = TopicConfig::new("scan", "odom").with_policy(policy);
        let topic = SynchronizedTopic::new(config, Arc::clone(&buffer)).unwrap();
        (buffer, topic)
    }

    #[test]
    fn delivers_observation_with_transform_at_its_stamp() {
        let (buffer, topic) = topic(UnavailablePolicy::Drop);
        odom_laser(&buffer, 1.0, 0.0);
        odom_laser(&buffer, 3.0, 2.0);
        let seen = collector(&topic);

        let outcome = topic.on_observation(scan(2.0, 7)).unwrap();
        assert_eq!(outcome, ObservationOutcome::Synchronized);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, 7);
        assert!((seen[0].2 - 1.0).abs() < 1e-5);
        assert_eq!(topic.stats().delivered, 1);
    }

    #[test]
    fn delivered_transform_targets_topic_frame() {
        let (buffer, topic) = topic(UnavailablePolicy::Drop);
        odom_laser(&buffer, 1.0, 0.0);
        let captured = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&captured);
        topic.subscribe(observer_fn("capture", move |s: &SynchronizedObservation<u32>| {
            *sink.lock().unwrap() = Some(s.transform.clone());
            Ok(())
        }));

        topic.on_observation(scan(1.0, 1)).unwrap();
        let st = captured.lock().unwrap().clone().unwrap();
        assert_eq!(st.parent_frame, "odom");
        assert_eq!(st.child_frame, "laser");
        assert_eq!(st.stamp, stamp_from_secs(1.0));
    }

    #[test]
    fn drop_policy_discards_unresolvable() {
        let (_buffer, topic) = topic(UnavailablePolicy::Drop);
        let seen = collector(&topic);

        let outcome = topic.on_observation(scan(1.0, 1)).unwrap();
        assert_eq!(outcome, ObservationOutcome::Dropped);
        assert!(seen.lock().unwrap().is_empty());

        let stats = topic.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.dropped_unavailable, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn retry_fifo_evicts_oldest_and_delivers_rest_in_order() {
        let (buffer, topic) = topic(UnavailablePolicy::Retry { capacity: 2 });
        let seen = collector(&topic);

        for (secs, id) in [(1.0, 1), (2.0, 2), (3.0, 3)] {
            assert_eq!(topic.on_observation(scan(secs, id)).unwrap(), ObservationOutcome::Pending);
        }
        let stats = topic.stats();
        assert_eq!(stats.overflowed, 1);
        assert_eq!(stats.pending, 2);

        odom_laser(&buffer, 0.0, 0.0);
        odom_laser(&buffer, 4.0, 4.0);
        assert_eq!(topic.retry_pending(), 2);

        let ids: Vec<u32> = seen.lock().unwrap().iter().map(|s| s.1).collect();
        assert_eq!(ids, vec![2, 3]);
        let stats = topic.stats();
        assert_eq!(stats.resolved_after_retry, 2);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn resolvable_observation_waits_behind_pending_one() {
        let (buffer, topic) = topic(UnavailablePolicy::Retry { capacity: 10 });
        let seen = collector(&topic);
        odom_laser(&buffer, 1.0, 1.0);

        // No sample brackets t=2 yet.
        assert_eq!(topic.on_observation(scan(2.0, 1)).unwrap(), ObservationOutcome::Pending);
        // t=1 is resolvable, but must not overtake the pending scan.
        assert_eq!(topic.on_observation(scan(1.0, 2)).unwrap(), ObservationOutcome::Pending);
        assert!(seen.lock().unwrap().is_empty());

        odom_laser(&buffer, 3.0, 3.0);
        topic.retry_pending();
        let ids: Vec<u32> = seen.lock().unwrap().iter().map(|s| s.1).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn new_observation_flushes_pending_first() {
        let (buffer, topic) = topic(UnavailablePolicy::Retry { capacity: 10 });
        let seen = collector(&topic);

        topic.on_observation(scan(1.0, 1)).unwrap();
        odom_laser(&buffer, 0.0, 0.0);
        odom_laser(&buffer, 2.0, 2.0);

        let outcome = topic.on_observation(scan(2.0, 2)).unwrap();
        assert_eq!(outcome, ObservationOutcome::Synchronized);
        let ids: Vec<u32> = seen.lock().unwrap().iter().map(|s| s.1).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn pending_observation_expires_with_the_window() {
        let (buffer, topic) = topic(UnavailablePolicy::Retry { capacity: 10 });
        let seen = collector(&topic);

        topic.on_observation(scan(1.0, 1)).unwrap();
        odom_laser(&buffer, 10.0, 0.0);
        odom_laser(&buffer, 11.0, 1.0);
        assert_eq!(topic.retry_pending(), 0);

        assert!(seen.lock().unwrap().is_empty());
        let stats = topic.stats();
        assert_eq!(stats.dropped_unavailable, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn expired_arrival_is_dropped_not_parked() {
        let (buffer, topic) = topic(UnavailablePolicy::Retry { capacity: 10 });
        odom_laser(&buffer, 10.0, 0.0);

        let outcome = topic.on_observation(scan(1.0, 1)).unwrap();
        assert_eq!(outcome, ObservationOutcome::Dropped);
        assert_eq!(topic.pending_len(), 0);
    }

    #[test]
    fn all_observers_see_the_same_value() {
        let (buffer, topic) = topic(UnavailablePolicy::Drop);
        odom_laser(&buffer, 1.0, 0.0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let sink = Arc::clone(&seen);
            topic.subscribe(observer_fn("ptr", move |s: &SynchronizedObservation<u32>| {
                sink.lock().unwrap().push(Arc::clone(&s.observation));
                Ok(())
            }));
        }

        let obs = scan(1.0, 5);
        topic.on_observation(Arc::clone(&obs)).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|o| Arc::ptr_eq(o, &obs)));
    }

    #[test]
    fn failing_observer_is_counted_and_isolated() {
        let (buffer, topic) = topic(UnavailablePolicy::Drop);
        odom_laser(&buffer, 1.0, 0.0);
        topic.subscribe(observer_fn("bad", |_: &SynchronizedObservation<u32>| {
            Err(SyncError::Config("nope".to_string()))
        }));
        let seen = collector(&topic);

        topic.on_observation(scan(1.0, 1)).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
        let stats = topic.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.delivery_failures, 1);
    }

    #[test]
    fn observation_rejected_by_every_observer_is_not_delivered() {
        let (buffer, topic) = topic(UnavailablePolicy::Drop);
        odom_laser(&buffer, 1.0, 0.0);
        topic.subscribe(observer_fn("bad", |_: &SynchronizedObservation<u32>| {
            Err(SyncError::Config("nope".to_string()))
        }));

        assert_eq!(topic.on_observation(scan(1.0, 1)).unwrap(), ObservationOutcome::Synchronized);
        let stats = topic.stats();
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.delivery_failures, 1);
    }

    #[test]
    fn unknown_frame_does_not_stall_resolvable_scans() {
        let (buffer, topic) = topic(UnavailablePolicy::Retry { capacity: 100 });
        for i in 0..=40 {
            odom_laser(&buffer, i as f64 * 0.1, i as f32 * 0.1);
        }
        let seen = collector(&topic);

        let ghost = Observation::new(stamp_from_secs(1.0), "ghost", 0).shared();
        assert_eq!(topic.on_observation(ghost).unwrap(), ObservationOutcome::Pending);

        for i in 0..20u32 {
            let outcome = topic.on_observation(scan(1.05 + i as f64 * 0.1, i + 1)).unwrap();
            assert_eq!(outcome, ObservationOutcome::Synchronized);
        }

        let ids: Vec<u32> = seen.lock().unwrap().iter().map(|s| s.1).collect();
        assert_eq!(ids, (1..=20).collect::<Vec<_>>());
        let stats = topic.stats();
        assert_eq!(stats.delivered, 20);
        assert_eq!(stats.dropped_unavailable, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn unknown_frame_head_stays_until_something_behind_resolves() {
        let (buffer, topic) = topic(UnavailablePolicy::Retry { capacity: 10 });
        odom_laser(&buffer, 1.0, 1.0);
        let seen = collector(&topic);

        topic
            .on_observation(Observation::new(stamp_from_secs(1.0), "ghost", 0).shared())
            .unwrap();
        // Past the newest sample: neither entry resolves, both wait.
        assert_eq!(topic.on_observation(scan(2.0, 1)).unwrap(), ObservationOutcome::Pending);
        assert_eq!(topic.retry_pending(), 0);
        assert_eq!(topic.pending_len(), 2);

        odom_laser(&buffer, 3.0, 3.0);
        assert_eq!(topic.retry_pending(), 1);
        let ids: Vec<u32> = seen.lock().unwrap().iter().map(|s| s.1).collect();
        assert_eq!(ids, vec![1]);
        assert_eq!(topic.stats().dropped_unavailable, 1);
        assert_eq!(topic.pending_len(), 0);
    }

    #[test]
    fn source_frame_override_is_used_for_lookup() {
        let buffer = Arc::new(FrameTransformBuffer::default());
        odom_laser(&buffer, 1.0, 3.0);
        let config = TopicConfig::new("scan", "odom")
            .with_source_frame("laser")
            .with_policy(UnavailablePolicy::Drop);
        let topic = SynchronizedTopic::new(config, buffer).unwrap();
        let seen = collector(&topic);

        let obs = Observation::new(stamp_from_secs(1.0), "laser_optical", 9).shared();
        assert_eq!(topic.on_observation(obs).unwrap(), ObservationOutcome::Synchronized);
        assert!((seen.lock().unwrap()[0].2 - 3.0).abs() < 1e-5);
    }

    #[test]
    fn closed_topic_rejects_observations() {
        let (buffer, topic) = topic(UnavailablePolicy::Retry { capacity: 4 });
        topic.on_observation(scan(1.0, 1)).unwrap();
        topic.close();

        odom_laser(&buffer, 1.0, 0.0);
        assert_eq!(topic.retry_pending(), 0);
        assert_eq!(topic.pending_len(), 0);
        assert!(matches!(
            topic.on_observation(scan(1.0, 2)),
            Err(SyncError::TopicClosed(name)) if name == "scan"
        ));
    }

    #[test]
    fn rejects_invalid_config() {
        let buffer = Arc::new(FrameTransformBuffer::default());
        let zero = TopicConfig::new("scan", "odom").with_policy(UnavailablePolicy::Retry { capacity: 0 });
        assert!(matches!(
            SynchronizedTopic::<u32>::new(zero, Arc::clone(&buffer)),
            Err(SyncError::Config(_))
        ));
        let empty = TopicConfig::new("scan", "");
        assert!(SynchronizedTopic::<u32>::new(empty, buffer).is_err());
    }

    #[test]
    fn reentrant_observer_does_not_deadlock() {
        let (buffer, topic) = topic(UnavailablePolicy::Drop);
        odom_laser(&buffer, 0.0, 0.0);
        odom_laser(&buffer, 5.0, 5.0);
        let topic = Arc::new(topic);
        let seen = collector(&topic);

        // First delivery feeds a follow-up observation from inside the
        // observer; it must be delivered after the current one.
        let weak = Arc::downgrade(&topic);
        topic.subscribe(observer_fn("echo", move |s: &SynchronizedObservation<u32>| {
            if *s.payload() == 1
                && let Some(topic) = weak.upgrade()
            {
                topic.on_observation(scan(2.0, 2))?;
            }
            Ok(())
        }));

        topic.on_observation(scan(1.0, 1)).unwrap();
        let ids: Vec<u32> = seen.lock().unwrap().iter().map(|s| s.1).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn concurrent_producers_keep_per_producer_order() {
        let (buffer, topic) = topic(UnavailablePolicy::Drop);
        odom_laser(&buffer, 0.0, 0.0);
        odom_laser(&buffer, 4.0, 4.0);
        let topic = Arc::new(topic);
        let seen = collector(&topic);

        let handles: Vec<_> = (0..4u32)
            .map(|producer| {
                let topic = Arc::clone(&topic);
                std::thread::spawn(move || {
                    for seq in 0..50u32 {
                        topic.on_observation(scan(1.0, producer * 1000 + seq)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 200);
        for producer in 0..4u32 {
            let ids: Vec<u32> = seen
                .iter()
                .map(|s| s.1)
                .filter(|id| id / 1000 == producer)
                .collect();
            assert_eq!(ids.len(), 50);
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
        }
        assert_eq!(topic.stats().delivered, 200);
    }
}
