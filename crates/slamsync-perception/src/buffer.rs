//! Time-windowed frame transform buffer.
//!
//! Keeps a bounded history of [`StampedTransform`]s per frame pair and
//! answers "where was frame A relative to frame B at time T" by chaining
//! edges along the shortest path and interpolating each edge between its two
//! bracketing samples.
//!
//! Retention is measured from the newest stamp ever inserted, not from the
//! wall clock.  A lookup older than `latest − retention` always fails with
//! [`UnavailableReason::Expired`].  One sample preceding the window is kept
//! per edge so that stamps right at the start of the window can still be
//! interpolated.
//!
//! The frame graph must stay a forest.  An insert that would connect two
//! frames that are already connected is rejected with
//! [`SyncError::FrameGraphCycle`].
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use slamsync_perception::buffer::FrameTransformBuffer;
//! use slamsync_perception::transform::{StampedTransform, Transform3D};
//! use slamsync_types::stamp_from_secs;
//!
//! let buffer = FrameTransformBuffer::new(Duration::from_secs(5));
//! buffer.insert(StampedTransform::new("odom", "base_link", stamp_from_secs(0.0),
//!     Transform3D::planar(0.0, 0.0, 0.0))).unwrap();
//! buffer.insert(StampedTransform::new("odom", "base_link", stamp_from_secs(2.0),
//!     Transform3D::planar(2.0, 0.0, 0.0))).unwrap();
//!
//! let t = buffer.lookup("base_link", "odom", stamp_from_secs(1.0)).unwrap();
//! assert!((t.transform.translation.x - 1.0).abs() < 1e-5);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::TimeDelta;
use slamsync_types::{Stamp, SyncError, UnavailableReason};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::transform::{StampedTransform, Transform3D};

/// Retention used by [`FrameTransformBuffer::default`].
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5);

// ────────────────────────────────────────────────────────────────────────────
// TransformSink
// ────────────────────────────────────────────────────────────────────────────

/// Anything that accepts transforms: the local buffer, or an external
/// broadcaster.
pub trait TransformSink: Send + Sync {
    fn send_transform(&self, transform: StampedTransform) -> Result<(), SyncError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Internal graph
// ────────────────────────────────────────────────────────────────────────────

type EdgeKey = (String, String);

fn edge_key(parent: &str, child: &str) -> EdgeKey {
    (parent.to_string(), child.to_string())
}

#[derive(Debug)]
enum EdgeHistory {
    /// Fixed mount; valid at every stamp and never evicted.
    Static(Transform3D),
    /// Samples sorted by stamp, no duplicate stamps.
    Dynamic(VecDeque<(Stamp, Transform3D)>),
}

impl EdgeHistory {
    fn sample_at(&self, stamp: Stamp) -> Option<Transform3D> {
        let samples = match self {
            Self::Static(transform) => return Some(*transform),
            Self::Dynamic(samples) => samples,
        };

        let idx = samples.partition_point(|(s, _)| *s < stamp);
        if let Some((s, transform)) = samples.get(idx)
            && *s == stamp
        {
            return Some(*transform);
        }
        if idx == 0 || idx >= samples.len() {
            return None;
        }

        let (t0, before) = samples[idx - 1];
        let (t1, after) = samples[idx];
        let span = (t1 - t0).num_nanoseconds()? as f64;
        let offset = (stamp - t0).num_nanoseconds()? as f64;
        Some(before.interpolate(after, (offset / span) as f32))
    }

    fn len(&self) -> usize {
        match self {
            Self::Static(_) => 1,
            Self::Dynamic(samples) => samples.len(),
        }
    }
}

#[derive(Debug, Default)]
struct FrameGraph {
    /// `edges[(parent, child)]`
    edges: HashMap<EdgeKey, EdgeHistory>,
    /// Undirected adjacency used for path search and cycle detection.
    neighbours: HashMap<String, HashSet<String>>,
    latest: Option<Stamp>,
    generation: u64,
}

impl FrameGraph {
    fn window_start(&self, retention: TimeDelta) -> Option<Stamp> {
        self.latest?.checked_sub_signed(retention)
    }

    fn link(&mut self, parent: &str, child: &str) {
        self.neighbours
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string());
        self.neighbours
            .entry(child.to_string())
            .or_default()
            .insert(parent.to_string());
    }

    fn unlink(&mut self, parent: &str, child: &str) {
        for (a, b) in [(parent, child), (child, parent)] {
            if let Some(set) = self.neighbours.get_mut(a) {
                set.remove(b);
                if set.is_empty() {
                    self.neighbours.remove(a);
                }
            }
        }
    }

    /// BFS over the undirected graph; returns the frames from `from` to `to`
    /// inclusive.
    fn shortest_path<'a>(&'a self, from: &'a str, to: &'a str) -> Option<Vec<String>> {
        let mut came_from: HashMap<&str, &str> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        let mut visited: HashSet<&str> = HashSet::new();

        queue.push_back(from);
        visited.insert(from);

        while let Some(current) = queue.pop_front() {
            if current == to {
                let mut path = vec![to.to_string()];
                let mut node = to;
                while let Some(prev) = came_from.get(node) {
                    path.push(prev.to_string());
                    node = *prev;
                }
                path.reverse();
                return Some(path);
            }
            for next in self.neighbours.get(current).into_iter().flatten() {
                if visited.insert(next.as_str()) {
                    came_from.insert(next.as_str(), current);
                    queue.push_back(next.as_str());
                }
            }
        }
        None
    }

    fn connected(&self, a: &str, b: &str) -> bool {
        self.neighbours.contains_key(a)
            && self.neighbours.contains_key(b)
            && self.shortest_path(a, b).is_some()
    }

    fn evict(&mut self, retention: TimeDelta) {
        let Some(start) = self.window_start(retention) else {
            return;
        };

        let mut expired = Vec::new();
        for (key, history) in &mut self.edges {
            let EdgeHistory::Dynamic(samples) = history else {
                continue;
            };
            // Keep the last sample at or before `start` as an interpolation
            // anchor for stamps at the very start of the window.
            while samples.len() >= 2 && samples[1].0 <= start {
                samples.pop_front();
            }
            if samples.back().is_none_or(|(s, _)| *s < start) {
                expired.push(key.clone());
            }
        }

        for (parent, child) in expired {
            debug!(parent = %parent, child = %child, "edge fell out of the retention window");
            self.edges.remove(&(parent.clone(), child.clone()));
            self.unlink(&parent, &child);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// FrameTransformBuffer
// ────────────────────────────────────────────────────────────────────────────

/// Bounded-duration transform history shared between producer contexts.
///
/// All access goes through one internal mutex; no reference to the internal
/// graph ever leaves a method call.  Share it as `Arc<FrameTransformBuffer>`.
#[derive(Debug)]
pub struct FrameTransformBuffer {
    retention: TimeDelta,
    graph: Mutex<FrameGraph>,
    generation_tx: watch::Sender<u64>,
}

impl FrameTransformBuffer {
    /// Create an empty buffer keeping `retention` worth of history.
    pub fn new(retention: Duration) -> Self {
        let (generation_tx, _) = watch::channel(0);
        Self {
            retention: TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX),
            graph: Mutex::new(FrameGraph::default()),
            generation_tx,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention.to_std().unwrap_or(Duration::MAX)
    }

    /// Add a time-varying transform.
    ///
    /// Samples older than the retention window are silently ignored; a sample
    /// whose stamp is already stored on the same edge replaces it.
    ///
    /// # Errors
    ///
    /// [`SyncError::FrameGraphCycle`] when the edge would connect two frames
    /// that are already connected, and [`SyncError::Config`] when the edge was
    /// declared static.
    pub fn insert(&self, transform: StampedTransform) -> Result<(), SyncError> {
        self.insert_edge(transform, false)
    }

    /// Add a fixed transform (e.g. a sensor mount).  Its stamp is ignored for
    /// lookups and it never expires.
    pub fn insert_static(&self, transform: StampedTransform) -> Result<(), SyncError> {
        self.insert_edge(transform, true)
    }

    fn insert_edge(&self, st: StampedTransform, is_static: bool) -> Result<(), SyncError> {
        let StampedTransform {
            parent_frame,
            child_frame,
            stamp,
            transform,
        } = st;
        let key = edge_key(&parent_frame, &child_frame);

        let generation = {
            let mut guard = self.graph();
            let graph = &mut *guard;

            if !graph.edges.contains_key(&key)
                && (parent_frame == child_frame || graph.connected(&parent_frame, &child_frame))
            {
                warn!(parent = %parent_frame, child = %child_frame, "rejecting transform that closes a cycle");
                return Err(SyncError::FrameGraphCycle {
                    parent: parent_frame,
                    child: child_frame,
                });
            }

            if !is_static
                && let Some(start) = graph.window_start(self.retention)
                && stamp < start
            {
                debug!(
                    parent = %parent_frame,
                    child = %child_frame,
                    %stamp,
                    "ignoring transform older than the retention window"
                );
                return Ok(());
            }

            match (graph.edges.get_mut(&key), is_static) {
                (None, true) => {
                    graph.edges.insert(key, EdgeHistory::Static(transform));
                    graph.link(&parent_frame, &child_frame);
                }
                (None, false) => {
                    graph
                        .edges
                        .insert(key, EdgeHistory::Dynamic(VecDeque::from([(stamp, transform)])));
                    graph.link(&parent_frame, &child_frame);
                }
                (Some(EdgeHistory::Static(existing)), true) => *existing = transform,
                (Some(EdgeHistory::Dynamic(samples)), false) => {
                    let idx = samples.partition_point(|(s, _)| *s < stamp);
                    match samples.get_mut(idx) {
                        Some(slot) if slot.0 == stamp => slot.1 = transform,
                        _ => samples.insert(idx, (stamp, transform)),
                    }
                }
                (Some(_), _) => {
                    return Err(SyncError::Config(format!(
                        "edge {parent_frame} -> {child_frame} cannot mix static and dynamic transforms"
                    )));
                }
            }

            if !is_static {
                graph.latest = Some(graph.latest.map_or(stamp, |latest| latest.max(stamp)));
                graph.evict(self.retention);
            }
            graph.generation += 1;
            graph.generation
        };

        self.generation_tx.send_replace(generation);
        Ok(())
    }

    /// Transform mapping points in `source` into `target` at `stamp`.
    ///
    /// The result's `parent_frame` is `target` and its `child_frame` is
    /// `source`.  If any edge on the path has no sample bracketing `stamp`
    /// the whole lookup fails; partial chains are never returned.
    pub fn lookup(
        &self,
        source: &str,
        target: &str,
        stamp: Stamp,
    ) -> Result<StampedTransform, SyncError> {
        let unavailable = |reason: UnavailableReason| SyncError::TransformUnavailable {
            source_frame: source.to_string(),
            target_frame: target.to_string(),
            stamp,
            reason,
        };

        let graph = self.graph();

        if let Some(start) = graph.window_start(self.retention)
            && stamp < start
        {
            return Err(unavailable(UnavailableReason::Expired {
                window_start: start,
            }));
        }
        if source == target {
            return Ok(StampedTransform::new(target, source, stamp, Transform3D::identity()));
        }
        for frame in [source, target] {
            if !graph.neighbours.contains_key(frame) {
                return Err(unavailable(UnavailableReason::UnknownFrame(frame.to_string())));
            }
        }

        let path = graph
            .shortest_path(source, target)
            .ok_or_else(|| unavailable(UnavailableReason::Disconnected))?;

        // acc = T_current_source, extended one hop at a time.
        let mut acc = Transform3D::identity();
        for hop in path.windows(2) {
            let (from, to) = (hop[0].as_str(), hop[1].as_str());
            let step = if let Some(history) = graph.edges.get(&edge_key(to, from)) {
                history.sample_at(stamp).ok_or_else(|| {
                    unavailable(UnavailableReason::NoSample {
                        parent: to.to_string(),
                        child: from.to_string(),
                    })
                })?
            } else if let Some(history) = graph.edges.get(&edge_key(from, to)) {
                history
                    .sample_at(stamp)
                    .ok_or_else(|| {
                        unavailable(UnavailableReason::NoSample {
                            parent: from.to_string(),
                            child: to.to_string(),
                        })
                    })?
                    .inverse()
            } else {
                return Err(unavailable(UnavailableReason::Disconnected));
            };
            acc = step.compose(acc);
        }

        Ok(StampedTransform::new(target, source, stamp, acc))
    }

    pub fn can_transform(&self, source: &str, target: &str, stamp: Stamp) -> bool {
        self.lookup(source, target, stamp).is_ok()
    }

    /// Newest stamp inserted so far.
    pub fn latest_stamp(&self) -> Option<Stamp> {
        self.graph().latest
    }

    /// Oldest stamp still queryable.
    pub fn window_start(&self) -> Option<Stamp> {
        self.graph().window_start(self.retention)
    }

    /// Number of samples retained for the `parent -> child` edge.
    pub fn sample_count(&self, parent: &str, child: &str) -> usize {
        self.graph()
            .edges
            .get(&edge_key(parent, child))
            .map_or(0, EdgeHistory::len)
    }

    /// Newest retained sample of the `parent -> child` edge.
    pub fn latest_sample(&self, parent: &str, child: &str) -> Option<StampedTransform> {
        let graph = self.graph();
        let (stamp, transform) = match graph.edges.get(&edge_key(parent, child))? {
            EdgeHistory::Static(t) => (graph.latest.unwrap_or_default(), *t),
            EdgeHistory::Dynamic(samples) => *samples.back()?,
        };
        Some(StampedTransform::new(parent, child, stamp, transform))
    }

    /// All known frames, sorted.
    pub fn frames(&self) -> Vec<String> {
        let mut frames: Vec<String> = self.graph().neighbours.keys().cloned().collect();
        frames.sort();
        frames
    }

    /// Monotonic counter bumped by every accepted insert.
    pub fn generation(&self) -> u64 {
        *self.generation_tx.borrow()
    }

    /// Watch the insert generation; changes whenever new transforms land.
    pub fn subscribe_inserts(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }

    fn graph(&self) -> MutexGuard<'_, FrameGraph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FrameTransformBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl TransformSink for FrameTransformBuffer {
    fn send_transform(&self, transform: StampedTransform) -> Result<(), SyncError> {
        self.insert(transform)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
