//! Boundary to the localization/mapping algorithm.
//!
//! The algorithm itself lives outside this workspace.  It consumes
//! [`SynchronizedObservation`]s through [`WorldModel::feed`] and announces its
//! results as [`PoseEvent`]s and [`MapEvent`]s to whoever subscribed.
//! [`WorldModelEvents`] gives implementations the two registries for free.

use std::fmt;
use std::sync::Arc;

use slamsync_middleware::{DeliveryReport, Observer, ObserverRegistry, SubscriptionId, SynchronizedObservation};
use slamsync_perception::Transform3D;
use slamsync_types::{Stamp, SyncError};

/// Robot pose in the estimate frame (e.g. `map ← base`), as computed from the
/// observation stamped `stamp`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseEvent {
    pub stamp: Stamp,
    pub pose: Transform3D,
}

/// Opaque map snapshot.  Shared, never copied.
pub struct MapEvent<M> {
    pub stamp: Stamp,
    pub snapshot: Arc<M>,
}

impl<M> MapEvent<M> {
    pub fn new(stamp: Stamp, snapshot: Arc<M>) -> Self {
        Self { stamp, snapshot }
    }
}

impl<M> Clone for MapEvent<M> {
    fn clone(&self) -> Self {
        Self {
            stamp: self.stamp,
            snapshot: Arc::clone(&self.snapshot),
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for MapEvent<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapEvent")
            .field("stamp", &self.stamp)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

/// Interface the pipeline expects from a localization/mapping algorithm.
pub trait WorldModel: Send + Sync {
    type Observation: Send + Sync + 'static;
    type Map: Send + Sync + 'static;

    /// Advance the algorithm with one synchronized observation.  Pose and
    /// map events may be emitted synchronously from inside this call.
    fn feed(&self, observation: &SynchronizedObservation<Self::Observation>) -> Result<(), SyncError>;

    fn subscribe_pose(&self, observer: Arc<dyn Observer<PoseEvent>>) -> SubscriptionId;

    fn subscribe_map(&self, observer: Arc<dyn Observer<MapEvent<Self::Map>>>) -> SubscriptionId;
}

/// Pose and map registries for [`WorldModel`] implementations to embed.
pub struct WorldModelEvents<M> {
    poses: ObserverRegistry<PoseEvent>,
    maps: ObserverRegistry<MapEvent<M>>,
}

impl<M> WorldModelEvents<M> {
    pub fn new(name: &str) -> Self {
        Self {
            poses: ObserverRegistry::new(format!("{name}/pose")),
            maps: ObserverRegistry::new(format!("{name}/map")),
        }
    }

    pub fn subscribe_pose(&self, observer: Arc<dyn Observer<PoseEvent>>) -> SubscriptionId {
        self.poses.subscribe(observer)
    }

    pub fn subscribe_map(&self, observer: Arc<dyn Observer<MapEvent<M>>>) -> SubscriptionId {
        self.maps.subscribe(observer)
    }

    pub fn publish_pose(&self, stamp: Stamp, pose: Transform3D) -> DeliveryReport {
        self.poses.publish(&PoseEvent { stamp, pose })
    }

    pub fn publish_map(&self, stamp: Stamp, snapshot: Arc<M>) -> DeliveryReport {
        self.maps.publish(&MapEvent::new(stamp, snapshot))
    }

    pub fn close(&self) {
        self.poses.close();
        self.maps.close();
    }
}

/// Topic observer that forwards every synchronized observation into a
/// [`WorldModel`].
pub struct WorldModelFeed<W>(pub Arc<W>);

impl<W: WorldModel> Observer<SynchronizedObservation<W::Observation>> for WorldModelFeed<W> {
    fn name(&self) -> &str {
        "world_model"
    }

    fn observe(&self, value: &SynchronizedObservation<W::Observation>) -> Result<(), SyncError> {
        self.0.feed(value)
    }
}
