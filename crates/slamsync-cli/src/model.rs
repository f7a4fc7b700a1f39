//! Synthetic robot and a toy world model for the demo.
//!
//! The robot drives a circle in the map frame.  Wheel odometry drifts a
//! little more every second, and each scan carries a beacon fix of the true
//! laser pose, so the published correction converges on the inverse drift.

use std::f32::consts::FRAC_PI_2;
use std::sync::{Arc, Mutex, PoisonError};

use slamsync_middleware::{Observer, SubscriptionId, SynchronizedObservation};
use slamsync_perception::Transform3D;
use slamsync_runtime::{MapEvent, MapSink, PoseEvent, WorldModel, WorldModelEvents};
use slamsync_types::SyncError;
use tracing::info;

pub const LASER_FRAME: &str = "laser";

const RADIUS: f32 = 2.0;
const ANGULAR_SPEED: f32 = 0.2;
const BEAMS: usize = 36;
/// A trail snapshot is emitted every this many scans.
const SNAPSHOT_EVERY: usize = 10;

/// Visited `(x, y)` positions in the map frame.
pub type Trail = Vec<(f32, f32)>;

/// Ground-truth `map ← laser` after `t` seconds.
pub fn true_pose_at(t: f32) -> Transform3D {
    let heading = ANGULAR_SPEED * t;
    Transform3D::planar(RADIUS * heading.cos(), RADIUS * heading.sin(), heading + FRAC_PI_2)
}

/// `odom ← map` error accumulated by wheel odometry.
fn drift_at(t: f32) -> Transform3D {
    Transform3D::planar(0.01 * t, -0.005 * t, 0.002 * t)
}

/// `odom ← laser` as reported by wheel odometry.
pub fn odometry_at(t: f32) -> Transform3D {
    drift_at(t).compose(true_pose_at(t))
}

pub struct Scan {
    pub ranges: Vec<f32>,
    pub beacon_fix: Transform3D,
}

pub fn synthetic_scan(t: f32) -> Scan {
    let ranges = (0..BEAMS)
        .map(|i| RADIUS + 0.5 + 0.1 * (i as f32 * 0.5 + t).sin())
        .collect();
    Scan {
        ranges,
        beacon_fix: true_pose_at(t),
    }
}

/// Localizes every scan from its beacon fix and keeps a trail as the map.
pub struct BeaconLocalizer {
    events: WorldModelEvents<Trail>,
    trail: Mutex<Trail>,
}

impl BeaconLocalizer {
    pub fn new() -> Self {
        Self {
            events: WorldModelEvents::new("beacon_localizer"),
            trail: Mutex::new(Vec::new()),
        }
    }
}

impl Default for BeaconLocalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldModel for BeaconLocalizer {
    type Observation = Scan;
    type Map = Trail;

    fn feed(&self, observation: &SynchronizedObservation<Scan>) -> Result<(), SyncError> {
        let scan = observation.payload();
        if scan.ranges.is_empty() {
            return Err(SyncError::ObserverDeliveryFailure {
                observer: "beacon_localizer".to_string(),
                details: "scan without ranges".to_string(),
            });
        }
        let pose = scan.beacon_fix;
        let snapshot = {
            let mut trail = self.trail.lock().unwrap_or_else(PoisonError::into_inner);
            trail.push((pose.translation.x, pose.translation.y));
            (trail.len() % SNAPSHOT_EVERY == 0).then(|| Arc::new(trail.clone()))
        };

        self.events.publish_pose(observation.stamp(), pose);
        if let Some(snapshot) = snapshot {
            self.events.publish_map(observation.stamp(), snapshot);
        }
        Ok(())
    }

    fn subscribe_pose(&self, observer: Arc<dyn Observer<PoseEvent>>) -> SubscriptionId {
        self.events.subscribe_pose(observer)
    }

    fn subscribe_map(&self, observer: Arc<dyn Observer<MapEvent<Trail>>>) -> SubscriptionId {
        self.events.subscribe_map(observer)
    }
}

pub struct LoggingMapSink;

impl MapSink<Trail> for LoggingMapSink {
    fn publish_map(&self, event: &MapEvent<Trail>) -> Result<(), SyncError> {
        let last = event.snapshot.last().copied().unwrap_or_default();
        info!(
            stamp = %event.stamp,
            points = event.snapshot.len(),
            x = last.0,
            y = last.1,
            "map snapshot"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slamsync_perception::StampedTransform;
    use slamsync_types::{Observation, stamp_from_secs};

    #[test]
    fn odometry_is_drifted_truth() {
        let t = 12.0;
        let recovered = drift_at(t).inverse().compose(odometry_at(t));
        let truth = true_pose_at(t);
        assert!((recovered.translation.x - truth.translation.x).abs() < 1e-4);
        assert!((recovered.translation.y - truth.translation.y).abs() < 1e-4);
    }

    #[test]
    fn localizer_emits_pose_per_scan_and_periodic_trail() {
        let localizer = BeaconLocalizer::new();
        let poses = Arc::new(Mutex::new(0usize));
        let trails = Arc::new(Mutex::new(Vec::new()));
        let p = Arc::clone(&poses);
        localizer.subscribe_pose(slamsync_middleware::observer_fn("poses", move |_: &PoseEvent| {
            *p.lock().unwrap() += 1;
            Ok(())
        }));
        let m = Arc::clone(&trails);
        localizer.subscribe_map(slamsync_middleware::observer_fn("trails", move |e: &MapEvent<Trail>| {
            m.lock().unwrap().push(e.snapshot.len());
            Ok(())
        }));

        for i in 0..25 {
            let t = i as f32 * 0.05;
            let observation = SynchronizedObservation {
                observation: Observation::new(stamp_from_secs(t as f64), LASER_FRAME, synthetic_scan(t)).shared(),
                transform: StampedTransform::new("odom", LASER_FRAME, stamp_from_secs(t as f64), odometry_at(t)),
            };
            localizer.feed(&observation).unwrap();
        }

        assert_eq!(*poses.lock().unwrap(), 25);
        assert_eq!(*trails.lock().unwrap(), vec![10, 20]);
    }
}
