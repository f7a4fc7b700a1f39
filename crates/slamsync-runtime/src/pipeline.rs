//! Assembly of the full synchronisation pipeline.
//!
//! ```text
//! ingress ─▶ SynchronizedTopic ─┬─▶ CorrectionPublisher (reference)
//!                               └─▶ WorldModel::feed
//!                                        ├─ pose ─▶ CorrectionPublisher ─▶ buffer (map ← odom)
//!                                        ├─ pose ─▶ PoseRepublisher      ─▶ sink   (map ← robot_pose)
//!                                        └─ map  ─▶ MapRepublisher       ─▶ MapSink (rate limited)
//! ```
//!
//! [`Pipeline::build`] wires everything synchronously; [`Pipeline::start`]
//! spawns the tokio side (ingress pump, map ticker and, in asynchronous
//! mode, the correction worker).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use slamsync_middleware::{ObservationIngress, SynchronizedTopic, TopicConfig, spawn_ingress};
use slamsync_perception::{FrameTransformBuffer, TransformSink};
use slamsync_types::{CorrectionStats, RepublishStats, SyncError, TopicStats};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::correction::{CorrectionPublisher, CorrectionWorker};
use crate::republish::{MapRepublisher, MapSink, PoseRepublisher};
use crate::world_model::{WorldModel, WorldModelFeed};

/// Aggregated counters of every pipeline stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub topic: TopicStats,
    pub correction: CorrectionStats,
    pub pose: RepublishStats,
    pub map: RepublishStats,
    /// Frames currently known to the buffer.
    pub frames: Vec<String>,
    pub buffer_generation: u64,
}

pub struct Pipeline<W: WorldModel> {
    config: PipelineConfig,
    buffer: Arc<FrameTransformBuffer>,
    topic: Arc<SynchronizedTopic<W::Observation>>,
    world_model: Arc<W>,
    correction: Arc<CorrectionPublisher>,
    worker: Mutex<Option<CorrectionWorker>>,
    pose_republisher: Arc<PoseRepublisher>,
    map_republisher: Arc<MapRepublisher<W::Map>>,
    started: AtomicBool,
}

impl<W: WorldModel + 'static> Pipeline<W> {
    /// Wire a pipeline whose robot poses are written back into its own
    /// buffer.
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`] when `config` does not validate.
    pub fn build(
        config: PipelineConfig,
        world_model: Arc<W>,
        map_sink: Arc<dyn MapSink<W::Map>>,
    ) -> Result<Self, SyncError> {
        Self::assemble(config, world_model, map_sink, None)
    }

    /// Like [`build`](Self::build), with robot poses sent to `pose_sink`
    /// (e.g. an external transform broadcaster).
    pub fn build_with_pose_sink(
        config: PipelineConfig,
        world_model: Arc<W>,
        map_sink: Arc<dyn MapSink<W::Map>>,
        pose_sink: Arc<dyn TransformSink>,
    ) -> Result<Self, SyncError> {
        Self::assemble(config, world_model, map_sink, Some(pose_sink))
    }

    fn assemble(
        config: PipelineConfig,
        world_model: Arc<W>,
        map_sink: Arc<dyn MapSink<W::Map>>,
        pose_sink: Option<Arc<dyn TransformSink>>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let retention = config.buffer_retention()?;
        let buffer = Arc::new(FrameTransformBuffer::new(retention));
        let buffer_sink: Arc<dyn TransformSink> = buffer.clone();

        let topic = Arc::new(SynchronizedTopic::new(
            TopicConfig::new(config.scan_topic.clone(), config.odom_frame_id.clone())
                .with_policy(config.unavailable_policy()),
            Arc::clone(&buffer),
        )?);

        let (correction, worker) = CorrectionPublisher::new(
            config.correction_mode(),
            config.correction_frames(),
            Arc::clone(&buffer_sink),
        );
        let correction = Arc::new(correction.with_reference_retention(retention));
        let pose_republisher = Arc::new(PoseRepublisher::new(
            config.map_frame_id.clone(),
            config.robot_pose_frame_id.clone(),
            pose_sink.unwrap_or(buffer_sink),
        ));
        let map_republisher = Arc::new(MapRepublisher::new(config.map_publishing_rate_hz, map_sink)?);

        // The correction publisher must record the reference before the
        // model can emit a pose for the same scan.
        topic.subscribe(correction.clone());
        topic.subscribe(Arc::new(WorldModelFeed(Arc::clone(&world_model))));
        world_model.subscribe_pose(correction.clone());
        world_model.subscribe_pose(pose_republisher.clone());
        world_model.subscribe_map(map_republisher.clone());

        info!(
            topic = %config.scan_topic,
            odom = %config.odom_frame_id,
            map = %config.map_frame_id,
            mode = ?config.correction_mode(),
            "pipeline assembled"
        );

        Ok(Self {
            config,
            buffer,
            topic,
            world_model,
            correction,
            worker: Mutex::new(worker),
            pose_republisher,
            map_republisher,
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the background tasks on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// [`SyncError::Config`] when called a second time.
    pub fn start(&self) -> Result<PipelineHandle<W::Observation>, SyncError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Config("pipeline already started".to_string()));
        }

        let mut tasks = Vec::with_capacity(3);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            tasks.push(worker.spawn());
        }
        tasks.push(Arc::clone(&self.map_republisher).spawn());
        let (ingress, pump) = spawn_ingress(Arc::clone(&self.topic), self.config.subscribers_queue_size);
        tasks.push(pump);

        info!(tasks = tasks.len(), "pipeline started");
        Ok(PipelineHandle { ingress, tasks })
    }

    /// Stop delivery and let the background tasks wind down.
    pub fn shutdown(&self) {
        self.topic.close();
        self.map_republisher.close();
        self.correction.close();
        info!("pipeline shutting down");
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn buffer(&self) -> &Arc<FrameTransformBuffer> {
        &self.buffer
    }

    pub fn topic(&self) -> &Arc<SynchronizedTopic<W::Observation>> {
        &self.topic
    }

    pub fn world_model(&self) -> &Arc<W> {
        &self.world_model
    }

    pub fn correction(&self) -> &Arc<CorrectionPublisher> {
        &self.correction
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            topic: self.topic.stats(),
            correction: self.correction.stats(),
            pose: self.pose_republisher.stats(),
            map: self.map_republisher.stats(),
            frames: self.buffer.frames(),
            buffer_generation: self.buffer.generation(),
        }
    }
}

/// Running side of a started [`Pipeline`].
pub struct PipelineHandle<T> {
    ingress: ObservationIngress<T>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T> PipelineHandle<T> {
    /// Producer entry point; clone it per sensor source.
    pub fn ingress(&self) -> &ObservationIngress<T> {
        &self.ingress
    }

    /// Wait for the background tasks.  Call after [`Pipeline::shutdown`] and
    /// after dropping every ingress clone.
    pub async fn join(self) {
        drop(self.ingress);
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "pipeline task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world_model::{MapEvent, PoseEvent, WorldModelEvents};
    use slamsync_middleware::{Observer, SubscriptionId, SynchronizedObservation};
    use slamsync_perception::{StampedTransform, Transform3D};
    use slamsync_types::{Observation, stamp_from_secs};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Reports `offset ∘ (odom ← laser)` as the pose, so the published
    /// correction must equal `offset`.
    struct Drift {
        offset: Transform3D,
        events: WorldModelEvents<usize>,
        fed: AtomicUsize,
    }

    impl Drift {
        fn new(offset: Transform3D) -> Arc<Self> {
            Arc::new(Self {
                offset,
                events: WorldModelEvents::new("drift"),
                fed: AtomicUsize::new(0),
            })
        }
    }

    impl WorldModel for Drift {
        type Observation = ();
        type Map = usize;

        fn feed(&self, observation: &SynchronizedObservation<()>) -> Result<(), SyncError> {
            let fed = self.fed.fetch_add(1, Ordering::SeqCst) + 1;
            let pose = self.offset.compose(observation.transform.transform);
            self.events.publish_pose(observation.stamp(), pose);
            self.events.publish_map(observation.stamp(), Arc::new(fed));
            Ok(())
        }

        fn subscribe_pose(&self, observer: Arc<dyn Observer<PoseEvent>>) -> SubscriptionId {
            self.events.subscribe_pose(observer)
        }

        fn subscribe_map(&self, observer: Arc<dyn Observer<MapEvent<usize>>>) -> SubscriptionId {
            self.events.subscribe_map(observer)
        }
    }

    #[derive(Default)]
    struct Maps(Mutex<Vec<usize>>);

    impl MapSink<usize> for Maps {
        fn publish_map(&self, event: &MapEvent<usize>) -> Result<(), SyncError> {
            self.0.lock().unwrap().push(*event.snapshot);
            Ok(())
        }
    }

    fn odom_laser(buffer: &FrameTransformBuffer, secs: f64, x: f32) {
        buffer
            .insert(StampedTransform::new(
                "odom_combined",
                "laser",
                stamp_from_secs(secs),
                Transform3D::planar(x, 0.0, 0.1),
            ))
            .unwrap();
    }

    #[test]
    fn synchronous_pipeline_closes_the_loop() {
        let offset = Transform3D::planar(0.5, -0.25, 0.2);
        let maps = Arc::new(Maps::default());
        let pipeline = Pipeline::build(PipelineConfig::default(), Drift::new(offset), maps.clone()).unwrap();
        let buffer = pipeline.buffer();
        odom_laser(buffer, 1.0, 0.0);
        odom_laser(buffer, 2.0, 1.0);

        let scan = Observation::new(stamp_from_secs(1.5), "laser", ()).shared();
        pipeline.topic().on_observation(scan).unwrap();

        let correction = buffer.latest_sample("map", "odom_combined").unwrap();
        assert_eq!(correction.stamp, stamp_from_secs(1.5));
        assert!((correction.transform.translation.x - 0.5).abs() < 1e-4);
        assert!((correction.transform.translation.y + 0.25).abs() < 1e-4);
        assert!((correction.transform.rotation.yaw() - 0.2).abs() < 1e-4);

        // Later scans resolve straight into the estimate frame.
        assert!(buffer.can_transform("laser", "map", stamp_from_secs(1.5)));
        assert!(buffer.latest_sample("map", "robot_pose").is_some());

        let stats = pipeline.stats();
        assert_eq!(stats.topic.delivered, 1);
        assert_eq!(stats.correction.published, 1);
        assert_eq!(stats.pose.emitted, 1);
        assert_eq!(stats.map.dropped, 0);
        assert!(stats.frames.contains(&"robot_pose".to_string()));
        assert!(maps.0.lock().unwrap().is_empty());
    }

    #[test]
    fn stats_serialize_to_json() {
        let pipeline = Pipeline::build(
            PipelineConfig::default(),
            Drift::new(Transform3D::identity()),
            Arc::new(Maps::default()),
        )
        .unwrap();
        let json = serde_json::to_value(pipeline.stats()).unwrap();
        assert_eq!(json["topic"]["received"], 0);
        assert_eq!(json["correction"]["published"], 0);
    }

    #[test]
    fn build_rejects_invalid_config() {
        let config = PipelineConfig {
            odom_frame_id: "map".to_string(),
            ..PipelineConfig::default()
        };
        let result = Pipeline::build(config, Drift::new(Transform3D::identity()), Arc::new(Maps::default()));
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn asynchronous_pipeline_runs_on_tokio() -> Result<(), Box<dyn std::error::Error>> {
        let config = PipelineConfig {
            async_correction: true,
            map_publishing_rate_hz: 50.0,
            ..PipelineConfig::default()
        };
        let maps = Arc::new(Maps::default());
        let pipeline = Pipeline::build(config, Drift::new(Transform3D::identity()), maps.clone())?;
        let handle = pipeline.start()?;
        assert!(pipeline.start().is_err());

        // Scan first: it parks until the transforms arrive.
        handle.ingress().on_observation(stamp_from_secs(1.5), "laser", ())?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        odom_laser(pipeline.buffer(), 1.0, 0.0);
        odom_laser(pipeline.buffer(), 2.0, 1.0);

        for _ in 0..200 {
            if pipeline.correction().last_published().is_some() && !maps.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pipeline.correction().last_published(), Some(stamp_from_secs(1.5)));
        assert_eq!(*maps.0.lock().unwrap(), vec![1]);
        let stats = pipeline.stats();
        assert_eq!(stats.topic.resolved_after_retry, 1);
        assert_eq!(stats.map.emitted, 1);

        pipeline.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle.join()).await?;
        Ok(())
    }
}
