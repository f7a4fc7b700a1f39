//! Bounded asynchronous entry point in front of a [`SynchronizedTopic`].
//!
//! Producers (sensor drivers, network callbacks) push observations through a
//! cheap, cloneable [`ObservationIngress`] without blocking.  A pump task
//! owns the receiving end and feeds the topic one observation at a time.  It
//! also watches the frame buffer's insert generation and retries the topic's
//! pending FIFO whenever new transforms land, so parked observations are
//! delivered without waiting for the next sensor message.

use std::sync::Arc;

use slamsync_types::{Observation, Stamp, SyncError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::topic::{ObservationOutcome, SynchronizedTopic};

/// Producer handle.  Clones share the same bounded channel.
pub struct ObservationIngress<T> {
    topic: String,
    capacity: usize,
    sender: mpsc::Sender<Arc<Observation<T>>>,
}

impl<T> Clone for ObservationIngress<T> {
    fn clone(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            capacity: self.capacity,
            sender: self.sender.clone(),
        }
    }
}

impl<T> ObservationIngress<T> {
    /// Wrap and enqueue a raw reading.
    pub fn on_observation(&self, stamp: Stamp, frame_id: impl Into<String>, payload: T) -> Result<(), SyncError> {
        self.submit(Observation::new(stamp, frame_id, payload).shared())
    }

    /// Enqueue without waiting.
    ///
    /// # Errors
    ///
    /// [`SyncError::QueueOverflow`] when the channel is full and
    /// [`SyncError::TopicClosed`] once the pump has stopped.
    pub fn submit(&self, observation: Arc<Observation<T>>) -> Result<(), SyncError> {
        self.sender.try_send(observation).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SyncError::QueueOverflow {
                queue: self.topic.clone(),
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => SyncError::TopicClosed(self.topic.clone()),
        })
    }

    /// Enqueue, waiting for channel space.
    pub async fn send(&self, observation: Arc<Observation<T>>) -> Result<(), SyncError> {
        self.sender
            .send(observation)
            .await
            .map_err(|_| SyncError::TopicClosed(self.topic.clone()))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Spawn the pump for `topic` on the current tokio runtime.
///
/// The pump stops once every [`ObservationIngress`] clone is dropped or the
/// topic is closed.
pub fn spawn_ingress<T>(topic: Arc<SynchronizedTopic<T>>, capacity: usize) -> (ObservationIngress<T>, JoinHandle<()>)
where
    T: Send + Sync + 'static,
{
    let capacity = capacity.max(1);
    let (sender, receiver) = mpsc::channel(capacity);
    let inserts = topic.buffer().subscribe_inserts();
    let ingress = ObservationIngress {
        topic: topic.name().to_string(),
        capacity,
        sender,
    };
    let handle = tokio::spawn(pump(topic, receiver, inserts));
    (ingress, handle)
}

async fn pump<T>(
    topic: Arc<SynchronizedTopic<T>>,
    mut receiver: mpsc::Receiver<Arc<Observation<T>>>,
    mut inserts: watch::Receiver<u64>,
) where
    T: Send + Sync + 'static,
{
    let mut watching = true;
    loop {
        tokio::select! {
            next = receiver.recv() => {
                let Some(observation) = next else { break };
                match topic.on_observation(observation) {
                    Ok(ObservationOutcome::Dropped) => {
                        debug!(topic = %topic.name(), "observation dropped at ingress");
                    }
                    Ok(_) => {}
                    Err(SyncError::TopicClosed(_)) => break,
                    Err(err) => debug!(topic = %topic.name(), error = %err, "ingress rejected observation"),
                }
            }
            changed = inserts.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let resolved = topic.retry_pending();
                if resolved > 0 {
                    debug!(topic = %topic.name(), resolved, "pending observations resolved after insert");
                }
            }
        }
    }
    receiver.close();
    info!(topic = %topic.name(), "ingress pump stopped");
}
