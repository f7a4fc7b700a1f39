//! `slamsync-types` – shared vocabulary of the synchronisation layer.
//!
//! Timestamps, raw observations, the single error taxonomy and the
//! serialisable counter snapshots that every other crate reports through.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Point in time attached to observations and transforms.
///
/// Buffer retention is measured in this time base, never in wall-clock time.
pub type Stamp = DateTime<Utc>;

/// Build a [`Stamp`] from fractional seconds since the Unix epoch.
pub fn stamp_from_secs(secs: f64) -> Stamp {
    DateTime::from_timestamp_nanos((secs * 1e9).round() as i64)
}

/// Fractional seconds since the Unix epoch.
pub fn stamp_as_secs(stamp: Stamp) -> f64 {
    stamp.timestamp() as f64 + f64::from(stamp.timestamp_subsec_nanos()) * 1e-9
}

// ────────────────────────────────────────────────────────────────────────────
// Observations
// ────────────────────────────────────────────────────────────────────────────

/// A timestamped sensor reading anchored to the frame it was measured in.
///
/// The payload is opaque to this layer.  Observations are never mutated after
/// creation; the pipeline passes them around as `Arc<Observation<T>>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation<T> {
    pub stamp: Stamp,
    /// e.g. `"laser"`, `"base_link"`
    pub frame_id: String,
    pub payload: T,
}

impl<T> Observation<T> {
    pub fn new(stamp: Stamp, frame_id: impl Into<String>, payload: T) -> Self {
        Self {
            stamp,
            frame_id: frame_id.into(),
            payload,
        }
    }

    /// Wrap into the shared read-only form handed to the pipeline.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Why a transform lookup could not be answered.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnavailableReason {
    #[error("frame '{0}' is unknown to the buffer")]
    UnknownFrame(String),

    #[error("frames are not connected")]
    Disconnected,

    #[error("stamp precedes the retention window starting at {window_start}")]
    Expired { window_start: Stamp },

    #[error("edge {parent} -> {child} has no sample bracketing the stamp")]
    NoSample { parent: String, child: String },
}

/// Error taxonomy of the synchronisation layer.
///
/// Everything except [`SyncError::FrameGraphCycle`] and
/// [`SyncError::Config`] is local and non-fatal: the pipeline records it and
/// keeps running.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncError {
    #[error("transform {source_frame} -> {target_frame} unavailable at {stamp}: {reason}")]
    TransformUnavailable {
        source_frame: String,
        target_frame: String,
        stamp: Stamp,
        reason: UnavailableReason,
    },

    #[error("inserting {parent} -> {child} would close a cycle in the frame graph")]
    FrameGraphCycle { parent: String, child: String },

    #[error("stale correction at {stamp}: latest correction is at {latest}")]
    StaleCorrection { stamp: Stamp, latest: Stamp },

    #[error("observer '{observer}' failed: {details}")]
    ObserverDeliveryFailure { observer: String, details: String },

    #[error("queue '{queue}' is full (capacity {capacity})")]
    QueueOverflow { queue: String, capacity: usize },

    #[error("topic '{0}' is closed")]
    TopicClosed(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// `true` for errors that must stop initialisation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FrameGraphCycle { .. } | Self::Config(_))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Counter snapshots
// ────────────────────────────────────────────────────────────────────────────

/// Counters of one synchronized topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStats {
    /// Observations handed to `on_observation`.
    pub received: u64,
    /// Observations paired with a transform and accepted by at least one
    /// observer.
    pub delivered: u64,
    /// Observations discarded because no transform was (or could become)
    /// available.
    pub dropped_unavailable: u64,
    /// Pending observations evicted from the bounded retry FIFO.
    pub overflowed: u64,
    /// Observations that resolved only after waiting in the FIFO.
    pub resolved_after_retry: u64,
    /// Per-observer failures isolated during fan-out.
    pub delivery_failures: u64,
    /// Observations currently waiting for a transform.
    pub pending: u64,
}

/// Counters of the correction publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionStats {
    pub published: u64,
    /// Out-of-order pose events discarded.
    pub stale: u64,
    /// Queued corrections overwritten before the worker drained them.
    pub superseded: u64,
    /// Pose events received before any reference transform was known.
    pub missing_reference: u64,
    /// Sink rejections (e.g. frame graph cycles).
    pub failed: u64,
}

/// Counters of a republisher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepublishStats {
    pub emitted: u64,
    /// Updates replaced before the next emission.
    pub dropped: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_seconds_roundtrip() {
        let s = stamp_from_secs(12.25);
        assert!((stamp_as_secs(s) - 12.25).abs() < 1e-9);
        assert_eq!(s.timestamp(), 12);
    }

    #[test]
    fn observation_shared_keeps_payload() {
        let obs = Observation::new(stamp_from_secs(1.0), "laser", vec![1u8, 2, 3]).shared();
        assert_eq!(obs.frame_id, "laser");
        assert_eq!(obs.payload, vec![1, 2, 3]);
    }

    #[test]
    fn fatal_classification() {
        let cycle = SyncError::FrameGraphCycle {
            parent: "a".to_string(),
            child: "b".to_string(),
        };
        assert!(cycle.is_fatal());
        assert!(SyncError::Config("bad".to_string()).is_fatal());

        let overflow = SyncError::QueueOverflow {
            queue: "laser_scan".to_string(),
            capacity: 2,
        };
        assert!(!overflow.is_fatal());
        assert!(!SyncError::TopicClosed("scan".to_string()).is_fatal());
    }

    #[test]
    fn unavailable_display_names_frames() {
        let err = SyncError::TransformUnavailable {
            source_frame: "laser".to_string(),
            target_frame: "odom".to_string(),
            stamp: stamp_from_secs(3.0),
            reason: UnavailableReason::Disconnected,
        };
        let text = err.to_string();
        assert!(text.contains("laser -> odom"));
        assert!(text.contains("not connected"));
    }

    #[test]
    fn stale_correction_roundtrip() {
        let err = SyncError::StaleCorrection {
            stamp: stamp_from_secs(3.0),
            latest: stamp_from_secs(5.0),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: SyncError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }

    #[test]
    fn stats_serialize_as_flat_json() {
        let stats = TopicStats {
            received: 3,
            overflowed: 1,
            ..TopicStats::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["received"], 3);
        assert_eq!(json["overflowed"], 1);
        assert_eq!(json["pending"], 0);
    }
}
