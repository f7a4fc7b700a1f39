//! Pipeline configuration – reads/writes `~/.slamsync/config.toml`.
//!
//! Every field has a default, so a partial (or absent) file is fine.
//! `SLAMSYNC_*` environment variables override values read from disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use slamsync_middleware::UnavailablePolicy;
use slamsync_types::SyncError;

use crate::correction::{CorrectionFrames, CorrectionMode};

/// Resolved configuration of one synchronisation pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Name of the scan topic, used in logs and error values.
    #[serde(default = "default_scan_topic")]
    pub scan_topic: String,

    /// Odometry (reference) frame; target of every scan lookup.
    #[serde(default = "default_odom_frame_id")]
    pub odom_frame_id: String,

    /// Estimate frame the world model localizes in.
    #[serde(default = "default_map_frame_id")]
    pub map_frame_id: String,

    /// Frame the robot pose is republished as.
    #[serde(default = "default_robot_pose_frame_id")]
    pub robot_pose_frame_id: String,

    /// Publish corrections from a background worker instead of inline.
    #[serde(default)]
    pub async_correction: bool,

    /// Transform buffer retention, seconds.
    #[serde(default = "default_buffer_duration_secs")]
    pub buffer_duration_secs: f64,

    #[serde(default = "default_map_publishing_rate_hz")]
    pub map_publishing_rate_hz: f64,

    /// Bound of the FIFO holding scans whose transform is not yet available.
    #[serde(default = "default_queue_size")]
    pub filter_queue_size: usize,

    /// Capacity of the ingress channel in front of the scan topic.
    #[serde(default = "default_queue_size")]
    pub subscribers_queue_size: usize,

    /// Drop unsynchronized scans immediately instead of parking them.
    #[serde(default)]
    pub drop_unsynchronized: bool,
}

fn default_scan_topic() -> String {
    "scan".to_string()
}
fn default_odom_frame_id() -> String {
    "odom_combined".to_string()
}
fn default_map_frame_id() -> String {
    "map".to_string()
}
fn default_robot_pose_frame_id() -> String {
    "robot_pose".to_string()
}
fn default_buffer_duration_secs() -> f64 {
    5.0
}
fn default_map_publishing_rate_hz() -> f64 {
    5.0
}
fn default_queue_size() -> usize {
    1000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scan_topic: default_scan_topic(),
            odom_frame_id: default_odom_frame_id(),
            map_frame_id: default_map_frame_id(),
            robot_pose_frame_id: default_robot_pose_frame_id(),
            async_correction: false,
            buffer_duration_secs: default_buffer_duration_secs(),
            map_publishing_rate_hz: default_map_publishing_rate_hz(),
            filter_queue_size: default_queue_size(),
            subscribers_queue_size: default_queue_size(),
            drop_unsynchronized: false,
        }
    }
}

impl PipelineConfig {
    pub fn correction_mode(&self) -> CorrectionMode {
        if self.async_correction {
            CorrectionMode::Asynchronous
        } else {
            CorrectionMode::Synchronous
        }
    }

    pub fn correction_frames(&self) -> CorrectionFrames {
        CorrectionFrames::new(self.map_frame_id.clone(), self.odom_frame_id.clone())
    }

    pub fn unavailable_policy(&self) -> UnavailablePolicy {
        if self.drop_unsynchronized {
            UnavailablePolicy::Drop
        } else {
            UnavailablePolicy::Retry {
                capacity: self.filter_queue_size,
            }
        }
    }

    /// # Errors
    ///
    /// [`SyncError::Config`] if the duration cannot be represented.
    pub fn buffer_retention(&self) -> Result<Duration, SyncError> {
        Duration::try_from_secs_f64(self.buffer_duration_secs).map_err(|e| {
            SyncError::Config(format!(
                "buffer_duration_secs = {}: {e}",
                self.buffer_duration_secs
            ))
        })
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), SyncError> {
        let invalid = |msg: String| Err(SyncError::Config(msg));

        if !self.buffer_duration_secs.is_finite() || self.buffer_duration_secs <= 0.0 {
            return invalid(format!(
                "buffer_duration_secs must be positive, got {}",
                self.buffer_duration_secs
            ));
        }
        if !self.map_publishing_rate_hz.is_finite() || self.map_publishing_rate_hz <= 0.0 {
            return invalid(format!(
                "map_publishing_rate_hz must be positive, got {}",
                self.map_publishing_rate_hz
            ));
        }
        if self.filter_queue_size == 0 {
            return invalid("filter_queue_size must be at least 1".to_string());
        }
        if self.subscribers_queue_size == 0 {
            return invalid("subscribers_queue_size must be at least 1".to_string());
        }

        let frames = [
            ("odom_frame_id", &self.odom_frame_id),
            ("map_frame_id", &self.map_frame_id),
            ("robot_pose_frame_id", &self.robot_pose_frame_id),
        ];
        for (field, frame) in frames {
            if frame.is_empty() {
                return invalid(format!("{field} must not be empty"));
            }
        }
        for (i, (a_field, a)) in frames.iter().enumerate() {
            for (b_field, b) in &frames[i + 1..] {
                if a == b {
                    return invalid(format!("{a_field} and {b_field} are both '{a}'"));
                }
            }
        }
        self.buffer_retention().map(|_| ())
    }
}

/// Return the path to `~/.slamsync/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".slamsync").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<PipelineConfig>, SyncError> {
    load_from(&config_path())
}

/// Load from `path` and apply environment overrides.
pub fn load_from(path: &Path) -> Result<Option<PipelineConfig>, SyncError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("failed to read {}: {e}", path.display())))?;
    let mut cfg: PipelineConfig = toml::from_str(&raw)
        .map_err(|e| SyncError::Config(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `SLAMSYNC_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SLAMSYNC_ODOM_FRAME` | `odom_frame_id` |
/// | `SLAMSYNC_MAP_FRAME` | `map_frame_id` |
/// | `SLAMSYNC_ROBOT_POSE_FRAME` | `robot_pose_frame_id` |
/// | `SLAMSYNC_ASYNC_CORRECTION` | `async_correction` |
/// | `SLAMSYNC_BUFFER_DURATION` | `buffer_duration_secs` |
/// | `SLAMSYNC_MAP_RATE` | `map_publishing_rate_hz` |
/// | `SLAMSYNC_FILTER_QUEUE` | `filter_queue_size` |
/// | `SLAMSYNC_SUBSCRIBERS_QUEUE` | `subscribers_queue_size` |
/// | `SLAMSYNC_DROP_UNSYNCHRONIZED` | `drop_unsynchronized` |
///
/// Unparseable numeric or boolean values are ignored.
pub fn apply_env_overrides(cfg: &mut PipelineConfig) {
    if let Ok(v) = std::env::var("SLAMSYNC_ODOM_FRAME") {
        cfg.odom_frame_id = v;
    }
    if let Ok(v) = std::env::var("SLAMSYNC_MAP_FRAME") {
        cfg.map_frame_id = v;
    }
    if let Ok(v) = std::env::var("SLAMSYNC_ROBOT_POSE_FRAME") {
        cfg.robot_pose_frame_id = v;
    }
    if let Ok(v) = std::env::var("SLAMSYNC_ASYNC_CORRECTION")
        && let Ok(flag) = v.parse::<bool>()
    {
        cfg.async_correction = flag;
    }
    if let Ok(v) = std::env::var("SLAMSYNC_BUFFER_DURATION")
        && let Ok(secs) = v.parse::<f64>()
    {
        cfg.buffer_duration_secs = secs;
    }
    if let Ok(v) = std::env::var("SLAMSYNC_MAP_RATE")
        && let Ok(hz) = v.parse::<f64>()
    {
        cfg.map_publishing_rate_hz = hz;
    }
    if let Ok(v) = std::env::var("SLAMSYNC_FILTER_QUEUE")
        && let Ok(size) = v.parse::<usize>()
    {
        cfg.filter_queue_size = size;
    }
    if let Ok(v) = std::env::var("SLAMSYNC_SUBSCRIBERS_QUEUE")
        && let Ok(size) = v.parse::<usize>()
    {
        cfg.subscribers_queue_size = size;
    }
    if let Ok(v) = std::env::var("SLAMSYNC_DROP_UNSYNCHRONIZED")
        && let Ok(flag) = v.parse::<bool>()
    {
        cfg.drop_unsynchronized = flag;
    }
}

/// Save the config to disk, creating the parent directory if necessary.
pub fn save_to(cfg: &PipelineConfig, path: &Path) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| SyncError::Config(format!("failed to create {}: {e}", parent.display())))?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| SyncError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw)
        .map_err(|e| SyncError::Config(format!("failed to write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_node() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.odom_frame_id, "odom_combined");
        assert_eq!(cfg.map_frame_id, "map");
        assert_eq!(cfg.robot_pose_frame_id, "robot_pose");
        assert!(!cfg.async_correction);
        assert_eq!(cfg.buffer_duration_secs, 5.0);
        assert_eq!(cfg.map_publishing_rate_hz, 5.0);
        assert_eq!(cfg.filter_queue_size, 1000);
        assert_eq!(cfg.subscribers_queue_size, 1000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: PipelineConfig = toml::from_str(
            r#"
            map_frame_id = "world"
            async_correction = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.map_frame_id, "world");
        assert_eq!(cfg.odom_frame_id, "odom_combined");
        assert_eq!(cfg.correction_mode(), CorrectionMode::Asynchronous);
    }

    #[test]
    fn derived_settings() {
        let mut cfg = PipelineConfig::default();
        assert_eq!(cfg.unavailable_policy(), UnavailablePolicy::Retry { capacity: 1000 });
        cfg.drop_unsynchronized = true;
        assert_eq!(cfg.unavailable_policy(), UnavailablePolicy::Drop);
        assert_eq!(cfg.buffer_retention().unwrap(), Duration::from_secs(5));

        let frames = cfg.correction_frames();
        assert_eq!(frames.estimate, "map");
        assert_eq!(frames.reference, "odom_combined");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let bad = [
            PipelineConfig {
                buffer_duration_secs: 0.0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                map_publishing_rate_hz: -1.0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                filter_queue_size: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                subscribers_queue_size: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                map_frame_id: "odom_combined".to_string(),
                ..PipelineConfig::default()
            },
            PipelineConfig {
                robot_pose_frame_id: String::new(),
                ..PipelineConfig::default()
            },
        ];
        for cfg in bad {
            assert!(
                matches!(cfg.validate(), Err(SyncError::Config(_))),
                "expected rejection of {cfg:?}"
            );
        }
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert_eq!(load_from(&path).unwrap(), None);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let cfg = PipelineConfig {
            robot_pose_frame_id: "base_footprint".to_string(),
            scan_topic: "front_scan".to_string(),
            ..PipelineConfig::default()
        };

        save_to(&cfg, &path).expect("save");
        let loaded = load_from(&path).expect("load").expect("present");
        assert_eq!(loaded.robot_pose_frame_id, "base_footprint");
        assert_eq!(loaded.scan_topic, "front_scan");
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "buffer_duration_secs = \"long\"").unwrap();
        assert!(matches!(load_from(&path), Err(SyncError::Config(_))));
    }

    #[test]
    fn env_overrides_apply() {
        const VARS: [(&str, &str); 5] = [
            ("SLAMSYNC_MAP_RATE", "2.5"),
            ("SLAMSYNC_ASYNC_CORRECTION", "true"),
            ("SLAMSYNC_FILTER_QUEUE", "64"),
            ("SLAMSYNC_SUBSCRIBERS_QUEUE", "not-a-number"),
            ("SLAMSYNC_DROP_UNSYNCHRONIZED", "true"),
        ];
        // SAFETY: no other test reads or writes these variables.
        unsafe {
            for (key, value) in VARS {
                std::env::set_var(key, value);
            }
        }
        let mut cfg = PipelineConfig::default();
        apply_env_overrides(&mut cfg);
        unsafe {
            for (key, _) in VARS {
                std::env::remove_var(key);
            }
        }
        assert_eq!(cfg.map_publishing_rate_hz, 2.5);
        assert!(cfg.async_correction);
        assert_eq!(cfg.filter_queue_size, 64);
        assert_eq!(cfg.subscribers_queue_size, 1000);
        assert_eq!(cfg.unavailable_policy(), UnavailablePolicy::Drop);
    }

    #[test]
    fn config_path_is_under_home() {
        let path = config_path_for_home("/home/robot");
        assert_eq!(path, PathBuf::from("/home/robot/.slamsync/config.toml"));
    }
}
