//! `slamsync-runtime` – the consumers around the synchronized topic and the
//! glue that runs them.
//!
//! # Modules
//!
//! - [`world_model`] – interface of the external localization/mapping
//!   algorithm: [`PoseEvent`][world_model::PoseEvent],
//!   [`MapEvent`][world_model::MapEvent] and the
//!   [`WorldModel`][world_model::WorldModel] trait.
//! - [`correction`] – [`CorrectionPublisher`][correction::CorrectionPublisher]:
//!   writes the `map ← odom` correction back into the frame buffer, inline or
//!   through a retain-latest background worker.
//! - [`republish`] – pose and rate-limited map republishers.
//! - [`config`] – [`PipelineConfig`][config::PipelineConfig] (TOML + env).
//! - [`pipeline`] – assembles and starts the whole graph.
//! - [`telemetry`] – `tracing` subscriber and OTLP export setup.

pub mod config;
pub mod correction;
pub mod pipeline;
pub mod republish;
pub mod telemetry;
pub mod world_model;

pub use config::PipelineConfig;
pub use correction::{CorrectionFrames, CorrectionMode, CorrectionPublisher, CorrectionWorker};
pub use pipeline::{Pipeline, PipelineHandle, PipelineStats};
pub use republish::{MapRepublisher, MapSink, PoseRepublisher};
pub use world_model::{MapEvent, PoseEvent, WorldModel, WorldModelEvents, WorldModelFeed};
