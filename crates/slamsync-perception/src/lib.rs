//! `slamsync-perception` – spatial reference frames.
//!
//! The single source of truth for "where was frame A relative to frame B at
//! time T".
//!
//! # Modules
//!
//! - [`transform`] – [`Transform3D`][transform::Transform3D] and
//!   [`StampedTransform`][transform::StampedTransform]: rigid-body geometry
//!   (composition, inversion, interpolation).
//! - [`buffer`] – [`FrameTransformBuffer`][buffer::FrameTransformBuffer]:
//!   bounded-duration transform history with multi-hop chained lookups,
//!   cycle rejection and insert notifications.

pub mod buffer;
pub mod transform;

pub use buffer::{FrameTransformBuffer, TransformSink};
pub use transform::{Quaternion, StampedTransform, Transform3D, Vec3};
