//! Rigid-body geometry.
//!
//! Translation + quaternion rotation primitives, the [`Transform3D`] built
//! from them, and the timestamped [`StampedTransform`] that the frame buffer
//! stores and returns.
//!
//! # Example
//!
//! ```rust
//! use slamsync_perception::transform::{Transform3D, Vec3, Quaternion};
//!
//! let odom_base = Transform3D::new(Vec3::new(1.0, 0.0, 0.0), Quaternion::from_yaw(0.3));
//! let back = odom_base.compose(odom_base.inverse());
//! assert!(back.translation.x.abs() < 1e-5);
//! ```

use slamsync_types::Stamp;

// ────────────────────────────────────────────────────────────────────────────
// Primitive types
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D translation vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    pub fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }

    /// Linear interpolation; `ratio` 0 yields `self`, 1 yields `other`.
    pub fn lerp(self, other: Self, ratio: f32) -> Self {
        Self::new(
            self.x + (other.x - self.x) * ratio,
            self.y + (other.y - self.y) * ratio,
            self.z + (other.z - self.z) * ratio,
        )
    }
}

/// A unit quaternion representing a 3-D rotation (w, x, y, z convention).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Quaternion {
    /// The caller is responsible for providing a unit quaternion.
    pub fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { w, x, y, z }
    }

    pub fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0)
    }

    /// Rotation of `yaw` radians around +Z, the usual planar heading.
    pub fn from_yaw(yaw: f32) -> Self {
        let half = yaw * 0.5;
        Self::new(half.cos(), 0.0, 0.0, half.sin())
    }

    /// Heading around +Z in `(-π, π]`.
    pub fn yaw(self) -> f32 {
        let siny = 2.0 * (self.w * self.z + self.x * self.y);
        let cosy = 1.0 - 2.0 * (self.y * self.y + self.z * self.z);
        siny.atan2(cosy)
    }

    /// Hamilton product: compose two rotations.
    pub fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        )
    }

    /// Conjugate (== inverse for a unit quaternion).
    pub fn conjugate(self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.w * rhs.w + self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn normalize(self) -> Self {
        let norm = self.dot(self).sqrt();
        if norm <= f32::EPSILON {
            return Self::identity();
        }
        Self::new(self.w / norm, self.x / norm, self.y / norm, self.z / norm)
    }

    /// Rotate a vector by this quaternion: p' = q * p * q*.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let p = Self::new(0.0, v.x, v.y, v.z);
        let rotated = self.mul(p).mul(self.conjugate());
        Vec3::new(rotated.x, rotated.y, rotated.z)
    }

    /// Spherical linear interpolation along the shorter arc.
    pub fn slerp(self, other: Self, ratio: f32) -> Self {
        let mut end = other;
        let mut cos_theta = self.dot(other);
        if cos_theta < 0.0 {
            end = Self::new(-other.w, -other.x, -other.y, -other.z);
            cos_theta = -cos_theta;
        }

        // Nearly parallel: sin(θ) → 0, fall back to normalised lerp.
        if cos_theta > 0.9995 {
            return Self::new(
                self.w + (end.w - self.w) * ratio,
                self.x + (end.x - self.x) * ratio,
                self.y + (end.y - self.y) * ratio,
                self.z + (end.z - self.z) * ratio,
            )
            .normalize();
        }

        let theta = cos_theta.acos();
        let sin_theta = theta.sin();
        let a = ((1.0 - ratio) * theta).sin() / sin_theta;
        let b = (ratio * theta).sin() / sin_theta;
        Self::new(
            a * self.w + b * end.w,
            a * self.x + b * end.x,
            a * self.y + b * end.y,
            a * self.z + b * end.z,
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Transform3D
// ────────────────────────────────────────────────────────────────────────────

/// A rigid-body 3-D transform: rotation followed by translation.
///
/// `T_A_B` is the pose of frame B relative to frame A: to convert a point
/// expressed in B into A, rotate it by `rotation` then add `translation`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform3D {
    pub translation: Vec3,
    pub rotation: Quaternion,
}

impl Transform3D {
    pub fn new(translation: Vec3, rotation: Quaternion) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Vec3::zero(), Quaternion::identity())
    }

    /// Planar pose `(x, y, yaw)`.
    pub fn planar(x: f32, y: f32, yaw: f32) -> Self {
        Self::new(Vec3::new(x, y, 0.0), Quaternion::from_yaw(yaw))
    }

    /// Compose two transforms.
    ///
    /// If `self` = T_A_B and `other` = T_B_C, the result is T_A_C.
    pub fn compose(self, other: Self) -> Self {
        let translated = self.translation.add(self.rotation.rotate(other.translation));
        let rotated = self.rotation.mul(other.rotation);
        Self::new(translated, rotated)
    }

    /// T_A_B → T_B_A.
    pub fn inverse(self) -> Self {
        let rotation = self.rotation.conjugate();
        Self::new(rotation.rotate(self.translation.neg()), rotation)
    }

    /// Apply to a point expressed in the child frame.
    pub fn apply(self, point: Vec3) -> Vec3 {
        self.translation.add(self.rotation.rotate(point))
    }

    /// Interpolate between two samples of the same edge.
    pub fn interpolate(self, other: Self, ratio: f32) -> Self {
        Self::new(
            self.translation.lerp(other.translation, ratio),
            self.rotation.slerp(other.rotation, ratio),
        )
    }
}

impl Default for Transform3D {
    fn default() -> Self {
        Self::identity()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// StampedTransform
// ────────────────────────────────────────────────────────────────────────────

/// A [`Transform3D`] valid at one instant between two named frames.
///
/// `transform` maps points expressed in `child_frame` into `parent_frame`.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedTransform {
    pub parent_frame: String,
    pub child_frame: String,
    pub stamp: Stamp,
    pub transform: Transform3D,
}

impl StampedTransform {
    pub fn new(
        parent_frame: impl Into<String>,
        child_frame: impl Into<String>,
        stamp: Stamp,
        transform: Transform3D,
    ) -> Self {
        Self {
            parent_frame: parent_frame.into(),
            child_frame: child_frame.into(),
            stamp,
            transform,
        }
    }
}
