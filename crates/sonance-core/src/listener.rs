//! 3D listener state.
//!
//! The engine only needs the listener position to rank sources. The rest
//! (velocity, orientation, doppler/distance/rolloff knobs) is held here for
//! backends, which receive it on every 3D update and on commit.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Reference distance below which a positioned sound is not attenuated.
pub const DEFAULT_MIN_DISTANCE: f32 = 2.0;

/// Speed of sound in meters per second (for doppler).
pub const SPEED_OF_SOUND: f32 = 343.3;

/// Listener transform and global 3D knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Listener {
    /// World position.
    pub position: Vec3,
    /// Velocity in world units per second.
    pub velocity: Vec3,
    /// Up vector.
    pub up: Vec3,
    /// Facing direction.
    pub at: Vec3,
    /// Doppler strength.
    pub doppler_factor: f32,
    /// World units to meters.
    pub distance_factor: f32,
    /// Distance rolloff strength.
    pub rolloff_factor: f32,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            up: Vec3::Z,
            at: Vec3::X,
            doppler_factor: 1.0,
            distance_factor: 1.0,
            rolloff_factor: 1.0,
        }
    }
}

impl Listener {
    /// Create a listener at a position.
    #[must_use]
    pub fn at_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Create with velocity.
    #[must_use]
    pub const fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = velocity;
        self
    }

    /// Create with orientation. Zero-length vectors are ignored.
    #[must_use]
    pub fn with_orientation(mut self, up: Vec3, at: Vec3) -> Self {
        self.orient(up, at);
        self
    }

    /// Set orientation. Zero-length vectors are ignored.
    pub fn orient(&mut self, up: Vec3, at: Vec3) {
        if let Some(up) = up.try_normalize() {
            self.up = up;
        }
        if let Some(at) = at.try_normalize() {
            self.at = at;
        }
    }

    /// Move by an offset.
    pub fn translate(&mut self, offset: Vec3) {
        self.position += offset;
    }

    /// Squared distance to a world position.
    #[must_use]
    pub fn distance_squared(&self, position: Vec3) -> f32 {
        self.position.distance_squared(position)
    }

    /// Inverse-distance attenuation (0.0 - 1.0) for a positioned emitter.
    ///
    /// Full volume inside [`DEFAULT_MIN_DISTANCE`], then
    /// `ref / (ref + rolloff * (d - ref))` with `d` scaled by the distance
    /// factor.
    #[must_use]
    pub fn attenuation(&self, position: Vec3) -> f32 {
        let d = self.position.distance(position) * self.distance_factor.max(0.0);
        if d <= DEFAULT_MIN_DISTANCE {
            return 1.0;
        }
        let rolloff = self.rolloff_factor.max(0.0);
        DEFAULT_MIN_DISTANCE / (DEFAULT_MIN_DISTANCE + rolloff * (d - DEFAULT_MIN_DISTANCE))
    }

    /// Doppler pitch multiplier for an emitter moving at `velocity`.
    #[must_use]
    pub fn doppler_pitch(&self, position: Vec3, velocity: Vec3) -> f32 {
        if self.doppler_factor <= 0.0 {
            return 1.0;
        }
        // Source-to-listener direction
        let Some(dir) = (self.position - position).try_normalize() else {
            return 1.0;
        };
        let scale = self.distance_factor.max(f32::EPSILON);
        let max = SPEED_OF_SOUND / self.doppler_factor;
        let listener_speed = (self.velocity.dot(dir) * scale).clamp(-max, max);
        let source_speed = (velocity.dot(dir) * scale).clamp(-max, max);
        let c = SPEED_OF_SOUND;
        let d = self.doppler_factor;
        ((c - d * listener_speed) / (c - d * source_speed)).clamp(0.5, 2.0)
    }
}
