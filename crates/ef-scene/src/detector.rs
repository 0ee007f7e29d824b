//! Sources and listeners
//!
//! Both endpoints of a propagation path are detectors: spheres with a
//! pose, velocity and stable identity. Sources add radiated power and an
//! optional directivity; listeners add the hearing-threshold conversion
//! used to trim inaudible IR tails.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ef_core::{BandResponse, Mat3, Pt3, Sphere, Vec3, orthonormalized};

use crate::directivity::Directivity;

static NEXT_DETECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Reference hearing-threshold intensity (W/m²).
const HEARING_THRESHOLD_INTENSITY: f32 = 1e-12;

/// The sphere-shaped emitter/receiver core shared by sources and
/// listeners.
#[derive(Debug, Clone)]
pub struct Detector {
    id: u64,
    position: Pt3,
    orientation: Mat3,
    radius: f32,
    velocity: Vec3,
    enabled: bool,
}

impl Default for Detector {
    fn default() -> Self {
        Self {
            id: NEXT_DETECTOR_ID.fetch_add(1, Ordering::Relaxed),
            position: Pt3::origin(),
            orientation: Mat3::identity(),
            radius: 0.5,
            velocity: Vec3::zeros(),
            enabled: true,
        }
    }
}

impl Detector {
    pub fn at(position: Pt3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Stable hashable identity. Persistent caches are keyed on this.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn position(&self) -> Pt3 {
        self.position
    }

    pub fn set_position(&mut self, position: Pt3) {
        self.position = position;
    }

    #[inline]
    pub fn orientation(&self) -> &Mat3 {
        &self.orientation
    }

    pub fn set_orientation(&mut self, orientation: Mat3) {
        self.orientation = orthonormalized(orientation);
    }

    /// Capture radius for rays.
    #[inline]
    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn set_radius(&mut self, radius: f32) {
        self.radius = radius.max(0.0);
    }

    #[inline]
    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    pub fn set_velocity(&mut self, velocity: Vec3) {
        self.velocity = velocity;
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[inline]
    pub fn bounding_sphere(&self) -> Sphere {
        Sphere::new(self.position, self.radius)
    }

    /// Transforms a world direction into the detector's local frame.
    #[inline]
    pub fn to_local_direction(&self, direction: Vec3) -> Vec3 {
        self.orientation.transpose() * direction
    }
}

// ============ Source ============

/// A sound source.
#[derive(Debug, Clone)]
pub struct Source {
    detector: Detector,
    power: f32,
    directivity: Option<Arc<Directivity>>,
}

impl Default for Source {
    fn default() -> Self {
        Self {
            detector: Detector::default(),
            power: 1.0,
            directivity: None,
        }
    }
}

impl Source {
    pub fn at(position: Pt3) -> Self {
        Self {
            detector: Detector::at(position),
            ..Self::default()
        }
    }

    #[inline]
    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    #[inline]
    pub fn detector_mut(&mut self) -> &mut Detector {
        &mut self.detector
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.detector.id()
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.detector.is_enabled()
    }

    /// Radiated power in watts. Path intensities are fractions of it.
    #[inline]
    pub fn power(&self) -> f32 {
        self.power
    }

    pub fn set_power(&mut self, power: f32) {
        self.power = power.max(0.0);
    }

    #[inline]
    pub fn directivity(&self) -> Option<&Arc<Directivity>> {
        self.directivity.as_ref()
    }

    pub fn set_directivity(&mut self, directivity: Option<Arc<Directivity>>) {
        self.directivity = directivity;
    }
}

// ============ Listener ============

/// A listening position.
#[derive(Debug, Clone)]
pub struct Listener {
    detector: Detector,
    /// Reference power for the hearing-threshold conversion.
    power: f32,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            detector: Detector::default(),
            power: 1.0,
        }
    }
}

impl Listener {
    pub fn at(position: Pt3) -> Self {
        Self {
            detector: Detector::at(position),
            ..Self::default()
        }
    }

    #[inline]
    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    #[inline]
    pub fn detector_mut(&mut self) -> &mut Detector {
        &mut self.detector
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.detector.id()
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.detector.is_enabled()
    }

    #[inline]
    pub fn power(&self) -> f32 {
        self.power
    }

    pub fn set_power(&mut self, power: f32) {
        self.power = power.max(0.0);
    }

    /// Per-band intensity below which a path is considered inaudible for
    /// a source of the given power: the hearing threshold expressed as a
    /// fraction of source power.
    pub fn threshold_intensity(&self) -> BandResponse {
        let power = self.power.max(f32::EPSILON);
        BandResponse::splat(HEARING_THRESHOLD_INTENSITY / power)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_ids_unique() {
        let a = Detector::default();
        let b = Detector::default();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_radius_clamped() {
        let mut d = Detector::default();
        d.set_radius(-1.0);
        assert_eq!(d.radius(), 0.0);
    }

    #[test]
    fn test_threshold_scales_with_power() {
        let mut quiet = Listener::default();
        quiet.set_power(1.0);
        let mut loud = Listener::default();
        loud.set_power(100.0);
        assert!(loud.threshold_intensity()[0] < quiet.threshold_intensity()[0]);
    }
}
