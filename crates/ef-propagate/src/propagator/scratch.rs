//! Per-worker scratch state and sampling helpers
//!
//! Every worker owns one `ThreadScratch` for the lifetime of the
//! propagator: its RNG stream, the image-source stack, reusable path-ID
//! builders, validation-ray storage and the diffuse output batch. Nothing
//! here is ever shared between threads.

use crossbeam_channel::Sender;
use ef_core::{BandResponse, Mat3, Plane, Pt3, Ray, Vec3, plane_basis};
use ef_scene::{Detector, Scene, WorldTriangle};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::path::{PathHash, PathId, PathKind};

/// Contributions per batch before a hand-off to the main thread.
pub(crate) const DIFFUSE_BATCH_SIZE: usize = 128;

// ============ Work records ============

/// One listener image in the specular image-source stack.
#[derive(Debug, Clone)]
pub(crate) struct ImagePosition {
    pub triangle: WorldTriangle,
    pub image: Pt3,
}

/// A validated specular/diffraction path produced by a worker, pending
/// cache insertion and output on the main thread.
#[derive(Debug, Clone)]
pub(crate) struct SpecularPath {
    pub id: PathId,
    pub hash: PathHash,
    pub kind: PathKind,
    pub energy: BandResponse,
    pub direction: Vec3,
    pub source_direction: Vec3,
    pub distance: f32,
    pub relative_speed: f32,
    pub speed: f32,
    /// Index into the frame's source views.
    pub source: u32,
    /// False for re-validated cache entries, which are output without
    /// re-insertion.
    pub insert: bool,
}

/// One diffuse Monte-Carlo contribution.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DiffuseContribution {
    pub source: u32,
    pub hash: PathHash,
    pub energy: BandResponse,
    pub direction: Vec3,
    pub source_direction: Vec3,
    pub distance: f32,
    pub relative_speed: f32,
}

/// One point along a diffraction candidate path.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DiffractionPoint {
    pub point: Pt3,
    /// Path distance from the listener to this point.
    pub distance: f32,
    /// Wedge face planes at this point (meaningless for the first,
    /// listener-side point).
    pub source_plane: Plane,
    pub listener_plane: Plane,
}

/// Recursion state of one diffraction query.
#[derive(Debug, Default)]
pub(crate) struct DiffractionScratch {
    pub points: Vec<DiffractionPoint>,
    /// Cumulative UTD products per interior point.
    pub responses: Vec<BandResponse>,
    /// Segments up to this index are already validated for the current
    /// branch.
    pub last_valid: usize,
    pub listener_to_source: Vec3,
    pub listener_path_direction: Vec3,
    pub listener_speed: f32,
}

// ============ Thread scratch ============

/// All per-worker mutable state. Owned by the propagator so RNG streams
/// persist across frames and allocations are reused.
#[derive(Debug)]
pub(crate) struct ThreadScratch {
    pub rng: ChaCha8Rng,
    pub specular_paths: Vec<SpecularPath>,
    pub images: Vec<ImagePosition>,
    pub path_id: PathId,
    pub diffuse_path_id: PathId,
    pub validation_rays: Vec<Ray>,
    pub diffraction: DiffractionScratch,
    pub specular_rays_cast: u64,
    pub diffuse_rays_cast: u64,
    pub total_ray_depth: u64,
}

impl ThreadScratch {
    /// Deterministic per-worker seeding: frames reproduce for a fixed
    /// thread count.
    pub fn new(worker_index: usize) -> Self {
        use rand::SeedableRng;
        Self {
            rng: ChaCha8Rng::seed_from_u64(42 * (worker_index as u64 + 1) + 27),
            specular_paths: Vec::new(),
            images: Vec::new(),
            path_id: PathId::new(),
            diffuse_path_id: PathId::new(),
            validation_rays: Vec::new(),
            diffraction: DiffractionScratch::default(),
            specular_rays_cast: 0,
            diffuse_rays_cast: 0,
            total_ray_depth: 0,
        }
    }
}

/// A worker's hand-off buffer: contributions accumulate into a batch
/// that is sent to the main thread when full. The bounded channel
/// provides the backpressure that bounds worker memory.
pub(crate) struct DiffuseSink<'a> {
    batch: Vec<DiffuseContribution>,
    sender: &'a Sender<Vec<DiffuseContribution>>,
}

impl<'a> DiffuseSink<'a> {
    pub fn new(sender: &'a Sender<Vec<DiffuseContribution>>) -> Self {
        Self {
            batch: Vec::with_capacity(DIFFUSE_BATCH_SIZE),
            sender,
        }
    }

    pub fn post(&mut self, contribution: DiffuseContribution) {
        self.batch.push(contribution);
        if self.batch.len() >= DIFFUSE_BATCH_SIZE {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if !self.batch.is_empty() {
            let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(DIFFUSE_BATCH_SIZE));
            // The receiver outlives all workers within the frame scope.
            let _ = self.sender.send(batch);
        }
    }
}

impl Drop for DiffuseSink<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

// ============ Sampling helpers ============

/// Uniform random unit direction.
pub(crate) fn random_direction<R: Rng>(rng: &mut R) -> Vec3 {
    let u1: f32 = rng.random_range(-1.0..1.0);
    let u2: f32 = rng.random_range(0.0..1.0);
    let r = (1.0 - u1 * u1).sqrt();
    let theta = 2.0 * std::f32::consts::PI * u2;
    Vec3::new(r * theta.cos(), r * theta.sin(), u1)
}

/// Uniform random direction inside the +z cone with the given cosine
/// half-angle.
pub(crate) fn random_direction_in_z_cone<R: Rng>(rng: &mut R, cos_half_angle: f32) -> Vec3 {
    let u1: f32 = rng.random_range(cos_half_angle..=1.0);
    let u2: f32 = rng.random_range(0.0..1.0);
    let r = (1.0 - u1 * u1).max(0.0).sqrt();
    let theta = 2.0 * std::f32::consts::PI * u2;
    Vec3::new(r * theta.cos(), r * theta.sin(), u1)
}

/// Cosine of the half-angle a sphere subtends from a point.
pub(crate) fn sphere_cos_half_angle(distance: f32, radius: f32) -> f32 {
    let side_squared = distance * distance - radius * radius;
    if side_squared <= 0.0 {
        return 0.0;
    }
    (side_squared.sqrt() / distance).clamp(0.0, 1.0)
}

/// Fraction of the hemisphere covered by a sphere's projected area, the
/// solid-angle part of the diffuse detector form factor.
pub(crate) fn hemisphere_sphere_attenuation(distance: f32, radius: f32) -> f32 {
    let cos_half = sphere_cos_half_angle(distance, radius);
    if cos_half <= 0.0 {
        return 1.0;
    }
    let half_angle = cos_half.acos();
    let projected = (distance * half_angle.tan()).powi(2);
    let hemisphere = 2.0 * distance * distance;
    if hemisphere > projected {
        projected / hemisphere
    } else {
        1.0
    }
}

/// Fraction of cone-sampled rays from `point` that reach the detector
/// sphere unobstructed.
pub(crate) fn detector_visibility<R: Rng>(
    scene: &Scene,
    detector: &Detector,
    point: Pt3,
    num_samples: u32,
    rng: &mut R,
) -> f32 {
    let to_detector = detector.position() - point;
    let distance = to_detector.norm();
    if distance < detector.radius() {
        return 1.0;
    }
    let direction = to_detector / distance;
    let rotation: Mat3 = plane_basis(direction);
    let cos_half = sphere_cos_half_angle(distance, detector.radius());
    let sphere = detector.bounding_sphere();
    let mut visible = 0u32;
    for _ in 0..num_samples {
        let sample = (rotation * random_direction_in_z_cone(rng, cos_half)).normalize();
        let ray = Ray::new(point, sample);
        if let Some(t) = ray.intersects_sphere(&sphere) {
            if !scene.intersect_ray_any(&ray, t) {
                visible += 1;
            }
        }
    }
    visible as f32 / num_samples as f32
}

/// Multi-sample direct visibility between two detectors. Returns the
/// visible fraction and the averaged unobstructed direction.
pub(crate) fn direct_visibility<R: Rng>(
    scene: &Scene,
    source_position: Pt3,
    source_radius: f32,
    listener_position: Pt3,
    listener_radius: f32,
    num_samples: u32,
    rng: &mut R,
) -> (f32, Vec3) {
    let to_source = source_position - listener_position;
    let distance = to_source.norm();
    if distance < source_radius {
        return (1.0, Vec3::new(0.0, 0.0, 1.0));
    }
    let direction = to_source / distance;
    let cos_half = sphere_cos_half_angle(distance, source_radius);
    let rotation: Mat3 = plane_basis(direction);
    let sphere = ef_core::Sphere::new(source_position, source_radius);
    let mut visible = 0u32;
    let mut average = direction;
    for _ in 0..num_samples {
        let sample = (rotation * random_direction_in_z_cone(rng, cos_half)).normalize();
        let mut ray = Ray::new(listener_position, sample);
        let Some(t) = ray.intersects_sphere(&sphere) else {
            continue;
        };
        // Start past the listener's own capture sphere.
        ray.origin += ray.direction * listener_radius;
        if !scene.intersect_ray_any(&ray, t - listener_radius) {
            visible += 1;
            average += sample;
        }
    }
    let norm = average.norm();
    if norm > f32::EPSILON {
        average /= norm;
    }
    (visible as f32 / num_samples as f32, average)
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    #[test]
    fn test_random_directions_unit() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..100 {
            assert_relative_eq!(random_direction(&mut rng).norm(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_cone_samples_stay_in_cone() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let cos_half = 0.9;
        for _ in 0..200 {
            let d = random_direction_in_z_cone(&mut rng, cos_half);
            assert!(d.z >= cos_half - 1e-5);
            assert_relative_eq!(d.norm(), 1.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_sphere_half_angle() {
        // Far sphere subtends a small angle: cosine near 1.
        assert!(sphere_cos_half_angle(100.0, 1.0) > 0.99);
        // Observer on the surface: cosine 0 (full hemisphere).
        assert_eq!(sphere_cos_half_angle(1.0, 1.0), 0.0);
    }

    #[test]
    fn test_hemisphere_attenuation_bounds() {
        for (d, r) in [(10.0, 0.5), (2.0, 1.0), (1.1, 1.0)] {
            let a = hemisphere_sphere_attenuation(d, r);
            assert!((0.0..=1.0).contains(&a), "{a} for d={d} r={r}");
        }
        // Farther detectors capture less.
        assert!(hemisphere_sphere_attenuation(20.0, 1.0) < hemisphere_sphere_attenuation(5.0, 1.0));
    }

    #[test]
    fn test_scratch_rng_deterministic() {
        use rand::RngCore;
        let mut a = ThreadScratch::new(3);
        let mut b = ThreadScratch::new(3);
        assert_eq!(a.rng.next_u64(), b.rng.next_u64());
        let mut c = ThreadScratch::new(4);
        assert_ne!(a.rng.next_u64(), c.rng.next_u64());
    }
}
