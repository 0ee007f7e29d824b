//! Acoustic surface materials
//!
//! A material describes how a surface reflects, scatters and transmits
//! sound as frequency-dependent fractions in [0, 1], plus a display
//! color. Materials are authored as break-point frequency responses and
//! projected onto the active band layout before tracing.

use ef_core::{BandResponse, FrequencyBands, FrequencyResponse, Vec3, plane_basis};
use rand::Rng;

/// An acoustic material: energy fractions for reflection, scattering and
/// transmission plus an RGBA display color.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Material {
    /// Fraction of incident energy reflected (specular + diffuse), per
    /// frequency.
    pub reflectivity: FrequencyResponse,
    /// Fraction of reflected energy that is scattered diffusely rather
    /// than mirrored, per frequency.
    pub scattering: FrequencyResponse,
    /// Fraction of incident energy transmitted through the surface, per
    /// frequency.
    pub transmission: FrequencyResponse,
    /// Display color (RGBA).
    pub color: [f32; 4],
}

impl Default for Material {
    fn default() -> Self {
        Self {
            reflectivity: FrequencyResponse::flat(0.9),
            scattering: FrequencyResponse::flat(0.2),
            transmission: FrequencyResponse::flat(0.0),
            color: [0.5, 0.5, 0.5, 1.0],
        }
    }
}

impl Material {
    pub fn new(
        reflectivity: FrequencyResponse,
        scattering: FrequencyResponse,
        transmission: FrequencyResponse,
    ) -> Self {
        Self {
            reflectivity,
            scattering,
            transmission,
            color: [0.5, 0.5, 0.5, 1.0],
        }
    }

    /// Projects the material onto a band layout. The result is what the
    /// per-ray code consumes; projections are cached per mesh by the
    /// propagator and recomputed when the active bands change.
    pub fn project(&self, bands: &FrequencyBands) -> MaterialBands {
        MaterialBands {
            reflectivity: self.reflectivity.band_response(bands),
            scattering: self.scattering.band_response(bands),
            transmission: self.transmission.band_response(bands),
        }
    }
}

/// A material projected onto the active frequency bands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialBands {
    pub reflectivity: BandResponse,
    pub scattering: BandResponse,
    pub transmission: BandResponse,
}

impl Default for MaterialBands {
    fn default() -> Self {
        Material::default().project(&FrequencyBands::default())
    }
}

impl MaterialBands {
    /// Mirror reflection of an incident direction about the surface
    /// normal.
    #[inline]
    pub fn specular_reflection(&self, incoming: Vec3, normal: Vec3) -> Vec3 {
        incoming - normal * (2.0 * incoming.dot(&normal))
    }

    /// Samples an outgoing bounce direction for a random-walk ray: with
    /// probability equal to the mean scattering fraction the bounce is a
    /// cosine-weighted hemisphere sample, otherwise the mirror direction.
    pub fn sample_reflection<R: Rng>(&self, incoming: Vec3, normal: Vec3, rng: &mut R) -> Vec3 {
        if rng.random::<f32>() < self.scattering.average() {
            cosine_hemisphere(normal, rng)
        } else {
            self.specular_reflection(incoming, normal)
        }
    }

    /// Probability density shape for scattering into `outgoing` from a
    /// surface with the given normal: the clamped Lambertian cosine lobe.
    #[inline]
    pub fn diffuse_reflection_probability(&self, normal: Vec3, outgoing: Vec3) -> f32 {
        normal.dot(&outgoing).max(0.0)
    }
}

/// Cosine-weighted unit direction in the hemisphere around `normal`.
pub fn cosine_hemisphere<R: Rng>(normal: Vec3, rng: &mut R) -> Vec3 {
    let u1: f32 = rng.random();
    let u2: f32 = rng.random();
    let r = u1.sqrt();
    let theta = 2.0 * std::f32::consts::PI * u2;
    let local = Vec3::new(r * theta.cos(), r * theta.sin(), (1.0 - u1).sqrt());
    plane_basis(normal) * local
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_projection_ranges() {
        let material = Material::default();
        let bands = material.project(&FrequencyBands::default());
        for b in 0..bands.reflectivity.band_count() {
            assert!((0.0..=1.0).contains(&bands.reflectivity[b]));
            assert!((0.0..=1.0).contains(&bands.scattering[b]));
            assert_eq!(bands.transmission[b], 0.0);
        }
    }

    #[test]
    fn test_mirror_reflection() {
        let bands = MaterialBands::default();
        let normal = Vec3::new(0.0, 0.0, 1.0);
        let incoming = Vec3::new(1.0, 0.0, -1.0).normalize();
        let reflected = bands.specular_reflection(incoming, normal);
        assert_relative_eq!(reflected.z, -incoming.z, epsilon = 1e-6);
        assert_relative_eq!(reflected.x, incoming.x, epsilon = 1e-6);
    }

    #[test]
    fn test_sampled_bounce_leaves_surface() {
        let bands = MaterialBands::default();
        let normal = Vec3::new(0.0, 1.0, 0.0);
        let incoming = Vec3::new(0.3, -0.8, 0.1).normalize();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..64 {
            let out = bands.sample_reflection(incoming, normal, &mut rng);
            assert!(out.dot(&normal) > -1e-4);
            assert_relative_eq!(out.norm(), 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_diffuse_probability_clamped() {
        let bands = MaterialBands::default();
        let normal = Vec3::new(0.0, 0.0, 1.0);
        assert_eq!(
            bands.diffuse_reflection_probability(normal, Vec3::new(0.0, 0.0, -1.0)),
            0.0
        );
        assert_relative_eq!(
            bands.diffuse_reflection_probability(normal, Vec3::new(0.0, 0.0, 1.0)),
            1.0
        );
    }
}
