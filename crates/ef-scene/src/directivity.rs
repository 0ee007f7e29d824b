//! Source directivity
//!
//! A directivity is a sphere-sampled set of (direction, frequency
//! response) pairs with a source-local orientation. For tracing it is
//! compressed into a band directivity: per-band gains expanded in real
//! spherical harmonics up to an adaptively chosen order, cheap to
//! evaluate per ray.

use ef_core::{BAND_COUNT, BandResponse, FrequencyBands, FrequencyResponse, Mat3, Vec3, barycentric};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::sh;

// ============ Directivity ============

/// A sphere-sampled directivity pattern. Gains are amplitude fractions;
/// the band directivity squares them into energy.
#[derive(Debug, Clone)]
pub struct Directivity {
    samples: Vec<(Vec3, FrequencyResponse)>,
    orientation: Mat3,
    timestamp: u64,
}

impl Default for Directivity {
    /// Omnidirectional.
    fn default() -> Self {
        Self {
            samples: Vec::new(),
            orientation: Mat3::identity(),
            timestamp: 0,
        }
    }
}

impl Directivity {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    #[inline]
    pub fn sample_direction(&self, index: usize) -> Vec3 {
        self.samples[index].0
    }

    #[inline]
    pub fn sample_response(&self, index: usize) -> &FrequencyResponse {
        &self.samples[index].1
    }

    /// Adds a sample for a direction in source-local space. The direction
    /// is normalised.
    pub fn add_sample(&mut self, direction: Vec3, response: FrequencyResponse) {
        self.samples.push((direction.normalize(), response));
        self.timestamp += 1;
    }

    pub fn clear_samples(&mut self) {
        self.samples.clear();
        self.timestamp += 1;
    }

    #[inline]
    pub fn orientation(&self) -> &Mat3 {
        &self.orientation
    }

    pub fn set_orientation(&mut self, orientation: Mat3) {
        self.orientation = orientation;
        self.timestamp += 1;
    }

    /// Monotonic edit stamp; band directivities refit when it changes.
    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

// ============ Band Directivity ============

/// Number of random directions added to the input samples when fitting
/// the spherical-harmonic expansion.
const INTEGRATION_SAMPLES: usize = 10_000;
/// Target mean RMS fit error, relative to the normalised response.
const MAX_FIT_ERROR: f32 = 0.05;
/// Stop raising the order once the error improves by less than this
/// fraction.
const FIT_CONVERGENCE: f32 = 0.02;

/// A directivity projected onto the active bands and expanded in real
/// spherical harmonics. Evaluation is a basis dot product.
#[derive(Debug, Clone)]
pub struct BandDirectivity {
    coefficients: Vec<BandResponse>,
    order: usize,
    fitted_timestamp: Option<u64>,
}

impl Default for BandDirectivity {
    fn default() -> Self {
        Self {
            coefficients: Vec::new(),
            order: 0,
            fitted_timestamp: None,
        }
    }
}

impl BandDirectivity {
    /// Fits the expansion to a directivity for the given band layout.
    /// A repeated call with an unchanged directivity stamp is a no-op.
    pub fn fit(&mut self, directivity: &Directivity, bands: &FrequencyBands) {
        if self.fitted_timestamp == Some(directivity.timestamp()) {
            return;
        }
        self.fitted_timestamp = Some(directivity.timestamp());

        let num_input = directivity.sample_count();
        if num_input == 0 {
            self.coefficients.clear();
            self.order = 0;
            return;
        }

        // Project the authored samples to energy band responses in world
        // orientation, then densify with interpolated random directions
        // so the projection integral is well conditioned.
        let mut samples: Vec<(Vec3, BandResponse)> = Vec::with_capacity(num_input + INTEGRATION_SAMPLES);
        let mut total = BandResponse::zero();
        for i in 0..num_input {
            let response = directivity.sample_response(i);
            let mut band = BandResponse::zero();
            for b in 0..BAND_COUNT {
                let gain = response.gain_at(bands.center(b));
                band[b] = gain * gain;
            }
            total += band;
            let dir = (directivity.orientation() * directivity.sample_direction(i)).normalize();
            samples.push((dir, band));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(0x5eed_d1f);
        for _ in 0..INTEGRATION_SAMPLES {
            let dir = random_direction(&mut rng);
            let response = interpolate_samples(dir, &samples[..num_input]);
            total += response;
            samples.push((dir, response));
        }

        // Normalise so the mean response over the sphere is unity.
        let mean = total.sum() / BAND_COUNT as f32 / samples.len() as f32;
        if mean > f32::EPSILON {
            let normalize = 1.0 / mean;
            for (_, response) in &mut samples {
                *response *= normalize;
            }
        }

        let mut basis = [0.0f32; sh::coefficient_count(sh::MAX_SH_ORDER)];
        let mut last_error = f32::MAX;
        let mut backtracked = false;
        let mut order = 0usize;
        let mut max_order = sh::MAX_SH_ORDER;
        loop {
            let count = sh::coefficient_count(order);
            self.coefficients.clear();
            self.coefficients.resize(count, BandResponse::zero());

            // Monte-Carlo projection onto the basis.
            for (dir, response) in &samples {
                sh::eval_basis(order, *dir, &mut basis);
                for (c, coefficient) in self.coefficients.iter_mut().enumerate() {
                    *coefficient += *response * basis[c];
                }
            }
            let normalize = 4.0 * std::f32::consts::PI / samples.len() as f32;
            for coefficient in &mut self.coefficients {
                *coefficient *= normalize;
            }
            self.order = order;

            // RMS reconstruction error, averaged over bands.
            let mut error_sum = BandResponse::zero();
            for (dir, response) in &samples {
                sh::eval_basis(order, *dir, &mut basis);
                let mut reconstructed = BandResponse::zero();
                for (c, coefficient) in self.coefficients.iter().enumerate() {
                    reconstructed += *coefficient * basis[c];
                }
                let diff = reconstructed - *response;
                error_sum += diff * diff;
            }
            let mut error = 0.0;
            for b in 0..BAND_COUNT {
                error += (error_sum[b] / samples.len() as f32).sqrt();
            }
            error /= BAND_COUNT as f32;

            // A higher order that fits worse means the sampling cannot
            // support it; step back once and stop there.
            if error > last_error && !backtracked && order > 0 {
                order -= 1;
                max_order = order;
                backtracked = true;
                continue;
            }
            if error < MAX_FIT_ERROR
                || (last_error / error.max(f32::EPSILON) - 1.0) < FIT_CONVERGENCE
                || order >= max_order
            {
                break;
            }
            last_error = error;
            order += 1;
        }
    }

    /// Whether a fit has been performed for the given directivity stamp.
    pub fn is_current(&self, directivity: &Directivity) -> bool {
        self.fitted_timestamp == Some(directivity.timestamp())
    }

    #[inline]
    pub fn order(&self) -> usize {
        self.order
    }

    /// Per-band energy gain toward a unit direction in world space.
    pub fn response(&self, direction: Vec3) -> BandResponse {
        if self.coefficients.is_empty() {
            return BandResponse::default();
        }
        let mut basis = [0.0f32; sh::coefficient_count(sh::MAX_SH_ORDER)];
        sh::eval_basis(self.order, direction, &mut basis);
        let mut response = BandResponse::zero();
        for (c, coefficient) in self.coefficients.iter().enumerate() {
            response += *coefficient * basis[c];
        }
        response.max_with(BandResponse::zero())
    }
}

fn random_direction<R: Rng>(rng: &mut R) -> Vec3 {
    let u1: f32 = rng.random_range(-1.0..1.0);
    let u2: f32 = rng.random_range(0.0..1.0);
    let r = (1.0 - u1 * u1).sqrt();
    let theta = 2.0 * std::f32::consts::PI * u2;
    Vec3::new(r * theta.cos(), r * theta.sin(), u1)
}

/// Interpolates sparse directivity samples at a query direction: nearest
/// sample barycentric blend for three or more samples, cosine weighting
/// for two, passthrough for one.
fn interpolate_samples(direction: Vec3, samples: &[(Vec3, BandResponse)]) -> BandResponse {
    match samples.len() {
        0 => BandResponse::default(),
        1 => samples[0].1,
        2 => {
            let c0 = direction.dot(&samples[0].0).max(0.0);
            let c1 = direction.dot(&samples[1].0).max(0.0);
            if c0 + c1 < f32::EPSILON {
                (samples[0].1 + samples[1].1) * 0.5
            } else {
                (samples[0].1 * c0 + samples[1].1 * c1) * (1.0 / (c0 + c1))
            }
        }
        _ => {
            // Three closest samples by angle, blended barycentrically.
            let mut closest = [0usize; 3];
            let mut cos = [-1.0f32; 3];
            for (i, (dir, _)) in samples.iter().enumerate() {
                let c = direction.dot(dir);
                if c > cos[0] {
                    cos.copy_within(0..2, 1);
                    closest.copy_within(0..2, 1);
                    cos[0] = c;
                    closest[0] = i;
                } else if c > cos[1] {
                    cos[2] = cos[1];
                    closest[2] = closest[1];
                    cos[1] = c;
                    closest[1] = i;
                } else if c > cos[2] {
                    cos[2] = c;
                    closest[2] = i;
                }
            }
            let a = samples[closest[0]].0;
            let b = samples[closest[1]].0;
            let c = samples[closest[2]].0;
            let bary = barycentric(a.into(), b.into(), c.into(), direction.into());
            samples[closest[0]].1 * bary.x
                + samples[closest[1]].1 * bary.y
                + samples[closest[2]].1 * bary.z
        }
    }
}

// ============ Predefined Directivities ============

/// Measured directivity tables for common source types, stored as const
/// data: (direction, [(frequency, amplitude gain)]).
mod tables {
    pub type Table = &'static [([f32; 3], &'static [(f32, f32)])];

    /// Rough human-voice pattern: forward-biased, increasingly so with
    /// frequency.
    pub const HUMAN_VOICE: Table = &[
        ([0.0, 0.0, 1.0], &[(125.0, 1.0), (1000.0, 1.0), (8000.0, 1.0)]),
        ([1.0, 0.0, 0.0], &[(125.0, 0.89), (1000.0, 0.71), (8000.0, 0.50)]),
        ([-1.0, 0.0, 0.0], &[(125.0, 0.89), (1000.0, 0.71), (8000.0, 0.50)]),
        ([0.0, 1.0, 0.0], &[(125.0, 0.93), (1000.0, 0.79), (8000.0, 0.63)]),
        ([0.0, -1.0, 0.0], &[(125.0, 0.84), (1000.0, 0.63), (8000.0, 0.45)]),
        ([0.0, 0.0, -1.0], &[(125.0, 0.71), (1000.0, 0.32), (8000.0, 0.18)]),
    ];

    /// Trumpet bell pattern: strongly forward above the bell cutoff.
    pub const TRUMPET: Table = &[
        ([0.0, 0.0, 1.0], &[(250.0, 1.0), (2000.0, 1.0), (8000.0, 1.0)]),
        ([1.0, 0.0, 0.0], &[(250.0, 0.79), (2000.0, 0.40), (8000.0, 0.22)]),
        ([-1.0, 0.0, 0.0], &[(250.0, 0.79), (2000.0, 0.40), (8000.0, 0.22)]),
        ([0.0, 1.0, 0.0], &[(250.0, 0.79), (2000.0, 0.45), (8000.0, 0.25)]),
        ([0.0, -1.0, 0.0], &[(250.0, 0.79), (2000.0, 0.45), (8000.0, 0.25)]),
        ([0.0, 0.0, -1.0], &[(250.0, 0.56), (2000.0, 0.16), (8000.0, 0.06)]),
    ];
}

fn from_table(table: tables::Table) -> Directivity {
    let mut directivity = Directivity::new();
    for &(dir, points) in table {
        directivity.add_sample(
            Vec3::new(dir[0], dir[1], dir[2]),
            FrequencyResponse::from_points(points.iter().copied()),
        );
    }
    directivity
}

impl Directivity {
    /// An omnidirectional source.
    pub fn omnidirectional() -> Self {
        Self::default()
    }

    /// An approximate human-voice pattern facing +Z.
    pub fn human_voice() -> Self {
        from_table(tables::HUMAN_VOICE)
    }

    /// An approximate trumpet pattern facing +Z.
    pub fn trumpet() -> Self {
        from_table(tables::TRUMPET)
    }
}

// ============ Tests ============
