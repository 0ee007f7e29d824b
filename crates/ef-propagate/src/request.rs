//! Propagation requests and statistics
//!
//! The request selects features and budgets for one propagation frame.
//! Out-of-range values are clamped at the frame boundary rather than
//! rejected, so a malformed request degrades instead of failing.

use std::time::Duration;

use bitflags::bitflags;
use ef_core::FrequencyBands;

bitflags! {
    /// Feature selection for a propagation frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    pub struct PropagationFlags: u32 {
        /// Direct line-of-sight paths.
        const DIRECT = 1 << 0;
        /// Transmission through occluders.
        const TRANSMISSION = 1 << 1;
        /// Specular reflection paths.
        const SPECULAR = 1 << 2;
        /// Diffuse reflection paths.
        const DIFFUSE = 1 << 3;
        /// Edge diffraction paths.
        const DIFFRACTION = 1 << 4;
        /// Persist validated specular/diffraction paths across frames.
        const SPECULAR_CACHE = 1 << 5;
        /// Average diffuse contributions across frames.
        const DIFFUSE_CACHE = 1 << 6;
        /// Exponentially smooth the sampled IR across frames.
        const IR_CACHE = 1 << 7;
        /// Track per-source triangle visibility to prune candidates.
        const VISIBILITY_CACHE = 1 << 8;
        /// Produce sampled IRs instead of (or alongside) path records.
        const SAMPLED_IR = 1 << 9;
        /// Keep a per-sample source-direction channel in sampled IRs.
        const SAMPLED_IR_SOURCE_DIRECTIONS = 1 << 10;
        /// Trace diffuse rays from sources instead of listeners.
        const SOURCE_DIFFUSE = 1 << 11;
        /// Apply source directivities.
        const SOURCE_DIRECTIVITY = 1 << 12;
        /// Merge angularly close sources into shared IRs.
        const SOURCE_CLUSTERING = 1 << 13;
        /// Trim IR tails below the listener hearing threshold.
        const IR_THRESHOLD = 1 << 14;
        /// Let per-source IR length track the audible tail.
        const ADAPTIVE_IR_LENGTH = 1 << 15;
        /// Apply frequency-dependent air absorption.
        const AIR_ABSORPTION = 1 << 16;
        /// Keep strongly doppler-shifted paths in record form.
        const DOPPLER_SORTING = 1 << 17;
        /// Fill in the statistics struct.
        const STATISTICS = 1 << 18;
    }
}

/// All inputs controlling one propagation frame.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PropagationRequest {
    pub flags: PropagationFlags,

    /// Rays in the direct-visibility cone per (listener, source) pair.
    pub num_direct_rays: u32,
    /// Specular probe rays per listener.
    pub num_specular_rays: u32,
    /// Diffuse random-walk rays per listener (or source).
    pub num_diffuse_rays: u32,
    /// Visibility-refresh rays per source.
    pub num_visibility_rays: u32,
    /// Visibility samples per specular validation.
    pub num_specular_samples: u32,
    /// Visibility samples per diffuse detector test.
    pub num_diffuse_samples: u32,

    pub max_specular_depth: u32,
    pub max_diffuse_depth: u32,
    pub max_diffraction_depth: u32,
    pub max_diffraction_order: u32,

    /// IR length bounds and growth rate, seconds and seconds/second.
    pub min_ir_length: f32,
    pub max_ir_length: f32,
    pub ir_growth_rate: f32,
    /// Temporal smoothing constant for the caches, seconds.
    pub response_time: f32,
    /// Lifetime of visibility-cache entries, seconds.
    pub visibility_cache_time: f32,

    /// Self-intersection epsilon in meters.
    pub ray_offset: f32,
    /// Output IR sample rate in Hz.
    pub sample_rate: f64,
    /// The active frequency band layout.
    pub frequencies: FrequencyBands,
    /// Doppler-sorting threshold in cents.
    pub doppler_threshold: f32,

    /// Measured frame delta, seconds; 0 falls back to `target_dt`.
    pub dt: f32,
    /// Nominal frame delta, seconds.
    pub target_dt: f32,

    pub num_threads: u32,

    /// Ray-count multiplier, clamped to [`min_quality`, `max_quality`].
    pub quality: f32,
    pub min_quality: f32,
    pub max_quality: f32,

    /// Clustering hysteresis angles, radians.
    pub inner_clustering_angle: f32,
    pub outer_clustering_angle: f32,
}

impl Default for PropagationRequest {
    fn default() -> Self {
        Self {
            flags: PropagationFlags::DIRECT
                | PropagationFlags::SPECULAR
                | PropagationFlags::DIFFUSE
                | PropagationFlags::DIFFRACTION
                | PropagationFlags::SPECULAR_CACHE
                | PropagationFlags::DIFFUSE_CACHE
                | PropagationFlags::IR_THRESHOLD
                | PropagationFlags::AIR_ABSORPTION,
            num_direct_rays: 100,
            num_specular_rays: 1000,
            num_diffuse_rays: 1000,
            num_visibility_rays: 500,
            num_specular_samples: 1,
            num_diffuse_samples: 1,
            max_specular_depth: 3,
            max_diffuse_depth: 10,
            max_diffraction_depth: 2,
            max_diffraction_order: 3,
            min_ir_length: 0.5,
            max_ir_length: 4.0,
            ir_growth_rate: 0.25,
            response_time: 0.5,
            visibility_cache_time: 0.25,
            ray_offset: 1e-4,
            sample_rate: 44_100.0,
            frequencies: FrequencyBands::default(),
            doppler_threshold: 10.0,
            dt: 0.0,
            target_dt: 1.0 / 60.0,
            num_threads: 1,
            quality: 1.0,
            min_quality: 0.25,
            max_quality: 2.0,
            inner_clustering_angle: 0.035,
            outer_clustering_angle: 0.07,
        }
    }
}

impl PropagationRequest {
    /// Clamps every field into its valid range. Called once at the frame
    /// boundary; the propagator only ever sees sanitized requests.
    pub fn sanitize(&mut self) {
        self.num_direct_rays = self.num_direct_rays.clamp(1, 1_000_000_000);
        self.num_specular_rays = self.num_specular_rays.min(1_000_000_000);
        self.num_diffuse_rays = self.num_diffuse_rays.min(1_000_000_000);
        self.num_visibility_rays = self.num_visibility_rays.min(1_000_000_000);
        self.num_specular_samples = self.num_specular_samples.clamp(1, 10_000);
        self.num_diffuse_samples = self.num_diffuse_samples.clamp(1, 10_000);
        self.max_specular_depth = self.max_specular_depth.min(1000);
        self.max_diffuse_depth = self.max_diffuse_depth.min(1000);
        self.max_diffraction_depth = self.max_diffraction_depth.min(1000);
        self.max_diffraction_order = self.max_diffraction_order.min(10);
        self.min_ir_length = sane(self.min_ir_length).max(0.0);
        self.max_ir_length = sane(self.max_ir_length).max(self.min_ir_length);
        self.ir_growth_rate = sane(self.ir_growth_rate).max(0.0);
        self.response_time = sane(self.response_time).clamp(0.0, 100.0);
        self.visibility_cache_time = sane(self.visibility_cache_time).clamp(0.0, 100.0);
        self.ray_offset = sane(self.ray_offset).clamp(0.0, 1.0);
        self.sample_rate = if self.sample_rate.is_finite() {
            self.sample_rate.max(0.0)
        } else {
            44_100.0
        };
        self.doppler_threshold = sane(self.doppler_threshold).max(0.0);
        self.dt = sane(self.dt).max(0.0);
        self.target_dt = if self.target_dt > 0.0 && self.target_dt.is_finite() {
            self.target_dt
        } else {
            1.0 / 60.0
        };
        let max_threads = 2 * std::thread::available_parallelism().map_or(1, |n| n.get() as u32);
        let requested_threads = self.num_threads;
        self.num_threads = self.num_threads.clamp(1, max_threads);
        if self.num_threads != requested_threads {
            log::warn!(
                "requested {requested_threads} worker threads, clamped to {}",
                self.num_threads
            );
        }
        self.min_quality = sane(self.min_quality).clamp(0.0, 1.0);
        self.max_quality = sane(self.max_quality).clamp(0.0, 10.0);
        self.quality = sane(self.quality).clamp(self.min_quality, self.max_quality);
        self.inner_clustering_angle = sane(self.inner_clustering_angle).max(0.0);
        self.outer_clustering_angle =
            sane(self.outer_clustering_angle).max(self.inner_clustering_angle);
    }

    /// The frame delta the temporal caches should use.
    #[inline]
    pub fn effective_dt(&self) -> f32 {
        if self.dt > 0.0 { self.dt } else { self.target_dt }
    }

    #[inline]
    pub fn has(&self, flags: PropagationFlags) -> bool {
        self.flags.contains(flags)
    }
}

/// NaN-safe value: non-finite inputs collapse to zero before clamping.
#[inline]
fn sane(value: f32) -> f32 {
    if value.is_finite() { value } else { 0.0 }
}

// ============ Statistics ============

/// Optional per-frame measurements.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    pub specular_ray_count: u64,
    pub diffuse_ray_count: u64,
    /// Mean diffuse ray depth.
    pub diffuse_ray_depth: f32,

    pub propagation_time: Duration,
    pub ray_tracing_time: Duration,
    pub cache_update_time: Duration,
    pub clustering_time: Duration,

    pub listener_count: usize,
    pub source_count: usize,
    pub cluster_count: usize,
    pub object_count: usize,
    pub triangle_count: usize,
    pub vertex_count: usize,
    pub edge_count: usize,
    /// Scene memory footprint in bytes.
    pub scene_memory: usize,

    /// Mean and max source IR length, seconds.
    pub average_ir_length: f32,
    pub max_ir_length: f32,
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_clamps() {
        let mut request = PropagationRequest {
            num_direct_rays: 0,
            num_specular_samples: 0,
            max_diffraction_order: 99,
            ray_offset: 7.0,
            quality: 100.0,
            num_threads: 0,
            response_time: f32::NAN,
            ..Default::default()
        };
        request.sanitize();
        assert_eq!(request.num_direct_rays, 1);
        assert_eq!(request.num_specular_samples, 1);
        assert_eq!(request.max_diffraction_order, 10);
        assert_eq!(request.ray_offset, 1.0);
        assert!(request.quality <= request.max_quality);
        assert!(request.num_threads >= 1);
        assert_eq!(request.response_time, 0.0);
    }

    #[test]
    fn test_effective_dt_fallback() {
        let mut request = PropagationRequest::default();
        request.dt = 0.0;
        assert_eq!(request.effective_dt(), request.target_dt);
        request.dt = 0.02;
        assert_eq!(request.effective_dt(), 0.02);
    }

    #[test]
    fn test_quality_clamped_between_bounds() {
        let mut request = PropagationRequest {
            quality: 0.0,
            min_quality: 0.5,
            max_quality: 2.0,
            ..Default::default()
        };
        request.sanitize();
        assert_eq!(request.quality, 0.5);
    }
}
