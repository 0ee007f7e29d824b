//! Sampled impulse responses
//!
//! A time-discretised IR: per sample an N-band intensity block, a
//! world-space direction accumulator, and optionally a source-direction
//! accumulator. Appending an impulse grows the buffers geometrically
//! (rounded to the SIMD block width) and zero-fills any gap, so stale
//! storage kept alive by `clear` is never observed.

use ef_core::{BAND_COUNT, BandResponse, EfError, EfResult, Vec3};

/// Buffer capacities grow in multiples of the SIMD lane width.
const SAMPLE_ALIGN: usize = BAND_COUNT;

/// A multi-band, directional, sampled impulse response.
#[derive(Debug, Clone)]
pub struct SampledIR {
    /// One band block per sample; allocated length is the capacity.
    intensity: Vec<BandResponse>,
    directions: Vec<Vec3>,
    source_directions: Vec<Vec3>,
    source_directions_enabled: bool,
    /// First potentially nonzero sample; `usize::MAX` when empty.
    start_offset: usize,
    num_samples: usize,
    sample_rate: f64,
}

impl Default for SampledIR {
    fn default() -> Self {
        Self::new(44_100.0)
    }
}

impl SampledIR {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            intensity: Vec::new(),
            directions: Vec::new(),
            source_directions: Vec::new(),
            source_directions_enabled: false,
            start_offset: usize::MAX,
            num_samples: 0,
            sample_rate: sample_rate.max(0.0),
        }
    }

    // ============ Accessors ============

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Changes the sample rate. Only valid on an empty IR: time-indexed
    /// content does not survive a rate change, so `reset` (or `clear`)
    /// first.
    pub fn set_sample_rate(&mut self, sample_rate: f64) -> EfResult<()> {
        if self.num_samples != 0 && sample_rate != self.sample_rate {
            return Err(EfError::SampleRateMismatch(self.sample_rate, sample_rate));
        }
        self.sample_rate = sample_rate.max(0.0);
        Ok(())
    }

    /// Index of the first nonzero sample (clamped to the length).
    #[inline]
    pub fn start_offset(&self) -> usize {
        self.start_offset.min(self.num_samples)
    }

    /// Start time in seconds.
    pub fn start_time(&self) -> f32 {
        if self.sample_rate > 0.0 {
            (self.start_offset() as f64 / self.sample_rate) as f32
        } else {
            0.0
        }
    }

    #[inline]
    pub fn len_samples(&self) -> usize {
        self.num_samples
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    /// Length in seconds.
    pub fn length(&self) -> f32 {
        if self.sample_rate > 0.0 {
            (self.num_samples as f64 / self.sample_rate) as f32
        } else {
            0.0
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.intensity.len()
    }

    #[inline]
    pub fn intensity(&self) -> &[BandResponse] {
        &self.intensity[..self.num_samples]
    }

    #[inline]
    pub fn directions(&self) -> &[Vec3] {
        &self.directions[..self.num_samples]
    }

    /// Source-direction samples; empty when the channel is disabled.
    #[inline]
    pub fn source_directions(&self) -> &[Vec3] {
        if self.source_directions_enabled {
            &self.source_directions[..self.num_samples]
        } else {
            &[]
        }
    }

    #[inline]
    pub fn source_directions_enabled(&self) -> bool {
        self.source_directions_enabled
    }

    /// Enables or disables the source-direction channel. Enabling zeroes
    /// the channel for existing samples.
    pub fn set_source_directions_enabled(&mut self, enabled: bool) {
        if enabled && !self.source_directions_enabled {
            self.source_directions.clear();
            self.source_directions.resize(self.capacity(), Vec3::zeros());
        } else if !enabled {
            self.source_directions = Vec::new();
        }
        self.source_directions_enabled = enabled;
    }

    // ============ Writing ============

    /// Accumulates an impulse at `delay` seconds: energy into the band
    /// intensities, the directions into their accumulators.
    pub fn add_impulse(&mut self, delay: f32, energy: BandResponse, direction: Vec3, source_direction: Vec3) {
        let index = (delay as f64 * self.sample_rate).max(0.0).floor() as usize;
        let needed = index + 1;
        if needed > self.capacity() {
            self.reallocate(needed);
        }
        if index >= self.num_samples {
            self.zero_range(self.num_samples, needed);
        }
        self.intensity[index] += energy;
        self.directions[index] += direction;
        if self.source_directions_enabled {
            self.source_directions[index] += source_direction;
        }
        self.num_samples = self.num_samples.max(needed);
        self.start_offset = self.start_offset.min(index);
    }

    /// Accumulates another IR sample-wise. The sample rates must match.
    pub fn add_ir(&mut self, other: &SampledIR) -> EfResult<()> {
        if self.sample_rate != other.sample_rate {
            return Err(EfError::SampleRateMismatch(self.sample_rate, other.sample_rate));
        }
        if other.num_samples == 0 {
            return Ok(());
        }
        if other.num_samples > self.capacity() {
            self.reallocate(other.num_samples);
        }
        if other.num_samples > self.num_samples {
            self.zero_range(self.num_samples, other.num_samples);
        }
        let start = other.start_offset();
        for i in start..other.num_samples {
            self.intensity[i] += other.intensity[i];
            self.directions[i] += other.directions[i];
        }
        if self.source_directions_enabled && other.source_directions_enabled {
            for i in start..other.num_samples {
                self.source_directions[i] += other.source_directions[i];
            }
        }
        self.start_offset = self.start_offset.min(other.start_offset);
        self.num_samples = self.num_samples.max(other.num_samples);
        Ok(())
    }

    /// Scales every band intensity in the valid range.
    pub fn scale_intensity(&mut self, gain: f32) {
        let start = self.start_offset();
        for block in &mut self.intensity[start..self.num_samples] {
            *block *= gain;
        }
    }

    /// Exponential blend toward a fresh per-frame estimate:
    /// `self = (1 - beta)·self + beta·gain·other`. Samples past either
    /// IR's length are treated as silence, so stale tail energy decays.
    pub fn blend_from(&mut self, other: &SampledIR, beta: f32, gain: f32) {
        let keep = 1.0 - beta;
        let mix = beta * gain;
        if other.num_samples > self.capacity() {
            self.reallocate(other.num_samples);
        }
        if other.num_samples > self.num_samples {
            self.zero_range(self.num_samples, other.num_samples);
        }
        let len = self.num_samples.max(other.num_samples);
        for i in 0..len {
            let (fresh_energy, fresh_dir, fresh_src) = if i < other.num_samples {
                (
                    other.intensity[i],
                    other.directions[i],
                    if other.source_directions_enabled {
                        other.source_directions[i]
                    } else {
                        Vec3::zeros()
                    },
                )
            } else {
                (BandResponse::zero(), Vec3::zeros(), Vec3::zeros())
            };
            self.intensity[i] = self.intensity[i] * keep + fresh_energy * mix;
            self.directions[i] = self.directions[i] * keep + fresh_dir * mix;
            if self.source_directions_enabled {
                self.source_directions[i] = self.source_directions[i] * keep + fresh_src * mix;
            }
        }
        self.num_samples = len;
        self.start_offset = self.start_offset.min(other.start_offset);
    }

    // ============ Length management ============

    /// Shortens the IR to the last sample where any band exceeds its
    /// threshold. Returns the new length in seconds.
    pub fn trim(&mut self, threshold: &BandResponse) -> f32 {
        if self.num_samples > 0 {
            let last_audible = self.intensity[..self.num_samples]
                .iter()
                .rposition(|block| block.any_exceeds(threshold));
            self.num_samples = last_audible.map_or(0, |i| i + 1);
        }
        self.length()
    }

    /// Sets the length, zero-padding new samples.
    pub fn set_len_samples(&mut self, len: usize) {
        if len > self.capacity() {
            self.reallocate(len);
        }
        if len > self.num_samples {
            self.zero_range(self.num_samples, len);
        }
        self.num_samples = len;
        self.start_offset = self.start_offset.min(len.saturating_sub(1));
    }

    /// Empties the IR but keeps the allocation for reuse.
    pub fn clear(&mut self) {
        self.start_offset = usize::MAX;
        self.num_samples = 0;
    }

    /// Empties the IR and releases all buffers.
    pub fn reset(&mut self) {
        self.intensity = Vec::new();
        self.directions = Vec::new();
        self.source_directions = Vec::new();
        self.start_offset = usize::MAX;
        self.num_samples = 0;
    }

    /// Sum of band intensities over the valid range.
    pub fn total_intensity(&self) -> BandResponse {
        let mut total = BandResponse::zero();
        for block in &self.intensity[..self.num_samples] {
            total += *block;
        }
        total
    }

    pub fn size_in_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.intensity.capacity() * std::mem::size_of::<BandResponse>()
            + (self.directions.capacity() + self.source_directions.capacity())
                * std::mem::size_of::<Vec3>()
    }

    // ============ Internals ============

    fn reallocate(&mut self, minimum: usize) {
        let target = minimum
            .max(self.capacity() * 2)
            .next_multiple_of(SAMPLE_ALIGN);
        self.intensity.resize(target, BandResponse::zero());
        self.directions.resize(target, Vec3::zeros());
        if self.source_directions_enabled {
            self.source_directions.resize(target, Vec3::zeros());
        }
    }

    fn zero_range(&mut self, start: usize, end: usize) {
        self.intensity[start..end].fill(BandResponse::zero());
        self.directions[start..end].fill(Vec3::zeros());
        if self.source_directions_enabled {
            self.source_directions[start..end].fill(Vec3::zeros());
        }
    }
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn impulse_at(ir: &mut SampledIR, delay: f32, energy: f32) {
        ir.add_impulse(
            delay,
            BandResponse::splat(energy),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, -1.0),
        );
    }

    #[test]
    fn test_impulse_placement() {
        let mut ir = SampledIR::new(1000.0);
        impulse_at(&mut ir, 0.5, 1.0);
        assert_eq!(ir.len_samples(), 501);
        assert_eq!(ir.start_offset(), 500);
        assert_relative_eq!(ir.intensity()[500][0], 1.0);
        // Samples before the start are silent.
        assert_eq!(ir.intensity()[499], BandResponse::zero());
    }

    #[test]
    fn test_negative_delay_clamps_to_first_sample() {
        let mut ir = SampledIR::new(1000.0);
        impulse_at(&mut ir, -0.1, 1.0);
        assert_eq!(ir.start_offset(), 0);
        assert_eq!(ir.len_samples(), 1);
    }

    #[test]
    fn test_repeated_impulse_accumulates_linearly() {
        let mut ir = SampledIR::new(1000.0);
        for _ in 0..5 {
            impulse_at(&mut ir, 0.1, 0.25);
        }
        assert_relative_eq!(ir.intensity()[100][3], 1.25);
        assert_relative_eq!(ir.directions()[100].z, 5.0);
    }

    #[test]
    fn test_trim_scenario() {
        // Impulses at samples 0, 100 and 500; the 500 entry is below the
        // trim threshold so the length becomes 101.
        let mut ir = SampledIR::new(1000.0);
        impulse_at(&mut ir, 0.0, 1.0);
        impulse_at(&mut ir, 0.1, 0.5);
        impulse_at(&mut ir, 0.5, 1e-6);
        assert_eq!(ir.len_samples(), 501);
        let length = ir.trim(&BandResponse::splat(1e-5));
        assert_eq!(ir.len_samples(), 101);
        assert_relative_eq!(length, 0.101, epsilon = 1e-6);
    }

    #[test]
    fn test_trim_everything() {
        let mut ir = SampledIR::new(1000.0);
        impulse_at(&mut ir, 0.05, 1e-9);
        ir.trim(&BandResponse::splat(1e-5));
        assert_eq!(ir.len_samples(), 0);
        assert_eq!(ir.start_offset(), 0);
    }

    #[test]
    fn test_add_ir() {
        let mut a = SampledIR::new(1000.0);
        impulse_at(&mut a, 0.01, 1.0);
        let mut b = SampledIR::new(1000.0);
        impulse_at(&mut b, 0.02, 2.0);
        a.add_ir(&b).unwrap();
        assert_eq!(a.len_samples(), 21);
        assert_relative_eq!(a.intensity()[10][0], 1.0);
        assert_relative_eq!(a.intensity()[20][0], 2.0);
        assert_relative_eq!(a.total_intensity()[0], 3.0);
    }

    #[test]
    fn test_add_ir_rate_mismatch() {
        let mut a = SampledIR::new(1000.0);
        let b = SampledIR::new(2000.0);
        assert!(a.add_ir(&b).is_err());
    }

    #[test]
    fn test_clear_keeps_storage_but_hides_content() {
        let mut ir = SampledIR::new(1000.0);
        impulse_at(&mut ir, 0.1, 1.0);
        let capacity = ir.capacity();
        ir.clear();
        assert_eq!(ir.capacity(), capacity);
        assert_eq!(ir.len_samples(), 0);
        // Re-adding past the old content zeroes the gap.
        impulse_at(&mut ir, 0.05, 0.5);
        assert_eq!(ir.intensity()[49], BandResponse::zero());
        assert_relative_eq!(ir.intensity()[50][0], 0.5);
    }

    #[test]
    fn test_reset_releases_storage() {
        let mut ir = SampledIR::new(1000.0);
        impulse_at(&mut ir, 0.1, 1.0);
        ir.reset();
        assert_eq!(ir.capacity(), 0);
        assert!(ir.set_sample_rate(48_000.0).is_ok());
    }

    #[test]
    fn test_rate_change_requires_empty() {
        let mut ir = SampledIR::new(1000.0);
        impulse_at(&mut ir, 0.1, 1.0);
        assert!(ir.set_sample_rate(2000.0).is_err());
        ir.clear();
        assert!(ir.set_sample_rate(2000.0).is_ok());
    }

    #[test]
    fn test_blend_converges_to_constant_input() {
        // responseTime = 1 s at dt = 0.1 s gives maxAge 10 and
        // beta = 1 - 10^(-0.4).
        let beta = 1.0 - 10.0_f32.powf(-0.4);
        let mut fresh = SampledIR::new(1000.0);
        impulse_at(&mut fresh, 0.01, 1.0);

        let mut cache = SampledIR::new(1000.0);
        let mut expected = 0.0;
        for _ in 0..40 {
            cache.blend_from(&fresh, beta, 1.0);
            expected = expected * (1.0 - beta) + beta;
        }
        assert_relative_eq!(cache.intensity()[10][0], expected, epsilon = 1e-4);
        assert!((cache.intensity()[10][0] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_capacity_is_simd_aligned() {
        let mut ir = SampledIR::new(1000.0);
        impulse_at(&mut ir, 0.013, 1.0);
        assert_eq!(ir.capacity() % BAND_COUNT, 0);
        assert!(ir.capacity() >= ir.len_samples());
    }
}
