//! Per-source, per-listener and per-scene IR containers
//!
//! A source IR holds the frame's output for one (listener, source) pair
//! in either form the renderer may request: a list of discrete path
//! records, a sampled IR, or both. A listener IR holds one source IR per
//! enabled source; the scene IR holds one listener IR per enabled
//! listener.

use ef_core::{BandResponse, FrequencyBands, Vec3};

use crate::ir::SampledIR;
use crate::path::SoundPath;

// ============ Source IR ============

/// The impulse response from one source (or merged source cluster) at
/// one listener.
#[derive(Debug, Clone, Default)]
pub struct SourceIR {
    /// Identities of the sources mixed into this IR (more than one for a
    /// merged cluster).
    sources: Vec<u64>,
    /// Combined radiated power of those sources, for threshold and
    /// pressure conversions.
    total_power: f32,
    paths: Vec<SoundPath>,
    sampled: SampledIR,
    /// Earliest path delay in seconds.
    start_time: f32,
    /// Longest path delay in seconds.
    path_length: f32,
}

impl SourceIR {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sampled: SampledIR::new(sample_rate),
            start_time: f32::MAX,
            ..Self::default()
        }
    }

    // ============ Sources ============

    #[inline]
    pub fn source_ids(&self) -> &[u64] {
        &self.sources
    }

    pub fn add_source(&mut self, id: u64, power: f32) {
        self.sources.push(id);
        self.total_power += power;
    }

    pub fn clear_sources(&mut self) {
        self.sources.clear();
        self.total_power = 0.0;
    }

    #[inline]
    pub fn total_power(&self) -> f32 {
        self.total_power
    }

    // ============ Content ============

    #[inline]
    pub fn paths(&self) -> &[SoundPath] {
        &self.paths
    }

    #[inline]
    pub fn paths_mut(&mut self) -> &mut [SoundPath] {
        &mut self.paths
    }

    pub fn add_path(&mut self, path: SoundPath) {
        let delay = path.delay();
        self.start_time = self.start_time.min(delay);
        self.path_length = self.path_length.max(delay);
        self.paths.push(path);
    }

    pub fn add_impulse(&mut self, delay: f32, energy: BandResponse, direction: Vec3, source_direction: Vec3) {
        self.sampled.add_impulse(delay, energy, direction, source_direction);
    }

    #[inline]
    pub fn sampled(&self) -> &SampledIR {
        &self.sampled
    }

    #[inline]
    pub fn sampled_mut(&mut self) -> &mut SampledIR {
        &mut self.sampled
    }

    /// Earliest arrival in seconds over both representations.
    pub fn start_time(&self) -> f32 {
        self.start_time
            .min(self.sampled.start_time())
            .min(self.length())
    }

    /// Length in seconds over both representations.
    pub fn length(&self) -> f32 {
        self.path_length.max(self.sampled.length())
    }

    /// Length in samples over both representations.
    pub fn len_samples(&self) -> usize {
        let path_samples = (self.path_length as f64 * self.sampled.sample_rate()).ceil() as usize;
        path_samples.max(self.sampled.len_samples())
    }

    /// Clears the frame's content, keeping sources and allocations.
    pub fn clear(&mut self) {
        self.paths.clear();
        self.sampled.clear();
        self.start_time = f32::MAX;
        self.path_length = 0.0;
    }

    pub fn reset(&mut self) {
        self.paths = Vec::new();
        self.sampled.reset();
        self.clear_sources();
        self.start_time = f32::MAX;
        self.path_length = 0.0;
    }

    /// Trims the sampled IR against a listener threshold expressed in
    /// absolute power; intensities here are fractions of source power.
    /// Returns the post-trim length in seconds.
    pub fn trim(&mut self, threshold_power: &BandResponse) -> f32 {
        let power = self.total_power.max(f32::EPSILON);
        let threshold = *threshold_power * (1.0 / power);
        let sampled_length = self.sampled.trim(&threshold);
        sampled_length.max(self.path_length)
    }

    /// Sum of all band intensities across records and samples.
    pub fn total_intensity(&self) -> BandResponse {
        let mut total = self.sampled.total_intensity();
        for path in &self.paths {
            total += path.intensity;
        }
        total
    }

    /// Sound pressure level per band in dB SPL.
    pub fn pressure_level(&self) -> BandResponse {
        let total = self.total_intensity();
        let mut spl = BandResponse::zero();
        for b in 0..spl.band_count() {
            spl[b] = 10.0 * ((self.total_power * total[b]).max(f32::MIN_POSITIVE) / 1e-12).log10();
        }
        spl
    }
}

// ============ Listener IR ============

/// All source IRs for one listener.
#[derive(Debug, Clone, Default)]
pub struct ListenerIR {
    listener: u64,
    bands: FrequencyBands,
    source_irs: Vec<SourceIR>,
}

impl ListenerIR {
    #[inline]
    pub fn listener(&self) -> u64 {
        self.listener
    }

    pub fn set_listener(&mut self, listener: u64) {
        self.listener = listener;
    }

    #[inline]
    pub fn bands(&self) -> &FrequencyBands {
        &self.bands
    }

    pub fn set_bands(&mut self, bands: FrequencyBands) {
        self.bands = bands;
    }

    #[inline]
    pub fn source_count(&self) -> usize {
        self.source_irs.len()
    }

    #[inline]
    pub fn source_ir(&self, index: usize) -> &SourceIR {
        &self.source_irs[index]
    }

    #[inline]
    pub fn source_ir_mut(&mut self, index: usize) -> &mut SourceIR {
        &mut self.source_irs[index]
    }

    #[inline]
    pub fn source_irs(&self) -> &[SourceIR] {
        &self.source_irs
    }

    pub fn set_source_irs(&mut self, source_irs: Vec<SourceIR>) {
        self.source_irs = source_irs;
    }

    /// Longest source IR in seconds.
    pub fn length(&self) -> f32 {
        self.source_irs.iter().map(SourceIR::length).fold(0.0, f32::max)
    }
}

// ============ Scene IR ============

/// The frame output: one listener IR per enabled listener.
#[derive(Debug, Clone, Default)]
pub struct SceneIR {
    listener_irs: Vec<ListenerIR>,
}

impl SceneIR {
    #[inline]
    pub fn listener_count(&self) -> usize {
        self.listener_irs.len()
    }

    #[inline]
    pub fn listener_ir(&self, index: usize) -> &ListenerIR {
        &self.listener_irs[index]
    }

    #[inline]
    pub fn listener_irs(&self) -> &[ListenerIR] {
        &self.listener_irs
    }

    pub fn set_listener_irs(&mut self, listener_irs: Vec<ListenerIR>) {
        self.listener_irs = listener_irs;
    }

    /// Finds the IR for a listener by identity.
    pub fn for_listener(&self, listener: u64) -> Option<&ListenerIR> {
        self.listener_irs.iter().find(|ir| ir.listener() == listener)
    }

    pub fn clear(&mut self) {
        self.listener_irs.clear();
    }
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathKind;
    use approx::assert_relative_eq;

    fn path(distance: f32, intensity: f32) -> SoundPath {
        SoundPath {
            hash: 1,
            kind: PathKind::DIRECT,
            intensity: BandResponse::splat(intensity),
            direction: Vec3::new(1.0, 0.0, 0.0),
            source_direction: Vec3::new(-1.0, 0.0, 0.0),
            distance,
            relative_speed: 0.0,
            speed: 343.0,
        }
    }

    #[test]
    fn test_length_covers_both_forms() {
        let mut ir = SourceIR::new(1000.0);
        ir.add_path(path(343.0, 0.5));
        assert_relative_eq!(ir.length(), 1.0, epsilon = 1e-5);
        ir.add_impulse(2.0, BandResponse::splat(0.1), Vec3::zeros(), Vec3::zeros());
        assert_relative_eq!(ir.length(), 2.001, epsilon = 1e-3);
        assert_eq!(ir.len_samples(), 2001);
    }

    #[test]
    fn test_start_time() {
        let mut ir = SourceIR::new(1000.0);
        ir.add_path(path(686.0, 0.5));
        ir.add_impulse(0.5, BandResponse::splat(0.1), Vec3::zeros(), Vec3::zeros());
        assert_relative_eq!(ir.start_time(), 0.5, epsilon = 1e-3);
    }

    #[test]
    fn test_trim_scales_threshold_by_power() {
        let mut ir = SourceIR::new(1000.0);
        ir.add_source(1, 4.0);
        ir.add_impulse(0.1, BandResponse::splat(3e-6), Vec3::zeros(), Vec3::zeros());
        ir.add_impulse(0.5, BandResponse::splat(1e-6), Vec3::zeros(), Vec3::zeros());
        // Threshold power 1e-5 over 4 W leaves a 2.5e-6 fractional
        // threshold: the 3e-6 impulse survives, the 1e-6 one is trimmed.
        let length = ir.trim(&BandResponse::splat(1e-5));
        assert_relative_eq!(length, 0.101, epsilon = 1e-4);
    }

    #[test]
    fn test_total_intensity_combines() {
        let mut ir = SourceIR::new(1000.0);
        ir.add_path(path(10.0, 0.25));
        ir.add_impulse(0.1, BandResponse::splat(0.5), Vec3::zeros(), Vec3::zeros());
        assert_relative_eq!(ir.total_intensity()[0], 0.75);
    }

    #[test]
    fn test_scene_ir_lookup() {
        let mut listener_ir = ListenerIR::default();
        listener_ir.set_listener(42);
        let mut scene_ir = SceneIR::default();
        scene_ir.set_listener_irs(vec![listener_ir]);
        assert!(scene_ir.for_listener(42).is_some());
        assert!(scene_ir.for_listener(7).is_none());
    }
}
