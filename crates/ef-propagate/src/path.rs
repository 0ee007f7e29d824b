//! Sound paths and path identity
//!
//! A `SoundPath` is one finished propagation path as handed to the
//! renderer. A `PathId` is the canonical identity of a path while it is
//! being searched and cached: the (listener, source) endpoints plus the
//! ordered sequence of surface interactions, with an order-sensitive
//! rolling hash so push/pop during recursive searches is cheap.

use bitflags::bitflags;
use ef_core::{BandResponse, Vec3};
use ef_scene::ObjectTriangle;

/// 64-bit hash identifying a propagation path across frames.
pub type PathHash = u64;

bitflags! {
    /// The interaction kinds a path contains.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PathKind: u32 {
        const DIRECT = 1 << 0;
        const TRANSMISSION = 1 << 1;
        const SPECULAR = 1 << 2;
        const DIFFUSE = 1 << 3;
        const DIFFRACTION = 1 << 4;
    }
}

// ============ Path Points ============

/// The interaction type of one path point. The discriminants double as
/// hash salts so different interaction kinds at the same triangle hash
/// apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PointKind {
    SpecularReflection = 0x8DA6_B343,
    DiffuseReflection = 0xD816_3841,
    EdgeDiffraction = 0xCB1A_B31F,
    Transmission = 0x724F_AFCF,
}

/// One interaction along a path: a triangle, the interaction kind, and a
/// kind-specific 32-bit id (edge index for diffraction, barycentric
/// patch id for diffuse reflection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathPoint {
    pub kind: PointKind,
    pub triangle: ObjectTriangle,
    pub id: u32,
}

impl PathPoint {
    pub fn new(kind: PointKind, triangle: ObjectTriangle, id: u32) -> Self {
        Self { kind, triangle, id }
    }

    /// Hash of this point alone; combined order-sensitively by
    /// [`PathId`].
    pub fn hash(&self) -> PathHash {
        let triangle_hash = mix(self.triangle.object_id ^ (self.triangle.triangle as u64).rotate_left(32));
        (self.kind as u32 as u64) ^ triangle_hash.wrapping_add(self.id as u64)
    }
}

/// 64-bit finalizer (splitmix-style) so sequential ids spread over the
/// hash space.
#[inline]
fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

// ============ Path Identity ============

/// Canonical identity of a path under construction: endpoints plus the
/// ordered interaction sequence.
///
/// The rolling hash accumulates `pointHash · (index + 1)` per point so
/// appending and removing the last point are O(1); recursive searches
/// push and pop constantly.
#[derive(Debug, Clone, Default)]
pub struct PathId {
    source: u64,
    listener: u64,
    points: Vec<PathPoint>,
    rolling: PathHash,
}

impl PathId {
    pub fn new() -> Self {
        Self {
            source: 0,
            listener: 0,
            points: Vec::with_capacity(4),
            rolling: 1,
        }
    }

    #[inline]
    pub fn source(&self) -> u64 {
        self.source
    }

    #[inline]
    pub fn set_source(&mut self, source: u64) {
        self.source = source;
    }

    #[inline]
    pub fn listener(&self) -> u64 {
        self.listener
    }

    #[inline]
    pub fn set_listener(&mut self, listener: u64) {
        self.listener = listener;
    }

    #[inline]
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn point(&self, index: usize) -> &PathPoint {
        &self.points[index]
    }

    #[inline]
    pub fn points(&self) -> &[PathPoint] {
        &self.points
    }

    #[inline]
    pub fn push_point(&mut self, point: PathPoint) {
        self.points.push(point);
        self.rolling = self
            .rolling
            .wrapping_add(point.hash().wrapping_mul(self.points.len() as u64));
    }

    #[inline]
    pub fn pop_point(&mut self) {
        if let Some(last) = self.points.pop() {
            self.rolling = self
                .rolling
                .wrapping_sub(last.hash().wrapping_mul(self.points.len() as u64 + 1));
        }
    }

    pub fn clear_points(&mut self) {
        self.points.clear();
        self.rolling = 1;
    }

    /// The full path hash: endpoints mixed with the rolling point hash.
    pub fn hash(&self) -> PathHash {
        mix(self.source).wrapping_mul(0xD816_3841) ^ mix(self.listener).rotate_left(17) ^ self.rolling
    }

    /// A standalone copy truncated to the first `n` points.
    pub fn truncated(&self, n: usize) -> PathId {
        let mut id = PathId::new();
        id.set_source(self.source);
        id.set_listener(self.listener);
        for point in &self.points[..n.min(self.points.len())] {
            id.push_point(*point);
        }
        id
    }
}

impl PartialEq for PathId {
    fn eq(&self, other: &Self) -> bool {
        self.rolling == other.rolling
            && self.source == other.source
            && self.listener == other.listener
            && self.points == other.points
    }
}

impl Eq for PathId {}

// ============ Sound Path ============

/// One finished propagation path: the record form of an IR entry.
///
/// The hash is stable across frames, so a renderer can correlate paths
/// from one frame to the next and interpolate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoundPath {
    pub hash: PathHash,
    pub kind: PathKind,
    /// Per-band intensity as a fraction of source power.
    pub intensity: BandResponse,
    /// Unit direction from the listener toward the first path point.
    pub direction: Vec3,
    /// Unit direction from the source toward the last path point.
    pub source_direction: Vec3,
    /// Total path length in meters.
    pub distance: f32,
    /// Relative speed along the path; positive when closing.
    pub relative_speed: f32,
    /// Speed of sound the path was traced with.
    pub speed: f32,
}

impl SoundPath {
    /// Propagation delay in seconds.
    #[inline]
    pub fn delay(&self) -> f32 {
        self.distance / self.speed
    }

    /// Doppler pitch shift in cents implied by the closing speed.
    pub fn doppler_shift_cents(&self) -> f32 {
        let shift = 1.0 + self.relative_speed / self.speed;
        (1200.0 * shift.log2()).abs()
    }
}

// ============ Tests ============
