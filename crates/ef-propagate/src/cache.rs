//! Persistent propagation caches
//!
//! Four caches survive across frames per (listener, source) pair and
//! smooth the stochastic path search: the validated-specular path cache,
//! the diffuse path cache, the triangle visibility cache, and the
//! exponentially averaged IR cache. The hash tables share one bucket
//! discipline: open chaining, load factor 1.0, growth to the next
//! power-of-two prime, and timestamp-based eviction.

use ef_core::{BandResponse, Vec3};
use ef_scene::ObjectTriangle;

use crate::ir::SampledIR;
use crate::path::{PathHash, PathId};
use crate::source_ir::SourceIR;

/// Initial bucket count for all caches.
const INITIAL_BUCKETS: usize = 193;
/// Entries-per-bucket ratio that triggers a rehash.
const LOAD_FACTOR: f32 = 1.0;

/// Hash-table sizes grow along primes that roughly double, staying near
/// powers of two.
const POW2_PRIMES: &[usize] = &[
    53, 97, 193, 389, 769, 1543, 3079, 6151, 12289, 24593, 49157, 98317, 196613, 393241, 786433,
    1572869, 3145739, 6291469, 12582917, 25165843, 50331653, 100663319, 201326611, 402653189,
    805306457, 1610612741,
];

/// Smallest table prime that holds at least `n` entries.
pub fn next_pow2_prime(n: usize) -> usize {
    for &prime in POW2_PRIMES {
        if prime >= n {
            return prime;
        }
    }
    n | 1
}

// ============ Shared bucket table ============

/// Open-chaining bucket table shared by the path, diffuse and visibility
/// caches. Entries know their own hash through `hash_of`.
#[derive(Debug, Clone)]
struct BucketTable<T> {
    buckets: Vec<Vec<T>>,
}

impl<T> BucketTable<T> {
    fn new() -> Self {
        let mut buckets = Vec::new();
        buckets.resize_with(INITIAL_BUCKETS, Vec::new);
        Self { buckets }
    }

    #[inline]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn bucket(&self, hash: u64) -> &Vec<T> {
        &self.buckets[(hash % self.buckets.len() as u64) as usize]
    }

    #[inline]
    fn bucket_mut(&mut self, hash: u64) -> &mut Vec<T> {
        let index = (hash % self.buckets.len() as u64) as usize;
        &mut self.buckets[index]
    }

    fn entry_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }

    /// Rehashes to the next table size once the load factor is exceeded.
    /// If the new table cannot be allocated the old one is kept and the
    /// frame continues with degraded lookup speed.
    fn check_load_factor(&mut self, hash_of: impl Fn(&T) -> u64) {
        let entries = self.entry_count();
        if entries as f32 <= self.bucket_count() as f32 * LOAD_FACTOR {
            return;
        }
        let new_count = next_pow2_prime((entries as f32 / LOAD_FACTOR) as usize);
        let mut new_buckets: Vec<Vec<T>> = Vec::new();
        if new_buckets.try_reserve_exact(new_count).is_err() {
            log::warn!("cache rehash to {new_count} buckets failed; keeping {}", self.bucket_count());
            return;
        }
        new_buckets.resize_with(new_count, Vec::new);
        for bucket in self.buckets.drain(..) {
            for entry in bucket {
                let index = (hash_of(&entry) % new_count as u64) as usize;
                new_buckets[index].push(entry);
            }
        }
        self.buckets = new_buckets;
    }
}

// ============ Sound-path cache ============

/// A cached validated path and when it was last seen valid.
#[derive(Debug, Clone)]
pub struct PathCacheEntry {
    pub path: PathId,
    pub timestamp: u64,
}

/// The validated specular/diffraction path cache for one listener.
#[derive(Debug, Clone)]
pub struct PathCache {
    table: BucketTable<PathCacheEntry>,
}

impl Default for PathCache {
    fn default() -> Self {
        Self {
            table: BucketTable::new(),
        }
    }
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a path, or refreshes its timestamp if already present.
    /// Returns true only for a new insertion.
    pub fn add_path(&mut self, path: &PathId, timestamp: u64) -> bool {
        let bucket = self.table.bucket_mut(path.hash());
        for entry in bucket.iter_mut() {
            if entry.path == *path {
                entry.timestamp = timestamp;
                return false;
            }
        }
        bucket.push(PathCacheEntry {
            path: path.clone(),
            timestamp,
        });
        true
    }

    pub fn contains_path(&self, path: &PathId) -> bool {
        self.table.bucket(path.hash()).iter().any(|e| e.path == *path)
    }

    #[inline]
    pub fn path_count(&self) -> usize {
        self.table.entry_count()
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.table.bucket_count()
    }

    /// The buckets, for sharded re-validation: workers walk disjoint
    /// bucket ranges, so entry membership (hash → bucket) must not
    /// change while shards are out.
    pub fn buckets_mut(&mut self) -> &mut [Vec<PathCacheEntry>] {
        &mut self.table.buckets
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }

    pub fn check_load_factor(&mut self) {
        self.table.check_load_factor(|entry| entry.path.hash());
    }
}

// ============ Diffuse path cache ============

/// Accumulated Monte-Carlo statistics for one diffuse path hash.
#[derive(Debug, Clone, Copy)]
pub struct DiffuseRecord {
    pub hash: PathHash,
    /// Rays that contributed in the current window.
    pub rays: u64,
    /// Rays traced since insertion, contributing or not.
    pub total_rays: u64,
    pub energy: BandResponse,
    pub direction: Vec3,
    pub source_direction: Vec3,
    pub distance: f32,
    pub relative_speed: f32,
    pub timestamp: u64,
}

/// Per-source cache that averages diffuse contributions over recent
/// frames.
#[derive(Debug, Clone)]
pub struct DiffusePathCache {
    table: BucketTable<DiffuseRecord>,
}

impl Default for DiffusePathCache {
    fn default() -> Self {
        Self {
            table: BucketTable::new(),
        }
    }
}

impl DiffusePathCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find-or-insert a record and accumulate the contribution sums.
    #[allow(clippy::too_many_arguments)]
    pub fn add_contribution(
        &mut self,
        hash: PathHash,
        energy: BandResponse,
        direction: Vec3,
        source_direction: Vec3,
        distance: f32,
        relative_speed: f32,
        timestamp: u64,
    ) {
        let bucket = self.table.bucket_mut(hash);
        for record in bucket.iter_mut() {
            if record.hash == hash {
                record.rays += 1;
                record.energy += energy;
                record.direction += direction;
                record.source_direction += source_direction;
                record.distance += distance;
                record.relative_speed += relative_speed;
                record.timestamp = timestamp;
                return;
            }
        }
        bucket.push(DiffuseRecord {
            hash,
            rays: 1,
            total_rays: 0,
            energy,
            direction,
            source_direction,
            distance,
            relative_speed,
            timestamp,
        });
    }

    /// Record-wise sum of another cache into this one; absent hashes are
    /// inserted. Commutative and associative over record sums.
    pub fn merge(&mut self, other: &DiffusePathCache) {
        for bucket in &other.table.buckets {
            for record in bucket {
                let own = self.table.bucket_mut(record.hash);
                if let Some(existing) = own.iter_mut().find(|r| r.hash == record.hash) {
                    existing.rays += record.rays;
                    existing.total_rays += record.total_rays;
                    existing.energy += record.energy;
                    existing.direction += record.direction;
                    existing.source_direction += record.source_direction;
                    existing.distance += record.distance;
                    existing.relative_speed += record.relative_speed;
                    existing.timestamp = existing.timestamp.max(record.timestamp);
                } else {
                    own.push(*record);
                }
            }
        }
    }

    pub fn record(&self, hash: PathHash) -> Option<&DiffuseRecord> {
        self.table.bucket(hash).iter().find(|r| r.hash == hash)
    }

    #[inline]
    pub fn record_count(&self) -> usize {
        self.table.entry_count()
    }

    pub fn buckets_mut(&mut self) -> &mut [Vec<DiffuseRecord>] {
        &mut self.table.buckets
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }

    pub fn check_load_factor(&mut self) {
        self.table.check_load_factor(|record| record.hash);
    }
}

// ============ Visibility cache ============

#[derive(Debug, Clone, Copy)]
struct VisibilityEntry {
    triangle: ObjectTriangle,
    timestamp: u64,
}

fn triangle_hash(triangle: &ObjectTriangle) -> u64 {
    let mut x = triangle.object_id ^ (triangle.triangle as u64).rotate_left(32);
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x ^ (x >> 27)
}

/// Per-source set of recently seen triangles, used to prune reflection
/// candidates that cannot see the source.
#[derive(Debug, Clone)]
pub struct VisibilityCache {
    table: BucketTable<VisibilityEntry>,
}

impl Default for VisibilityCache {
    fn default() -> Self {
        Self {
            table: BucketTable::new(),
        }
    }
}

impl VisibilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes a triangle sighting. Membership compares the
    /// stable (object id, triangle) pair, not the per-frame index.
    pub fn add_triangle(&mut self, triangle: ObjectTriangle, timestamp: u64) {
        let bucket = self.table.bucket_mut(triangle_hash(&triangle));
        for entry in bucket.iter_mut() {
            if entry.triangle.object_id == triangle.object_id
                && entry.triangle.triangle == triangle.triangle
            {
                entry.timestamp = timestamp;
                return;
            }
        }
        bucket.push(VisibilityEntry { triangle, timestamp });
    }

    pub fn contains_triangle(&self, triangle: &ObjectTriangle) -> bool {
        self.table
            .bucket(triangle_hash(triangle))
            .iter()
            .any(|e| {
                e.triangle.object_id == triangle.object_id
                    && e.triangle.triangle == triangle.triangle
            })
    }

    /// Evicts triangles last seen more than `max_age` frames ago.
    pub fn remove_old_triangles(&mut self, now: u64, max_age: u64) {
        for bucket in &mut self.table.buckets {
            bucket.retain(|entry| now.saturating_sub(entry.timestamp) <= max_age);
        }
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.table.entry_count()
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }

    pub fn check_load_factor(&mut self) {
        self.table.check_load_factor(|entry| triangle_hash(&entry.triangle));
    }
}

// ============ IR cache ============

/// Exponentially averaged sampled IR for one source, smoothing the
/// frame-to-frame Monte-Carlo variance of the sampled-IR output.
#[derive(Debug, Clone, Default)]
pub struct IrCache {
    ir: SampledIR,
}

impl IrCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blends the frame's fresh sampled IR into the cache as
    /// `cache = (1-β)·cache + β·gain·fresh` and writes the blended
    /// estimate back as the frame's output.
    pub fn update(&mut self, beta: f32, gain: f32, output: &mut SourceIR) {
        let fresh = output.sampled();
        if self.ir.sample_rate() != fresh.sample_rate() {
            self.ir.reset();
            // Infallible on an empty IR.
            let _ = self.ir.set_sample_rate(fresh.sample_rate());
        }
        if self.ir.source_directions_enabled() != fresh.source_directions_enabled() {
            self.ir.set_source_directions_enabled(fresh.source_directions_enabled());
        }
        self.ir.blend_from(fresh, beta, gain);
        *output.sampled_mut() = self.ir.clone();
    }

    /// Follows the post-trim output length so the cache does not hold a
    /// stale tail alive.
    pub fn set_len_samples(&mut self, len: usize) {
        if len < self.ir.len_samples() {
            self.ir.set_len_samples(len);
        }
    }

    #[inline]
    pub fn ir(&self) -> &SampledIR {
        &self.ir
    }
}

// ============ Tests ============
