//! The frame orchestrator
//!
//! Drives one propagation frame end to end: request sanitation, scene
//! preparation, visibility refresh, specular cache re-validation, probe
//! ray dispatch over scoped worker threads with a bounded-channel
//! diffuse hand-off, cache emission, direct paths, IR trimming and
//! adaptive length control, and stale-state purging.
//!
//! Persistent state (caches, adaptive lengths, per-worker RNG streams)
//! lives in the [`Propagator`], keyed by detector identity; the request
//! and scene stay plain data.

mod context;
mod diffraction;
mod direct;
mod diffuse;
mod scratch;
mod specular;

use std::collections::HashMap;
use std::time::Instant;

use ef_scene::{BandDirectivity, Detector, Scene};
use log::{debug, trace};

use crate::cache::{DiffusePathCache, IrCache, PathCache, VisibilityCache};
use crate::path::{PathKind, PointKind, SoundPath};
use crate::request::{PropagationFlags, PropagationRequest, Statistics};
use crate::source_ir::{ListenerIR, SceneIR, SourceIR};

use context::{MaterialTable, SourceSink, SourceView, TraceContext};
use scratch::{DiffuseContribution, DiffuseSink, SpecularPath, ThreadScratch, random_direction};

/// Frames a detector may stay unseen before its caches are destroyed.
const STALE_FRAME_COUNT: u64 = 100;

/// Residual weight after `max_age` frames of IR-cache blending.
const IR_BLEND_THRESHOLD: f32 = 1e-4;

// ============ Persistent state ============

#[derive(Debug)]
struct SourceState {
    diffuse_cache: DiffusePathCache,
    ir_cache: IrCache,
    visibility: VisibilityCache,
    directivity: BandDirectivity,
    max_ir_length: f32,
    ir_length: f32,
    last_seen: u64,
}

impl SourceState {
    fn new(max_ir_length: f32, timestamp: u64) -> Self {
        Self {
            diffuse_cache: DiffusePathCache::new(),
            ir_cache: IrCache::new(),
            visibility: VisibilityCache::new(),
            directivity: BandDirectivity::default(),
            max_ir_length,
            ir_length: max_ir_length,
            last_seen: timestamp,
        }
    }
}

#[derive(Debug)]
struct ListenerState {
    path_cache: PathCache,
    sources: HashMap<u64, SourceState>,
    max_ir_length: f32,
    ir_length: f32,
    last_seen: u64,
}

impl ListenerState {
    fn new(max_ir_length: f32, timestamp: u64) -> Self {
        Self {
            path_cache: PathCache::new(),
            sources: HashMap::new(),
            max_ir_length,
            ir_length: max_ir_length,
            last_seen: timestamp,
        }
    }
}

// ============ Propagator ============

/// The sound propagation engine. One instance owns all cross-frame
/// state; feed it a scene and a request once per frame.
#[derive(Debug, Default)]
pub struct Propagator {
    workers: Vec<ThreadScratch>,
    listeners: HashMap<u64, ListenerState>,
    materials: MaterialTable,
    statistics: Statistics,
    timestamp: u64,
    time: f64,
}

impl Propagator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics from the most recent frame (filled when the request
    /// sets [`PropagationFlags::STATISTICS`]).
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Runs one propagation frame, producing one listener IR per enabled
    /// listener into `output`.
    pub fn propagate(
        &mut self,
        scene: &mut Scene,
        request: &mut PropagationRequest,
        output: &mut SceneIR,
    ) {
        request.sanitize();
        let frame_timer = Instant::now();
        let collect_stats = request.has(PropagationFlags::STATISTICS);
        self.timestamp += 1;
        self.time += request.effective_dt() as f64;
        let timestamp = self.timestamp;

        scene.rebuild_bvh();
        self.materials.refresh(scene, &request.frequencies);

        let num_threads = request.num_threads as usize;
        for i in self.workers.len()..num_threads {
            self.workers.push(ThreadScratch::new(i));
        }

        let mut stats = Statistics::default();
        if collect_stats {
            let (triangles, vertices, edges, memory) = scene.geometry_totals();
            stats.object_count = scene.object_count();
            stats.triangle_count = triangles;
            stats.vertex_count = vertices;
            stats.edge_count = edges;
            stats.scene_memory = memory;
        }

        // Stable object id → per-frame index, for cached-path resolution.
        let object_index: HashMap<u64, u32> = scene
            .objects()
            .iter()
            .enumerate()
            .filter(|(_, object)| object.is_enabled())
            .map(|(i, object)| (object.id(), i as u32))
            .collect();

        let enabled_listeners: Vec<usize> = (0..scene.listener_count())
            .filter(|&i| scene.listener(i).is_enabled())
            .collect();
        stats.listener_count = enabled_listeners.len();

        let mut listener_irs = Vec::with_capacity(enabled_listeners.len());
        let mut ir_length_sum = 0.0f32;
        let mut ir_source_count = 0usize;
        let mut max_listener_ir = 0.0f32;

        for listener_index in enabled_listeners {
            if request.has(PropagationFlags::SOURCE_CLUSTERING) {
                let clustering_timer = Instant::now();
                let listener = scene.listener(listener_index).clone();
                scene.update_source_clusters(
                    &listener,
                    request.inner_clustering_angle,
                    request.outer_clustering_angle,
                );
                stats.clustering_time += clustering_timer.elapsed();
            }
            let listener = scene.listener(listener_index).clone();
            let listener_id = listener.id();
            let mut state = self
                .listeners
                .remove(&listener_id)
                .unwrap_or_else(|| ListenerState::new(request.max_ir_length, timestamp));
            state.last_seen = timestamp;

            let (mut views, mut sinks) =
                prepare_sources(scene, request, &mut state, timestamp, &mut stats);
            let source_index_of: HashMap<u64, u32> = views
                .iter()
                .enumerate()
                .flat_map(|(i, view)| view.source_ids.iter().map(move |&id| (id, i as u32)))
                .collect();

            if scene.object_count() > 0 && request.has(PropagationFlags::VISIBILITY_CACHE) {
                refresh_visibility(
                    scene,
                    request,
                    timestamp,
                    &mut views,
                    &mut self.workers[..num_threads],
                );
            }

            let ctx = TraceContext {
                scene,
                request,
                materials: &self.materials,
                listener: listener.detector(),
                views: &views,
                object_index: &object_index,
                timestamp,
                max_ir_length: state.max_ir_length,
            };

            if scene.object_count() > 0 {
                if request.has(PropagationFlags::SPECULAR_CACHE) {
                    validate_specular_cache(
                        &ctx,
                        &mut state.path_cache,
                        &source_index_of,
                        &mut self.workers[..num_threads],
                        &mut sinks,
                    );
                } else {
                    state.path_cache.clear();
                }

                let trace_timer = Instant::now();
                let diffuse_rays_cast = trace_listener_rays(
                    &ctx,
                    &state.path_cache,
                    &mut self.workers[..num_threads],
                    &mut sinks,
                );
                stats.ray_tracing_time += trace_timer.elapsed();

                let cache_timer = Instant::now();
                emit_diffuse_output(&ctx, diffuse_rays_cast, &mut sinks);
                for worker in &mut self.workers[..num_threads] {
                    let paths = std::mem::take(&mut worker.specular_paths);
                    update_specular_cache(request, &mut state.path_cache, timestamp, paths, &mut sinks);
                }
                stats.cache_update_time += cache_timer.elapsed();

                if request.has(PropagationFlags::SOURCE_DIFFUSE)
                    && request.has(PropagationFlags::DIFFUSE)
                {
                    trace_source_rays(&ctx, &mut self.workers[..num_threads], &mut sinks);
                }

                if collect_stats {
                    for worker in &self.workers[..num_threads] {
                        stats.specular_ray_count += worker.specular_rays_cast;
                    }
                    if request.has(PropagationFlags::SOURCE_DIFFUSE) {
                        stats.diffuse_ray_count +=
                            sinks.iter().map(|s| s.diffuse_rays_cast).sum::<u64>();
                    } else {
                        for worker in &self.workers[..num_threads] {
                            stats.diffuse_ray_count += worker.diffuse_rays_cast;
                            stats.diffuse_ray_depth += worker.total_ray_depth as f32;
                        }
                    }
                }
            }

            direct::add_direct_paths(&ctx, &mut sinks, &mut self.workers[0]);
            drop(ctx);

            // Trim, adaptive length, and state reassembly.
            let threshold_power = listener.threshold_intensity();
            let mut listener_ir_length = 0.0f32;
            let mut source_irs = Vec::with_capacity(sinks.len());
            for (view, mut sink) in views.drain(..).zip(sinks.drain(..)) {
                let ir_length = if request.has(PropagationFlags::IR_THRESHOLD) {
                    sink.ir.trim(&threshold_power)
                } else {
                    sink.ir.length()
                };
                sink.ir_cache.set_len_samples(sink.ir.len_samples());

                let mut source_state = SourceState {
                    diffuse_cache: sink.diffuse_cache,
                    ir_cache: sink.ir_cache,
                    visibility: view.visibility,
                    directivity: view.directivity.unwrap_or_default(),
                    max_ir_length: view.max_ir_length,
                    ir_length,
                    last_seen: timestamp,
                };
                if request.has(PropagationFlags::IR_THRESHOLD)
                    && request.has(PropagationFlags::ADAPTIVE_IR_LENGTH)
                {
                    source_state.max_ir_length =
                        adapt_ir_length(request, source_state.max_ir_length, ir_length);
                }
                state.sources.insert(view.key, source_state);

                ir_length_sum += ir_length;
                ir_source_count += 1;
                listener_ir_length = listener_ir_length.max(ir_length);
                source_irs.push(sink.ir);
            }
            if request.has(PropagationFlags::IR_THRESHOLD)
                && request.has(PropagationFlags::ADAPTIVE_IR_LENGTH)
            {
                state.max_ir_length =
                    adapt_ir_length(request, state.max_ir_length, listener_ir_length);
            }
            state.ir_length = listener_ir_length;
            max_listener_ir = max_listener_ir.max(listener_ir_length);

            let mut listener_ir = ListenerIR::default();
            listener_ir.set_listener(listener_id);
            listener_ir.set_bands(request.frequencies);
            listener_ir.set_source_irs(source_irs);
            listener_irs.push(listener_ir);

            self.listeners.insert(listener_id, state);
        }

        output.set_listener_irs(listener_irs);
        self.purge_stale();

        if collect_stats {
            if stats.diffuse_ray_count > 0 {
                stats.diffuse_ray_depth /= stats.diffuse_ray_count as f32;
            }
            if ir_source_count > 0 {
                stats.average_ir_length = ir_length_sum / ir_source_count as f32;
            }
            stats.max_ir_length = max_listener_ir;
            stats.propagation_time = frame_timer.elapsed();
            self.statistics = stats;
        }
        debug!(
            "frame {timestamp}: {} listener(s), {:.2} ms",
            output.listener_count(),
            frame_timer.elapsed().as_secs_f64() * 1e3
        );
    }

    /// Destroys cache state for detectors unseen for too long.
    fn purge_stale(&mut self) {
        let timestamp = self.timestamp;
        self.listeners.retain(|id, listener| {
            listener
                .sources
                .retain(|source_id, source| {
                    let keep = timestamp.saturating_sub(source.last_seen) <= STALE_FRAME_COUNT;
                    if !keep {
                        trace!("purging cache state for source {source_id}");
                    }
                    keep
                });
            let keep = timestamp.saturating_sub(listener.last_seen) <= STALE_FRAME_COUNT;
            if !keep {
                trace!("purging cache state for listener {id}");
            }
            keep
        });
    }
}

// ============ Frame preparation ============

/// Builds the frame's source work lists: read-only views for the workers
/// and sinks for the main thread, taking persistent per-source state out
/// of the listener's map for the duration of the frame.
fn prepare_sources(
    scene: &Scene,
    request: &PropagationRequest,
    state: &mut ListenerState,
    timestamp: u64,
    stats: &mut Statistics,
) -> (Vec<SourceView>, Vec<SourceSink>) {
    let mut views = Vec::new();
    let mut sinks = Vec::new();
    let directivity_enabled = request.has(PropagationFlags::SOURCE_DIRECTIVITY);
    let adaptive = request.has(PropagationFlags::IR_THRESHOLD)
        && request.has(PropagationFlags::ADAPTIVE_IR_LENGTH);
    let speed = scene.medium().speed();

    let mut push_entry = |detector: Detector,
                          members: Vec<usize>,
                          views: &mut Vec<SourceView>,
                          sinks: &mut Vec<SourceSink>| {
        let key = scene.source(members[0]).id();
        let mut source_state = state
            .sources
            .remove(&key)
            .unwrap_or_else(|| SourceState::new(request.max_ir_length, timestamp));
        source_state.last_seen = timestamp;

        let mut ir = SourceIR::new(request.sample_rate);
        ir.sampled_mut().set_source_directions_enabled(
            request.has(PropagationFlags::SAMPLED_IR_SOURCE_DIRECTIONS),
        );
        let mut source_ids = Vec::with_capacity(members.len());
        let mut total_power = 0.0;
        for &member in &members {
            let source = scene.source(member);
            ir.add_source(source.id(), source.power());
            source_ids.push(source.id());
            total_power += source.power();
        }

        let directivity = if directivity_enabled {
            // Fit against the first member's directivity; a no-op when
            // the edit stamp is unchanged.
            scene.source(members[0]).directivity().map(|authored| {
                source_state.directivity.fit(authored, &request.frequencies);
                std::mem::take(&mut source_state.directivity)
            })
        } else {
            None
        };

        let max_ir_length = if adaptive {
            source_state.max_ir_length.clamp(request.min_ir_length, request.max_ir_length)
        } else {
            request.max_ir_length
        };

        views.push(SourceView {
            key,
            detector,
            source_ids,
            total_power,
            visibility: std::mem::take(&mut source_state.visibility),
            directivity,
            max_ir_length,
            max_ir_distance: max_ir_length * speed,
        });
        sinks.push(SourceSink {
            diffuse_cache: std::mem::take(&mut source_state.diffuse_cache),
            ir_cache: std::mem::take(&mut source_state.ir_cache),
            ir,
            diffuse_rays_cast: 0,
        });
        // What remains of the state (adaptive lengths) rides along in
        // the view and is reassembled at frame end.
    };

    if request.has(PropagationFlags::SOURCE_CLUSTERING) && !scene.clusters().is_empty() {
        for cluster in scene.clusters() {
            if cluster.merged {
                push_entry(
                    cluster.detector().clone(),
                    cluster.sources.clone(),
                    &mut views,
                    &mut sinks,
                );
            } else {
                for &member in &cluster.sources {
                    push_entry(
                        scene.source(member).detector().clone(),
                        vec![member],
                        &mut views,
                        &mut sinks,
                    );
                }
            }
        }
        stats.cluster_count = views.len();
    } else {
        for (i, source) in scene.sources().iter().enumerate() {
            if !source.is_enabled() {
                continue;
            }
            push_entry(source.detector().clone(), vec![i], &mut views, &mut sinks);
        }
        stats.cluster_count = views.len();
    }
    stats.source_count = scene.sources().iter().filter(|s| s.is_enabled()).count();

    (views, sinks)
}

// ============ Phases ============

/// Refreshes each source's visibility cache with random rays from the
/// source, then evicts entries older than the cache time.
fn refresh_visibility(
    scene: &Scene,
    request: &PropagationRequest,
    timestamp: u64,
    views: &mut [SourceView],
    workers: &mut [ThreadScratch],
) {
    let num_rays = request.num_visibility_rays;
    let max_age = (request.visibility_cache_time / request.effective_dt()).ceil().max(1.0) as u64;

    let chunk = views.len().div_ceil(workers.len()).max(1);
    std::thread::scope(|scope| {
        for (chunk, worker) in views.chunks_mut(chunk).zip(workers.iter_mut()) {
            scope.spawn(move || {
                for view in chunk {
                    let position = view.detector.position();
                    let radius = view.detector.radius();
                    for _ in 0..num_rays {
                        let direction = random_direction(&mut worker.rng);
                        let ray = ef_core::Ray::new(position + direction * radius, direction);
                        if let Some(hit) = scene.intersect_ray(&ray, f32::MAX) {
                            view.visibility.add_triangle(hit.triangle, timestamp);
                        }
                    }
                    view.visibility.check_load_factor();
                    view.visibility.remove_old_triangles(timestamp, max_age);
                }
            });
        }
    });
}

/// Re-validates the listener's cached paths against the current scene,
/// sharded by bucket range, then re-emits the survivors.
fn validate_specular_cache(
    ctx: &TraceContext<'_>,
    path_cache: &mut PathCache,
    source_index_of: &HashMap<u64, u32>,
    workers: &mut [ThreadScratch],
    sinks: &mut [SourceSink],
) {
    path_cache.check_load_factor();
    let buckets = path_cache.buckets_mut();
    let chunk = buckets.len().div_ceil(workers.len()).max(1);
    std::thread::scope(|scope| {
        for (shard, worker) in buckets.chunks_mut(chunk).zip(workers.iter_mut()) {
            scope.spawn(move || {
                specular::validate_cache_shard(ctx, shard, source_index_of, worker);
            });
        }
    });
    // Survivors re-emit without re-insertion.
    for worker in workers {
        for path in std::mem::take(&mut worker.specular_paths) {
            emit_specular_path(ctx.request, &path, &mut sinks[path.source as usize].ir);
        }
    }
}

/// Dispatches the probe rays over the worker pool while the main thread
/// drains diffuse batches. Returns the total diffuse rays cast.
fn trace_listener_rays(
    ctx: &TraceContext<'_>,
    path_cache: &PathCache,
    workers: &mut [ThreadScratch],
    sinks: &mut [SourceSink],
) -> u64 {
    let request = ctx.request;
    let num_threads = workers.len();
    let num_specular = (request.num_specular_rays as f32 * request.quality) as u64;
    let num_diffuse = (request.num_diffuse_rays as f32 * request.quality) as u64;
    let specular_share = num_specular.div_ceil(num_threads as u64);
    let diffuse_share = num_diffuse.div_ceil(num_threads as u64);

    let (tx, rx) = crossbeam_channel::bounded::<Vec<DiffuseContribution>>(num_threads * 2);
    std::thread::scope(|scope| {
        let mut specular_left = num_specular;
        let mut diffuse_left = num_diffuse;
        for worker in workers.iter_mut() {
            let specular_n = specular_left.min(specular_share);
            let diffuse_n = diffuse_left.min(diffuse_share);
            specular_left -= specular_n;
            diffuse_left -= diffuse_n;
            let tx = tx.clone();
            scope.spawn(move || {
                let mut sink = DiffuseSink::new(&tx);
                specular::propagate_listener_rays(
                    ctx,
                    path_cache,
                    specular_n,
                    diffuse_n,
                    worker,
                    &mut sink,
                );
            });
        }
        drop(tx);
        for batch in rx.iter() {
            apply_diffuse_batch(ctx, &batch, sinks);
        }
    });
    workers.iter().map(|w| w.diffuse_rays_cast).sum()
}

/// Routes one batch of diffuse contributions into the configured
/// destination: the IR cache's fresh IR, the diffuse path cache, or the
/// output directly.
fn apply_diffuse_batch(
    ctx: &TraceContext<'_>,
    batch: &[DiffuseContribution],
    sinks: &mut [SourceSink],
) {
    let request = ctx.request;
    let medium = ctx.scene.medium();
    let speed = medium.speed();
    let air = request.has(PropagationFlags::AIR_ABSORPTION);
    let ir_cache_mode =
        request.has(PropagationFlags::IR_CACHE) && request.has(PropagationFlags::SAMPLED_IR);
    let diffuse_cache_mode = request.has(PropagationFlags::DIFFUSE_CACHE);
    let sampled = request.has(PropagationFlags::SAMPLED_IR);

    for contribution in batch {
        let sink = &mut sinks[contribution.source as usize];
        if ir_cache_mode {
            let energy = if air {
                medium.attenuation(contribution.distance) * contribution.energy
            } else {
                contribution.energy
            };
            sink.ir.add_impulse(
                contribution.distance / speed,
                energy,
                contribution.direction,
                contribution.source_direction,
            );
        } else if diffuse_cache_mode {
            sink.diffuse_cache.add_contribution(
                contribution.hash,
                contribution.energy,
                contribution.direction,
                contribution.source_direction,
                contribution.distance,
                contribution.relative_speed,
                ctx.timestamp,
            );
        } else {
            let energy = if air {
                medium.attenuation(contribution.distance) * contribution.energy
            } else {
                contribution.energy
            };
            if sampled {
                sink.ir.add_impulse(
                    contribution.distance / speed,
                    energy,
                    contribution.direction,
                    contribution.source_direction,
                );
            } else {
                sink.ir.add_path(SoundPath {
                    hash: contribution.hash,
                    kind: PathKind::DIFFUSE,
                    intensity: energy,
                    direction: contribution.direction,
                    source_direction: contribution.source_direction,
                    distance: contribution.distance,
                    relative_speed: contribution.relative_speed,
                    speed,
                });
            }
        }
    }
}

/// Post-trace diffuse finalisation: cache emission with per-path
/// normalisation, or plain 1/N normalisation of the direct output.
fn emit_diffuse_output(ctx: &TraceContext<'_>, diffuse_rays_cast: u64, sinks: &mut [SourceSink]) {
    let request = ctx.request;
    if !request.has(PropagationFlags::DIFFUSE)
        || request.has(PropagationFlags::SOURCE_DIFFUSE)
        || diffuse_rays_cast == 0
    {
        return;
    }
    let ir_cache_mode =
        request.has(PropagationFlags::IR_CACHE) && request.has(PropagationFlags::SAMPLED_IR);
    let diffuse_cache_mode = request.has(PropagationFlags::DIFFUSE_CACHE);

    if ir_cache_mode {
        let (beta, _) = ir_blend_factor(request);
        let gain = 1.0 / diffuse_rays_cast as f32;
        for sink in sinks.iter_mut() {
            sink.ir_cache.update(beta, gain, &mut sink.ir);
        }
    } else if diffuse_cache_mode {
        for sink in sinks.iter_mut() {
            output_diffuse_cache(ctx, diffuse_rays_cast, sink);
        }
    } else {
        let normalize = 1.0 / diffuse_rays_cast as f32;
        for sink in sinks.iter_mut() {
            if request.has(PropagationFlags::SAMPLED_IR) {
                sink.ir.sampled_mut().scale_intensity(normalize);
            } else {
                for path in sink.ir.paths_mut() {
                    if path.kind.contains(PathKind::DIFFUSE) {
                        path.intensity *= normalize;
                    }
                }
            }
        }
    }
}

/// Emits one source's diffuse cache into its IR with eviction of stale
/// records and the total-ray normalisation floor.
fn output_diffuse_cache(ctx: &TraceContext<'_>, diffuse_rays_cast: u64, sink: &mut SourceSink) {
    let request = ctx.request;
    let medium = ctx.scene.medium();
    let speed = medium.speed();
    let sampled = request.has(PropagationFlags::SAMPLED_IR);
    let doppler = request.has(PropagationFlags::DOPPLER_SORTING);
    let max_age = (request.response_time / request.effective_dt()).ceil().max(1.0) as u64;
    let min_path_rays = max_age * diffuse_rays_cast;
    let timestamp = ctx.timestamp;

    sink.diffuse_cache.check_load_factor();
    for bucket in sink.diffuse_cache.buckets_mut() {
        let mut i = 0;
        while i < bucket.len() {
            let record = &mut bucket[i];
            record.total_rays += diffuse_rays_cast;
            if timestamp.saturating_sub(record.timestamp) > max_age {
                bucket.swap_remove(i);
                continue;
            }
            let total_rays = record.total_rays.max(min_path_rays);
            let inverse_rays = 1.0 / record.rays as f32;
            let distance = record.distance * inverse_rays;
            let energy = medium.attenuation(distance)
                * record.energy
                * (1.0 / (4.0 * std::f32::consts::PI * total_rays as f32));
            let direction = normalized_or_zero(record.direction);
            let source_direction = normalized_or_zero(record.source_direction);
            let relative_speed = record.relative_speed * inverse_rays;

            if sampled {
                let record_form = doppler && {
                    let shift = 1.0 + relative_speed / speed;
                    (1200.0 * shift.log2()).abs() >= request.doppler_threshold
                };
                if record_form {
                    sink.ir.add_path(SoundPath {
                        hash: record.hash,
                        kind: PathKind::DIFFUSE,
                        intensity: energy,
                        direction,
                        source_direction,
                        distance,
                        relative_speed,
                        speed,
                    });
                } else {
                    sink.ir
                        .add_impulse(distance / speed, energy, direction, source_direction);
                }
            } else {
                sink.ir.add_path(SoundPath {
                    hash: record.hash,
                    kind: PathKind::DIFFUSE,
                    intensity: energy,
                    direction,
                    source_direction,
                    distance,
                    relative_speed,
                    speed,
                });
            }
            i += 1;
        }
    }
}

/// Source-origin diffuse propagation: rays leave each source and are
/// detected at the listener, blended through the per-source IR cache.
fn trace_source_rays(ctx: &TraceContext<'_>, workers: &mut [ThreadScratch], sinks: &mut [SourceSink]) {
    let request = ctx.request;
    let num_diffuse = (request.num_diffuse_rays as f32 * request.quality) as u64;
    let num_threads = workers.len();
    let share = num_diffuse.div_ceil(num_threads as u64);
    let medium = ctx.scene.medium();
    let speed = medium.speed();
    let air = request.has(PropagationFlags::AIR_ABSORPTION);

    for source_index in 0..ctx.views.len() {
        let (tx, rx) = crossbeam_channel::bounded::<Vec<DiffuseContribution>>(num_threads * 2);
        std::thread::scope(|scope| {
            let mut left = num_diffuse;
            for worker in workers.iter_mut() {
                let n = left.min(share);
                left -= n;
                let tx = tx.clone();
                scope.spawn(move || {
                    let mut sink = DiffuseSink::new(&tx);
                    diffuse::propagate_source_rays(ctx, source_index as u32, n, worker, &mut sink);
                });
            }
            drop(tx);
            let sink = &mut sinks[source_index];
            for batch in rx.iter() {
                for contribution in &batch {
                    let energy = if air {
                        medium.attenuation(contribution.distance) * contribution.energy
                    } else {
                        contribution.energy
                    };
                    sink.ir.add_impulse(
                        contribution.distance / speed,
                        energy,
                        contribution.direction,
                        contribution.source_direction,
                    );
                }
            }
        });
        sinks[source_index].diffuse_rays_cast =
            workers.iter().map(|w| w.diffuse_rays_cast).sum();
    }

    let (beta, _) = ir_blend_factor(request);
    for sink in sinks.iter_mut() {
        if sink.diffuse_rays_cast > 0 {
            let gain = 1.0 / sink.diffuse_rays_cast as f32;
            sink.ir_cache.update(beta, gain, &mut sink.ir);
        }
    }
}

// ============ Output helpers ============

/// Emits a validated specular/diffraction path per the output flags.
fn emit_specular_path(request: &PropagationRequest, path: &SpecularPath, ir: &mut SourceIR) {
    let record = SoundPath {
        hash: path.hash,
        kind: path.kind,
        intensity: path.energy,
        direction: path.direction,
        source_direction: path.source_direction,
        distance: path.distance,
        relative_speed: path.relative_speed,
        speed: path.speed,
    };
    if request.has(PropagationFlags::SAMPLED_IR) {
        if request.has(PropagationFlags::DOPPLER_SORTING) {
            // Specular and diffraction paths stay in record form so the
            // renderer can track their movement.
            if record.doppler_shift_cents() >= request.doppler_threshold
                || path.kind.intersects(PathKind::SPECULAR | PathKind::DIFFRACTION)
            {
                ir.add_path(record);
            } else {
                ir.add_impulse(record.delay(), record.intensity, record.direction, record.source_direction);
            }
        } else {
            ir.add_impulse(record.delay(), record.intensity, record.direction, record.source_direction);
        }
    } else {
        ir.add_path(record);
    }
}

/// Inserts newly discovered paths into the cache (first-order
/// diffraction entries are keyed by their first edge point alone) and
/// emits the ones not already present.
fn update_specular_cache(
    request: &PropagationRequest,
    path_cache: &mut PathCache,
    timestamp: u64,
    paths: Vec<SpecularPath>,
    sinks: &mut [SourceSink],
) {
    for path in paths {
        if !path.insert {
            emit_specular_path(request, &path, &mut sinks[path.source as usize].ir);
            continue;
        }
        let inserted = if path.id.point_count() > 0
            && path.id.point(0).kind == PointKind::EdgeDiffraction
        {
            path_cache.add_path(&path.id.truncated(1), timestamp)
        } else {
            path_cache.add_path(&path.id, timestamp)
        };
        if inserted {
            emit_specular_path(request, &path, &mut sinks[path.source as usize].ir);
        }
    }
}

// ============ Small helpers ============

/// The IR-cache blend factor: `β = 1 − threshold^(1/maxAge)` with
/// `maxAge = max(10, responseTime / dt)` frames.
fn ir_blend_factor(request: &PropagationRequest) -> (f32, f32) {
    let max_age = (request.response_time / request.effective_dt()).max(10.0);
    (1.0 - IR_BLEND_THRESHOLD.powf(1.0 / max_age), max_age)
}

/// Moves an IR length bound by at most `irGrowthRate · dt` toward the
/// observed length, clamped to the request bounds.
fn adapt_ir_length(request: &PropagationRequest, previous: f32, observed: f32) -> f32 {
    let base_growth = request.ir_growth_rate * request.effective_dt();
    let growth = if observed + base_growth < previous {
        -base_growth.min(previous - observed)
    } else {
        base_growth.max(observed - previous)
    };
    (previous + growth).clamp(request.min_ir_length, request.max_ir_length)
}

fn normalized_or_zero(v: ef_core::Vec3) -> ef_core::Vec3 {
    let norm = v.norm();
    if norm > f32::EPSILON { v / norm } else { v }
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ir_blend_factor_matches_law() {
        let mut request = PropagationRequest::default();
        request.response_time = 1.0;
        request.dt = 0.1;
        let (beta, max_age) = ir_blend_factor(&request);
        assert_eq!(max_age, 10.0);
        // β = 1 − 10^(−4/10)
        assert!((beta - (1.0 - 10f32.powf(-0.4))).abs() < 1e-6);
    }

    #[test]
    fn test_blend_factor_age_floor() {
        let mut request = PropagationRequest::default();
        request.response_time = 0.0;
        request.dt = 0.1;
        let (_, max_age) = ir_blend_factor(&request);
        assert_eq!(max_age, 10.0);
    }

    #[test]
    fn test_adaptive_length_moves_toward_observed() {
        let mut request = PropagationRequest::default();
        request.dt = 0.1;
        request.ir_growth_rate = 1.0;
        request.min_ir_length = 0.5;
        request.max_ir_length = 4.0;

        // Observed shorter: shrink by at most growth·dt.
        let shrunk = adapt_ir_length(&request, 2.0, 1.0);
        assert!((shrunk - 1.9).abs() < 1e-5);
        // Observed longer: jump at least to the observed length.
        let grown = adapt_ir_length(&request, 1.0, 1.5);
        assert!((grown - 1.5).abs() < 1e-5);
        // Clamped to the bounds.
        assert!(adapt_ir_length(&request, 4.0, 10.0) <= 4.0);
        assert!(adapt_ir_length(&request, 0.5, 0.0) >= 0.5);
    }
}
