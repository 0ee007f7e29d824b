//! Direct and transmission paths
//!
//! Per (listener, source) pair the direct path is estimated by cone
//! sampling toward the source sphere; the averaged unoccluded direction
//! and visible fraction set the path direction and energy. When the
//! direct segment is fully blocked and transmission is enabled, the
//! segment is marched through the occluding surfaces instead,
//! accumulating each material's transmission bands.

use ef_core::{BandResponse, Ray};

use crate::path::{PathKind, PathPoint, PointKind, SoundPath};
use crate::request::PropagationFlags;

use super::context::{SourceSink, TraceContext};
use super::scratch::{ThreadScratch, direct_visibility};

/// Most surfaces a transmission path may pass through.
const MAX_TRANSMISSION_SURFACES: usize = 8;
/// Transmission contributions below this total gain are dropped.
const MIN_TRANSMISSION_GAIN: f32 = 1e-6;

/// Evaluates direct (and, when occluded, transmission) paths for every
/// source of the current listener.
pub(crate) fn add_direct_paths(
    ctx: &TraceContext<'_>,
    sinks: &mut [SourceSink],
    scratch: &mut ThreadScratch,
) {
    let request = ctx.request;
    let direct_enabled = request.has(PropagationFlags::DIRECT);
    let transmission_enabled = request.has(PropagationFlags::TRANSMISSION);
    if !direct_enabled && !transmission_enabled {
        return;
    }
    let listener_position = ctx.listener.position();
    let speed = ctx.scene.medium().speed();

    for (source_index, view) in ctx.views.iter().enumerate() {
        scratch.path_id.clear_points();
        scratch.path_id.set_listener(ctx.listener.id());
        scratch.path_id.set_source(view.key);

        let offset = view.detector.position() - listener_position;
        let source_distance = offset.norm();
        if source_distance < f32::EPSILON {
            continue;
        }
        let source_direction = offset / source_distance;

        let mut visibility = 0.0;
        let mut average_direction = source_direction;
        if direct_enabled {
            if request.num_direct_rays > 1 {
                // Concentrate rays for large subtended angles; grazing
                // spheres need fewer.
                let side_squared =
                    source_distance * source_distance - view.detector.radius().powi(2);
                let half_angle =
                    ((side_squared.max(0.0).sqrt()) / source_distance).clamp(0.0, 1.0).acos();
                let num_rays =
                    ((request.num_direct_rays as f32 * half_angle.sin().sqrt()).max(1.0)) as u32;
                let (vis, direction) = direct_visibility(
                    ctx.scene,
                    view.detector.position(),
                    view.detector.radius(),
                    listener_position,
                    ctx.listener.radius(),
                    num_rays,
                    &mut scratch.rng,
                );
                visibility = vis;
                average_direction = direction;
            } else {
                let clear_distance = (source_distance - view.detector.radius()).max(0.0);
                if !ctx
                    .scene
                    .intersect_ray_any(&Ray::new(listener_position, source_direction), clear_distance)
                {
                    visibility = 1.0;
                }
            }
        }

        if visibility > 0.0 {
            let relative_speed = ctx.relative_speed(
                ctx.listener,
                source_direction,
                &view.detector,
                source_direction,
            );
            let mut energy = ctx.distance_attenuation(source_distance) * visibility;
            if view.directivity.is_some() {
                energy *= view.directivity_gain(-source_direction);
            }
            let path = SoundPath {
                hash: scratch.path_id.hash(),
                kind: PathKind::DIRECT,
                intensity: energy,
                direction: average_direction,
                source_direction: -average_direction,
                distance: source_distance,
                relative_speed,
                speed,
            };
            let ir = &mut sinks[source_index].ir;
            if request.has(PropagationFlags::SAMPLED_IR)
                && !request.has(PropagationFlags::DOPPLER_SORTING)
            {
                ir.add_impulse(path.delay(), path.intensity, path.direction, path.source_direction);
            } else {
                ir.add_path(path);
            }
        } else if transmission_enabled {
            add_transmission_path(ctx, source_index, source_distance, source_direction, sinks, scratch);
        }
    }
    scratch.path_id.clear_points();
}

/// Marches the blocked direct segment through transmissive surfaces.
fn add_transmission_path(
    ctx: &TraceContext<'_>,
    source_index: usize,
    source_distance: f32,
    source_direction: ef_core::Vec3,
    sinks: &mut [SourceSink],
    scratch: &mut ThreadScratch,
) {
    let request = ctx.request;
    let view = &ctx.views[source_index];
    let ray_offset = request.ray_offset.max(1e-4);

    let mut attenuation = BandResponse::default();
    let mut ray = Ray::new(ctx.listener.position(), source_direction);
    let mut travelled = 0.0f32;
    let target = (source_distance - view.detector.radius()).max(0.0);

    for _ in 0..MAX_TRANSMISSION_SURFACES {
        let remaining = target - travelled;
        if remaining <= 0.0 {
            break;
        }
        let Some(hit) = ctx.scene.intersect_ray(&ray, remaining) else {
            // Nothing left in the way: the path reaches the source. A
            // walk that crossed no surface is a plain direct path and is
            // governed by the direct flag instead.
            if scratch.path_id.point_count() == 0 {
                return;
            }
            let relative_speed = ctx.relative_speed(
                ctx.listener,
                source_direction,
                &view.detector,
                source_direction,
            );
            let mut energy = ctx.distance_attenuation(source_distance) * attenuation;
            if view.directivity.is_some() {
                energy *= view.directivity_gain(-source_direction);
            }
            if energy.max() < MIN_TRANSMISSION_GAIN {
                return;
            }
            let path = SoundPath {
                hash: scratch.path_id.hash(),
                kind: PathKind::DIRECT | PathKind::TRANSMISSION,
                intensity: energy,
                direction: source_direction,
                source_direction: -source_direction,
                distance: source_distance,
                relative_speed,
                speed: ctx.scene.medium().speed(),
            };
            let ir = &mut sinks[source_index].ir;
            if request.has(PropagationFlags::SAMPLED_IR)
                && !request.has(PropagationFlags::DOPPLER_SORTING)
            {
                ir.add_impulse(path.delay(), path.intensity, path.direction, path.source_direction);
            } else {
                ir.add_path(path);
            }
            return;
        };

        let world = ctx.scene.world_triangle(&hit.triangle);
        let material = ctx.materials.for_triangle(&world);
        if material.transmission.max() <= 0.0 {
            return;
        }
        attenuation *= material.transmission;
        if attenuation.max() < MIN_TRANSMISSION_GAIN {
            return;
        }
        scratch
            .path_id
            .push_point(PathPoint::new(PointKind::Transmission, hit.triangle, 0));
        travelled += hit.t + ray_offset;
        ray.origin = ray.at(hit.t + ray_offset);
    }
}
