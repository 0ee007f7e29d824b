//! Diffuse Monte-Carlo sampling
//!
//! Random-walk rays bounce through the scene sampling each surface's
//! BRDF. At every bounce the walk splits a next-event estimate toward
//! each source: cone-sampled visibility times the detector's projected
//! solid angle times the material's probability of scattering that way.
//! Contributions stream to the main thread in batches.

use ef_core::{BandResponse, Ray, barycentric};
use rand::Rng;

use crate::path::{PathPoint, PointKind};
use crate::request::PropagationFlags;

use super::context::TraceContext;
use super::scratch::{
    DiffuseContribution, DiffuseSink, ThreadScratch, detector_visibility,
    hemisphere_sphere_attenuation,
};

/// One listener-origin diffuse random walk. Returns the bounce count.
pub(crate) fn propagate_listener_diffuse_ray(
    ctx: &TraceContext<'_>,
    mut ray: Ray,
    max_bounces: u32,
    listener_direction: ef_core::Vec3,
    scratch: &mut ThreadScratch,
    sink: &mut DiffuseSink<'_>,
) -> usize {
    let request = ctx.request;
    let visibility_enabled = request.has(PropagationFlags::VISIBILITY_CACHE);
    let transmission_enabled = request.has(PropagationFlags::TRANSMISSION);
    let num_samples = request.num_diffuse_samples;
    let ray_offset = request.ray_offset;
    let max_distance = ctx.max_ir_length * ctx.scene.medium().speed();
    let max_specular_depth = if request.has(PropagationFlags::SPECULAR) {
        request.max_specular_depth as usize
    } else {
        0
    };

    scratch.diffuse_path_id.clear_points();
    scratch.diffuse_path_id.set_listener(ctx.listener.id());

    let mut reflection_attenuation = BandResponse::default();
    let mut scattering_attenuation = BandResponse::default();
    let mut total_distance = 0.0f32;

    let mut depth = 0usize;
    while depth < max_bounces as usize && total_distance < max_distance {
        let remaining = max_distance - total_distance;
        let Some(hit) = ctx.scene.intersect_ray(&ray, remaining) else {
            break;
        };
        let world = ctx.scene.world_triangle(&hit.triangle);
        let mut normal = world.plane.normal;
        if ray.direction.dot(&normal) > 0.0 {
            normal = -normal;
        }
        let hit_point = ray.at(hit.t);
        total_distance += hit.t;

        // Path identity is the sequence of barycentric patches visited.
        let patch = {
            let bary = barycentric(
                world.vertices[0],
                world.vertices[1],
                world.vertices[2],
                hit_point,
            );
            let mesh = ctx.scene.object(hit.triangle.object as usize).mesh();
            mesh.triangle(hit.triangle.triangle).patch_id(bary)
        };
        let material = ctx.materials.for_triangle(&world);

        // Transmission leak: occasionally pass straight through a
        // transmissive surface instead of bouncing off it.
        if transmission_enabled && material.transmission.max() > 0.0 {
            let probability = material.transmission.average().clamp(0.0, 1.0);
            if scratch.rng.random::<f32>() < probability {
                scratch.diffuse_path_id.push_point(PathPoint::new(
                    PointKind::Transmission,
                    hit.triangle,
                    patch,
                ));
                reflection_attenuation *= material.transmission * (1.0 / probability.max(1e-3));
                ray.origin = hit_point - normal * ray_offset;
                depth += 1;
                continue;
            }
        }

        scratch.diffuse_path_id.push_point(PathPoint::new(
            PointKind::DiffuseReflection,
            hit.triangle,
            patch,
        ));

        scattering_attenuation *= BandResponse::splat(1.0) - material.scattering;
        // Until the specular search covers this depth, the mirror part of
        // the energy is already accounted for there.
        let inverse_scattering = if depth < max_specular_depth {
            BandResponse::splat(1.0) - scattering_attenuation
        } else {
            BandResponse::default()
        };
        reflection_attenuation *= material.reflectivity;

        let origin = hit_point + normal * ray_offset;
        ray = Ray::new(
            origin,
            material.sample_reflection(ray.direction, normal, &mut scratch.rng),
        );

        for (source_index, view) in ctx.views.iter().enumerate() {
            if total_distance >= view.max_ir_distance {
                continue;
            }
            let mut source_direction = view.detector.position() - origin;
            if source_direction.dot(&normal) < 0.0 {
                continue;
            }
            if visibility_enabled && !view.visibility.contains_triangle(&hit.triangle) {
                continue;
            }
            let mut visibility = detector_visibility(
                ctx.scene,
                &view.detector,
                origin,
                num_samples,
                &mut scratch.rng,
            );
            if visibility <= 0.0 {
                continue;
            }
            let source_distance = source_direction.norm();
            if source_distance > f32::EPSILON {
                source_direction /= source_distance;
            }
            if total_distance + source_distance >= max_distance {
                continue;
            }
            let radius = view.detector.radius().max(1e-3);
            visibility *= hemisphere_sphere_attenuation(source_distance, view.detector.radius());
            visibility *= material.diffuse_reflection_probability(normal, source_direction);

            let mut energy =
                reflection_attenuation * inverse_scattering * (visibility / (radius * radius));
            if view.directivity.is_some() {
                energy *= view.directivity_gain(-source_direction);
            }
            scratch.diffuse_path_id.set_source(view.key);
            sink.post(DiffuseContribution {
                source: source_index as u32,
                hash: scratch.diffuse_path_id.hash(),
                energy,
                direction: listener_direction,
                source_direction: -source_direction,
                distance: total_distance + source_distance,
                relative_speed: 0.0,
            });
        }
        depth += 1;
    }

    scratch.diffuse_path_id.clear_points();
    depth
}

/// Traces one worker's share of source-origin diffuse rays. The ray
/// count is a budget of `rays × depth` segment casts.
pub(crate) fn propagate_source_rays(
    ctx: &TraceContext<'_>,
    source_index: u32,
    num_rays: u64,
    scratch: &mut ThreadScratch,
    sink: &mut DiffuseSink<'_>,
) {
    let view = &ctx.views[source_index as usize];
    let max_depth = ctx.request.max_diffuse_depth as u64;
    const MIN_RAY_COST: u64 = 6;

    scratch.diffuse_rays_cast = 0;
    let mut budget = num_rays * max_depth;
    while budget > 0 {
        let direction = super::scratch::random_direction(&mut scratch.rng);
        let ray = Ray::new(
            view.detector.position() + direction * view.detector.radius(),
            direction,
        );
        let bounces = propagate_source_diffuse_ray(
            ctx,
            source_index,
            ray,
            max_depth.min(budget) as u32,
            direction,
            scratch,
            sink,
        ) as u64;
        budget -= bounces.max(MIN_RAY_COST).min(max_depth).min(budget);
        scratch.diffuse_rays_cast += 1;
    }
}

/// One source-origin diffuse random walk toward the listener detector.
/// Used in source-diffuse mode where per-source sampling converges
/// faster. Returns the bounce count.
pub(crate) fn propagate_source_diffuse_ray(
    ctx: &TraceContext<'_>,
    source_index: u32,
    mut ray: Ray,
    max_bounces: u32,
    source_direction: ef_core::Vec3,
    scratch: &mut ThreadScratch,
    sink: &mut DiffuseSink<'_>,
) -> usize {
    let request = ctx.request;
    let num_samples = request.num_diffuse_samples;
    let ray_offset = request.ray_offset;
    let listener = ctx.listener;
    let radius = listener.radius().max(1e-3);
    let radius_normalize = 1.0 / (radius * radius);
    let max_distance = request.max_ir_length * ctx.scene.medium().speed();
    let max_specular_depth = if request.has(PropagationFlags::SPECULAR) {
        request.max_specular_depth as usize
    } else {
        0
    };

    let mut reflection_attenuation = BandResponse::default();
    let mut scattering_attenuation = BandResponse::default();
    let mut total_distance = 0.0f32;

    let mut depth = 0usize;
    while depth < max_bounces as usize {
        let remaining = max_distance - total_distance;
        let Some(hit) = ctx.scene.intersect_ray(&ray, remaining) else {
            break;
        };
        let world = ctx.scene.world_triangle(&hit.triangle);
        let mut normal = world.plane.normal;
        if ray.direction.dot(&normal) > 0.0 {
            normal = -normal;
        }
        let point = ray.at(hit.t) + normal * ray_offset;
        total_distance += hit.t;
        if total_distance > max_distance {
            break;
        }

        let material = ctx.materials.for_triangle(&world);
        reflection_attenuation *= material.reflectivity;
        scattering_attenuation *= BandResponse::splat(1.0) - material.scattering;
        let inverse_scattering = if depth < max_specular_depth {
            BandResponse::splat(1.0) - scattering_attenuation
        } else {
            BandResponse::default()
        };
        ray = Ray::new(
            point,
            material.sample_reflection(ray.direction, normal, &mut scratch.rng),
        );

        let mut listener_direction = listener.position() - point;
        if listener_direction.dot(&normal) < 0.0 {
            depth += 1;
            continue;
        }
        let visibility = detector_visibility(
            ctx.scene,
            listener,
            point,
            num_samples,
            &mut scratch.rng,
        );
        if visibility > 0.0 {
            let listener_distance = listener_direction.norm();
            if listener_distance > f32::EPSILON {
                listener_direction /= listener_distance;
            }
            if total_distance + listener_distance < max_distance {
                let mut weight = visibility;
                weight *= hemisphere_sphere_attenuation(listener_distance, listener.radius());
                weight *= material.diffuse_reflection_probability(normal, listener_direction);
                let energy =
                    reflection_attenuation * inverse_scattering * (weight * radius_normalize);
                sink.post(DiffuseContribution {
                    source: source_index,
                    hash: 0,
                    energy,
                    direction: -listener_direction,
                    source_direction,
                    distance: total_distance + listener_distance,
                    relative_speed: 0.0,
                });
            }
        }
        depth += 1;
    }
    depth
}
