//! Specular path search and validation
//!
//! Probe rays from the listener bounce specularly through the scene,
//! maintaining a stack of listener images. At each bounce every source
//! is tested: the candidate image-source path is validated back-to-front
//! with occlusion checks (exactly for point sources, by cone sampling
//! for sphere sources), and survivors become cached specular paths.

use ef_core::{BandResponse, Pt3, Ray, Sphere, Vec3, plane_basis};
use rand_chacha::ChaCha8Rng;

use crate::cache::{PathCache, PathCacheEntry};
use crate::path::{PathId, PathKind, PathPoint, PointKind};
use crate::request::PropagationFlags;

use super::context::TraceContext;
use super::diffraction::add_diffraction_paths;
use super::diffuse::propagate_listener_diffuse_ray;
use super::scratch::{
    DiffuseSink, ImagePosition, SpecularPath, ThreadScratch, random_direction,
    random_direction_in_z_cone, sphere_cos_half_angle,
};

/// Budget floor per probe ray, so short rays still consume budget.
const MIN_RAY_COST: u64 = 6;

/// A successfully validated specular chain.
pub(crate) struct Validated {
    pub distance: f32,
    pub from_listener: Vec3,
    pub to_source: Vec3,
    pub visibility: f32,
}

// ============ Probe-ray driver ============

/// Traces one worker's share of specular and diffuse probe rays for the
/// listener. Ray counts are budgets of `rays × depth` segment casts.
pub(crate) fn propagate_listener_rays(
    ctx: &TraceContext<'_>,
    path_cache: &PathCache,
    num_specular_rays: u64,
    num_diffuse_rays: u64,
    scratch: &mut ThreadScratch,
    sink: &mut DiffuseSink<'_>,
) {
    let request = ctx.request;
    let specular_enabled = request.has(PropagationFlags::SPECULAR);
    let diffraction_enabled = request.has(PropagationFlags::DIFFRACTION);
    let diffuse_enabled = request.has(PropagationFlags::DIFFUSE);

    // Diffraction spawns from specular probe hits, so probing must go at
    // least one bounce deeper than the deepest diffracting surface.
    let specular_depth = if diffraction_enabled {
        (request.max_specular_depth as u64).max(request.max_diffraction_depth as u64 + 1)
    } else {
        request.max_specular_depth as u64
    };

    scratch.specular_rays_cast = 0;
    if (specular_enabled || diffraction_enabled) && specular_depth > 0 {
        let mut budget = num_specular_rays * specular_depth;
        while budget > 0 {
            let ray = Ray::new(
                ctx.listener.position(),
                random_direction(&mut scratch.rng),
            );
            let bounces = propagate_specular_ray(
                ctx,
                path_cache,
                ray,
                specular_depth.min(budget) as u32,
                scratch,
            ) as u64;
            budget -= bounces.max(MIN_RAY_COST).min(specular_depth).min(budget);
            scratch.specular_rays_cast += 1;
        }
    }

    scratch.diffuse_rays_cast = 0;
    scratch.total_ray_depth = 0;
    if diffuse_enabled && !request.has(PropagationFlags::SOURCE_DIFFUSE) {
        let max_depth = request.max_diffuse_depth as u64;
        let mut budget = num_diffuse_rays * max_depth;
        while budget > 0 {
            let direction = random_direction(&mut scratch.rng);
            let ray = Ray::new(
                ctx.listener.position() + direction * ctx.listener.radius(),
                direction,
            );
            let bounces = propagate_listener_diffuse_ray(
                ctx,
                ray,
                max_depth.min(budget) as u32,
                direction,
                scratch,
                sink,
            ) as u64;
            scratch.total_ray_depth += bounces;
            budget -= bounces.max(MIN_RAY_COST).min(max_depth).min(budget);
            scratch.diffuse_rays_cast += 1;
        }
    }
}

/// Follows one specular probe ray, spawning diffraction queries and
/// validating a path to every source at each bounce. Returns the number
/// of bounces taken.
pub(crate) fn propagate_specular_ray(
    ctx: &TraceContext<'_>,
    path_cache: &PathCache,
    mut ray: Ray,
    max_bounces: u32,
    scratch: &mut ThreadScratch,
) -> usize {
    let request = ctx.request;
    let specular_enabled = request.has(PropagationFlags::SPECULAR);
    let diffraction_enabled = request.has(PropagationFlags::DIFFRACTION);
    let visibility_enabled = request.has(PropagationFlags::VISIBILITY_CACHE);
    let cache_enabled = request.has(PropagationFlags::SPECULAR_CACHE);
    let ray_offset = request.ray_offset;
    let max_distance = ctx.max_ir_length * ctx.scene.medium().speed();

    scratch.path_id.clear_points();
    scratch.path_id.set_listener(ctx.listener.id());
    let mut image = ray.origin;
    let mut attenuation = BandResponse::default();
    let mut total_distance = 0.0f32;

    let mut depth = 0usize;
    while depth < max_bounces as usize {
        let Some(hit) = ctx.scene.intersect_ray(&ray, f32::MAX) else {
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

        // Diffraction queries start from the listener image accumulated
        // up to the previous bounce.
        if diffraction_enabled && scratch.images.len() <= request.max_diffraction_depth as usize {
            let from_image = scratch
                .images
                .last()
                .map_or(ctx.listener.position(), |last| last.image);
            for source_index in 0..ctx.views.len() {
                add_diffraction_paths(
                    ctx,
                    Some(path_cache),
                    source_index as u32,
                    from_image,
                    &world,
                    scratch,
                );
            }
        }

        let material = ctx.materials.for_triangle(&world);
        ray = Ray::new(point, material.specular_reflection(ray.direction, normal));
        attenuation *= material.reflectivity * (BandResponse::splat(1.0) - material.scattering);

        image = world.plane.reflect_point(image);
        scratch.images.push(ImagePosition {
            triangle: world,
            image,
        });
        scratch.path_id.push_point(PathPoint::new(
            PointKind::SpecularReflection,
            hit.triangle,
            0,
        ));

        if specular_enabled {
            for (source_index, view) in ctx.views.iter().enumerate() {
                let source_direction = view.detector.position() - point;
                if source_direction.dot(&normal) < 0.0 {
                    continue;
                }
                if visibility_enabled && !view.visibility.contains_triangle(&hit.triangle) {
                    continue;
                }
                scratch.path_id.set_source(view.key);
                if cache_enabled && path_cache.contains_path(&scratch.path_id) {
                    continue;
                }
                let sphere = Sphere::new(view.detector.position(), view.detector.radius());
                let Some(validated) = validate_specular_path(
                    ctx,
                    &sphere,
                    ctx.listener.position(),
                    request.num_specular_samples,
                    &scratch.images,
                    &mut scratch.validation_rays,
                    &mut scratch.rng,
                ) else {
                    continue;
                };
                let relative_speed = ctx.relative_speed(
                    ctx.listener,
                    validated.from_listener,
                    &view.detector,
                    validated.to_source,
                );
                let mut energy = ctx.distance_attenuation(validated.distance)
                    * attenuation
                    * validated.visibility;
                if view.directivity.is_some() {
                    energy *= view.directivity_gain(-validated.to_source);
                }
                scratch.specular_paths.push(SpecularPath {
                    hash: scratch.path_id.hash(),
                    id: scratch.path_id.clone(),
                    kind: PathKind::SPECULAR,
                    energy,
                    direction: validated.from_listener,
                    source_direction: -validated.to_source,
                    distance: validated.distance,
                    relative_speed,
                    speed: ctx.scene.medium().speed(),
                    source: source_index as u32,
                    insert: true,
                });
            }
        }
        depth += 1;
    }

    scratch.path_id.clear_points();
    scratch.images.clear();
    depth
}

// ============ Validation ============

/// Validates the image chain in `images` from the listener to a source
/// sphere. Sphere sources with multiple samples use stochastic cone
/// validation; point sources (or a single sample) use the exact test.
pub(crate) fn validate_specular_path(
    ctx: &TraceContext<'_>,
    source: &Sphere,
    listener_position: Pt3,
    num_samples: u32,
    images: &[ImagePosition],
    validation_rays: &mut Vec<Ray>,
    rng: &mut ChaCha8Rng,
) -> Option<Validated> {
    if images.is_empty() {
        return None;
    }
    if num_samples <= 1 || source.radius < 1e-6 {
        validate_point_path(ctx, source, listener_position, images)
    } else {
        sample_sphere_path(
            ctx,
            source,
            listener_position,
            num_samples,
            images,
            validation_rays,
            rng,
        )
    }
}

/// Exact back-to-front validation for a point source.
fn validate_point_path(
    ctx: &TraceContext<'_>,
    source: &Sphere,
    listener_position: Pt3,
    images: &[ImagePosition],
) -> Option<Validated> {
    let ray_offset = ctx.request.ray_offset;
    let mut virtual_source = source.center;
    let mut total_distance = 0.0f32;
    let mut to_source = Vec3::zeros();

    for i in (0..images.len()).rev() {
        let triangle = &images[i].triangle;
        let listener_image = images[i].image;
        // The image and the running virtual source must straddle the
        // reflector, or the unfolded path does not cross it.
        if triangle.plane.signed_distance(listener_image)
            * triangle.plane.signed_distance(virtual_source)
            >= 0.0
        {
            return None;
        }
        let mut direction = listener_image - virtual_source;
        let length = direction.norm();
        if length > f32::EPSILON {
            direction /= length;
        }
        let test_ray = Ray::new(virtual_source, direction);
        let hit_t = test_ray.intersects_triangle(
            triangle.vertices[0],
            triangle.vertices[1],
            triangle.vertices[2],
        )?;
        if ctx
            .scene
            .intersect_ray_any(&test_ray, hit_t - 2.0 * ray_offset)
        {
            return None;
        }
        virtual_source = test_ray.at(hit_t);
        if test_ray.direction.dot(&triangle.plane.normal) > 0.0 {
            virtual_source -= triangle.plane.normal * ray_offset;
        } else {
            virtual_source += triangle.plane.normal * ray_offset;
        }
        total_distance += hit_t;
        if i == images.len() - 1 {
            to_source = -test_ray.direction;
        }
    }

    let mut from_listener = virtual_source - listener_position;
    let distance = from_listener.norm();
    if distance <= f32::EPSILON {
        return None;
    }
    from_listener /= distance;
    if ctx
        .scene
        .intersect_ray_any(&Ray::new(listener_position, from_listener), distance)
    {
        return None;
    }
    Some(Validated {
        distance: total_distance + distance,
        from_listener,
        to_source,
        visibility: 1.0,
    })
}

/// Stochastic validation for a sphere source: cone samples through the
/// last reflector, redirected to each earlier listener image in turn.
/// Visibility is the surviving fraction; distance the survivor mean.
fn sample_sphere_path(
    ctx: &TraceContext<'_>,
    source: &Sphere,
    listener_position: Pt3,
    num_samples: u32,
    images: &[ImagePosition],
    validation_rays: &mut Vec<Ray>,
    rng: &mut ChaCha8Rng,
) -> Option<Validated> {
    let ray_offset = ctx.request.ray_offset;
    let min_valid = 1usize;
    validation_rays.clear();

    let last = images.last()?;
    let mut source_direction = source.center - last.image;
    let source_distance = source_direction.norm();
    if source_distance > f32::EPSILON {
        source_direction /= source_distance;
    }
    let cos_half = sphere_cos_half_angle(source_distance, source.radius);
    let rotation = plane_basis(source_direction);

    // Cast from the last listener image toward the source sphere; keep
    // rays that pierce the last reflector and reach the sphere.
    let mut total_distance = 0.0f32;
    let mut mean = 0.0f32;
    for _ in 0..num_samples {
        let direction = (rotation * random_direction_in_z_cone(rng, cos_half)).normalize();
        let ray = Ray::new(last.image, direction);
        let Some(triangle_t) = ray.intersects_triangle(
            last.triangle.vertices[0],
            last.triangle.vertices[1],
            last.triangle.vertices[2],
        ) else {
            continue;
        };
        let Some(sphere_t) = ray.intersects_sphere(source) else {
            continue;
        };
        // Walk back from the sphere surface toward the reflector.
        let mut back = Ray::new(ray.at(sphere_t), -direction);
        let segment = sphere_t - triangle_t;
        if ctx
            .scene
            .intersect_ray_any(&back, segment - 2.0 * ray_offset)
        {
            continue;
        }
        back.origin = back.at(segment);
        if back.direction.dot(&last.triangle.plane.normal) > 0.0 {
            back.origin -= last.triangle.plane.normal * ray_offset;
        } else {
            back.origin += last.triangle.plane.normal * ray_offset;
        }
        mean += segment;
        validation_rays.push(back);
    }
    if validation_rays.len() < min_valid {
        return None;
    }
    total_distance += mean / validation_rays.len() as f32;

    // Redirect survivors through each earlier reflector in turn.
    let mut source_image = last.triangle.plane.reflect_point(source.center);
    for i in (0..images.len().saturating_sub(1)).rev() {
        let triangle = &images[i].triangle;
        let listener_image = images[i].image;
        if triangle.plane.signed_distance(listener_image)
            * triangle.plane.signed_distance(source_image)
            > 0.0
        {
            return None;
        }
        source_image = triangle.plane.reflect_point(source_image);

        let mut mean = 0.0f32;
        let mut j = 0;
        while j < validation_rays.len() {
            let ray = &mut validation_rays[j];
            ray.direction = (listener_image - ray.origin).normalize();
            let survived = ray
                .intersects_triangle(
                    triangle.vertices[0],
                    triangle.vertices[1],
                    triangle.vertices[2],
                )
                .filter(|&t| {
                    !ctx.scene
                        .intersect_ray_any(&Ray::new(ray.origin, ray.direction), t - 2.0 * ray_offset)
                });
            match survived {
                Some(t) => {
                    ray.origin = ray.at(t);
                    if ray.direction.dot(&triangle.plane.normal) > 0.0 {
                        ray.origin -= triangle.plane.normal * ray_offset;
                    } else {
                        ray.origin += triangle.plane.normal * ray_offset;
                    }
                    mean += t;
                    j += 1;
                }
                None => {
                    validation_rays.swap_remove(j);
                    if validation_rays.len() < min_valid {
                        return None;
                    }
                }
            }
        }
        total_distance += mean / validation_rays.len() as f32;
    }

    // Final leg: every survivor must see the listener.
    let mut mean = 0.0f32;
    let mut survivors = 0usize;
    for ray in validation_rays.iter_mut() {
        let mut direction = listener_position - ray.origin;
        let distance = direction.norm();
        if distance <= f32::EPSILON {
            continue;
        }
        direction /= distance;
        if ctx
            .scene
            .intersect_ray_any(&Ray::new(ray.origin, direction), distance - 2.0 * ray_offset)
        {
            continue;
        }
        mean += distance;
        survivors += 1;
    }
    if survivors < min_valid {
        return None;
    }
    total_distance += mean / survivors as f32;

    Some(Validated {
        distance: total_distance,
        from_listener: (source_image - listener_position).normalize(),
        to_source: source_direction,
        visibility: survivors as f32 / num_samples as f32,
    })
}

// ============ Cache re-validation ============

/// Re-validates one shard of the specular cache against the current
/// scene. Entries that fail and are stale are evicted; survivors refresh
/// their timestamp and are re-emitted through the worker's path buffer
/// without re-insertion.
pub(crate) fn validate_cache_shard(
    ctx: &TraceContext<'_>,
    buckets: &mut [Vec<PathCacheEntry>],
    source_index_of: &std::collections::HashMap<u64, u32>,
    scratch: &mut ThreadScratch,
) {
    let request = ctx.request;
    let specular_enabled = request.has(PropagationFlags::SPECULAR);
    let diffraction_enabled = request.has(PropagationFlags::DIFFRACTION);
    // Entries must revalidate every frame or leave.
    let max_age = 0u64;

    scratch.path_id.clear_points();
    scratch.path_id.set_listener(ctx.listener.id());

    for bucket in buckets.iter_mut() {
        let mut i = 0;
        while i < bucket.len() {
            let path = bucket[i].path.clone();
            let Some(&source_index) = source_index_of.get(&path.source()) else {
                bucket.swap_remove(i);
                continue;
            };
            if path.point_count() == 0 {
                bucket.swap_remove(i);
                continue;
            }

            if path.point(0).kind == PointKind::EdgeDiffraction {
                // Re-run the edge search from the cached triangle; any
                // produced path revalidates the entry.
                let resolved = ctx.resolve_triangle(&path.point(0).triangle);
                let revalidated = diffraction_enabled
                    && resolved.is_some_and(|triangle| {
                        let world = ctx.scene.world_triangle(&triangle);
                        add_diffraction_paths(
                            ctx,
                            None,
                            source_index,
                            ctx.listener.position(),
                            &world,
                            scratch,
                        )
                    });
                if revalidated {
                    bucket[i].timestamp = ctx.timestamp;
                    i += 1;
                } else {
                    bucket.swap_remove(i);
                }
                continue;
            }

            if !specular_enabled {
                if ctx.timestamp.saturating_sub(bucket[i].timestamp) > max_age {
                    bucket.swap_remove(i);
                    continue;
                }
                i += 1;
                continue;
            }

            // Rebuild the image stack from the stored triangle chain.
            scratch.images.clear();
            let mut image = ctx.listener.position();
            let mut attenuation = BandResponse::default();
            let mut chain_ok = true;
            for point in path.points() {
                let Some(triangle) = ctx.resolve_triangle(&point.triangle) else {
                    chain_ok = false;
                    break;
                };
                let world = ctx.scene.world_triangle(&triangle);
                image = world.plane.reflect_point(image);
                let material = ctx.materials.for_triangle(&world);
                attenuation *=
                    material.reflectivity * (BandResponse::splat(1.0) - material.scattering);
                scratch.images.push(ImagePosition {
                    triangle: world,
                    image,
                });
            }
            if !chain_ok {
                bucket.swap_remove(i);
                continue;
            }

            let view = &ctx.views[source_index as usize];
            let sphere = Sphere::new(view.detector.position(), view.detector.radius());
            let validated = validate_specular_path(
                ctx,
                &sphere,
                ctx.listener.position(),
                request.num_specular_samples,
                &scratch.images,
                &mut scratch.validation_rays,
                &mut scratch.rng,
            );
            match validated {
                Some(validated) => {
                    bucket[i].timestamp = ctx.timestamp;
                    let relative_speed = ctx.relative_speed(
                        ctx.listener,
                        validated.from_listener,
                        &view.detector,
                        validated.to_source,
                    );
                    let mut energy = ctx.distance_attenuation(validated.distance)
                        * attenuation
                        * validated.visibility;
                    if view.directivity.is_some() {
                        energy *= view.directivity_gain(-validated.to_source);
                    }
                    scratch.specular_paths.push(SpecularPath {
                        hash: path.hash(),
                        id: PathId::new(),
                        kind: PathKind::SPECULAR,
                        energy,
                        direction: validated.from_listener,
                        source_direction: -validated.to_source,
                        distance: validated.distance,
                        relative_speed,
                        speed: ctx.scene.medium().speed(),
                        source: source_index,
                        insert: false,
                    });
                    i += 1;
                }
                None => {
                    if ctx.timestamp.saturating_sub(bucket[i].timestamp) > max_age {
                        bucket.swap_remove(i);
                    } else {
                        i += 1;
                    }
                }
            }
        }
    }
    scratch.images.clear();
}
