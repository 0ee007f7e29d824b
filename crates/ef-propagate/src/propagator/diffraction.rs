//! Edge-diffraction path search
//!
//! At each specular probe hit, every diffracting edge of the hit
//! triangle may bend the path toward each source. The candidate point on
//! an edge is the closest approach between the edge line and the
//! listener-to-source line; candidates validate segment by segment with
//! UTD attenuation per diffraction point, then recurse over the edge's
//! precomputed neighbours up to the diffraction order.

use ef_core::{Plane, Pt3, Ray, Transform3, Vec3};
use ef_scene::{DiffractionEdge, DiffractionGraph, Mesh, ObjectTriangle, WorldTriangle};

use crate::cache::PathCache;
use crate::path::{PathKind, PathPoint, PointKind};
use crate::utd::utd_attenuation;

use super::context::TraceContext;
use super::scratch::{DiffractionPoint, SpecularPath, ThreadScratch};

/// Offset applied to diffraction points and validation rays, in meters.
const DIFFRACTION_EPSILON: f32 = 0.001;

/// A diffraction edge resolved into world space.
#[derive(Debug, Clone, Copy)]
struct WorldEdge {
    data: DiffractionEdge,
    v1: Pt3,
    v2: Pt3,
    direction: Vec3,
    length: f32,
    plane1: Plane,
    plane2: Plane,
    normal: Vec3,
}

impl WorldEdge {
    fn new(edge: &DiffractionEdge, mesh: &Mesh, transform: &Transform3) -> Self {
        let v1 = transform.to_world_point(mesh.vertex(edge.vertices[0]));
        let v2 = transform.to_world_point(mesh.vertex(edge.vertices[1]));
        let mut direction = v2 - v1;
        let length = direction.norm();
        if length > f32::EPSILON {
            direction /= length;
        }
        let normal_raw = transform.to_world_vector(edge.normal());
        let normal_len = normal_raw.norm();
        Self {
            data: *edge,
            v1,
            v2,
            direction,
            length,
            plane1: transform.to_world_plane(&edge.planes[0]),
            plane2: transform.to_world_plane(&edge.planes[1]),
            normal: if normal_len > f32::EPSILON {
                normal_raw / normal_len
            } else {
                Vec3::zeros()
            },
        }
    }
}

/// Constant query inputs shared down the recursion.
struct EdgeQuery<'a> {
    graph: &'a DiffractionGraph,
    mesh: &'a Mesh,
    transform: &'a Transform3,
    object: u32,
    object_id: u64,
    source_index: u32,
    /// Whether produced paths should enter the specular cache.
    insert: bool,
}

/// True when `point` lies inside the wedge's diffracting region: not in
/// front of both faces and not behind both.
fn edge_orientation_allows(plane1: &Plane, plane2: &Plane, point: Pt3, offset: f32) -> bool {
    let d1 = plane1.signed_distance(point);
    let d2 = plane2.signed_distance(point);
    let front = d1 > offset && d2 > offset;
    let behind = d1 < -offset && d2 < -offset;
    !(front || behind)
}

/// Parameter along line (p1, v1) of the closest approach to line
/// (p2, v2). Parallel lines return 0.
fn closest_approach(p1: Pt3, v1: Vec3, p2: Pt3, v2: Vec3) -> f32 {
    let v1v2 = v1.dot(&v2);
    let denom = 1.0 - v1v2 * v1v2;
    if denom.abs() < 1e-9 {
        return 0.0;
    }
    let offset = p2 - p1;
    (offset.dot(&v1) - offset.dot(&v2) * v1v2) / denom
}

/// The vertex of the incident triangle that is not on the edge, used to
/// orient the shadow-boundary plane.
fn free_vertex(edge: &DiffractionEdge, side: usize, mesh: &Mesh) -> Pt3 {
    let triangle = mesh.triangle(edge.triangles[side]);
    for &v in &triangle.vertices {
        if v != edge.vertices[0] && v != edge.vertices[1] {
            return mesh.vertex(v);
        }
    }
    mesh.vertex(triangle.vertices[0])
}

/// Attempts diffraction paths from every diffracting edge of a probe-hit
/// triangle toward one source. Returns true if any path was produced.
pub(crate) fn add_diffraction_paths(
    ctx: &TraceContext<'_>,
    path_cache: Option<&PathCache>,
    source_index: u32,
    listener_image: Pt3,
    world_triangle: &WorldTriangle,
    scratch: &mut ThreadScratch,
) -> bool {
    let object_index = world_triangle.source.object;
    let object = ctx.scene.object(object_index as usize);
    let mesh: &Mesh = object.mesh().as_ref();
    let Some(graph) = mesh.diffraction_graph() else {
        return false;
    };
    let transform = object.transform();
    let view = &ctx.views[source_index as usize];
    let source_position = view.detector.position();

    let query = EdgeQuery {
        graph,
        mesh,
        transform,
        object: object_index,
        object_id: object.id(),
        source_index,
        insert: path_cache.is_some(),
    };

    let to_source = source_position - listener_image;
    let to_source_len = to_source.norm();
    if to_source_len < f32::EPSILON {
        return false;
    }
    scratch.diffraction.listener_to_source = to_source / to_source_len;
    scratch.path_id.set_source(view.key);

    let produced_before = scratch.specular_paths.len();
    let triangle = mesh.triangle(world_triangle.source.triangle);
    for e in 0..3 {
        let Some(edge_index) = triangle.diffraction_edge(e) else {
            continue;
        };
        let edge = WorldEdge::new(query.graph.edge(edge_index), mesh, transform);
        if !edge_orientation_allows(&edge.plane1, &edge.plane2, listener_image, 0.0) {
            continue;
        }
        let t = closest_approach(
            edge.v1,
            edge.direction,
            source_position,
            scratch.diffraction.listener_to_source,
        )
        .clamp(0.0, edge.length);
        let diffraction_point =
            edge.v1 + edge.direction * t + edge.normal * ctx.request.ray_offset;

        let dummy = Plane::new(Vec3::zeros(), 0.0);
        scratch.diffraction.points.clear();
        scratch.diffraction.responses.clear();
        scratch.diffraction.points.push(DiffractionPoint {
            point: listener_image,
            distance: 0.0,
            source_plane: dummy,
            listener_plane: dummy,
        });
        scratch.diffraction.points.push(DiffractionPoint {
            point: diffraction_point,
            distance: 0.0,
            source_plane: dummy,
            listener_plane: dummy,
        });
        let path_direction = diffraction_point - listener_image;
        let path_len = path_direction.norm();
        if path_len < f32::EPSILON {
            scratch.diffraction.points.clear();
            continue;
        }
        scratch.diffraction.listener_path_direction = path_direction / path_len;
        scratch.diffraction.listener_speed = scratch
            .diffraction
            .listener_path_direction
            .dot(&ctx.listener.velocity());
        scratch.diffraction.last_valid = 0;

        recursive_diffraction(ctx, &query, path_cache, &edge, 1, scratch);

        scratch.diffraction.points.clear();
        scratch.diffraction.responses.clear();
    }
    scratch.specular_paths.len() > produced_before
}

/// Processes one edge of the diffraction chain and recurses over its
/// neighbours.
fn recursive_diffraction(
    ctx: &TraceContext<'_>,
    query: &EdgeQuery<'_>,
    path_cache: Option<&PathCache>,
    edge: &WorldEdge,
    depth: u32,
    scratch: &mut ThreadScratch,
) {
    let num_points = scratch.diffraction.points.len();
    let last_point = scratch.diffraction.points[num_points - 2];
    let this_point = scratch.diffraction.points[num_points - 1].point;

    // Which wedge face looks toward the incoming path.
    let d1 = edge.plane1.signed_distance(last_point.point);
    let d2 = edge.plane2.signed_distance(last_point.point);
    let listener_side = d1 > d2 && d1 > 0.0;
    let (listener_plane, opposite_plane, side) = if listener_side {
        (edge.plane1, edge.plane2, 0)
    } else {
        (edge.plane2, edge.plane1, 1)
    };
    scratch.diffraction.points[num_points - 1].listener_plane = listener_plane;
    scratch.diffraction.points[num_points - 1].source_plane = opposite_plane;

    // Shadow boundary: the plane through the incoming point and the edge,
    // facing away from the listener-side face.
    let free = query.transform.to_world_point(free_vertex(&edge.data, side, query.mesh));
    let mut shadow_boundary = Plane::from_points(last_point.point, edge.v1, edge.v2);
    if shadow_boundary.signed_distance(free) < 0.0 {
        shadow_boundary = shadow_boundary.flipped();
    }

    scratch.path_id.push_point(PathPoint::new(
        PointKind::EdgeDiffraction,
        ObjectTriangle {
            object: query.object,
            object_id: query.object_id,
            triangle: edge.data.triangles[side],
        },
        edge.data.edge_index[side] as u32,
    ));

    // A first-order path already in the cache revalidates through the
    // cache pass instead.
    if depth == 1 {
        if let Some(cache) = path_cache {
            if cache.contains_path(&scratch.path_id) {
                scratch.path_id.pop_point();
                return;
            }
        }
    }

    let source_position = ctx.views[query.source_index as usize]
        .detector
        .position();
    let source_in_shadow = shadow_boundary.signed_distance(source_position) > 0.0
        && opposite_plane.signed_distance(source_position) > 0.0;

    if source_in_shadow {
        // Validate the segments added since the deepest already valid
        // prefix, accumulating UTD products per interior point.
        let mut valid = true;
        let mut index = scratch.diffraction.last_valid;
        while index < num_points - 1 {
            let from = scratch.diffraction.points[index];
            let to = scratch.diffraction.points[index + 1];
            let mut direction = to.point - from.point;
            let distance = direction.norm();
            if distance <= DIFFRACTION_EPSILON {
                valid = false;
                break;
            }
            direction /= distance;
            let probe = Ray::new(from.point + direction * DIFFRACTION_EPSILON, direction);
            if ctx
                .scene
                .intersect_ray_any(&probe, distance - 2.0 * DIFFRACTION_EPSILON)
            {
                valid = false;
                break;
            }
            scratch.diffraction.points[index + 1].distance = from.distance + distance;

            if index > 0 {
                let before = scratch.diffraction.points[index - 1];
                let mut attenuation = utd_attenuation(
                    to.point,
                    from.point,
                    before.point,
                    from.source_plane.normal,
                    from.listener_plane.normal,
                    edge.direction,
                    ctx.scene.medium().speed(),
                    &ctx.request.frequencies,
                );
                if index > 1 {
                    attenuation *= scratch.diffraction.responses[index - 2];
                }
                if scratch.diffraction.responses.len() < index {
                    scratch.diffraction.responses.push(attenuation);
                } else {
                    scratch.diffraction.responses[index - 1] = attenuation;
                }
            }
            index += 1;
        }
        scratch.diffraction.last_valid = index;

        if valid {
            let mut source_direction = source_position - this_point;
            let source_distance = source_direction.norm();
            if source_distance > DIFFRACTION_EPSILON {
                source_direction /= source_distance;
                let probe = Ray::new(
                    this_point + source_direction * DIFFRACTION_EPSILON,
                    source_direction,
                );
                let source_visible = !ctx
                    .scene
                    .intersect_ray_any(&probe, source_distance - 2.0 * DIFFRACTION_EPSILON);
                if source_visible {
                    let mut attenuation = utd_attenuation(
                        source_position,
                        this_point,
                        last_point.point,
                        opposite_plane.normal,
                        listener_plane.normal,
                        edge.direction,
                        ctx.scene.medium().speed(),
                        &ctx.request.frequencies,
                    );
                    if depth > 1 {
                        if let Some(prefix) = scratch.diffraction.responses.last() {
                            attenuation *= *prefix;
                        }
                    }
                    let total_distance = scratch
                        .diffraction
                        .points
                        .last()
                        .map_or(0.0, |p| p.distance)
                        + source_distance;
                    let view = &ctx.views[query.source_index as usize];
                    let source_speed = source_direction.dot(&view.detector.velocity());
                    let mut energy = ctx.distance_attenuation(total_distance) * attenuation;
                    if view.directivity.is_some() {
                        energy *= view.directivity_gain(-source_direction);
                    }
                    scratch.specular_paths.push(SpecularPath {
                        hash: scratch.path_id.hash(),
                        id: scratch.path_id.clone(),
                        kind: PathKind::DIFFRACTION,
                        energy,
                        direction: scratch.diffraction.listener_path_direction,
                        source_direction: -source_direction,
                        distance: total_distance,
                        relative_speed: source_speed - scratch.diffraction.listener_speed,
                        speed: ctx.scene.medium().speed(),
                        source: query.source_index,
                        insert: query.insert,
                    });
                }
            }
        }
    }

    // Recurse into neighbouring edges that continue the wedge's shadow
    // region.
    if depth >= ctx.request.max_diffraction_order || edge.data.neighbor_count == 0 {
        scratch.path_id.pop_point();
        return;
    }
    let neighbor_start = edge.data.neighbor_offset as usize;
    let neighbor_end = neighbor_start + edge.data.neighbor_count as usize;
    for n in neighbor_start..neighbor_end {
        let neighbor_index = query.graph.neighbors[n];
        let neighbor = WorldEdge::new(query.graph.edge(neighbor_index), query.mesh, query.transform);
        let t = closest_approach(
            neighbor.v1,
            neighbor.direction,
            ctx.listener.position(),
            scratch.diffraction.listener_to_source,
        )
        .clamp(0.0, neighbor.length);
        let next_point =
            neighbor.v1 + neighbor.direction * t + neighbor.normal * DIFFRACTION_EPSILON;
        let in_wedge = shadow_boundary.signed_distance(next_point) > 0.0
            && opposite_plane.signed_distance(next_point) > 0.0;
        if !in_wedge {
            continue;
        }
        let dummy = Plane::new(Vec3::zeros(), 0.0);
        scratch.diffraction.points.push(DiffractionPoint {
            point: next_point,
            distance: 0.0,
            source_plane: dummy,
            listener_plane: dummy,
        });
        recursive_diffraction(ctx, query, path_cache, &neighbor, depth + 1, scratch);
        scratch.diffraction.points.pop();
        if scratch.diffraction.last_valid >= depth as usize {
            scratch.diffraction.last_valid -= 1;
        }
    }

    scratch.path_id.pop_point();
}
