//! The sound scene
//!
//! Owns the objects, sources, listeners, clusters and medium, plus the
//! top-level BVH over object bounds. Ray queries descend from the object
//! BVH into each candidate object's mesh BVH in object space, then map
//! hits back to world space.

use ef_core::{Medium, Plane, Pt3, Ray};

use crate::bvh::ObjectBvh;
use crate::cluster::{SourceCluster, update_source_clusters};
use crate::detector::{Listener, Source};
use crate::object::SceneObject;

/// A triangle addressed in object space: stable across frames as long as
/// the object stays in the scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectTriangle {
    /// Index into the scene's object list, valid this frame.
    pub object: u32,
    /// The object's stable identity, used for hashing.
    pub object_id: u64,
    /// Triangle index within the object's mesh.
    pub triangle: u32,
}

/// A closest-hit query result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneHit {
    /// World-space distance along the ray.
    pub t: f32,
    pub triangle: ObjectTriangle,
}

/// A triangle resolved into world space.
#[derive(Debug, Clone, Copy)]
pub struct WorldTriangle {
    pub vertices: [Pt3; 3],
    pub plane: Plane,
    /// Material index within the owning mesh.
    pub material: u32,
    pub mesh_id: u64,
    pub source: ObjectTriangle,
}

impl WorldTriangle {
    /// World-space endpoints of triangle edge `edge`.
    #[inline]
    pub fn edge_vertices(&self, edge: usize) -> (Pt3, Pt3) {
        (self.vertices[edge], self.vertices[(edge + 1) % 3])
    }
}

/// The full simulation scene.
#[derive(Debug, Default)]
pub struct Scene {
    objects: Vec<SceneObject>,
    sources: Vec<Source>,
    listeners: Vec<Listener>,
    clusters: Vec<SourceCluster>,
    medium: Medium,
    bvh: ObjectBvh,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    // ============ Contents ============

    pub fn add_object(&mut self, object: SceneObject) -> usize {
        self.objects.push(object);
        self.objects.len() - 1
    }

    pub fn remove_object(&mut self, index: usize) -> SceneObject {
        self.objects.remove(index)
    }

    #[inline]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    pub fn object(&self, index: usize) -> &SceneObject {
        &self.objects[index]
    }

    #[inline]
    pub fn object_mut(&mut self, index: usize) -> &mut SceneObject {
        &mut self.objects[index]
    }

    #[inline]
    pub fn objects(&self) -> &[SceneObject] {
        &self.objects
    }

    pub fn add_source(&mut self, source: Source) -> usize {
        self.sources.push(source);
        self.sources.len() - 1
    }

    pub fn remove_source(&mut self, index: usize) -> Source {
        self.sources.remove(index)
    }

    #[inline]
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    #[inline]
    pub fn source(&self, index: usize) -> &Source {
        &self.sources[index]
    }

    #[inline]
    pub fn source_mut(&mut self, index: usize) -> &mut Source {
        &mut self.sources[index]
    }

    #[inline]
    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn add_listener(&mut self, listener: Listener) -> usize {
        self.listeners.push(listener);
        self.listeners.len() - 1
    }

    pub fn remove_listener(&mut self, index: usize) -> Listener {
        self.listeners.remove(index)
    }

    #[inline]
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    #[inline]
    pub fn listener(&self, index: usize) -> &Listener {
        &self.listeners[index]
    }

    #[inline]
    pub fn listener_mut(&mut self, index: usize) -> &mut Listener {
        &mut self.listeners[index]
    }

    #[inline]
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    #[inline]
    pub fn medium(&self) -> &Medium {
        &self.medium
    }

    pub fn set_medium(&mut self, medium: Medium) {
        self.medium = medium;
    }

    #[inline]
    pub fn clusters(&self) -> &[SourceCluster] {
        &self.clusters
    }

    /// Regroups sources by angular separation seen from `listener`, with
    /// merge/split hysteresis between the two angles (radians).
    pub fn update_source_clusters(
        &mut self,
        listener: &Listener,
        inner_angle: f32,
        outer_angle: f32,
    ) {
        let position = listener.detector().position();
        // Split borrow: clusters are rebuilt from the source list.
        let sources = std::mem::take(&mut self.sources);
        update_source_clusters(&sources, position, inner_angle, outer_angle, &mut self.clusters);
        self.sources = sources;
    }

    // ============ Ray Queries ============

    /// Rebuilds the top-level BVH over enabled objects' world bounds.
    /// Must be called after object edits and before ray queries; the
    /// propagator does so at the start of every frame.
    pub fn rebuild_bvh(&mut self) {
        let boxes: Vec<_> = self
            .objects
            .iter()
            .enumerate()
            .filter(|(_, object)| object.is_enabled())
            .map(|(i, object)| (object.world_aabb(), i as u32))
            .collect();
        self.bvh = ObjectBvh::build(boxes);
    }

    /// Closest hit within `t_max` meters of world space.
    pub fn intersect_ray(&self, ray: &Ray, t_max: f32) -> Option<SceneHit> {
        self.intersect_impl(ray, t_max, false)
    }

    /// True if any geometry blocks the ray within `t_max`.
    pub fn intersect_ray_any(&self, ray: &Ray, t_max: f32) -> bool {
        self.intersect_impl(ray, t_max, true).is_some()
    }

    fn intersect_impl(&self, ray: &Ray, t_max: f32, any_hit: bool) -> Option<SceneHit> {
        if t_max <= 0.0 {
            return None;
        }
        let mut candidates = Vec::new();
        self.bvh.candidates(ray, t_max, &mut candidates);

        let mut best: Option<SceneHit> = None;
        let mut best_t = t_max;
        for &object_index in &candidates {
            let object = &self.objects[object_index as usize];
            let transform = object.transform();
            let local_ray = transform.to_local_ray(ray);
            // Scale changes parameter pacing, so the clip distance is
            // measured in local space and the hit distance recomputed from
            // the world-space hit point. Unbounded queries stay unbounded
            // to keep the transform arithmetic finite.
            let local_t_max = if best_t < 1e30 {
                transform.to_local_vector(ray.direction * best_t).norm()
            } else {
                f32::INFINITY
            };
            let mesh = object.mesh();
            let Some(hit) =
                mesh.bvh()
                    .intersect(mesh.vertices(), mesh.triangles(), &local_ray, local_t_max)
            else {
                continue;
            };
            let world_point = transform.to_world_point(local_ray.at(hit.t));
            let world_t = (world_point - ray.origin).dot(&ray.direction);
            if world_t <= 0.0 || world_t >= best_t {
                continue;
            }
            best_t = world_t;
            best = Some(SceneHit {
                t: world_t,
                triangle: ObjectTriangle {
                    object: object_index,
                    object_id: object.id(),
                    triangle: hit.triangle,
                },
            });
            if any_hit {
                return best;
            }
        }
        best
    }

    /// Resolves an object-space triangle into world space.
    pub fn world_triangle(&self, triangle: &ObjectTriangle) -> WorldTriangle {
        let object = &self.objects[triangle.object as usize];
        let mesh = object.mesh();
        let local = mesh.triangle_vertices(triangle.triangle);
        let transform = object.transform();
        let vertices = local.map(|v| transform.to_world_point(v));
        WorldTriangle {
            vertices,
            plane: Plane::from_points(vertices[0], vertices[1], vertices[2]),
            material: mesh.triangle(triangle.triangle).material,
            mesh_id: mesh.id(),
            source: *triangle,
        }
    }

    /// Total triangle/vertex/edge counts and memory, for statistics.
    pub fn geometry_totals(&self) -> (usize, usize, usize, usize) {
        let mut triangles = 0;
        let mut vertices = 0;
        let mut edges = 0;
        let mut memory = 0;
        for object in &self.objects {
            let mesh = object.mesh();
            triangles += mesh.triangle_count();
            vertices += mesh.vertex_count();
            edges += mesh.diffraction_graph().map_or(0, |g| g.edge_count());
            memory += mesh.size_in_bytes();
        }
        (triangles, vertices, edges, memory)
    }
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::Material;
    use crate::mesh::{Mesh, Triangle};
    use approx::assert_relative_eq;
    use ef_core::{Transform3, Vec3};
    use std::sync::Arc;

    fn floor_mesh(extent: f32) -> Arc<Mesh> {
        Mesh::new(
            vec![
                Pt3::new(-extent, -extent, 0.0),
                Pt3::new(extent, -extent, 0.0),
                Pt3::new(extent, extent, 0.0),
                Pt3::new(-extent, extent, 0.0),
            ],
            vec![Triangle::new([0, 1, 2], 0), Triangle::new([0, 2, 3], 0)],
            vec![Material::default()],
            None,
        )
        .unwrap()
    }

    fn scene_with_floor() -> Scene {
        let mut scene = Scene::new();
        scene.add_object(SceneObject::new(floor_mesh(10.0)));
        scene.rebuild_bvh();
        scene
    }

    #[test]
    fn test_closest_hit_world_space() {
        let scene = scene_with_floor();
        let ray = Ray::new(Pt3::new(0.5, 0.5, 4.0), Vec3::new(0.0, 0.0, -1.0));
        let hit = scene.intersect_ray(&ray, f32::INFINITY).unwrap();
        assert_relative_eq!(hit.t, 4.0, epsilon = 1e-4);
        assert!(scene.intersect_ray_any(&ray, 5.0));
        assert!(!scene.intersect_ray_any(&ray, 3.0));
    }

    #[test]
    fn test_tmax_zero_no_hit() {
        let scene = scene_with_floor();
        let ray = Ray::new(Pt3::new(0.0, 0.0, 4.0), Vec3::new(0.0, 0.0, -1.0));
        assert!(scene.intersect_ray(&ray, 0.0).is_none());
    }

    #[test]
    fn test_scaled_object_distances() {
        let mut scene = Scene::new();
        let mut object = SceneObject::new(floor_mesh(1.0));
        object.set_transform(Transform3 {
            position: Vec3::new(0.0, 0.0, -2.0),
            scale: Vec3::new(4.0, 4.0, 1.0),
            ..Transform3::default()
        });
        scene.add_object(object);
        scene.rebuild_bvh();

        // The quad now spans ±4; a ray at x = 3 must still hit, and the
        // reported t must be the world distance.
        let ray = Ray::new(Pt3::new(3.0, 0.0, 1.0), Vec3::new(0.0, 0.0, -1.0));
        let hit = scene.intersect_ray(&ray, f32::INFINITY).unwrap();
        assert_relative_eq!(hit.t, 3.0, epsilon = 1e-4);
    }

    #[test]
    fn test_disabled_object_ignored() {
        let mut scene = scene_with_floor();
        scene.object_mut(0).set_enabled(false);
        scene.rebuild_bvh();
        let ray = Ray::new(Pt3::new(0.0, 0.0, 4.0), Vec3::new(0.0, 0.0, -1.0));
        assert!(scene.intersect_ray(&ray, f32::INFINITY).is_none());
    }

    #[test]
    fn test_world_triangle_resolution() {
        let scene = scene_with_floor();
        let ray = Ray::new(Pt3::new(0.5, 0.5, 4.0), Vec3::new(0.0, 0.0, -1.0));
        let hit = scene.intersect_ray(&ray, f32::INFINITY).unwrap();
        let world = scene.world_triangle(&hit.triangle);
        assert_relative_eq!(world.plane.normal.z.abs(), 1.0, epsilon = 1e-5);
        assert_relative_eq!(world.plane.signed_distance(Pt3::origin()), 0.0, epsilon = 1e-5);
    }
}
