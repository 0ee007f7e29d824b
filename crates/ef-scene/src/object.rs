//! Scene objects
//!
//! An object instances a shared mesh into the scene with a rigid
//! transform, velocity, enabled flag and opaque user data. World-space
//! bounds are derived lazily from the transform.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ef_core::{Aabb, Mat3, Pt3, Sphere, Transform3, Vec3};

use crate::mesh::Mesh;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// A mesh instance in the scene.
#[derive(Debug, Clone)]
pub struct SceneObject {
    id: u64,
    mesh: Arc<Mesh>,
    transform: Transform3,
    velocity: Vec3,
    enabled: bool,
    user_data: u64,
    world_sphere: Sphere,
}

impl SceneObject {
    pub fn new(mesh: Arc<Mesh>) -> Self {
        Self::with_transform(mesh, Transform3::default())
    }

    pub fn with_transform(mesh: Arc<Mesh>, transform: Transform3) -> Self {
        let mut object = Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            mesh,
            transform,
            velocity: Vec3::zeros(),
            enabled: true,
            user_data: 0,
            world_sphere: Sphere::new(Pt3::origin(), 0.0),
        };
        object.update_bounds();
        object
    }

    /// Stable identity used by path IDs and caches.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    pub fn set_mesh(&mut self, mesh: Arc<Mesh>) {
        self.mesh = mesh;
        self.update_bounds();
    }

    #[inline]
    pub fn transform(&self) -> &Transform3 {
        &self.transform
    }

    pub fn set_transform(&mut self, transform: Transform3) {
        self.transform = Transform3::new(transform.position, transform.rotation, transform.scale);
        self.update_bounds();
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.transform.position = position;
        self.update_bounds();
    }

    /// Sets the orientation, orthonormalising it first.
    pub fn set_orientation(&mut self, orientation: Mat3) {
        self.transform.set_rotation(orientation);
        self.update_bounds();
    }

    pub fn set_scale(&mut self, scale: Vec3) {
        self.transform.scale = scale;
        self.update_bounds();
    }

    #[inline]
    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    pub fn set_velocity(&mut self, velocity: Vec3) {
        self.velocity = velocity;
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[inline]
    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    pub fn set_user_data(&mut self, user_data: u64) {
        self.user_data = user_data;
    }

    /// World-space bounding sphere.
    #[inline]
    pub fn bounding_sphere(&self) -> &Sphere {
        &self.world_sphere
    }

    /// World-space AABB, from the transformed corners of the mesh bounds.
    pub fn world_aabb(&self) -> Aabb {
        let b = self.mesh.bounds();
        let corners = [
            Pt3::new(b.min.x, b.min.y, b.min.z),
            Pt3::new(b.max.x, b.min.y, b.min.z),
            Pt3::new(b.min.x, b.max.y, b.min.z),
            Pt3::new(b.max.x, b.max.y, b.min.z),
            Pt3::new(b.min.x, b.min.y, b.max.z),
            Pt3::new(b.max.x, b.min.y, b.max.z),
            Pt3::new(b.min.x, b.max.y, b.max.z),
            Pt3::new(b.max.x, b.max.y, b.max.z),
        ];
        Aabb::from_points(corners.map(|c| self.transform.to_world_point(c)))
    }

    fn update_bounds(&mut self) {
        let local = self.mesh.bounding_sphere();
        let scale = &self.transform.scale;
        let max_scale = scale.x.abs().max(scale.y.abs()).max(scale.z.abs());
        self.world_sphere = Sphere::new(
            self.transform.to_world_point(local.center),
            local.radius * max_scale,
        );
    }
}
