//! Geometric primitives for ray tracing
//!
//! Rays, planes, spheres, axis-aligned boxes, rigid transforms with
//! non-uniform scale, and the intersection routines the propagation
//! engine is built on. Everything is single-precision over nalgebra
//! types.

use nalgebra::{Matrix3, Point3, Vector3};

pub type Vec3 = Vector3<f32>;
pub type Pt3 = Point3<f32>;
pub type Mat3 = Matrix3<f32>;

/// Tolerance below which geometric quantities are treated as degenerate.
pub const GEOM_EPSILON: f32 = 1e-6;

// ============ Ray ============

/// A ray with an origin and a unit direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Pt3,
    pub direction: Vec3,
}

impl Ray {
    #[inline]
    pub fn new(origin: Pt3, direction: Vec3) -> Self {
        Self { origin, direction }
    }

    /// Point at parameter `t` along the ray.
    #[inline]
    pub fn at(&self, t: f32) -> Pt3 {
        self.origin + self.direction * t
    }

    /// Ray/triangle intersection (Möller–Trumbore, two-sided).
    /// Returns the hit parameter if the ray pierces the triangle at t > 0.
    pub fn intersects_triangle(&self, v0: Pt3, v1: Pt3, v2: Pt3) -> Option<f32> {
        let e1 = v1 - v0;
        let e2 = v2 - v0;
        let p = self.direction.cross(&e2);
        let det = e1.dot(&p);
        if det.abs() < GEOM_EPSILON {
            return None;
        }
        let inv_det = 1.0 / det;
        let s = self.origin - v0;
        let u = s.dot(&p) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return None;
        }
        let q = s.cross(&e1);
        let v = self.direction.dot(&q) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }
        let t = e2.dot(&q) * inv_det;
        (t > GEOM_EPSILON).then_some(t)
    }

    /// Nearest positive intersection parameter with a sphere, if any.
    /// An origin inside the sphere hits the far surface.
    pub fn intersects_sphere(&self, sphere: &Sphere) -> Option<f32> {
        let to_center = sphere.center - self.origin;
        let proj = to_center.dot(&self.direction);
        let d2 = to_center.norm_squared() - proj * proj;
        let r2 = sphere.radius * sphere.radius;
        if d2 > r2 {
            return None;
        }
        let half = (r2 - d2).sqrt();
        let near = proj - half;
        let far = proj + half;
        if near > GEOM_EPSILON {
            Some(near)
        } else if far > GEOM_EPSILON {
            Some(far)
        } else {
            None
        }
    }
}

// ============ Plane ============

/// An oriented plane `n·x + d = 0` with unit normal `n`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub offset: f32,
}

impl Plane {
    #[inline]
    pub fn new(normal: Vec3, offset: f32) -> Self {
        Self { normal, offset }
    }

    /// Plane through a point with the given unit normal.
    #[inline]
    pub fn from_point_normal(point: Pt3, normal: Vec3) -> Self {
        Self {
            normal,
            offset: -normal.dot(&point.coords),
        }
    }

    /// Plane through three points, normal by the right-hand winding.
    /// Degenerate triangles produce a zero normal.
    pub fn from_points(a: Pt3, b: Pt3, c: Pt3) -> Self {
        let n = (b - a).cross(&(c - a));
        let len = n.norm();
        let normal = if len > GEOM_EPSILON { n / len } else { Vec3::zeros() };
        Self::from_point_normal(a, normal)
    }

    /// Signed distance from a point to the plane (positive on the normal
    /// side).
    #[inline]
    pub fn signed_distance(&self, p: Pt3) -> f32 {
        self.normal.dot(&p.coords) + self.offset
    }

    /// Mirror image of a point across the plane.
    #[inline]
    pub fn reflect_point(&self, p: Pt3) -> Pt3 {
        p - self.normal * (2.0 * self.signed_distance(p))
    }

    /// Mirror image of a direction across the plane.
    #[inline]
    pub fn reflect_vector(&self, v: Vec3) -> Vec3 {
        v - self.normal * (2.0 * self.normal.dot(&v))
    }

    /// The plane with its orientation flipped.
    #[inline]
    pub fn flipped(&self) -> Plane {
        Plane {
            normal: -self.normal,
            offset: -self.offset,
        }
    }

    /// An arbitrary point on the plane.
    #[inline]
    pub fn point(&self) -> Pt3 {
        Pt3::origin() - self.normal * self.offset
    }
}

// ============ Sphere ============

/// A sphere; detectors and object bounds are spheres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sphere {
    pub center: Pt3,
    pub radius: f32,
}

impl Sphere {
    #[inline]
    pub fn new(center: Pt3, radius: f32) -> Self {
        Self { center, radius }
    }

    #[inline]
    pub fn contains(&self, p: Pt3) -> bool {
        (p - self.center).norm_squared() <= self.radius * self.radius
    }

    /// Smallest sphere enclosing both spheres.
    pub fn union(&self, other: &Sphere) -> Sphere {
        let d = (other.center - self.center).norm();
        if d + other.radius <= self.radius {
            return *self;
        }
        if d + self.radius <= other.radius {
            return *other;
        }
        let radius = 0.5 * (d + self.radius + other.radius);
        let center = self.center + (other.center - self.center) * ((radius - self.radius) / d);
        Sphere { center, radius }
    }
}

// ============ Axis-Aligned Bounding Box ============

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Pt3,
    pub max: Pt3,
}

impl Aabb {
    /// An empty box that unions as the identity.
    pub fn empty() -> Self {
        Self {
            min: Pt3::new(f32::INFINITY, f32::INFINITY, f32::INFINITY),
            max: Pt3::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
        }
    }

    pub fn from_points(points: impl IntoIterator<Item = Pt3>) -> Self {
        let mut aabb = Self::empty();
        for p in points {
            aabb.grow(p);
        }
        aabb
    }

    pub fn grow(&mut self, p: Pt3) {
        self.min = Pt3::from(self.min.coords.inf(&p.coords));
        self.max = Pt3::from(self.max.coords.sup(&p.coords));
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: Pt3::from(self.min.coords.inf(&other.min.coords)),
            max: Pt3::from(self.max.coords.sup(&other.max.coords)),
        }
    }

    #[inline]
    pub fn center(&self) -> Pt3 {
        nalgebra::center(&self.min, &self.max)
    }

    #[inline]
    pub fn extent(&self) -> Vec3 {
        self.max - self.min
    }

    /// Index of the widest axis.
    pub fn longest_axis(&self) -> usize {
        let e = self.extent();
        if e.x >= e.y && e.x >= e.z {
            0
        } else if e.y >= e.z {
            1
        } else {
            2
        }
    }

    /// Bounding sphere of the box.
    pub fn bounding_sphere(&self) -> Sphere {
        let center = self.center();
        Sphere::new(center, (self.max - center).norm())
    }

    /// Slab test: true if the ray enters the box within `[0, t_max]`.
    pub fn intersects_ray(&self, ray: &Ray, t_max: f32) -> bool {
        let mut t0: f32 = 0.0;
        let mut t1 = t_max;
        for axis in 0..3 {
            let inv = 1.0 / ray.direction[axis];
            let mut near = (self.min[axis] - ray.origin[axis]) * inv;
            let mut far = (self.max[axis] - ray.origin[axis]) * inv;
            if inv < 0.0 {
                std::mem::swap(&mut near, &mut far);
            }
            t0 = t0.max(near);
            t1 = t1.min(far);
            if t0 > t1 {
                return false;
            }
        }
        true
    }
}

// ============ Rigid Transform ============

/// Position, orthonormal rotation and per-axis scale mapping object space
/// to world space: `world = R·(s ⊙ local) + p`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform3 {
    pub position: Vec3,
    pub rotation: Mat3,
    pub scale: Vec3,
}

impl Default for Transform3 {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            rotation: Mat3::identity(),
            scale: Vec3::new(1.0, 1.0, 1.0),
        }
    }
}

impl Transform3 {
    pub fn new(position: Vec3, rotation: Mat3, scale: Vec3) -> Self {
        Self {
            position,
            rotation: orthonormalized(rotation),
            scale,
        }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Replaces the rotation, re-orthonormalising it first.
    pub fn set_rotation(&mut self, rotation: Mat3) {
        self.rotation = orthonormalized(rotation);
    }

    #[inline]
    pub fn to_world_point(&self, p: Pt3) -> Pt3 {
        Pt3::from(self.rotation * p.coords.component_mul(&self.scale) + self.position)
    }

    #[inline]
    pub fn to_local_point(&self, p: Pt3) -> Pt3 {
        Pt3::from(
            (self.rotation.transpose() * (p.coords - self.position)).component_div(&self.scale),
        )
    }

    /// Transforms a direction into world space. Not length-preserving
    /// under non-uniform scale.
    #[inline]
    pub fn to_world_vector(&self, v: Vec3) -> Vec3 {
        self.rotation * v.component_mul(&self.scale)
    }

    #[inline]
    pub fn to_local_vector(&self, v: Vec3) -> Vec3 {
        (self.rotation.transpose() * v).component_div(&self.scale)
    }

    /// Transforms a plane into world space, renormalising the normal.
    pub fn to_world_plane(&self, plane: &Plane) -> Plane {
        let world_point = self.to_world_point(plane.point());
        // Normals transform by the inverse-transpose: R·(n ⊘ s).
        let n = self.rotation * plane.normal.component_div(&self.scale);
        let len = n.norm();
        let normal = if len > GEOM_EPSILON { n / len } else { plane.normal };
        Plane::from_point_normal(world_point, normal)
    }

    /// Transforms a world-space ray into object space. The returned
    /// direction is renormalised; the caller must recompute world
    /// distances from world-space hit points since scale changes the
    /// parameter pacing.
    pub fn to_local_ray(&self, ray: &Ray) -> Ray {
        let origin = self.to_local_point(ray.origin);
        let direction = self.to_local_vector(ray.direction);
        let len = direction.norm();
        Ray::new(
            origin,
            if len > GEOM_EPSILON { direction / len } else { direction },
        )
    }
}

/// Gram-Schmidt orthonormalisation of a rotation matrix.
pub fn orthonormalized(m: Mat3) -> Mat3 {
    let x = m.column(0).normalize();
    let mut y = m.column(1).into_owned();
    y -= x * x.dot(&y);
    let y = y.normalize();
    let z = x.cross(&y);
    Mat3::from_columns(&[x, y, z])
}

/// An orthonormal basis whose third column is the given unit direction.
/// Used to orient cone-sampled directions.
pub fn plane_basis(direction: Vec3) -> Mat3 {
    let up = if direction.x.abs() < 0.577 {
        Vec3::new(1.0, 0.0, 0.0)
    } else {
        Vec3::new(0.0, 1.0, 0.0)
    };
    let x = up.cross(&direction).normalize();
    let y = direction.cross(&x);
    Mat3::from_columns(&[x, y, direction])
}

/// Angle in radians between two directions, safe against rounding at the
/// parallel/antiparallel extremes.
pub fn angle_between(a: Vec3, b: Vec3) -> f32 {
    let cos = a.normalize().dot(&b.normalize());
    cos.clamp(-1.0, 1.0).acos()
}

/// Projects `v` onto the plane orthogonal to unit vector `n`.
#[inline]
pub fn project_to_plane(v: Vec3, n: Vec3) -> Vec3 {
    v - n * v.dot(&n)
}

/// Barycentric coordinates of `p` with respect to triangle `(a, b, c)`,
/// computed in the triangle's plane.
pub fn barycentric(a: Pt3, b: Pt3, c: Pt3, p: Pt3) -> Vec3 {
    let v0 = b - a;
    let v1 = c - a;
    let v2 = p - a;
    let d00 = v0.dot(&v0);
    let d01 = v0.dot(&v1);
    let d11 = v1.dot(&v1);
    let d20 = v2.dot(&v0);
    let d21 = v2.dot(&v1);
    let denom = d00 * d11 - d01 * d01;
    if denom.abs() < GEOM_EPSILON {
        return Vec3::new(1.0, 0.0, 0.0);
    }
    let v = (d11 * d20 - d01 * d21) / denom;
    let w = (d00 * d21 - d01 * d20) / denom;
    Vec3::new(1.0 - v - w, v, w)
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ray_triangle_hit() {
        let ray = Ray::new(Pt3::new(0.25, 0.25, 1.0), Vec3::new(0.0, 0.0, -1.0));
        let t = ray
            .intersects_triangle(
                Pt3::new(0.0, 0.0, 0.0),
                Pt3::new(1.0, 0.0, 0.0),
                Pt3::new(0.0, 1.0, 0.0),
            )
            .unwrap();
        assert_relative_eq!(t, 1.0);
    }

    #[test]
    fn test_ray_triangle_miss() {
        let ray = Ray::new(Pt3::new(2.0, 2.0, 1.0), Vec3::new(0.0, 0.0, -1.0));
        assert!(ray
            .intersects_triangle(
                Pt3::new(0.0, 0.0, 0.0),
                Pt3::new(1.0, 0.0, 0.0),
                Pt3::new(0.0, 1.0, 0.0),
            )
            .is_none());
    }

    #[test]
    fn test_ray_sphere() {
        let ray = Ray::new(Pt3::new(0.0, 0.0, -5.0), Vec3::new(0.0, 0.0, 1.0));
        let sphere = Sphere::new(Pt3::origin(), 1.0);
        assert_relative_eq!(ray.intersects_sphere(&sphere).unwrap(), 4.0);

        // Origin inside hits the far surface.
        let inside = Ray::new(Pt3::origin(), Vec3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(inside.intersects_sphere(&sphere).unwrap(), 1.0);
    }

    #[test]
    fn test_plane_reflection() {
        let plane = Plane::from_point_normal(Pt3::origin(), Vec3::new(0.0, 0.0, 1.0));
        let image = plane.reflect_point(Pt3::new(1.0, 2.0, 3.0));
        assert_relative_eq!(image.z, -3.0);
        assert_relative_eq!(image.x, 1.0);
        assert_relative_eq!(plane.signed_distance(Pt3::new(0.0, 0.0, 2.0)), 2.0);
    }

    #[test]
    fn test_aabb_slab() {
        let aabb = Aabb::from_points([Pt3::new(-1.0, -1.0, -1.0), Pt3::new(1.0, 1.0, 1.0)]);
        let hit = Ray::new(Pt3::new(0.0, 0.0, -5.0), Vec3::new(0.0, 0.0, 1.0));
        assert!(aabb.intersects_ray(&hit, f32::INFINITY));
        assert!(!aabb.intersects_ray(&hit, 1.0));
        let miss = Ray::new(Pt3::new(5.0, 0.0, -5.0), Vec3::new(0.0, 0.0, 1.0));
        assert!(!aabb.intersects_ray(&miss, f32::INFINITY));
    }

    #[test]
    fn test_transform_round_trip() {
        let mut t = Transform3::default();
        t.position = Vec3::new(1.0, 2.0, 3.0);
        t.scale = Vec3::new(2.0, 1.0, 0.5);
        t.set_rotation(Mat3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0));
        let p = Pt3::new(0.3, -0.7, 1.1);
        let back = t.to_local_point(t.to_world_point(p));
        assert_relative_eq!(back.x, p.x, epsilon = 1e-5);
        assert_relative_eq!(back.y, p.y, epsilon = 1e-5);
        assert_relative_eq!(back.z, p.z, epsilon = 1e-5);
    }

    #[test]
    fn test_orthonormalize() {
        let skewed = Mat3::new(2.0, 0.1, 0.0, 0.0, 3.0, 0.0, 0.0, 0.0, 1.5);
        let r = orthonormalized(skewed);
        let should_be_identity = r.transpose() * r;
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(should_be_identity[(i, j)], expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_plane_basis_columns_orthonormal() {
        let basis = plane_basis(Vec3::new(0.0, 1.0, 0.0));
        assert_relative_eq!(basis.column(2).dot(&Vec3::new(0.0, 1.0, 0.0)), 1.0);
        assert_relative_eq!(basis.column(0).dot(&basis.column(1)), 0.0, epsilon = 1e-6);
        assert_relative_eq!(basis.column(0).norm(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_barycentric_center() {
        let bary = barycentric(
            Pt3::new(0.0, 0.0, 0.0),
            Pt3::new(1.0, 0.0, 0.0),
            Pt3::new(0.0, 1.0, 0.0),
            Pt3::new(0.25, 0.25, 0.0),
        );
        assert_relative_eq!(bary.x, 0.5, epsilon = 1e-6);
        assert_relative_eq!(bary.y, 0.25, epsilon = 1e-6);
        assert_relative_eq!(bary.z, 0.25, epsilon = 1e-6);
    }
}
