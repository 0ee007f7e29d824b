//! Bounding volume hierarchies
//!
//! Two levels: a 4-wide BVH over the triangles of each mesh, with the
//! four child boxes of a node tested against a ray in one SIMD slab
//! test, and a binary BVH over object world bounds rebuilt per frame.

use ef_core::{Aabb, Pt3, Ray};
use wide::f32x4;

use crate::mesh::Triangle;

/// Triangles per leaf before a node stops splitting.
const LEAF_SIZE: usize = 4;

// ============ 4-wide Mesh BVH ============

/// A child slot of a 4-wide node: an inner node, a triangle range, or
/// empty.
#[derive(Debug, Clone, Copy)]
struct Child {
    /// Node index when `count == 0`, else first entry of a triangle
    /// range in the primitive list.
    index: u32,
    /// 0 for inner nodes, range length for leaves.
    count: u32,
}

impl Child {
    const EMPTY: Child = Child {
        index: u32::MAX,
        count: 0,
    };

    #[inline]
    fn is_empty(&self) -> bool {
        self.index == u32::MAX && self.count == 0
    }
}

/// One 4-wide node: the four child AABBs in SoA layout for the SIMD slab
/// test, plus the child references.
#[derive(Debug, Clone)]
struct Node4 {
    min_x: f32x4,
    min_y: f32x4,
    min_z: f32x4,
    max_x: f32x4,
    max_y: f32x4,
    max_z: f32x4,
    children: [Child; 4],
}

/// A static 4-wide AABB BVH over mesh triangles.
#[derive(Debug, Default)]
pub struct MeshBvh {
    nodes: Vec<Node4>,
    /// Triangle indices, permuted so each leaf is a contiguous range.
    primitives: Vec<u32>,
}

/// A ray/triangle hit inside one mesh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshHit {
    pub t: f32,
    pub triangle: u32,
}

struct BuildPrim {
    triangle: u32,
    aabb: Aabb,
    centroid: Pt3,
}

impl MeshBvh {
    /// Builds the hierarchy by repeated largest-axis median splits.
    pub fn build(vertices: &[Pt3], triangles: &[Triangle]) -> Self {
        let mut prims: Vec<BuildPrim> = triangles
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let aabb = Aabb::from_points(t.vertices.iter().map(|&v| vertices[v as usize]));
                BuildPrim {
                    triangle: i as u32,
                    centroid: aabb.center(),
                    aabb,
                }
            })
            .collect();

        let mut bvh = MeshBvh {
            nodes: Vec::new(),
            primitives: Vec::new(),
        };
        if prims.is_empty() {
            return bvh;
        }
        let count = prims.len();
        bvh.build_node(&mut prims, 0, count);
        bvh
    }

    /// Builds the node covering `prims[start..end]`, returning its index.
    fn build_node(&mut self, prims: &mut [BuildPrim], start: usize, end: usize) -> u32 {
        // Split into up to four contiguous chunks: one median split, then
        // a median split of each half.
        let mut chunks = [(start, end), (0, 0), (0, 0), (0, 0)];
        let mut num_chunks = 1;
        let (l, r) = split_range(prims, start, end);
        if r.1 > r.0 {
            chunks[0] = l;
            chunks[1] = r;
            num_chunks = 2;
            let (ll, lr) = split_range(prims, l.0, l.1);
            let (rl, rr) = split_range(prims, r.0, r.1);
            if lr.1 > lr.0 && rr.1 > rr.0 {
                chunks = [ll, lr, rl, rr];
                num_chunks = 4;
            }
        }

        let node_index = self.nodes.len() as u32;
        self.nodes.push(Node4 {
            min_x: f32x4::splat(f32::INFINITY),
            min_y: f32x4::splat(f32::INFINITY),
            min_z: f32x4::splat(f32::INFINITY),
            max_x: f32x4::splat(f32::NEG_INFINITY),
            max_y: f32x4::splat(f32::NEG_INFINITY),
            max_z: f32x4::splat(f32::NEG_INFINITY),
            children: [Child::EMPTY; 4],
        });

        let mut min_x = [f32::INFINITY; 4];
        let mut min_y = [f32::INFINITY; 4];
        let mut min_z = [f32::INFINITY; 4];
        let mut max_x = [f32::NEG_INFINITY; 4];
        let mut max_y = [f32::NEG_INFINITY; 4];
        let mut max_z = [f32::NEG_INFINITY; 4];
        let mut children = [Child::EMPTY; 4];

        for (slot, &(chunk_start, chunk_end)) in chunks[..num_chunks].iter().enumerate() {
            let mut aabb = Aabb::empty();
            for prim in &prims[chunk_start..chunk_end] {
                aabb = aabb.union(&prim.aabb);
            }
            min_x[slot] = aabb.min.x;
            min_y[slot] = aabb.min.y;
            min_z[slot] = aabb.min.z;
            max_x[slot] = aabb.max.x;
            max_y[slot] = aabb.max.y;
            max_z[slot] = aabb.max.z;

            if chunk_end - chunk_start <= LEAF_SIZE {
                let first = self.primitives.len() as u32;
                self.primitives
                    .extend(prims[chunk_start..chunk_end].iter().map(|p| p.triangle));
                children[slot] = Child {
                    index: first,
                    count: (chunk_end - chunk_start) as u32,
                };
            } else {
                let child = self.build_node(prims, chunk_start, chunk_end);
                children[slot] = Child {
                    index: child,
                    count: 0,
                };
            }
        }

        let node = &mut self.nodes[node_index as usize];
        node.min_x = f32x4::from(min_x);
        node.min_y = f32x4::from(min_y);
        node.min_z = f32x4::from(min_z);
        node.max_x = f32x4::from(max_x);
        node.max_y = f32x4::from(max_y);
        node.max_z = f32x4::from(max_z);
        node.children = children;
        node_index
    }

    /// Closest hit along an object-space ray within `t_max`.
    pub fn intersect(&self, vertices: &[Pt3], triangles: &[Triangle], ray: &Ray, t_max: f32) -> Option<MeshHit> {
        self.traverse(vertices, triangles, ray, t_max, false)
    }

    /// True if anything is hit along the ray within `t_max`.
    pub fn intersect_any(&self, vertices: &[Pt3], triangles: &[Triangle], ray: &Ray, t_max: f32) -> bool {
        self.traverse(vertices, triangles, ray, t_max, true).is_some()
    }

    fn traverse(
        &self,
        vertices: &[Pt3],
        triangles: &[Triangle],
        ray: &Ray,
        t_max: f32,
        any_hit: bool,
    ) -> Option<MeshHit> {
        if self.nodes.is_empty() || t_max <= 0.0 {
            return None;
        }

        let inv = [
            1.0 / ray.direction.x,
            1.0 / ray.direction.y,
            1.0 / ray.direction.z,
        ];
        let origin = [ray.origin.x, ray.origin.y, ray.origin.z];

        let mut best: Option<MeshHit> = None;
        let mut best_t = t_max;
        let mut stack = [0u32; 64];
        let mut stack_len = 1usize;
        stack[0] = 0;

        while stack_len > 0 {
            stack_len -= 1;
            let node = &self.nodes[stack[stack_len] as usize];

            // Slab test of the four child boxes at once.
            let (near_x, far_x) = if inv[0] >= 0.0 {
                (node.min_x, node.max_x)
            } else {
                (node.max_x, node.min_x)
            };
            let (near_y, far_y) = if inv[1] >= 0.0 {
                (node.min_y, node.max_y)
            } else {
                (node.max_y, node.min_y)
            };
            let (near_z, far_z) = if inv[2] >= 0.0 {
                (node.min_z, node.max_z)
            } else {
                (node.max_z, node.min_z)
            };
            let t0x = (near_x - f32x4::splat(origin[0])) * f32x4::splat(inv[0]);
            let t1x = (far_x - f32x4::splat(origin[0])) * f32x4::splat(inv[0]);
            let t0y = (near_y - f32x4::splat(origin[1])) * f32x4::splat(inv[1]);
            let t1y = (far_y - f32x4::splat(origin[1])) * f32x4::splat(inv[1]);
            let t0z = (near_z - f32x4::splat(origin[2])) * f32x4::splat(inv[2]);
            let t1z = (far_z - f32x4::splat(origin[2])) * f32x4::splat(inv[2]);
            let t_enter = t0x.max(t0y).max(t0z).max(f32x4::splat(0.0));
            let t_exit = t1x.min(t1y).min(t1z).min(f32x4::splat(best_t));
            let enter = t_enter.to_array();
            let exit = t_exit.to_array();

            for slot in 0..4 {
                if enter[slot] > exit[slot] {
                    continue;
                }
                let child = node.children[slot];
                if child.is_empty() {
                    continue;
                }
                if child.count == 0 {
                    if stack_len < stack.len() {
                        stack[stack_len] = child.index;
                        stack_len += 1;
                    }
                    continue;
                }
                let first = child.index as usize;
                for &triangle_index in &self.primitives[first..first + child.count as usize] {
                    let t = &triangles[triangle_index as usize];
                    let v0 = vertices[t.vertices[0] as usize];
                    let v1 = vertices[t.vertices[1] as usize];
                    let v2 = vertices[t.vertices[2] as usize];
                    if let Some(hit_t) = ray.intersects_triangle(v0, v1, v2) {
                        if hit_t < best_t {
                            best_t = hit_t;
                            best = Some(MeshHit {
                                t: hit_t,
                                triangle: triangle_index,
                            });
                            if any_hit {
                                return best;
                            }
                        }
                    }
                }
            }
        }
        best
    }

    pub fn size_in_bytes(&self) -> usize {
        self.nodes.len() * std::mem::size_of::<Node4>() + self.primitives.len() * 4
    }
}

/// Splits `prims[start..end]` at the centroid median of the longest axis.
/// A range too small to split returns an empty right half.
fn split_range(prims: &mut [BuildPrim], start: usize, end: usize) -> ((usize, usize), (usize, usize)) {
    let count = end - start;
    if count <= LEAF_SIZE {
        return ((start, end), (end, end));
    }
    let mut centroid_bounds = Aabb::empty();
    for prim in &prims[start..end] {
        centroid_bounds.grow(prim.centroid);
    }
    let axis = centroid_bounds.longest_axis();
    let mid = start + count / 2;
    prims[start..end].select_nth_unstable_by(count / 2, |a, b| {
        a.centroid[axis]
            .partial_cmp(&b.centroid[axis])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ((start, mid), (mid, end))
}

// ============ Object BVH ============

/// A binary BVH over object world-space bounds, rebuilt each frame.
#[derive(Debug, Default)]
pub struct ObjectBvh {
    nodes: Vec<ObjectNode>,
}

#[derive(Debug, Clone, Copy)]
enum ObjectNode {
    Inner { aabb: Aabb, left: u32, right: u32 },
    Leaf { aabb: Aabb, object: u32 },
}

impl ObjectBvh {
    /// Builds over (world AABB, object index) pairs.
    pub fn build(mut objects: Vec<(Aabb, u32)>) -> Self {
        let mut bvh = ObjectBvh { nodes: Vec::new() };
        if objects.is_empty() {
            return bvh;
        }
        let count = objects.len();
        bvh.build_node(&mut objects, 0, count);
        bvh
    }

    fn build_node(&mut self, objects: &mut [(Aabb, u32)], start: usize, end: usize) -> u32 {
        let index = self.nodes.len() as u32;
        if end - start == 1 {
            self.nodes.push(ObjectNode::Leaf {
                aabb: objects[start].0,
                object: objects[start].1,
            });
            return index;
        }

        let mut aabb = Aabb::empty();
        for (object_aabb, _) in &objects[start..end] {
            aabb = aabb.union(object_aabb);
        }
        let axis = aabb.longest_axis();
        let mid = start + (end - start) / 2;
        objects[start..end].select_nth_unstable_by((end - start) / 2, |a, b| {
            a.0.center()[axis]
                .partial_cmp(&b.0.center()[axis])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        self.nodes.push(ObjectNode::Inner {
            aabb,
            left: 0,
            right: 0,
        });
        let left = self.build_node(objects, start, mid);
        let right = self.build_node(objects, mid, end);
        if let ObjectNode::Inner {
            left: l, right: r, ..
        } = &mut self.nodes[index as usize]
        {
            *l = left;
            *r = right;
        }
        index
    }

    /// Collects the indices of objects whose bounds the ray enters within
    /// `t_max`.
    pub fn candidates(&self, ray: &Ray, t_max: f32, out: &mut Vec<u32>) {
        out.clear();
        if self.nodes.is_empty() {
            return;
        }
        let mut stack = [0u32; 64];
        let mut stack_len = 1usize;
        stack[0] = 0;
        while stack_len > 0 {
            stack_len -= 1;
            match &self.nodes[stack[stack_len] as usize] {
                ObjectNode::Leaf { aabb, object } => {
                    if aabb.intersects_ray(ray, t_max) {
                        out.push(*object);
                    }
                }
                ObjectNode::Inner { aabb, left, right } => {
                    if aabb.intersects_ray(ray, t_max) && stack_len + 2 <= stack.len() {
                        stack[stack_len] = *left;
                        stack[stack_len + 1] = *right;
                        stack_len += 2;
                    }
                }
            }
        }
    }
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;
    use ef_core::Vec3;

    fn grid_mesh(n: usize) -> (Vec<Pt3>, Vec<Triangle>) {
        // An n×n grid of quads in the z=0 plane, two triangles each.
        let mut vertices = Vec::new();
        for y in 0..=n {
            for x in 0..=n {
                vertices.push(Pt3::new(x as f32, y as f32, 0.0));
            }
        }
        let stride = (n + 1) as u32;
        let mut triangles = Vec::new();
        for y in 0..n as u32 {
            for x in 0..n as u32 {
                let v0 = y * stride + x;
                triangles.push(Triangle::new([v0, v0 + 1, v0 + stride + 1], 0));
                triangles.push(Triangle::new([v0, v0 + stride + 1, v0 + stride], 0));
            }
        }
        (vertices, triangles)
    }

    #[test]
    fn test_closest_hit_matches_brute_force() {
        let (vertices, triangles) = grid_mesh(8);
        let bvh = MeshBvh::build(&vertices, &triangles);
        let ray = Ray::new(Pt3::new(3.3, 4.7, 5.0), Vec3::new(0.0, 0.0, -1.0));

        let hit = bvh.intersect(&vertices, &triangles, &ray, f32::INFINITY).unwrap();
        assert!((hit.t - 5.0).abs() < 1e-4);

        let brute = triangles
            .iter()
            .enumerate()
            .filter_map(|(i, t)| {
                ray.intersects_triangle(
                    vertices[t.vertices[0] as usize],
                    vertices[t.vertices[1] as usize],
                    vertices[t.vertices[2] as usize],
                )
                .map(|t_hit| (i as u32, t_hit))
            })
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
            .unwrap();
        assert_eq!(hit.triangle, brute.0);
    }

    #[test]
    fn test_t_max_clips() {
        let (vertices, triangles) = grid_mesh(4);
        let bvh = MeshBvh::build(&vertices, &triangles);
        let ray = Ray::new(Pt3::new(1.5, 1.5, 5.0), Vec3::new(0.0, 0.0, -1.0));
        assert!(bvh.intersect(&vertices, &triangles, &ray, 4.0).is_none());
        assert!(bvh.intersect(&vertices, &triangles, &ray, 6.0).is_some());
        assert!(!bvh.intersect_any(&vertices, &triangles, &ray, 0.0));
    }

    #[test]
    fn test_empty_mesh_never_hits() {
        let bvh = MeshBvh::build(&[], &[]);
        let ray = Ray::new(Pt3::origin(), Vec3::new(0.0, 0.0, 1.0));
        assert!(bvh.intersect(&[], &[], &ray, f32::INFINITY).is_none());
    }

    #[test]
    fn test_object_bvh_candidates() {
        let boxes = vec![
            (
                Aabb::from_points([Pt3::new(0.0, 0.0, 0.0), Pt3::new(1.0, 1.0, 1.0)]),
                0,
            ),
            (
                Aabb::from_points([Pt3::new(10.0, 0.0, 0.0), Pt3::new(11.0, 1.0, 1.0)]),
                1,
            ),
            (
                Aabb::from_points([Pt3::new(20.0, 0.0, 0.0), Pt3::new(21.0, 1.0, 1.0)]),
                2,
            ),
        ];
        let bvh = ObjectBvh::build(boxes);
        let ray = Ray::new(Pt3::new(-5.0, 0.5, 0.5), Vec3::new(1.0, 0.0, 0.0));
        let mut out = Vec::new();
        bvh.candidates(&ray, f32::INFINITY, &mut out);
        out.sort_unstable();
        assert_eq!(out, vec![0, 1, 2]);

        bvh.candidates(&ray, 8.0, &mut out);
        assert_eq!(out, vec![0]);

        let miss = Ray::new(Pt3::new(-5.0, 5.0, 0.5), Vec3::new(1.0, 0.0, 0.0));
        bvh.candidates(&miss, f32::INFINITY, &mut out);
        assert!(out.is_empty());
    }
}
