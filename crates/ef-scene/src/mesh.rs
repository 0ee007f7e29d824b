//! Immutable triangle meshes with diffraction graphs
//!
//! A mesh owns vertices, triangles, materials and the precomputed
//! diffraction edge graph, referenced by dense indices throughout. Meshes
//! are immutable once constructed and may be shared by many scene objects;
//! the per-mesh BVH is built at construction.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ef_core::{Aabb, EfError, EfResult, Plane, Pt3, Sphere, Vec3};

use crate::bvh::MeshBvh;
use crate::material::Material;

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(1);

// ============ Triangle ============

/// A mesh triangle: vertex and material indices, optional diffraction
/// edge per triangle edge, and the subdivision layout used to derive
/// diffuse patch IDs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    /// Indices into the mesh vertex array.
    pub vertices: [u32; 3],
    /// Index into the mesh material array.
    pub material: u32,
    /// Diffraction-edge index per triangle edge, if the edge diffracts.
    /// Edge `i` connects vertices `i` and `(i + 1) % 3`.
    pub edges: [Option<u32>; 3],
    /// The vertex the subdivision rows run away from.
    pub key_vertex: u32,
    /// Subdivision row count (≥ 1).
    pub rows: u32,
    /// Subdivision column count (≥ 1).
    pub cols: u32,
}

impl Triangle {
    pub fn new(vertices: [u32; 3], material: u32) -> Self {
        Self {
            vertices,
            material,
            edges: [None; 3],
            key_vertex: 0,
            rows: 1,
            cols: 1,
        }
    }

    #[inline]
    pub fn diffraction_edge(&self, edge: usize) -> Option<u32> {
        self.edges[edge]
    }

    /// The two vertex indices of triangle edge `edge`.
    #[inline]
    pub fn edge_vertices(&self, edge: usize) -> (u32, u32) {
        (self.vertices[edge], self.vertices[(edge + 1) % 3])
    }

    /// Deterministic patch ID for a barycentric coordinate, per the
    /// triangle's key-vertex/row/column subdivision. Diffuse path
    /// identity uses this so nearby hits share a path.
    pub fn patch_id(&self, bary: Vec3) -> u32 {
        let k = (self.key_vertex as usize) % 3;
        let e = (k + 1) % 3;
        let rows = self.rows.max(1);
        let cols = self.cols.max(1);
        let row = ((bary[k] * rows as f32).floor() as u32).min(rows - 1);
        let row_cols = ((cols as f32 * (rows - row) as f32 / rows as f32).ceil() as u32).max(1);
        let col = ((bary[e] * row_cols as f32).floor() as u32).min(row_cols - 1);
        cols * row + col
    }
}

// ============ Diffraction Graph ============

/// An edge of the diffraction graph: the shared edge of two triangles
/// whose planes form a wedge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffractionEdge {
    /// Mesh vertex indices of the edge endpoints.
    pub vertices: [u32; 2],
    /// The two incident triangles.
    pub triangles: [u32; 2],
    /// Which edge of each incident triangle this is.
    pub edge_index: [u16; 2],
    /// Oriented planes of the incident triangles, normals pointing out
    /// of the wedge.
    pub planes: [Plane; 2],
    /// Slice of the graph's flat neighbour table belonging to this edge.
    pub neighbor_offset: u32,
    pub neighbor_count: u32,
}

impl DiffractionEdge {
    /// Averaged outward normal of the wedge, used to offset diffraction
    /// points off the geometry.
    pub fn normal(&self) -> Vec3 {
        let n = self.planes[0].normal + self.planes[1].normal;
        let len = n.norm();
        if len > 1e-6 { n / len } else { self.planes[0].normal }
    }
}

/// The precomputed diffraction graph: edges plus one flat table of
/// neighbour edge indices shared by all edges.
#[derive(Debug, Clone, Default)]
pub struct DiffractionGraph {
    pub edges: Vec<DiffractionEdge>,
    pub neighbors: Vec<u32>,
}

impl DiffractionGraph {
    #[inline]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    #[inline]
    pub fn edge(&self, index: u32) -> &DiffractionEdge {
        &self.edges[index as usize]
    }

    /// Neighbour edge indices of an edge.
    pub fn neighbors_of(&self, edge: &DiffractionEdge) -> &[u32] {
        let start = edge.neighbor_offset as usize;
        let end = start + edge.neighbor_count as usize;
        &self.neighbors[start..end]
    }
}

// ============ Mesh ============

/// An immutable, shareable triangle mesh with materials, diffraction
/// graph, bounds and a prebuilt BVH.
#[derive(Debug)]
pub struct Mesh {
    id: u64,
    vertices: Vec<Pt3>,
    triangles: Vec<Triangle>,
    materials: Vec<Material>,
    graph: Option<DiffractionGraph>,
    bvh: MeshBvh,
    bounds: Aabb,
    bounding_sphere: Sphere,
}

impl Mesh {
    /// Builds a mesh, validating all indices and constructing the BVH and
    /// bounds. Meshes with no triangles are valid (and never hit).
    pub fn new(
        vertices: Vec<Pt3>,
        triangles: Vec<Triangle>,
        materials: Vec<Material>,
        graph: Option<DiffractionGraph>,
    ) -> EfResult<Arc<Self>> {
        let num_vertices = vertices.len() as u32;
        let num_materials = materials.len() as u32;
        let num_edges = graph.as_ref().map_or(0, |g| g.edges.len() as u32);

        for (i, triangle) in triangles.iter().enumerate() {
            if triangle.vertices.iter().any(|&v| v >= num_vertices) {
                return Err(EfError::InvalidParam(format!(
                    "triangle {i} references a vertex out of range"
                )));
            }
            if triangle.material >= num_materials {
                return Err(EfError::InvalidParam(format!(
                    "triangle {i} references material {} of {num_materials}",
                    triangle.material
                )));
            }
            if triangle.edges.iter().flatten().any(|&e| e >= num_edges) {
                return Err(EfError::InvalidParam(format!(
                    "triangle {i} references a diffraction edge out of range"
                )));
            }
        }
        if let Some(graph) = &graph {
            let num_triangles = triangles.len() as u32;
            let num_neighbors = graph.neighbors.len() as u32;
            for (i, edge) in graph.edges.iter().enumerate() {
                if edge.vertices.iter().any(|&v| v >= num_vertices)
                    || edge.triangles.iter().any(|&t| t >= num_triangles)
                {
                    return Err(EfError::InvalidParam(format!(
                        "diffraction edge {i} references geometry out of range"
                    )));
                }
                if edge.neighbor_offset + edge.neighbor_count > num_neighbors {
                    return Err(EfError::InvalidParam(format!(
                        "diffraction edge {i} neighbour slice out of range"
                    )));
                }
            }
            if graph.neighbors.iter().any(|&n| n >= num_edges) {
                return Err(EfError::InvalidParam(
                    "neighbour table references an edge out of range".into(),
                ));
            }
        }

        let bounds = Aabb::from_points(vertices.iter().copied());
        let bounding_sphere = if vertices.is_empty() {
            Sphere::new(Pt3::origin(), 0.0)
        } else {
            bounds.bounding_sphere()
        };
        let bvh = MeshBvh::build(&vertices, &triangles);

        Ok(Arc::new(Self {
            id: NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed),
            vertices,
            triangles,
            materials,
            graph,
            bvh,
            bounds,
            bounding_sphere,
        }))
    }

    /// Stable identity for cache keying.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    #[inline]
    pub fn vertex(&self, index: u32) -> Pt3 {
        self.vertices[index as usize]
    }

    #[inline]
    pub fn vertices(&self) -> &[Pt3] {
        &self.vertices
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    #[inline]
    pub fn triangle(&self, index: u32) -> &Triangle {
        &self.triangles[index as usize]
    }

    #[inline]
    pub fn triangles(&self) -> &[Triangle] {
        &self.triangles
    }

    /// Object-space corner positions of a triangle.
    #[inline]
    pub fn triangle_vertices(&self, index: u32) -> [Pt3; 3] {
        let t = &self.triangles[index as usize];
        [
            self.vertices[t.vertices[0] as usize],
            self.vertices[t.vertices[1] as usize],
            self.vertices[t.vertices[2] as usize],
        ]
    }

    #[inline]
    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    #[inline]
    pub fn material(&self, index: u32) -> &Material {
        &self.materials[index as usize]
    }

    #[inline]
    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    #[inline]
    pub fn diffraction_graph(&self) -> Option<&DiffractionGraph> {
        self.graph.as_ref()
    }

    #[inline]
    pub fn bvh(&self) -> &MeshBvh {
        &self.bvh
    }

    #[inline]
    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    #[inline]
    pub fn bounding_sphere(&self) -> &Sphere {
        &self.bounding_sphere
    }

    /// Approximate memory footprint, for statistics.
    pub fn size_in_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.vertices.len() * std::mem::size_of::<Pt3>()
            + self.triangles.len() * std::mem::size_of::<Triangle>()
            + self.materials.len() * std::mem::size_of::<Material>()
            + self.graph.as_ref().map_or(0, |g| {
                g.edges.len() * std::mem::size_of::<DiffractionEdge>() + g.neighbors.len() * 4
            })
            + self.bvh.size_in_bytes()
    }
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;
    use ef_core::FrequencyResponse;

    fn quad_mesh() -> Arc<Mesh> {
        let vertices = vec![
            Pt3::new(0.0, 0.0, 0.0),
            Pt3::new(1.0, 0.0, 0.0),
            Pt3::new(1.0, 1.0, 0.0),
            Pt3::new(0.0, 1.0, 0.0),
        ];
        let triangles = vec![
            Triangle::new([0, 1, 2], 0),
            Triangle::new([0, 2, 3], 0),
        ];
        let material = Material::new(
            FrequencyResponse::flat(1.0),
            FrequencyResponse::flat(0.0),
            FrequencyResponse::flat(0.0),
        );
        Mesh::new(vertices, triangles, vec![material], None).unwrap()
    }

    #[test]
    fn test_mesh_bounds() {
        let mesh = quad_mesh();
        assert_eq!(mesh.bounds().min, Pt3::new(0.0, 0.0, 0.0));
        assert_eq!(mesh.bounds().max, Pt3::new(1.0, 1.0, 0.0));
        assert!(mesh.bounding_sphere().radius > 0.7);
    }

    #[test]
    fn test_invalid_indices_rejected() {
        let vertices = vec![Pt3::origin()];
        let triangles = vec![Triangle::new([0, 1, 2], 0)];
        assert!(Mesh::new(vertices, triangles, vec![Material::default()], None).is_err());
    }

    #[test]
    fn test_patch_id_in_range() {
        let mut triangle = Triangle::new([0, 1, 2], 0);
        triangle.rows = 4;
        triangle.cols = 4;
        for &(u, v) in &[(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (0.3, 0.3), (0.1, 0.8)] {
            let bary = Vec3::new(u, v, 1.0 - u - v);
            let id = triangle.patch_id(bary);
            assert!(id < triangle.rows * triangle.cols, "id {id} for {bary:?}");
        }
    }

    #[test]
    fn test_patch_id_distinguishes_regions() {
        let mut triangle = Triangle::new([0, 1, 2], 0);
        triangle.rows = 8;
        triangle.cols = 8;
        let near_a = triangle.patch_id(Vec3::new(0.9, 0.05, 0.05));
        let near_b = triangle.patch_id(Vec3::new(0.05, 0.9, 0.05));
        assert_ne!(near_a, near_b);
    }

    #[test]
    fn test_mesh_ids_unique() {
        let a = quad_mesh();
        let b = quad_mesh();
        assert_ne!(a.id(), b.id());
    }
}
