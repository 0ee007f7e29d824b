//! SOUNDMESH binary container
//!
//! The preprocessed mesh interchange format: a 16-byte header (magic,
//! version, endianness, checksum) followed by a version-specific body.
//! Version 1 stores counts, materials, vertices, triangles, diffraction
//! edges and the flat neighbour table, choosing 32- or 64-bit indices per
//! count. Writers emit little-endian; readers accept either byte order.
//!
//! Loading validates the magic, version, endianness byte, checksum and
//! every byte count before any mesh is constructed, so a failed load
//! leaves nothing half-built.

use std::io::{Read, Write};
use std::sync::Arc;

use ef_core::{EfError, EfResult, Plane, Pt3, Vec3};

use crate::material::Material;
use crate::mesh::{DiffractionEdge, DiffractionGraph, Mesh, Triangle};

const MAGIC: &[u8; 9] = b"SOUNDMESH";
const HEADER_SIZE: usize = 16;
const FORMAT_VERSION: u8 = 1;

// ============ Save ============

/// Writes a mesh to a stream in format version 1 (little-endian), with
/// the checksum filled in.
pub fn save_mesh<W: Write>(mesh: &Mesh, writer: &mut W) -> EfResult<()> {
    let mut body = BodyWriter::default();

    let empty_graph = DiffractionGraph::default();
    let graph = mesh.diffraction_graph().unwrap_or(&empty_graph);

    let num_vertices = mesh.vertex_count() as u64;
    let num_triangles = mesh.triangle_count() as u64;
    let num_edges = graph.edges.len() as u64;
    let num_neighbors = graph.neighbors.len() as u64;
    let num_materials = mesh.material_count() as u64;

    body.put_u64(num_vertices);
    body.put_u64(num_triangles);
    body.put_u64(num_edges);
    body.put_u64(num_neighbors);
    body.put_u64(num_materials);

    let vertices_wide = num_vertices > u32::MAX as u64;
    let triangles_wide = num_triangles > u32::MAX as u64;
    let edges_wide = num_edges > u32::MAX as u64;
    let neighbors_wide = num_neighbors > u32::MAX as u64;
    let materials_wide = num_materials > u32::MAX as u64;

    for material in mesh.materials() {
        body.put_response(&material.reflectivity);
        body.put_response(&material.scattering);
        body.put_response(&material.transmission);
        for &channel in &material.color {
            body.put_f32(channel);
        }
    }

    for vertex in mesh.vertices() {
        body.put_f32(vertex.x);
        body.put_f32(vertex.y);
        body.put_f32(vertex.z);
    }

    for triangle in mesh.triangles() {
        for &v in &triangle.vertices {
            body.put_index(v as u64, vertices_wide);
        }
        for &edge in &triangle.edges {
            // Edge references are stored 1-biased; 0 means no edge.
            body.put_index(edge.map_or(0, |e| e as u64 + 1), edges_wide);
        }
        body.put_index(triangle.material as u64, materials_wide);
        body.put_u32(triangle.key_vertex);
        body.put_u32(triangle.rows);
        body.put_u32(triangle.cols);
    }

    for edge in &graph.edges {
        body.put_index(edge.vertices[0] as u64, vertices_wide);
        body.put_index(edge.vertices[1] as u64, vertices_wide);
        body.put_index(edge.triangles[0] as u64, triangles_wide);
        body.put_index(edge.triangles[1] as u64, triangles_wide);
        body.put_index(edge.neighbor_count as u64, neighbors_wide);
        body.put_index(edge.neighbor_offset as u64, neighbors_wide);
        body.put_u16(edge.edge_index[0]);
        body.put_u16(edge.edge_index[1]);
        for plane in &edge.planes {
            body.put_f32(plane.normal.x);
            body.put_f32(plane.normal.y);
            body.put_f32(plane.normal.z);
            body.put_f32(plane.offset);
        }
    }

    for &neighbor in &graph.neighbors {
        body.put_index(neighbor as u64, neighbors_wide);
    }

    let checksum = checksum(&body.bytes);
    let mut header = [0u8; HEADER_SIZE];
    header[..9].copy_from_slice(MAGIC);
    header[9] = FORMAT_VERSION;
    header[10] = 0; // little-endian
    header[11] = 0; // reserved
    header[12..16].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&header)?;
    writer.write_all(&body.bytes)?;
    Ok(())
}

// ============ Load ============

/// Reads a mesh from a stream, validating the container before
/// construction.
pub fn load_mesh<R: Read>(reader: &mut R) -> EfResult<Arc<Mesh>> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    if data.len() < HEADER_SIZE {
        return Err(EfError::MeshFormat("file shorter than header".into()));
    }
    if &data[..9] != MAGIC {
        return Err(EfError::MeshFormat("bad magic".into()));
    }
    let version = data[9];
    let big_endian = match data[10] {
        0 => false,
        1 => true,
        other => {
            return Err(EfError::MeshFormat(format!(
                "bad endianness byte {other}"
            )));
        }
    };
    let stored_checksum = if big_endian {
        u32::from_be_bytes(data[12..16].try_into().unwrap())
    } else {
        u32::from_le_bytes(data[12..16].try_into().unwrap())
    };
    let body = &data[HEADER_SIZE..];
    if stored_checksum != 0 && checksum(body) != stored_checksum {
        return Err(EfError::MeshFormat("checksum mismatch".into()));
    }
    match version {
        1 => load_version_1(BodyReader::new(body, big_endian)),
        other => Err(EfError::UnsupportedMeshVersion(other)),
    }
}

fn load_version_1(mut reader: BodyReader<'_>) -> EfResult<Arc<Mesh>> {
    let num_vertices = reader.u64()?;
    let num_triangles = reader.u64()?;
    let num_edges = reader.u64()?;
    let num_neighbors = reader.u64()?;
    let num_materials = reader.u64()?;

    let vertices_wide = num_vertices > u32::MAX as u64;
    let triangles_wide = num_triangles > u32::MAX as u64;
    let edges_wide = num_edges > u32::MAX as u64;
    let neighbors_wide = num_neighbors > u32::MAX as u64;
    let materials_wide = num_materials > u32::MAX as u64;

    let count = |n: u64, what: &str| -> EfResult<usize> {
        usize::try_from(n).map_err(|_| EfError::MeshFormat(format!("{what} count overflows")))
    };

    let mut materials = Vec::with_capacity(count(num_materials, "material")?);
    for _ in 0..num_materials {
        let reflectivity = reader.response()?;
        let scattering = reader.response()?;
        let transmission = reader.response()?;
        let color = [reader.f32()?, reader.f32()?, reader.f32()?, reader.f32()?];
        let mut material = Material::new(reflectivity, scattering, transmission);
        material.color = color;
        materials.push(material);
    }

    let mut vertices = Vec::with_capacity(count(num_vertices, "vertex")?);
    for _ in 0..num_vertices {
        vertices.push(Pt3::new(reader.f32()?, reader.f32()?, reader.f32()?));
    }

    let narrow = |value: u64, what: &str| -> EfResult<u32> {
        u32::try_from(value).map_err(|_| EfError::MeshFormat(format!("{what} index overflows")))
    };

    let mut triangles = Vec::with_capacity(count(num_triangles, "triangle")?);
    for _ in 0..num_triangles {
        let v = [
            narrow(reader.index(vertices_wide)?, "vertex")?,
            narrow(reader.index(vertices_wide)?, "vertex")?,
            narrow(reader.index(vertices_wide)?, "vertex")?,
        ];
        let mut edges = [None; 3];
        for slot in &mut edges {
            let biased = reader.index(edges_wide)?;
            *slot = if biased == 0 {
                None
            } else {
                Some(narrow(biased - 1, "edge")?)
            };
        }
        let material = narrow(reader.index(materials_wide)?, "material")?;
        let key_vertex = reader.u32()?;
        let rows = reader.u32()?;
        let cols = reader.u32()?;
        triangles.push(Triangle {
            vertices: v,
            material,
            edges,
            key_vertex,
            rows,
            cols,
        });
    }

    let graph = if num_edges > 0 || num_neighbors > 0 {
        let mut edges = Vec::with_capacity(count(num_edges, "edge")?);
        for _ in 0..num_edges {
            let vertices = [
                narrow(reader.index(vertices_wide)?, "vertex")?,
                narrow(reader.index(vertices_wide)?, "vertex")?,
            ];
            let triangles = [
                narrow(reader.index(triangles_wide)?, "triangle")?,
                narrow(reader.index(triangles_wide)?, "triangle")?,
            ];
            let neighbor_count = narrow(reader.index(neighbors_wide)?, "neighbour")?;
            let neighbor_offset = narrow(reader.index(neighbors_wide)?, "neighbour")?;
            let edge_index = [reader.u16()?, reader.u16()?];
            let mut planes = [Plane::new(Vec3::zeros(), 0.0); 2];
            for plane in &mut planes {
                let normal = Vec3::new(reader.f32()?, reader.f32()?, reader.f32()?);
                *plane = Plane::new(normal, reader.f32()?);
            }
            edges.push(DiffractionEdge {
                vertices,
                triangles,
                edge_index,
                planes,
                neighbor_offset,
                neighbor_count,
            });
        }
        let mut neighbors = Vec::with_capacity(count(num_neighbors, "neighbour")?);
        for _ in 0..num_neighbors {
            neighbors.push(narrow(reader.index(neighbors_wide)?, "neighbour")?);
        }
        Some(DiffractionGraph { edges, neighbors })
    } else {
        None
    };

    if !reader.is_empty() {
        return Err(EfError::MeshFormat("trailing bytes after mesh body".into()));
    }

    log::debug!(
        "loaded mesh: {num_vertices} vertices, {num_triangles} triangles, {num_edges} edges, {num_materials} materials"
    );
    Mesh::new(vertices, triangles, materials, graph)
}

/// Sum of the body bytes, mod 2³².
fn checksum(body: &[u8]) -> u32 {
    body.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

// ============ Byte-level helpers ============

#[derive(Default)]
struct BodyWriter {
    bytes: Vec<u8>,
}

impl BodyWriter {
    fn put_u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn put_f32(&mut self, v: f32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn put_index(&mut self, v: u64, wide: bool) {
        if wide {
            self.put_u64(v);
        } else {
            self.put_u32(v as u32);
        }
    }

    fn put_response(&mut self, response: &ef_core::FrequencyResponse) {
        self.put_u32(response.point_count() as u32);
        for i in 0..response.point_count() {
            let (freq, gain) = response.point(i);
            self.put_f32(freq);
            self.put_f32(gain);
        }
    }
}

struct BodyReader<'a> {
    data: &'a [u8],
    big_endian: bool,
}

impl<'a> BodyReader<'a> {
    fn new(data: &'a [u8], big_endian: bool) -> Self {
        Self { data, big_endian }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> EfResult<&'a [u8]> {
        if self.data.len() < n {
            return Err(EfError::MeshFormat("unexpected end of mesh body".into()));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u16(&mut self) -> EfResult<u16> {
        let bytes = self.take(2)?.try_into().unwrap();
        Ok(if self.big_endian {
            u16::from_be_bytes(bytes)
        } else {
            u16::from_le_bytes(bytes)
        })
    }

    fn u32(&mut self) -> EfResult<u32> {
        let bytes = self.take(4)?.try_into().unwrap();
        Ok(if self.big_endian {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        })
    }

    fn u64(&mut self) -> EfResult<u64> {
        let bytes = self.take(8)?.try_into().unwrap();
        Ok(if self.big_endian {
            u64::from_be_bytes(bytes)
        } else {
            u64::from_le_bytes(bytes)
        })
    }

    fn f32(&mut self) -> EfResult<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn index(&mut self, wide: bool) -> EfResult<u64> {
        if wide {
            self.u64()
        } else {
            Ok(self.u32()? as u64)
        }
    }

    fn response(&mut self) -> EfResult<ef_core::FrequencyResponse> {
        let count = self.u32()? as usize;
        // Guard the count against the remaining bytes before allocating.
        if self.data.len() < count.saturating_mul(8) {
            return Err(EfError::MeshFormat("response point count too large".into()));
        }
        let mut points = Vec::with_capacity(count);
        for _ in 0..count {
            let freq = self.f32()?;
            let gain = self.f32()?;
            points.push((freq, gain));
        }
        Ok(ef_core::FrequencyResponse::from_points(points))
    }
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;
    use ef_core::FrequencyResponse;

    fn sample_mesh() -> Arc<Mesh> {
        let vertices = vec![
            Pt3::new(0.0, 0.0, 0.0),
            Pt3::new(1.0, 0.0, 0.0),
            Pt3::new(0.0, 1.0, 0.0),
        ];
        let triangles = vec![Triangle::new([0, 1, 2], 0)];
        let material = Material::new(
            FrequencyResponse::from_points([(125.0, 0.9), (4000.0, 0.4)]),
            FrequencyResponse::flat(0.1),
            FrequencyResponse::flat(0.0),
        );
        Mesh::new(vertices, triangles, vec![material], None).unwrap()
    }

    fn round_trip(mesh: &Mesh) -> Arc<Mesh> {
        let mut bytes = Vec::new();
        save_mesh(mesh, &mut bytes).unwrap();
        load_mesh(&mut bytes.as_slice()).unwrap()
    }

    #[test]
    fn test_round_trip_simple() {
        let mesh = sample_mesh();
        let loaded = round_trip(&mesh);
        assert_eq!(loaded.vertex_count(), mesh.vertex_count());
        assert_eq!(loaded.triangles(), mesh.triangles());
        assert_eq!(loaded.materials(), mesh.materials());
        assert!(loaded.diffraction_graph().is_none());
        for i in 0..mesh.vertex_count() as u32 {
            assert_eq!(loaded.vertex(i), mesh.vertex(i));
        }
    }

    #[test]
    fn test_round_trip_with_graph() {
        let vertices = vec![
            Pt3::new(0.0, 0.0, 0.0),
            Pt3::new(1.0, 0.0, 0.0),
            Pt3::new(0.5, 1.0, 0.0),
            Pt3::new(0.5, -1.0, 0.5),
        ];
        let mut t0 = Triangle::new([0, 1, 2], 0);
        let mut t1 = Triangle::new([1, 0, 3], 0);
        t0.edges[0] = Some(0);
        t1.edges[0] = Some(0);
        let graph = DiffractionGraph {
            edges: vec![DiffractionEdge {
                vertices: [0, 1],
                triangles: [0, 1],
                edge_index: [0, 0],
                planes: [
                    Plane::new(Vec3::new(0.0, 0.0, 1.0), 0.0),
                    Plane::new(Vec3::new(0.0, -0.894, -0.447), 0.1),
                ],
                neighbor_offset: 0,
                neighbor_count: 1,
            }],
            neighbors: vec![0],
        };
        let mesh = Mesh::new(vertices, vec![t0, t1], vec![Material::default()], Some(graph)).unwrap();

        let loaded = round_trip(&mesh);
        let original = mesh.diffraction_graph().unwrap();
        let graph = loaded.diffraction_graph().unwrap();
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].vertices, original.edges[0].vertices);
        assert_eq!(graph.edges[0].planes, original.edges[0].planes);
        assert_eq!(graph.neighbors, original.neighbors);
        assert_eq!(loaded.triangle(0).edges[0], Some(0));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = Vec::new();
        save_mesh(&sample_mesh(), &mut bytes).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            load_mesh(&mut bytes.as_slice()),
            Err(EfError::MeshFormat(_))
        ));
    }

    #[test]
    fn test_corrupt_body_rejected_by_checksum() {
        let mut bytes = Vec::new();
        save_mesh(&sample_mesh(), &mut bytes).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x5a;
        assert!(load_mesh(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut bytes = Vec::new();
        save_mesh(&sample_mesh(), &mut bytes).unwrap();
        bytes[9] = 9;
        // Checksum covers only the body, so the header edit surfaces as a
        // version error.
        assert!(matches!(
            load_mesh(&mut bytes.as_slice()),
            Err(EfError::UnsupportedMeshVersion(9))
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let mesh = sample_mesh();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.soundmesh");
        {
            let mut file = std::fs::File::create(&path).unwrap();
            save_mesh(&mesh, &mut file).unwrap();
        }
        let mut file = std::fs::File::open(&path).unwrap();
        let loaded = load_mesh(&mut file).unwrap();
        assert_eq!(loaded.triangles(), mesh.triangles());
        assert_eq!(loaded.materials(), mesh.materials());
    }

    #[test]
    fn test_truncated_body_rejected() {
        let mut bytes = Vec::new();
        save_mesh(&sample_mesh(), &mut bytes).unwrap();
        bytes.truncate(bytes.len() - 5);
        assert!(load_mesh(&mut bytes.as_slice()).is_err());
    }
}
