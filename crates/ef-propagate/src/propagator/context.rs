//! Frame-scoped shared state
//!
//! During a frame the propagator assembles read-only views of the scene
//! and sources for the workers, and write-only sinks the main thread
//! drains into. Keeping the two disjoint is what lets the probe phase
//! trace and consume concurrently without locks.

use std::collections::HashMap;

use ef_core::{BandResponse, FrequencyBands, Vec3};
use ef_scene::{BandDirectivity, Detector, MaterialBands, ObjectTriangle, Scene, WorldTriangle};

use crate::cache::{DiffusePathCache, IrCache, VisibilityCache};
use crate::request::{PropagationFlags, PropagationRequest};
use crate::source_ir::SourceIR;

/// Per-mesh material projections for the active band layout, rebuilt
/// when the bands or the mesh set change.
#[derive(Debug, Default)]
pub(crate) struct MaterialTable {
    bands: Option<FrequencyBands>,
    meshes: HashMap<u64, Vec<MaterialBands>>,
}

impl MaterialTable {
    /// Ensures projections exist for every mesh in the scene under the
    /// requested bands.
    pub fn refresh(&mut self, scene: &Scene, bands: &FrequencyBands) {
        if self.bands.as_ref() != Some(bands) {
            self.meshes.clear();
            self.bands = Some(*bands);
        }
        for object in scene.objects() {
            let mesh = object.mesh();
            self.meshes.entry(mesh.id()).or_insert_with(|| {
                mesh.materials()
                    .iter()
                    .map(|material| material.project(bands))
                    .collect()
            });
        }
    }

    /// The projected material of a world triangle.
    pub fn for_triangle(&self, triangle: &WorldTriangle) -> MaterialBands {
        self.meshes
            .get(&triangle.mesh_id)
            .and_then(|materials| materials.get(triangle.material as usize))
            .copied()
            .unwrap_or_default()
    }
}

/// The read-only per-source data workers need while tracing.
#[derive(Debug)]
pub(crate) struct SourceView {
    /// Key into the persistent per-pair state (first member source id).
    pub key: u64,
    /// The detector rays aim for: the source itself, or the cluster
    /// centroid for a merged cluster.
    pub detector: Detector,
    pub source_ids: Vec<u64>,
    pub total_power: f32,
    pub visibility: VisibilityCache,
    pub directivity: Option<BandDirectivity>,
    /// Per-source adaptive IR length in seconds, and the matching ray
    /// travel budget in meters.
    pub max_ir_length: f32,
    pub max_ir_distance: f32,
}

impl SourceView {
    /// Directivity gain toward `direction_from_source` in world space.
    pub fn directivity_gain(&self, direction_from_source: Vec3) -> BandResponse {
        match &self.directivity {
            Some(directivity) => {
                directivity.response(self.detector.to_local_direction(direction_from_source))
            }
            None => BandResponse::default(),
        }
    }
}

/// The per-source state only the main thread touches during tracing.
#[derive(Debug)]
pub(crate) struct SourceSink {
    pub diffuse_cache: DiffusePathCache,
    pub ir_cache: IrCache,
    pub ir: SourceIR,
    /// Diffuse rays cast for this source in source-origin mode.
    pub diffuse_rays_cast: u64,
}

/// Everything a ray-tracing worker reads during one listener's frame.
pub(crate) struct TraceContext<'a> {
    pub scene: &'a Scene,
    pub request: &'a PropagationRequest,
    pub materials: &'a MaterialTable,
    pub listener: &'a Detector,
    pub views: &'a [SourceView],
    /// Stable object id → current object index, for re-validating cached
    /// paths whose object indices are stale.
    pub object_index: &'a HashMap<u64, u32>,
    pub timestamp: u64,
    /// Listener-level IR length cap in seconds.
    pub max_ir_length: f32,
}

impl TraceContext<'_> {
    /// Geometric spreading, optionally with air absorption. The 1 + d²
    /// form avoids the near-field singularity.
    pub fn distance_attenuation(&self, distance: f32) -> BandResponse {
        let spreading = 1.0 / (4.0 * std::f32::consts::PI * (1.0 + distance * distance));
        if self.request.has(PropagationFlags::AIR_ABSORPTION) {
            self.scene.medium().attenuation(distance) * spreading
        } else {
            BandResponse::splat(spreading)
        }
    }

    /// Closing speed along a path; positive when the endpoints approach.
    pub fn relative_speed(
        &self,
        listener: &Detector,
        direction_from_listener: Vec3,
        source: &Detector,
        direction_to_source: Vec3,
    ) -> f32 {
        let listener_speed = listener.velocity().dot(&direction_from_listener);
        let source_speed = source.velocity().dot(&direction_to_source);
        source_speed - listener_speed
    }

    /// Re-anchors a stored triangle reference to the current frame's
    /// object indices. Returns `None` when the object has left the scene
    /// or the triangle index no longer exists.
    pub fn resolve_triangle(&self, triangle: &ObjectTriangle) -> Option<ObjectTriangle> {
        let &object = self.object_index.get(&triangle.object_id)?;
        let mesh = self.scene.object(object as usize).mesh();
        (triangle.triangle < mesh.triangle_count() as u32).then_some(ObjectTriangle {
            object,
            object_id: triangle.object_id,
            triangle: triangle.triangle,
        })
    }
}
