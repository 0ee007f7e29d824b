//! End-to-end propagation tests
//!
//! Small analytic scenes with known path geometry: free field, a single
//! mirror, occlusion and transmission, and frame-to-frame determinism.

use std::sync::Arc;

use ef_core::{FrequencyResponse, Pt3, Vec3};
use ef_propagate::{PathKind, PropagationFlags, PropagationRequest, Propagator, SceneIR};
use ef_scene::{
    DiffractionEdge, DiffractionGraph, Listener, Material, Mesh, Scene, SceneObject, Source,
    Triangle,
};

fn quad_mesh(extent: f32, material: Material) -> Arc<Mesh> {
    let vertices = vec![
        Pt3::new(-extent, -extent, 0.0),
        Pt3::new(extent, -extent, 0.0),
        Pt3::new(extent, extent, 0.0),
        Pt3::new(-extent, extent, 0.0),
    ];
    let triangles = vec![Triangle::new([0, 1, 2], 0), Triangle::new([0, 2, 3], 0)];
    Mesh::new(vertices, triangles, vec![material], None).unwrap()
}

fn mirror_material() -> Material {
    Material::new(
        FrequencyResponse::flat(1.0),
        FrequencyResponse::flat(0.0),
        FrequencyResponse::flat(0.0),
    )
}

fn base_request(flags: PropagationFlags) -> PropagationRequest {
    let _ = env_logger::builder().is_test(true).try_init();
    PropagationRequest {
        flags,
        num_direct_rays: 1,
        num_specular_rays: 4000,
        num_specular_samples: 1,
        max_specular_depth: 1,
        num_threads: 1,
        dt: 1.0 / 60.0,
        ..Default::default()
    }
}

#[test]
fn test_free_field_direct_path() {
    let mut scene = Scene::new();
    let mut source = Source::at(Pt3::new(0.0, 0.0, 0.0));
    source.set_power(1.0);
    scene.add_source(source);
    scene.add_listener(Listener::at(Pt3::new(10.0, 0.0, 0.0)));

    let mut request = base_request(PropagationFlags::DIRECT);
    let mut output = SceneIR::default();
    Propagator::new().propagate(&mut scene, &mut request, &mut output);

    assert_eq!(output.listener_count(), 1);
    let source_ir = output.listener_ir(0).source_ir(0);
    assert_eq!(source_ir.paths().len(), 1);

    let path = &source_ir.paths()[0];
    assert!(path.kind.contains(PathKind::DIRECT));
    assert!((path.distance - 10.0).abs() < 1e-4);

    // Free-field spreading: 1 / (4π (1 + d²)).
    let expected = 1.0 / (4.0 * std::f32::consts::PI * 101.0);
    for b in 0..path.intensity.band_count() {
        assert!(
            (path.intensity[b] - expected).abs() < 1e-6,
            "band {b}: {} vs {expected}",
            path.intensity[b]
        );
    }

    // Delay ≈ 29 ms at the medium's speed of sound.
    let expected_delay = 10.0 / scene.medium().speed();
    assert!((path.delay() - expected_delay).abs() < 1e-5);
    assert!((path.direction.norm() - 1.0).abs() < 1e-4);
    assert!((path.source_direction.norm() - 1.0).abs() < 1e-4);
}

#[test]
fn test_single_wall_mirror() {
    let mut scene = Scene::new();
    scene.add_object(SceneObject::new(quad_mesh(50.0, mirror_material())));
    let mut source = Source::at(Pt3::new(0.0, 0.0, 1.0));
    source.detector_mut().set_radius(0.0);
    scene.add_source(source);
    scene.add_listener(Listener::at(Pt3::new(2.0, 0.0, 1.0)));

    let mut request = base_request(PropagationFlags::SPECULAR | PropagationFlags::SPECULAR_CACHE);
    let mut output = SceneIR::default();
    Propagator::new().propagate(&mut scene, &mut request, &mut output);

    let source_ir = output.listener_ir(0).source_ir(0);
    let specular: Vec<_> = source_ir
        .paths()
        .iter()
        .filter(|p| p.kind.contains(PathKind::SPECULAR))
        .collect();
    assert_eq!(specular.len(), 1, "expected exactly one mirror path");

    // One bounce off z = 0: path length √(2² + 2²).
    let expected = (2.0f32 * 2.0 + 2.0 * 2.0).sqrt();
    assert!(
        (specular[0].distance - expected).abs() < 1e-2,
        "distance {}",
        specular[0].distance
    );
    for b in 0..specular[0].intensity.band_count() {
        assert!(specular[0].intensity[b] > 0.0);
    }
}

#[test]
fn test_mirror_path_survives_revalidation() {
    let mut scene = Scene::new();
    scene.add_object(SceneObject::new(quad_mesh(50.0, mirror_material())));
    let mut source = Source::at(Pt3::new(0.0, 0.0, 1.0));
    source.detector_mut().set_radius(0.0);
    scene.add_source(source);
    scene.add_listener(Listener::at(Pt3::new(2.0, 0.0, 1.0)));

    let mut request = base_request(PropagationFlags::SPECULAR | PropagationFlags::SPECULAR_CACHE);
    let mut propagator = Propagator::new();
    let mut output = SceneIR::default();
    propagator.propagate(&mut scene, &mut request, &mut output);
    let first_hash = output.listener_ir(0).source_ir(0).paths()[0].hash;

    // Second frame with no probe rays at all: the cached path must be
    // re-validated and re-emitted with the same identity.
    request.num_specular_rays = 0;
    propagator.propagate(&mut scene, &mut request, &mut output);
    let paths = output.listener_ir(0).source_ir(0).paths();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].hash, first_hash);

    // Moving the wall aside leaves no reflector under the path, so the
    // cached entry fails validation and is evicted.
    scene.object_mut(0).set_position(Vec3::new(500.0, 0.0, 0.0));
    propagator.propagate(&mut scene, &mut request, &mut output);
    assert!(output.listener_ir(0).source_ir(0).paths().is_empty());
}

#[test]
fn test_occluded_direct_blocked_and_transmitted() {
    let absorber = Material::new(
        FrequencyResponse::flat(0.2),
        FrequencyResponse::flat(0.0),
        FrequencyResponse::flat(0.0),
    );
    let mut scene = Scene::new();
    scene.add_object(SceneObject::new(quad_mesh(50.0, absorber)));
    scene.add_source(Source::at(Pt3::new(0.0, 0.0, 5.0)));
    scene.add_listener(Listener::at(Pt3::new(0.0, 0.0, -5.0)));

    let mut request = base_request(PropagationFlags::DIRECT);
    let mut output = SceneIR::default();
    Propagator::new().propagate(&mut scene, &mut request, &mut output);
    assert!(
        output.listener_ir(0).source_ir(0).paths().is_empty(),
        "an opaque wall must block the direct path"
    );

    // A transmissive wall leaks an attenuated path when the flag is on.
    let glass = Material::new(
        FrequencyResponse::flat(0.2),
        FrequencyResponse::flat(0.0),
        FrequencyResponse::flat(0.5),
    );
    let mut scene = Scene::new();
    scene.add_object(SceneObject::new(quad_mesh(50.0, glass)));
    scene.add_source(Source::at(Pt3::new(0.0, 0.0, 5.0)));
    scene.add_listener(Listener::at(Pt3::new(0.0, 0.0, -5.0)));

    let mut request = base_request(PropagationFlags::DIRECT | PropagationFlags::TRANSMISSION);
    Propagator::new().propagate(&mut scene, &mut request, &mut output);
    let paths = output.listener_ir(0).source_ir(0).paths();
    assert_eq!(paths.len(), 1);
    assert!(paths[0].kind.contains(PathKind::TRANSMISSION));
    let spreading = 1.0 / (4.0 * std::f32::consts::PI * 101.0);
    assert!((paths[0].intensity[0] - 0.5 * spreading).abs() < 1e-6);
}

#[test]
fn test_empty_scene_only_direct_for_enabled_sources() {
    let mut scene = Scene::new();
    scene.add_source(Source::at(Pt3::new(5.0, 0.0, 0.0)));
    let mut disabled = Source::at(Pt3::new(0.0, 5.0, 0.0));
    disabled.detector_mut().set_enabled(false);
    scene.add_source(disabled);
    scene.add_listener(Listener::at(Pt3::origin()));

    let mut request = base_request(
        PropagationFlags::DIRECT | PropagationFlags::SPECULAR | PropagationFlags::DIFFUSE,
    );
    let mut output = SceneIR::default();
    Propagator::new().propagate(&mut scene, &mut request, &mut output);

    let listener_ir = output.listener_ir(0);
    assert_eq!(listener_ir.source_count(), 1);
    let paths = listener_ir.source_ir(0).paths();
    assert_eq!(paths.len(), 1);
    assert!(paths[0].kind.contains(PathKind::DIRECT));
}

#[test]
fn test_frames_deterministic_for_fixed_thread_count() {
    let mut scene = Scene::new();
    scene.add_object(SceneObject::new(quad_mesh(30.0, mirror_material())));
    let mut source = Source::at(Pt3::new(-1.0, 0.5, 2.0));
    source.detector_mut().set_radius(0.0);
    scene.add_source(source);
    scene.add_listener(Listener::at(Pt3::new(3.0, -0.5, 1.5)));

    let run = |scene: &mut Scene| {
        let mut request =
            base_request(PropagationFlags::DIRECT | PropagationFlags::SPECULAR);
        let mut output = SceneIR::default();
        Propagator::new().propagate(scene, &mut request, &mut output);
        let mut hashes: Vec<u64> = output
            .listener_ir(0)
            .source_ir(0)
            .paths()
            .iter()
            .map(|p| p.hash)
            .collect();
        hashes.sort_unstable();
        hashes
    };

    let first = run(&mut scene);
    let second = run(&mut scene);
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[test]
fn test_sampled_ir_mode_places_direct_impulse() {
    let mut scene = Scene::new();
    scene.add_source(Source::at(Pt3::new(10.0, 0.0, 0.0)));
    scene.add_listener(Listener::at(Pt3::origin()));

    let mut request = base_request(PropagationFlags::DIRECT | PropagationFlags::SAMPLED_IR);
    request.sample_rate = 44_100.0;
    let mut output = SceneIR::default();
    Propagator::new().propagate(&mut scene, &mut request, &mut output);

    let source_ir = output.listener_ir(0).source_ir(0);
    assert!(source_ir.paths().is_empty());
    let sampled = source_ir.sampled();
    let expected_sample =
        (10.0 / scene.medium().speed() * 44_100.0).floor() as usize;
    assert_eq!(sampled.start_offset(), expected_sample);
    assert!(sampled.total_intensity()[0] > 0.0);
}

#[test]
fn test_statistics_reported() {
    let mut scene = Scene::new();
    scene.add_object(SceneObject::new(quad_mesh(20.0, mirror_material())));
    scene.add_source(Source::at(Pt3::new(0.0, 0.0, 2.0)));
    scene.add_listener(Listener::at(Pt3::new(1.0, 0.0, 2.0)));

    let mut request = base_request(
        PropagationFlags::DIRECT
            | PropagationFlags::SPECULAR
            | PropagationFlags::SPECULAR_CACHE
            | PropagationFlags::STATISTICS,
    );
    let mut propagator = Propagator::new();
    let mut output = SceneIR::default();
    propagator.propagate(&mut scene, &mut request, &mut output);

    let stats = propagator.statistics();
    assert_eq!(stats.listener_count, 1);
    assert_eq!(stats.source_count, 1);
    assert_eq!(stats.object_count, 1);
    assert_eq!(stats.triangle_count, 2);
    assert!(stats.specular_ray_count > 0);
    assert!(stats.scene_memory > 0);
}

/// A thin screen at y = 0 spanning x ∈ [-5, 5], z ∈ [0, 3], whose top
/// edge diffracts.
fn screen_mesh() -> Arc<Mesh> {
    use ef_core::Plane;

    let vertices = vec![
        Pt3::new(-5.0, 0.0, 0.0),
        Pt3::new(5.0, 0.0, 0.0),
        Pt3::new(5.0, 0.0, 3.0),
        Pt3::new(-5.0, 0.0, 3.0),
    ];
    // Front faces (+y) and back faces (-y); triangles 1 and 2 share the
    // top edge.
    let t_front_low = Triangle::new([0, 2, 1], 0);
    let mut t_front_top = Triangle::new([0, 3, 2], 0);
    let mut t_back_top = Triangle::new([1, 2, 3], 0);
    let t_back_low = Triangle::new([1, 3, 0], 0);
    t_front_top.edges[1] = Some(0); // edge (3, 2)
    t_back_top.edges[1] = Some(0); // edge (2, 3)

    let graph = DiffractionGraph {
        edges: vec![DiffractionEdge {
            vertices: [3, 2],
            triangles: [1, 2],
            edge_index: [1, 1],
            planes: [
                Plane::new(Vec3::new(0.0, 1.0, 0.0), 0.0),
                Plane::new(Vec3::new(0.0, -1.0, 0.0), 0.0),
            ],
            neighbor_offset: 0,
            neighbor_count: 0,
        }],
        neighbors: Vec::new(),
    };
    Mesh::new(
        vertices,
        vec![t_front_low, t_front_top, t_back_top, t_back_low],
        vec![mirror_material()],
        Some(graph),
    )
    .unwrap()
}

#[test]
fn test_knife_edge_diffraction() {
    let mut scene = Scene::new();
    scene.add_object(SceneObject::new(screen_mesh()));
    let mut source = Source::at(Pt3::new(0.0, -2.0, 1.0));
    source.detector_mut().set_radius(0.0);
    scene.add_source(source);
    scene.add_listener(Listener::at(Pt3::new(0.0, 2.0, 1.0)));

    let mut request =
        base_request(PropagationFlags::DIFFRACTION | PropagationFlags::SPECULAR_CACHE);
    let mut output = SceneIR::default();
    Propagator::new().propagate(&mut scene, &mut request, &mut output);

    let paths = output.listener_ir(0).source_ir(0).paths();
    let diffracted: Vec<_> = paths
        .iter()
        .filter(|p| p.kind.contains(PathKind::DIFFRACTION))
        .collect();
    assert!(!diffracted.is_empty(), "no diffraction path over the screen");

    // Listener and source sit symmetrically 2√2 m from the apex at
    // (0, 0, 3), so the bent path is 4√2 m.
    let expected = 4.0 * 2.0f32.sqrt();
    let best = diffracted
        .iter()
        .min_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap())
        .unwrap();
    assert!(
        (best.distance - expected).abs() < 0.05,
        "diffracted distance {} vs {expected}",
        best.distance
    );
    for b in 0..best.intensity.band_count() {
        assert!(best.intensity[b] >= 0.0);
    }
    // Low bands bend around the edge better than high bands.
    assert!(best.intensity[0] >= best.intensity[7]);
}

#[test]
fn test_clustered_sources_share_one_ir() {
    let mut scene = Scene::new();
    scene.add_source(Source::at(Pt3::new(100.0, 0.0, 0.0)));
    scene.add_source(Source::at(Pt3::new(100.0, 1.0, 0.0)));
    scene.add_listener(Listener::at(Pt3::origin()));

    let mut request =
        base_request(PropagationFlags::DIRECT | PropagationFlags::SOURCE_CLUSTERING);
    request.inner_clustering_angle = 0.1;
    request.outer_clustering_angle = 0.2;
    let mut output = SceneIR::default();
    Propagator::new().propagate(&mut scene, &mut request, &mut output);

    let listener_ir = output.listener_ir(0);
    assert_eq!(listener_ir.source_count(), 1);
    assert_eq!(listener_ir.source_ir(0).source_ids().len(), 2);
    assert_eq!(listener_ir.source_ir(0).paths().len(), 1);
}

#[test]
fn test_doppler_sorting_keeps_fast_paths_as_records() {
    let mut scene = Scene::new();
    let mut source = Source::at(Pt3::new(10.0, 0.0, 0.0));
    // Closing at 20 m/s shifts well past a 10-cent threshold.
    source.detector_mut().set_velocity(Vec3::new(-20.0, 0.0, 0.0));
    scene.add_source(source);
    scene.add_listener(Listener::at(Pt3::origin()));

    let mut request = base_request(
        PropagationFlags::DIRECT
            | PropagationFlags::SAMPLED_IR
            | PropagationFlags::DOPPLER_SORTING,
    );
    request.doppler_threshold = 10.0;
    let mut output = SceneIR::default();
    Propagator::new().propagate(&mut scene, &mut request, &mut output);

    let source_ir = output.listener_ir(0).source_ir(0);
    assert_eq!(source_ir.paths().len(), 1, "shifted path must stay a record");
    assert!(source_ir.paths()[0].doppler_shift_cents() > 10.0);

    // Without doppler sorting the same path lands in the sampled IR.
    let mut scene = Scene::new();
    scene.add_source(Source::at(Pt3::new(10.0, 0.0, 0.0)));
    scene.add_listener(Listener::at(Pt3::origin()));
    let mut request = base_request(PropagationFlags::DIRECT | PropagationFlags::SAMPLED_IR);
    Propagator::new().propagate(&mut scene, &mut request, &mut output);
    let source_ir = output.listener_ir(0).source_ir(0);
    assert!(source_ir.paths().is_empty());
    assert!(source_ir.sampled().total_intensity()[0] > 0.0);
}

#[test]
fn test_source_directivity_shapes_direct_path() {
    let run = |directivity: Option<Arc<ef_scene::Directivity>>| {
        let mut scene = Scene::new();
        let mut source = Source::at(Pt3::new(10.0, 0.0, 0.0));
        source.set_directivity(directivity);
        scene.add_source(source);
        scene.add_listener(Listener::at(Pt3::origin()));

        let mut request = base_request(
            PropagationFlags::DIRECT | PropagationFlags::SOURCE_DIRECTIVITY,
        );
        let mut output = SceneIR::default();
        Propagator::new().propagate(&mut scene, &mut request, &mut output);
        output.listener_ir(0).source_ir(0).paths()[0].intensity
    };

    let omni = run(None);
    // The voice pattern faces +z; the listener sits to the side at -x,
    // where high bands fall off hardest.
    let voiced = run(Some(Arc::new(ef_scene::Directivity::human_voice())));
    assert!(voiced[7] < omni[7]);
}

#[test]
fn test_multi_threaded_frame_matches_single_direct() {
    let mut scene = Scene::new();
    scene.add_source(Source::at(Pt3::new(7.0, 0.0, 0.0)));
    scene.add_listener(Listener::at(Pt3::origin()));

    let mut output = SceneIR::default();
    let mut request = base_request(PropagationFlags::DIRECT);
    request.num_threads = 4;
    Propagator::new().propagate(&mut scene, &mut request, &mut output);

    let paths = output.listener_ir(0).source_ir(0).paths();
    assert_eq!(paths.len(), 1);
    assert!((paths[0].distance - 7.0).abs() < 1e-4);
}
