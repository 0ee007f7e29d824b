//! Diffuse propagation and temporal cache tests
//!
//! A source and listener above a large scattering floor: the random
//! walks must find floor-bounce contributions, the diffuse cache must
//! average them across frames, and the IR cache must converge instead of
//! flickering.

use std::sync::Arc;

use ef_core::{FrequencyResponse, Pt3};
use ef_propagate::{PathKind, PropagationFlags, PropagationRequest, Propagator, SceneIR};
use ef_scene::{Listener, Material, Mesh, Scene, SceneObject, Source, Triangle};

fn scattering_floor(extent: f32) -> Arc<Mesh> {
    let vertices = vec![
        Pt3::new(-extent, -extent, 0.0),
        Pt3::new(extent, -extent, 0.0),
        Pt3::new(extent, extent, 0.0),
        Pt3::new(-extent, extent, 0.0),
    ];
    let mut t0 = Triangle::new([0, 1, 2], 0);
    let mut t1 = Triangle::new([0, 2, 3], 0);
    // A coarse patch grid for diffuse path identity.
    for t in [&mut t0, &mut t1] {
        t.rows = 4;
        t.cols = 4;
    }
    let material = Material::new(
        FrequencyResponse::flat(0.9),
        FrequencyResponse::flat(1.0),
        FrequencyResponse::flat(0.0),
    );
    Mesh::new(vertices, vec![t0, t1], vec![material], None).unwrap()
}

fn floor_scene() -> Scene {
    let mut scene = Scene::new();
    scene.add_object(SceneObject::new(scattering_floor(40.0)));
    scene.add_source(Source::at(Pt3::new(-2.0, 0.0, 1.5)));
    scene.add_listener(Listener::at(Pt3::new(2.0, 0.0, 1.5)));
    scene
}

fn diffuse_request(extra: PropagationFlags) -> PropagationRequest {
    PropagationRequest {
        flags: PropagationFlags::DIFFUSE | extra,
        num_diffuse_rays: 2000,
        num_diffuse_samples: 1,
        max_diffuse_depth: 4,
        num_threads: 1,
        dt: 0.1,
        response_time: 1.0,
        ..Default::default()
    }
}

#[test]
fn test_diffuse_paths_found_via_cache() {
    let mut scene = floor_scene();
    let mut request = diffuse_request(PropagationFlags::DIFFUSE_CACHE);
    let mut propagator = Propagator::new();
    let mut output = SceneIR::default();
    propagator.propagate(&mut scene, &mut request, &mut output);

    let paths = output.listener_ir(0).source_ir(0).paths();
    let diffuse: Vec<_> = paths
        .iter()
        .filter(|p| p.kind.contains(PathKind::DIFFUSE))
        .collect();
    assert!(!diffuse.is_empty(), "no diffuse contributions found");

    // Every contribution bounced at least once, so it travelled farther
    // than the straight line between the detectors.
    for path in &diffuse {
        assert!(path.distance > 4.0);
        for b in 0..path.intensity.band_count() {
            assert!(path.intensity[b] >= 0.0);
            assert!(path.intensity[b].is_finite());
        }
        assert!((path.direction.norm() - 1.0).abs() < 1e-3);
    }
}

#[test]
fn test_diffuse_cache_correlates_frames() {
    let mut scene = floor_scene();
    let mut request = diffuse_request(PropagationFlags::DIFFUSE_CACHE);
    let mut propagator = Propagator::new();
    let mut output = SceneIR::default();

    propagator.propagate(&mut scene, &mut request, &mut output);
    let first: Vec<u64> = output
        .listener_ir(0)
        .source_ir(0)
        .paths()
        .iter()
        .map(|p| p.hash)
        .collect();
    propagator.propagate(&mut scene, &mut request, &mut output);
    let second: Vec<u64> = output
        .listener_ir(0)
        .source_ir(0)
        .paths()
        .iter()
        .map(|p| p.hash)
        .collect();

    // Patch-grid path identity makes most second-frame paths re-finds of
    // first-frame ones.
    let repeats = second.iter().filter(|h| first.contains(h)).count();
    assert!(
        repeats * 2 >= second.len(),
        "only {repeats} of {} paths correlated across frames",
        second.len()
    );
}

#[test]
fn test_ir_cache_smooths_sampled_output() {
    let mut scene = floor_scene();
    let mut request = diffuse_request(
        PropagationFlags::SAMPLED_IR | PropagationFlags::IR_CACHE,
    );
    let mut propagator = Propagator::new();
    let mut output = SceneIR::default();

    let mut totals = Vec::new();
    for _ in 0..20 {
        propagator.propagate(&mut scene, &mut request, &mut output);
        totals.push(output.listener_ir(0).source_ir(0).sampled().total_intensity()[0]);
    }
    assert!(totals[19] > 0.0);

    // The blend is an IIR low-pass over the per-frame estimates: late
    // frames change far less than early ones.
    let early_step = (totals[1] - totals[0]).abs();
    let late_step = (totals[19] - totals[18]).abs();
    assert!(
        late_step <= early_step.max(totals[19] * 0.25),
        "late frames still jumping: {late_step} vs {early_step}"
    );
}

#[test]
fn test_source_origin_mode_produces_energy() {
    let mut scene = floor_scene();
    let mut request = diffuse_request(
        PropagationFlags::SOURCE_DIFFUSE
            | PropagationFlags::SAMPLED_IR
            | PropagationFlags::IR_CACHE,
    );
    request.num_diffuse_rays = 1000;
    let mut propagator = Propagator::new();
    let mut output = SceneIR::default();
    for _ in 0..3 {
        propagator.propagate(&mut scene, &mut request, &mut output);
    }

    let sampled = output.listener_ir(0).source_ir(0).sampled();
    assert!(sampled.total_intensity()[0] > 0.0);
    assert!(sampled.len_samples() > 0);
}
