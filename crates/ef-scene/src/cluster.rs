//! Source clustering
//!
//! Distant sources that subtend a small angle from the listener can
//! share one IR. Clusters form when the angular separation drops below
//! the inner threshold and break apart only above the outer threshold,
//! so membership is hysteretic and does not flicker frame to frame.

use ef_core::{Pt3, Vec3};

use crate::detector::{Detector, Source};

/// A group of sources sharing one IR when merged.
#[derive(Debug, Clone)]
pub struct SourceCluster {
    /// Indices into the scene's source list.
    pub sources: Vec<usize>,
    /// Merged clusters propagate once through their shared detector;
    /// unmerged clusters propagate each source individually.
    pub merged: bool,
    /// The shared detector at the power-weighted centroid.
    detector: Detector,
}

impl SourceCluster {
    #[inline]
    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    #[inline]
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }
}

/// Rebuilds clusters for one listener position.
///
/// A source joins an existing cluster while its angle to the cluster
/// centroid stays below `outer_angle` if it was a member last frame, or
/// below `inner_angle` otherwise. Each cluster's detector sits at the
/// power-weighted centroid with the maximum member radius.
pub fn update_source_clusters(
    sources: &[Source],
    listener_position: Pt3,
    inner_angle: f32,
    outer_angle: f32,
    clusters: &mut Vec<SourceCluster>,
) {
    let outer_angle = outer_angle.max(inner_angle);
    let previous: Vec<Vec<usize>> = clusters.iter().map(|c| c.sources.clone()).collect();
    clusters.clear();

    struct Builder {
        sources: Vec<usize>,
        direction: Vec3,
    }
    let mut builders: Vec<Builder> = Vec::new();

    for (index, source) in sources.iter().enumerate() {
        if !source.is_enabled() {
            continue;
        }
        let offset = source.detector().position() - listener_position;
        let distance = offset.norm();
        if distance < f32::EPSILON {
            // A source on top of the listener clusters with nothing.
            builders.push(Builder {
                sources: vec![index],
                direction: Vec3::zeros(),
            });
            continue;
        }
        let direction = offset / distance;

        let mut joined = false;
        for builder in &mut builders {
            if builder.direction == Vec3::zeros() {
                continue;
            }
            let angle = builder.direction.dot(&direction).clamp(-1.0, 1.0).acos();
            let was_member = previous
                .iter()
                .any(|members| members.contains(&index) && members.contains(&builder.sources[0]));
            let threshold = if was_member { outer_angle } else { inner_angle };
            if angle < threshold {
                builder.sources.push(index);
                joined = true;
                break;
            }
        }
        if !joined {
            builders.push(Builder {
                sources: vec![index],
                direction,
            });
        }
    }

    for builder in builders {
        let merged = builder.sources.len() > 1;
        let mut detector = Detector::default();
        if merged {
            // Power-weighted centroid; radius covers the widest member.
            let mut total_power = 0.0;
            let mut centroid = Vec3::zeros();
            let mut radius = 0.0f32;
            for &i in &builder.sources {
                let source = &sources[i];
                let weight = source.power().max(f32::EPSILON);
                total_power += weight;
                centroid += source.detector().position().coords * weight;
                radius = radius.max(source.detector().radius());
            }
            detector.set_position(Pt3::from(centroid / total_power));
            detector.set_radius(radius);
        } else {
            let source = &sources[builder.sources[0]];
            detector.set_position(source.detector().position());
            detector.set_radius(source.detector().radius());
            detector.set_velocity(source.detector().velocity());
        }
        clusters.push(SourceCluster {
            sources: builder.sources,
            merged,
            detector,
        });
    }
}
