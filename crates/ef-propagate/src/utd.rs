//! Uniform Theory of Diffraction wedge attenuation
//!
//! Closed-form per-band attenuation for a path bending around a wedge
//! edge. The raw UTD coefficient is normalised against its value at the
//! shadow boundary and blended toward the fully illuminated response so
//! the field stays continuous as the receiver crosses the boundary.

use ef_core::{BAND_COUNT, BandResponse, FrequencyBands, Pt3, Vec3, angle_between, project_to_plane};
use num_complex::Complex32;
use std::f32::consts::PI;

/// Per-band linear attenuation for a single diffraction around the edge
/// with axis `edge_axis`, source-side face normal `source_face_normal`
/// and listener-side face normal `listener_face_normal` (both pointing
/// out of the wedge).
pub fn utd_attenuation(
    source: Pt3,
    diffraction_point: Pt3,
    listener: Pt3,
    source_face_normal: Vec3,
    listener_face_normal: Vec3,
    edge_axis: Vec3,
    speed_of_sound: f32,
    bands: &FrequencyBands,
) -> BandResponse {
    let source_face_vector = edge_axis.cross(&source_face_normal);
    // Wedge index: exterior angle as a multiple of π.
    let n = (2.0 * PI - angle_between(-source_face_normal, listener_face_normal)) / PI;

    let mut source_dir = source - diffraction_point;
    let mut listener_dir = listener - diffraction_point;
    let p = source_dir.norm();
    let r = listener_dir.norm();
    if p < 1e-6 || r < 1e-6 {
        return BandResponse::default();
    }
    source_dir /= p;
    listener_dir /= r;

    // Incidence angle against the edge, folded into [0, π/2].
    let mut theta_i = angle_between(source_dir, edge_axis);
    if theta_i > 0.5 * PI {
        theta_i = PI - theta_i;
    }

    let s_dir = project_to_plane(source_dir, edge_axis);
    let r_dir = project_to_plane(listener_dir, edge_axis);
    let alpha_i = angle_between(-s_dir, source_face_vector);
    let alpha_d = angle_between(r_dir, source_face_vector) + PI;

    // Shadow-boundary reference angle, nudged off the exact boundary.
    let alpha_sb = alpha_i + PI + 0.001;
    let blend = (n * PI - alpha_d) / (n * PI - alpha_sb);

    let mut result = BandResponse::default();
    for b in 0..BAND_COUNT {
        let wavelength = speed_of_sound / bands.center(b);
        let k = 2.0 * PI / wavelength;
        let utd = utd_coefficient(n, k, p, r, theta_i, alpha_i, alpha_d);
        let boundary = utd_coefficient(n, k, p, r, theta_i, alpha_i, alpha_sb);
        let normalised = if boundary.abs() > f32::MIN_POSITIVE {
            utd / boundary
        } else {
            0.0
        };
        let coefficient = (1.0 - blend) * utd + blend * normalised;
        result[b] = (coefficient * coefficient).clamp(0.0, 1.0);
    }
    result
}

/// The Kouyoumjian UTD diffraction coefficient magnitude.
fn utd_coefficient(n: f32, k: f32, p: f32, r: f32, theta_i: f32, alpha_i: f32, alpha_d: f32) -> f32 {
    let l = spherical_distance(r, p) * theta_i.sin().powi(2);
    let f1 = fresnel_estimate(k * l * boundary_alpha(alpha_d - alpha_i, n, 1));
    let f2 = fresnel_estimate(k * l * boundary_alpha(alpha_d - alpha_i, n, -1));
    let f3 = fresnel_estimate(k * l * boundary_alpha(alpha_d + alpha_i, n, 1));
    let f4 = fresnel_estimate(k * l * boundary_alpha(alpha_d + alpha_i, n, -1));

    let cot1 = cotangent((PI + (alpha_d - alpha_i)) / (2.0 * n));
    let cot2 = cotangent((PI - (alpha_d - alpha_i)) / (2.0 * n));
    let cot3 = cotangent((PI + (alpha_d + alpha_i)) / (2.0 * n));
    let cot4 = cotangent((PI - (alpha_d + alpha_i)) / (2.0 * n));

    let mut coefficient = f1 * cot1 + f2 * cot2 + f3 * cot3 + f4 * cot4;
    coefficient *= frequency_term(n, k, theta_i);
    coefficient *= euler(-k * r);
    coefficient *= (p / (r * (p + r))).sqrt();
    coefficient.norm()
}

/// The `a±(β)` angular measure of separation from the shadow/reflection
/// boundary.
fn boundary_alpha(beta: f32, n: f32, n_sign: i32) -> f32 {
    let big_n = nearest_integer_n(beta, n, n_sign);
    let cosine = ((2.0 * PI * n * big_n as f32 - beta) / 2.0).cos();
    2.0 * cosine * cosine
}

/// The integer N that minimises |2πnN − β ∓ π|.
fn nearest_integer_n(beta: f32, n: f32, n_sign: i32) -> i32 {
    if n_sign > 0 {
        if beta <= PI * (n - 1.0) { 0 } else { 1 }
    } else if beta < PI * (1.0 - n) {
        -1
    } else if beta <= PI * (1.0 + n) {
        0
    } else {
        1
    }
}

/// Two-branch estimate of the Fresnel transition function F(X).
fn fresnel_estimate(x: f32) -> Complex32 {
    let phase = euler(0.25 * PI * (x / (x + 1.4)).sqrt());
    if x < 0.8 {
        let factor = (PI * x).sqrt() * (1.0 - x.sqrt() / (0.7 * x.sqrt() + 1.2));
        phase * factor
    } else {
        phase * (1.0 - 0.8 / (x + 1.25).powi(2))
    }
}

fn frequency_term(n: f32, k: f32, theta_i: f32) -> Complex32 {
    let numer = euler(-0.25 * PI);
    let denom = 2.0 * n * (2.0 * PI * k).sqrt() * theta_i.sin();
    if denom.abs() < f32::MIN_POSITIVE {
        return Complex32::new(0.0, 0.0);
    }
    -numer / denom
}

#[inline]
fn euler(x: f32) -> Complex32 {
    Complex32::new(x.cos(), x.sin())
}

#[inline]
fn spherical_distance(r: f32, p: f32) -> f32 {
    p * r / (p + r)
}

#[inline]
fn cotangent(x: f32) -> f32 {
    if x.abs() < 1e-6 {
        return f32::MAX;
    }
    1.0 / x.tan()
}

// ============ Tests ============

#[cfg(test)]
mod tests {
    use super::*;

    /// A right-angle wedge along the z axis: one face in the x-z plane
    /// (normal +y), the other in the y-z plane (normal +x).
    fn wedge_attenuation(listener_angle: f32) -> BandResponse {
        let edge = Vec3::new(0.0, 0.0, 1.0);
        let source_face_normal = Vec3::new(0.0, 1.0, 0.0);
        let listener_face_normal = Vec3::new(1.0, 0.0, 0.0);
        let source = Pt3::new(-10.0, 2.0, 0.0);
        let listener = Pt3::from(
            Vec3::new(listener_angle.cos(), -listener_angle.sin(), 0.0) * 5.0,
        );
        utd_attenuation(
            source,
            Pt3::origin(),
            listener,
            source_face_normal,
            listener_face_normal,
            edge,
            343.0,
            &FrequencyBands::default(),
        )
    }

    #[test]
    fn test_attenuation_in_unit_range() {
        for angle_deg in [5.0f32, 20.0, 45.0, 70.0] {
            let a = wedge_attenuation(angle_deg.to_radians());
            for b in 0..BAND_COUNT {
                assert!((0.0..=1.0).contains(&a[b]), "band {b} at {angle_deg}°: {}", a[b]);
            }
        }
    }

    #[test]
    fn test_low_bands_diffract_more() {
        // Deep in the shadow region, longer wavelengths bend better.
        let a = wedge_attenuation(60.0f32.to_radians());
        assert!(a[0] >= a[BAND_COUNT - 1]);
    }

    #[test]
    fn test_deeper_shadow_attenuates_more() {
        let shallow = wedge_attenuation(10.0f32.to_radians());
        let deep = wedge_attenuation(70.0f32.to_radians());
        // Compare a mid band.
        assert!(deep[4] <= shallow[4] + 1e-3);
    }

    #[test]
    fn test_degenerate_geometry_is_unit() {
        let a = utd_attenuation(
            Pt3::origin(),
            Pt3::origin(),
            Pt3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            343.0,
            &FrequencyBands::default(),
        );
        assert_eq!(a, BandResponse::default());
    }
}
