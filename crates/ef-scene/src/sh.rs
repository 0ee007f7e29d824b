//! Real spherical harmonics
//!
//! Cartesian evaluation of the real SH basis up to order 4, used by the
//! band directivity fit. Coefficient layout is the usual (l, m) order:
//! index = l² + l + m.

use ef_core::Vec3;

/// Highest supported expansion order.
pub const MAX_SH_ORDER: usize = 4;

/// Number of basis functions for an expansion of the given order.
#[inline]
pub const fn coefficient_count(order: usize) -> usize {
    (order + 1) * (order + 1)
}

/// Evaluates the real SH basis for a unit direction into `out`, which must
/// hold at least `coefficient_count(order)` entries. Orders above
/// [`MAX_SH_ORDER`] are truncated.
pub fn eval_basis(order: usize, dir: Vec3, out: &mut [f32]) {
    let order = order.min(MAX_SH_ORDER);
    let (x, y, z) = (dir.x, dir.y, dir.z);

    out[0] = 0.282_095;
    if order < 1 {
        return;
    }

    out[1] = 0.488_603 * y;
    out[2] = 0.488_603 * z;
    out[3] = 0.488_603 * x;
    if order < 2 {
        return;
    }

    let (x2, y2, z2) = (x * x, y * y, z * z);
    out[4] = 1.092_548 * x * y;
    out[5] = 1.092_548 * y * z;
    out[6] = 0.315_392 * (3.0 * z2 - 1.0);
    out[7] = 1.092_548 * x * z;
    out[8] = 0.546_274 * (x2 - y2);
    if order < 3 {
        return;
    }

    out[9] = 0.590_044 * y * (3.0 * x2 - y2);
    out[10] = 2.890_611 * x * y * z;
    out[11] = 0.457_046 * y * (5.0 * z2 - 1.0);
    out[12] = 0.373_176 * z * (5.0 * z2 - 3.0);
    out[13] = 0.457_046 * x * (5.0 * z2 - 1.0);
    out[14] = 1.445_306 * z * (x2 - y2);
    out[15] = 0.590_044 * x * (x2 - 3.0 * y2);
    if order < 4 {
        return;
    }

    out[16] = 2.503_343 * x * y * (x2 - y2);
    out[17] = 1.770_131 * y * z * (3.0 * x2 - y2);
    out[18] = 0.946_175 * x * y * (7.0 * z2 - 1.0);
    out[19] = 0.669_047 * y * z * (7.0 * z2 - 3.0);
    out[20] = 0.105_786 * (35.0 * z2 * z2 - 30.0 * z2 + 3.0);
    out[21] = 0.669_047 * x * z * (7.0 * z2 - 3.0);
    out[22] = 0.473_087 * (x2 - y2) * (7.0 * z2 - 1.0);
    out[23] = 1.770_131 * x * z * (x2 - 3.0 * y2);
    out[24] = 0.625_836 * (x2 * x2 - 6.0 * x2 * y2 + y2 * y2);
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_coefficient_counts() {
        assert_eq!(coefficient_count(0), 1);
        assert_eq!(coefficient_count(2), 9);
        assert_eq!(coefficient_count(4), 25);
    }

    #[test]
    fn test_dc_term_is_constant() {
        let mut a = [0.0; 25];
        let mut b = [0.0; 25];
        eval_basis(4, Vec3::new(0.0, 0.0, 1.0), &mut a);
        eval_basis(4, Vec3::new(1.0, 0.0, 0.0).normalize(), &mut b);
        assert_relative_eq!(a[0], b[0]);
    }

    #[test]
    fn test_orthonormality_monte_carlo() {
        // ∫ Y_i·Y_j dΩ ≈ δ_ij via a uniform sphere sum.
        use rand::{Rng, SeedableRng};
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(11);
        let n = 200_000;
        let mut gram = [[0.0f64; 9]; 9];
        let mut basis = [0.0f32; 9];
        for _ in 0..n {
            let u1: f32 = rng.random_range(-1.0..1.0);
            let u2: f32 = rng.random_range(0.0..1.0);
            let r = (1.0 - u1 * u1).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            let dir = Vec3::new(r * theta.cos(), r * theta.sin(), u1);
            eval_basis(2, dir, &mut basis);
            for i in 0..9 {
                for j in 0..9 {
                    gram[i][j] += (basis[i] * basis[j]) as f64;
                }
            }
        }
        let norm = 4.0 * std::f64::consts::PI / n as f64;
        for i in 0..9 {
            for j in 0..9 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (gram[i][j] * norm - expected).abs() < 0.05,
                    "gram[{i}][{j}] = {}",
                    gram[i][j] * norm
                );
            }
        }
    }
}
