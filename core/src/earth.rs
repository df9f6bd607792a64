//! Earth-related constants and helpers: gravity and the ambient magnetic field.
//!
//! The filter runs in a local NED tangent frame with positions in meters, so there is no
//! geodetic machinery here; gravity is a configured scalar acting along the down axis and
//! the earth magnetic field is parameterized by its strength, inclination, and
//! declination. The dipole-model helpers exist to build plausible field vectors for
//! initialization, simulation, and tests; in flight the NED field is itself estimated as
//! part of the state vector.

use nalgebra::{Matrix3, Vector3};

/// Standard gravity in $m/s^2$, the default for the filter's configured gravity constant.
pub const GRAVITY: f64 = 9.80665;
/// Typical mid-latitude magnetic field strength in mGauss (IGRF order of magnitude).
pub const MAGNETIC_FIELD_STRENGTH: f64 = 500.0;

/// Convert a three-element vector to a skew-symmetric cross-product matrix.
///
/// $$
/// x = \begin{bmatrix} a \\\\ b \\\\ c \end{bmatrix} \rightarrow X = \begin{bmatrix} 0 & -c & b \\\\ c & 0 & -a \\\\ -b & a & 0 \end{bmatrix}
/// $$
///
/// # Example
/// ```rust
/// use nalgebra::{Vector3, Matrix3};
/// use eskf_nav::earth;
/// let v: Vector3<f64> = Vector3::new(1.0, 2.0, 3.0);
/// let skew: Matrix3<f64> = earth::vector_to_skew_symmetric(&v);
/// assert_eq!(skew * v, Vector3::zeros()); // v x v = 0
/// ```
pub fn vector_to_skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    let mut skew: Matrix3<f64> = Matrix3::zeros();
    skew[(0, 1)] = -v[2];
    skew[(0, 2)] = v[1];
    skew[(1, 0)] = v[2];
    skew[(1, 2)] = -v[0];
    skew[(2, 0)] = -v[1];
    skew[(2, 1)] = v[0];
    skew
}

/// Build a NED earth magnetic field vector from strength (mGauss), inclination (rad,
/// positive down), and declination (rad, positive east of true north).
///
/// # Example
/// ```rust
/// use eskf_nav::earth;
/// // equatorial field: horizontal, pointing true north
/// let field = earth::field_ned(500.0, 0.0, 0.0);
/// assert!((field[0] - 500.0).abs() < 1e-9);
/// assert!(field[2].abs() < 1e-9);
/// ```
pub fn field_ned(strength: f64, inclination: f64, declination: f64) -> Vector3<f64> {
    let horizontal = strength * inclination.cos();
    Vector3::new(
        horizontal * declination.cos(),
        horizontal * declination.sin(),
        strength * inclination.sin(),
    )
}

/// Magnetic declination implied by a NED field vector, `atan2(east, north)` in rad.
pub fn declination_of(field: &Vector3<f64>) -> f64 {
    field[1].atan2(field[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_skew_symmetric_matches_cross_product() {
        let a = Vector3::new(1.0, -2.0, 0.5);
        let b = Vector3::new(0.3, 4.0, -1.0);
        let skew = vector_to_skew_symmetric(&a);
        let cross = a.cross(&b);
        let via_skew = skew * b;
        for i in 0..3 {
            assert_approx_eq!(via_skew[i], cross[i], 1e-12);
        }
    }

    #[test]
    fn test_field_ned_strength_preserved() {
        let field = field_ned(480.0, 1.1, -0.2);
        assert_approx_eq!(field.norm(), 480.0, 1e-9);
    }

    #[test]
    fn test_declination_round_trip() {
        let decl = 0.15;
        let field = field_ned(500.0, 1.2, decl);
        assert_approx_eq!(declination_of(&field), decl, 1e-12);
    }
}
