//! Linearization of the error-state process model: the state transition Jacobian $F$,
//! the noise input Jacobian $G$, the discrete process noise $Q$, and the covariance
//! propagation $P \leftarrow F P F^T + Q$.
//!
//! The error-state dynamics over one IMU interval are linear in the 24 error states and
//! nearly all of $F$ is the identity. The non-trivial blocks couple the rotation error to
//! the gyro bias and scale-factor states, the velocity error to the rotation error and
//! the vertical accelerometer bias, and the position error to the velocity error. The
//! covariance predictor exploits this sparsity: rather than forming the dense
//! $24 \times 24$ product, [`propagate_covariance`] updates only the rows and columns
//! that $F$ actually changes, which keeps the per-sample cost close to a handful of
//! $3 \times 24$ block operations.
//!
//! # State Ordering
//!
//! The 24-state error vector follows the ordering defined in [`crate::state::idx`]:
//! ```text
//! x = [rot_err(3), vel(3), pos(3), dang_bias(3), dang_scale(3), dvz_bias(1),
//!      mag_earth(3), mag_body(3), wind(2)]
//! ```
//!
//! # References
//!
//! The error-state formulation follows Sola, "Quaternion kinematics for the error-state
//! Kalman filter", with the process noise mapping in the style of Groves, "Principles of
//! GNSS, Inertial, and Multisensor Integrated Navigation Systems, 2nd Edition",
//! Chapter 14.2.

use crate::earth::vector_to_skew_symmetric;
use crate::kalman::FilterConfig;
use crate::state::{idx, Covariance, NUM_STATES};
use nalgebra::{Matrix3, SMatrix, Vector3};

/// Number of white-noise inputs driving the error state: three delta-angle noises and
/// three delta-velocity noises.
pub const NUM_NOISE_INPUTS: usize = 6;

/// Assemble the dense state transition Jacobian $F$ for one IMU interval.
///
/// The matrix is the identity except for the blocks
///
/// $$
/// F_{rr} = I - \frac{1}{2}[\Delta\theta \times], \quad
/// F_{rb} = -I, \quad
/// F_{rs} = \mathrm{diag}(\Delta\theta_{raw}), \quad
/// F_{vr} = -T_{bn}[\Delta v \times], \quad
/// F_{vz} = -T_{bn}\,e_3, \quad
/// F_{pv} = \Delta t\, I
/// $$
///
/// where $\Delta\theta$ and $\Delta v$ are the bias- and scale-corrected delta angle and
/// delta velocity, $\Delta\theta_{raw}$ is the uncorrected delta angle, and $T_{bn}$ is
/// the body-to-NED rotation at the start of the interval.
///
/// The sequential covariance predictor does not call this function; it exists as the
/// dense reference for the block-sparse [`propagate_covariance`] path and for offline
/// analysis.
///
/// # Arguments
/// * `tbn` - body-to-NED rotation matrix of the truth attitude at the start of the interval
/// * `dang_raw` - raw delta angle from the IMU (rad)
/// * `dang_true` - bias- and scale-corrected delta angle (rad)
/// * `dvel_true` - bias-corrected delta velocity (m/s)
/// * `dt` - IMU interval (s)
pub fn state_transition_jacobian(
    tbn: &Matrix3<f64>,
    dang_raw: &Vector3<f64>,
    dang_true: &Vector3<f64>,
    dvel_true: &Vector3<f64>,
    dt: f64,
) -> Covariance {
    let mut f: Covariance = SMatrix::identity();

    // Rotation error rows: F_rr = I - 0.5 * skew(dang_true)
    f[(0, 1)] = 0.5 * dang_true[2];
    f[(0, 2)] = -0.5 * dang_true[1];
    f[(1, 0)] = -0.5 * dang_true[2];
    f[(1, 2)] = 0.5 * dang_true[0];
    f[(2, 0)] = 0.5 * dang_true[1];
    f[(2, 1)] = -0.5 * dang_true[0];

    // Rotation error w.r.t. delta-angle bias and scale factor.
    for i in 0..3 {
        f[(idx::ROT_ERR + i, idx::DANG_BIAS + i)] = -1.0;
        f[(idx::ROT_ERR + i, idx::DANG_SCALE + i)] = dang_raw[i];
    }

    // Velocity rows: F_vr = -Tbn * skew(dvel_true), F_vz = -Tbn e3.
    let fvr = -tbn * vector_to_skew_symmetric(dvel_true);
    for i in 0..3 {
        for j in 0..3 {
            f[(idx::VEL + i, idx::ROT_ERR + j)] = fvr[(i, j)];
        }
        f[(idx::VEL + i, idx::DVEL_Z_BIAS)] = -tbn[(i, 2)];
    }

    // Position rows: F_pv = dt * I.
    for i in 0..3 {
        f[(idx::POS + i, idx::VEL + i)] = dt;
    }

    f
}

/// Assemble the noise input Jacobian $G$ mapping the six IMU noise inputs into the error
/// state: delta-angle noise enters the rotation error through the scale factor, and
/// delta-velocity noise enters the velocity error through the body-to-NED rotation.
pub fn noise_input_jacobian(
    tbn: &Matrix3<f64>,
    dang_scale: &Vector3<f64>,
) -> SMatrix<f64, NUM_STATES, NUM_NOISE_INPUTS> {
    let mut g: SMatrix<f64, NUM_STATES, NUM_NOISE_INPUTS> = SMatrix::zeros();
    for i in 0..3 {
        g[(idx::ROT_ERR + i, i)] = dang_scale[i];
        for j in 0..3 {
            g[(idx::VEL + i, 3 + j)] = tbn[(i, j)];
        }
    }
    g
}

/// Assemble the discrete process noise $Q = G\,\mathrm{diag}(\sigma^2_{IMU})\,G^T$ plus
/// the random-walk terms that drive the bias, scale, magnetic field, and wind states.
///
/// The IMU contribution is block diagonal: the rotation error picks up
/// $\mathrm{diag}(s_i^2 \sigma^2_{\Delta\theta,i})$ and the velocity error
/// $T_{bn}\,\mathrm{diag}(\sigma^2_{\Delta v})\,T_{bn}^T$. The slow states receive
/// $(\dot\sigma \Delta t)^2$ on the diagonal, where $\dot\sigma$ is the configured
/// random-walk density for the group.
pub fn process_noise(
    tbn: &Matrix3<f64>,
    dang_scale: &Vector3<f64>,
    config: &FilterConfig,
    dt: f64,
) -> Covariance {
    let mut q: Covariance = SMatrix::zeros();

    for i in 0..3 {
        q[(idx::ROT_ERR + i, idx::ROT_ERR + i)] =
            dang_scale[i] * dang_scale[i] * config.delta_angle_var[i];
    }

    let qv = tbn * Matrix3::from_diagonal(&config.delta_velocity_var) * tbn.transpose();
    for i in 0..3 {
        for j in 0..3 {
            q[(idx::VEL + i, idx::VEL + j)] = qv[(i, j)];
        }
    }

    let walk = |density: f64| (density * dt) * (density * dt);
    for i in 0..3 {
        q[(idx::DANG_BIAS + i, idx::DANG_BIAS + i)] = walk(config.dang_bias_pnoise);
        q[(idx::DANG_SCALE + i, idx::DANG_SCALE + i)] = walk(config.dang_scale_pnoise);
        q[(idx::MAG_EARTH + i, idx::MAG_EARTH + i)] = walk(config.mag_earth_pnoise);
        q[(idx::MAG_BODY + i, idx::MAG_BODY + i)] = walk(config.mag_body_pnoise);
    }
    q[(idx::DVEL_Z_BIAS, idx::DVEL_Z_BIAS)] = walk(config.dvz_bias_pnoise);
    for i in 0..2 {
        q[(idx::WIND + i, idx::WIND + i)] = walk(config.wind_pnoise);
    }

    q
}

/// Propagate the covariance through one IMU interval, $P \leftarrow F P F^T + Q$,
/// exploiting the sparsity of $F$.
///
/// Only the rotation, velocity, and position rows of $F$ differ from the identity, so
/// $A = F P$ touches nine rows of $P$ and $B = A F^T$ the mirror-image nine columns of
/// $A$. The result is symmetrized by construction of the two-sided update and the caller
/// is expected to run [`crate::linalg::condition_covariance`] afterwards to absorb
/// floating-point drift.
///
/// # Arguments
/// * `p` - prior covariance
/// * `tbn` - body-to-NED rotation of the truth attitude at the start of the interval
/// * `dang_raw` - raw delta angle from the IMU (rad)
/// * `dang_true` - bias- and scale-corrected delta angle (rad)
/// * `dvel_true` - bias-corrected delta velocity (m/s)
/// * `dang_scale` - current delta-angle scale-factor estimate, for the process noise
/// * `dt` - IMU interval (s)
/// * `config` - noise parameters for the process noise terms
#[allow(clippy::too_many_arguments)]
pub fn propagate_covariance(
    p: &Covariance,
    tbn: &Matrix3<f64>,
    dang_raw: &Vector3<f64>,
    dang_true: &Vector3<f64>,
    dvel_true: &Vector3<f64>,
    dang_scale: &Vector3<f64>,
    dt: f64,
    config: &FilterConfig,
) -> Covariance {
    let frr = Matrix3::identity() - 0.5 * vector_to_skew_symmetric(dang_true);
    let fvr = -tbn * vector_to_skew_symmetric(dvel_true);
    let fvz = -tbn.column(2).into_owned();
    let raw = Matrix3::from_diagonal(dang_raw);

    // A = F * P: only the rotation, velocity, and position rows change.
    let mut a = *p;
    let p_rot = p.fixed_rows::<3>(idx::ROT_ERR).into_owned();
    let p_vel = p.fixed_rows::<3>(idx::VEL).into_owned();
    let p_bias = p.fixed_rows::<3>(idx::DANG_BIAS).into_owned();
    let p_scale = p.fixed_rows::<3>(idx::DANG_SCALE).into_owned();
    let p_dvz = p.row(idx::DVEL_Z_BIAS).into_owned();

    a.fixed_rows_mut::<3>(idx::ROT_ERR)
        .copy_from(&(frr * p_rot - p_bias + raw * p_scale));
    a.fixed_rows_mut::<3>(idx::VEL)
        .copy_from(&(fvr * p_rot + p_vel + fvz * p_dvz));
    a.fixed_rows_mut::<3>(idx::POS)
        .copy_from(&(p.fixed_rows::<3>(idx::POS).into_owned() + dt * p_vel));

    // B = A * F^T: the mirror-image column update on A.
    let mut b = a;
    let a_rot = a.fixed_columns::<3>(idx::ROT_ERR).into_owned();
    let a_vel = a.fixed_columns::<3>(idx::VEL).into_owned();
    let a_bias = a.fixed_columns::<3>(idx::DANG_BIAS).into_owned();
    let a_scale = a.fixed_columns::<3>(idx::DANG_SCALE).into_owned();
    let a_dvz = a.column(idx::DVEL_Z_BIAS).into_owned();

    b.fixed_columns_mut::<3>(idx::ROT_ERR)
        .copy_from(&(a_rot * frr.transpose() - a_bias + a_scale * raw));
    b.fixed_columns_mut::<3>(idx::VEL)
        .copy_from(&(a_rot * fvr.transpose() + a_vel + a_dvz * fvz.transpose()));
    b.fixed_columns_mut::<3>(idx::POS)
        .copy_from(&(a.fixed_columns::<3>(idx::POS).into_owned() + dt * a_vel));

    b + process_noise(tbn, dang_scale, config, dt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::UnitQuaternion;

    fn test_attitude() -> Matrix3<f64> {
        UnitQuaternion::from_euler_angles(0.05, -0.1, 1.3)
            .to_rotation_matrix()
            .into_inner()
    }

    fn test_config() -> FilterConfig {
        let mut config = FilterConfig::default();
        config.delta_angle_var = Vector3::new(1e-8, 2e-8, 1.5e-8);
        config.delta_velocity_var = Vector3::new(1e-4, 1e-4, 4e-4);
        config.dang_bias_pnoise = 1e-6;
        config.dang_scale_pnoise = 1e-5;
        config.dvz_bias_pnoise = 1e-3;
        config.mag_earth_pnoise = 1e-2;
        config.mag_body_pnoise = 5e-3;
        config.wind_pnoise = 0.1;
        config
    }

    /// Deterministic symmetric positive-definite covariance for the propagation tests.
    fn test_covariance() -> Covariance {
        let mut m: Covariance = SMatrix::zeros();
        for i in 0..NUM_STATES {
            for j in 0..NUM_STATES {
                m[(i, j)] = (((i * 31 + j * 17) % 13) as f64) * 0.1 - 0.6;
            }
        }
        0.01 * m * m.transpose() + 0.1 * Covariance::identity()
    }

    #[test]
    fn test_jacobian_structure_at_zero_deltas() {
        let tbn = test_attitude();
        let zero = Vector3::zeros();
        let f = state_transition_jacobian(&tbn, &zero, &zero, &zero, 0.01);
        for i in 0..3 {
            assert_approx_eq!(f[(idx::ROT_ERR + i, idx::ROT_ERR + i)], 1.0, 1e-15);
            assert_approx_eq!(f[(idx::ROT_ERR + i, idx::DANG_BIAS + i)], -1.0, 1e-15);
            assert_approx_eq!(f[(idx::ROT_ERR + i, idx::DANG_SCALE + i)], 0.0, 1e-15);
            assert_approx_eq!(f[(idx::VEL + i, idx::DVEL_Z_BIAS)], -tbn[(i, 2)], 1e-15);
            assert_approx_eq!(f[(idx::POS + i, idx::VEL + i)], 0.01, 1e-15);
        }
        // Slow states are untouched by the transition.
        for i in idx::DANG_BIAS..NUM_STATES {
            for j in 0..NUM_STATES {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_approx_eq!(f[(i, j)], expected, 1e-15);
            }
        }
    }

    #[test]
    fn test_noise_input_jacobian_structure() {
        let tbn = test_attitude();
        let scale = Vector3::new(1.01, 0.99, 1.02);
        let g = noise_input_jacobian(&tbn, &scale);
        for i in 0..3 {
            assert_approx_eq!(g[(idx::ROT_ERR + i, i)], scale[i], 1e-15);
            for j in 0..3 {
                assert_approx_eq!(g[(idx::VEL + i, 3 + j)], tbn[(i, j)], 1e-15);
            }
        }
        for i in idx::POS..NUM_STATES {
            for j in 0..NUM_NOISE_INPUTS {
                assert_approx_eq!(g[(i, j)], 0.0, 1e-15);
            }
        }
    }

    #[test]
    fn test_process_noise_matches_mapped_imu_noise() {
        let tbn = test_attitude();
        let scale = Vector3::new(1.01, 0.99, 1.02);
        let config = test_config();
        let dt = 0.01;
        let q = process_noise(&tbn, &scale, &config, dt);

        let g = noise_input_jacobian(&tbn, &scale);
        let mut imu: SMatrix<f64, NUM_NOISE_INPUTS, NUM_NOISE_INPUTS> = SMatrix::zeros();
        for i in 0..3 {
            imu[(i, i)] = config.delta_angle_var[i];
            imu[(3 + i, 3 + i)] = config.delta_velocity_var[i];
        }
        let mapped = g * imu * g.transpose();
        for i in 0..idx::DANG_BIAS {
            for j in 0..NUM_STATES {
                assert_approx_eq!(q[(i, j)], mapped[(i, j)], 1e-15);
            }
        }
        let bias_walk = (config.dang_bias_pnoise * dt) * (config.dang_bias_pnoise * dt);
        assert_approx_eq!(q[(idx::DANG_BIAS, idx::DANG_BIAS)], bias_walk, 1e-20);
        let wind_walk = (config.wind_pnoise * dt) * (config.wind_pnoise * dt);
        assert_approx_eq!(q[(idx::WIND + 1, idx::WIND + 1)], wind_walk, 1e-12);
    }

    #[test]
    fn test_propagate_covariance_matches_dense_reference() {
        let tbn = test_attitude();
        let dang_raw = Vector3::new(0.011, -0.004, 0.0205);
        let scale = Vector3::new(1.01, 0.99, 1.02);
        let dang_bias = Vector3::new(1e-4, -2e-4, 5e-5);
        let dang_true = dang_raw.component_mul(&scale) - dang_bias;
        let dvel_true = Vector3::new(0.02, -0.015, -0.0981);
        let dt = 0.01;
        let config = test_config();
        let p = test_covariance();

        let fast = propagate_covariance(
            &p, &tbn, &dang_raw, &dang_true, &dvel_true, &scale, dt, &config,
        );

        let f = state_transition_jacobian(&tbn, &dang_raw, &dang_true, &dvel_true, dt);
        let reference = f * p * f.transpose() + process_noise(&tbn, &scale, &config, dt);
        for i in 0..NUM_STATES {
            for j in 0..NUM_STATES {
                assert_approx_eq!(fast[(i, j)], reference[(i, j)], 1e-10);
            }
        }
    }

    #[test]
    fn test_propagate_covariance_preserves_symmetry() {
        let tbn = test_attitude();
        let dang_raw = Vector3::new(0.01, 0.002, -0.005);
        let scale = Vector3::new(1.0, 1.0, 1.0);
        let dang_true = dang_raw;
        let dvel_true = Vector3::new(0.0, 0.0, -0.0981);
        let config = test_config();
        let mut p = test_covariance();
        for _ in 0..50 {
            p = propagate_covariance(
                &p, &tbn, &dang_raw, &dang_true, &dvel_true, &scale, 0.01, &config,
            );
        }
        for i in 0..NUM_STATES {
            for j in 0..NUM_STATES {
                assert_approx_eq!(p[(i, j)], p[(j, i)], 1e-9);
            }
            assert!(p[(i, i)] > 0.0);
        }
    }

    #[test]
    fn test_variance_grows_without_measurements() {
        let tbn = test_attitude();
        let dang_raw = Vector3::zeros();
        let scale = Vector3::new(1.0, 1.0, 1.0);
        let dvel_true = Vector3::new(0.0, 0.0, -0.0981);
        let config = test_config();
        let p_init = test_covariance();
        let mut p = p_init;
        for _ in 0..200 {
            p = propagate_covariance(
                &p, &tbn, &dang_raw, &dang_raw, &dvel_true, &scale, 0.01, &config,
            );
        }
        // Position variance grows through the velocity coupling, velocity variance
        // through the IMU noise.
        for i in 0..3 {
            assert!(p[(idx::POS + i, idx::POS + i)] > p_init[(idx::POS + i, idx::POS + i)]);
            assert!(p[(idx::VEL + i, idx::VEL + i)] > p_init[(idx::VEL + i, idx::VEL + i)]);
        }
    }
}
