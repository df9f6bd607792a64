//! Error-state Kalman filtering toolbox for aided strapdown inertial navigation
//!
//! This crate implements a 24-state error-state extended Kalman filter (ESKF) that fuses
//! strapdown IMU integration with aiding sensors. The filter consumes time-stamped IMU
//! delta-angle/delta-velocity samples and aiding measurements as plain numeric inputs and
//! produces a state estimate, a covariance matrix, and an attitude quaternion as plain
//! numeric outputs. It is not an IMU driver and does not perform sensor calibration or
//! innovation-gating policy tuning; raw sample acquisition, telemetry, and logging of
//! flight data are the responsibility of the surrounding system.
//!
//! The filter state is an error-state formulation: the attitude is carried separately as a
//! unit quaternion, and the first three state-vector entries are a small-angle rotation
//! error on top of that quaternion. The full 24-element state vector is
//!
//! $$
//! x = [\delta\theta_{x,y,z},\ v_n, v_e, v_d,\ p_n, p_e, p_d,\ b_{\Delta\theta x,y,z},\
//! s_{\Delta\theta x,y,z},\ b_{\Delta v z},\ m_n, m_e, m_d,\ m_x, m_y, m_z,\ w_n, w_e]
//! $$
//!
//! covering attitude rotation error (rad), NED velocity (m/s), NED position (m),
//! delta-angle bias (rad), delta-angle scale factor, Z-axis delta-velocity bias (m/s),
//! earth magnetic field (mGauss, NED), body magnetic field (mGauss, hard iron), and
//! horizontal wind (m/s). The truth attitude is the estimate composed with the error
//! quaternion $q_t = \hat{q} \otimes [1, \tfrac{1}{2}\delta\theta]$; the rotation-error
//! states are zeroed whenever they are folded back into the quaternion, so they exist only
//! to linearize attitude uncertainty for the covariance.
//!
//! Primarily built off of [`nalgebra`](https://crates.io/crates/nalgebra) for the linear
//! algebra. The error-state conventions follow Sola, _Quaternion kinematics for the
//! error-state Kalman filter_; the strapdown mechanization is the local-level NED form of
//! Groves, _Principles of GNSS, Inertial, and Multisensor Integrated Navigation Systems,
//! 2nd Edition_, with coning/sculling and Coriolis/transport-rate terms deliberately
//! omitted as negligible for the target sensor grade.
//!
//! Module layout:
//! - [`state`]: state-vector index map, named accessors, and initial-state construction.
//! - [`linearize`]: closed-form sparse state-transition and noise Jacobians and the
//!   covariance propagation built from them.
//! - [`measurements`]: one measurement model per aiding sensor, each emitting scalar
//!   observations with sparse Jacobian rows.
//! - [`kalman`]: the [`kalman::Eskf`] filter itself with predict, sequential scalar
//!   fusion, and the error-state reset.
//! - [`linalg`]: covariance hygiene (symmetrization, diagonal flooring) and the sparse
//!   Jacobian row type.
//! - [`earth`]: gravity and earth magnetic-field helpers.
//! - [`sim`]: synthetic trajectory generation and CSV records for testing and the demo
//!   binary.

pub mod earth;
pub mod kalman;
pub mod linalg;
pub mod linearize;
pub mod measurements;
pub mod sim;
pub mod state;

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use std::fmt::Display;

/// A single IMU integration interval: integrated delta angle, integrated delta velocity,
/// and the interval length.
///
/// The deltas are in the body frame and are the raw integrals of the gyro and
/// accelerometer over the interval; bias and scale-factor correction is applied inside the
/// filter using its current error-term estimates, not by the caller. Gravity is *not*
/// removed from the delta velocity: a stationary, level IMU reports
/// `delta_velocity = [0, 0, -g * dt]`.
#[derive(Clone, Copy, Debug)]
pub struct ImuSample {
    /// Integrated angular increment in rad, body frame x, y, z
    pub delta_angle: Vector3<f64>,
    /// Integrated velocity increment in m/s, body frame x, y, z
    pub delta_velocity: Vector3<f64>,
    /// Integration interval in seconds
    pub dt: f64,
}

impl Display for ImuSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ImuSample {{ dAng: [{:.6}, {:.6}, {:.6}], dVel: [{:.4}, {:.4}, {:.4}], dt: {:.4} }}",
            self.delta_angle[0],
            self.delta_angle[1],
            self.delta_angle[2],
            self.delta_velocity[0],
            self.delta_velocity[1],
            self.delta_velocity[2],
            self.dt
        )
    }
}

impl ImuSample {
    /// Create a new sample from delta-angle and delta-velocity vectors.
    ///
    /// # Arguments
    /// * `delta_angle` - Integrated angular increment in rad, body x, y, z axis.
    /// * `delta_velocity` - Integrated velocity increment in m/s, body x, y, z axis.
    /// * `dt` - Integration interval in seconds.
    ///
    /// # Example
    /// ```rust
    /// use eskf_nav::ImuSample;
    /// use nalgebra::Vector3;
    /// let sample = ImuSample::new(
    ///     Vector3::new(0.0, 0.0, 0.0),
    ///     Vector3::new(0.0, 0.0, -9.80665 * 0.01), // stationary and level
    ///     0.01,
    /// );
    /// ```
    pub fn new(delta_angle: Vector3<f64>, delta_velocity: Vector3<f64>, dt: f64) -> ImuSample {
        ImuSample {
            delta_angle,
            delta_velocity,
            dt,
        }
    }
    /// Create a new sample from `Vec<f64>` components, convenient when reading records.
    pub fn new_from_vec(delta_angle: Vec<f64>, delta_velocity: Vec<f64>, dt: f64) -> ImuSample {
        ImuSample {
            delta_angle: Vector3::new(delta_angle[0], delta_angle[1], delta_angle[2]),
            delta_velocity: Vector3::new(delta_velocity[0], delta_velocity[1], delta_velocity[2]),
            dt,
        }
    }
}

// --- Attitude and rotation-error utilities ---

/// First-order delta quaternion for a small angular increment.
///
/// Returns the non-normalized quaternion $[1, \tfrac{1}{2}\Delta\theta]$. Valid while the
/// per-interval rotation stays small; callers renormalize after composing.
pub fn delta_quaternion(delta_angle: &Vector3<f64>) -> Quaternion<f64> {
    Quaternion::new(
        1.0,
        0.5 * delta_angle[0],
        0.5 * delta_angle[1],
        0.5 * delta_angle[2],
    )
}

/// Convert a rotation-error vector to a unit error quaternion.
///
/// Uses the first-order map $[1, \tfrac{1}{2}\delta\theta]$ followed by normalization.
/// This is the map used both to compose the truth attitude from the estimate and to fold
/// an error-state correction back into the quaternion.
///
/// # Example
/// ```rust
/// use eskf_nav::quaternion_from_rot_error;
/// use nalgebra::Vector3;
/// let q = quaternion_from_rot_error(&Vector3::new(0.0, 0.0, 0.0));
/// assert_eq!(q.w, 1.0);
/// ```
pub fn quaternion_from_rot_error(rot_error: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::new_normalize(delta_quaternion(rot_error))
}

/// Recover a rotation-error vector from a unit error quaternion.
///
/// Inverse of [`quaternion_from_rot_error`] to first order: twice the vector part, with
/// the scalar part forced non-negative first so the shorter of the two equivalent
/// rotations is returned.
pub fn rot_error_from_quaternion(dq: &UnitQuaternion<f64>) -> Vector3<f64> {
    let q = if dq.w < 0.0 {
        -dq.into_inner()
    } else {
        dq.into_inner()
    };
    2.0 * Vector3::new(q.i, q.j, q.k)
}

/// Wrap an angle in radians to the range $(-\pi, \pi]$.
///
/// Used when differencing heading-type measurements so innovations never jump by a full
/// turn.
///
/// # Example
/// ```rust
/// use eskf_nav::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    let mut wrapped = angle;
    while wrapped > std::f64::consts::PI {
        wrapped -= 2.0 * std::f64::consts::PI;
    }
    while wrapped < -std::f64::consts::PI {
        wrapped += 2.0 * std::f64::consts::PI;
    }
    wrapped
}

/// Wrap an angle in radians to the range $[0, 2\pi)$.
///
/// # Example
/// ```rust
/// use eskf_nav::wrap_to_2pi;
/// use std::f64::consts::PI;
/// let wrapped = wrap_to_2pi(5.0 * PI);
/// assert!((wrapped - PI).abs() < 1e-12);
/// ```
pub fn wrap_to_2pi(angle: f64) -> f64 {
    let mut wrapped = angle;
    while wrapped >= 2.0 * std::f64::consts::PI {
        wrapped -= 2.0 * std::f64::consts::PI;
    }
    while wrapped < 0.0 {
        wrapped += 2.0 * std::f64::consts::PI;
    }
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_imu_sample_new() {
        let sample = ImuSample::new(Vector3::zeros(), Vector3::new(0.0, 0.0, -0.0980665), 0.01);
        assert_eq!(sample.delta_angle, Vector3::zeros());
        assert_eq!(sample.delta_velocity[2], -0.0980665);
        assert_eq!(sample.dt, 0.01);
    }

    #[test]
    fn test_rot_error_quaternion_round_trip_small_angle() {
        let rot_error = Vector3::new(1e-4, -2e-4, 5e-5);
        let dq = quaternion_from_rot_error(&rot_error);
        let recovered = rot_error_from_quaternion(&dq);
        // first-order map, so agreement degrades quadratically with angle
        assert_approx_eq!(recovered[0], rot_error[0], 1e-10);
        assert_approx_eq!(recovered[1], rot_error[1], 1e-10);
        assert_approx_eq!(recovered[2], rot_error[2], 1e-10);
    }

    #[test]
    fn test_rot_error_sign_convention() {
        let dq = UnitQuaternion::new_normalize(Quaternion::new(-1.0, 0.0, 0.0, -0.01));
        let rot_error = rot_error_from_quaternion(&dq);
        // negated scalar part flips the vector part back to the short rotation
        assert!(rot_error[2] > 0.0);
    }

    #[test]
    fn test_delta_quaternion_matches_exact_small_rotation() {
        let dang = Vector3::new(0.0, 0.0, 1e-3);
        let approx = UnitQuaternion::new_normalize(delta_quaternion(&dang));
        let exact = UnitQuaternion::from_scaled_axis(dang);
        assert_approx_eq!(approx.w, exact.w, 1e-9);
        assert_approx_eq!(approx.k, exact.k, 1e-9);
    }

    #[test]
    fn test_composition_tracks_rotation() {
        // 100 composed 0.01 rad yaw increments equal one 1 rad yaw rotation
        let mut q = UnitQuaternion::identity();
        let dang = Vector3::new(0.0, 0.0, 0.01);
        for _ in 0..100 {
            q = UnitQuaternion::new_normalize(q.into_inner() * delta_quaternion(&dang));
        }
        let (_, _, yaw) = q.euler_angles();
        assert_approx_eq!(yaw, 1.0, 1e-4);
        assert_approx_eq!(q.norm(), 1.0, 1e-12);
    }

    #[test]
    fn test_wrap_to_pi() {
        assert_approx_eq!(wrap_to_pi(3.0 * PI / 2.0), -PI / 2.0, 1e-12);
        assert_approx_eq!(wrap_to_pi(-3.0 * PI / 2.0), PI / 2.0, 1e-12);
        assert_approx_eq!(wrap_to_pi(0.25), 0.25, 1e-12);
    }

    #[test]
    fn test_wrap_to_2pi() {
        assert_approx_eq!(wrap_to_2pi(5.0 * PI), PI, 1e-12);
        assert_approx_eq!(wrap_to_2pi(-PI / 2.0), 3.0 * PI / 2.0, 1e-12);
    }
}
