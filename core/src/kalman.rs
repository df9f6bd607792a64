//! The error-state Kalman filter: configuration, the IMU predictor, and the sequential
//! fusion engine.
//!
//! [`Eskf`] carries three pieces of estimate: the reference attitude quaternion, the
//! 24-element state vector (whose first three entries are the rotation error relative to
//! that quaternion), and the covariance. [`Eskf::predict`] advances the state and
//! covariance through one IMU interval; [`Eskf::fuse`] applies a measurement model one
//! scalar row at a time, folding the rotation error back into the quaternion after every
//! applied row so the next row linearizes about a zero error.
//!
//! Every scalar update either fully applies or fully no-ops. A non-positive innovation
//! variance or a non-finite intermediate skips the row with a logged warning and an
//! explanatory [`FuseOutcome`], leaving state and covariance untouched, so one bad
//! magnetometer axis cannot poison the other two.

use crate::linalg::condition_covariance;
use crate::linearize;
use crate::measurements::{FusionContext, MeasurementModel, ScalarObservation};
use crate::state::{Covariance, InitialState, StateVector};
use crate::{delta_quaternion, quaternion_from_rot_error, rot_error_from_quaternion, wrap_to_pi};
use crate::{earth, ImuSample};

use std::fmt::{self, Display};

use log::{debug, warn};
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Floor applied to covariance diagonal entries after every predict and fusion.
pub const COVARIANCE_FLOOR: f64 = 0.0;

/// Errors surfaced by filter construction and operation.
///
/// Library code never panics; everything a caller can trigger at runtime arrives as one
/// of these variants.
#[derive(Debug, Error)]
pub enum EskfError {
    /// A configuration or initial-state value is negative or non-finite.
    #[error("invalid filter configuration: {reason}")]
    InvalidConfig { reason: String },
    /// The IMU interval is non-positive or non-finite; the state was not touched.
    #[error("invalid IMU interval dt = {dt}")]
    InvalidDt { dt: f64 },
    /// A measurement model hit a geometric singularity and produced no rows.
    #[error("degenerate measurement geometry in {model} model")]
    DegenerateGeometry { model: &'static str },
}

/// Filter tuning: physical constants, IMU noise, random-walk densities, and measurement
/// variances.
///
/// The defaults are a workable starting point for a small UAV with a consumer-grade IMU
/// sampled at 100 Hz; the IMU variances are per-sample delta variances, not continuous
/// densities.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Gravity magnitude in m/s², positive down.
    pub gravity: f64,
    /// Local magnetic declination in rad, east of true north.
    pub declination: f64,
    /// Lateral drag coefficient in 1/s; air density is folded into the calibration.
    pub k_acc: f64,
    /// Per-sample delta-angle noise variance, rad².
    pub delta_angle_var: Vector3<f64>,
    /// Per-sample delta-velocity noise variance, (m/s)².
    pub delta_velocity_var: Vector3<f64>,
    /// Delta-angle bias random-walk density, rad/s.
    pub dang_bias_pnoise: f64,
    /// Delta-angle scale-factor random-walk density, 1/s.
    pub dang_scale_pnoise: f64,
    /// Delta-velocity Z bias random-walk density, m/s².
    pub dvz_bias_pnoise: f64,
    /// Earth-field random-walk density, mGauss/s.
    pub mag_earth_pnoise: f64,
    /// Body-field random-walk density, mGauss/s.
    pub mag_body_pnoise: f64,
    /// Wind random-walk density, m/s².
    pub wind_pnoise: f64,
    /// NED horizontal velocity measurement variance, (m/s)².
    pub r_vel_ne: f64,
    /// NED vertical velocity measurement variance, (m/s)².
    pub r_vel_d: f64,
    /// NED horizontal position measurement variance, m².
    pub r_pos_ne: f64,
    /// NED vertical position measurement variance, m².
    pub r_pos_d: f64,
    /// True airspeed measurement variance, (m/s)².
    pub r_tas: f64,
    /// Sideslip pseudo-measurement variance, rad².
    pub r_beta: f64,
    /// Magnetometer flux measurement variance per axis, mGauss².
    pub r_mag: f64,
    /// Magnetic heading measurement variance, rad².
    pub r_mag_heading: f64,
    /// Synthetic declination measurement variance, rad².
    pub r_decl: f64,
    /// Optical-flow LOS rate variance, (rad/s)².
    pub r_los: f64,
    /// Lateral drag specific-force variance, (m/s²)².
    pub r_drag: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            gravity: earth::GRAVITY,
            declination: 0.0,
            k_acc: 0.35,
            delta_angle_var: Vector3::repeat(2.25e-8),
            delta_velocity_var: Vector3::repeat(1.2e-5),
            dang_bias_pnoise: 1e-5,
            dang_scale_pnoise: 1e-4,
            dvz_bias_pnoise: 1e-3,
            mag_earth_pnoise: 1e-3,
            mag_body_pnoise: 1e-4,
            wind_pnoise: 0.1,
            r_vel_ne: 0.09,
            r_vel_d: 0.09,
            r_pos_ne: 0.25,
            r_pos_d: 1.0,
            r_tas: 2.0,
            r_beta: 0.09,
            r_mag: 25.0,
            r_mag_heading: 0.09,
            r_decl: 0.25,
            r_los: 0.09,
            r_drag: 6.25,
        }
    }
}

impl FilterConfig {
    /// Reject negative or non-finite tuning values.
    ///
    /// The declination is the one signed entry; every variance, density, and coefficient
    /// must be non-negative, and a zero measurement variance is allowed (it drives the
    /// state to the measurement).
    pub fn validate(&self) -> Result<(), EskfError> {
        let invalid = |name: &str| EskfError::InvalidConfig {
            reason: format!("{name} must be finite and non-negative"),
        };
        if !self.gravity.is_finite() || self.gravity <= 0.0 {
            return Err(EskfError::InvalidConfig {
                reason: "gravity must be finite and positive".to_string(),
            });
        }
        if !self.declination.is_finite() {
            return Err(EskfError::InvalidConfig {
                reason: "declination must be finite".to_string(),
            });
        }
        for i in 0..3 {
            if !self.delta_angle_var[i].is_finite() || self.delta_angle_var[i] < 0.0 {
                return Err(invalid("delta_angle_var"));
            }
            if !self.delta_velocity_var[i].is_finite() || self.delta_velocity_var[i] < 0.0 {
                return Err(invalid("delta_velocity_var"));
            }
        }
        let non_negative = [
            ("k_acc", self.k_acc),
            ("dang_bias_pnoise", self.dang_bias_pnoise),
            ("dang_scale_pnoise", self.dang_scale_pnoise),
            ("dvz_bias_pnoise", self.dvz_bias_pnoise),
            ("mag_earth_pnoise", self.mag_earth_pnoise),
            ("mag_body_pnoise", self.mag_body_pnoise),
            ("wind_pnoise", self.wind_pnoise),
            ("r_vel_ne", self.r_vel_ne),
            ("r_vel_d", self.r_vel_d),
            ("r_pos_ne", self.r_pos_ne),
            ("r_pos_d", self.r_pos_d),
            ("r_tas", self.r_tas),
            ("r_beta", self.r_beta),
            ("r_mag", self.r_mag),
            ("r_mag_heading", self.r_mag_heading),
            ("r_decl", self.r_decl),
            ("r_los", self.r_los),
            ("r_drag", self.r_drag),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(name));
            }
        }
        Ok(())
    }
}

/// Outcome of one scalar fusion row.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FuseOutcome {
    /// The row was applied; innovation and its variance are reported for monitoring.
    Applied {
        innovation: f64,
        innovation_variance: f64,
    },
    /// Innovation variance was non-positive; state and covariance untouched.
    SkippedInnovationVariance,
    /// A non-finite value appeared in the innovation, gain, or Jacobian.
    SkippedNonFinite,
    /// The model reported a geometric singularity and produced no rows.
    SkippedDegenerateGeometry,
}

/// Deterministic part of the IMU state prediction.
///
/// Corrects the deltas with the current bias and scale states, composes the delta
/// rotation onto the truth attitude, and integrates velocity and position:
///
/// $$
/// \Delta\theta = \Delta\theta_{raw} \odot s - b_g, \quad
/// \Delta v = \Delta v_{raw} - \begin{bmatrix} 0 \\\\ 0 \\\\ b_{vz} \end{bmatrix}
/// $$
///
/// The quaternion estimate is not advanced; the integrated rotation lands in the
/// rotation-error states, computed against `q_est`. Velocity uses the truth DCM from
/// before the delta. The slow states pass through unchanged.
pub fn predict_state(
    q_est: &UnitQuaternion<f64>,
    x: &StateVector,
    imu: &ImuSample,
    gravity: f64,
) -> StateVector {
    let dang_true = imu
        .delta_angle
        .component_mul(&x.delta_angle_scale())
        - x.delta_angle_bias();
    let dvel_true = imu.delta_velocity - Vector3::new(0.0, 0.0, x.dvz_bias());

    let q_truth = q_est * quaternion_from_rot_error(&x.rot_error());
    let tbn = q_truth.to_rotation_matrix().into_inner();
    let q_truth_new = q_truth * UnitQuaternion::new_normalize(delta_quaternion(&dang_true));
    let rot_error_new = rot_error_from_quaternion(&(q_est.inverse() * q_truth_new));

    let velocity = x.velocity();
    let velocity_new = velocity + tbn * dvel_true + Vector3::new(0.0, 0.0, gravity * imu.dt);
    let position_new = x.position() + velocity * imu.dt;

    let mut x_new = *x;
    x_new.set_rot_error(&rot_error_new);
    x_new.set_velocity(&velocity_new);
    x_new.set_position(&position_new);
    x_new
}

/// The 24-state error-state Kalman filter.
pub struct Eskf {
    q_est: UnitQuaternion<f64>,
    x: StateVector,
    p: Covariance,
    config: FilterConfig,
}

impl Display for Eskf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roll, pitch, yaw) = self.attitude().euler_angles();
        let velocity = self.x.velocity();
        let position = self.x.position();
        write!(
            f,
            "Eskf(rpy: [{:.4}, {:.4}, {:.4}] rad, vel: [{:.3}, {:.3}, {:.3}] m/s, pos: [{:.2}, {:.2}, {:.2}] m)",
            roll, pitch, yaw, velocity[0], velocity[1], velocity[2], position[0], position[1], position[2]
        )
    }
}

impl Eskf {
    /// Construct the filter from initial conditions and tuning.
    ///
    /// # Errors
    /// `EskfError::InvalidConfig` when the configuration or any initial standard
    /// deviation is negative or non-finite.
    pub fn new(init: &InitialState, config: FilterConfig) -> Result<Eskf, EskfError> {
        config.validate()?;
        for std in init.std_devs() {
            if !std.is_finite() || std < 0.0 {
                return Err(EskfError::InvalidConfig {
                    reason: "initial standard deviations must be finite and non-negative"
                        .to_string(),
                });
            }
        }
        Ok(Eskf {
            q_est: UnitQuaternion::from_euler_angles(init.roll, init.pitch, init.yaw),
            x: init.state_vector(),
            p: init.covariance(),
            config,
        })
    }

    /// Current state vector. The rotation-error entries are nonzero between a predict
    /// and the next fusion or explicit reset.
    pub fn state(&self) -> &StateVector {
        &self.x
    }

    /// Current covariance.
    pub fn covariance(&self) -> &Covariance {
        &self.p
    }

    /// Filter tuning.
    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Truth attitude: the quaternion estimate composed with any pending rotation error.
    pub fn attitude(&self) -> UnitQuaternion<f64> {
        self.q_est * quaternion_from_rot_error(&self.x.rot_error())
    }

    /// Advance state and covariance through one IMU interval.
    ///
    /// # Errors
    /// `EskfError::InvalidDt` for a non-positive or non-finite `dt`; state and
    /// covariance are untouched.
    pub fn predict(&mut self, imu: &ImuSample) -> Result<(), EskfError> {
        if !imu.dt.is_finite() || imu.dt <= 0.0 {
            return Err(EskfError::InvalidDt { dt: imu.dt });
        }

        let scale = self.x.delta_angle_scale();
        let dang_true = imu.delta_angle.component_mul(&scale) - self.x.delta_angle_bias();
        let dvel_true = imu.delta_velocity - Vector3::new(0.0, 0.0, self.x.dvz_bias());
        let tbn = (self.q_est * quaternion_from_rot_error(&self.x.rot_error()))
            .to_rotation_matrix()
            .into_inner();

        self.x = predict_state(&self.q_est, &self.x, imu, self.config.gravity);
        self.p = linearize::propagate_covariance(
            &self.p,
            &tbn,
            &imu.delta_angle,
            &dang_true,
            &dvel_true,
            &scale,
            imu.dt,
            &self.config,
        );
        if condition_covariance(&mut self.p, COVARIANCE_FLOOR) {
            debug!("covariance conditioned after predict");
        }
        Ok(())
    }

    /// Fuse a measurement model, one scalar row at a time.
    ///
    /// Rows are evaluated once against the pre-fusion state and applied sequentially;
    /// the rotation error is folded into the quaternion after every applied row so each
    /// Jacobian stays valid at a zero operating point. The returned outcomes are in row
    /// order, so a caller can see which magnetometer axis was rejected without losing
    /// the others.
    pub fn fuse(&mut self, model: &dyn MeasurementModel) -> Vec<FuseOutcome> {
        let context = FusionContext::new(self.attitude(), &self.x, &self.config);
        let observations = match model.observations(&context) {
            Ok(observations) => observations,
            Err(error) => {
                warn!("{} fusion skipped: {error}", model.name());
                return vec![FuseOutcome::SkippedDegenerateGeometry];
            }
        };
        observations
            .iter()
            .map(|observation| self.fuse_scalar(observation, model.name()))
            .collect()
    }

    /// Apply one scalar observation: innovate, gain, correct, reset.
    fn fuse_scalar(&mut self, observation: &ScalarObservation, name: &'static str) -> FuseOutcome {
        let mut innovation = observation.measured - observation.predicted;
        if observation.angular {
            innovation = wrap_to_pi(innovation);
        }
        if !innovation.is_finite()
            || !observation.variance.is_finite()
            || !observation.jacobian.is_finite()
        {
            warn!("{name} row skipped: non-finite innovation or Jacobian");
            return FuseOutcome::SkippedNonFinite;
        }

        let pht = observation.jacobian.mul_covariance(&self.p);
        if !pht.iter().all(|value| value.is_finite()) {
            warn!("{name} row skipped: non-finite gain numerator");
            return FuseOutcome::SkippedNonFinite;
        }
        let innovation_variance = observation.jacobian.dot(&pht) + observation.variance;
        if !innovation_variance.is_finite() {
            warn!("{name} row skipped: non-finite innovation variance");
            return FuseOutcome::SkippedNonFinite;
        }
        if innovation_variance <= 0.0 {
            warn!(
                "{name} row skipped: innovation variance {innovation_variance} not positive"
            );
            return FuseOutcome::SkippedInnovationVariance;
        }

        let gain = pht / innovation_variance;
        *self.x += gain * innovation;
        self.p -= gain * pht.transpose();
        if condition_covariance(&mut self.p, COVARIANCE_FLOOR) {
            debug!("covariance conditioned after {name} fusion");
        }
        self.reset_error_state();

        FuseOutcome::Applied {
            innovation,
            innovation_variance,
        }
    }

    /// Fold the rotation-error states into the quaternion estimate and zero them.
    ///
    /// Runs automatically after every applied fusion row; exposed for callers that
    /// predict for long stretches without fusing and want the quaternion to track.
    pub fn reset_error_state(&mut self) {
        let rot_error = self.x.rot_error();
        if rot_error == Vector3::zeros() {
            return;
        }
        self.q_est *= quaternion_from_rot_error(&rot_error);
        self.x.zero_rot_error();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linearize::state_transition_jacobian;
    use crate::measurements::{MagFlux, TrueAirspeed, VelocityNed};
    use crate::state::{idx, NUM_STATES};
    use assert_approx_eq::assert_approx_eq;

    /// IMU sample for a stationary vehicle: the accelerometer senses the gravity
    /// reaction rotated into the body frame.
    fn stationary_imu(attitude: &UnitQuaternion<f64>, gravity: f64, dt: f64) -> ImuSample {
        let dvel_ned = Vector3::new(0.0, 0.0, -gravity * dt);
        ImuSample::new(
            Vector3::zeros(),
            attitude.inverse_transform_vector(&dvel_ned),
            dt,
        )
    }

    fn test_filter() -> Eskf {
        let init = InitialState {
            yaw: 0.7,
            velocity: [5.0, -1.0, 0.2],
            mag_earth: [420.0, 60.0, 230.0],
            ..InitialState::default()
        };
        Eskf::new(&init, FilterConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = FilterConfig::default();
        config.r_mag = -1.0;
        assert!(matches!(
            Eskf::new(&InitialState::default(), config),
            Err(EskfError::InvalidConfig { .. })
        ));
        let mut config = FilterConfig::default();
        config.dang_bias_pnoise = f64::NAN;
        assert!(config.validate().is_err());
        assert!(FilterConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_initial_std_rejected() {
        let init = InitialState {
            velocity_std: -0.5,
            ..InitialState::default()
        };
        assert!(matches!(
            Eskf::new(&init, FilterConfig::default()),
            Err(EskfError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_invalid_dt_leaves_state_untouched() {
        let mut filter = test_filter();
        let x_before = *filter.state();
        let p_before = *filter.covariance();
        let imu = ImuSample::new(Vector3::zeros(), Vector3::zeros(), 0.0);
        assert!(matches!(
            filter.predict(&imu),
            Err(EskfError::InvalidDt { .. })
        ));
        assert_eq!(*filter.state(), x_before);
        assert_eq!(*filter.covariance(), p_before);
    }

    #[test]
    fn test_stationary_prediction_holds_still() {
        let init = InitialState {
            roll: 0.02,
            pitch: -0.01,
            yaw: 1.2,
            ..InitialState::default()
        };
        let mut filter = Eskf::new(&init, FilterConfig::default()).unwrap();
        let attitude_before = filter.attitude();
        let dt = 0.01;
        let imu = stationary_imu(&attitude_before, filter.config().gravity, dt);
        for _ in 0..100 {
            filter.predict(&imu).unwrap();
        }
        let velocity = filter.state().velocity();
        let position = filter.state().position();
        for i in 0..3 {
            assert_approx_eq!(velocity[i], 0.0, 1e-9);
            assert_approx_eq!(position[i], 0.0, 1e-9);
        }
        assert_approx_eq!(filter.attitude().angle_to(&attitude_before), 0.0, 1e-9);
        assert_approx_eq!(filter.attitude().norm(), 1.0, 1e-12);
    }

    #[test]
    fn test_transition_jacobian_matches_finite_difference() {
        let q_est = UnitQuaternion::from_euler_angles(0.05, -0.1, 1.3);
        let mut x = StateVector::new();
        x.set_velocity(&Vector3::new(10.0, 2.0, -0.5));
        x.set_position(&Vector3::new(100.0, -20.0, -50.0));
        for i in 0..3 {
            x[idx::DANG_BIAS + i] = [1e-5, -2e-5, 5e-6][i];
            x[idx::DANG_SCALE + i] = [1.01, 0.99, 1.02][i];
        }
        x[idx::DVEL_Z_BIAS] = 2e-4;
        // Deltas small enough that the first-order error-quaternion composition the
        // Jacobian assumes holds to well below the comparison tolerance.
        let imu = ImuSample::new(
            Vector3::new(1.1e-4, -4.0e-5, 2.05e-4),
            Vector3::new(2.0e-4, -1.5e-4, -9.81e-4),
            0.01,
        );
        let gravity = earth::GRAVITY;

        let scale = x.delta_angle_scale();
        let dang_true = imu.delta_angle.component_mul(&scale) - x.delta_angle_bias();
        let dvel_true = imu.delta_velocity - Vector3::new(0.0, 0.0, x.dvz_bias());
        let tbn = q_est.to_rotation_matrix().into_inner();
        let f = state_transition_jacobian(&tbn, &imu.delta_angle, &dang_true, &dvel_true, imu.dt);

        let eps = 1e-6;
        for j in 0..NUM_STATES {
            let mut x_plus = x;
            let mut x_minus = x;
            x_plus[j] += eps;
            x_minus[j] -= eps;
            let f_plus = predict_state(&q_est, &x_plus, &imu, gravity);
            let f_minus = predict_state(&q_est, &x_minus, &imu, gravity);
            for i in 0..NUM_STATES {
                let numeric = (f_plus[i] - f_minus[i]) / (2.0 * eps);
                assert_approx_eq!(f[(i, j)], numeric, 1e-6);
            }
        }
    }

    #[test]
    fn test_velocity_fusion_pulls_state_and_shrinks_variance() {
        let init = InitialState {
            velocity_std: 10.0,
            ..InitialState::default()
        };
        let mut filter = Eskf::new(&init, FilterConfig::default()).unwrap();
        let variance_before = filter.covariance()[(idx::VEL, idx::VEL)];
        let outcomes = filter.fuse(&VelocityNed {
            velocity: Vector3::new(5.0, 0.0, 0.0),
        });
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], FuseOutcome::Applied { .. }));
        // Diffuse prior: the estimate moves nearly all the way to the measurement.
        assert!(filter.state().velocity()[0] > 4.9);
        assert!(filter.covariance()[(idx::VEL, idx::VEL)] < variance_before);
    }

    #[test]
    fn test_huge_r_fusion_is_a_no_op() {
        let mut config = FilterConfig::default();
        config.r_vel_ne = 1e12;
        config.r_vel_d = 1e12;
        let mut filter = Eskf::new(&InitialState::default(), config).unwrap();
        let outcomes = filter.fuse(&VelocityNed {
            velocity: Vector3::new(5.0, 0.0, 0.0),
        });
        assert!(matches!(outcomes[0], FuseOutcome::Applied { .. }));
        assert_approx_eq!(filter.state().velocity()[0], 0.0, 1e-6);
    }

    #[test]
    fn test_zero_r_fusion_reaches_the_measurement() {
        let mut config = FilterConfig::default();
        config.r_vel_ne = 0.0;
        config.r_vel_d = 0.0;
        let mut filter = Eskf::new(&InitialState::default(), config).unwrap();
        filter.fuse(&VelocityNed {
            velocity: Vector3::new(5.0, -2.0, 1.0),
        });
        let velocity = filter.state().velocity();
        assert_approx_eq!(velocity[0], 5.0, 1e-9);
        assert_approx_eq!(velocity[1], -2.0, 1e-9);
        assert_approx_eq!(velocity[2], 1.0, 1e-9);
    }

    #[test]
    fn test_repeated_fusion_strictly_decreases_variance() {
        let mut filter = test_filter();
        let model = VelocityNed {
            velocity: Vector3::new(5.0, -1.0, 0.2),
        };
        filter.fuse(&model);
        let after_first = filter.covariance()[(idx::VEL, idx::VEL)];
        filter.fuse(&model);
        let after_second = filter.covariance()[(idx::VEL, idx::VEL)];
        assert!(after_second < after_first);
        assert!(after_second > 0.0);
    }

    #[test]
    fn test_zero_prior_and_zero_r_row_is_skipped() {
        let mut config = FilterConfig::default();
        config.r_vel_ne = 0.0;
        config.r_vel_d = 0.0;
        let init = InitialState {
            velocity_std: 0.0,
            ..InitialState::default()
        };
        let mut filter = Eskf::new(&init, config).unwrap();
        let outcomes = filter.fuse(&VelocityNed {
            velocity: Vector3::new(1.0, 0.0, 0.0),
        });
        assert_eq!(outcomes[0], FuseOutcome::SkippedInnovationVariance);
        assert_approx_eq!(filter.state().velocity()[0], 0.0, 1e-15);
    }

    #[test]
    fn test_non_finite_measurement_row_is_skipped() {
        let mut filter = test_filter();
        let x_before = *filter.state();
        let outcomes = filter.fuse(&VelocityNed {
            velocity: Vector3::new(f64::NAN, 0.0, 0.0),
        });
        assert_eq!(outcomes[0], FuseOutcome::SkippedNonFinite);
        assert!(matches!(outcomes[1], FuseOutcome::Applied { .. }));
        // The prior is diagonal, so the skipped row leaves the north velocity exactly
        // where it was even though the other two rows applied.
        assert_approx_eq!(filter.state()[idx::VEL], x_before[idx::VEL], 1e-12);
    }

    #[test]
    fn test_degenerate_model_is_skipped_not_fatal() {
        let mut filter = Eskf::new(&InitialState::default(), FilterConfig::default()).unwrap();
        let outcomes = filter.fuse(&TrueAirspeed { airspeed: 10.0 });
        assert_eq!(outcomes, vec![FuseOutcome::SkippedDegenerateGeometry]);
    }

    #[test]
    fn test_fusion_preserves_covariance_invariants() {
        let mut filter = test_filter();
        let imu = stationary_imu(&filter.attitude(), filter.config().gravity, 0.01);
        for step in 0..50 {
            filter.predict(&imu).unwrap();
            if step % 10 == 0 {
                filter.fuse(&MagFlux {
                    field_body: Vector3::new(400.0, 50.0, 250.0),
                });
            }
        }
        let p = filter.covariance();
        for i in 0..NUM_STATES {
            for j in 0..NUM_STATES {
                assert_approx_eq!(p[(i, j)], p[(j, i)], 1e-9);
            }
            assert!(p[(i, i)] >= 0.0);
        }
        assert_approx_eq!(filter.attitude().norm(), 1.0, 1e-12);
    }

    #[test]
    fn test_reset_preserves_composed_attitude() {
        let mut filter = test_filter();
        let imu = ImuSample::new(
            Vector3::new(0.01, -0.005, 0.02),
            Vector3::new(0.0, 0.0, -0.0981),
            0.01,
        );
        for _ in 0..20 {
            filter.predict(&imu).unwrap();
        }
        let attitude_before = filter.attitude();
        assert!(filter.state().rot_error().norm() > 0.0);
        filter.reset_error_state();
        assert_approx_eq!(filter.attitude().angle_to(&attitude_before), 0.0, 1e-9);
        assert_eq!(filter.state().rot_error(), Vector3::zeros());
    }
}
