//! Measurement models for the aided-navigation filter.
//!
//! Every sensor is expressed as one or more scalar observations so the fusion engine can
//! apply them sequentially without any matrix inversion. A model receives a
//! [`FusionContext`] (the truth attitude, its DCM, the state vector, and the filter
//! configuration) and returns the scalar rows it wants fused: measured value, predicted
//! value, sparse Jacobian, measurement variance, and whether the innovation is an angle
//! that must be wrapped.
//!
//! All Jacobians are evaluated at a zero rotation-error operating point. The fusion
//! engine folds the rotation error into the quaternion after every applied row, so the
//! operating point holds for each row in turn.
//!
//! Models with a geometric singularity (airspeed near zero, along-track body speed near
//! zero, horizontal field collapse, flow range collapse) return
//! [`EskfError::DegenerateGeometry`] instead of producing an ill-conditioned row; the
//! fusion engine treats that as a skipped update, not a fault.

use crate::earth::vector_to_skew_symmetric;
use crate::kalman::{EskfError, FilterConfig};
use crate::linalg::HRow;
use crate::state::{idx, StateVector};

use std::fmt::{self, Display};

use nalgebra::{Matrix3, UnitQuaternion, Vector2, Vector3};

/// Airspeed floor (m/s) below which the true-airspeed model is degenerate.
pub const MIN_AIRSPEED: f64 = 1.0;
/// Along-track body speed floor (m/s) below which the sideslip ratio is degenerate.
pub const MIN_ALONG_TRACK_SPEED: f64 = 0.5;
/// Horizontal field floor (mGauss) below which heading and declination are degenerate.
pub const MIN_HORIZONTAL_FIELD: f64 = 1.0;
/// Range floor (m) below which optical-flow rates are degenerate.
pub const MIN_FLOW_RANGE: f64 = 0.1;
/// Floor on the down-axis projection `Tbn[2,2]` for the optical-flow range geometry.
pub const MIN_DOWN_PROJECTION: f64 = 0.1;

/// Everything a measurement model needs to evaluate its prediction and Jacobian.
pub struct FusionContext<'a> {
    /// Truth attitude, the estimate composed with any pending rotation error.
    pub q_truth: UnitQuaternion<f64>,
    /// Body-to-NED rotation matrix of `q_truth`.
    pub tbn: Matrix3<f64>,
    /// Current state vector.
    pub state: &'a StateVector,
    /// Filter configuration, for measurement variances and constants.
    pub config: &'a FilterConfig,
}

impl<'a> FusionContext<'a> {
    pub fn new(
        q_truth: UnitQuaternion<f64>,
        state: &'a StateVector,
        config: &'a FilterConfig,
    ) -> FusionContext<'a> {
        let tbn = q_truth.to_rotation_matrix().into_inner();
        FusionContext {
            q_truth,
            tbn,
            state,
            config,
        }
    }

    /// Wind-relative velocity in the body frame, `Tbnᵗ·[vn−vwn, ve−vwe, vd]`.
    fn wind_relative_body(&self) -> Vector3<f64> {
        self.tbn.transpose() * self.state.wind_relative_velocity()
    }
}

/// One scalar row ready for the sequential fusion engine.
#[derive(Clone, Copy, Debug)]
pub struct ScalarObservation {
    /// Sensor value.
    pub measured: f64,
    /// Model prediction from the current state.
    pub predicted: f64,
    /// Sparse measurement Jacobian over the 24 error states.
    pub jacobian: HRow,
    /// Measurement variance `r`.
    pub variance: f64,
    /// Wrap the innovation to (−π, π] before applying.
    pub angular: bool,
}

/// A sensor expressed as scalar observations over the error state.
pub trait MeasurementModel {
    /// Short name used in log messages.
    fn name(&self) -> &'static str;
    /// Evaluate the model against the current state.
    fn observations(&self, ctx: &FusionContext) -> Result<Vec<ScalarObservation>, EskfError>;
}

/// NED velocity aiding, e.g. from a GNSS receiver.
#[derive(Clone, Copy, Debug, Default)]
pub struct VelocityNed {
    pub velocity: Vector3<f64>,
}

impl Display for VelocityNed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VelocityNed(north: {}, east: {}, down: {})",
            self.velocity[0], self.velocity[1], self.velocity[2]
        )
    }
}

impl MeasurementModel for VelocityNed {
    fn name(&self) -> &'static str {
        "velocity_ned"
    }

    fn observations(&self, ctx: &FusionContext) -> Result<Vec<ScalarObservation>, EskfError> {
        let velocity = ctx.state.velocity();
        let variances = [
            ctx.config.r_vel_ne,
            ctx.config.r_vel_ne,
            ctx.config.r_vel_d,
        ];
        Ok((0..3)
            .map(|i| ScalarObservation {
                measured: self.velocity[i],
                predicted: velocity[i],
                jacobian: HRow::from_terms(&[(idx::VEL + i, 1.0)]),
                variance: variances[i],
                angular: false,
            })
            .collect())
    }
}

/// NED position aiding relative to the local origin.
#[derive(Clone, Copy, Debug, Default)]
pub struct PositionNed {
    pub position: Vector3<f64>,
}

impl Display for PositionNed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PositionNed(north: {}, east: {}, down: {})",
            self.position[0], self.position[1], self.position[2]
        )
    }
}

impl MeasurementModel for PositionNed {
    fn name(&self) -> &'static str {
        "position_ned"
    }

    fn observations(&self, ctx: &FusionContext) -> Result<Vec<ScalarObservation>, EskfError> {
        let position = ctx.state.position();
        let variances = [
            ctx.config.r_pos_ne,
            ctx.config.r_pos_ne,
            ctx.config.r_pos_d,
        ];
        Ok((0..3)
            .map(|i| ScalarObservation {
                measured: self.position[i],
                predicted: position[i],
                jacobian: HRow::from_terms(&[(idx::POS + i, 1.0)]),
                variance: variances[i],
                angular: false,
            })
            .collect())
    }
}

/// True airspeed, the norm of the wind-relative velocity.
///
/// The wind states are horizontal only, so the vertical component of the relative
/// velocity is the NED down velocity itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrueAirspeed {
    pub airspeed: f64,
}

impl Display for TrueAirspeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrueAirspeed({} m/s)", self.airspeed)
    }
}

impl MeasurementModel for TrueAirspeed {
    fn name(&self) -> &'static str {
        "true_airspeed"
    }

    fn observations(&self, ctx: &FusionContext) -> Result<Vec<ScalarObservation>, EskfError> {
        let rel = ctx.state.wind_relative_velocity();
        let speed = rel.norm();
        if speed < MIN_AIRSPEED {
            return Err(EskfError::DegenerateGeometry { model: self.name() });
        }
        let jacobian = HRow::from_terms(&[
            (idx::VEL, rel[0] / speed),
            (idx::VEL + 1, rel[1] / speed),
            (idx::VEL + 2, rel[2] / speed),
            (idx::WIND, -rel[0] / speed),
            (idx::WIND + 1, -rel[1] / speed),
        ]);
        Ok(vec![ScalarObservation {
            measured: self.airspeed,
            predicted: speed,
            jacobian,
            variance: ctx.config.r_tas,
            angular: false,
        }])
    }
}

/// Synthetic zero-sideslip constraint for a coordinated airframe.
///
/// The observed quantity is the ratio of lateral to along-track wind-relative body
/// velocity, fused against a measured value of zero.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sideslip;

impl MeasurementModel for Sideslip {
    fn name(&self) -> &'static str {
        "sideslip"
    }

    fn observations(&self, ctx: &FusionContext) -> Result<Vec<ScalarObservation>, EskfError> {
        let vb = ctx.wind_relative_body();
        if vb[0].abs() < MIN_ALONG_TRACK_SPEED {
            return Err(EskfError::DegenerateGeometry { model: self.name() });
        }
        let predicted = vb[1] / vb[0];
        // dz/dVb, chained with dVb/d(rot_err) = [Vb]x, dVb/dv = Tbn^T, dVb/dw = -Tbn^T.
        let dz_dvb = Vector3::new(-vb[1] / (vb[0] * vb[0]), 1.0 / vb[0], 0.0);
        let skew = vector_to_skew_symmetric(&vb);
        let tbn_t = ctx.tbn.transpose();
        let mut jacobian = HRow::new();
        for j in 0..3 {
            jacobian.push(idx::ROT_ERR + j, dz_dvb.dot(&skew.column(j).into_owned()));
        }
        for j in 0..3 {
            jacobian.push(idx::VEL + j, dz_dvb.dot(&tbn_t.column(j).into_owned()));
        }
        for j in 0..2 {
            jacobian.push(idx::WIND + j, -dz_dvb.dot(&tbn_t.column(j).into_owned()));
        }
        Ok(vec![ScalarObservation {
            measured: 0.0,
            predicted,
            jacobian,
            variance: ctx.config.r_beta,
            angular: false,
        }])
    }
}

/// Three-axis magnetometer flux, fused one axis at a time.
///
/// Predicted body-frame field is the earth field rotated into the body frame plus the
/// body-fixed bias triad, so a rejected axis leaves the other two available.
#[derive(Clone, Copy, Debug, Default)]
pub struct MagFlux {
    /// Measured body-frame field in mGauss.
    pub field_body: Vector3<f64>,
}

impl Display for MagFlux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MagFlux(x: {}, y: {}, z: {} mGauss)",
            self.field_body[0], self.field_body[1], self.field_body[2]
        )
    }
}

impl MeasurementModel for MagFlux {
    fn name(&self) -> &'static str {
        "mag_flux"
    }

    fn observations(&self, ctx: &FusionContext) -> Result<Vec<ScalarObservation>, EskfError> {
        let earth_body = ctx.tbn.transpose() * ctx.state.mag_earth();
        let predicted = earth_body + ctx.state.mag_body();
        let skew = vector_to_skew_symmetric(&earth_body);
        let tbn_t = ctx.tbn.transpose();
        Ok((0..3)
            .map(|i| {
                let mut jacobian = HRow::new();
                for j in 0..3 {
                    jacobian.push(idx::ROT_ERR + j, skew[(i, j)]);
                }
                for j in 0..3 {
                    jacobian.push(idx::MAG_EARTH + j, tbn_t[(i, j)]);
                }
                jacobian.push(idx::MAG_BODY + i, 1.0);
                ScalarObservation {
                    measured: self.field_body[i],
                    predicted: predicted[i],
                    jacobian,
                    variance: ctx.config.r_mag,
                    angular: false,
                }
            })
            .collect())
    }
}

/// Magnetic heading from a body-frame field sample.
///
/// The measured field is rotated into NED with the current attitude and its horizontal
/// direction is fused against the configured declination. Only the rotation error is
/// observed, which makes this the fallback yaw aid when the field states are not yet
/// trustworthy.
#[derive(Clone, Copy, Debug, Default)]
pub struct MagHeading {
    /// Measured body-frame field in mGauss.
    pub field_body: Vector3<f64>,
}

impl Display for MagHeading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MagHeading(x: {}, y: {}, z: {} mGauss)",
            self.field_body[0], self.field_body[1], self.field_body[2]
        )
    }
}

impl MeasurementModel for MagHeading {
    fn name(&self) -> &'static str {
        "mag_heading"
    }

    fn observations(&self, ctx: &FusionContext) -> Result<Vec<ScalarObservation>, EskfError> {
        let field_ned = ctx.tbn * self.field_body;
        let north = field_ned[0];
        let east = field_ned[1];
        let horizontal_sq = north * north + east * east;
        if horizontal_sq < MIN_HORIZONTAL_FIELD * MIN_HORIZONTAL_FIELD {
            return Err(EskfError::DegenerateGeometry { model: self.name() });
        }
        let predicted = east.atan2(north);
        // d(field_ned)/d(rot_err) = -Tbn [mb]x; chain with the atan2 gradient.
        let dfield = -ctx.tbn * vector_to_skew_symmetric(&self.field_body);
        let mut jacobian = HRow::new();
        for j in 0..3 {
            jacobian.push(
                idx::ROT_ERR + j,
                (-east * dfield[(0, j)] + north * dfield[(1, j)]) / horizontal_sq,
            );
        }
        Ok(vec![ScalarObservation {
            measured: ctx.config.declination,
            predicted,
            jacobian,
            variance: ctx.config.r_mag_heading,
            angular: true,
        }])
    }
}

/// Declination constraint on the earth-field states.
///
/// Keeps the estimated earth field pointing along the configured declination while the
/// flux fusion is free to adjust its strength and dip.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyntheticDeclination;

impl MeasurementModel for SyntheticDeclination {
    fn name(&self) -> &'static str {
        "synthetic_declination"
    }

    fn observations(&self, ctx: &FusionContext) -> Result<Vec<ScalarObservation>, EskfError> {
        let mag = ctx.state.mag_earth();
        let north = mag[0];
        let east = mag[1];
        let horizontal_sq = north * north + east * east;
        if horizontal_sq < MIN_HORIZONTAL_FIELD * MIN_HORIZONTAL_FIELD {
            return Err(EskfError::DegenerateGeometry { model: self.name() });
        }
        let jacobian = HRow::from_terms(&[
            (idx::MAG_EARTH, -east / horizontal_sq),
            (idx::MAG_EARTH + 1, north / horizontal_sq),
        ]);
        Ok(vec![ScalarObservation {
            measured: ctx.config.declination,
            predicted: east.atan2(north),
            jacobian,
            variance: ctx.config.r_decl,
            angular: true,
        }])
    }
}

/// Optical-flow line-of-sight rates from a down-looking sensor.
///
/// Range to the terrain is derived from the down position, the terrain height, and the
/// tilt of the body down axis; the two axis rates are fused as independent scalars.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpticalFlow {
    /// Measured LOS rates about the body X and Y axes (rad/s).
    pub rates: Vector2<f64>,
    /// Terrain position on the down axis (m, positive down).
    pub terrain_down: f64,
}

impl Display for OpticalFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OpticalFlow(x: {}, y: {} rad/s, terrain: {} m)",
            self.rates[0], self.rates[1], self.terrain_down
        )
    }
}

impl MeasurementModel for OpticalFlow {
    fn name(&self) -> &'static str {
        "optical_flow"
    }

    fn observations(&self, ctx: &FusionContext) -> Result<Vec<ScalarObservation>, EskfError> {
        let down_projection = ctx.tbn[(2, 2)];
        if down_projection.abs() < MIN_DOWN_PROJECTION {
            return Err(EskfError::DegenerateGeometry { model: self.name() });
        }
        let range = (self.terrain_down - ctx.state.position()[2]) / down_projection;
        if range < MIN_FLOW_RANGE {
            return Err(EskfError::DegenerateGeometry { model: self.name() });
        }
        let vb = ctx.tbn.transpose() * ctx.state.velocity();
        let predicted = [vb[1] / range, -vb[0] / range];
        let skew = vector_to_skew_symmetric(&vb);
        let tbn_t = ctx.tbn.transpose();
        // The down projection, and through it the range, also rotates with the body.
        let dproj = Vector3::new(-ctx.tbn[(2, 1)], ctx.tbn[(2, 0)], 0.0);
        // Rate about body X observes Vb_y, rate about body Y observes -Vb_x.
        let axis = [(1usize, 1.0), (0usize, -1.0)];
        Ok((0..2)
            .map(|i| {
                let (row, sign) = axis[i];
                let mut jacobian = HRow::new();
                for j in 0..3 {
                    jacobian.push(
                        idx::ROT_ERR + j,
                        sign * (skew[(row, j)] + vb[row] * dproj[j] / down_projection) / range,
                    );
                }
                for j in 0..3 {
                    jacobian.push(idx::VEL + j, sign * tbn_t[(row, j)] / range);
                }
                jacobian.push(
                    idx::POS + 2,
                    sign * vb[row] / (range * range * down_projection),
                );
                ScalarObservation {
                    measured: self.rates[i],
                    predicted: predicted[i],
                    jacobian,
                    variance: ctx.config.r_los,
                    angular: false,
                }
            })
            .collect())
    }
}

/// Lateral body-drag pseudo-measurement from the accelerometer.
///
/// A multirotor's lateral specific force is dominated by rotor drag, modeled as linear
/// in the wind-relative body velocity with the calibrated coefficient `k_acc`. Air
/// density variation is folded into the calibration.
#[derive(Clone, Copy, Debug, Default)]
pub struct LateralDrag {
    /// Measured specific force along body X and Y (m/s²).
    pub specific_force: Vector2<f64>,
}

impl Display for LateralDrag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LateralDrag(x: {}, y: {} m/s²)",
            self.specific_force[0], self.specific_force[1]
        )
    }
}

impl MeasurementModel for LateralDrag {
    fn name(&self) -> &'static str {
        "lateral_drag"
    }

    fn observations(&self, ctx: &FusionContext) -> Result<Vec<ScalarObservation>, EskfError> {
        let k = ctx.config.k_acc;
        let vbw = ctx.wind_relative_body();
        let skew = vector_to_skew_symmetric(&vbw);
        let tbn_t = ctx.tbn.transpose();
        Ok((0..2)
            .map(|i| {
                let mut jacobian = HRow::new();
                for j in 0..3 {
                    jacobian.push(idx::ROT_ERR + j, -k * skew[(i, j)]);
                }
                for j in 0..3 {
                    jacobian.push(idx::VEL + j, -k * tbn_t[(i, j)]);
                }
                for j in 0..2 {
                    jacobian.push(idx::WIND + j, k * tbn_t[(i, j)]);
                }
                ScalarObservation {
                    measured: self.specific_force[i],
                    predicted: -k * vbw[i],
                    jacobian,
                    variance: ctx.config.r_drag,
                    angular: false,
                }
            })
            .collect())
    }
}
