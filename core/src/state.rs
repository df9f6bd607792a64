//! State-vector layout and initial-state construction for the 24-state filter.
//!
//! The filter state is a fixed 24-element vector. Each group of entries is addressed
//! through the constants in [`idx`] so the Jacobian and measurement code never hard-codes
//! a bare integer, and [`StateVector`] provides named accessors over the underlying
//! `SVector<f64, 24>`. The attitude quaternion is *not* part of this vector; it is held
//! separately by the filter, and entries `0..3` are the small-angle rotation error on top
//! of it.

use nalgebra::{SMatrix, SVector, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::{Deref, DerefMut};

/// Number of filter states.
pub const NUM_STATES: usize = 24;

/// The 24x24 state covariance matrix.
pub type Covariance = SMatrix<f64, NUM_STATES, NUM_STATES>;

/// Index map for the 24-state vector.
///
/// Group starts are named after the quantity; scalar entries within a group are the
/// start plus an axis offset.
pub mod idx {
    /// Attitude rotation error, rad (X, Y, Z)
    pub const ROT_ERR: usize = 0;
    /// NED velocity, m/s (N, E, D)
    pub const VEL: usize = 3;
    /// NED position, m (N, E, D)
    pub const POS: usize = 6;
    /// Delta-angle bias, rad (body X, Y, Z)
    pub const DANG_BIAS: usize = 9;
    /// Delta-angle scale factor, dimensionless (body X, Y, Z)
    pub const DANG_SCALE: usize = 12;
    /// Delta-velocity bias, m/s (body Z only)
    pub const DVEL_Z_BIAS: usize = 15;
    /// Earth magnetic field, mGauss (N, E, D)
    pub const MAG_EARTH: usize = 16;
    /// Body magnetic field, mGauss (X, Y, Z)
    pub const MAG_BODY: usize = 19;
    /// Wind velocity, m/s (N, E)
    pub const WIND: usize = 22;
}

/// The 24-element filter state vector.
///
/// A thin wrapper over `SVector<f64, 24>` adding named per-group accessors. Derefs to the
/// underlying vector so the fusion engine can apply corrections with plain indexed
/// arithmetic.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StateVector(SVector<f64, NUM_STATES>);

impl Deref for StateVector {
    type Target = SVector<f64, NUM_STATES>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for StateVector {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Default for StateVector {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for StateVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "StateVector {{ v: [{:.3}, {:.3}, {:.3}] m/s, p: [{:.2}, {:.2}, {:.2}] m, wind: [{:.2}, {:.2}] m/s }}",
            self.0[idx::VEL],
            self.0[idx::VEL + 1],
            self.0[idx::VEL + 2],
            self.0[idx::POS],
            self.0[idx::POS + 1],
            self.0[idx::POS + 2],
            self.0[idx::WIND],
            self.0[idx::WIND + 1]
        )
    }
}

impl StateVector {
    /// Create a state vector with every entry zero except the delta-angle scale factors,
    /// which start at their neutral value of one.
    pub fn new() -> StateVector {
        let mut x: SVector<f64, NUM_STATES> = SVector::zeros();
        x[idx::DANG_SCALE] = 1.0;
        x[idx::DANG_SCALE + 1] = 1.0;
        x[idx::DANG_SCALE + 2] = 1.0;
        StateVector(x)
    }

    /// Wrap an existing raw vector.
    pub fn from_vector(x: SVector<f64, NUM_STATES>) -> StateVector {
        StateVector(x)
    }

    pub fn rot_error(&self) -> Vector3<f64> {
        Vector3::new(
            self.0[idx::ROT_ERR],
            self.0[idx::ROT_ERR + 1],
            self.0[idx::ROT_ERR + 2],
        )
    }

    pub fn velocity(&self) -> Vector3<f64> {
        Vector3::new(self.0[idx::VEL], self.0[idx::VEL + 1], self.0[idx::VEL + 2])
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.0[idx::POS], self.0[idx::POS + 1], self.0[idx::POS + 2])
    }

    pub fn delta_angle_bias(&self) -> Vector3<f64> {
        Vector3::new(
            self.0[idx::DANG_BIAS],
            self.0[idx::DANG_BIAS + 1],
            self.0[idx::DANG_BIAS + 2],
        )
    }

    pub fn delta_angle_scale(&self) -> Vector3<f64> {
        Vector3::new(
            self.0[idx::DANG_SCALE],
            self.0[idx::DANG_SCALE + 1],
            self.0[idx::DANG_SCALE + 2],
        )
    }

    pub fn dvz_bias(&self) -> f64 {
        self.0[idx::DVEL_Z_BIAS]
    }

    pub fn mag_earth(&self) -> Vector3<f64> {
        Vector3::new(
            self.0[idx::MAG_EARTH],
            self.0[idx::MAG_EARTH + 1],
            self.0[idx::MAG_EARTH + 2],
        )
    }

    pub fn mag_body(&self) -> Vector3<f64> {
        Vector3::new(
            self.0[idx::MAG_BODY],
            self.0[idx::MAG_BODY + 1],
            self.0[idx::MAG_BODY + 2],
        )
    }

    pub fn wind(&self) -> Vector2<f64> {
        Vector2::new(self.0[idx::WIND], self.0[idx::WIND + 1])
    }

    /// NED wind-relative velocity `[vn - wn, ve - we, vd]`, shared by the airspeed,
    /// sideslip, and drag measurement models.
    pub fn wind_relative_velocity(&self) -> Vector3<f64> {
        Vector3::new(
            self.0[idx::VEL] - self.0[idx::WIND],
            self.0[idx::VEL + 1] - self.0[idx::WIND + 1],
            self.0[idx::VEL + 2],
        )
    }

    pub fn set_rot_error(&mut self, rot_error: &Vector3<f64>) {
        self.0[idx::ROT_ERR] = rot_error[0];
        self.0[idx::ROT_ERR + 1] = rot_error[1];
        self.0[idx::ROT_ERR + 2] = rot_error[2];
    }

    pub fn set_velocity(&mut self, velocity: &Vector3<f64>) {
        self.0[idx::VEL] = velocity[0];
        self.0[idx::VEL + 1] = velocity[1];
        self.0[idx::VEL + 2] = velocity[2];
    }

    pub fn set_position(&mut self, position: &Vector3<f64>) {
        self.0[idx::POS] = position[0];
        self.0[idx::POS + 1] = position[1];
        self.0[idx::POS + 2] = position[2];
    }

    /// Force the three rotation-error entries back to exactly zero.
    pub fn zero_rot_error(&mut self) {
        self.0[idx::ROT_ERR] = 0.0;
        self.0[idx::ROT_ERR + 1] = 0.0;
        self.0[idx::ROT_ERR + 2] = 0.0;
    }
}

/// Initial conditions for the filter: starting attitude, kinematic state, field and wind
/// estimates, and the per-group 1-sigma uncertainties used to seed the covariance
/// diagonal.
///
/// Plain data; validation happens when the filter is constructed from it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitialState {
    /// Roll angle in radians
    pub roll: f64,
    /// Pitch angle in radians
    pub pitch: f64,
    /// Yaw angle in radians
    pub yaw: f64,
    /// NED velocity in m/s
    pub velocity: [f64; 3],
    /// NED position in m
    pub position: [f64; 3],
    /// Earth magnetic field in mGauss, NED
    pub mag_earth: [f64; 3],
    /// Body magnetic field (hard iron) in mGauss
    pub mag_body: [f64; 3],
    /// Horizontal wind in m/s, NE
    pub wind: [f64; 2],
    /// 1-sigma attitude uncertainty in rad
    pub attitude_std: f64,
    /// 1-sigma velocity uncertainty in m/s
    pub velocity_std: f64,
    /// 1-sigma position uncertainty in m
    pub position_std: f64,
    /// 1-sigma delta-angle bias uncertainty in rad
    pub dang_bias_std: f64,
    /// 1-sigma delta-angle scale-factor uncertainty
    pub dang_scale_std: f64,
    /// 1-sigma delta-velocity Z bias uncertainty in m/s
    pub dvz_bias_std: f64,
    /// 1-sigma earth-field uncertainty in mGauss
    pub mag_earth_std: f64,
    /// 1-sigma body-field uncertainty in mGauss
    pub mag_body_std: f64,
    /// 1-sigma wind uncertainty in m/s
    pub wind_std: f64,
}

impl Default for InitialState {
    fn default() -> Self {
        InitialState {
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            velocity: [0.0; 3],
            position: [0.0; 3],
            mag_earth: [0.0; 3],
            mag_body: [0.0; 3],
            wind: [0.0; 2],
            attitude_std: 0.1,
            velocity_std: 0.5,
            position_std: 1.0,
            dang_bias_std: 1e-3,
            dang_scale_std: 1e-2,
            dvz_bias_std: 0.1,
            mag_earth_std: 50.0,
            mag_body_std: 25.0,
            wind_std: 3.0,
        }
    }
}

impl InitialState {
    /// Assemble the initial state vector from the configured values.
    pub fn state_vector(&self) -> StateVector {
        let mut x = StateVector::new();
        x.set_velocity(&Vector3::from(self.velocity));
        x.set_position(&Vector3::from(self.position));
        for i in 0..3 {
            x[idx::MAG_EARTH + i] = self.mag_earth[i];
            x[idx::MAG_BODY + i] = self.mag_body[i];
        }
        x[idx::WIND] = self.wind[0];
        x[idx::WIND + 1] = self.wind[1];
        x
    }

    /// Assemble the diagonal initial covariance from the per-group 1-sigma values.
    pub fn covariance(&self) -> Covariance {
        let mut diag: SVector<f64, NUM_STATES> = SVector::zeros();
        for i in 0..3 {
            diag[idx::ROT_ERR + i] = self.attitude_std * self.attitude_std;
            diag[idx::VEL + i] = self.velocity_std * self.velocity_std;
            diag[idx::POS + i] = self.position_std * self.position_std;
            diag[idx::DANG_BIAS + i] = self.dang_bias_std * self.dang_bias_std;
            diag[idx::DANG_SCALE + i] = self.dang_scale_std * self.dang_scale_std;
            diag[idx::MAG_EARTH + i] = self.mag_earth_std * self.mag_earth_std;
            diag[idx::MAG_BODY + i] = self.mag_body_std * self.mag_body_std;
        }
        diag[idx::DVEL_Z_BIAS] = self.dvz_bias_std * self.dvz_bias_std;
        diag[idx::WIND] = self.wind_std * self.wind_std;
        diag[idx::WIND + 1] = self.wind_std * self.wind_std;
        SMatrix::from_diagonal(&diag)
    }

    /// All standard deviations this struct carries, for validation.
    pub(crate) fn std_devs(&self) -> [f64; 9] {
        [
            self.attitude_std,
            self.velocity_std,
            self.position_std,
            self.dang_bias_std,
            self.dang_scale_std,
            self.dvz_bias_std,
            self.mag_earth_std,
            self.mag_body_std,
            self.wind_std,
        ]
    }
}
