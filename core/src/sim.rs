//! Synthetic trajectory generation and CSV import/export.
//!
//! This module provides:
//! - A struct (`SimRecord`) holding one time step of truth state and IMU deltas
//! - Scenario generators for a stationary vehicle and a constant-rate level turn
//! - CSV import/export for record sequences
//! - Unit tests for validating functionality
//!
//! The generators produce the exact specific-force and delta-angle sequence the truth
//! trajectory implies, plus seeded Gaussian noise, so a zero-noise scenario is a
//! closed-form reference the filter must reproduce.

use crate::{earth, ImuSample};

use std::io;
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use nalgebra::{UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Per-sample IMU noise levels for the scenario generators.
///
/// Standard deviations apply to each delta component independently. Zero is allowed and
/// produces a deterministic scenario.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ImuNoise {
    /// Delta-angle noise 1-sigma, rad per sample.
    pub dang_std: f64,
    /// Delta-velocity noise 1-sigma, m/s per sample.
    pub dvel_std: f64,
}

impl ImuNoise {
    /// Panics on a negative or non-finite standard deviation; that is a programming
    /// error in a test or demo, not a runtime condition.
    pub fn new(dang_std: f64, dvel_std: f64) -> ImuNoise {
        assert!(dang_std.is_finite() && dang_std >= 0.0, "invalid dang_std");
        assert!(dvel_std.is_finite() && dvel_std >= 0.0, "invalid dvel_std");
        ImuNoise { dang_std, dvel_std }
    }

    /// Noise-free scenarios.
    pub fn none() -> ImuNoise {
        ImuNoise {
            dang_std: 0.0,
            dvel_std: 0.0,
        }
    }
}

/// One time step of simulated truth and IMU output.
///
/// Fields are flat scalars so the struct maps directly onto CSV columns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimRecord {
    /// Sample timestamp
    pub time: DateTime<Utc>,
    /// Truth roll angle in radians
    pub roll: f64,
    /// Truth pitch angle in radians
    pub pitch: f64,
    /// Truth yaw angle in radians
    pub yaw: f64,
    /// Truth NED velocity in m/s
    pub vel_n: f64,
    pub vel_e: f64,
    pub vel_d: f64,
    /// Truth NED position in m
    pub pos_n: f64,
    pub pos_e: f64,
    pub pos_d: f64,
    /// IMU delta angle in rad
    pub dang_x: f64,
    pub dang_y: f64,
    pub dang_z: f64,
    /// IMU delta velocity in m/s
    pub dvel_x: f64,
    pub dvel_y: f64,
    pub dvel_z: f64,
    /// Sample interval in s
    pub dt: f64,
}

impl SimRecord {
    /// The IMU sample for this step.
    pub fn imu(&self) -> ImuSample {
        ImuSample::new(
            Vector3::new(self.dang_x, self.dang_y, self.dang_z),
            Vector3::new(self.dvel_x, self.dvel_y, self.dvel_z),
            self.dt,
        )
    }

    /// The truth attitude for this step.
    pub fn truth_attitude(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_euler_angles(self.roll, self.pitch, self.yaw)
    }

    /// The truth NED velocity for this step.
    pub fn truth_velocity(&self) -> Vector3<f64> {
        Vector3::new(self.vel_n, self.vel_e, self.vel_d)
    }

    /// The truth NED position for this step.
    pub fn truth_position(&self) -> Vector3<f64> {
        Vector3::new(self.pos_n, self.pos_e, self.pos_d)
    }

    /// Reads a CSV file and returns a vector of `SimRecord` structs.
    ///
    /// # Arguments
    /// * `path` - Path to the CSV file to read.
    ///
    /// # Returns
    /// * `Ok(Vec<SimRecord>)` if successful.
    /// * `Err` if the file cannot be read or parsed.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn std::error::Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }

    /// Writes a vector of `SimRecord` structs to a CSV file.
    ///
    /// # Arguments
    /// * `records` - Records to write
    /// * `path` - Path where the CSV file will be saved
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn sample_noise(rng: &mut StdRng, normal: &Normal<f64>) -> Vector3<f64> {
    Vector3::new(normal.sample(rng), normal.sample(rng), normal.sample(rng))
}

/// Generate a stationary scenario: fixed attitude, zero velocity, IMU reporting the
/// gravity reaction in the body frame plus noise.
///
/// # Arguments
/// * `steps` - number of IMU samples
/// * `dt` - sample interval in s
/// * `attitude` - fixed truth attitude as (roll, pitch, yaw) in rad
/// * `noise` - per-sample IMU noise levels
/// * `seed` - RNG seed; identical seeds reproduce the scenario exactly
pub fn stationary_scenario(
    steps: usize,
    dt: f64,
    attitude: (f64, f64, f64),
    noise: &ImuNoise,
    seed: u64,
) -> Vec<SimRecord> {
    let (roll, pitch, yaw) = attitude;
    let q = UnitQuaternion::from_euler_angles(roll, pitch, yaw);
    let dvel_body = q.inverse_transform_vector(&Vector3::new(0.0, 0.0, -earth::GRAVITY * dt));

    let mut rng = StdRng::seed_from_u64(seed);
    let dang_noise = Normal::new(0.0, noise.dang_std).expect("validated by ImuNoise");
    let dvel_noise = Normal::new(0.0, noise.dvel_std).expect("validated by ImuNoise");

    let start = Utc::now();
    (0..steps)
        .map(|step| {
            let dang = sample_noise(&mut rng, &dang_noise);
            let dvel = dvel_body + sample_noise(&mut rng, &dvel_noise);
            SimRecord {
                time: start + TimeDelta::milliseconds((step as f64 * dt * 1e3) as i64),
                roll,
                pitch,
                yaw,
                vel_n: 0.0,
                vel_e: 0.0,
                vel_d: 0.0,
                pos_n: 0.0,
                pos_e: 0.0,
                pos_d: 0.0,
                dang_x: dang[0],
                dang_y: dang[1],
                dang_z: dang[2],
                dvel_x: dvel[0],
                dvel_y: dvel[1],
                dvel_z: dvel[2],
                dt,
            }
        })
        .collect()
}

/// Generate a level constant-rate turn: constant speed, constant yaw rate, level
/// attitude. The IMU sees the yaw rotation on its Z axis and the centripetal plus
/// gravity-reaction specific force rotated into the body frame.
///
/// # Arguments
/// * `steps` - number of IMU samples
/// * `dt` - sample interval in s
/// * `speed` - ground speed in m/s
/// * `yaw_rate` - turn rate in rad/s, positive clockwise viewed from above
/// * `noise` - per-sample IMU noise levels
/// * `seed` - RNG seed
pub fn constant_turn_scenario(
    steps: usize,
    dt: f64,
    speed: f64,
    yaw_rate: f64,
    noise: &ImuNoise,
    seed: u64,
) -> Vec<SimRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    let dang_noise = Normal::new(0.0, noise.dang_std).expect("validated by ImuNoise");
    let dvel_noise = Normal::new(0.0, noise.dvel_std).expect("validated by ImuNoise");

    let start = Utc::now();
    let mut position = Vector3::zeros();
    let mut records = Vec::with_capacity(steps);
    for step in 0..steps {
        let yaw = yaw_rate * step as f64 * dt;
        let q = UnitQuaternion::from_euler_angles(0.0, 0.0, yaw);
        let velocity = speed * Vector3::new(yaw.cos(), yaw.sin(), 0.0);
        // Delta velocity is the exact truth velocity change plus the gravity reaction,
        // so rectangular integration of the deltas reproduces the truth trajectory.
        let yaw_next = yaw_rate * (step + 1) as f64 * dt;
        let velocity_next = speed * Vector3::new(yaw_next.cos(), yaw_next.sin(), 0.0);
        let dvel_body = q.inverse_transform_vector(
            &(velocity_next - velocity - Vector3::new(0.0, 0.0, earth::GRAVITY * dt)),
        );
        let dang = Vector3::new(0.0, 0.0, yaw_rate * dt) + sample_noise(&mut rng, &dang_noise);
        let dvel = dvel_body + sample_noise(&mut rng, &dvel_noise);

        records.push(SimRecord {
            time: start + TimeDelta::milliseconds((step as f64 * dt * 1e3) as i64),
            roll: 0.0,
            pitch: 0.0,
            yaw,
            vel_n: velocity[0],
            vel_e: velocity[1],
            vel_d: velocity[2],
            pos_n: position[0],
            pos_e: position[1],
            pos_d: position[2],
            dang_x: dang[0],
            dang_y: dang[1],
            dang_z: dang[2],
            dvel_x: dvel[0],
            dvel_y: dvel[1],
            dvel_z: dvel[2],
            dt,
        });
        position += velocity * dt;
    }
    records
}
