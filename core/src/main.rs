use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use log::info;
use nalgebra::Vector3;

use eskf_nav::kalman::{Eskf, FilterConfig};
use eskf_nav::measurements::{PositionNed, VelocityNed};
use eskf_nav::sim::{self, ImuNoise, SimRecord};
use eskf_nav::state::InitialState;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Scenario {
    /// Fixed attitude, zero velocity.
    Stationary,
    /// Level constant-rate turn at constant speed.
    Turn,
}

/// Run the error-state filter over a simulated scenario with periodic velocity and
/// position aiding, and report the estimate-vs-truth errors.
#[derive(Parser, Debug)]
#[command(name = "eskf-nav", version, about)]
struct Args {
    /// Scenario to simulate
    #[arg(long, value_enum, default_value_t = Scenario::Turn)]
    scenario: Scenario,
    /// Number of IMU samples
    #[arg(long, default_value_t = 3000)]
    steps: usize,
    /// IMU sample interval in seconds
    #[arg(long, default_value_t = 0.01)]
    dt: f64,
    /// RNG seed for the IMU noise
    #[arg(long, default_value_t = 7)]
    seed: u64,
    /// Fuse aiding measurements every this many IMU samples
    #[arg(long, default_value_t = 20)]
    aiding_interval: usize,
    /// Optional CSV path for the generated scenario
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let noise = ImuNoise::new(1.5e-4, 3.5e-3);
    let records = match args.scenario {
        Scenario::Stationary => {
            sim::stationary_scenario(args.steps, args.dt, (0.0, 0.0, 0.3), &noise, args.seed)
        }
        Scenario::Turn => {
            sim::constant_turn_scenario(args.steps, args.dt, 15.0, 0.2, &noise, args.seed)
        }
    };
    if let Some(path) = &args.output {
        SimRecord::to_csv(&records, path)?;
        info!("wrote {} records to {}", records.len(), path.display());
    }

    let first = records.first().ok_or("scenario produced no records")?;
    let init = InitialState {
        roll: first.roll,
        pitch: first.pitch,
        yaw: first.yaw,
        velocity: [first.vel_n, first.vel_e, first.vel_d],
        position: [first.pos_n, first.pos_e, first.pos_d],
        ..InitialState::default()
    };
    let mut filter = Eskf::new(&init, FilterConfig::default())?;

    for (step, record) in records.iter().enumerate() {
        // Record truth holds before the record's IMU sample, so aid first.
        if step % args.aiding_interval == 0 {
            filter.fuse(&VelocityNed {
                velocity: record.truth_velocity(),
            });
            filter.fuse(&PositionNed {
                position: record.truth_position(),
            });
        }
        filter.predict(&record.imu())?;
        if step % 500 == 0 {
            info!("step {step}: {filter}");
        }
    }

    let last = records.last().ok_or("scenario produced no records")?;
    let vel_err: Vector3<f64> = filter.state().velocity() - last.truth_velocity();
    let pos_err: Vector3<f64> = filter.state().position() - last.truth_position();
    let att_err = filter.attitude().angle_to(&last.truth_attitude());
    println!("final state: {filter}");
    println!(
        "errors after {} steps: attitude {:.4} rad, velocity {:.3} m/s, position {:.2} m",
        records.len(),
        att_err,
        vel_err.norm(),
        pos_err.norm()
    );
    Ok(())
}
