use std::{
    convert::Infallible,
    path::PathBuf,
    sync::atomic::{AtomicU32, Ordering},
};

use clap::Parser;
use embassy_executor::{Executor, Spawner};
use embassy_time::{Duration, Instant, Timer};
use mover_core::{
    mk_static,
    utils::{
        MOTION_CHANNEL, MotionArbiter, MoverConfig,
        controllers::{
            compass::{CalibrationEnvelope, HeadingSource, MagSample, Magnetometer},
            gps::{FixSample, PositionSource},
            motor::{DriveSignal, MotorOutput, Wheel},
        },
        math::geo::EARTH_RADIUS_M,
        motion::{
            command::MotionCommand,
            route::{PlanError, Route, Waypoint},
        },
    },
};
use static_cell::StaticCell;
use tracing::{error, info, warn};

type Motors = MotorOutput<SimDrive>;
type Arbiter = MotionArbiter<'static, SimDrive, SimCompass>;

/// Ground speed (m/s) per unit of wheel setpoint.
const SPEED_PER_UNIT: f64 = 0.05;
/// Yaw rate (deg/s) per unit of left/right setpoint difference.
const YAW_PER_UNIT: f64 = 1.5;
/// Hard-iron offset of the simulated magnetometer.
const MAG_OFFSET: (f32, f32) = (0.35, -0.15);
const SIM_STEP: Duration = Duration::from_millis(100);

/// Simulated heading in degrees, stored as f32 bits.
static SIM_HEADING: AtomicU32 = AtomicU32::new(0);

#[derive(Parser)]
#[clap(version = "1.0", about = "Host simulation of the vehicle motion core")]
struct Opts {
    /// Start latitude
    #[clap(long, default_value_t = 48.1173)]
    start_lat: f64,
    /// Start longitude
    #[clap(long, default_value_t = 11.5167)]
    start_lon: f64,
    /// Start heading in degrees
    #[clap(long, default_value_t = 0.0)]
    start_heading: f32,
    /// Target latitude
    #[clap(long, default_value_t = 48.1180)]
    lat: f64,
    /// Target longitude
    #[clap(long, default_value_t = 11.5180)]
    lon: f64,
    /// Extra waypoints after the target, as `lat,lon` (turns the run into a route)
    #[clap(long = "waypoint", value_parser = parse_waypoint)]
    waypoints: Vec<Waypoint>,
    /// Cruise speed (wheel setpoint)
    #[clap(long, default_value_t = 40)]
    speed: i16,
    /// Arrival range in meters
    #[clap(long, default_value_t = 3.0)]
    range: f32,
    /// Run the spin calibration before navigating
    #[clap(long)]
    calibrate: bool,
    /// JSON file with `MoverConfig` overrides
    #[clap(long)]
    config: Option<PathBuf>,
    /// Status log period in milliseconds
    #[clap(long, default_value_t = 1000)]
    status_ms: u64,
}

fn parse_waypoint(s: &str) -> Result<Waypoint, String> {
    let (lat, lon) = s
        .split_once(',')
        .ok_or_else(|| format!("expected `lat,lon`, got `{s}`"))?;
    let lat = lat.trim().parse::<f64>().map_err(|e| e.to_string())?;
    let lon = lon.trim().parse::<f64>().map_err(|e| e.to_string())?;
    Ok(Waypoint::new(lat, lon))
}

/// Route through the target and every extra waypoint, in order.
///
/// Too many waypoints reject the whole route rather than dropping the tail.
fn route_from_opts(opts: &Opts) -> Result<Route, PlanError> {
    let points: Vec<Waypoint> = core::iter::once(Waypoint::new(opts.lat, opts.lon))
        .chain(opts.waypoints.iter().copied())
        .collect();
    Route::new(&points, opts.speed, opts.range)
}

fn load_config(path: Option<&PathBuf>) -> MoverConfig {
    let Some(path) = path else {
        return MoverConfig::default();
    };
    match std::fs::read_to_string(path).map(|raw| serde_json::from_str::<MoverConfig>(&raw)) {
        Ok(Ok(config)) => {
            info!(?path, "config loaded");
            config
        }
        Ok(Err(e)) => {
            warn!(?path, "config rejected, using defaults: {}", e);
            MoverConfig::default()
        }
        Err(e) => {
            warn!(?path, "config unreadable, using defaults: {}", e);
            MoverConfig::default()
        }
    }
}

fn sim_heading() -> f32 {
    f32::from_bits(SIM_HEADING.load(Ordering::Relaxed))
}

fn set_sim_heading(deg: f32) {
    SIM_HEADING.store(deg.rem_euclid(360.0).to_bits(), Ordering::Relaxed);
}

/// ESC pair that only logs pulse changes.
struct SimDrive {
    pulses: (u16, u16),
}

impl DriveSignal for SimDrive {
    type Error = Infallible;

    fn write_pulse(
        &mut self,
        wheel: Wheel,
        pulse_us: u16,
    ) -> Result<(), Self::Error> {
        let slot = match wheel {
            Wheel::Left => &mut self.pulses.0,
            Wheel::Right => &mut self.pulses.1,
        };
        if *slot != pulse_us {
            tracing::debug!(?wheel, pulse_us, "ESC pulse");
            *slot = pulse_us;
        }
        Ok(())
    }
}

/// Magnetometer reporting the simulated heading with a hard-iron offset.
struct SimCompass;

impl Magnetometer for SimCompass {
    type Error = Infallible;

    fn read_field(&mut self) -> Result<MagSample, Self::Error> {
        let rad = sim_heading().to_radians();
        Ok(MagSample {
            x: MAG_OFFSET.0 - rad.sin(),
            y: MAG_OFFSET.1 - rad.cos(),
        })
    }
}

/// Integrate wheel setpoints into heading and position, and publish fixes.
#[embassy_executor::task]
async fn vehicle_task(
    motors: &'static Motors,
    position: &'static PositionSource,
    start: (f64, f64),
) -> ! {
    let (mut lat, mut lon) = start;
    let mut last = Instant::now();
    loop {
        Timer::after(SIM_STEP).await;
        let now = Instant::now();
        let dt = (now - last).as_micros() as f64 / 1_000_000.0;
        last = now;

        let (left, right) = (f64::from(motors.left()), f64::from(motors.right()));
        let heading = f64::from(sim_heading()) + (left - right) * YAW_PER_UNIT * dt;
        set_sim_heading(heading as f32);

        let travelled = (left + right) / 2.0 * SPEED_PER_UNIT * dt;
        let rad = heading.to_radians();
        lat += (travelled * rad.cos() / EARTH_RADIUS_M).to_degrees();
        lon += (travelled * rad.sin() / (EARTH_RADIUS_M * lat.to_radians().cos())).to_degrees();

        position.publish(FixSample {
            latitude: lat,
            longitude: lon,
            course_over_ground: (travelled.abs() > 0.0).then_some(sim_heading()),
            satellites: 10,
        });
    }
}

#[embassy_executor::task]
async fn motion_task(arbiter: &'static Arbiter) -> ! {
    arbiter.run().await
}

#[embassy_executor::task]
async fn command_task(arbiter: &'static Arbiter) -> ! {
    arbiter.command_loop().await
}

#[embassy_executor::task]
async fn status_task(
    arbiter: &'static Arbiter,
    period: Duration,
) -> ! {
    loop {
        Timer::after(period).await;
        match serde_json::to_string(&arbiter.status()) {
            Ok(json) => info!("status {}", json),
            Err(e) => error!("status serialization failed: {}", e),
        }
    }
}

async fn wait_idle(arbiter: &Arbiter) {
    Timer::after(Duration::from_millis(50)).await;
    while !arbiter.is_idle() {
        Timer::after(Duration::from_millis(100)).await;
    }
}

#[embassy_executor::task]
async fn main_task(spawner: Spawner) {
    let opts: Opts = Opts::parse();
    let config = load_config(opts.config.as_ref());
    set_sim_heading(opts.start_heading);

    let motors: &'static Motors = mk_static!(
        Motors,
        MotorOutput::new(
            SimDrive {
                pulses: (0, 0)
            },
            config.motor
        )
    );
    let heading: &'static HeadingSource<SimCompass> =
        mk_static!(HeadingSource<SimCompass>, HeadingSource::new(SimCompass));
    let position: &'static PositionSource = mk_static!(PositionSource, PositionSource::new());
    let arbiter: &'static Arbiter = mk_static!(
        Arbiter,
        MotionArbiter::new(motors, heading, position, config)
    );
    motors.neutral();

    spawner.spawn(vehicle_task(motors, position, (opts.start_lat, opts.start_lon))).unwrap();
    spawner.spawn(motion_task(arbiter)).unwrap();
    spawner.spawn(command_task(arbiter)).unwrap();
    spawner.spawn(status_task(arbiter, Duration::from_millis(opts.status_ms.max(10)))).unwrap();

    // wait for the first fix
    Timer::after(SIM_STEP * 2).await;

    if opts.calibrate {
        info!("Calibrating compass");
        MOTION_CHANNEL.send(MotionCommand::Calibrate).await;
        wait_idle(arbiter).await;
        info!(envelope = ?arbiter.envelope(), outcome = ?arbiter.last_outcome(), "Calibration done");
    } else {
        // stands in for an envelope restored from persisted storage
        arbiter.set_envelope(CalibrationEnvelope {
            x_min: MAG_OFFSET.0 - 1.0,
            x_max: MAG_OFFSET.0 + 1.0,
            y_min: MAG_OFFSET.1 - 1.0,
            y_max: MAG_OFFSET.1 + 1.0,
        });
    }

    let command = if opts.waypoints.is_empty() {
        MotionCommand::GoTo {
            lat: opts.lat,
            lon: opts.lon,
            speed: opts.speed,
            range: opts.range,
        }
    } else {
        match route_from_opts(&opts) {
            Ok(route) => MotionCommand::Route {
                route: route.into(),
            },
            Err(e) => {
                error!("route rejected: {}", e);
                std::process::exit(2);
            }
        }
    };

    info!(?command, "Starting navigation");
    MOTION_CHANNEL.send(command).await;
    wait_idle(arbiter).await;

    let outcome = arbiter.last_outcome();
    match serde_json::to_string(&arbiter.status()) {
        Ok(json) => info!("final status {}", json),
        Err(e) => error!("status serialization failed: {}", e),
    }
    info!(?outcome, "Simulation finished");
    std::process::exit(0);
}

static EXECUTOR: StaticCell<Executor> = StaticCell::new();

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let executor = EXECUTOR.init(Executor::new());
    executor.run(|spawner| {
        spawner.spawn(main_task(spawner)).unwrap();
    });
}
