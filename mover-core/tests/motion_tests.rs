use core::{
    convert::Infallible,
    sync::atomic::{AtomicU32, Ordering},
};

use embassy_futures::{block_on, join::join, select::select};
use embassy_time::Timer;
use mover_core::utils::{
    config::MoverConfig,
    math::geo,
    controllers::{
        compass::{CalibrationEnvelope, HeadingSource, MagSample, Magnetometer},
        gps::{FixSample, PositionSource},
        motor::{DriveSignal, MotorOutput, Wheel},
    },
    motion::{
        arbiter::MotionArbiter,
        command::{CommandReply, MotionCommand},
        navigation::{LegOutcome, NavigationEngine, RouteOutcome, SteerStep},
        route::{PlanError, Route, Waypoint},
        uncancellable, CancelToken, FailReason, MotionError, MotionKind, MotionRequest, TaskOutcome, TaskState,
    },
};

const START: (f64, f64) = (48.0, 11.0);

/// Drive backend that only counts writes.
#[derive(Default)]
struct SimDrive {
    writes: usize,
}

impl DriveSignal for SimDrive {
    type Error = Infallible;

    fn write_pulse(
        &mut self,
        _wheel: Wheel,
        _pulse_us: u16,
    ) -> Result<(), Self::Error> {
        self.writes += 1;
        Ok(())
    }
}

/// Magnetometer turning by `step_deg` on every read around an offset center.
struct SpinCompass {
    angle_deg: f32,
    step_deg: f32,
    offset: (f32, f32),
    available: bool,
}

impl SpinCompass {
    /// Fixed reading that maps to heading 0 with a unit envelope.
    fn north() -> Self {
        Self {
            angle_deg: -90.0,
            step_deg: 0.0,
            offset: (0.0, 0.0),
            available: true,
        }
    }

    fn spinning(
        step_deg: f32,
        offset: (f32, f32),
    ) -> Self {
        Self {
            angle_deg: 0.0,
            step_deg,
            offset,
            available: true,
        }
    }

    fn dead() -> Self {
        Self {
            available: false,
            ..Self::north()
        }
    }
}

impl Magnetometer for SpinCompass {
    type Error = &'static str;

    fn read_field(&mut self) -> Result<MagSample, Self::Error> {
        if !self.available {
            return Err("no ack");
        }
        let rad = self.angle_deg.to_radians();
        self.angle_deg += self.step_deg;
        Ok(MagSample {
            x: rad.cos() + self.offset.0,
            y: rad.sin() + self.offset.1,
        })
    }
}

fn unit_envelope() -> CalibrationEnvelope {
    CalibrationEnvelope {
        x_min: -1.0,
        x_max: 1.0,
        y_min: -1.0,
        y_max: 1.0,
    }
}

fn fast_config() -> MoverConfig {
    let mut config = MoverConfig::default();
    config.navigation.control_period_ms = 1;
    config.calibration.duration_ms = 100;
    config.calibration.sample_period_ms = 1;
    config
}

fn publish(
    position: &PositionSource,
    latitude: f64,
    longitude: f64,
) {
    position.publish(FixSample {
        latitude,
        longitude,
        course_over_ground: None,
        satellites: 9,
    });
}

fn calibrated_north() -> HeadingSource<SpinCompass> {
    let heading = HeadingSource::new(SpinCompass::north());
    heading.set_envelope(unit_envelope());
    heading
}

async fn until_driving(motors: &MotorOutput<SimDrive>) {
    while motors.is_neutral() {
        Timer::after_millis(1).await;
    }
}

fn writes(motors: &MotorOutput<SimDrive>) -> usize {
    motors.with_drive(|drive| drive.writes)
}

#[test]
fn compass_north_reads_zero() {
    let heading = calibrated_north();
    let deg = heading.calibrated_heading().unwrap();
    assert!(deg < 0.5 || deg > 359.5, "heading {deg}");
}

#[test]
fn step_arrives_as_distance_shrinks() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = calibrated_north();
    let position = PositionSource::new();
    let nav = NavigationEngine::new(&motors, &heading, &position, config.navigation);
    let target = Waypoint::new(48.0010, 11.0);

    let mut last = f64::MAX;
    for lat in [48.0, 48.0005, 48.0009] {
        publish(&position, lat, 11.0);
        match nav.step(&target, 40, 2.0) {
            SteerStep::Drive {
                distance_m,
                left,
                right,
                ..
            } => {
                assert!(distance_m < last);
                last = distance_m;
                // straight ahead: no correction on either wheel
                assert_eq!((left, right), (40, 40));
            }
            other => panic!("expected drive, got {other:?}"),
        }
    }

    publish(&position, 48.000995, 11.0);
    assert!(matches!(nav.step(&target, 40, 2.0), SteerStep::Arrived { distance_m } if distance_m <= 2.0));
}

#[test]
fn arrival_starts_exactly_at_range() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = calibrated_north();
    let position = PositionSource::new();
    let nav = NavigationEngine::new(&motors, &heading, &position, config.navigation);
    let target = Waypoint::new(48.0010, 11.0);

    publish(&position, START.0, START.1);
    let distance = geo::distance_between(START.0, START.1, target.latitude, target.longitude);

    // smallest f32 range covering the distance, and the one just below it
    let mut at = distance as f32;
    if f64::from(at) < distance {
        at = f32::from_bits(at.to_bits() + 1);
    }
    let below = f32::from_bits(at.to_bits() - 1);
    assert!(f64::from(below) < distance);

    assert!(matches!(nav.step(&target, 40, below), SteerStep::Drive { .. }));
    assert!(matches!(nav.step(&target, 40, at), SteerStep::Arrived { .. }));
}

#[test]
fn stale_fix_holds_then_recovers() {
    let mut config = fast_config();
    config.navigation.stale_after_ms = 20;
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = calibrated_north();
    let position = PositionSource::new();
    let nav = NavigationEngine::new(&motors, &heading, &position, config.navigation);
    let target = Waypoint::new(48.0010, 11.0);

    publish(&position, START.0, START.1);
    assert!(matches!(nav.step(&target, 40, 2.0), SteerStep::Drive { .. }));

    std::thread::sleep(std::time::Duration::from_millis(40));
    assert!(matches!(nav.step(&target, 40, 2.0), SteerStep::Stale { .. }));

    publish(&position, START.0, START.1);
    assert!(matches!(nav.step(&target, 40, 2.0), SteerStep::Drive { .. }));
}

#[test]
fn falls_back_to_gps_course_when_uncalibrated() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = HeadingSource::new(SpinCompass::north());
    let position = PositionSource::new();
    let nav = NavigationEngine::new(&motors, &heading, &position, config.navigation);
    let target = Waypoint::new(48.0010, 11.0);

    publish(&position, START.0, START.1);
    assert!(matches!(nav.step(&target, 40, 2.0), SteerStep::NoHeading { .. }));

    position.publish(FixSample {
        latitude: START.0,
        longitude: START.1,
        course_over_ground: Some(90.0),
        satellites: 9,
    });
    match nav.step(&target, 40, 2.0) {
        SteerStep::Drive {
            course_error_deg,
            left,
            right,
            ..
        } => {
            // facing east with the target due north: turn left
            assert!((course_error_deg + 90.0).abs() < 0.5);
            assert_eq!((left, right), (30, 40));
        }
        other => panic!("expected drive, got {other:?}"),
    }
}

#[test]
fn point_goto_without_fix_fails() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = calibrated_north();
    let position = PositionSource::new();
    let nav = NavigationEngine::new(&motors, &heading, &position, config.navigation);

    let outcome = block_on(nav.go_to(Waypoint::new(48.001, 11.0), 40, 2.0, &uncancellable()));
    assert_eq!(outcome, LegOutcome::FixLost);
    assert!(motors.is_neutral());
}

#[test]
fn route_aborts_on_lost_fix_in_second_leg() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = calibrated_north();
    let position = PositionSource::new();
    let nav = NavigationEngine::new(&motors, &heading, &position, config.navigation);
    let route = Route::new(
        &[
            Waypoint::new(START.0, START.1),
            Waypoint::new(48.0010, 11.0),
            Waypoint::new(48.0020, 11.0),
        ],
        40,
        2.0,
    )
    .unwrap();

    publish(&position, START.0, START.1);
    let token = uncancellable();
    let script = async {
        until_driving(&motors).await;
        position.invalidate();
    };
    let (outcome, ()) = block_on(join(nav.go_route(&route, &token), script));

    assert_eq!(outcome, RouteOutcome::Aborted { leg: 1 });
    assert!(motors.is_neutral());
    assert_eq!(motors.pulse(Wheel::Left), 1460);
    assert_eq!(motors.pulse(Wheel::Right), 1460);
}

#[test]
fn route_completes_leg_by_leg() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = calibrated_north();
    let position = PositionSource::new();
    let nav = NavigationEngine::new(&motors, &heading, &position, config.navigation);
    let points = [
        Waypoint::new(START.0, START.1),
        Waypoint::new(48.0010, 11.0),
        Waypoint::new(48.0020, 11.0),
    ];
    let route = Route::new(&points, 40, 2.0).unwrap();

    publish(&position, START.0, START.1);
    let token = uncancellable();
    let script = async {
        until_driving(&motors).await;
        for point in &points[1..] {
            publish(&position, point.latitude, point.longitude);
            Timer::after_millis(10).await;
        }
    };
    let (outcome, ()) = block_on(join(nav.go_route(&route, &token), script));

    assert_eq!(outcome, RouteOutcome::Completed);
    assert!(motors.is_neutral());
}

#[test]
fn single_flight_under_contention() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = calibrated_north();
    let position = PositionSource::new();
    let arbiter = MotionArbiter::new(&motors, &heading, &position, config);

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| arbiter.try_start(MotionRequest::Calibrate)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.err())
        .all(|e| e == MotionError::Busy));
    assert_eq!(arbiter.state(), TaskState::Running(MotionKind::Calibrating));

    let before = writes(&motors);
    assert_eq!(
        arbiter.try_start(MotionRequest::GoTo {
            target: Waypoint::new(48.001, 11.0),
            speed: 40,
            arrival_range_m: 2.0,
        }),
        Err(MotionError::Busy)
    );
    assert_eq!(arbiter.drive_manual(50, 50), Err(MotionError::Busy));
    assert_eq!(writes(&motors), before);

    arbiter.cancel();
    assert!(arbiter.is_idle());
    assert_eq!(arbiter.last_outcome(), Some(TaskOutcome::Cancelled));
    assert!(arbiter.try_start(MotionRequest::Calibrate).is_ok());
}

#[test]
fn cancel_when_idle_only_writes_neutral() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = calibrated_north();
    let position = PositionSource::new();
    let arbiter = MotionArbiter::new(&motors, &heading, &position, config);

    arbiter.drive_manual(30, -30).unwrap();
    assert_eq!((motors.left(), motors.right()), (30, -30));

    arbiter.cancel();
    arbiter.cancel();
    assert!(motors.is_neutral());
    assert!(arbiter.is_idle());
    assert_eq!(arbiter.last_outcome(), None);
}

#[test]
fn cancel_mid_navigation_leaves_neutral() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = calibrated_north();
    let position = PositionSource::new();
    let arbiter = MotionArbiter::new(&motors, &heading, &position, config);
    publish(&position, START.0, START.1);

    let started = arbiter
        .try_start(MotionRequest::GoTo {
            target: Waypoint::new(48.0100, 11.0),
            speed: 40,
            arrival_range_m: 2.0,
        })
        .unwrap();
    assert_eq!(started.kind, MotionKind::PointGoTo);

    let script = async {
        until_driving(&motors).await;
        arbiter.cancel();
    };
    let (outcome, ()) = block_on(join(arbiter.execute_next(), script));

    assert_eq!(outcome, TaskOutcome::Cancelled);
    assert!(motors.is_neutral());
    assert_eq!(motors.pulse(Wheel::Left), 1460);
    assert!(arbiter.is_idle());
    assert_eq!(arbiter.last_outcome(), Some(TaskOutcome::Cancelled));
    assert!(arbiter.try_start(MotionRequest::Calibrate).is_ok());
}

#[test]
fn cancel_mid_calibration_keeps_learned_envelope() {
    let mut config = fast_config();
    config.calibration.duration_ms = 10_000;
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = HeadingSource::new(SpinCompass::spinning(10.0, (0.0, 0.0)));
    let position = PositionSource::new();
    let arbiter = MotionArbiter::new(&motors, &heading, &position, config);

    arbiter.try_start(MotionRequest::Calibrate).unwrap();
    let script = async {
        until_driving(&motors).await;
        assert_eq!((motors.left(), motors.right()), (20, -20));
        Timer::after_millis(20).await;
        arbiter.cancel();
    };
    let (outcome, ()) = block_on(join(arbiter.execute_next(), script));

    assert_eq!(outcome, TaskOutcome::Cancelled);
    assert!(motors.is_neutral());
    assert!(arbiter.is_idle());
    let envelope = arbiter.envelope();
    assert!(envelope.is_calibrated());
    assert!(envelope.y_max > 0.1);
}

#[test]
fn calibration_runs_to_completion() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = HeadingSource::new(SpinCompass::spinning(30.0, (0.3, -0.2)));
    let position = PositionSource::new();
    let arbiter = MotionArbiter::new(&motors, &heading, &position, config);

    arbiter.try_start(MotionRequest::Calibrate).unwrap();
    let outcome = block_on(arbiter.execute_next());

    assert_eq!(outcome, TaskOutcome::Completed);
    assert!(motors.is_neutral());
    let (cx, cy) = arbiter.envelope().center();
    assert!((cx - 0.3).abs() < 0.1, "center x {cx}");
    assert!((cy + 0.2).abs() < 0.1, "center y {cy}");
}

#[test]
fn calibration_without_sensor_fails() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = HeadingSource::new(SpinCompass::dead());
    let position = PositionSource::new();
    let arbiter = MotionArbiter::new(&motors, &heading, &position, config);

    arbiter.try_start(MotionRequest::Calibrate).unwrap();
    let outcome = block_on(arbiter.execute_next());

    assert_eq!(
        outcome,
        TaskOutcome::Failed {
            reason: FailReason::CompassUnavailable
        }
    );
    assert!(motors.is_neutral());
    assert!(!arbiter.envelope().is_calibrated());
}

#[test]
fn goto_without_fix_reports_failure() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = calibrated_north();
    let position = PositionSource::new();
    let arbiter = MotionArbiter::new(&motors, &heading, &position, config);

    arbiter
        .try_start(MotionRequest::GoTo {
            target: Waypoint::new(48.001, 11.0),
            speed: 40,
            arrival_range_m: 2.0,
        })
        .unwrap();
    let outcome = block_on(arbiter.execute_next());

    let expected = TaskOutcome::Failed {
        reason: FailReason::FixLost { leg: 0 },
    };
    assert_eq!(outcome, expected);
    assert_eq!(arbiter.last_outcome(), Some(expected));
    assert!(arbiter.is_idle());
}

#[test]
fn invalid_plans_are_rejected_without_side_effects() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = calibrated_north();
    let position = PositionSource::new();
    let arbiter = MotionArbiter::new(&motors, &heading, &position, config);

    let mut waypoints = heapless::Vec::new();
    waypoints.push(Waypoint::new(48.001, 11.0)).unwrap();
    let single = Route {
        waypoints,
        speed: 40,
        arrival_range_m: 2.0,
    };
    assert_eq!(
        arbiter.try_start(MotionRequest::Route { route: single }),
        Err(MotionError::InvalidRoute(PlanError::TooFewWaypoints))
    );
    assert_eq!(
        arbiter.try_start(MotionRequest::GoTo {
            target: Waypoint::new(48.001, 11.0),
            speed: 0,
            arrival_range_m: 2.0,
        }),
        Err(MotionError::InvalidTarget(PlanError::NonPositiveSpeed))
    );
    assert_eq!(arbiter.try_start(MotionRequest::StoredRoute), Err(MotionError::NoStoredRoute));

    let sixty: Vec<_> = (0..60).map(|i| Waypoint::new(48.0 + f64::from(i) * 1e-4, 11.0)).collect();
    assert_eq!(Route::new(&sixty, 40, 2.0), Err(PlanError::TooManyWaypoints));

    let json = serde_json::json!({
        "mc": "route",
        "route": { "waypoints": sixty, "speed": 40, "arrival_range_m": 2.0 }
    });
    let command: MotionCommand = serde_json::from_value(json).unwrap();
    let reply = serde_json::to_value(arbiter.execute(command)).unwrap();
    assert_eq!(reply["reply"], "rejected");
    assert_eq!(reply["error"]["error"], "invalid_route");
    assert_eq!(reply["error"]["detail"], "too_many_waypoints");

    let json = serde_json::json!({
        "mc": "store_route",
        "route": { "waypoints": sixty, "speed": 40, "arrival_range_m": 2.0 }
    });
    let command: MotionCommand = serde_json::from_value(json).unwrap();
    assert_eq!(
        arbiter.execute(command),
        CommandReply::Rejected {
            error: MotionError::InvalidRoute(PlanError::TooManyWaypoints)
        }
    );
    assert_eq!(arbiter.stored_route(), None);

    assert_eq!(writes(&motors), 0);
    assert!(arbiter.is_idle());
    assert_eq!(arbiter.last_outcome(), None);
}

#[test]
fn stored_route_round_trip() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = calibrated_north();
    let position = PositionSource::new();
    let arbiter = MotionArbiter::new(&motors, &heading, &position, config);

    let route = Route::new(&[Waypoint::new(48.001, 11.0), Waypoint::new(48.002, 11.0)], 30, 3.0).unwrap();
    arbiter.store_route(route.clone()).unwrap();
    assert_eq!(arbiter.stored_route(), Some(route));

    let started = arbiter.try_start(MotionRequest::StoredRoute).unwrap();
    assert_eq!(started.kind, MotionKind::RouteGoTo);
    arbiter.cancel();
}

#[test]
fn json_commands_drive_the_arbiter() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = calibrated_north();
    let position = PositionSource::new();
    let arbiter = MotionArbiter::new(&motors, &heading, &position, config);

    let command: MotionCommand =
        serde_json::from_str(r#"{"mc":"go_to","lat":48.1,"lon":11.5,"speed":40,"range":2.0}"#).unwrap();
    let reply = serde_json::to_value(arbiter.execute(command)).unwrap();
    assert_eq!(reply["reply"], "started");
    assert_eq!(reply["kind"], "point_go_to");

    let command: MotionCommand = serde_json::from_str(r#"{"mc":"manual","left":10,"right":10}"#).unwrap();
    let reply = serde_json::to_value(arbiter.execute(command)).unwrap();
    assert_eq!(reply["reply"], "rejected");
    assert_eq!(reply["error"]["error"], "busy");

    let command: MotionCommand = serde_json::from_str(r#"{"mc":"status"}"#).unwrap();
    let reply = serde_json::to_value(arbiter.execute(command)).unwrap();
    assert_eq!(reply["reply"], "status");
    assert_eq!(reply["task"]["state"], "running");
    assert_eq!(reply["task"]["task"], "point_go_to");

    let command: MotionCommand = serde_json::from_str(r#"{"mc":"cancel"}"#).unwrap();
    assert_eq!(arbiter.execute(command), CommandReply::Ack);
    assert!(arbiter.is_idle());

    let command: MotionCommand =
        serde_json::from_str(r#"{"mc":"set_bias","left":1.2,"right":0.8}"#).unwrap();
    assert_eq!(arbiter.execute(command), CommandReply::Ack);
    assert_eq!(motors.bias().left, 1.2);
    assert_eq!(motors.bias().right, 0.8);
}

#[test]
fn cancel_while_holding_on_stale_fix() {
    let mut config = fast_config();
    config.navigation.stale_after_ms = 20;
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = calibrated_north();
    let position = PositionSource::new();
    let nav = NavigationEngine::new(&motors, &heading, &position, config.navigation);
    publish(&position, START.0, START.1);

    let owner = AtomicU32::new(7);
    let token = CancelToken::new(&owner, 7);
    let script = async {
        until_driving(&motors).await;
        // no new fixes: the loop goes stale and holds neutral
        Timer::after_millis(60).await;
        assert!(motors.is_neutral());
        owner.store(0, Ordering::Release);
    };
    let target = Waypoint::new(48.0100, 11.0);
    let (outcome, ()) = block_on(join(nav.go_to(target, 40, 2.0, &token), script));

    assert_eq!(outcome, LegOutcome::Cancelled);
    assert!(motors.is_neutral());
}

#[test]
fn cancel_before_launch_leaves_motors_and_envelope() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = HeadingSource::new(SpinCompass::spinning(10.0, (0.5, 0.5)));
    let position = PositionSource::new();
    let arbiter = MotionArbiter::new(&motors, &heading, &position, config);
    arbiter.set_envelope(unit_envelope());

    arbiter.try_start(MotionRequest::Calibrate).unwrap();
    arbiter.cancel();
    let before = writes(&motors);

    let outcome = block_on(arbiter.execute_next());

    assert_eq!(outcome, TaskOutcome::Cancelled);
    assert_eq!(writes(&motors), before);
    assert_eq!(arbiter.envelope(), unit_envelope());
    assert!(arbiter.is_idle());
    assert_eq!(arbiter.last_outcome(), Some(TaskOutcome::Cancelled));
}

#[test]
fn cancel_start_cancel_back_to_back_stays_stopped() {
    let config = fast_config();
    let motors = MotorOutput::new(SimDrive::default(), config.motor);
    let heading = calibrated_north();
    let position = PositionSource::new();
    let arbiter = MotionArbiter::new(&motors, &heading, &position, config);
    publish(&position, START.0, START.1);

    let far = || MotionRequest::GoTo {
        target: Waypoint::new(48.0100, 11.0),
        speed: 40,
        arrival_range_m: 2.0,
    };
    let first = arbiter.try_start(far()).unwrap();

    let script = async {
        until_driving(&motors).await;
        arbiter.cancel();
        let second = arbiter.try_start(far()).unwrap();
        assert_ne!(second.run, first.run);
        arbiter.cancel();

        // neither run may drive again once both are cancelled
        Timer::after_millis(50).await;
        assert!(motors.is_neutral());
        assert!(arbiter.is_idle());
    };
    block_on(select(arbiter.run(), script));

    assert!(motors.is_neutral());
    assert_eq!(arbiter.last_outcome(), Some(TaskOutcome::Cancelled));

    // a fresh start after the storm runs normally
    arbiter.try_start(far()).unwrap();
    let script = async {
        until_driving(&motors).await;
        arbiter.cancel();
    };
    let (outcome, ()) = block_on(join(arbiter.execute_next(), script));
    assert_eq!(outcome, TaskOutcome::Cancelled);
    assert!(motors.is_neutral());
}
