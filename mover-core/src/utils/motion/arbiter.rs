//! Single-flight ownership of the motors.
//!
//! `MotionArbiter` is the only component allowed to launch a task that writes
//! to the motors. A start request is accepted only while idle; the accepted
//! request is handed to the motion worker ([`MotionArbiter::run`]) as an owned
//! value. Every exit path of a task, natural or cancelled, writes neutral to
//! both wheels before ownership is released.
//!
//! Cancellation is cooperative first: the task's [`CancelToken`] fires as soon
//! as its run no longer owns the motors, and the loops return at their next
//! tick. As a hard stop the worker also races the task against a stop signal
//! and drops the task future once its token reports cancellation.

use core::{
    cell::{Cell, RefCell},
    sync::atomic::{AtomicU32, Ordering},
};

use embassy_futures::select::{select, Either};
use embassy_sync::{
    blocking_mutex::{raw::CriticalSectionRawMutex, Mutex},
    signal::Signal,
};
use serde::Serialize;

use super::{
    calibration::{CalibrationOutcome, CompassCalibrator},
    navigation::{LegOutcome, NavigationEngine, RouteOutcome},
    route::{validate_leg, Route, Waypoint},
    CancelToken, FailReason, MotionError, MotionKind, MotionRequest, TaskOutcome, TaskState,
};
use crate::utils::{
    config::MoverConfig,
    controllers::{
        compass::{CalibrationEnvelope, HeadingSource, MagSample, Magnetometer},
        gps::{Fix, PositionSource},
        motor::{Bias, DriveSignal, MotorOutput},
    },
};

/// Acknowledgement of an accepted start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Started {
    pub kind: MotionKind,
    /// Identifier of this task run.
    pub run: u32,
}

/// Snapshot for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MotionStatus {
    pub task: TaskState,
    pub last_outcome: Option<TaskOutcome>,
    pub left: i16,
    pub right: i16,
    pub bias: Bias,
    pub fix: Fix,
    pub heading: Option<f32>,
    pub envelope: CalibrationEnvelope,
}

#[derive(Debug, Clone, Copy)]
struct Ownership {
    task: TaskState,
    run: u32,
    last_outcome: Option<TaskOutcome>,
}

/// A validated request, ready to run.
enum Task {
    GoTo {
        target: Waypoint,
        speed: i16,
        arrival_range_m: f32,
    },
    Route(Route),
    Calibrate,
}

impl Task {
    fn kind(&self) -> MotionKind {
        match self {
            Task::GoTo { .. } => MotionKind::PointGoTo,
            Task::Route(_) => MotionKind::RouteGoTo,
            Task::Calibrate => MotionKind::Calibrating,
        }
    }
}

struct Launch {
    run: u32,
    task: Task,
}

fn next_run(run: u32) -> u32 {
    // 0 is reserved for "no owner"
    match run.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// Gatekeeper between the dispatcher and the motion tasks.
pub struct MotionArbiter<'a, D, M> {
    motors: &'a MotorOutput<D>,
    heading: &'a HeadingSource<M>,
    position: &'a PositionSource,
    config: MoverConfig,
    ownership: Mutex<CriticalSectionRawMutex, Cell<Ownership>>,
    stored_route: Mutex<CriticalSectionRawMutex, RefCell<Option<Route>>>,
    launch: Signal<CriticalSectionRawMutex, Launch>,
    stop: Signal<CriticalSectionRawMutex, ()>,
    /// Run id owning the motors, 0 while idle; mirrors `ownership`.
    owner: AtomicU32,
}

impl<'a, D, M> MotionArbiter<'a, D, M>
where
    D: DriveSignal,
    M: Magnetometer,
{
    pub fn new(
        motors: &'a MotorOutput<D>,
        heading: &'a HeadingSource<M>,
        position: &'a PositionSource,
        config: MoverConfig,
    ) -> Self {
        Self {
            motors,
            heading,
            position,
            config,
            ownership: Mutex::new(Cell::new(Ownership {
                task: TaskState::Idle,
                run: 0,
                last_outcome: None,
            })),
            stored_route: Mutex::new(RefCell::new(None)),
            launch: Signal::new(),
            stop: Signal::new(),
            owner: AtomicU32::new(0),
        }
    }

    /// Start `request` if no task is running.
    ///
    /// Plans are validated first; a rejected or busy start has no side effect.
    pub fn try_start(
        &self,
        request: MotionRequest,
    ) -> Result<Started, MotionError> {
        let task = self.resolve(request)?;
        let kind = task.kind();

        let run = self.ownership.lock(|cell| {
            let mut ownership = cell.get();
            match ownership.task {
                TaskState::Running(_) => None,
                TaskState::Idle => {
                    ownership.run = next_run(ownership.run);
                    ownership.task = TaskState::Running(kind);
                    cell.set(ownership);
                    self.owner.store(ownership.run, Ordering::Release);
                    Some(ownership.run)
                }
            }
        });

        let Some(run) = run else {
            tracing::warn!(?kind, "start rejected, motors busy");
            return Err(MotionError::Busy);
        };

        self.launch.signal(Launch { run, task });
        tracing::info!(run, ?kind, "motion task started");
        Ok(Started { kind, run })
    }

    fn resolve(
        &self,
        request: MotionRequest,
    ) -> Result<Task, MotionError> {
        match request {
            MotionRequest::GoTo {
                target,
                speed,
                arrival_range_m,
            } => {
                validate_leg(speed, arrival_range_m).map_err(MotionError::InvalidTarget)?;
                Ok(Task::GoTo {
                    target,
                    speed,
                    arrival_range_m,
                })
            }
            MotionRequest::Route { route } => {
                route.validate().map_err(MotionError::InvalidRoute)?;
                Ok(Task::Route(route))
            }
            MotionRequest::StoredRoute => self
                .stored_route()
                .map(Task::Route)
                .ok_or(MotionError::NoStoredRoute),
            MotionRequest::Calibrate => Ok(Task::Calibrate),
        }
    }

    /// Stop the running task, if any, and bring the motors to neutral.
    ///
    /// Always safe to call; while idle it only rewrites neutral. The neutral
    /// write and the release happen in one critical section, so no start can
    /// slip in between them.
    pub fn cancel(&self) {
        let cancelled = self.ownership.lock(|cell| {
            let ownership = cell.get();
            self.motors.neutral();
            match ownership.task {
                TaskState::Running(kind) => {
                    self.release_locked(cell, ownership.run, TaskOutcome::Cancelled);
                    Some((ownership.run, kind))
                }
                TaskState::Idle => None,
            }
        });

        if let Some((run, kind)) = cancelled {
            self.stop.signal(());
            tracing::info!(run, ?kind, "motion task cancelled");
        }
    }

    /// Motion worker: run accepted requests one after another, forever.
    pub async fn run(&self) -> ! {
        loop {
            self.execute_next().await;
        }
    }

    /// Wait for the next accepted request and run it to its end.
    pub async fn execute_next(&self) -> TaskOutcome {
        let Launch { run, task } = self.launch.wait().await;
        let token = CancelToken::new(&self.owner, run);

        // cancelled before the worker got to it: `cancel` already wrote
        // neutral and released, so the motors and the envelope stay untouched
        if token.is_cancelled() {
            tracing::debug!(run, "motion task cancelled before launch");
            return TaskOutcome::Cancelled;
        }

        let outcome = match select(self.perform(task, &token), self.stopped(&token)).await {
            Either::First(outcome) => outcome,
            Either::Second(()) => TaskOutcome::Cancelled,
        };

        self.motors.neutral();
        if self.release(run, outcome) {
            tracing::info!(run, ?outcome, "motion task finished");
        }
        outcome
    }

    async fn perform(
        &self,
        task: Task,
        token: &CancelToken<'_>,
    ) -> TaskOutcome {
        match task {
            Task::GoTo {
                target,
                speed,
                arrival_range_m,
            } => match self.navigator().go_to(target, speed, arrival_range_m, token).await {
                LegOutcome::Reached => TaskOutcome::Completed,
                LegOutcome::FixLost => TaskOutcome::Failed {
                    reason: FailReason::FixLost { leg: 0 },
                },
                LegOutcome::Cancelled => TaskOutcome::Cancelled,
            },
            Task::Route(route) => match self.navigator().go_route(&route, token).await {
                RouteOutcome::Completed => TaskOutcome::Completed,
                RouteOutcome::Aborted { leg } => TaskOutcome::Failed {
                    reason: FailReason::FixLost { leg },
                },
                RouteOutcome::Cancelled => TaskOutcome::Cancelled,
                RouteOutcome::Rejected(error) => TaskOutcome::Failed {
                    reason: FailReason::InvalidRoute(error),
                },
            },
            Task::Calibrate => match self.calibrator().run(token).await {
                CalibrationOutcome::Completed(_) => TaskOutcome::Completed,
                CalibrationOutcome::Cancelled(_) => TaskOutcome::Cancelled,
                CalibrationOutcome::SensorUnavailable => TaskOutcome::Failed {
                    reason: FailReason::CompassUnavailable,
                },
            },
        }
    }

    /// Resolve once `token` is cancelled, re-checking after every stop signal.
    async fn stopped(
        &self,
        token: &CancelToken<'_>,
    ) {
        while !token.is_cancelled() {
            self.stop.wait().await;
        }
    }

    /// Return to idle if `run` still owns the motors.
    fn release(
        &self,
        run: u32,
        outcome: TaskOutcome,
    ) -> bool {
        self.ownership.lock(|cell| self.release_locked(cell, run, outcome))
    }

    fn release_locked(
        &self,
        cell: &Cell<Ownership>,
        run: u32,
        outcome: TaskOutcome,
    ) -> bool {
        let mut ownership = cell.get();
        if ownership.run == run && matches!(ownership.task, TaskState::Running(_)) {
            ownership.task = TaskState::Idle;
            ownership.last_outcome = Some(outcome);
            cell.set(ownership);
            self.owner.store(0, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn navigator(&self) -> NavigationEngine<'a, D, M> {
        NavigationEngine::new(self.motors, self.heading, self.position, self.config.navigation)
    }

    pub fn calibrator(&self) -> CompassCalibrator<'a, D, M> {
        CompassCalibrator::new(self.motors, self.heading, self.config.calibration)
    }

    pub fn state(&self) -> TaskState {
        self.ownership.lock(|cell| cell.get().task)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state(), TaskState::Idle)
    }

    pub fn last_outcome(&self) -> Option<TaskOutcome> {
        self.ownership.lock(|cell| cell.get().last_outcome)
    }

    /// Set wheel setpoints directly while no motion task owns the motors.
    pub fn drive_manual(
        &self,
        left: i16,
        right: i16,
    ) -> Result<(), MotionError> {
        self.ownership.lock(|cell| match cell.get().task {
            TaskState::Running(kind) => {
                tracing::warn!(?kind, "manual drive rejected, motors busy");
                Err(MotionError::Busy)
            }
            TaskState::Idle => {
                self.motors.set_left(left);
                self.motors.set_right(right);
                Ok(())
            }
        })
    }

    pub fn set_bias(
        &self,
        left: f32,
        right: f32,
    ) {
        self.motors.set_bias(left, right);
    }

    /// Validate and keep `route` for a later [`MotionRequest::StoredRoute`].
    pub fn store_route(
        &self,
        route: Route,
    ) -> Result<(), MotionError> {
        route.validate().map_err(MotionError::InvalidRoute)?;
        let legs = route.len();
        self.stored_route.lock(|slot| *slot.borrow_mut() = Some(route));
        tracing::info!(legs, "route stored");
        Ok(())
    }

    pub fn stored_route(&self) -> Option<Route> {
        self.stored_route.lock(|slot| slot.borrow().clone())
    }

    pub fn envelope(&self) -> CalibrationEnvelope {
        self.heading.envelope()
    }

    /// Install a persisted calibration envelope.
    pub fn set_envelope(
        &self,
        envelope: CalibrationEnvelope,
    ) {
        self.heading.set_envelope(envelope);
        tracing::info!(?envelope, "calibration envelope installed");
    }

    /// Raw magnetometer reading, `None` if the sensor did not answer.
    pub fn mag_sample(&self) -> Option<MagSample> {
        match self.heading.sample() {
            Ok(sample) => Some(sample),
            Err(error) => {
                tracing::warn!(?error, "magnetometer read failed");
                None
            }
        }
    }

    pub fn status(&self) -> MotionStatus {
        let ownership = self.ownership.lock(|cell| cell.get());
        MotionStatus {
            task: ownership.task,
            last_outcome: ownership.last_outcome,
            left: self.motors.left(),
            right: self.motors.right(),
            bias: self.motors.bias(),
            fix: self.position.fix(),
            heading: self.heading.calibrated_heading(),
            envelope: self.heading.envelope(),
        }
    }
}
