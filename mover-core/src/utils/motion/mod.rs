//! Motion tasks and their single-flight arbiter.
//!
//! - `route`: waypoint and route types with validation
//! - `navigation`: point-to-point steering loop and route sequencing
//! - `calibration`: spin-in-place compass calibration
//! - `arbiter`: ownership of the motors across motion tasks
//! - `command`: serde-tagged command surface for an outer dispatcher

pub mod arbiter;
pub mod calibration;
pub mod command;
pub mod navigation;
pub mod route;

use core::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

pub use route::{PlanError, Route, RoutePlan, Waypoint};

/// Kind of motion task owning the motors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionKind {
    PointGoTo,
    RouteGoTo,
    Calibrating,
}

/// Ownership state of the motors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "task", rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Running(MotionKind),
}

/// Why a task ended without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    /// The fix went invalid during the given leg (0-based).
    FixLost { leg: usize },
    /// The magnetometer never produced a first sample.
    CompassUnavailable,
    InvalidRoute(PlanError),
}

/// Terminal disposition of a motion task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed { reason: FailReason },
    Cancelled,
}

/// Owned motion request, moved into the task at launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MotionRequest {
    GoTo {
        target: Waypoint,
        speed: i16,
        arrival_range_m: f32,
    },
    Route { route: Route },
    /// Drive the route held by the arbiter.
    StoredRoute,
    Calibrate,
}

impl MotionRequest {
    pub fn kind(&self) -> MotionKind {
        match self {
            MotionRequest::GoTo { .. } => MotionKind::PointGoTo,
            MotionRequest::Route { .. } | MotionRequest::StoredRoute => MotionKind::RouteGoTo,
            MotionRequest::Calibrate => MotionKind::Calibrating,
        }
    }
}

/// Reasons the arbiter refuses an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", content = "detail", rename_all = "snake_case")]
pub enum MotionError {
    /// Another motion task owns the motors.
    Busy,
    InvalidRoute(PlanError),
    InvalidTarget(PlanError),
    NoStoredRoute,
}

impl core::fmt::Display for MotionError {
    fn fmt(
        &self,
        f: &mut core::fmt::Formatter<'_>,
    ) -> core::fmt::Result {
        match self {
            MotionError::Busy => write!(f, "a motion task is already running"),
            MotionError::InvalidRoute(e) => write!(f, "invalid route: {}", e),
            MotionError::InvalidTarget(e) => write!(f, "invalid target: {}", e),
            MotionError::NoStoredRoute => write!(f, "no route stored"),
        }
    }
}

/// Cooperative cancellation flag for one task run.
///
/// `owner` holds the id of the run that currently owns the motors, or 0 while
/// idle. The arbiter updates it in the same critical section as its ownership
/// record, so a token counts as cancelled as soon as its run no longer owns
/// the motors, whichever later runs were started or cancelled meanwhile.
#[derive(Clone, Copy)]
pub struct CancelToken<'a> {
    owner: &'a AtomicU32,
    run: u32,
}

impl<'a> CancelToken<'a> {
    pub fn new(
        owner: &'a AtomicU32,
        run: u32,
    ) -> Self {
        Self { owner, run }
    }

    pub fn is_cancelled(&self) -> bool {
        self.owner.load(Ordering::Acquire) != self.run
    }
}

/// Token that never fires, for running a task outside the arbiter.
pub fn uncancellable() -> CancelToken<'static> {
    static ALWAYS_OWNED: AtomicU32 = AtomicU32::new(u32::MAX);
    CancelToken::new(&ALWAYS_OWNED, u32::MAX)
}
