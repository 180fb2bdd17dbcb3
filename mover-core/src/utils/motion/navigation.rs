//! GPS steering loop.
//!
//! [`NavigationEngine::go_to`] drives toward one waypoint: every control tick
//! it reads the latest fix, checks arrival, computes the bearing to the target
//! and corrects the course with differential wheel speeds.
//! [`NavigationEngine::go_route`] chains legs and aborts the whole route on the
//! first leg that loses the fix.
//!
//! Heading feedback prefers the calibrated compass and falls back to the GPS
//! course over ground when the compass is uncalibrated or unreadable.

use embassy_time::{Duration, Timer};
use serde::Serialize;

use super::{
    route::{PlanError, Route, Waypoint},
    CancelToken,
};
use crate::utils::{
    config::NavConfig,
    controllers::{
        compass::{HeadingSource, Magnetometer},
        gps::{Fix, PositionSource},
        motor::{DriveSignal, MotorOutput},
    },
    math::{geo, steering},
};

/// Where the heading used for a steering decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadingKind {
    Compass,
    GpsCourse,
}

/// One control decision of the steering loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SteerStep {
    /// No valid fix: the leg is abandoned.
    FixLost,
    /// Fix too old to steer on; hold still and poll again.
    Stale { age_ms: u64 },
    /// Neither compass nor GPS course available; hold still and poll again.
    NoHeading { distance_m: f64 },
    Arrived { distance_m: f64 },
    Drive {
        distance_m: f64,
        bearing_deg: f32,
        heading_deg: f32,
        heading: HeadingKind,
        course_error_deg: f32,
        left: i16,
        right: i16,
    },
}

/// Result of a single point-to-point leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegOutcome {
    Reached,
    FixLost,
    Cancelled,
}

impl LegOutcome {
    pub fn is_reached(&self) -> bool {
        matches!(self, LegOutcome::Reached)
    }
}

/// Result of a whole route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Completed,
    /// The given leg (0-based) lost the fix; later legs were not attempted.
    Aborted { leg: usize },
    Cancelled,
    Rejected(PlanError),
}

/// Steering loop over the shared motor output and sensors.
pub struct NavigationEngine<'a, D, M> {
    motors: &'a MotorOutput<D>,
    heading: &'a HeadingSource<M>,
    position: &'a PositionSource,
    config: NavConfig,
}

impl<'a, D, M> NavigationEngine<'a, D, M>
where
    D: DriveSignal,
    M: Magnetometer,
{
    pub fn new(
        motors: &'a MotorOutput<D>,
        heading: &'a HeadingSource<M>,
        position: &'a PositionSource,
        config: NavConfig,
    ) -> Self {
        Self {
            motors,
            heading,
            position,
            config,
        }
    }

    /// Heading for steering: calibrated compass first, GPS course second.
    pub fn current_heading(
        &self,
        fix: &Fix,
    ) -> Option<(f32, HeadingKind)> {
        if let Some(heading) = self.heading.calibrated_heading() {
            return Some((heading, HeadingKind::Compass));
        }
        fix.course_over_ground
            .filter(|course| course.is_finite())
            .map(|course| (libm::fmodf(course + 360.0, 360.0), HeadingKind::GpsCourse))
    }

    /// Compute one control decision without touching the motors.
    pub fn step(
        &self,
        target: &Waypoint,
        speed: i16,
        arrival_range_m: f32,
    ) -> SteerStep {
        let fix = self.position.fix();
        if !fix.is_valid {
            return SteerStep::FixLost;
        }
        if fix.age_ms > self.config.stale_after_ms {
            return SteerStep::Stale { age_ms: fix.age_ms };
        }

        let distance_m =
            geo::distance_between(fix.latitude, fix.longitude, target.latitude, target.longitude);
        if distance_m <= f64::from(arrival_range_m) {
            return SteerStep::Arrived { distance_m };
        }

        let bearing_deg =
            geo::course_to(fix.latitude, fix.longitude, target.latitude, target.longitude) as f32;
        let Some((heading_deg, heading)) = self.current_heading(&fix) else {
            return SteerStep::NoHeading { distance_m };
        };

        let course_error_deg = steering::course_error(bearing_deg, heading_deg);
        let (left, right) = steering::differential(course_error_deg, speed);
        SteerStep::Drive {
            distance_m,
            bearing_deg,
            heading_deg,
            heading,
            course_error_deg,
            left,
            right,
        }
    }

    /// Drive to `target` until within `arrival_range_m`.
    ///
    /// Motors are left neutral on every return path.
    pub async fn go_to(
        &self,
        target: Waypoint,
        speed: i16,
        arrival_range_m: f32,
        token: &CancelToken<'_>,
    ) -> LegOutcome {
        let tick = Duration::from_millis(self.config.control_period_ms);
        let mut holding = false;

        loop {
            if token.is_cancelled() {
                self.motors.neutral();
                return LegOutcome::Cancelled;
            }

            match self.step(&target, speed, arrival_range_m) {
                SteerStep::FixLost => {
                    self.motors.neutral();
                    tracing::warn!(
                        lat = target.latitude,
                        lon = target.longitude,
                        "fix lost, leg abandoned"
                    );
                    return LegOutcome::FixLost;
                }
                SteerStep::Arrived { distance_m } => {
                    self.motors.neutral();
                    tracing::info!(distance_m, "target reached within range");
                    return LegOutcome::Reached;
                }
                SteerStep::Stale { age_ms } => {
                    self.motors.neutral();
                    if !holding {
                        tracing::warn!(age_ms, "fix stale, holding");
                    }
                    holding = true;
                }
                SteerStep::NoHeading { distance_m } => {
                    self.motors.neutral();
                    if !holding {
                        tracing::warn!(distance_m, "no heading source, holding");
                    }
                    holding = true;
                }
                SteerStep::Drive {
                    distance_m,
                    course_error_deg,
                    heading,
                    left,
                    right,
                    ..
                } => {
                    holding = false;
                    self.motors.set_left(left);
                    self.motors.set_right(right);
                    tracing::debug!(distance_m, course_error_deg, ?heading, left, right, "steering");
                }
            }

            Timer::after(tick).await;
        }
    }

    /// Drive every leg of `route` in order.
    pub async fn go_route(
        &self,
        route: &Route,
        token: &CancelToken<'_>,
    ) -> RouteOutcome {
        if let Err(error) = route.validate() {
            tracing::warn!(%error, "route rejected");
            return RouteOutcome::Rejected(error);
        }

        let legs = route.len();
        for (leg, waypoint) in route.waypoints.iter().enumerate() {
            tracing::info!(leg, legs, lat = waypoint.latitude, lon = waypoint.longitude, "leg started");
            match self
                .go_to(*waypoint, route.speed, route.arrival_range_m, token)
                .await
            {
                LegOutcome::Reached => {}
                LegOutcome::FixLost => {
                    tracing::warn!(leg, legs, "route aborted");
                    return RouteOutcome::Aborted { leg };
                }
                LegOutcome::Cancelled => return RouteOutcome::Cancelled,
            }
        }

        tracing::info!(legs, "route completed");
        RouteOutcome::Completed
    }
}
