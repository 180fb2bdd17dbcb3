//! Tank-steering correction from course error.
//!
//! The wheel on the side of the turn is slowed by half of `|error| / 180 * speed`;
//! the other wheel keeps `speed`. A full 180° error therefore halves the inner
//! wheel and the vehicle keeps rolling while it turns.

use super::geo::wrap_180;
use crate::utils::controllers::motor::clamp_setpoint;

/// Signed error between the desired bearing and the current heading,
/// in `(-180, 180]`. Positive means the target lies to the right.
pub fn course_error(
    bearing_deg: f32,
    heading_deg: f32,
) -> f32 {
    wrap_180(bearing_deg - heading_deg)
}

/// Left/right setpoints that steer toward a positive (right) or negative
/// (left) course error at cruise `speed`.
pub fn differential(
    course_error_deg: f32,
    speed: i16,
) -> (i16, i16) {
    let reduction = (libm::fabsf(course_error_deg) / 180.0 * f32::from(speed) / 2.0) as i16;
    let reduced = speed.saturating_sub(reduction);

    let (left, right) = if course_error_deg > 0.0 {
        (speed, reduced)
    } else if course_error_deg < 0.0 {
        (reduced, speed)
    } else {
        (speed, speed)
    };
    (clamp_setpoint(left), clamp_setpoint(right))
}
