//! Great-circle helpers on a spherical earth.
//!
//! Angles in and out are degrees. Bearings are measured clockwise from north.
//!
//! # Example
//! ```rust
//! use mover_core::utils::math::geo;
//! let d = geo::distance_between(48.0, 11.0, 48.001, 11.0);
//! assert!((d - 111.2).abs() < 0.5);
//! let b = geo::course_to(48.0, 11.0, 48.0, 11.001);
//! assert!((b - 90.0).abs() < 0.01);
//! ```

use core::f64::consts::{PI, TAU};

/// Mean earth radius (m) used for distance computations.
pub const EARTH_RADIUS_M: f64 = 6_372_795.0;

fn radians(deg: f64) -> f64 {
    deg * PI / 180.0
}

fn degrees(rad: f64) -> f64 {
    rad * 180.0 / PI
}

/// Haversine distance in meters between two positions.
pub fn distance_between(
    lat1: f64,
    lon1: f64,
    lat2: f64,
    lon2: f64,
) -> f64 {
    let phi1 = radians(lat1);
    let phi2 = radians(lat2);
    let dphi = radians(lat2 - lat1);
    let dlambda = radians(lon2 - lon1);

    let s_phi = libm::sin(dphi / 2.0);
    let s_lambda = libm::sin(dlambda / 2.0);
    let a = s_phi * s_phi + libm::cos(phi1) * libm::cos(phi2) * s_lambda * s_lambda;
    let a = a.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_M * libm::atan2(libm::sqrt(a), libm::sqrt(1.0 - a))
}

/// Initial bearing (forward azimuth) in degrees `[0, 360)` from the first
/// position to the second.
pub fn course_to(
    lat1: f64,
    lon1: f64,
    lat2: f64,
    lon2: f64,
) -> f64 {
    let phi1 = radians(lat1);
    let phi2 = radians(lat2);
    let dlambda = radians(lon2 - lon1);

    let y = libm::sin(dlambda) * libm::cos(phi2);
    let x = libm::cos(phi1) * libm::sin(phi2) - libm::sin(phi1) * libm::cos(phi2) * libm::cos(dlambda);
    let mut bearing = libm::atan2(y, x);
    if bearing < 0.0 {
        bearing += TAU;
    }
    let deg = degrees(bearing);
    if deg >= 360.0 {
        0.0
    } else {
        deg
    }
}

/// Wrap an angle difference into `(-180, 180]`.
///
/// Inputs are differences of two angles in `[0, 360)`, so one correction of
/// 360° is enough.
pub fn wrap_180(deg: f32) -> f32 {
    if deg > 180.0 {
        deg - 360.0
    } else if deg <= -180.0 {
        deg + 360.0
    } else {
        deg
    }
}
