//! Waypoints and routes.

use core::fmt;

use heapless::Vec;
use serde::{
    de::{SeqAccess, Visitor},
    Deserialize, Deserializer, Serialize, Serializer,
};

/// Fewest waypoints a route may hold.
pub const MIN_WAYPOINTS: usize = 2;
/// Most waypoints a route may hold.
pub const MAX_WAYPOINTS: usize = 49;

/// Target position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Waypoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl Waypoint {
    pub fn new(
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Reasons a motion plan is rejected before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanError {
    TooFewWaypoints,
    TooManyWaypoints,
    NonPositiveSpeed,
    NonPositiveRange,
}

impl core::fmt::Display for PlanError {
    fn fmt(
        &self,
        f: &mut core::fmt::Formatter<'_>,
    ) -> core::fmt::Result {
        match self {
            PlanError::TooFewWaypoints => write!(f, "route needs at least {} waypoints", MIN_WAYPOINTS),
            PlanError::TooManyWaypoints => write!(f, "route holds at most {} waypoints", MAX_WAYPOINTS),
            PlanError::NonPositiveSpeed => write!(f, "speed must be positive"),
            PlanError::NonPositiveRange => write!(f, "arrival range must be positive"),
        }
    }
}

/// Check the shared speed / arrival range of a leg.
pub fn validate_leg(
    speed: i16,
    arrival_range_m: f32,
) -> Result<(), PlanError> {
    if speed <= 0 {
        return Err(PlanError::NonPositiveSpeed);
    }
    if arrival_range_m.is_nan() || arrival_range_m <= 0.0 {
        return Err(PlanError::NonPositiveRange);
    }
    Ok(())
}

/// Ordered waypoints driven at one cruise speed with one arrival range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub waypoints: Vec<Waypoint, MAX_WAYPOINTS>,
    pub speed: i16,
    pub arrival_range_m: f32,
}

impl Route {
    /// Build and validate a route from a slice of waypoints.
    pub fn new(
        waypoints: &[Waypoint],
        speed: i16,
        arrival_range_m: f32,
    ) -> Result<Self, PlanError> {
        if waypoints.len() > MAX_WAYPOINTS {
            return Err(PlanError::TooManyWaypoints);
        }
        let waypoints = Vec::from_slice(waypoints).map_err(|_| PlanError::TooManyWaypoints)?;
        let route = Self {
            waypoints,
            speed,
            arrival_range_m,
        };
        route.validate()?;
        Ok(route)
    }

    /// Check length, speed and range.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.waypoints.len() < MIN_WAYPOINTS {
            return Err(PlanError::TooFewWaypoints);
        }
        validate_leg(self.speed, self.arrival_range_m)
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }
}

/// Waypoint list as received from a dispatcher.
///
/// Keeps the first [`MAX_WAYPOINTS`] entries and counts the rest, so an
/// oversized list still parses and can be rejected as a plan.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WaypointList {
    pub points: Vec<Waypoint, MAX_WAYPOINTS>,
    pub overflow: usize,
}

impl Serialize for WaypointList {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.points.iter())
    }
}

impl<'de> Deserialize<'de> for WaypointList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ListVisitor;

        impl<'de> Visitor<'de> for ListVisitor {
            type Value = WaypointList;

            fn expecting(
                &self,
                f: &mut fmt::Formatter<'_>,
            ) -> fmt::Result {
                f.write_str("a sequence of waypoints")
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Self::Value, A::Error> {
                let mut list = WaypointList::default();
                while let Some(point) = seq.next_element::<Waypoint>()? {
                    if list.points.push(point).is_err() {
                        list.overflow += 1;
                    }
                }
                Ok(list)
            }
        }

        deserializer.deserialize_seq(ListVisitor)
    }
}

/// Unvalidated route from a command; see [`RoutePlan::into_route`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePlan {
    pub waypoints: WaypointList,
    pub speed: i16,
    pub arrival_range_m: f32,
}

impl RoutePlan {
    pub fn into_route(self) -> Result<Route, PlanError> {
        if self.waypoints.overflow > 0 {
            return Err(PlanError::TooManyWaypoints);
        }
        let route = Route {
            waypoints: self.waypoints.points,
            speed: self.speed,
            arrival_range_m: self.arrival_range_m,
        };
        route.validate()?;
        Ok(route)
    }
}

impl From<Route> for RoutePlan {
    fn from(route: Route) -> Self {
        Self {
            waypoints: WaypointList {
                points: route.waypoints,
                overflow: 0,
            },
            speed: route.speed,
            arrival_range_m: route.arrival_range_m,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(n: usize) -> [Waypoint; 60] {
        let mut out = [Waypoint::default(); 60];
        for (i, p) in out.iter_mut().enumerate().take(n) {
            *p = Waypoint::new(48.0 + i as f64 * 1e-4, 11.0);
        }
        out
    }

    #[test]
    fn accepts_bounds() {
        let pts = points(60);
        assert!(Route::new(&pts[..2], 30, 2.0).is_ok());
        assert!(Route::new(&pts[..49], 30, 2.0).is_ok());
    }

    #[test]
    fn rejects_length_outside_bounds() {
        let pts = points(60);
        assert_eq!(Route::new(&pts[..1], 30, 2.0), Err(PlanError::TooFewWaypoints));
        assert_eq!(Route::new(&pts[..0], 30, 2.0), Err(PlanError::TooFewWaypoints));
        assert_eq!(Route::new(&pts[..50], 30, 2.0), Err(PlanError::TooManyWaypoints));
        assert_eq!(Route::new(&pts, 30, 2.0), Err(PlanError::TooManyWaypoints));
    }

    #[test]
    fn rejects_bad_speed_and_range() {
        let pts = points(3);
        assert_eq!(Route::new(&pts[..3], 0, 2.0), Err(PlanError::NonPositiveSpeed));
        assert_eq!(Route::new(&pts[..3], 30, 0.0), Err(PlanError::NonPositiveRange));
        assert_eq!(Route::new(&pts[..3], 30, f32::NAN), Err(PlanError::NonPositiveRange));
    }

    #[test]
    fn oversized_plan_is_rejected_not_truncated() {
        let mut waypoints = WaypointList::default();
        for p in points(49).iter().take(49) {
            waypoints.points.push(*p).unwrap();
        }
        waypoints.overflow = 11;
        let plan = RoutePlan {
            waypoints,
            speed: 30,
            arrival_range_m: 2.0,
        };
        assert_eq!(plan.clone().into_route(), Err(PlanError::TooManyWaypoints));

        let mut fitting = plan;
        fitting.waypoints.overflow = 0;
        assert_eq!(fitting.into_route().map(|r| r.len()), Ok(49));
    }

    #[test]
    fn plan_from_route_validates_again() {
        let pts = points(3);
        let route = Route::new(&pts[..3], 30, 2.0).unwrap();
        assert_eq!(RoutePlan::from(route.clone()).into_route(), Ok(route));

        let mut short = RoutePlan::from(Route::new(&pts[..2], 30, 2.0).unwrap());
        short.waypoints.points.pop();
        assert_eq!(short.into_route(), Err(PlanError::TooFewWaypoints));
    }
}
