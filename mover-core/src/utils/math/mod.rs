//! Math utilities for the motion core.
//!
//! - `geo`: great-circle distance, bearing and angle wrapping
//! - `steering`: course error and tank-steering correction

pub mod geo;
pub mod steering;
