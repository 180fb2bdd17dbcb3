//! Utility re-exports and helper macros for the vehicle core.
//!
//! - `config`: tunables for the motors, navigation loop and calibration
//! - `controllers`: motor output, drive backends, compass and GPS
//! - `math`: great-circle geometry and differential steering
//! - `motion`: motion tasks, the single-flight arbiter and its command surface
//!
//! The `mk_static!` macro simplifies static initialization in no-std contexts.

pub mod config;
pub mod controllers;
pub mod math;
pub mod motion;

pub use config::MoverConfig;
pub use embassy_time::*;
pub use motion::{arbiter::MotionArbiter, command::MOTION_CHANNEL};
pub use static_cell::StaticCell;

#[macro_export]
/// Initialize a no-std static cell and write the given value into it.
///
/// This macro creates a `StaticCell` for type `$t` and initializes it with
/// `$val`, returning a mutable reference to the stored value.
macro_rules! mk_static {
    ($t:ty, $val:expr) => {{
        static STATIC_CELL: $crate::utils::StaticCell<$t> = $crate::utils::StaticCell::new();
        STATIC_CELL.uninit().write($val)
    }};
}
