//! Hardware-facing controllers.
//!
//! - `motor`: setpoint to pulse conversion with deadband and per-wheel bias
//! - `drive`: PCA9685 and direct-PWM backends for the motor output
//! - `compass`: magnetometer heading with hard-iron calibration envelope
//! - `gps`: latest fix assembled from an NMEA-0183 stream

pub mod compass;
pub mod drive;
pub mod gps;
pub mod motor;

pub use compass::{CalibrationEnvelope, HeadingSource, MagSample, Magnetometer};
pub use drive::{EscPair, Pca9685Drive};
pub use gps::{Fix, FixSample, PositionSource};
pub use motor::{Bias, DriveSignal, MotorOutput, Wheel};
