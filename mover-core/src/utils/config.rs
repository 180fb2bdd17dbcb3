//! Tunables for the motor output, navigation loop and compass calibration.
//!
//! Every block implements `Default` with the values the vehicle firmware ships
//! with, and is (de)serializable so an outer layer can load overrides from
//! persisted storage or a config file.

use serde::{Deserialize, Serialize};

/// Pulse-width mapping for the two ESC channels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    /// Pulse width (µs) that holds a wheel at rest.
    pub center_us: u16,
    /// Minimum offset (µs) added to any non-zero command to overcome static friction.
    pub deadband_us: u16,
    /// Lowest pulse width (µs) ever written.
    pub min_us: u16,
    /// Highest pulse width (µs) ever written.
    pub max_us: u16,
    /// PWM frame rate (Hz).
    pub frame_hz: u16,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            center_us: 1460,
            deadband_us: 50,
            min_us: 1060,
            max_us: 1860,
            frame_hz: 50,
        }
    }
}

impl MotorConfig {
    /// Length of one PWM frame in microseconds.
    pub fn frame_us(&self) -> u32 {
        1_000_000 / u32::from(self.frame_hz.max(1))
    }
}

/// Steering loop timing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavConfig {
    /// Control period between two steering updates (ms).
    pub control_period_ms: u64,
    /// A fix older than this (ms) is held as stale.
    pub stale_after_ms: u64,
}

impl Default for NavConfig {
    fn default() -> Self {
        Self {
            control_period_ms: 500,
            stale_after_ms: 2000,
        }
    }
}

/// Spin-in-place compass calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Total spin time (ms).
    pub duration_ms: u64,
    /// Wheel setpoint magnitude used for the spin.
    pub speed: i16,
    /// Delay between two magnetometer samples (ms).
    pub sample_period_ms: u64,
    /// Span given to the envelope seeded from the first sample.
    pub seed_epsilon: f32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            duration_ms: 20_000,
            speed: 20,
            sample_period_ms: 20,
            seed_epsilon: 0.1,
        }
    }
}

/// Complete configuration of the motion core.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MoverConfig {
    pub motor: MotorConfig,
    pub navigation: NavConfig,
    pub calibration: CalibrationConfig,
}
