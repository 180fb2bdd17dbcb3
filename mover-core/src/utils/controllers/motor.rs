//! Differential motor output.
//!
//! `MotorOutput` turns a signed wheel setpoint into an RC-style pulse width,
//! adding the deadband that overcomes static friction and the per-wheel bias,
//! and writes it straight to a [`DriveSignal`] backend. The last setpoint and
//! pulse of each wheel are kept for telemetry.
//!
//! All state sits behind critical-section mutexes so the arbiter, the active
//! motion task and a bias update from the dispatcher can share one instance.

use core::cell::{Cell, RefCell};

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use serde::{Deserialize, Serialize};

use crate::utils::config::MotorConfig;

/// Largest setpoint magnitude accepted by [`MotorOutput`].
pub const MAX_SETPOINT: i16 = 100;

/// One side of the tank drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Wheel {
    Left,
    Right,
}

/// Physical drive signal for both wheels.
///
/// Implementors receive a pulse width in microseconds and are expected to
/// apply it immediately.
pub trait DriveSignal {
    type Error: core::fmt::Debug;

    fn write_pulse(
        &mut self,
        wheel: Wheel,
        pulse_us: u16,
    ) -> Result<(), Self::Error>;
}

/// Multiplicative per-wheel correction applied to every write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bias {
    pub left: f32,
    pub right: f32,
}

impl Default for Bias {
    fn default() -> Self {
        Self {
            left: 1.0,
            right: 1.0,
        }
    }
}

impl Bias {
    pub fn for_wheel(
        &self,
        wheel: Wheel,
    ) -> f32 {
        match wheel {
            Wheel::Left => self.left,
            Wheel::Right => self.right,
        }
    }
}

/// Clamp a requested speed into `-MAX_SETPOINT..=MAX_SETPOINT`.
pub fn clamp_setpoint(speed: i16) -> i16 {
    speed.clamp(-MAX_SETPOINT, MAX_SETPOINT)
}

/// Map a clamped setpoint to a pulse width.
///
/// Zero maps to the center pulse; anything else moves away from center by
/// `|speed| * bias + deadband` in the direction of `speed`. The result is
/// saturated to the configured pulse limits.
pub fn pulse_for(
    speed: i16,
    bias: f32,
    config: &MotorConfig,
) -> u16 {
    let center = f32::from(config.center_us);
    let pulse = match speed.signum() {
        0 => center,
        sign => {
            let offset = f32::from(speed.unsigned_abs()) * bias + f32::from(config.deadband_us);
            center + f32::from(sign) * offset
        }
    };
    libm::roundf(pulse).clamp(f32::from(config.min_us), f32::from(config.max_us)) as u16
}

#[derive(Debug, Clone, Copy)]
struct WheelState {
    left: i16,
    right: i16,
    left_pulse: u16,
    right_pulse: u16,
}

/// Two-wheel motor output over a [`DriveSignal`].
pub struct MotorOutput<D> {
    drive: Mutex<CriticalSectionRawMutex, RefCell<D>>,
    config: MotorConfig,
    bias: Mutex<CriticalSectionRawMutex, Cell<Bias>>,
    state: Mutex<CriticalSectionRawMutex, Cell<WheelState>>,
}

impl<D> MotorOutput<D>
where
    D: DriveSignal,
{
    /// Wrap a drive backend. Nothing is written until the first command.
    pub fn new(
        drive: D,
        config: MotorConfig,
    ) -> Self {
        Self {
            drive: Mutex::new(RefCell::new(drive)),
            config,
            bias: Mutex::new(Cell::new(Bias::default())),
            state: Mutex::new(Cell::new(WheelState {
                left: 0,
                right: 0,
                left_pulse: config.center_us,
                right_pulse: config.center_us,
            })),
        }
    }

    pub fn set_left(
        &self,
        speed: i16,
    ) {
        self.set(Wheel::Left, speed);
    }

    pub fn set_right(
        &self,
        speed: i16,
    ) {
        self.set(Wheel::Right, speed);
    }

    /// Command both wheels to rest.
    pub fn neutral(&self) {
        self.set(Wheel::Left, 0);
        self.set(Wheel::Right, 0);
    }

    /// Clamp, bias and write one wheel setpoint.
    ///
    /// A failing backend write is logged; the setpoint is still recorded so
    /// telemetry reflects what was commanded.
    pub fn set(
        &self,
        wheel: Wheel,
        speed: i16,
    ) {
        let speed = clamp_setpoint(speed);
        let bias = self.bias.lock(|b| b.get()).for_wheel(wheel);
        let pulse = pulse_for(speed, bias, &self.config);

        self.drive.lock(|drive| {
            if let Err(error) = drive.borrow_mut().write_pulse(wheel, pulse) {
                tracing::error!(?wheel, ?error, "drive signal write failed");
            }
        });

        self.state.lock(|cell| {
            let mut state = cell.get();
            match wheel {
                Wheel::Left => {
                    state.left = speed;
                    state.left_pulse = pulse;
                }
                Wheel::Right => {
                    state.right = speed;
                    state.right_pulse = pulse;
                }
            }
            cell.set(state);
        });
    }

    /// Replace both bias factors at once.
    ///
    /// Non-finite factors fall back to 1.0 and negative ones to 0.0 so a bad
    /// value can never reverse a wheel.
    pub fn set_bias(
        &self,
        left: f32,
        right: f32,
    ) {
        let bias = Bias {
            left: sanitize_bias(left),
            right: sanitize_bias(right),
        };
        if bias.left != left || bias.right != right {
            tracing::warn!(left, right, ?bias, "bias out of range, sanitized");
        }
        self.bias.lock(|b| b.set(bias));
        tracing::info!(left = bias.left, right = bias.right, "motor bias updated");
    }

    pub fn bias(&self) -> Bias {
        self.bias.lock(|b| b.get())
    }

    /// Last commanded left setpoint.
    pub fn left(&self) -> i16 {
        self.state.lock(|s| s.get().left)
    }

    /// Last commanded right setpoint.
    pub fn right(&self) -> i16 {
        self.state.lock(|s| s.get().right)
    }

    /// Last pulse width (µs) written to the given wheel.
    pub fn pulse(
        &self,
        wheel: Wheel,
    ) -> u16 {
        self.state.lock(|s| {
            let state = s.get();
            match wheel {
                Wheel::Left => state.left_pulse,
                Wheel::Right => state.right_pulse,
            }
        })
    }

    pub fn is_neutral(&self) -> bool {
        self.state.lock(|s| {
            let state = s.get();
            state.left == 0 && state.right == 0
        })
    }

    pub fn config(&self) -> &MotorConfig {
        &self.config
    }

    /// Run `f` with exclusive access to the drive backend.
    pub fn with_drive<R>(
        &self,
        f: impl FnOnce(&mut D) -> R,
    ) -> R {
        self.drive.lock(|drive| f(&mut drive.borrow_mut()))
    }
}

fn sanitize_bias(value: f32) -> f32 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_is_center() {
        let cfg = MotorConfig::default();
        assert_eq!(pulse_for(0, 1.0, &cfg), 1460);
    }

    #[test]
    fn smallest_command_clears_deadband() {
        let cfg = MotorConfig::default();
        assert_eq!(pulse_for(1, 1.0, &cfg), 1511);
        assert_eq!(pulse_for(-1, 1.0, &cfg), 1409);
    }

    #[test]
    fn pulse_saturates_at_limits() {
        let cfg = MotorConfig::default();
        assert_eq!(pulse_for(100, 10.0, &cfg), cfg.max_us);
        assert_eq!(pulse_for(-100, 10.0, &cfg), cfg.min_us);
    }

    #[test]
    fn setpoint_is_clamped_not_rejected() {
        assert_eq!(clamp_setpoint(250), 100);
        assert_eq!(clamp_setpoint(-250), -100);
        assert_eq!(clamp_setpoint(42), 42);
    }

    #[test]
    fn bad_bias_is_sanitized() {
        assert_eq!(sanitize_bias(f32::NAN), 1.0);
        assert_eq!(sanitize_bias(-0.5), 0.0);
        assert_eq!(sanitize_bias(1.25), 1.25);
    }
}
