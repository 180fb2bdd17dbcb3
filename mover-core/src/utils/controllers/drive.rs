//! Drive signal backends for [`MotorOutput`](super::motor::MotorOutput).
//!
//! - [`Pca9685Drive`]: two channels of a PCA9685 PWM expander on a shared I2C bus.
//! - [`EscPair`]: two `embedded-hal` PWM channels, one per ESC.

use core::cell::RefCell;

use embedded_hal::{i2c::I2c, pwm::SetDutyCycle};
use embedded_hal_bus::i2c::RefCellDevice;
use pwm_pca9685::{Address as PwmAddress, Channel, Error as PwmError, Pca9685};

use super::motor::{DriveSignal, Wheel};
use crate::utils::config::MotorConfig;

/// Internal oscillator of the PCA9685 (Hz).
const PCA9685_OSC_HZ: f32 = 25_000_000.0;
/// Steps per PWM frame on the PCA9685.
const PCA9685_STEPS: u32 = 4096;

/// Prescale register value for the requested frame rate.
pub fn pca9685_prescale(frame_hz: u16) -> u8 {
    let hz = f32::from(frame_hz.max(1));
    let raw = libm::roundf(PCA9685_OSC_HZ / (PCA9685_STEPS as f32 * hz)) - 1.0;
    raw.clamp(3.0, 255.0) as u8
}

/// Convert a pulse width into PCA9685 off-counts for the given frame.
pub fn pulse_to_counts(
    pulse_us: u16,
    frame_us: u32,
) -> u16 {
    let counts = u32::from(pulse_us) * PCA9685_STEPS / frame_us.max(1);
    counts.min(PCA9685_STEPS - 1) as u16
}

/// ESC pulses generated by a PCA9685 sharing the I2C bus with other devices.
pub struct Pca9685Drive<'a, I2C: 'static> {
    pwm: Pca9685<RefCellDevice<'a, I2C>>,
    channels: (Channel, Channel),
    frame_hz: u16,
}

impl<'a, I2C, E> Pca9685Drive<'a, I2C>
where
    I2C: I2c<Error = E> + 'static,
    E: core::fmt::Debug,
{
    /// Attach to the expander at `address`, driving `left` and `right` channels.
    pub fn new(
        i2c_bus: &'a RefCell<I2C>,
        address: u8,
        left: Channel,
        right: Channel,
        config: &MotorConfig,
    ) -> Result<Self, PwmError<E>> {
        let pwm = Pca9685::new(RefCellDevice::new(i2c_bus), PwmAddress::from(address))?;
        Ok(Self {
            pwm,
            channels: (left, right),
            frame_hz: config.frame_hz,
        })
    }

    /// Enable the oscillator and set the prescaler for the ESC frame rate.
    pub fn configure(&mut self) -> Result<(), PwmError<E>> {
        self.pwm.enable()?;
        let prescale = pca9685_prescale(self.frame_hz);
        self.pwm.set_prescale(prescale)?;
        tracing::info!(frame_hz = self.frame_hz, prescale, "PWM expander configured");
        Ok(())
    }

    /// Stop the oscillator; the ESCs see no pulses and fall back to failsafe.
    pub fn disable(&mut self) -> Result<(), PwmError<E>> {
        self.pwm.disable()
    }

    fn channel(
        &self,
        wheel: Wheel,
    ) -> Channel {
        match wheel {
            Wheel::Left => self.channels.0,
            Wheel::Right => self.channels.1,
        }
    }
}

impl<I2C, E> DriveSignal for Pca9685Drive<'_, I2C>
where
    I2C: I2c<Error = E> + 'static,
    E: core::fmt::Debug,
{
    type Error = PwmError<E>;

    fn write_pulse(
        &mut self,
        wheel: Wheel,
        pulse_us: u16,
    ) -> Result<(), Self::Error> {
        let frame_us = 1_000_000 / u32::from(self.frame_hz.max(1));
        let counts = pulse_to_counts(pulse_us, frame_us);
        let channel = self.channel(wheel);
        self.pwm.set_channel_on_off(channel, 0, counts)
    }
}

/// Two ESCs on independent PWM outputs running at the ESC frame rate.
pub struct EscPair<L, R> {
    left: L,
    right: R,
    frame_us: u16,
}

impl<L, R> EscPair<L, R>
where
    L: SetDutyCycle,
    R: SetDutyCycle<Error = L::Error>,
{
    /// `config.frame_hz` must match the frequency the PWM peripherals were set up with.
    pub fn new(
        left: L,
        right: R,
        config: &MotorConfig,
    ) -> Self {
        let frame_us = config.frame_us().min(u32::from(u16::MAX)) as u16;
        Self {
            left,
            right,
            frame_us,
        }
    }

    /// Borrow the left and right outputs.
    pub fn outputs(&self) -> (&L, &R) {
        (&self.left, &self.right)
    }

    pub fn release(self) -> (L, R) {
        (self.left, self.right)
    }
}

impl<L, R> DriveSignal for EscPair<L, R>
where
    L: SetDutyCycle,
    R: SetDutyCycle<Error = L::Error>,
{
    type Error = L::Error;

    fn write_pulse(
        &mut self,
        wheel: Wheel,
        pulse_us: u16,
    ) -> Result<(), Self::Error> {
        let pulse_us = pulse_us.min(self.frame_us);
        match wheel {
            Wheel::Left => self.left.set_duty_cycle_fraction(pulse_us, self.frame_us),
            Wheel::Right => self.right.set_duty_cycle_fraction(pulse_us, self.frame_us),
        }
    }
}
