//! Spin-in-place compass calibration.
//!
//! The vehicle turns on the spot (left wheel forward, right wheel reverse)
//! while the magnetometer is sampled; the per-axis extents seen during the
//! spin become the calibration envelope. The envelope is installed into the
//! heading source as it grows, so a cancelled run still leaves the best
//! envelope learned so far.

use embassy_time::{Duration, Instant, Timer};

use super::CancelToken;
use crate::utils::{
    config::CalibrationConfig,
    controllers::{
        compass::{CalibrationEnvelope, HeadingSource, Magnetometer},
        motor::{DriveSignal, MotorOutput},
    },
};

/// How a calibration run ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationOutcome {
    /// Spin time elapsed; the learned envelope is installed.
    Completed(CalibrationEnvelope),
    /// Stopped early; the envelope learned so far is installed.
    Cancelled(CalibrationEnvelope),
    /// The magnetometer never returned a first sample.
    SensorUnavailable,
}

pub struct CompassCalibrator<'a, D, M> {
    motors: &'a MotorOutput<D>,
    heading: &'a HeadingSource<M>,
    config: CalibrationConfig,
}

impl<'a, D, M> CompassCalibrator<'a, D, M>
where
    D: DriveSignal,
    M: Magnetometer,
{
    pub fn new(
        motors: &'a MotorOutput<D>,
        heading: &'a HeadingSource<M>,
        config: CalibrationConfig,
    ) -> Self {
        Self {
            motors,
            heading,
            config,
        }
    }

    /// Spin and sample until the configured duration elapses or `token` fires.
    pub async fn run(
        &self,
        token: &CancelToken<'_>,
    ) -> CalibrationOutcome {
        if token.is_cancelled() {
            // never started: keep whatever envelope is installed
            return CalibrationOutcome::Cancelled(self.heading.envelope());
        }

        let first = match self.heading.sample() {
            Ok(sample) => sample,
            Err(error) => {
                tracing::error!(?error, "compass calibration aborted: no magnetometer sample");
                self.motors.neutral();
                return CalibrationOutcome::SensorUnavailable;
            }
        };

        let mut envelope = CalibrationEnvelope::seeded(first, self.config.seed_epsilon);
        self.heading.set_envelope(envelope);

        let speed = self.config.speed;
        let period = Duration::from_millis(self.config.sample_period_ms);
        let deadline = Instant::now() + Duration::from_millis(self.config.duration_ms);
        tracing::info!(speed, duration_ms = self.config.duration_ms, "compass calibration started");

        self.motors.set_left(speed);
        self.motors.set_right(-speed);

        let mut samples: u32 = 1;
        let cancelled = loop {
            if token.is_cancelled() {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }

            Timer::after(period).await;

            match self.heading.sample() {
                Ok(sample) => {
                    samples += 1;
                    if envelope.expand(sample) {
                        self.heading.set_envelope(envelope);
                    }
                }
                Err(error) => tracing::warn!(?error, "magnetometer sample skipped"),
            }
        };

        self.motors.neutral();

        if cancelled {
            tracing::info!(samples, ?envelope, "compass calibration cancelled");
            CalibrationOutcome::Cancelled(envelope)
        } else {
            tracing::info!(samples, ?envelope, "compass calibration finished");
            CalibrationOutcome::Completed(envelope)
        }
    }
}
