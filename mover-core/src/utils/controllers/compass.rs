//! Magnetic compass heading.
//!
//! The raw field comes from any 2-axis [`Magnetometer`]; hard-iron offset is
//! removed using a [`CalibrationEnvelope`] learned by the compass calibrator or
//! restored from persisted state.

use core::{
    cell::{Cell, RefCell},
    f32::consts::{PI, TAU},
};

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use serde::{Deserialize, Serialize};

/// Instantaneous horizontal magnetic field.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MagSample {
    pub x: f32,
    pub y: f32,
}

/// Source of raw magnetic-field samples.
pub trait Magnetometer {
    type Error: core::fmt::Debug;

    fn read_field(&mut self) -> Result<MagSample, Self::Error>;
}

/// Per-axis min/max extents of the field seen during a full rotation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationEnvelope {
    pub x_min: f32,
    pub x_max: f32,
    pub y_min: f32,
    pub y_max: f32,
}

impl CalibrationEnvelope {
    /// Envelope around a single sample, widened by `epsilon` on the max side
    /// so it never starts with zero span.
    pub fn seeded(
        first: MagSample,
        epsilon: f32,
    ) -> Self {
        Self {
            x_min: first.x,
            x_max: first.x + epsilon,
            y_min: first.y,
            y_max: first.y + epsilon,
        }
    }

    /// Grow the envelope to include `sample`. Returns `true` if it changed.
    pub fn expand(
        &mut self,
        sample: MagSample,
    ) -> bool {
        let before = *self;
        self.x_min = self.x_min.min(sample.x);
        self.x_max = self.x_max.max(sample.x);
        self.y_min = self.y_min.min(sample.y);
        self.y_max = self.y_max.max(sample.y);
        *self != before
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x_min + (self.x_max - self.x_min) / 2.0,
            self.y_min + (self.y_max - self.y_min) / 2.0,
        )
    }

    /// An envelope with zero span on both axes was never calibrated.
    pub fn is_calibrated(&self) -> bool {
        self.x_max - self.x_min > 0.0 || self.y_max - self.y_min > 0.0
    }

    /// Heading in degrees `[0, 360)` for a raw sample.
    ///
    /// The negated x/y order matches the sensor mounting on the chassis.
    pub fn heading_deg(
        &self,
        sample: MagSample,
    ) -> f32 {
        let (cx, cy) = self.center();
        let mut heading = libm::atan2f(-(sample.x - cx), -(sample.y - cy));
        if heading < 0.0 {
            heading += TAU;
        }
        if heading >= TAU {
            heading -= TAU;
        }
        let degrees = heading * 180.0 / PI;
        if degrees >= 360.0 {
            0.0
        } else {
            // adding 0.0 turns -0.0 into 0.0
            degrees + 0.0
        }
    }
}

/// Compass heading backed by a magnetometer and its calibration envelope.
pub struct HeadingSource<M> {
    sensor: Mutex<CriticalSectionRawMutex, RefCell<M>>,
    envelope: Mutex<CriticalSectionRawMutex, Cell<CalibrationEnvelope>>,
}

impl<M> HeadingSource<M>
where
    M: Magnetometer,
{
    /// Start uncalibrated; install a stored envelope with [`Self::set_envelope`].
    pub fn new(sensor: M) -> Self {
        Self {
            sensor: Mutex::new(RefCell::new(sensor)),
            envelope: Mutex::new(Cell::new(CalibrationEnvelope::default())),
        }
    }

    /// Read one raw sample from the sensor.
    pub fn sample(&self) -> Result<MagSample, M::Error> {
        self.sensor.lock(|s| s.borrow_mut().read_field())
    }

    /// Heading from the current envelope, calibrated or not.
    pub fn heading(&self) -> Result<f32, M::Error> {
        let sample = self.sample()?;
        Ok(self.envelope().heading_deg(sample))
    }

    /// Heading only if the envelope is calibrated and the sensor answered.
    pub fn calibrated_heading(&self) -> Option<f32> {
        if !self.is_calibrated() {
            return None;
        }
        match self.heading() {
            Ok(heading) => Some(heading),
            Err(error) => {
                tracing::warn!(?error, "magnetometer read failed");
                None
            }
        }
    }

    pub fn envelope(&self) -> CalibrationEnvelope {
        self.envelope.lock(|e| e.get())
    }

    pub fn set_envelope(
        &self,
        envelope: CalibrationEnvelope,
    ) {
        self.envelope.lock(|e| e.set(envelope));
    }

    pub fn is_calibrated(&self) -> bool {
        self.envelope().is_calibrated()
    }
}
