//! Command surface for an outer dispatcher.
//!
//! Commands arrive as JSON (tag `"mc"`) from whatever transport the firmware
//! exposes and are queued on [`MOTION_CHANNEL`]. [`MotionArbiter::execute`]
//! applies one command and returns a serializable reply.

use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use serde::{Deserialize, Serialize};

use super::{
    arbiter::{MotionArbiter, MotionStatus, Started},
    MotionError, MotionRequest, Route, RoutePlan, Waypoint,
};
use crate::utils::controllers::{
    compass::{CalibrationEnvelope, MagSample, Magnetometer},
    motor::DriveSignal,
};

/// Channel used to receive motion commands.
pub static MOTION_CHANNEL: Channel<CriticalSectionRawMutex, MotionCommand, 4> = Channel::new();

/// Motion command variants.
///
/// Serialized as JSON with tag `"mc"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mc", rename_all = "snake_case")]
pub enum MotionCommand {
    /// Drive to one position.
    GoTo {
        lat: f64,
        lon: f64,
        speed: i16,
        range: f32,
    },
    /// Drive a route given inline.
    Route { route: RoutePlan },
    /// Keep a route for later.
    StoreRoute { route: RoutePlan },
    /// Drive the stored route.
    StartStoredRoute,
    /// Read back the stored route.
    StoredRoute,
    Calibrate,
    Cancel,
    SetBias { left: f32, right: f32 },
    /// Direct wheel setpoints, only while idle.
    Manual { left: i16, right: i16 },
    SetEnvelope { envelope: CalibrationEnvelope },
    MagSample,
    Status,
}

/// Reply to a [`MotionCommand`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum CommandReply {
    Started(Started),
    Rejected { error: MotionError },
    Ack,
    Status(MotionStatus),
    Route { route: Option<Route> },
    Sample { sample: Option<MagSample> },
}

impl From<Result<Started, MotionError>> for CommandReply {
    fn from(result: Result<Started, MotionError>) -> Self {
        match result {
            Ok(started) => CommandReply::Started(started),
            Err(error) => CommandReply::Rejected { error },
        }
    }
}

impl From<Result<(), MotionError>> for CommandReply {
    fn from(result: Result<(), MotionError>) -> Self {
        match result {
            Ok(()) => CommandReply::Ack,
            Err(error) => CommandReply::Rejected { error },
        }
    }
}

impl<D, M> MotionArbiter<'_, D, M>
where
    D: DriveSignal,
    M: Magnetometer,
{
    /// Apply one command.
    pub fn execute(
        &self,
        command: MotionCommand,
    ) -> CommandReply {
        match command {
            MotionCommand::GoTo {
                lat,
                lon,
                speed,
                range,
            } => self
                .try_start(MotionRequest::GoTo {
                    target: Waypoint::new(lat, lon),
                    speed,
                    arrival_range_m: range,
                })
                .into(),
            MotionCommand::Route { route } => match route.into_route() {
                Ok(route) => self.try_start(MotionRequest::Route { route }).into(),
                Err(e) => CommandReply::Rejected {
                    error: MotionError::InvalidRoute(e),
                },
            },
            MotionCommand::StoreRoute { route } => route
                .into_route()
                .map_err(MotionError::InvalidRoute)
                .and_then(|route| self.store_route(route))
                .into(),
            MotionCommand::StartStoredRoute => self.try_start(MotionRequest::StoredRoute).into(),
            MotionCommand::StoredRoute => CommandReply::Route {
                route: self.stored_route(),
            },
            MotionCommand::Calibrate => self.try_start(MotionRequest::Calibrate).into(),
            MotionCommand::Cancel => {
                self.cancel();
                CommandReply::Ack
            }
            MotionCommand::SetBias { left, right } => {
                self.set_bias(left, right);
                CommandReply::Ack
            }
            MotionCommand::Manual { left, right } => self.drive_manual(left, right).into(),
            MotionCommand::SetEnvelope { envelope } => {
                self.set_envelope(envelope);
                CommandReply::Ack
            }
            MotionCommand::MagSample => CommandReply::Sample {
                sample: self.mag_sample(),
            },
            MotionCommand::Status => CommandReply::Status(self.status()),
        }
    }

    /// Drain [`MOTION_CHANNEL`] forever, logging each reply.
    pub async fn command_loop(&self) -> ! {
        loop {
            let command = MOTION_CHANNEL.receiver().receive().await;
            tracing::info!(?command, "received motion command");
            match self.execute(command) {
                CommandReply::Rejected { error } => tracing::warn!(%error, "motion command rejected"),
                reply => tracing::debug!(?reply, "motion command applied"),
            }
        }
    }
}
