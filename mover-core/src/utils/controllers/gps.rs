//! GPS position source.
//!
//! `PositionSource` keeps the latest fix assembled from an NMEA-0183 byte
//! stream (or published directly by another decoder) and hands out immutable
//! [`Fix`] snapshots to the navigation layer.
//!
//! The NMEA feed merges several sentence types:
//! - **GGA**: position and satellite count (refreshes the fix age)
//! - **RMC**: course over ground, and loss of fix when the status is void
//! - **VTG**: course over ground (backup source)

use core::cell::RefCell;

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use embassy_time::Instant;
use nmea0183::{ParseResult, Parser};
use serde::Serialize;

/// Snapshot of the latest GPS state.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    /// Course over ground in degrees, when the receiver reports one.
    pub course_over_ground: Option<f32>,
    pub is_valid: bool,
    /// Time since the last position update (ms); `u64::MAX` if none yet.
    pub age_ms: u64,
    pub satellites: u8,
}

impl Fix {
    /// Valid and no older than `stale_after_ms`.
    pub fn is_fresh(
        &self,
        stale_after_ms: u64,
    ) -> bool {
        self.is_valid && self.age_ms <= stale_after_ms
    }
}

/// Decoded position handed to [`PositionSource::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FixSample {
    pub latitude: f64,
    pub longitude: f64,
    pub course_over_ground: Option<f32>,
    pub satellites: u8,
}

struct GpsState {
    parser: Parser,
    position: Option<(f64, f64)>,
    course_over_ground: Option<f32>,
    satellites: u8,
    valid: bool,
    updated_at: Option<Instant>,
}

impl GpsState {
    fn apply(
        &mut self,
        result: ParseResult,
    ) -> bool {
        match result {
            ParseResult::GGA(Some(gga)) => {
                self.position = Some((gga.latitude.as_f64(), gga.longitude.as_f64()));
                self.satellites = gga.sat_in_use;
                self.valid = true;
                self.updated_at = Some(Instant::now());
                true
            }
            ParseResult::RMC(Some(rmc)) => {
                if let Some(course) = &rmc.course {
                    self.course_over_ground = Some(course.degrees);
                }
                true
            }
            ParseResult::VTG(Some(vtg)) => {
                if let Some(course) = &vtg.course {
                    self.course_over_ground = Some(course.degrees);
                }
                true
            }
            ParseResult::GGA(None) | ParseResult::RMC(None) => {
                if self.valid {
                    tracing::warn!("GPS reports no fix");
                }
                self.valid = false;
                true
            }
            _ => false,
        }
    }
}

/// Latest GPS fix, shared between the feed decoder and motion tasks.
pub struct PositionSource {
    state: Mutex<CriticalSectionRawMutex, RefCell<GpsState>>,
}

impl Default for PositionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(GpsState {
                parser: Parser::new(),
                position: None,
                course_over_ground: None,
                satellites: 0,
                valid: false,
                updated_at: None,
            })),
        }
    }

    /// Push raw NMEA bytes through the parser.
    ///
    /// Returns the number of sentences that changed the fix state.
    pub fn feed(
        &self,
        bytes: &[u8],
    ) -> usize {
        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            let mut applied = 0;
            for &byte in bytes {
                match state.parser.parse_from_byte(byte) {
                    Some(Ok(result)) => {
                        if state.apply(result) {
                            applied += 1;
                        }
                    }
                    Some(Err(error)) => tracing::debug!(error, "NMEA sentence rejected"),
                    None => {}
                }
            }
            applied
        })
    }

    /// Install a position decoded elsewhere, stamped with the current time.
    pub fn publish(
        &self,
        sample: FixSample,
    ) {
        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            state.position = Some((sample.latitude, sample.longitude));
            state.course_over_ground = sample.course_over_ground;
            state.satellites = sample.satellites;
            state.valid = true;
            state.updated_at = Some(Instant::now());
        });
    }

    /// Mark the current fix as lost.
    pub fn invalidate(&self) {
        self.state.lock(|cell| cell.borrow_mut().valid = false);
    }

    /// Snapshot of the latest fix.
    pub fn fix(&self) -> Fix {
        self.state.lock(|cell| {
            let state = cell.borrow();
            let (latitude, longitude) = state.position.unwrap_or((0.0, 0.0));
            let age_ms = state.updated_at.map_or(u64::MAX, |at| {
                Instant::now()
                    .checked_duration_since(at)
                    .map_or(0, |age| age.as_millis())
            });
            Fix {
                latitude,
                longitude,
                course_over_ground: state.course_over_ground,
                is_valid: state.valid && state.position.is_some(),
                age_ms,
                satellites: state.satellites,
            }
        })
    }
}
