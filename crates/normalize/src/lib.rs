//! Protocol-agnostic decoding of raw telemetry messages into `TelemetryFrame`s.
//!
//! This is a best-effort decoder: anything it cannot place is dropped and
//! never consumes a sequence number.

use delta_ingest_core::FrameDecoder;
use model::TelemetryFrame;
use time::OffsetDateTime;

pub mod kinematics;
pub mod wire;

pub use kinematics::{Acceleration, KinematicSample, KinematicsEstimator};
pub use wire::{WireKind, WireMessage};

pub type Clock = fn() -> i64;

pub fn wall_clock_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub struct Normalizer {
    seq: u64,
    kinematics: KinematicsEstimator,
    clock: Clock,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::with_clock(wall_clock_ms)
    }

    /// `clock` stamps messages that carry no timestamp of their own.
    pub fn with_clock(clock: Clock) -> Self {
        Self { seq: 0, kinematics: KinematicsEstimator::new(), clock }
    }

    pub fn ingest(&mut self, raw: &str) -> Option<TelemetryFrame> {
        let Some(msg) = WireMessage::parse(raw) else {
            tracing::trace!(len = raw.len(), "dropping unrecognized message");
            return None;
        };
        let kind = msg.kind();
        let Some(d) = msg.into_decoded() else {
            tracing::trace!(?kind, "dropping message without a usable position");
            return None;
        };

        let timestamp_ms = d.timestamp_ms.unwrap_or_else(self.clock);
        let heading_deg = d.heading_deg.rem_euclid(360.0);
        let derived = self.kinematics.push(KinematicSample {
            time_ms: timestamp_ms,
            lat: d.lat,
            lon: d.lon,
            speed_kph: d.speed_kph,
            heading_deg,
        });
        let (lateral_g, longitudinal_g, accel_measured) = match d.accel {
            Some((lat_g, lon_g)) => (lat_g, lon_g, true),
            None => (derived.lateral_g, derived.longitudinal_g, false),
        };

        self.seq += 1;
        Some(TelemetryFrame {
            seq: self.seq,
            timestamp_ms,
            lat: d.lat,
            lon: d.lon,
            altitude_m: d.altitude_m,
            heading_deg,
            speed_kph: d.speed_kph,
            lateral_g,
            longitudinal_g,
            throttle: d.throttle.clamp(0.0, 100.0),
            brake: d.brake.clamp(0.0, 100.0),
            steering_deg: d.steering_deg,
            rpm: d.rpm,
            gear: d.gear,
            accel_measured,
        })
    }

    /// Sequence number of the last decoded frame (0 before the first).
    pub fn sequence(&self) -> u64 {
        self.seq
    }

    pub fn reset(&mut self) {
        self.seq = 0;
        self.kinematics.clear();
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder for Normalizer {
    fn decode(&mut self, raw: &str) -> Option<TelemetryFrame> {
        self.ingest(raw)
    }

    fn reset(&mut self) {
        Normalizer::reset(self);
    }
}
