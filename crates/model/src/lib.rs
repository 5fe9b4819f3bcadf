use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

pub mod listeners;

pub use listeners::{Listeners, Subscription};

/// One normalized telemetry sample, independent of the wire format it came from.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TelemetryFrame {
    pub seq: u64,
    pub timestamp_ms: i64,
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
    pub heading_deg: f64, // 0..360
    pub speed_kph: f64,
    pub lateral_g: f64,
    pub longitudinal_g: f64,
    pub throttle: f64, // 0..100
    pub brake: f64,    // 0..100
    pub steering_deg: f64,
    pub rpm: f64,
    pub gear: i8,
    /// true when the source reported acceleration, false when it was derived
    pub accel_measured: bool,
}

impl TelemetryFrame {
    pub fn position(&self) -> GeoPoint {
        GeoPoint { lat: self.lat, lon: self.lon }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Live,
    Paused,
    Recovering,
    Dead,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Live => write!(f, "live"),
            Self::Paused => write!(f, "paused"),
            Self::Recovering => write!(f, "recovering"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// A sample placed along a lap: where the car was, how fast, and when.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ShadowPoint {
    pub distance_m: f64,
    pub lat: f64,
    pub lon: f64,
    pub speed_kph: f64,
    pub heading_deg: f64,
    pub lateral_g: f64,
    pub elapsed_s: f64,
    pub sector: usize,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct LapRecord {
    #[serde(with = "uuid::serde::simple")]
    pub id: Uuid,
    pub lap_number: u32,
    pub start_ms: i64,
    pub end_ms: i64,
    pub distance_m: f64,
    pub lap_time_s: f64,
    pub complete: bool,
    #[serde(default)]
    pub points: Vec<ShadowPoint>,
    /// One entry per configured sector, 0 when the sector end was never reached.
    #[serde(default)]
    pub sector_times_s: Vec<f64>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SectorBoundary {
    pub id: u32,
    pub name: String,
    pub start_m: f64,
    pub end_m: f64,
}

impl SectorBoundary {
    pub fn new(id: u32, name: impl Into<String>, start_m: f64, end_m: f64) -> Self {
        Self { id, name: name.into(), start_m, end_m }
    }

    /// Half-open: `[start_m, end_m)`.
    pub fn contains(&self, distance_m: f64) -> bool {
        distance_m >= self.start_m && distance_m < self.end_m
    }
}

/// Live comparison against the shadow lap, published once per frame.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ShadowState {
    pub current_lap_id: Option<Uuid>,
    pub shadow_lap_id: Option<Uuid>,
    pub distance_m: f64,
    pub current_sector: usize,
    /// Negative means ahead of the shadow.
    pub delta_s: f64,
    pub sector_deltas_s: Vec<f64>,
    pub shadow_point: Option<ShadowPoint>,
    pub user_trail: VecDeque<GeoPoint>,
    pub shadow_trail: VecDeque<GeoPoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_is_half_open() {
        let s = SectorBoundary::new(0, "S1", 0.0, 100.0);
        assert!(s.contains(0.0));
        assert!(s.contains(99.9));
        assert!(!s.contains(100.0));
        assert!(!s.contains(-0.1));
    }

    #[test]
    fn connection_state_display_matches_serde() {
        for st in [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::Live,
            ConnectionState::Paused,
            ConnectionState::Recovering,
            ConnectionState::Dead,
        ] {
            let json = serde_json::to_string(&st).unwrap();
            assert_eq!(json, format!("\"{}\"", st));
        }
    }

    #[test]
    fn lap_record_serializes_simple_uuid() {
        let lap = LapRecord {
            id: Uuid::new_v4(),
            lap_number: 1,
            start_ms: 0,
            end_ms: 40_000,
            distance_m: 1000.0,
            lap_time_s: 40.0,
            complete: true,
            points: vec![],
            sector_times_s: vec![40.0],
        };
        let v = serde_json::to_value(&lap).unwrap();
        assert_eq!(v["id"].as_str().unwrap().len(), 32);
        let back: LapRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, lap);
    }
}
