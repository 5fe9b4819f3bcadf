//! Wire shapes the normalizer understands, tried in a fixed priority order.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Delimited epoch values below this are taken as seconds, above as milliseconds.
const EPOCH_MS_THRESHOLD: f64 = 1e11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    GpsFix,
    Flat,
    Nested,
    Delimited,
}

#[derive(Debug, Clone)]
pub enum WireMessage {
    GpsFix(GpsFix),
    Flat(FlatTelemetry),
    Nested(NestedTelemetry),
    Delimited(DelimitedFix),
}

/// Fields pulled out of any wire shape, before sequencing and kinematics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub timestamp_ms: Option<i64>,
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
    pub heading_deg: f64,
    pub speed_kph: f64,
    /// (lateral, longitudinal) when the source measured it
    pub accel: Option<(f64, f64)>,
    pub throttle: f64,
    pub brake: f64,
    pub steering_deg: f64,
    pub rpm: f64,
    pub gear: i8,
}

impl WireMessage {
    pub fn parse(raw: &str) -> Option<Self> {
        let text = raw.trim();
        if text.is_empty() {
            return None;
        }
        if text.starts_with('{') {
            let value: Value = serde_json::from_str(text).ok()?;
            return Self::from_json(value);
        }
        DelimitedFix::parse(text).map(Self::Delimited)
    }

    fn from_json(value: Value) -> Option<Self> {
        if let Some(class) = value.get("class").and_then(Value::as_str) {
            if class == "TPV" {
                let fix: GpsFix = serde_json::from_value(value).ok()?;
                return fix.has_fix().then_some(Self::GpsFix(fix));
            }
        }
        if let Ok(flat) = FlatTelemetry::deserialize(&value) {
            if flat.lat.is_some() && flat.lon.is_some() {
                return Some(Self::Flat(flat));
            }
        }
        if let Ok(nested) = NestedTelemetry::deserialize(&value) {
            return Some(Self::Nested(nested));
        }
        None
    }

    pub fn kind(&self) -> WireKind {
        match self {
            Self::GpsFix(_) => WireKind::GpsFix,
            Self::Flat(_) => WireKind::Flat,
            Self::Nested(_) => WireKind::Nested,
            Self::Delimited(_) => WireKind::Delimited,
        }
    }

    /// `None` when the coordinates are missing or not a real position.
    pub fn into_decoded(self) -> Option<Decoded> {
        let d = match self {
            Self::GpsFix(f) => Decoded {
                timestamp_ms: f.time,
                lat: f.lat?,
                lon: f.lon?,
                altitude_m: f.alt.or(f.alt_msl).or(f.alt_hae).unwrap_or(0.0),
                heading_deg: f.track.unwrap_or(0.0),
                speed_kph: f.speed.unwrap_or(0.0) * 3.6,
                ..Decoded::default()
            },
            Self::Flat(f) => {
                let accel = match (f.lateral_g, f.longitudinal_g) {
                    (None, None) => None,
                    (lat, lon) => Some((lat.unwrap_or(0.0), lon.unwrap_or(0.0))),
                };
                Decoded {
                    timestamp_ms: f.timestamp,
                    lat: f.lat?,
                    lon: f.lon?,
                    altitude_m: f.alt.unwrap_or(0.0),
                    heading_deg: f.heading.unwrap_or(0.0),
                    speed_kph: f.speed.unwrap_or(0.0),
                    accel,
                    throttle: f.throttle.unwrap_or(0.0),
                    brake: f.brake.unwrap_or(0.0),
                    steering_deg: f.steering.unwrap_or(0.0),
                    rpm: f.rpm.unwrap_or(0.0),
                    gear: f.gear.map(to_gear).unwrap_or(0),
                }
            }
            Self::Nested(n) => {
                let dynamics = n.dynamics.unwrap_or_default();
                let inputs = n.inputs.unwrap_or_default();
                let engine = n.engine.unwrap_or_default();
                let accel = match (dynamics.lateral_g, dynamics.longitudinal_g) {
                    (None, None) => None,
                    (lat, lon) => Some((lat.unwrap_or(0.0), lon.unwrap_or(0.0))),
                };
                Decoded {
                    timestamp_ms: n.timestamp.or(n.gps.timestamp),
                    lat: n.gps.lat?,
                    lon: n.gps.lon?,
                    altitude_m: n.gps.alt.unwrap_or(0.0),
                    heading_deg: n.gps.heading.unwrap_or(0.0),
                    speed_kph: n.gps.speed.unwrap_or(0.0),
                    accel,
                    throttle: inputs.throttle.unwrap_or(0.0),
                    brake: inputs.brake.unwrap_or(0.0),
                    steering_deg: inputs.steering.unwrap_or(0.0),
                    rpm: engine.rpm.unwrap_or(0.0),
                    gear: engine.gear.map(to_gear).unwrap_or(0),
                }
            }
            Self::Delimited(c) => Decoded {
                timestamp_ms: parse_timestamp_text(&c.time),
                lat: c.lat?,
                lon: c.lon?,
                altitude_m: c.alt.unwrap_or(0.0),
                heading_deg: c.track.unwrap_or(0.0),
                speed_kph: c.speed.unwrap_or(0.0) * 3.6,
                ..Decoded::default()
            },
        };
        valid_position(d.lat, d.lon).then_some(d)
    }
}

/// GPS daemon `TPV` report. Speed is m/s, `track` is course over ground.
#[derive(Debug, Clone, Deserialize)]
pub struct GpsFix {
    pub class: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub mode: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lat: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub lon: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub alt: Option<f64>,
    #[serde(default, rename = "altHAE", deserialize_with = "lenient_f64")]
    pub alt_hae: Option<f64>,
    #[serde(default, rename = "altMSL", deserialize_with = "lenient_f64")]
    pub alt_msl: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub speed: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub track: Option<f64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub time: Option<i64>,
}

impl GpsFix {
    /// 2D or 3D fix.
    pub fn has_fix(&self) -> bool {
        self.mode.is_some_and(|m| m >= 2.0)
    }
}

/// Flat telemetry object. Several keys name the same quantity; when a
/// message carries more than one, the first in the listed order wins.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "FlatKeys")]
pub struct FlatTelemetry {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub lateral_g: Option<f64>,
    pub longitudinal_g: Option<f64>,
    pub throttle: Option<f64>,
    pub brake: Option<f64>,
    pub steering: Option<f64>,
    pub rpm: Option<f64>,
    pub gear: Option<f64>,
    pub timestamp: Option<i64>,
}

#[derive(Deserialize)]
#[allow(non_snake_case)]
struct FlatKeys {
    #[serde(default, deserialize_with = "lenient_f64")]
    lat: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    lon: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    longitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    alt: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    altitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    heading: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    track: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    speed: Option<f64>,
    #[serde(flatten)]
    g: GForceKeys,
    #[serde(default, deserialize_with = "lenient_f64")]
    throttle: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    brake: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    steering: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    steeringAngle: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    steering_angle: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    rpm: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    gear: Option<f64>,
    #[serde(flatten)]
    time: TimeKeys,
}

impl From<FlatKeys> for FlatTelemetry {
    fn from(k: FlatKeys) -> Self {
        Self {
            lat: k.lat.or(k.latitude),
            lon: k.lon.or(k.longitude),
            alt: k.alt.or(k.altitude),
            heading: k.heading.or(k.track),
            speed: k.speed,
            lateral_g: k.g.lateral(),
            longitudinal_g: k.g.longitudinal(),
            throttle: k.throttle,
            brake: k.brake,
            steering: k.steering.or(k.steeringAngle).or(k.steering_angle),
            rpm: k.rpm,
            gear: k.gear,
            timestamp: k.time.resolve(),
        }
    }
}

/// Spellings of the two acceleration channels, in priority order.
#[derive(Default, Deserialize)]
#[allow(non_snake_case)]
struct GForceKeys {
    #[serde(default, deserialize_with = "lenient_f64")]
    lateralG: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    lateral_g: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    latG: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    longitudinalG: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    longitudinal_g: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    lonG: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    longG: Option<f64>,
}

impl GForceKeys {
    fn lateral(&self) -> Option<f64> {
        self.lateralG.or(self.lateral_g).or(self.latG)
    }

    fn longitudinal(&self) -> Option<f64> {
        self.longitudinalG.or(self.longitudinal_g).or(self.lonG).or(self.longG)
    }
}

#[derive(Default, Deserialize)]
struct TimeKeys {
    #[serde(default, deserialize_with = "lenient_timestamp")]
    timestamp: Option<i64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    time: Option<i64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    ts: Option<i64>,
}

impl TimeKeys {
    fn resolve(&self) -> Option<i64> {
        self.timestamp.or(self.time).or(self.ts)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(from = "NestedKeys")]
pub struct NestedTelemetry {
    pub gps: GpsBlock,
    pub dynamics: Option<DynamicsBlock>,
    pub inputs: Option<InputsBlock>,
    pub engine: Option<EngineBlock>,
    pub timestamp: Option<i64>,
}

#[derive(Deserialize)]
struct NestedKeys {
    gps: GpsBlock,
    #[serde(default)]
    dynamics: Option<DynamicsBlock>,
    #[serde(default)]
    inputs: Option<InputsBlock>,
    #[serde(default)]
    engine: Option<EngineBlock>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    timestamp: Option<i64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    time: Option<i64>,
}

impl From<NestedKeys> for NestedTelemetry {
    fn from(k: NestedKeys) -> Self {
        Self {
            gps: k.gps,
            dynamics: k.dynamics,
            inputs: k.inputs,
            engine: k.engine,
            timestamp: k.timestamp.or(k.time),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "GpsKeys")]
pub struct GpsBlock {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub timestamp: Option<i64>,
}

#[derive(Deserialize)]
struct GpsKeys {
    #[serde(default, deserialize_with = "lenient_f64")]
    lat: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    lon: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    longitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    alt: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    altitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    speed: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    heading: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    track: Option<f64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    timestamp: Option<i64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    time: Option<i64>,
}

impl From<GpsKeys> for GpsBlock {
    fn from(k: GpsKeys) -> Self {
        Self {
            lat: k.lat.or(k.latitude),
            lon: k.lon.or(k.longitude),
            alt: k.alt.or(k.altitude),
            speed: k.speed,
            heading: k.heading.or(k.track),
            timestamp: k.timestamp.or(k.time),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "GForceKeys")]
pub struct DynamicsBlock {
    pub lateral_g: Option<f64>,
    pub longitudinal_g: Option<f64>,
}

impl From<GForceKeys> for DynamicsBlock {
    fn from(k: GForceKeys) -> Self {
        Self { lateral_g: k.lateral(), longitudinal_g: k.longitudinal() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "InputsKeys")]
pub struct InputsBlock {
    pub throttle: Option<f64>,
    pub brake: Option<f64>,
    pub steering: Option<f64>,
}

#[derive(Deserialize)]
#[allow(non_snake_case)]
struct InputsKeys {
    #[serde(default, deserialize_with = "lenient_f64")]
    throttle: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    brake: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    steering: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    steeringAngle: Option<f64>,
}

impl From<InputsKeys> for InputsBlock {
    fn from(k: InputsKeys) -> Self {
        Self { throttle: k.throttle, brake: k.brake, steering: k.steering.or(k.steeringAngle) }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineBlock {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub rpm: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub gear: Option<f64>,
}

/// `time,lat,lon,alt,speed,climb,track,mode`, speed in m/s.
#[derive(Debug, Clone, Deserialize)]
pub struct DelimitedFix {
    pub time: String,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub lat: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub lon: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub alt: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub speed: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub climb: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub track: Option<f64>,
    #[serde(deserialize_with = "csv::invalid_option")]
    pub mode: Option<f64>,
}

impl DelimitedFix {
    const FIELDS: usize = 8;

    pub fn parse(line: &str) -> Option<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .from_reader(line.as_bytes());
        let record = rdr.records().next()?.ok()?;
        if record.len() != Self::FIELDS {
            return None;
        }
        record.deserialize(None).ok()
    }
}

fn valid_position(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && lat.abs() <= 90.0 && lon.abs() <= 180.0
}

fn to_gear(g: f64) -> i8 {
    g.round().clamp(i8::MIN as f64, i8::MAX as f64) as i8
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Loose {
    Num(f64),
    Text(String),
    #[allow(dead_code)]
    Other(serde::de::IgnoredAny),
}

/// Numbers or numeric strings; anything else (including NaN) reads as absent.
fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let v = match Option::<Loose>::deserialize(d)? {
        Some(Loose::Num(n)) => Some(n),
        Some(Loose::Text(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(v.filter(|n| n.is_finite()))
}

/// JSON timestamps: numbers and numeric strings are milliseconds (epoch or
/// stream-relative), other strings must be RFC 3339.
fn lenient_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<Loose>::deserialize(d)? {
        Some(Loose::Num(n)) => whole_ms(n),
        Some(Loose::Text(s)) => match s.trim().parse::<f64>() {
            Ok(n) => whole_ms(n),
            Err(_) => parse_rfc3339(&s),
        },
        _ => None,
    })
}

/// Delimited `time` column: epoch seconds or milliseconds, told apart by
/// magnitude, or an RFC 3339 instant.
pub fn parse_timestamp_text(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(n) = s.parse::<f64>() {
        return epoch_to_ms(n);
    }
    parse_rfc3339(s)
}

fn parse_rfc3339(s: &str) -> Option<i64> {
    let t = OffsetDateTime::parse(s.trim(), &Rfc3339).ok()?;
    Some((t.unix_timestamp_nanos() / 1_000_000) as i64)
}

fn whole_ms(n: f64) -> Option<i64> {
    (n.is_finite() && n >= 0.0).then(|| n.round() as i64)
}

fn epoch_to_ms(n: f64) -> Option<i64> {
    if n < EPOCH_MS_THRESHOLD {
        whole_ms(n * 1000.0)
    } else {
        whole_ms(n)
    }
}
