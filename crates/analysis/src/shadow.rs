//! Shadow-line engine: lap detection by start/finish geofence, sector timing,
//! theoretical-best lap synthesis and the live distance-synchronised delta.
//!
//! Everything here is synchronous and I/O free. `ingest` is called once per
//! normalized frame; listeners receive the resulting `ShadowState`.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::haversine_m;
use model::{
    GeoPoint, LapRecord, Listeners, SectorBoundary, ShadowPoint, ShadowState, Subscription,
    TelemetryFrame,
};

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct ShadowConfig {
    pub start_finish: GeoPoint,
    pub start_finish_radius_m: f64,
    pub min_lap_time_s: f64,
    pub sectors: Vec<SectorBoundary>,
    pub track_length_m: f64,
    /// Frames to ignore the start/finish geofence after a crossing (~5 s at 10 Hz).
    pub crossing_cooldown_frames: u32,
    pub echo_trail_len: usize,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            start_finish: GeoPoint::default(),
            start_finish_radius_m: 25.0,
            min_lap_time_s: 30.0,
            sectors: Vec::new(),
            track_length_m: 0.0,
            crossing_cooldown_frames: 50,
            echo_trail_len: 100,
        }
    }
}

struct LapInProgress {
    id: Uuid,
    lap_number: u32,
    start_ms: i64,
    distance_m: f64,
    points: Vec<ShadowPoint>,
}

impl LapInProgress {
    fn elapsed_s(&self, frame: &TelemetryFrame) -> f64 {
        (frame.timestamp_ms - self.start_ms) as f64 / 1000.0
    }
}

pub struct ShadowEngine {
    config: Option<ShadowConfig>,
    laps: Vec<LapRecord>,
    current: Option<LapInProgress>,
    shadow: Option<LapRecord>,
    state: ShadowState,
    cooldown: u32,
    last_pos: Option<GeoPoint>,
    next_lap_number: u32,
    state_listeners: Listeners<ShadowState>,
    lap_listeners: Listeners<LapRecord>,
}

impl ShadowEngine {
    pub fn new() -> Self {
        Self {
            config: None,
            laps: Vec::new(),
            current: None,
            shadow: None,
            state: ShadowState::default(),
            cooldown: 0,
            last_pos: None,
            next_lap_number: 1,
            state_listeners: Listeners::new(),
            lap_listeners: Listeners::new(),
        }
    }

    pub fn configure(&mut self, config: ShadowConfig) {
        tracing::info!(
            sectors = config.sectors.len(),
            radius_m = config.start_finish_radius_m,
            min_lap_time_s = config.min_lap_time_s,
            "shadow engine configured"
        );
        self.state.sector_deltas_s = vec![0.0; config.sectors.len()];
        self.config = Some(config);
    }

    pub fn config(&self) -> Option<&ShadowConfig> {
        self.config.as_ref()
    }

    pub fn ingest(&mut self, frame: &TelemetryFrame) {
        let Some(cfg) = self.config.as_ref() else {
            return;
        };
        let start_finish = cfg.start_finish;
        let radius_m = cfg.start_finish_radius_m;
        let min_lap_time_s = cfg.min_lap_time_s;
        let cooldown_frames = cfg.crossing_cooldown_frames;

        let pos = frame.position();
        let step_m = self.last_pos.map(|prev| haversine_m(prev, pos)).unwrap_or(0.0);
        self.last_pos = Some(pos);

        self.cooldown = self.cooldown.saturating_sub(1);
        let crossed = self.cooldown == 0 && haversine_m(pos, start_finish) < radius_m;
        if crossed {
            self.cooldown = cooldown_frames;
        }

        let closes_lap = crossed
            && self
                .current
                .as_ref()
                .is_some_and(|lap| !lap.points.is_empty() && lap.elapsed_s(frame) >= min_lap_time_s);

        if closes_lap {
            if let Some(mut lap) = self.current.take() {
                lap.distance_m += step_m;
                self.push_point(&mut lap, frame);
                self.finalize(lap, frame);
            }
        } else if crossed && self.current.is_some() {
            tracing::debug!(seq = frame.seq, "start/finish crossing below minimum lap time, ignored");
        }

        if crossed && self.current.is_none() {
            self.start_lap(frame);
        } else if let Some(mut lap) = self.current.take() {
            lap.distance_m += step_m;
            self.push_point(&mut lap, frame);
            self.current = Some(lap);
        }

        self.update_live();
        self.state_listeners.emit(&self.state);
    }

    /// Pin a completed lap as the comparison target until the next lap completes.
    pub fn set_shadow_lap(&mut self, lap_id: Uuid) -> bool {
        let Some(lap) = self.laps.iter().find(|l| l.id == lap_id) else {
            tracing::debug!(%lap_id, "unknown lap, shadow unchanged");
            return false;
        };
        tracing::info!(%lap_id, lap_number = lap.lap_number, "shadow lap pinned");
        self.shadow = Some(lap.clone());
        self.state.shadow_lap_id = Some(lap_id);
        self.state_listeners.emit(&self.state);
        true
    }

    pub fn reset(&mut self) {
        self.laps.clear();
        self.current = None;
        self.shadow = None;
        self.cooldown = 0;
        self.last_pos = None;
        self.next_lap_number = 1;
        let sectors = self.config.as_ref().map(|c| c.sectors.len()).unwrap_or(0);
        self.state = ShadowState { sector_deltas_s: vec![0.0; sectors], ..ShadowState::default() };
        tracing::info!("shadow engine reset");
        self.state_listeners.emit(&self.state);
    }

    /// Registers a state listener and immediately replays the current state to it.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ShadowState) + Send + Sync + 'static,
    {
        listener(&self.state);
        self.state_listeners.subscribe(listener)
    }

    pub fn on_lap_complete<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LapRecord) + Send + Sync + 'static,
    {
        self.lap_listeners.subscribe(listener)
    }

    pub fn completed_laps(&self) -> &[LapRecord] {
        &self.laps
    }

    pub fn shadow_lap(&self) -> Option<&LapRecord> {
        self.shadow.as_ref()
    }

    pub fn state(&self) -> &ShadowState {
        &self.state
    }

    /// Interpolated shadow position at `distance_m` into the lap.
    pub fn shadow_point_at(&self, distance_m: f64) -> Option<ShadowPoint> {
        self.shadow.as_ref().and_then(|lap| find_shadow_point_at_distance(lap, distance_m))
    }

    fn sectors(&self) -> &[SectorBoundary] {
        self.config.as_ref().map(|c| c.sectors.as_slice()).unwrap_or(&[])
    }

    fn push_point(&self, lap: &mut LapInProgress, frame: &TelemetryFrame) {
        let elapsed_s = lap.elapsed_s(frame);
        lap.points.push(ShadowPoint {
            distance_m: lap.distance_m,
            lat: frame.lat,
            lon: frame.lon,
            speed_kph: frame.speed_kph,
            heading_deg: frame.heading_deg,
            lateral_g: frame.lateral_g,
            elapsed_s,
            sector: sector_for_distance(self.sectors(), lap.distance_m),
        });
    }

    fn start_lap(&mut self, frame: &TelemetryFrame) {
        let mut lap = LapInProgress {
            id: Uuid::new_v4(),
            lap_number: self.next_lap_number,
            start_ms: frame.timestamp_ms,
            distance_m: 0.0,
            points: Vec::new(),
        };
        self.next_lap_number += 1;
        self.push_point(&mut lap, frame);
        tracing::info!(lap_number = lap.lap_number, lap_id = %lap.id, "lap started");

        let sectors = self.sectors().len();
        self.state.current_lap_id = Some(lap.id);
        self.state.distance_m = 0.0;
        self.state.current_sector = 0;
        self.state.delta_s = 0.0;
        self.state.sector_deltas_s = vec![0.0; sectors];
        self.state.shadow_point = None;
        self.state.user_trail.clear();
        self.state.shadow_trail.clear();
        self.current = Some(lap);
    }

    fn finalize(&mut self, lap: LapInProgress, frame: &TelemetryFrame) {
        let lap_time_s = lap.elapsed_s(frame);
        let sector_times_s = compute_sector_times(&lap.points, self.sectors());
        let complete = sector_times_s.iter().all(|t| *t > 0.0);
        let record = LapRecord {
            id: lap.id,
            lap_number: lap.lap_number,
            start_ms: lap.start_ms,
            end_ms: frame.timestamp_ms,
            distance_m: lap.distance_m,
            lap_time_s,
            complete,
            points: lap.points,
            sector_times_s,
        };
        tracing::info!(
            lap_number = record.lap_number,
            lap_time_s = record.lap_time_s,
            distance_m = record.distance_m,
            sectors = ?record.sector_times_s,
            "lap complete"
        );

        self.laps.push(record);
        if let Some(record) = self.laps.last() {
            self.lap_listeners.emit(record);
        }

        self.shadow = synthesize_shadow(&self.laps, self.sectors());
        self.state.shadow_lap_id = self.shadow.as_ref().map(|s| s.id);
        if let Some(shadow) = &self.shadow {
            tracing::info!(
                shadow_id = %shadow.id,
                theoretical_best_s = shadow.lap_time_s,
                "shadow lap synthesized"
            );
        }
    }

    fn update_live(&mut self) {
        let Some(lap) = &self.current else {
            return;
        };
        let Some(point) = lap.points.last() else {
            return;
        };
        let trail_len = self.config.as_ref().map(|c| c.echo_trail_len).unwrap_or(0);

        self.state.current_lap_id = Some(lap.id);
        self.state.distance_m = lap.distance_m;
        self.state.current_sector = point.sector;
        push_bounded(&mut self.state.user_trail, GeoPoint { lat: point.lat, lon: point.lon }, trail_len);

        let Some(shadow) = &self.shadow else {
            return;
        };
        let Some(ghost) = find_shadow_point_at_distance(shadow, lap.distance_m) else {
            return;
        };
        let delta_s = point.elapsed_s - ghost.elapsed_s;
        self.state.delta_s = delta_s;
        if let Some(slot) = self.state.sector_deltas_s.get_mut(point.sector) {
            *slot = delta_s;
        }
        push_bounded(&mut self.state.shadow_trail, GeoPoint { lat: ghost.lat, lon: ghost.lon }, trail_len);
        self.state.shadow_point = Some(ghost);
    }
}

impl Default for ShadowEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn push_bounded(trail: &mut VecDeque<GeoPoint>, p: GeoPoint, cap: usize) {
    if cap == 0 {
        return;
    }
    while trail.len() >= cap {
        trail.pop_front();
    }
    trail.push_back(p);
}

/// First sector containing `distance_m`, else the last one.
pub fn sector_for_distance(sectors: &[SectorBoundary], distance_m: f64) -> usize {
    sectors
        .iter()
        .position(|s| s.contains(distance_m))
        .unwrap_or_else(|| sectors.len().saturating_sub(1))
}

/// Per-sector times for a finished lap whose last point sits on the finish
/// line. A sector's time runs from the previous sector's end to the first
/// point at or past its own end; the finish line closes the final sector.
/// Sectors never reached record 0.
pub fn compute_sector_times(points: &[ShadowPoint], sectors: &[SectorBoundary]) -> Vec<f64> {
    let mut times = vec![0.0; sectors.len()];
    let mut prev_end_s = 0.0;
    let mut prev_reached = true;
    for (i, sector) in sectors.iter().enumerate() {
        let is_last = i + 1 == sectors.len();
        let reached = points
            .iter()
            .find(|p| p.distance_m >= sector.end_m)
            .or_else(|| if is_last && prev_reached { points.last() } else { None })
            .map(|p| p.elapsed_s);
        match reached {
            Some(t) => {
                times[i] = t - prev_end_s;
                prev_end_s = t;
                prev_reached = true;
            }
            None => prev_reached = false,
        }
    }
    times
}

/// Theoretical best lap from the completed laps.
///
/// With one lap that lap is the shadow. With more, each sector comes from the
/// lap with the smallest positive time for it (first found on ties), and the
/// segments are re-timed to run back to back. The headline time is the sum of
/// the chosen sector times. Without sectors the fastest full lap is used.
pub fn synthesize_shadow(laps: &[LapRecord], sectors: &[SectorBoundary]) -> Option<LapRecord> {
    match laps {
        [] => return None,
        [only] => return Some(only.clone()),
        _ => {}
    }
    if sectors.is_empty() {
        return laps
            .iter()
            .filter(|l| l.lap_time_s > 0.0)
            .fold(None, |best: Option<&LapRecord>, l| match best {
                Some(b) if b.lap_time_s <= l.lap_time_s => Some(b),
                _ => Some(l),
            })
            .cloned();
    }

    let mut points: Vec<ShadowPoint> = Vec::new();
    let mut sector_times_s = vec![0.0; sectors.len()];
    let mut total_s = 0.0;

    for i in 0..sectors.len() {
        let best = laps
            .iter()
            .filter_map(|l| l.sector_times_s.get(i).copied().filter(|t| *t > 0.0).map(|t| (l, t)))
            .fold(None, |best: Option<(&LapRecord, f64)>, (l, t)| match best {
                Some((_, bt)) if bt <= t => best,
                _ => Some((l, t)),
            });
        let Some((lap, t)) = best else {
            continue;
        };

        let mut segment = lap.points.iter().filter(|p| p.sector == i).peekable();
        if let Some(first) = segment.peek() {
            let offset = total_s - first.elapsed_s;
            points.extend(segment.map(|p| ShadowPoint { elapsed_s: p.elapsed_s + offset, ..p.clone() }));
        }
        sector_times_s[i] = t;
        total_s += t;
    }

    Some(LapRecord {
        id: Uuid::new_v4(),
        lap_number: 0,
        start_ms: 0,
        end_ms: (total_s * 1000.0).round() as i64,
        distance_m: points.last().map(|p| p.distance_m).unwrap_or(0.0),
        lap_time_s: total_s,
        complete: sector_times_s.iter().all(|t| *t > 0.0),
        points,
        sector_times_s,
    })
}

/// Shadow position at `distance_m`, linearly interpolated between the two
/// bracketing points. Distances outside the lap clamp to its ends.
pub fn find_shadow_point_at_distance(lap: &LapRecord, distance_m: f64) -> Option<ShadowPoint> {
    let points = &lap.points;
    let first = points.first()?;
    let last = points.last()?;
    if distance_m <= first.distance_m {
        return Some(first.clone());
    }
    if distance_m >= last.distance_m {
        return Some(last.clone());
    }

    let hi = points.partition_point(|p| p.distance_m <= distance_m);
    let (a, b) = (&points[hi - 1], &points[hi]);
    let span = b.distance_m - a.distance_m;
    if span <= 0.0 || a.distance_m == distance_m {
        return Some(a.clone());
    }
    let r = (distance_m - a.distance_m) / span;
    let lerp = |x: f64, y: f64| x + (y - x) * r;
    Some(ShadowPoint {
        distance_m,
        lat: lerp(a.lat, b.lat),
        lon: lerp(a.lon, b.lon),
        speed_kph: lerp(a.speed_kph, b.speed_kph),
        heading_deg: lerp(a.heading_deg, b.heading_deg),
        lateral_g: lerp(a.lateral_g, b.lateral_g),
        elapsed_s: lerp(a.elapsed_s, b.elapsed_s),
        sector: a.sector,
    })
}
