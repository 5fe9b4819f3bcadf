use model::*;
use serde_json::{json, Value};

pub mod geo;
pub mod shadow;

pub use geo::{haversine_m, offset_m};
pub use shadow::{
    compute_sector_times, find_shadow_point_at_distance, synthesize_shadow, ShadowConfig,
    ShadowEngine,
};

pub fn lap_summary(laps: &[LapRecord]) -> Value {
    let times: Vec<f64> = laps.iter().map(|l| l.lap_time_s).filter(|t| *t > 0.0).collect();
    let best = times.iter().copied().fold(None, |m: Option<f64>, t| Some(m.map_or(t, |m| m.min(t))));
    let worst = times.iter().copied().fold(None, |m: Option<f64>, t| Some(m.map_or(t, |m| m.max(t))));
    let avg = if !times.is_empty() {
        times.iter().sum::<f64>() / (times.len() as f64)
    } else {
        0.0
    };

    let sectors = laps.iter().map(|l| l.sector_times_s.len()).max().unwrap_or(0);
    let mut best_sectors = Vec::with_capacity(sectors);
    for i in 0..sectors {
        let b = laps
            .iter()
            .filter_map(|l| l.sector_times_s.get(i).copied())
            .filter(|t| *t > 0.0)
            .fold(None, |m: Option<f64>, t| Some(m.map_or(t, |m| m.min(t))));
        best_sectors.push(b);
    }
    let theoretical_best = if !best_sectors.is_empty() && best_sectors.iter().all(Option::is_some) {
        Some(best_sectors.iter().flatten().sum::<f64>())
    } else {
        None
    };

    // spread of every populated sector time across the session
    let sector_times: Vec<f64> = laps
        .iter()
        .flat_map(|l| l.sector_times_s.iter().copied())
        .filter(|t| *t > 0.0)
        .collect();
    let consistency = stddev(&sector_times);

    json!({
        "laps": laps.len(),
        "best_s": best,
        "worst_s": worst,
        "avg_s": avg,
        "best_sectors_s": best_sectors,
        "theoretical_best_s": theoretical_best,
        "consistency": consistency
    })
}

fn stddev(v: &[f64]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    let m = v.iter().sum::<f64>() / (v.len() as f64);
    let var = v.iter().map(|x| {
        let d = *x - m;
        d * d
    }).sum::<f64>() / (v.len() as f64);
    var.sqrt()
}

/// Time gained or lost against `reference` every `step_m` metres of `lap`.
/// Positive means `lap` was behind at that distance.
pub fn delta_trace(reference: &LapRecord, lap: &LapRecord, step_m: f64) -> Value {
    let max_len = lap
        .points
        .last()
        .map(|p| p.distance_m)
        .unwrap_or(0.0);
    if reference.points.is_empty() || step_m <= 0.0 {
        return Value::Array(Vec::new());
    }

    let expected_rows = ((max_len / step_m) as usize).saturating_add(1);
    let mut rows = Vec::with_capacity(expected_rows);
    for i in 0..expected_rows {
        let d = i as f64 * step_m;
        let (Some(here), Some(there)) = (
            find_shadow_point_at_distance(lap, d),
            find_shadow_point_at_distance(reference, d),
        ) else {
            continue;
        };
        rows.push(json!({
            "distance": d,
            "delta_s": here.elapsed_s - there.elapsed_s
        }));
    }

    Value::Array(rows)
}
