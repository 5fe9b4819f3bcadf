//! Finite-difference acceleration for sources that only report position,
//! speed and heading.

use std::collections::VecDeque;

/// ~1 s of history at 10 Hz.
pub const WINDOW_CAPACITY: usize = 10;
const MIN_SAMPLES: usize = 3;
const STANDARD_GRAVITY: f64 = 9.81;
const MAX_G: f64 = 3.0;
const MAX_ELAPSED_S: f64 = 2.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KinematicSample {
    pub time_ms: i64,
    pub lat: f64,
    pub lon: f64,
    pub speed_kph: f64,
    pub heading_deg: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Acceleration {
    pub lateral_g: f64,
    pub longitudinal_g: f64,
}

#[derive(Debug, Clone)]
pub struct KinematicsEstimator {
    window: VecDeque<KinematicSample>,
    capacity: usize,
}

impl KinematicsEstimator {
    pub fn new() -> Self {
        Self::with_capacity(WINDOW_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_SAMPLES);
        Self { window: VecDeque::with_capacity(capacity), capacity }
    }

    /// Buffer `sample` as the newest entry and estimate acceleration for it.
    pub fn push(&mut self, sample: KinematicSample) -> Acceleration {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        self.estimate()
    }

    /// Compares the newest sample with the one two positions back; the
    /// immediately preceding sample is too noisy at GPS rates.
    pub fn estimate(&self) -> Acceleration {
        let n = self.window.len();
        if n < MIN_SAMPLES {
            return Acceleration::default();
        }
        let newest = &self.window[n - 1];
        let base = &self.window[n - 3];

        let dt = (newest.time_ms - base.time_ms) as f64 / 1000.0;
        if dt <= 0.0 || dt > MAX_ELAPSED_S {
            return Acceleration::default();
        }

        let dv_mps = (newest.speed_kph - base.speed_kph) / 3.6;
        let longitudinal_g = dv_mps / dt / STANDARD_GRAVITY;

        let yaw_rate = heading_delta(base.heading_deg, newest.heading_deg).to_radians() / dt;
        let lateral_g = (newest.speed_kph / 3.6) * yaw_rate / STANDARD_GRAVITY;

        Acceleration {
            lateral_g: lateral_g.clamp(-MAX_G, MAX_G),
            longitudinal_g: longitudinal_g.clamp(-MAX_G, MAX_G),
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

impl Default for KinematicsEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Shortest signed turn from `from` to `to`, in [-180, 180] degrees.
pub fn heading_delta(from: f64, to: f64) -> f64 {
    let d = (to - from) % 360.0;
    if d > 180.0 {
        d - 360.0
    } else if d < -180.0 {
        d + 360.0
    } else {
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(time_ms: i64, speed_kph: f64, heading_deg: f64) -> KinematicSample {
        KinematicSample { time_ms, lat: 0.0, lon: 0.0, speed_kph, heading_deg }
    }

    #[test]
    fn test_needs_three_samples() {
        let mut k = KinematicsEstimator::new();
        assert_eq!(k.push(sample(0, 50.0, 0.0)), Acceleration::default());
        assert_eq!(k.push(sample(100, 80.0, 45.0)), Acceleration::default());
        let a = k.push(sample(200, 100.0, 90.0));
        assert!(a.longitudinal_g != 0.0);
    }

    #[test]
    fn test_heading_wrap_uses_short_arc() {
        let mut k = KinematicsEstimator::new();
        // 20 m/s = 72 km/h
        k.push(sample(0, 72.0, 350.0));
        k.push(sample(500, 72.0, 0.0));
        let a = k.push(sample(1000, 72.0, 10.0));
        let expected = 20.0 * 20f64.to_radians() / 9.81;
        assert!((a.lateral_g - expected).abs() < 1e-9, "got {}", a.lateral_g);
        assert_eq!(a.longitudinal_g, 0.0);
    }

    #[test]
    fn test_longitudinal_from_speed_delta() {
        let mut k = KinematicsEstimator::new();
        k.push(sample(0, 36.0, 90.0));
        k.push(sample(100, 40.0, 90.0));
        // 36 -> 54 km/h is 10 -> 15 m/s over 0.2 s
        let a = k.push(sample(200, 54.0, 90.0));
        let expected: f64 = 5.0 / 0.2 / 9.81;
        assert!(((a.longitudinal_g) - expected.min(3.0)).abs() < 1e-9);
        assert_eq!(a.lateral_g, 0.0);
    }

    #[test]
    fn test_values_are_clamped() {
        let mut k = KinematicsEstimator::new();
        k.push(sample(0, 200.0, 0.0));
        k.push(sample(50, 100.0, 0.0));
        let a = k.push(sample(100, 0.0, 0.0));
        assert_eq!(a.longitudinal_g, -3.0);
    }

    #[test]
    fn test_stale_or_out_of_order_is_neutral() {
        let mut k = KinematicsEstimator::new();
        k.push(sample(0, 50.0, 0.0));
        k.push(sample(1500, 60.0, 10.0));
        assert_eq!(k.push(sample(2500, 90.0, 40.0)), Acceleration::default());

        let mut k = KinematicsEstimator::new();
        k.push(sample(1000, 50.0, 0.0));
        k.push(sample(900, 60.0, 10.0));
        assert_eq!(k.push(sample(1000, 90.0, 40.0)), Acceleration::default());
    }

    #[test]
    fn test_window_is_bounded() {
        let mut k = KinematicsEstimator::new();
        for i in 0..25 {
            k.push(sample(i * 100, 50.0, 0.0));
        }
        assert_eq!(k.len(), WINDOW_CAPACITY);
    }

    #[test]
    fn test_heading_delta() {
        assert_eq!(heading_delta(350.0, 10.0), 20.0);
        assert_eq!(heading_delta(10.0, 350.0), -20.0);
        assert_eq!(heading_delta(90.0, 180.0), 90.0);
        assert_eq!(heading_delta(0.0, 180.0), 180.0);
    }
}
