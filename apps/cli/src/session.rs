use std::{sync::Arc, thread};
use parking_lot::Mutex;

use analysis::{ShadowConfig, ShadowEngine};
use delta_ingest_core::{FrameDecoder, FrameRx};
use iox::CaptureWriter;
use model::*;
use normalize::Normalizer;

/// Normalizer that can also append every raw message to a capture file.
pub struct SessionDecoder {
    normalizer: Normalizer,
    recorder: Option<CaptureWriter>,
}

impl SessionDecoder {
    pub fn new(normalizer: Normalizer, recorder: Option<CaptureWriter>) -> Self {
        Self { normalizer, recorder }
    }
}

impl FrameDecoder for SessionDecoder {
    fn decode(&mut self, raw: &str) -> Option<TelemetryFrame> {
        if let Some(rec) = &mut self.recorder {
            if let Err(e) = rec.append(raw) {
                tracing::warn!(error = %e, "capture write failed, recording stopped");
                self.recorder = None;
            }
        }
        self.normalizer.decode(raw)
    }

    fn reset(&mut self) {
        self.normalizer.reset();
        if let Some(rec) = &mut self.recorder {
            let _ = rec.flush();
        }
    }
}

pub struct Session {
    engine: Arc<Mutex<ShadowEngine>>,
    report_every: u64,
    _laps: Subscription,
}

impl Session {
    pub fn new(shadow: ShadowConfig, report_every: u64) -> Self {
        let mut engine = ShadowEngine::new();
        engine.configure(shadow);
        let laps = engine.on_lap_complete(|lap| {
            tracing::info!(
                lap = lap.lap_number,
                time = %format_lap_time(lap.lap_time_s),
                complete = lap.complete,
                "LAP"
            );
        });
        Self { engine: Arc::new(Mutex::new(engine)), report_every, _laps: laps }
    }

    pub fn engine(&self) -> Arc<Mutex<ShadowEngine>> {
        self.engine.clone()
    }

    /// Feeds frames to the engine on a dedicated thread until every sender is dropped.
    pub fn spawn_pump(&self, rx: FrameRx) -> thread::JoinHandle<()> {
        let engine = self.engine.clone();
        let report_every = self.report_every;
        thread::spawn(move || {
            while let Ok(frame) = rx.recv() {
                let mut e = engine.lock();
                e.ingest(&frame);
                if report_every > 0 && frame.seq % report_every == 0 {
                    let st = e.state();
                    if st.shadow_point.is_some() {
                        tracing::info!(
                            seq = frame.seq,
                            distance_m = st.distance_m.round(),
                            sector = st.current_sector + 1,
                            delta = %format_delta(st.delta_s),
                            "delta"
                        );
                    }
                }
            }
            tracing::debug!("frame channel closed");
        })
    }
}

/// `m:ss.mmm`
pub fn format_lap_time(seconds: f64) -> String {
    let ms = (seconds.max(0.0) * 1000.0).round() as u64;
    format!("{}:{:02}.{:03}", ms / 60_000, (ms / 1000) % 60, ms % 1000)
}

pub fn format_delta(seconds: f64) -> String {
    format!("{:+.3}", seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis::offset_m;
    use delta_ingest_core::channel;

    fn frame(seq: u64, north_m: f64) -> TelemetryFrame {
        let p = offset_m(GeoPoint { lat: 47.0, lon: 8.0 }, north_m, 0.0);
        TelemetryFrame {
            seq,
            timestamp_ms: seq as i64 * 100,
            lat: p.lat,
            lon: p.lon,
            altitude_m: 0.0,
            heading_deg: 0.0,
            speed_kph: 90.0,
            lateral_g: 0.0,
            longitudinal_g: 0.0,
            throttle: 100.0,
            brake: 0.0,
            steering_deg: 0.0,
            rpm: 6000.0,
            gear: 3,
            accel_measured: false,
        }
    }

    #[test]
    fn test_format_lap_time() {
        assert_eq!(format_lap_time(99.1234), "1:39.123");
        assert_eq!(format_lap_time(5.0), "0:05.000");
        assert_eq!(format_lap_time(-1.0), "0:00.000");
        assert_eq!(format_delta(0.25), "+0.250");
        assert_eq!(format_delta(-1.5), "-1.500");
    }

    #[test]
    fn test_pump_feeds_engine_until_channel_closes() {
        let shadow = ShadowConfig { start_finish: GeoPoint { lat: 47.0, lon: 8.0 }, ..ShadowConfig::default() };
        let session = Session::new(shadow, 5);
        let (tx, rx) = channel();
        let pump = session.spawn_pump(rx);
        for i in 0..20 {
            tx.send(frame(i + 1, i as f64 * 2.5)).unwrap();
        }
        drop(tx);
        pump.join().unwrap();

        let engine = session.engine();
        let e = engine.lock();
        assert!(e.state().current_lap_id.is_some());
        assert!((e.state().distance_m - 47.5).abs() < 0.1);
    }

    #[test]
    fn test_decoder_records_raw_messages() {
        let path = std::env::temp_dir().join(format!("session-{}.log", uuid::Uuid::new_v4().simple()));
        let mut d = SessionDecoder::new(Normalizer::new(), Some(CaptureWriter::create(&path).unwrap()));
        assert!(d.decode(r#"{"lat":47.1,"lon":8.2}"#).is_some());
        assert!(d.decode("garbage").is_none());
        d.reset();
        assert_eq!(d.decode(r#"{"lat":47.1,"lon":8.2}"#).unwrap().seq, 1);
        drop(d);

        let lines = iox::load_capture(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "garbage");
    }
}
