use anyhow::Context;
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::{path::Path, sync::Arc};
use tokio::time::{self, Duration};
use delta_ingest_core::*;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReplayConfig {
    /// Delay between messages; 100 ms plays a 10 Hz capture in real time.
    pub interval_ms: u64,
    pub loop_playback: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { interval_ms: 100, loop_playback: false }
    }
}

/// Plays a capture file back as a message stream. The endpoint is a file
/// path, optionally prefixed with `file://`.
pub struct ReplayTransport { cfg: ReplayConfig }
impl ReplayTransport { pub fn new(cfg: ReplayConfig) -> Self { Self { cfg } } }

#[async_trait::async_trait]
impl MessageTransport for ReplayTransport {
    async fn connect(&self, endpoint: &str) -> Result<MessageStream, IngestError> {
        let path = endpoint.strip_prefix("file://").unwrap_or(endpoint);
        let lines = iox::load_capture(Path::new(path))
            .with_context(|| format!("replay {}", path))?;
        tracing::info!(path, messages = lines.len(), looping = self.cfg.loop_playback, "replay open");
        Ok(paced(lines, &self.cfg))
    }

    fn is_finite(&self) -> bool {
        !self.cfg.loop_playback
    }
}

/// Emits `lines` one per tick, the first immediately.
pub fn paced(lines: Vec<String>, cfg: &ReplayConfig) -> MessageStream {
    let mut interval = time::interval(Duration::from_millis(cfg.interval_ms.max(1)));
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let looping = cfg.loop_playback && !lines.is_empty();
    let lines = Arc::new(lines);

    stream::unfold((interval, 0usize), move |(mut interval, mut idx)| {
        let lines = lines.clone();
        async move {
            if idx == lines.len() {
                if !looping {
                    return None;
                }
                idx = 0;
            }
            interval.tick().await;
            let line = lines[idx].clone();
            Some((Ok(line), (interval, idx + 1)))
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn capture(lines: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("replay-{}.log", uuid::Uuid::new_v4().simple()));
        std::fs::write(&path, lines).unwrap();
        path
    }

    #[tokio::test(start_paused = true)]
    async fn test_paces_messages() {
        let start = Instant::now();
        let cfg = ReplayConfig { interval_ms: 100, loop_playback: false };
        let mut s = paced(vec!["a".into(), "b".into(), "c".into()], &cfg);
        let mut at = Vec::new();
        while let Some(item) = s.next().await {
            at.push((item.unwrap(), start.elapsed().as_millis()));
        }
        assert_eq!(at, vec![("a".into(), 0), ("b".into(), 100), ("c".into(), 200)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_when_enabled() {
        let cfg = ReplayConfig { interval_ms: 10, loop_playback: true };
        let s = paced(vec!["a".into(), "b".into()], &cfg);
        let got: Vec<String> = s.take(5).map(|r| r.unwrap()).collect().await;
        assert_eq!(got, vec!["a", "b", "a", "b", "a"]);

        let empty: Vec<_> = paced(Vec::new(), &cfg).collect().await;
        assert!(empty.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reads_capture_file() {
        let path = capture("# header\n{\"lat\":47.1,\"lon\":8.2}\n\n1714564800,47.1,8.2,0,1,0,0,3\n");
        let t = ReplayTransport::new(ReplayConfig::default());
        assert!(t.is_finite());
        let endpoint = format!("file://{}", path.display());
        let got: Vec<String> = t.connect(&endpoint).await.unwrap().map(|r| r.unwrap()).collect().await;
        std::fs::remove_file(&path).ok();
        assert_eq!(got.len(), 2);
        assert!(got[0].starts_with('{'));
    }

    #[tokio::test]
    async fn test_connect_missing_file_fails() {
        let t = ReplayTransport::new(ReplayConfig { interval_ms: 10, loop_playback: true });
        assert!(!t.is_finite());
        let err = t.connect("/nonexistent/delta/capture.log").await.err().unwrap();
        assert!(err.to_string().contains("replay"));
    }
}
