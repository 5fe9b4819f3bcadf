use anyhow::Context;
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Display;
use tokio::time::{self, Duration};
use delta_ingest_core::*;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SseConfig {
    pub connect_timeout_ms: u64,
    /// A stream silent for this long is treated as dropped. 0 disables.
    pub idle_timeout_ms: u64,
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            idle_timeout_ms: 15_000,
            user_agent: concat!("delta-shadow/", env!("CARGO_PKG_VERSION")).into(),
            headers: BTreeMap::new(),
        }
    }
}

/// Server-sent events over HTTP; every `data` event is one wire message.
pub struct SseTransport {
    cfg: SseConfig,
    client: reqwest::Client,
}

impl SseTransport {
    pub fn new(cfg: SseConfig) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .user_agent(cfg.user_agent.clone())
            .build()
            .context("build http client")?;
        Ok(Self { cfg, client })
    }
}

#[async_trait::async_trait]
impl MessageTransport for SseTransport {
    async fn connect(&self, endpoint: &str) -> Result<MessageStream, IngestError> {
        let mut req = self.client.get(endpoint).header("Accept", "text/event-stream");
        for (k, v) in &self.cfg.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| IngestError::Transport(format!("connect {endpoint}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(IngestError::Transport(format!("{endpoint} answered {status}")));
        }
        tracing::debug!(endpoint, %status, "event stream open");

        let idle = (self.cfg.idle_timeout_ms > 0).then(|| Duration::from_millis(self.cfg.idle_timeout_ms));
        Ok(event_stream(resp.bytes_stream(), idle))
    }
}

/// Decodes a raw byte stream into event payloads. Read errors and idle
/// timeouts surface as a single `Err` item.
pub fn event_stream<S, E>(bytes: S, idle: Option<Duration>) -> MessageStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = (bytes.boxed(), SseDecoder::new(), VecDeque::new(), false);
    stream::unfold(state, move |(mut bytes, mut dec, mut ready, failed)| async move {
        if failed {
            return None;
        }
        loop {
            if let Some(ev) = ready.pop_front() {
                return Some((Ok(ev), (bytes, dec, ready, false)));
            }
            let next = match idle {
                Some(limit) => match time::timeout(limit, bytes.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        let err = IngestError::Transport(format!("no data for {} ms", limit.as_millis()));
                        return Some((Err(err), (bytes, dec, ready, true)));
                    }
                },
                None => bytes.next().await,
            };
            match next {
                Some(Ok(chunk)) => ready.extend(dec.feed(&chunk)),
                Some(Err(e)) => {
                    let err = IngestError::Transport(e.to_string());
                    return Some((Err(err), (bytes, dec, ready, true)));
                }
                None => return None,
            }
        }
    })
    .boxed()
}

/// Incremental `text/event-stream` parser. Only `data` fields are kept;
/// multi-line data is joined with `\n`. An event still open when the
/// stream ends is discarded.
#[derive(Default, Debug)]
pub struct SseDecoder {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            if let Some(ev) = self.line(line.trim_end_matches(['\n', '\r'])) {
                out.push(ev);
            }
        }
        out
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.data.clear();
    }

    fn line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let ev = self.data.join("\n");
            self.data.clear();
            return Some(ev);
        }
        if line.starts_with(':') {
            return None; // keep-alive comment
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }
}
