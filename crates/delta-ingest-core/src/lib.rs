//! Stream connection management: transports, decoders and the reconnecting
//! connection state machine used by Delta.

use serde::{Deserialize, Serialize};

pub mod backoff;
pub mod connection;

pub use backoff::Backoff;
pub use connection::ConnectionManager;
pub use model::{ConnectionState, Subscription, TelemetryFrame};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("stream closed by remote")]
    Closed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Raw message text as delivered by a transport, one item per wire message.
pub type MessageStream = futures::stream::BoxStream<'static, Result<String, IngestError>>;

/// Trait for any push source the connection manager can subscribe to
#[async_trait::async_trait]
pub trait MessageTransport: Send + Sync + 'static {
    /// Open a subscription. `Ok` means the transport is open; the stream ends
    /// when the remote closes and yields `Err` on transport failure.
    async fn connect(&self, endpoint: &str) -> Result<MessageStream, IngestError>;

    /// Finite sources (offline replay) go idle when their stream ends instead
    /// of scheduling a reconnect.
    fn is_finite(&self) -> bool {
        false
    }
}

/// Turns raw message text into frames. Implementations own their sequence
/// numbering, which `reset` restarts.
pub trait FrameDecoder: Send + 'static {
    fn decode(&mut self, raw: &str) -> Option<TelemetryFrame>;
    fn reset(&mut self);
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Consecutive reconnect attempts before giving up.
    pub retry_budget: u32,
    pub backoff_seed_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { retry_budget: 10, backoff_seed_ms: 1_000, backoff_cap_ms: 30_000 }
    }
}

pub type FrameTx = crossbeam_channel::Sender<TelemetryFrame>;
pub type FrameRx = crossbeam_channel::Receiver<TelemetryFrame>;

pub fn channel() -> (FrameTx, FrameRx) {
    crossbeam_channel::unbounded()
}
