//! Reconnecting subscription to a single push source.
//!
//! `idle → connecting → live ⇄ paused`; transport failures go through
//! `recovering` back to `connecting` with Fibonacci backoff until the retry
//! budget runs out. The exhausted manager passes through `recovering` once
//! more and parks in `dead`.
//!
//! State listeners are notified in transition order. One registered through
//! `on_state_change` sees the current state first and then every later
//! transition.
//!
//! Each `connect` starts a new generation backed by one tokio task that owns
//! both the open stream and the pending retry timer. Tearing down aborts that
//! task, and the generation counter stops an aborted task from touching state.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::task::JoinHandle;

use crate::{Backoff, ConnectionConfig, FrameDecoder, MessageTransport};
use model::{ConnectionState, Listeners, Subscription, TelemetryFrame};

pub struct ConnectionManager<T, D> {
    shared: Arc<Shared<T, D>>,
}

impl<T, D> Clone for ConnectionManager<T, D> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

struct Shared<T, D> {
    transport: T,
    config: ConnectionConfig,
    inner: Mutex<Inner<D>>,
    /// Held from a state change until its listeners return.
    dispatch: ReentrantMutex<()>,
    frames: Listeners<TelemetryFrame>,
    states: Listeners<ConnectionState>,
}

struct Inner<D> {
    state: ConnectionState,
    endpoint: Option<String>,
    generation: u64,
    retries: u32,
    backoff: Backoff,
    decoder: D,
    task: Option<JoinHandle<()>>,
}

impl<D> Inner<D> {
    fn teardown(&mut self) {
        self.generation += 1;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum Outcome {
    Stop,
    Retry,
}

impl<T: MessageTransport, D: FrameDecoder> ConnectionManager<T, D> {
    pub fn new(transport: T, decoder: D, config: ConnectionConfig) -> Self {
        let backoff = Backoff::from_millis(config.backoff_seed_ms, config.backoff_cap_ms);
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Idle,
                    endpoint: None,
                    generation: 0,
                    retries: 0,
                    backoff,
                    decoder,
                    task: None,
                }),
                dispatch: ReentrantMutex::new(()),
                frames: Listeners::new(),
                states: Listeners::new(),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    pub fn endpoint(&self) -> Option<String> {
        self.shared.inner.lock().endpoint.clone()
    }

    /// (Re)establish the subscription. Must be called inside a tokio runtime.
    /// A no-op when already live or paused on the same endpoint.
    pub fn connect(&self, endpoint: impl Into<String>) {
        let endpoint = endpoint.into();
        let order = self.shared.dispatch.lock();
        let generation = {
            let mut inner = self.shared.inner.lock();
            let attached = matches!(inner.state, ConnectionState::Live | ConnectionState::Paused);
            if attached && inner.endpoint.as_deref() == Some(endpoint.as_str()) {
                tracing::debug!(%endpoint, "already connected, ignoring connect");
                return;
            }
            inner.teardown();
            inner.endpoint = Some(endpoint.clone());
            inner.retries = 0;
            inner.backoff.reset();
            inner.decoder.reset();
            inner.state = ConnectionState::Connecting;
            inner.generation
        };
        tracing::info!(%endpoint, "connecting");
        self.shared.states.emit(&ConnectionState::Connecting);
        drop(order);

        let task = tokio::spawn(Shared::run(self.shared.clone(), endpoint, generation));
        let mut inner = self.shared.inner.lock();
        if inner.generation == generation {
            inner.task = Some(task);
        } else {
            task.abort();
        }
    }

    /// Tear down any open stream or pending retry and return to `idle`.
    pub fn disconnect(&self) {
        let _order = self.shared.dispatch.lock();
        let changed = {
            let mut inner = self.shared.inner.lock();
            inner.teardown();
            inner.endpoint = None;
            inner.retries = 0;
            inner.backoff.reset();
            inner.decoder.reset();
            let changed = inner.state != ConnectionState::Idle;
            inner.state = ConnectionState::Idle;
            changed
        };
        if changed {
            tracing::info!("disconnected");
            self.shared.states.emit(&ConnectionState::Idle);
        }
    }

    /// Stop forwarding messages without closing the transport.
    pub fn pause(&self) -> bool {
        self.shared.swap(None, ConnectionState::Live, ConnectionState::Paused)
    }

    pub fn resume(&self) -> bool {
        self.shared.swap(None, ConnectionState::Paused, ConnectionState::Live)
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&TelemetryFrame) + Send + Sync + 'static,
    {
        self.shared.frames.subscribe(listener)
    }

    /// Registers a state listener and immediately replays the current state to
    /// it. Transitions wait until the replay returns.
    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let _order = self.shared.dispatch.lock();
        let listener = Arc::new(listener);
        let sub = {
            let listener = listener.clone();
            self.shared.states.subscribe(move |s| listener(s))
        };
        listener(&self.state());
        sub
    }
}

impl<T: MessageTransport, D: FrameDecoder> Shared<T, D> {
    /// Move `from → to` if the state is still `from` (and the generation is
    /// still current when given). Listeners are notified outside the lock.
    fn swap(&self, generation: Option<u64>, from: ConnectionState, to: ConnectionState) -> bool {
        let _order = self.dispatch.lock();
        {
            let mut inner = self.inner.lock();
            if generation.is_some_and(|g| g != inner.generation) || inner.state != from {
                return false;
            }
            inner.state = to;
        }
        tracing::info!(from = %from, to = %to, "connection state changed");
        self.states.emit(&to);
        true
    }

    fn set(&self, generation: u64, to: ConnectionState) -> bool {
        let _order = self.dispatch.lock();
        let from = {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return false;
            }
            let from = inner.state;
            inner.state = to;
            from
        };
        if from != to {
            tracing::info!(from = %from, to = %to, "connection state changed");
            self.states.emit(&to);
        }
        true
    }

    fn forward(&self, generation: u64, raw: &str) {
        let frame = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state != ConnectionState::Live {
                return;
            }
            inner.decoder.decode(raw)
        };
        if let Some(frame) = frame {
            self.frames.emit(&frame);
        }
    }

    async fn run(self: Arc<Self>, endpoint: String, generation: u64) {
        loop {
            match self.attempt(&endpoint, generation).await {
                Outcome::Stop => return,
                Outcome::Retry => {}
            }

            let delay = {
                let mut inner = self.inner.lock();
                if inner.generation != generation {
                    return;
                }
                if inner.retries >= self.config.retry_budget {
                    None
                } else {
                    inner.retries += 1;
                    Some((inner.retries, inner.backoff.next_delay()))
                }
            };
            let Some((attempt, delay)) = delay else {
                tracing::error!(%endpoint, budget = self.config.retry_budget, "retry budget exhausted");
                if self.set(generation, ConnectionState::Recovering) {
                    self.set(generation, ConnectionState::Dead);
                }
                return;
            };

            if !self.set(generation, ConnectionState::Recovering) {
                return;
            }
            tracing::warn!(
                %endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::time::sleep(delay).await;
            if !self.set(generation, ConnectionState::Connecting) {
                return;
            }
        }
    }

    async fn attempt(&self, endpoint: &str, generation: u64) -> Outcome {
        let mut stream = match self.transport.connect(endpoint).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, "connect failed");
                return Outcome::Retry;
            }
        };

        {
            let mut inner = self.inner.lock();
            if inner.generation != generation {
                return Outcome::Stop;
            }
            inner.retries = 0;
            inner.backoff.reset();
        }
        if !self.swap(Some(generation), ConnectionState::Connecting, ConnectionState::Live) {
            return Outcome::Stop;
        }

        while let Some(item) = stream.next().await {
            match item {
                Ok(raw) => self.forward(generation, &raw),
                Err(e) => {
                    tracing::warn!(%endpoint, error = %e, "stream failed");
                    return Outcome::Retry;
                }
            }
        }

        if self.transport.is_finite() {
            tracing::info!(%endpoint, "stream finished");
            self.set(generation, ConnectionState::Idle);
            return Outcome::Stop;
        }
        tracing::warn!(%endpoint, "stream closed by remote");
        Outcome::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IngestError, MessageStream};
    use futures::channel::mpsc;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    enum Step {
        Fail,
        Lines(Vec<&'static str>, bool),
    }

    struct ScriptTransport {
        steps: Mutex<VecDeque<Step>>,
        connects: Arc<AtomicUsize>,
        finite: bool,
    }

    impl ScriptTransport {
        fn new(steps: Vec<Step>, finite: bool) -> (Self, Arc<AtomicUsize>) {
            let connects = Arc::new(AtomicUsize::new(0));
            let t = Self { steps: Mutex::new(steps.into()), connects: connects.clone(), finite };
            (t, connects)
        }
    }

    #[async_trait::async_trait]
    impl MessageTransport for ScriptTransport {
        async fn connect(&self, _endpoint: &str) -> Result<MessageStream, IngestError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().pop_front();
            match step {
                Some(Step::Lines(lines, hold_open)) => {
                    let items = stream::iter(lines.into_iter().map(|l| Ok::<_, IngestError>(l.to_string())));
                    if hold_open {
                        Ok(items.chain(stream::pending()).boxed())
                    } else {
                        Ok(items.boxed())
                    }
                }
                Some(Step::Fail) | None => Err(IngestError::Transport("refused".into())),
            }
        }

        fn is_finite(&self) -> bool {
            self.finite
        }
    }

    struct ChannelTransport {
        rx: Mutex<Option<mpsc::UnboundedReceiver<Result<String, IngestError>>>>,
    }

    #[async_trait::async_trait]
    impl MessageTransport for ChannelTransport {
        async fn connect(&self, _endpoint: &str) -> Result<MessageStream, IngestError> {
            match self.rx.lock().take() {
                Some(rx) => Ok(rx.boxed()),
                None => Err(IngestError::Closed),
            }
        }
    }

    #[derive(Default)]
    struct CountingDecoder {
        seq: u64,
    }

    impl FrameDecoder for CountingDecoder {
        fn decode(&mut self, raw: &str) -> Option<TelemetryFrame> {
            if raw == "bad" {
                return None;
            }
            self.seq += 1;
            Some(TelemetryFrame {
                seq: self.seq,
                timestamp_ms: 0,
                lat: 0.0,
                lon: 0.0,
                altitude_m: 0.0,
                heading_deg: 0.0,
                speed_kph: 0.0,
                lateral_g: 0.0,
                longitudinal_g: 0.0,
                throttle: 0.0,
                brake: 0.0,
                steering_deg: 0.0,
                rpm: 0.0,
                gear: 0,
                accel_measured: false,
            })
        }

        fn reset(&mut self) {
            self.seq = 0;
        }
    }

    fn record_states<T: MessageTransport, D: FrameDecoder>(
        mgr: &ConnectionManager<T, D>,
    ) -> Arc<Mutex<Vec<ConnectionState>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let _ = mgr.on_state_change(move |s| l.lock().push(*s));
        log
    }

    fn record_frames<T: MessageTransport, D: FrameDecoder>(
        mgr: &ConnectionManager<T, D>,
    ) -> Arc<Mutex<Vec<u64>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let _ = mgr.subscribe(move |f| l.lock().push(f.seq));
        log
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_transport_goes_dead_after_budget() {
        let (t, connects) = ScriptTransport::new(vec![], false);
        let mgr = ConnectionManager::new(t, CountingDecoder::default(), ConnectionConfig::default());
        let states = record_states(&mgr);

        mgr.connect("http://example/stream");
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(mgr.state(), ConnectionState::Dead);
        // initial attempt plus ten retries
        assert_eq!(connects.load(Ordering::SeqCst), 11);
        let states = states.lock();
        assert_eq!(states[0], ConnectionState::Idle);
        assert_eq!(states[1], ConnectionState::Connecting);
        assert_eq!(states[2], ConnectionState::Recovering);
        assert_eq!(
            states[states.len() - 3..],
            [ConnectionState::Connecting, ConnectionState::Recovering, ConnectionState::Dead]
        );
        // ten scheduled retries, then the final give-up
        let recoveries = states.iter().filter(|s| **s == ConnectionState::Recovering).count();
        assert_eq!(recoveries, 11);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_state_listener_registered_after_connect_sees_final_idle() {
        let (t, _) = ScriptTransport::new(vec![Step::Lines(vec!["a"], false)], true);
        let mgr = ConnectionManager::new(t, CountingDecoder::default(), ConnectionConfig::default());
        mgr.connect("capture.ndjson");

        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let _states = mgr.on_state_change(move |s| {
            std::thread::sleep(Duration::from_millis(50));
            l.lock().push(*s);
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while log.lock().last() != Some(&ConnectionState::Idle) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener never saw the stream finish");

        assert_eq!(mgr.state(), ConnectionState::Idle);
        let log = log.lock();
        let full = [ConnectionState::Connecting, ConnectionState::Live, ConnectionState::Idle];
        assert!(full.ends_with(&log[..]), "unexpected sequence {:?}", *log);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delays_follow_fibonacci_and_reset_on_open() {
        let (t, connects) = ScriptTransport::new(
            vec![Step::Fail, Step::Fail, Step::Fail, Step::Lines(vec![], true)],
            false,
        );
        let mgr = ConnectionManager::new(t, CountingDecoder::default(), ConnectionConfig::default());
        let start = tokio::time::Instant::now();
        mgr.connect("http://example/stream");

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(connects.load(Ordering::SeqCst), 3);
        assert_eq!(mgr.state(), ConnectionState::Recovering);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(connects.load(Ordering::SeqCst), 4);
        assert_eq!(mgr.state(), ConnectionState::Live);
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert_eq!(mgr.shared.inner.lock().retries, 0);
        assert_eq!(mgr.shared.inner.lock().backoff.peek(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_forwarded_and_bad_lines_dropped() {
        let (t, _) = ScriptTransport::new(vec![Step::Lines(vec!["a", "bad", "b", "c"], true)], false);
        let mgr = ConnectionManager::new(t, CountingDecoder::default(), ConnectionConfig::default());
        let frames = record_frames(&mgr);

        mgr.connect("http://example/stream");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(mgr.state(), ConnectionState::Live);
        assert_eq!(*frames.lock(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_drops_messages_without_closing() {
        let (tx, rx) = mpsc::unbounded();
        let t = ChannelTransport { rx: Mutex::new(Some(rx)) };
        let mgr = ConnectionManager::new(t, CountingDecoder::default(), ConnectionConfig::default());
        let frames = record_frames(&mgr);

        mgr.connect("sse://local");
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.unbounded_send(Ok("a".into())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(mgr.pause());
        assert!(!mgr.pause());
        tx.unbounded_send(Ok("b".into())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mgr.state(), ConnectionState::Paused);

        assert!(mgr.resume());
        tx.unbounded_send(Ok("c".into())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*frames.lock(), vec![1, 2]);
        assert_eq!(mgr.state(), ConnectionState::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_same_live_endpoint_is_noop() {
        let (t, connects) = ScriptTransport::new(vec![Step::Lines(vec![], true)], false);
        let mgr = ConnectionManager::new(t, CountingDecoder::default(), ConnectionConfig::default());

        mgr.connect("http://example/stream");
        tokio::time::sleep(Duration::from_millis(10)).await;
        mgr.connect("http://example/stream");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.state(), ConnectionState::Live);
        assert_eq!(mgr.endpoint().as_deref(), Some("http://example/stream"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let (t, connects) = ScriptTransport::new(vec![], false);
        let mgr = ConnectionManager::new(t, CountingDecoder::default(), ConnectionConfig::default());
        let states = record_states(&mgr);

        mgr.connect("http://example/stream");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mgr.state(), ConnectionState::Recovering);

        mgr.disconnect();
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.state(), ConnectionState::Idle);
        assert_eq!(*states.lock().last().unwrap(), ConnectionState::Idle);
        assert!(mgr.endpoint().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_triggers_recovery() {
        let (t, connects) = ScriptTransport::new(
            vec![Step::Lines(vec!["a"], false), Step::Lines(vec!["b"], true)],
            false,
        );
        let mgr = ConnectionManager::new(t, CountingDecoder::default(), ConnectionConfig::default());
        let frames = record_frames(&mgr);
        let states = record_states(&mgr);

        mgr.connect("http://example/stream");
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(mgr.state(), ConnectionState::Live);
        // a reconnect keeps the same logical subscription, so numbering continues
        assert_eq!(*frames.lock(), vec![1, 2]);
        assert!(states.lock().contains(&ConnectionState::Recovering));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finite_transport_returns_to_idle() {
        let (t, connects) = ScriptTransport::new(vec![Step::Lines(vec!["a", "b"], false)], true);
        let mgr = ConnectionManager::new(t, CountingDecoder::default(), ConnectionConfig::default());
        let frames = record_frames(&mgr);

        mgr.connect("capture.ndjson");
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.state(), ConnectionState::Idle);
        assert_eq!(*frames.lock(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_to_new_endpoint_restarts_numbering() {
        let (t, connects) = ScriptTransport::new(
            vec![Step::Lines(vec!["a", "b"], true), Step::Lines(vec!["c"], true)],
            false,
        );
        let mgr = ConnectionManager::new(t, CountingDecoder::default(), ConnectionConfig::default());
        let frames = record_frames(&mgr);

        mgr.connect("http://one/stream");
        tokio::time::sleep(Duration::from_millis(10)).await;
        mgr.connect("http://two/stream");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(*frames.lock(), vec![1, 2, 1]);
        assert_eq!(mgr.endpoint().as_deref(), Some("http://two/stream"));
    }
}
