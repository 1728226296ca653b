//! Connection manager: owns a pool of streaming links, the outbound queue,
//! and the subscription registry wiring.
//!
//! Each link runs as its own tokio task. A link that drops reconnects with
//! exponential backoff (base * 2^(attempt-1), capped); after
//! `max_reconnect_attempts` consecutive failures the link gives up, and when
//! the last link gives up a fatal `connection:error` envelope is dispatched
//! and the manager returns to `Disconnected`. Outbound messages are queued
//! while no link is up and flushed in FIFO order once one is. Ordering is
//! guaranteed per link only; with a pool larger than one, messages drained
//! by different links may arrive interleaved.

use crate::config::LinkConfig;
use crate::connection::transport::{Frame, FrameStream, StreamConnector};
use crate::envelope::{Codec, Envelope, MessageIdGen, TOPIC_ERROR, TOPIC_HEARTBEAT, TOPIC_STATUS};
use crate::queue::OutboundQueue;
use crate::registry::SubscriptionRegistry;
use crate::telemetry::{ConnectionEvent, MetricsSink};
use crate::{MeshError, Result, TokenProvider};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle state of the manager as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    /// Legal moves of the lifecycle machine. Everything else is ignored
    /// (and logged) rather than applied.
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Disconnected, Closed)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Closed)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
                | (Reconnecting, Closed)
                | (Closed, Connecting)
        )
    }
}

struct Shared {
    config: LinkConfig,
    connector: Arc<dyn StreamConnector>,
    tokens: Arc<dyn TokenProvider>,
    registry: Arc<SubscriptionRegistry>,
    queue: OutboundQueue,
    codec: Codec,
    ids: MessageIdGen,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<ConnectionState>,
    /// Number of links currently up; watched by `connect()`.
    live: watch::Sender<usize>,
    active_tasks: AtomicUsize,
}

impl Shared {
    fn set_state(&self, to: ConnectionState) {
        let mut state = self.state.lock();
        if state.can_transition(to) {
            debug!(from = ?*state, to = ?to, "connection state change");
            *state = to;
        } else if *state != to {
            warn!(from = ?*state, to = ?to, "ignoring invalid connection state change");
        }
    }

    fn next_envelope(&self, topic: &str, payload: serde_json::Value) -> Envelope {
        let (id, _) = self.ids.next();
        Envelope::new(topic, payload, id)
    }

    /// Dispatch a locally generated status envelope to subscribers.
    fn emit_status(&self, connected: bool) {
        let envelope = self.next_envelope(TOPIC_STATUS, json!({ "connected": connected }));
        self.registry.dispatch(&envelope);
    }

    fn emit_error(&self, code: &str, message: String) {
        let envelope = self.next_envelope(TOPIC_ERROR, json!({ "code": code, "message": message }));
        self.registry.dispatch(&envelope);
    }

    fn handle_inbound(&self, text: &str) {
        match self.codec.decode(text) {
            Ok(envelope) => {
                self.registry.dispatch(&envelope);
            }
            Err(e) => {
                warn!(error = %e, "dropping undecodable inbound frame");
                self.emit_error("DECODE_ERROR", e.to_string());
            }
        }
    }
}

/// Owns the link pool and the outbound queue.
///
/// Constructed with its collaborators injected so embedders (and tests) can
/// swap the connector, token source, registry, and metrics sink.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        config: LinkConfig,
        connector: Arc<dyn StreamConnector>,
        tokens: Arc<dyn TokenProvider>,
        registry: Arc<SubscriptionRegistry>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let queue = OutboundQueue::new(config.message_queue_size);
        let codec = Codec::new(config.use_compression, config.max_message_size);
        let (live, _) = watch::channel(0usize);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                tokens,
                registry,
                queue,
                codec,
                ids: MessageIdGen::new(),
                metrics,
                state: Mutex::new(ConnectionState::Disconnected),
                live,
                active_tasks: AtomicUsize::new(0),
            }),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of links currently established.
    pub fn live_links(&self) -> usize {
        *self.shared.live.borrow()
    }

    pub fn queued_messages(&self) -> usize {
        self.shared.queue.len()
    }

    /// Spawn the link pool and wait until at least one link is up.
    ///
    /// Returns `Err(Connection)` if no link establishes within
    /// `connection_timeout`; the pool keeps retrying in the background.
    pub async fn connect(&self) -> Result<()> {
        // Check and transition under one guard; concurrent callers must not
        // each spawn a pool.
        let spawn = {
            let mut state = self.shared.state.lock();
            match *state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Reconnecting => false,
                from @ (ConnectionState::Disconnected | ConnectionState::Closed) => {
                    debug!(from = ?from, to = ?ConnectionState::Connecting, "connection state change");
                    *state = ConnectionState::Connecting;
                    true
                }
            }
        };

        if spawn {
            let cancel = CancellationToken::new();
            *self.cancel.lock() = cancel.clone();
            let pool = self.shared.config.connection_pool_size.max(1);
            self.shared.active_tasks.store(pool, Ordering::SeqCst);
            let mut tasks = self.tasks.lock();
            for link_id in 0..pool {
                let shared = Arc::clone(&self.shared);
                let cancel = cancel.clone();
                tasks.push(tokio::spawn(run_link(shared, link_id, cancel)));
            }
        }

        let mut live = self.shared.live.subscribe();
        let deadline = Instant::now() + self.shared.config.connection_timeout;
        loop {
            if *live.borrow_and_update() > 0 {
                return Ok(());
            }
            tokio::select! {
                changed = live.changed() => {
                    if changed.is_err() {
                        return Err(MeshError::Connection("connection manager shut down".into()));
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(MeshError::Connection(format!(
                        "no link established within {:?}",
                        self.shared.config.connection_timeout
                    )));
                }
            }
        }
    }

    /// Tear down every link, drop queued messages and subscriptions, and
    /// move to `Closed`. Only a fresh `connect()` revives the manager.
    pub async fn disconnect(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.cancel.lock().cancel();
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        // Closing straight from Connecting is not a legal move; pass
        // through Disconnected first.
        if self.state() == ConnectionState::Connecting {
            self.shared.set_state(ConnectionState::Disconnected);
        }
        self.shared.set_state(ConnectionState::Closed);
        self.shared.emit_status(false);

        let dropped = self.shared.queue.clear();
        if dropped > 0 {
            debug!(dropped, "dropped queued messages on disconnect");
        }
        self.shared.registry.clear();
    }

    /// Queue an envelope for delivery, returning its id.
    ///
    /// Succeeds in every state except `Closed`; while no link is up the
    /// envelope waits in the queue. Fails with `QueueFull` when the queue
    /// is at capacity.
    pub fn send(&self, topic: impl Into<String>, payload: serde_json::Value) -> Result<String> {
        self.send_with_priority(topic, payload, 0)
    }

    pub fn send_with_priority(
        &self,
        topic: impl Into<String>,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<String> {
        if self.state() == ConnectionState::Closed {
            return Err(MeshError::Connection(
                "connection manager is closed; call connect() first".into(),
            ));
        }
        let envelope = self
            .shared
            .next_envelope(&topic.into(), payload)
            .with_priority(priority);
        let id = envelope.id.clone();
        self.shared.queue.try_enqueue(envelope)?;
        Ok(id)
    }
}

/// Backoff before reconnect attempt `attempt` (1-based): base * 2^(attempt-1),
/// capped at `max_reconnect_delay`.
pub(crate) fn reconnect_delay(config: &LinkConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let delay = config
        .reconnect_interval
        .saturating_mul(2u32.saturating_pow(exp));
    delay.min(config.max_reconnect_delay)
}

/// One link of the pool: establish, drive until the stream drops, back off,
/// repeat. Exits on cancellation or when reconnect attempts are exhausted.
async fn run_link(shared: Arc<Shared>, link_id: usize, cancel: CancellationToken) {
    // 0 while the current establish attempt follows a healthy session,
    // 1.. counts consecutive failures.
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if attempt > 0 {
            let delay = reconnect_delay(&shared.config, attempt);
            shared
                .metrics
                .record_connection(&ConnectionEvent::ReconnectScheduled {
                    connection_id: link_id,
                    attempt,
                    delay,
                });
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match establish(&shared, &cancel).await {
            Ok(stream) => {
                attempt = 0;
                link_up(&shared, link_id);
                let reason = drive_link(&shared, link_id, stream, &cancel).await;
                link_down(&shared, link_id, reason, &cancel);
                if cancel.is_cancelled() {
                    break;
                }
                attempt = 1;
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    break;
                }
                debug!(link_id, attempt, error = %e, "link establish failed");
                attempt += 1;
                if attempt > shared.config.max_reconnect_attempts {
                    shared
                        .metrics
                        .record_connection(&ConnectionEvent::ReconnectExhausted {
                            connection_id: link_id,
                            attempts: attempt - 1,
                        });
                    link_exhausted(&shared, link_id, e);
                    break;
                }
            }
        }
    }
    task_finished(&shared, cancel.is_cancelled());
}

async fn establish(shared: &Shared, cancel: &CancellationToken) -> Result<Box<dyn FrameStream>> {
    let token = shared.tokens.token().await?;
    let connect = shared.connector.connect(token.as_deref());
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MeshError::Cancelled),
        outcome = tokio::time::timeout(shared.config.connection_timeout, connect) => {
            match outcome {
                Ok(result) => result,
                Err(_) => Err(MeshError::Timeout(format!(
                    "connect timed out after {:?}",
                    shared.config.connection_timeout
                ))),
            }
        }
    }
}

fn link_up(shared: &Shared, link_id: usize) {
    let mut first = false;
    shared.live.send_modify(|n| {
        first = *n == 0;
        *n += 1;
    });
    shared
        .metrics
        .record_connection(&ConnectionEvent::Connected { connection_id: link_id });
    if first {
        shared.set_state(ConnectionState::Connected);
        shared.emit_status(true);
    }
}

fn link_down(shared: &Shared, link_id: usize, reason: String, cancel: &CancellationToken) {
    let mut last = false;
    shared.live.send_modify(|n| {
        *n = n.saturating_sub(1);
        last = *n == 0;
    });
    shared
        .metrics
        .record_connection(&ConnectionEvent::Disconnected {
            connection_id: link_id,
            reason,
        });
    if last && !cancel.is_cancelled() {
        shared.set_state(ConnectionState::Reconnecting);
        shared.emit_status(false);
    }
}

fn link_exhausted(shared: &Shared, link_id: usize, last_error: MeshError) {
    warn!(link_id, error = %last_error, "link gave up reconnecting");
}

fn task_finished(shared: &Shared, cancelled: bool) {
    let remaining = shared.active_tasks.fetch_sub(1, Ordering::SeqCst) - 1;
    if remaining == 0 && !cancelled {
        // Every link exhausted its reconnect budget.
        shared.set_state(ConnectionState::Disconnected);
        shared.emit_error(
            "RECONNECT_EXHAUSTED",
            "all reconnect attempts exhausted; call connect() to retry".into(),
        );
    }
}

/// Pump one established stream until it drops. Returns the reason the
/// session ended.
async fn drive_link(
    shared: &Shared,
    link_id: usize,
    mut stream: Box<dyn FrameStream>,
    cancel: &CancellationToken,
) -> String {
    let heartbeat = shared.config.heartbeat_interval;
    let mut heartbeat_at = Instant::now() + heartbeat;
    let mut last_traffic = Instant::now();

    loop {
        // Flush everything queued before blocking on the next event.
        while let Some(envelope) = shared.queue.dequeue() {
            match shared.codec.encode(&envelope) {
                Ok(text) => {
                    if let Err(e) = stream.send(Frame::Text(text)).await {
                        shared.queue.requeue_front(envelope);
                        return format!("send failed: {}", e);
                    }
                }
                Err(e) => {
                    warn!(link_id, id = %envelope.id, error = %e, "dropping unencodable outbound message");
                }
            }
        }

        let liveness_at = last_traffic + heartbeat * 2;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stream.close().await;
                return "client disconnect".into();
            }
            _ = tokio::time::sleep_until(liveness_at) => {
                shared
                    .metrics
                    .record_connection(&ConnectionEvent::HeartbeatMissed { connection_id: link_id });
                return "no traffic within two heartbeat intervals".into();
            }
            _ = tokio::time::sleep_until(heartbeat_at) => {
                let envelope = shared.next_envelope(TOPIC_HEARTBEAT, json!({ "sentAt": now_ms() }));
                match shared.codec.encode(&envelope) {
                    Ok(text) => {
                        if let Err(e) = stream.send(Frame::Text(text)).await {
                            return format!("heartbeat send failed: {}", e);
                        }
                    }
                    Err(e) => warn!(link_id, error = %e, "failed to encode heartbeat"),
                }
                heartbeat_at = Instant::now() + heartbeat;
            }
            _ = shared.queue.wait_for_message() => {}
            frame = stream.next_frame() => {
                last_traffic = Instant::now();
                match frame {
                    Some(Ok(Frame::Text(text))) => shared.handle_inbound(&text),
                    Some(Ok(Frame::Ping)) => {
                        if let Err(e) = stream.send(Frame::Pong).await {
                            return format!("pong send failed: {}", e);
                        }
                    }
                    Some(Ok(Frame::Pong)) => {}
                    Some(Ok(Frame::Close)) => return "server closed the connection".into(),
                    Some(Err(e)) => return format!("stream error: {}", e),
                    None => return "stream ended".into(),
                }
            }
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoAuth;
    use crate::telemetry::test_support::CapturingSink;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::mpsc;

    /// In-memory stream wired to a [`ServerEnd`] the test can drive.
    struct ChannelStream {
        tx: mpsc::Sender<Frame>,
        rx: mpsc::Receiver<Frame>,
    }

    #[async_trait]
    impl FrameStream for ChannelStream {
        async fn send(&mut self, frame: Frame) -> Result<()> {
            self.tx
                .send(frame)
                .await
                .map_err(|_| MeshError::Connection("peer gone".into()))
        }

        async fn next_frame(&mut self) -> Option<Result<Frame>> {
            self.rx.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.rx.close();
        }
    }

    struct ServerEnd {
        to_client: mpsc::Sender<Frame>,
        from_client: mpsc::Receiver<Frame>,
    }

    struct TestConnector {
        /// Fail this many connect calls before succeeding.
        fail_first: u32,
        always_fail: bool,
        attempts: AtomicU32,
        servers: Mutex<VecDeque<ServerEnd>>,
    }

    impl TestConnector {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail_first: 0,
                always_fail: false,
                attempts: AtomicU32::new(0),
                servers: Mutex::new(VecDeque::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail_first: 0,
                always_fail: true,
                attempts: AtomicU32::new(0),
                servers: Mutex::new(VecDeque::new()),
            })
        }

        fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }

        async fn take_server(&self) -> ServerEnd {
            tokio::time::timeout(Duration::from_secs(600), async {
                loop {
                    if let Some(server) = self.servers.lock().pop_front() {
                        return server;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("no server end appeared")
        }
    }

    #[async_trait]
    impl StreamConnector for TestConnector {
        async fn connect(&self, _token: Option<&str>) -> Result<Box<dyn FrameStream>> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.always_fail || n <= self.fail_first {
                return Err(MeshError::Connection("refused".into()));
            }
            let (c2s_tx, c2s_rx) = mpsc::channel(64);
            let (s2c_tx, s2c_rx) = mpsc::channel(64);
            self.servers.lock().push_back(ServerEnd {
                to_client: s2c_tx,
                from_client: c2s_rx,
            });
            Ok(Box::new(ChannelStream { tx: c2s_tx, rx: s2c_rx }))
        }
    }

    fn test_config() -> LinkConfig {
        LinkConfig::default().with_pool_size(1)
    }

    fn manager_with(
        config: LinkConfig,
        connector: Arc<TestConnector>,
    ) -> (ConnectionManager, Arc<SubscriptionRegistry>, Arc<CapturingSink>) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let sink = CapturingSink::new();
        let manager = ConnectionManager::new(
            config,
            connector,
            Arc::new(NoAuth),
            Arc::clone(&registry),
            sink.clone(),
        );
        (manager, registry, sink)
    }

    fn capture_topic(registry: &SubscriptionRegistry, topic: &str) -> Arc<Mutex<Vec<Envelope>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.subscribe(
            topic,
            Arc::new(move |envelope: &Envelope| {
                sink.lock().push(envelope.clone());
                Ok(())
            }),
        );
        seen
    }

    /// Receive frames until `count` non-heartbeat envelopes arrived.
    async fn recv_data(server: &mut ServerEnd, codec: &Codec, count: usize) -> Vec<Envelope> {
        let mut out = Vec::new();
        while out.len() < count {
            let frame = tokio::time::timeout(Duration::from_secs(600), server.from_client.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("client hung up");
            if let Frame::Text(text) = frame {
                let envelope = codec.decode(&text).unwrap();
                if envelope.topic != TOPIC_HEARTBEAT {
                    out.push(envelope);
                }
            }
        }
        out
    }

    async fn wait_for_state(manager: &ConnectionManager, want: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(600), async {
            while manager.state() != want {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {:?}, stuck at {:?}", want, manager.state()));
    }

    #[test]
    fn lifecycle_machine_allows_only_documented_moves() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition(Connecting));
        assert!(Connecting.can_transition(Connected));
        assert!(Connected.can_transition(Reconnecting));
        assert!(Reconnecting.can_transition(Connected));
        assert!(Connected.can_transition(Closed));
        assert!(Closed.can_transition(Connecting));

        assert!(!Connecting.can_transition(Closed));
        assert!(!Disconnected.can_transition(Connected));
        assert!(!Connected.can_transition(Connecting));
        assert!(!Closed.can_transition(Connected));
    }

    #[test]
    fn reconnect_backoff_doubles_then_caps() {
        let config = LinkConfig::default();
        let ms = |attempt| reconnect_delay(&config, attempt).as_millis();
        assert_eq!(ms(1), 1000);
        assert_eq!(ms(2), 2000);
        assert_eq!(ms(3), 4000);
        assert_eq!(ms(4), 8000);
        assert_eq!(ms(5), 16000);
        assert_eq!(ms(6), 30000);
        assert_eq!(ms(40), 30000);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_establishes_a_link_and_reports_status() {
        let connector = TestConnector::ok();
        let (manager, registry, _) = manager_with(test_config(), connector.clone());
        let statuses = capture_topic(&registry, TOPIC_STATUS);

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.live_links(), 1);
        assert_eq!(connector.attempts(), 1);

        let seen = statuses.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload, json!({ "connected": true }));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connect_calls_share_one_pool() {
        let connector = TestConnector::ok();
        let (manager, _, _) = manager_with(test_config(), connector.clone());

        let (a, b) = tokio::join!(manager.connect(), manager.connect());
        a.unwrap();
        b.unwrap();

        // The loser of the race waits on the winner's pool instead of
        // spawning (and orphaning) a second one.
        assert_eq!(connector.attempts(), 1);
        assert_eq!(manager.live_links(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);

        manager.disconnect().await;
        assert_eq!(manager.live_links(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_queued_while_disconnected_flush_fifo_on_connect() {
        let connector = TestConnector::ok();
        let (manager, _, _) = manager_with(test_config(), connector.clone());

        for n in 0..3 {
            manager.send("agent:event", json!({ "n": n })).unwrap();
        }
        assert_eq!(manager.queued_messages(), 3);

        manager.connect().await.unwrap();
        let mut server = connector.take_server().await;
        let codec = Codec::new(true, 1024 * 1024);
        let got = recv_data(&mut server, &codec, 3).await;
        for (n, envelope) in got.iter().enumerate() {
            assert_eq!(envelope.payload, json!({ "n": n }));
        }
        assert_eq!(manager.queued_messages(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_rejects_when_queue_is_full() {
        let connector = TestConnector::ok();
        let config = test_config().with_queue_size(2);
        let (manager, _, _) = manager_with(config, connector);

        manager.send("t", json!(1)).unwrap();
        manager.send("t", json!(2)).unwrap();
        let err = manager.send("t", json!(3)).unwrap_err();
        assert!(matches!(err, MeshError::QueueFull { capacity: 2 }));
        assert_eq!(manager.queued_messages(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out_when_nothing_establishes() {
        let connector = TestConnector::failing();
        let (manager, _, _) = manager_with(test_config(), connector.clone());

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, MeshError::Connection(_)));
        assert!(connector.attempts() >= 1);
        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn link_reconnects_after_server_close() {
        let connector = TestConnector::ok();
        let (manager, _, sink) = manager_with(test_config(), connector.clone());

        manager.connect().await.unwrap();
        let server = connector.take_server().await;
        drop(server);

        wait_for_state(&manager, ConnectionState::Reconnecting).await;
        // Backoff elapses under the paused clock, then a fresh link comes up.
        wait_for_state(&manager, ConnectionState::Connected).await;
        assert_eq!(connector.attempts(), 2);

        manager.send("agent:event", json!({ "after": "reconnect" })).unwrap();
        let mut server = connector.take_server().await;
        let codec = Codec::new(true, 1024 * 1024);
        let got = recv_data(&mut server, &codec, 1).await;
        assert_eq!(got[0].payload, json!({ "after": "reconnect" }));

        let events = sink.connections.lock();
        assert!(events
            .iter()
            .any(|e| matches!(e, ConnectionEvent::ReconnectScheduled { attempt: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnects_surface_a_fatal_error() {
        let connector = TestConnector::failing();
        let mut config = test_config();
        config.max_reconnect_attempts = 2;
        let (manager, registry, sink) = manager_with(config, connector.clone());
        let errors = capture_topic(&registry, TOPIC_ERROR);

        let _ = manager.connect().await;
        wait_for_state(&manager, ConnectionState::Disconnected).await;

        // Initial attempt plus two retries, then the link gives up.
        assert_eq!(connector.attempts(), 3);
        let seen = errors.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload["code"], json!("RECONNECT_EXHAUSTED"));
        assert!(sink
            .connections
            .lock()
            .iter()
            .any(|e| matches!(e, ConnectionEvent::ReconnectExhausted { attempts: 2, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_link_is_declared_dead_after_two_heartbeat_windows() {
        let connector = TestConnector::ok();
        let config = test_config().with_heartbeat_interval(Duration::from_millis(100));
        let (manager, _, sink) = manager_with(config, connector.clone());

        manager.connect().await.unwrap();
        let mut server = connector.take_server().await;

        // One outbound heartbeat arrives before the liveness window closes.
        let frame = tokio::time::timeout(Duration::from_secs(600), server.from_client.recv())
            .await
            .unwrap()
            .unwrap();
        let codec = Codec::new(true, 1024 * 1024);
        if let Frame::Text(text) = frame {
            assert_eq!(codec.decode(&text).unwrap().topic, TOPIC_HEARTBEAT);
        } else {
            panic!("expected a text frame");
        }

        // The server never talks back, so the link is torn down and replaced.
        connector.take_server().await;
        assert!(sink
            .connections
            .lock()
            .iter()
            .any(|e| matches!(e, ConnectionEvent::HeartbeatMissed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_frames_reach_subscribers() {
        let connector = TestConnector::ok();
        let (manager, registry, _) = manager_with(test_config(), connector.clone());
        let seen = capture_topic(&registry, "agent:update");
        let errors = capture_topic(&registry, TOPIC_ERROR);

        manager.connect().await.unwrap();
        let server = connector.take_server().await;

        let codec = Codec::new(true, 1024 * 1024);
        let envelope = Envelope::new("agent:update", json!({ "status": "busy" }), "s-1".into());
        server
            .to_client
            .send(Frame::Text(codec.encode(&envelope).unwrap()))
            .await
            .unwrap();
        server
            .to_client
            .send(Frame::Text("{garbage".into()))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(600), async {
            while errors.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].payload, json!({ "status": "busy" }));
        assert_eq!(errors.lock()[0].payload["code"], json!("DECODE_ERROR"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_and_drops_queued_messages() {
        let connector = TestConnector::ok();
        let (manager, registry, _) = manager_with(test_config(), connector);

        manager.send("t", json!(1)).unwrap();
        manager.send("t", json!(2)).unwrap();
        registry.subscribe("t", Arc::new(|_: &Envelope| Ok(())));

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.queued_messages(), 0);
        assert_eq!(registry.subscriber_count("t"), 0);

        let err = manager.send("t", json!(3)).unwrap_err();
        assert!(matches!(err, MeshError::Connection(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_connected_then_reconnect() {
        let connector = TestConnector::ok();
        let (manager, _, _) = manager_with(test_config(), connector.clone());

        manager.connect().await.unwrap();
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.live_links(), 0);

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
    }
}
