//! Broker session lifecycle and request dispatch.
//!
//! One I/O task owns the socket transport: it forwards outbound frames,
//! routes inbound frames to per-request response streams, sends
//! keepalives, and drives reconnects. State transitions:
//!
//! DISCONNECTED -> CONNECTING -> HANDSHAKING -> READY -> (DEGRADED | READY)
//!              -> DISCONNECTING -> DISCONNECTED
//!
//! Reconnects reuse the same client id with exponential backoff. A
//! failed post-connect account probe keeps the session out of READY.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::wire::{
    classify_error, ClientFrame, ContractSpec, ErrorClass, ServerFrame, WireBar,
};
use crate::config::BrokerConfig;
use crate::error::ErrorKind;
use crate::models::Timeframe;

// =============================================================================
// TRANSPORT
// =============================================================================

/// One duplex framed connection to the gateway.
pub trait BrokerTransport: Send + 'static {
    fn send(&mut self, frame: ClientFrame) -> impl Future<Output = anyhow::Result<()>> + Send;
    /// `Ok(None)` means the peer closed the connection cleanly.
    fn recv(&mut self) -> impl Future<Output = anyhow::Result<Option<ServerFrame>>> + Send;
}

/// Creates transports; called again on every reconnect attempt.
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: BrokerTransport;
    fn connect(&self) -> impl Future<Output = anyhow::Result<Self::Transport>> + Send;
}

/// Production transport over TCP.
pub struct TcpTransport {
    stream: tokio::net::TcpStream,
}

impl BrokerTransport for TcpTransport {
    async fn send(&mut self, frame: ClientFrame) -> anyhow::Result<()> {
        super::wire::write_frame(&mut self.stream, &frame).await?;
        Ok(())
    }

    async fn recv(&mut self) -> anyhow::Result<Option<ServerFrame>> {
        Ok(super::wire::read_frame(&mut self.stream).await?)
    }
}

/// Connects `TcpTransport`s to a host:port endpoint.
pub struct TcpFactory {
    endpoint: String,
}

impl TcpFactory {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into() }
    }
}

impl TransportFactory for TcpFactory {
    type Transport = TcpTransport;

    async fn connect(&self) -> anyhow::Result<TcpTransport> {
        let stream = tokio::net::TcpStream::connect(&self.endpoint).await?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport { stream })
    }
}

// =============================================================================
// STATE & ERRORS
// =============================================================================

/// Session state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Degraded,
    Disconnecting,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Handshaking => "HANDSHAKING",
            SessionState::Ready => "READY",
            SessionState::Degraded => "DEGRADED",
            SessionState::Disconnecting => "DISCONNECTING",
        };
        f.write_str(s)
    }
}

/// Failures surfaced to the rate governor, which owns retry policy.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("timed out waiting for response terminator")]
    Timeout,
    #[error("session not ready ({0})")]
    NotReady(String),
    #[error("broker back-pressure: {0}")]
    Throttled(String),
    #[error("transient broker failure: {0}")]
    Transient(String),
    #[error("fatal broker failure: {0}")]
    Fatal(String),
    #[error("request cancelled")]
    Cancelled,
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout
                | BrokerError::NotReady(_)
                | BrokerError::Throttled(_)
                | BrokerError::Transient(_)
        )
    }

    pub fn from_wire(code: u32, message: &str) -> Self {
        match classify_error(code) {
            ErrorClass::Throttled => BrokerError::Throttled(format!("{code}: {message}")),
            ErrorClass::Transient => BrokerError::Transient(format!("{code}: {message}")),
            ErrorClass::Fatal => BrokerError::Fatal(format!("{code}: {message}")),
        }
    }
}

// =============================================================================
// REQUESTS & RESPONSE STREAMS
// =============================================================================

/// Requests the session knows how to put on the wire.
#[derive(Debug, Clone)]
pub enum BrokerRequest {
    HistoricalBars {
        contract: ContractSpec,
        timeframe: Timeframe,
        range_start: chrono::DateTime<chrono::Utc>,
        range_end: chrono::DateTime<chrono::Utc>,
    },
    SubscribeMarketData {
        contract: ContractSpec,
    },
    AccountInfo,
}

/// Ordered frames for one request, ending with the terminator.
pub struct ResponseStream {
    pub request_id: u64,
    rx: mpsc::Receiver<ServerFrame>,
}

impl ResponseStream {
    pub async fn next(&mut self) -> Option<ServerFrame> {
        self.rx.recv().await
    }

    /// Drain a historical-bars response. A missing terminator past the
    /// deadline is a transient failure; an in-stream error frame is
    /// classified by the fixed table.
    pub async fn collect_bars(mut self, deadline: Duration) -> Result<Vec<WireBar>, BrokerError> {
        let mut bars = Vec::new();
        loop {
            match timeout(deadline, self.rx.recv()).await {
                Err(_) => return Err(BrokerError::Timeout),
                Ok(None) => {
                    return Err(BrokerError::Transient("response stream closed".into()));
                }
                Ok(Some(ServerFrame::Bar { bar, .. })) => bars.push(bar),
                Ok(Some(ServerFrame::End { .. })) => return Ok(bars),
                Ok(Some(ServerFrame::Error { code, message, .. })) => {
                    return Err(BrokerError::from_wire(code, &message));
                }
                Ok(Some(other)) => {
                    debug!(frame = ?other, "ignoring off-topic frame in bar stream");
                }
            }
        }
    }

    /// Drain an account-info response into tag/value pairs.
    pub async fn collect_account(
        mut self,
        deadline: Duration,
    ) -> Result<Vec<(String, String)>, BrokerError> {
        let mut tags = Vec::new();
        loop {
            match timeout(deadline, self.rx.recv()).await {
                Err(_) => return Err(BrokerError::Timeout),
                Ok(None) => {
                    return Err(BrokerError::Transient("response stream closed".into()));
                }
                Ok(Some(ServerFrame::AccountSummary { tag, value, .. })) => {
                    tags.push((tag, value));
                }
                Ok(Some(ServerFrame::End { .. })) => return Ok(tags),
                Ok(Some(ServerFrame::Error { code, message, .. })) => {
                    return Err(BrokerError::from_wire(code, &message));
                }
                Ok(Some(_)) => {}
            }
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

enum IoCommand {
    Send(ClientFrame),
    Disconnect,
}

struct SessionShared {
    state_tx: watch::Sender<SessionState>,
    pending: Mutex<HashMap<u64, mpsc::Sender<ServerFrame>>>,
    next_id: AtomicU64,
    timeout_strikes: AtomicU32,
}

impl SessionShared {
    fn set_state(&self, state: SessionState) {
        if *self.state_tx.borrow() != state {
            debug!(state = %state, "broker session state");
            let _ = self.state_tx.send(state);
        }
    }

    /// Fail every pending request stream by dropping its sender.
    fn drop_pending(&self) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            warn!(count = pending.len(), "dropping pending request streams");
        }
        pending.clear();
    }
}

/// Handle to a connected broker session. Cloneable across the pipeline;
/// the I/O task it spawned is stopped by `disconnect`.
pub struct BrokerSession {
    shared: Arc<SessionShared>,
    commands: mpsc::Sender<IoCommand>,
    state_rx: watch::Receiver<SessionState>,
    io_handle: tokio::task::JoinHandle<()>,
}

impl BrokerSession {
    /// Connect, handshake, probe, and reach READY, retrying with
    /// exponential backoff up to the configured attempt cap.
    pub async fn establish<F: TransportFactory>(
        factory: F,
        config: BrokerConfig,
    ) -> Result<BrokerSession, ErrorKind> {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let shared = Arc::new(SessionShared {
            state_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout_strikes: AtomicU32::new(0),
        });

        let io_shared = Arc::clone(&shared);
        let io_handle = tokio::spawn(async move {
            io_task(factory, config, io_shared, cmd_rx).await;
        });

        let session = BrokerSession { shared, commands: cmd_tx, state_rx, io_handle };
        session.wait_for(SessionState::Ready).await?;
        Ok(session)
    }

    async fn wait_for(&self, target: SessionState) -> Result<(), ErrorKind> {
        let mut rx = self.state_rx.clone();
        loop {
            let current = *rx.borrow();
            if current == target {
                return Ok(());
            }
            if current == SessionState::Disconnected {
                return Err(ErrorKind::SessionUnavailable(
                    "session gave up before reaching READY".into(),
                ));
            }
            if rx.changed().await.is_err() {
                return Err(ErrorKind::SessionUnavailable("session task exited".into()));
            }
        }
    }

    pub fn status(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Record a request deadline miss; enough strikes degrade the
    /// session and force a reconnect.
    pub fn note_timeout(&self) {
        self.shared.timeout_strikes.fetch_add(1, Ordering::Relaxed);
    }

    /// Put a request on the wire and return its response stream.
    pub fn dispatch(&self, request: BrokerRequest) -> Result<ResponseStream, BrokerError> {
        let state = self.status();
        if state != SessionState::Ready {
            return Err(BrokerError::NotReady(state.to_string()));
        }
        let request_id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = match request {
            BrokerRequest::HistoricalBars { contract, timeframe, range_start, range_end } => {
                ClientFrame::HistoricalBars {
                    request_id,
                    contract,
                    bar_size: timeframe,
                    range_start,
                    range_end,
                    what_to_show: "TRADES".into(),
                }
            }
            BrokerRequest::SubscribeMarketData { contract } => {
                ClientFrame::SubscribeMarketData { request_id, contract }
            }
            BrokerRequest::AccountInfo => ClientFrame::AccountInfo { request_id },
        };

        let (tx, rx) = mpsc::channel(512);
        self.shared.pending.lock().insert(request_id, tx);
        if self.commands.try_send(IoCommand::Send(frame)).is_err() {
            self.shared.pending.lock().remove(&request_id);
            return Err(BrokerError::NotReady("I/O task unavailable".into()));
        }
        Ok(ResponseStream { request_id, rx })
    }

    /// Best-effort abort of an in-flight request.
    pub fn cancel(&self, request_id: u64) {
        let _ = self.commands.try_send(IoCommand::Send(ClientFrame::Cancel { request_id }));
    }

    /// Two-phase teardown: announce, drain the socket task, release the
    /// connection.
    pub async fn disconnect(&self) {
        self.shared.set_state(SessionState::Disconnecting);
        let _ = self.commands.send(IoCommand::Disconnect).await;
        let mut rx = self.state_rx.clone();
        while *rx.borrow() != SessionState::Disconnected {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        self.io_handle.abort();
    }
}

// =============================================================================
// I/O TASK
// =============================================================================

enum ServeExit {
    Disconnect,
    TransportLost(String),
}

enum HandshakeFailure {
    Retryable(String),
    Fatal(String),
}

async fn io_task<F: TransportFactory>(
    factory: F,
    config: BrokerConfig,
    shared: Arc<SessionShared>,
    mut commands: mpsc::Receiver<IoCommand>,
) {
    let mut attempt: u32 = 0;
    loop {
        shared.set_state(SessionState::Connecting);
        let connected = timeout(
            Duration::from_secs(config.connect_timeout_secs),
            factory.connect(),
        )
        .await;

        let mut transport = match connected {
            Ok(Ok(t)) => t,
            Ok(Err(e)) => {
                warn!(error = %e, attempt, "broker connect failed");
                attempt += 1;
                if attempt >= config.connect_attempt_cap {
                    break;
                }
                sleep(reconnect_delay(&config, attempt)).await;
                continue;
            }
            Err(_) => {
                warn!(attempt, "broker connect timed out");
                attempt += 1;
                if attempt >= config.connect_attempt_cap {
                    break;
                }
                sleep(reconnect_delay(&config, attempt)).await;
                continue;
            }
        };

        shared.set_state(SessionState::Handshaking);
        match handshake(&mut transport, &config, &shared).await {
            Ok(()) => {}
            Err(HandshakeFailure::Fatal(reason)) => {
                warn!(reason = %reason, "broker handshake rejected, giving up");
                break;
            }
            Err(HandshakeFailure::Retryable(reason)) => {
                warn!(reason = %reason, attempt, "broker handshake failed");
                attempt += 1;
                if attempt >= config.connect_attempt_cap {
                    break;
                }
                sleep(reconnect_delay(&config, attempt)).await;
                continue;
            }
        }

        attempt = 0;
        shared.timeout_strikes.store(0, Ordering::Relaxed);
        shared.set_state(SessionState::Ready);
        info!(client_id = config.client_id, "broker session ready");

        match serve(&mut transport, &config, &shared, &mut commands).await {
            ServeExit::Disconnect => {
                let _ = transport.send(ClientFrame::Disconnect).await;
                shared.drop_pending();
                shared.set_state(SessionState::Disconnected);
                return;
            }
            ServeExit::TransportLost(reason) => {
                warn!(reason = %reason, "broker session degraded, reconnecting");
                shared.set_state(SessionState::Degraded);
                shared.drop_pending();
                attempt = 1;
                sleep(reconnect_delay(&config, attempt)).await;
            }
        }
    }
    shared.drop_pending();
    shared.set_state(SessionState::Disconnected);
}

fn reconnect_delay(config: &BrokerConfig, attempt: u32) -> Duration {
    let base = config.reconnect_backoff_base_secs.max(1);
    let exp = base.saturating_mul(1u64 << attempt.min(16).saturating_sub(1));
    Duration::from_secs(exp.min(config.reconnect_backoff_cap_secs))
}

/// Authenticate and probe. READY requires a ConnectAck plus one
/// account-info round trip inside the probe window.
async fn handshake<T: BrokerTransport>(
    transport: &mut T,
    config: &BrokerConfig,
    shared: &SessionShared,
) -> Result<(), HandshakeFailure> {
    transport
        .send(ClientFrame::Connect { client_id: config.client_id })
        .await
        .map_err(|e| HandshakeFailure::Retryable(format!("send connect: {e}")))?;

    let ack = timeout(Duration::from_secs(config.connect_timeout_secs), transport.recv()).await;
    match ack {
        Ok(Ok(Some(ServerFrame::ConnectAck { server_version }))) => {
            debug!(server_version, "broker connection acknowledged");
        }
        Ok(Ok(Some(ServerFrame::ConnectReject { code, message }))) => {
            return match classify_error(code) {
                ErrorClass::Fatal => Err(HandshakeFailure::Fatal(format!("{code}: {message}"))),
                _ => Err(HandshakeFailure::Retryable(format!("{code}: {message}"))),
            };
        }
        Ok(Ok(Some(other))) => {
            return Err(HandshakeFailure::Retryable(format!("unexpected frame {other:?}")));
        }
        Ok(Ok(None)) => return Err(HandshakeFailure::Retryable("peer closed".into())),
        Ok(Err(e)) => return Err(HandshakeFailure::Retryable(format!("recv: {e}"))),
        Err(_) => return Err(HandshakeFailure::Retryable("connect ack timeout".into())),
    }

    // Account probe. Failure inside the window keeps the session out of
    // READY.
    let probe_id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    transport
        .send(ClientFrame::AccountInfo { request_id: probe_id })
        .await
        .map_err(|e| HandshakeFailure::Retryable(format!("send probe: {e}")))?;

    let probe_deadline = Instant::now() + Duration::from_secs(config.probe_timeout_secs);
    loop {
        let remaining = probe_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HandshakeFailure::Retryable("account probe timeout".into()));
        }
        match timeout(remaining, transport.recv()).await {
            Ok(Ok(Some(ServerFrame::End { request_id }))) if request_id == probe_id => {
                return Ok(());
            }
            Ok(Ok(Some(ServerFrame::AccountSummary { .. }))) => {}
            Ok(Ok(Some(ServerFrame::Error { code, message, .. }))) => {
                return match classify_error(code) {
                    ErrorClass::Fatal => {
                        Err(HandshakeFailure::Fatal(format!("probe: {code}: {message}")))
                    }
                    _ => Err(HandshakeFailure::Retryable(format!("probe: {code}: {message}"))),
                };
            }
            Ok(Ok(Some(_))) => {}
            Ok(Ok(None)) => return Err(HandshakeFailure::Retryable("peer closed".into())),
            Ok(Err(e)) => return Err(HandshakeFailure::Retryable(format!("recv: {e}"))),
            Err(_) => return Err(HandshakeFailure::Retryable("account probe timeout".into())),
        }
    }
}

/// Main serve loop: forward outbound commands, route inbound frames,
/// keep the connection alive, watch for degradation.
async fn serve<T: BrokerTransport>(
    transport: &mut T,
    config: &BrokerConfig,
    shared: &SessionShared,
    commands: &mut mpsc::Receiver<IoCommand>,
) -> ServeExit {
    let keepalive = Duration::from_secs(config.keepalive_secs.max(1));
    // First tick only after a full keepalive period.
    let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(IoCommand::Send(frame)) => {
                    if let Err(e) = transport.send(frame).await {
                        return ServeExit::TransportLost(format!("send: {e}"));
                    }
                }
                Some(IoCommand::Disconnect) | None => return ServeExit::Disconnect,
            },
            inbound = transport.recv() => match inbound {
                Ok(Some(frame)) => {
                    last_inbound = Instant::now();
                    shared.timeout_strikes.store(0, Ordering::Relaxed);
                    route(shared, frame);
                }
                Ok(None) => return ServeExit::TransportLost("peer closed".into()),
                Err(e) => return ServeExit::TransportLost(format!("recv: {e}")),
            },
            _ = ticker.tick() => {
                let strikes = shared.timeout_strikes.load(Ordering::Relaxed);
                if strikes >= config.degraded_after_timeouts {
                    return ServeExit::TransportLost(format!(
                        "{strikes} consecutive request timeouts"
                    ));
                }
                if last_inbound.elapsed() > keepalive * 2 {
                    return ServeExit::TransportLost("keepalive lost".into());
                }
                if let Err(e) = transport.send(ClientFrame::Ping).await {
                    return ServeExit::TransportLost(format!("ping: {e}"));
                }
            }
        }
    }
}

/// Deliver one inbound frame to its request stream. The terminator and
/// request-scoped errors close the stream.
fn route(shared: &SessionShared, frame: ServerFrame) {
    let Some(request_id) = frame.request_id() else {
        match frame {
            ServerFrame::Pong => {}
            ServerFrame::Error { code, message, .. } => {
                warn!(code, message = %message, "broker session-level error");
            }
            other => debug!(frame = ?other, "unroutable frame"),
        }
        return;
    };

    let closes = matches!(frame, ServerFrame::End { .. } | ServerFrame::Error { .. });
    let mut pending = shared.pending.lock();
    if let Some(tx) = pending.get(&request_id) {
        if tx.try_send(frame).is_err() {
            warn!(request_id, "response stream full or abandoned, dropping");
            pending.remove(&request_id);
            return;
        }
        if closes {
            pending.remove(&request_id);
        }
    } else {
        debug!(request_id, "frame for unknown request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    /// Test transport scripted through channels; the test side plays the
    /// gateway.
    struct ScriptedTransport {
        inbound: mpsc::Receiver<ServerFrame>,
        outbound: mpsc::Sender<ClientFrame>,
    }

    impl BrokerTransport for ScriptedTransport {
        async fn send(&mut self, frame: ClientFrame) -> anyhow::Result<()> {
            self.outbound
                .send(frame)
                .await
                .map_err(|_| anyhow::anyhow!("gateway side closed"))
        }

        async fn recv(&mut self) -> anyhow::Result<Option<ServerFrame>> {
            Ok(self.inbound.recv().await)
        }
    }

    struct ScriptedFactory {
        transports: Mutex<Vec<ScriptedTransport>>,
    }

    impl TransportFactory for ScriptedFactory {
        type Transport = ScriptedTransport;

        async fn connect(&self) -> anyhow::Result<ScriptedTransport> {
            self.transports
                .lock()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("no transport scripted"))
        }
    }

    struct Gateway {
        to_session: mpsc::Sender<ServerFrame>,
        from_session: mpsc::Receiver<ClientFrame>,
    }

    fn scripted_pair() -> (ScriptedFactory, Gateway) {
        let (server_tx, server_rx) = mpsc::channel(64);
        let (client_tx, client_rx) = mpsc::channel(64);
        let transport = ScriptedTransport { inbound: server_rx, outbound: client_tx };
        let factory = ScriptedFactory { transports: Mutex::new(vec![transport]) };
        (factory, Gateway { to_session: server_tx, from_session: client_rx })
    }

    fn test_config() -> BrokerConfig {
        BrokerConfig {
            connect_timeout_secs: 2,
            probe_timeout_secs: 2,
            keepalive_secs: 60,
            connect_attempt_cap: 2,
            reconnect_backoff_base_secs: 1,
            ..BrokerConfig::default()
        }
    }

    /// Play the gateway through a successful handshake and probe.
    async fn serve_handshake(gateway: &mut Gateway) {
        match gateway.from_session.recv().await {
            Some(ClientFrame::Connect { .. }) => {}
            other => panic!("expected connect, got {other:?}"),
        }
        gateway.to_session.send(ServerFrame::ConnectAck { server_version: 176 }).await.unwrap();
        match gateway.from_session.recv().await {
            Some(ClientFrame::AccountInfo { request_id }) => {
                gateway
                    .to_session
                    .send(ServerFrame::AccountSummary {
                        request_id,
                        tag: "NetLiquidation".into(),
                        value: "100000".into(),
                    })
                    .await
                    .unwrap();
                gateway.to_session.send(ServerFrame::End { request_id }).await.unwrap();
            }
            other => panic!("expected account probe, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn establish_reaches_ready_after_probe() {
        let (factory, mut gateway) = scripted_pair();
        let server = tokio::spawn(async move {
            serve_handshake(&mut gateway).await;
            gateway
        });
        let session = BrokerSession::establish(factory, test_config()).await.unwrap();
        assert_eq!(session.status(), SessionState::Ready);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn historical_request_streams_until_terminator() {
        let (factory, mut gateway) = scripted_pair();
        let server = tokio::spawn(async move {
            serve_handshake(&mut gateway).await;
            // Answer the first historical request with two bars.
            let request_id = match gateway.from_session.recv().await {
                Some(ClientFrame::HistoricalBars { request_id, .. }) => request_id,
                other => panic!("expected historical request, got {other:?}"),
            };
            for minute in 0..2 {
                gateway
                    .to_session
                    .send(ServerFrame::Bar {
                        request_id,
                        bar: WireBar {
                            timestamp: Utc.with_ymd_and_hms(2024, 1, 15, 14, 30 + minute, 0).unwrap(),
                            open: 100.0,
                            high: 101.0,
                            low: 99.0,
                            close: 100.5,
                            volume: 1200,
                        },
                    })
                    .await
                    .unwrap();
            }
            gateway.to_session.send(ServerFrame::End { request_id }).await.unwrap();
            gateway
        });

        let session = BrokerSession::establish(factory, test_config()).await.unwrap();
        let stream = session
            .dispatch(BrokerRequest::HistoricalBars {
                contract: ContractSpec::stock("MSTR"),
                timeframe: Timeframe::Min1,
                range_start: Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap(),
                range_end: Utc.with_ymd_and_hms(2024, 1, 15, 14, 32, 0).unwrap(),
            })
            .unwrap();
        let bars = stream.collect_bars(Duration::from_secs(2)).await.unwrap();
        assert_eq!(bars.len(), 2);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn fatal_connect_reject_stops_retrying() {
        let (factory, mut gateway) = scripted_pair();
        tokio::spawn(async move {
            match gateway.from_session.recv().await {
                Some(ClientFrame::Connect { .. }) => {}
                other => panic!("expected connect, got {other:?}"),
            }
            gateway
                .to_session
                .send(ServerFrame::ConnectReject { code: 140, message: "bad credentials".into() })
                .await
                .unwrap();
            // Keep the channel open so the session, not the gateway,
            // decides to stop.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let result = BrokerSession::establish(factory, test_config()).await;
        assert!(matches!(result, Err(ErrorKind::SessionUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_transport_exhausts_attempt_cap() {
        let factory = ScriptedFactory { transports: Mutex::new(Vec::new()) };
        let result = BrokerSession::establish(factory, test_config()).await;
        assert!(matches!(result, Err(ErrorKind::SessionUnavailable(_))));
    }

    #[tokio::test]
    async fn in_stream_error_is_classified() {
        let (factory, mut gateway) = scripted_pair();
        let server = tokio::spawn(async move {
            serve_handshake(&mut gateway).await;
            let request_id = match gateway.from_session.recv().await {
                Some(ClientFrame::HistoricalBars { request_id, .. }) => request_id,
                other => panic!("expected historical request, got {other:?}"),
            };
            gateway
                .to_session
                .send(ServerFrame::Error {
                    request_id: Some(request_id),
                    code: 420,
                    message: "pacing violation".into(),
                })
                .await
                .unwrap();
            gateway
        });

        let session = BrokerSession::establish(factory, test_config()).await.unwrap();
        let stream = session
            .dispatch(BrokerRequest::HistoricalBars {
                contract: ContractSpec::stock("NVDA"),
                timeframe: Timeframe::Min1,
                range_start: Utc.with_ymd_and_hms(2024, 1, 15, 14, 30, 0).unwrap(),
                range_end: Utc.with_ymd_and_hms(2024, 1, 15, 14, 40, 0).unwrap(),
            })
            .unwrap();
        let err = stream.collect_bars(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, BrokerError::Throttled(_)));
        assert!(err.is_retryable());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_releases_connection() {
        let (factory, mut gateway) = scripted_pair();
        let server = tokio::spawn(async move {
            serve_handshake(&mut gateway).await;
            // Expect the disconnect announcement.
            loop {
                match gateway.from_session.recv().await {
                    Some(ClientFrame::Disconnect) | None => break,
                    Some(_) => {}
                }
            }
        });
        let session = BrokerSession::establish(factory, test_config()).await.unwrap();
        session.disconnect().await;
        assert_eq!(session.status(), SessionState::Disconnected);
        server.await.unwrap();
    }
}
