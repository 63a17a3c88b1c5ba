//! End-to-end pipeline scenarios against a scripted broker gateway.
//!
//! The gateway speaks the real wire frames over an in-memory transport,
//! so every layer runs: session handshake and probe, rate governor,
//! validation, storage, indicators, and simulation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use chrono_tz::America::New_York;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tickdna::broker::session::{BrokerSession, BrokerTransport, TransportFactory};
use tickdna::broker::wire::{ClientFrame, ServerFrame, WireBar};
use tickdna::config::PipelineConfig;
use tickdna::governor::RateGovernor;
use tickdna::models::{Timeframe, TradingSession};
use tickdna::pipeline::{Orchestrator, RunSpec, SessionRunner};
use tickdna::planner::BatchStrategy;
use tickdna::storage::{BarStore, QueryFilters};

// =============================================================================
// SCRIPTED GATEWAY
// =============================================================================

struct ScriptedTransport {
    inbound: mpsc::Receiver<ServerFrame>,
    outbound: mpsc::Sender<ClientFrame>,
}

impl BrokerTransport for ScriptedTransport {
    async fn send(&mut self, frame: ClientFrame) -> anyhow::Result<()> {
        self.outbound.send(frame).await.map_err(|_| anyhow::anyhow!("gateway closed"))
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
        self.transports.lock().pop().ok_or_else(|| anyhow::anyhow!("no transport scripted"))
    }
}

/// Behavior knobs for the synthetic feed.
#[derive(Default)]
struct GatewayScript {
    /// Regular-session minute offsets absent from the feed.
    drop_minutes: Vec<i64>,
    /// Reject this many historical requests with a pacing violation
    /// before serving normally.
    throttle_first: u32,
}

/// Serve the gateway side of one session: handshake, probe, then
/// historical bars generated on demand.
async fn run_gateway(
    mut from_session: mpsc::Receiver<ClientFrame>,
    to_session: mpsc::Sender<ServerFrame>,
    script: GatewayScript,
) {
    let throttles_left = AtomicU32::new(script.throttle_first);
    while let Some(frame) = from_session.recv().await {
        match frame {
            ClientFrame::Connect { .. } => {
                let _ =
                    to_session.send(ServerFrame::ConnectAck { server_version: 176 }).await;
            }
            ClientFrame::AccountInfo { request_id } => {
                let _ = to_session
                    .send(ServerFrame::AccountSummary {
                        request_id,
                        tag: "NetLiquidation".into(),
                        value: "250000".into(),
                    })
                    .await;
                let _ = to_session.send(ServerFrame::End { request_id }).await;
            }
            ClientFrame::HistoricalBars { request_id, bar_size, range_start, range_end, .. } => {
                if throttles_left.load(Ordering::SeqCst) > 0 {
                    throttles_left.fetch_sub(1, Ordering::SeqCst);
                    let _ = to_session
                        .send(ServerFrame::Error {
                            request_id: Some(request_id),
                            code: 420,
                            message: "pacing violation".into(),
                        })
                        .await;
                    continue;
                }
                for bar in synth_bars(bar_size, range_start, range_end, &script.drop_minutes) {
                    let _ = to_session.send(ServerFrame::Bar { request_id, bar }).await;
                }
                let _ = to_session.send(ServerFrame::End { request_id }).await;
            }
            ClientFrame::Ping => {
                let _ = to_session.send(ServerFrame::Pong).await;
            }
            ClientFrame::Disconnect => return,
            _ => {}
        }
    }
}

/// Deterministic regular-session bars on the requested grid.
fn synth_bars(
    timeframe: Timeframe,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
    drop_minutes: &[i64],
) -> Vec<WireBar> {
    let mut bars = Vec::new();
    let mut cursor = range_start;
    let mut minute = 0i64;
    while cursor < range_end {
        if TradingSession::classify(cursor) == TradingSession::Regular {
            if !drop_minutes.contains(&minute) {
                let px = 150.0 + (minute % 7) as f64 * 0.1;
                bars.push(WireBar {
                    timestamp: cursor,
                    open: px,
                    high: px + 0.4,
                    low: px - 0.4,
                    close: px + 0.05,
                    volume: 1000 + minute,
                });
            }
            minute += 1;
        }
        cursor += timeframe.duration();
    }
    bars
}

// =============================================================================
// HARNESS
// =============================================================================

struct Harness {
    orchestrator: Orchestrator<SessionRunner>,
    store: BarStore,
    session: Arc<BrokerSession>,
}

async fn start(script: GatewayScript, config: PipelineConfig) -> Harness {
    let (server_tx, server_rx) = mpsc::channel(4096);
    let (client_tx, client_rx) = mpsc::channel(4096);
    let factory = ScriptedFactory {
        transports: Mutex::new(vec![ScriptedTransport {
            inbound: server_rx,
            outbound: client_tx,
        }]),
    };
    tokio::spawn(run_gateway(client_rx, server_tx, script));

    let session = Arc::new(
        BrokerSession::establish(factory, config.broker.clone())
            .await
            .expect("session must reach READY"),
    );
    let runner = SessionRunner::new(Arc::clone(&session), Duration::from_secs(5));
    let governor = RateGovernor::new(runner, config.rate_limits.clone());
    let store = BarStore::open_in_memory().unwrap();
    let orchestrator = Orchestrator::new(config, store.clone(), governor);
    Harness { orchestrator, store, session }
}

fn fast_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.rate_limits.historical.window_ms = 100;
    config.rate_limits.historical.max_in_window = 6;
    config.rate_limits.historical.deadline_secs = 5;
    config.rate_limits.backoff_base_ms = 20;
    config.rate_limits.backoff_cap_ms = 100;
    config.worker_budget = 2;
    config
}

fn session_open() -> DateTime<Utc> {
    New_York.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap().with_timezone(&Utc)
}

fn one_session_spec(symbols: Vec<String>, strategy: BatchStrategy) -> RunSpec {
    RunSpec {
        symbols,
        timeframes: vec![Timeframe::Min1],
        range_start: session_open(),
        range_end: session_open() + ChronoDuration::minutes(390),
        strategy,
    }
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test]
async fn happy_path_full_session() {
    let harness = start(GatewayScript::default(), fast_config()).await;
    let spec = one_session_spec(vec!["MSTR".into()], BatchStrategy::Sequential);
    let report = harness.orchestrator.run(spec.clone()).await;

    assert!(report.success, "diagnostics: {:?}", report.diagnostics);
    assert_eq!(report.bars_fetched, 390);
    assert_eq!(report.bars_accepted, 390);
    assert_eq!(report.labels_written, 375);

    let rows = harness
        .store
        .query("MSTR", Timeframe::Min1, spec.range_start, spec.range_end, QueryFilters::default())
        .unwrap();
    assert_eq!(rows.len(), 390);
    // Stored timestamps are strictly increasing on the canonical grid.
    for pair in rows.windows(2) {
        assert!(pair[0].bar.timestamp < pair[1].bar.timestamp);
        assert!(Timeframe::Min1.is_on_grid(pair[0].bar.timestamp));
    }

    let quality = harness
        .store
        .quality_report(Some("MSTR"), spec.range_start, spec.range_end)
        .unwrap();
    assert!((quality.score_mean - 100.0).abs() < f64::EPSILON);
    assert_eq!(quality.rejected_count, 0);

    harness.session.disconnect().await;
}

#[tokio::test]
async fn missing_minute_leaves_exact_gap() {
    // Minute 43 after the open is 10:13 local.
    let script = GatewayScript { drop_minutes: vec![43], throttle_first: 0 };
    let harness = start(script, fast_config()).await;
    let spec = one_session_spec(vec!["MSTR".into()], BatchStrategy::Sequential);
    let report = harness.orchestrator.run(spec.clone()).await;

    assert!(report.success);
    assert_eq!(report.bars_accepted, 389);

    let missing = harness
        .store
        .detect_missing("MSTR", Timeframe::Min1, spec.range_start, spec.range_end)
        .unwrap();
    let gap = session_open() + ChronoDuration::minutes(43);
    assert_eq!(missing.expected, 390);
    assert_eq!(missing.found, 389);
    assert_eq!(missing.missing, vec![gap]);

    // No label anchors at the absent minute; earlier minutes still do.
    let labels = harness.store.get_labels("MSTR", spec.range_start, spec.range_end).unwrap();
    let anchored: HashSet<DateTime<Utc>> = labels.iter().map(|l| l.entry_timestamp).collect();
    assert!(!anchored.contains(&gap));
    assert!(anchored.contains(&(session_open() + ChronoDuration::minutes(15))));

    harness.session.disconnect().await;
}

#[tokio::test]
async fn throttled_requests_retry_to_completion() {
    let script = GatewayScript { drop_minutes: Vec::new(), throttle_first: 3 };
    let mut config = fast_config();
    // Several shards so the throttled ones interleave with the rest.
    config.broker.max_bars_per_request = 60;
    let harness = start(script, config).await;
    let spec = one_session_spec(vec!["MSTR".into()], BatchStrategy::Sequential);
    let report = harness.orchestrator.run(spec.clone()).await;

    assert!(report.success, "diagnostics: {:?}", report.diagnostics);
    assert_eq!(report.bars_accepted, 390);
    assert!(report.governor.historical.retries >= 3);
    assert!(report.governor.historical.failed == 0);

    harness.session.disconnect().await;
}

#[tokio::test]
async fn every_labeled_bar_is_stored_and_regular_hours() {
    let harness = start(GatewayScript::default(), fast_config()).await;
    let spec = one_session_spec(vec!["MSTR".into()], BatchStrategy::Mixed);
    let report = harness.orchestrator.run(spec.clone()).await;
    assert!(report.success);

    let rows = harness
        .store
        .query("MSTR", Timeframe::Min1, spec.range_start, spec.range_end, QueryFilters::default())
        .unwrap();
    let stored: HashSet<DateTime<Utc>> = rows.iter().map(|r| r.bar.timestamp).collect();
    let labels = harness.store.get_labels("MSTR", spec.range_start, spec.range_end).unwrap();
    assert!(!labels.is_empty());
    for label in &labels {
        assert!(stored.contains(&label.entry_timestamp), "label without a stored bar");
        assert_eq!(TradingSession::classify(label.entry_timestamp), TradingSession::Regular);
    }

    harness.session.disconnect().await;
}

#[tokio::test]
async fn two_symbols_ingest_independently() {
    let harness = start(GatewayScript::default(), fast_config()).await;
    let spec = one_session_spec(
        vec!["MSTR".into(), "NVDA".into()],
        BatchStrategy::ParallelBySymbol,
    );
    let report = harness.orchestrator.run(spec.clone()).await;

    assert!(report.success);
    assert_eq!(report.items.len(), 2);
    for symbol in ["MSTR", "NVDA"] {
        let rows = harness
            .store
            .query(symbol, Timeframe::Min1, spec.range_start, spec.range_end, QueryFilters::default())
            .unwrap();
        assert_eq!(rows.len(), 390, "{symbol} should store a full session");
    }

    harness.session.disconnect().await;
}
