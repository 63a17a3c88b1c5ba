//! End-to-end pipeline orchestration.
//!
//! One orchestrator object owns every subordinate component and wires
//! the flow: plan, fetch through the rate governor, validate, store,
//! cross-check timeframes, compute indicators, simulate, report. No
//! global state; status reporting is a pure read of orchestrator state.
//!
//! Per (symbol, timeframe) bars move in strict timestamp order through
//! validation, indicator update, and simulation. Across keys, order is
//! unspecified: symbols run as parallel tasks bounded by the worker
//! budget.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::broker::session::{BrokerError, BrokerRequest, BrokerSession};
use crate::broker::wire::{ContractSpec, WireBar};
use crate::config::PipelineConfig;
use crate::error::ErrorKind;
use crate::governor::{
    GovernorError, GovernorStats, RateGovernor, RequestOutput, RequestPayload, RequestRunner,
    Ticket,
};
use crate::indicators::{compute_series, IndicatorSpec};
use crate::models::{Bar, Timeframe};
use crate::planner::{BatchPlanner, BatchStrategy, PlanTarget, PlannedRequest};
use crate::simulator::{PerformanceSummary, TradeSimulator};
use crate::storage::{BarStore, QueryFilters};
use crate::validator::cross_tf::{CrossTfValidator, RefetchPolicy};
use crate::validator::BarValidator;

// =============================================================================
// RUN SPEC & REPORTS
// =============================================================================

/// What one pipeline run should ingest and label.
#[derive(Debug, Clone, Serialize)]
pub struct RunSpec {
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub strategy: BatchStrategy,
}

/// Terminal state of one scheduled (symbol, timeframe) item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunItemReport {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub status: ItemStatus,
    pub error: Option<String>,
    pub bars_fetched: usize,
    pub bars_accepted: usize,
    pub bars_rejected: usize,
    pub labels_written: usize,
}

/// Everything a run produced, success or not. The store reflects
/// exactly the completed items.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub items: Vec<RunItemReport>,
    pub bars_fetched: usize,
    pub bars_accepted: usize,
    pub bars_rejected: usize,
    pub issue_counts: BTreeMap<String, usize>,
    pub cross_tf_findings: usize,
    pub refetched_requests: usize,
    pub indicator_rows: usize,
    pub labels_written: usize,
    pub performance: PerformanceSummary,
    pub diagnostics: Vec<String>,
    pub governor: GovernorStats,
}

/// Pipeline lifecycle as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Idle,
    Running,
    Draining,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub phase: PipelinePhase,
    pub run_id: Option<String>,
    pub items_total: usize,
    pub items_done: usize,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self { phase: PipelinePhase::Idle, run_id: None, items_total: 0, items_done: 0 }
    }
}

// =============================================================================
// SESSION RUNNER
// =============================================================================

/// Bridges the governor to a live broker session.
pub struct SessionRunner {
    session: Arc<BrokerSession>,
    collect_timeout: std::time::Duration,
}

impl SessionRunner {
    pub fn new(session: Arc<BrokerSession>, collect_timeout: std::time::Duration) -> Self {
        Self { session, collect_timeout }
    }
}

impl RequestRunner for SessionRunner {
    async fn run(&self, payload: RequestPayload) -> Result<RequestOutput, BrokerError> {
        match payload {
            RequestPayload::HistoricalBars { symbol, timeframe, range_start, range_end } => {
                let stream = self.session.dispatch(BrokerRequest::HistoricalBars {
                    contract: ContractSpec::stock(symbol),
                    timeframe,
                    range_start,
                    range_end,
                })?;
                let bars = stream.collect_bars(self.collect_timeout).await?;
                Ok(RequestOutput::Bars(bars))
            }
            RequestPayload::MarketData { symbol } => {
                self.session.dispatch(BrokerRequest::SubscribeMarketData {
                    contract: ContractSpec::stock(symbol),
                })?;
                Ok(RequestOutput::Subscribed)
            }
            RequestPayload::AccountInfo => {
                let stream = self.session.dispatch(BrokerRequest::AccountInfo)?;
                let tags = stream.collect_account(self.collect_timeout).await?;
                Ok(RequestOutput::Account(tags))
            }
        }
    }

    fn note_timeout(&self) {
        self.session.note_timeout();
    }
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

struct OrchestratorInner<R: RequestRunner> {
    config: PipelineConfig,
    store: BarStore,
    governor: RateGovernor<R>,
    status: RwLock<PipelineStatus>,
    cancel: Mutex<Option<(String, watch::Sender<bool>)>>,
}

pub struct Orchestrator<R: RequestRunner> {
    inner: Arc<OrchestratorInner<R>>,
}

impl<R: RequestRunner> Clone for Orchestrator<R> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

/// Counters one symbol task hands back.
#[derive(Default)]
struct SymbolOutcome {
    items: Vec<RunItemReport>,
    issue_counts: BTreeMap<String, usize>,
    cross_tf_findings: usize,
    refetched_requests: usize,
    indicator_rows: usize,
    performance: PerformanceSummary,
    diagnostics: Vec<String>,
}

impl<R: RequestRunner> Orchestrator<R> {
    pub fn new(config: PipelineConfig, store: BarStore, governor: RateGovernor<R>) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                store,
                governor,
                status: RwLock::new(PipelineStatus::default()),
                cancel: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.inner.status.read().clone()
    }

    pub fn governor_stats(&self) -> GovernorStats {
        self.inner.governor.stats()
    }

    /// Cancel the named run: stop intake, drain in-flight work, keep
    /// whatever already committed.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        let guard = self.inner.cancel.lock();
        match guard.as_ref() {
            Some((current, tx)) if current == run_id => {
                info!(run_id, "cancelling pipeline run");
                self.inner.status.write().phase = PipelinePhase::Draining;
                let _ = tx.send(true);
                true
            }
            _ => false,
        }
    }

    /// Execute a full run to its report. Failures in one symbol never
    /// block the others; the report enumerates every scheduled item.
    pub async fn run(&self, spec: RunSpec) -> RunReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        *self.inner.cancel.lock() = Some((run_id.clone(), cancel_tx));

        // Retired parameter sets leave the store before new values land.
        let keep: Vec<String> =
            self.inner.config.indicators.iter().map(IndicatorSpec::fingerprint).collect();
        if let Err(e) = self.inner.store.prune_indicator_fingerprints(&keep) {
            warn!(error = %e, "indicator prune failed");
        }

        let targets = self.resume_targets(&spec);
        let planner = BatchPlanner::new(self.inner.config.broker.max_bars_per_request);
        let plan = planner.plan(&targets, spec.strategy);
        info!(
            run_id = %run_id,
            symbols = spec.symbols.len(),
            timeframes = spec.timeframes.len(),
            requests = plan.len(),
            strategy = ?spec.strategy,
            "pipeline run planned"
        );

        {
            let mut status = self.inner.status.write();
            status.phase = PipelinePhase::Running;
            status.run_id = Some(run_id.clone());
            status.items_total = spec.symbols.len() * spec.timeframes.len();
            status.items_done = 0;
        }

        // Submit the whole plan up front; the governor enforces pacing.
        let mut by_symbol: BTreeMap<String, BTreeMap<Timeframe, Vec<(PlannedRequest, Ticket)>>> =
            BTreeMap::new();
        for request in plan {
            let payload = RequestPayload::HistoricalBars {
                symbol: request.symbol.clone(),
                timeframe: request.timeframe,
                range_start: request.range_start,
                range_end: request.range_end,
            };
            match self.inner.governor.submit(payload, request.priority) {
                Ok(ticket) => {
                    by_symbol
                        .entry(request.symbol.clone())
                        .or_default()
                        .entry(request.timeframe)
                        .or_default()
                        .push((request, ticket));
                }
                Err(e) => warn!(error = %e, "request submission rejected"),
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.inner.config.worker_budget.max(1)));
        let mut tasks: JoinSet<SymbolOutcome> = JoinSet::new();
        for (symbol, tickets) in by_symbol {
            let inner = Arc::clone(&self.inner);
            let spec = spec.clone();
            let cancel_rx = cancel_rx.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                process_symbol(inner, symbol, tickets, spec, cancel_rx).await
            });
        }

        let mut items = Vec::new();
        let mut issue_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut performance = PerformanceSummary::default();
        let mut diagnostics = Vec::new();
        let mut cross_tf_findings = 0usize;
        let mut refetched_requests = 0usize;
        let mut indicator_rows = 0usize;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    self.inner.status.write().items_done += outcome.items.len();
                    items.extend(outcome.items);
                    for (key, count) in outcome.issue_counts {
                        *issue_counts.entry(key).or_default() += count;
                    }
                    performance.merge(&outcome.performance);
                    diagnostics.extend(outcome.diagnostics);
                    cross_tf_findings += outcome.cross_tf_findings;
                    refetched_requests += outcome.refetched_requests;
                    indicator_rows += outcome.indicator_rows;
                }
                Err(e) => diagnostics.push(format!("symbol task panicked: {e}")),
            }
        }

        items.sort_by(|a, b| {
            (a.symbol.as_str(), a.timeframe.minutes()).cmp(&(b.symbol.as_str(), b.timeframe.minutes()))
        });
        // A run succeeds when every scheduled item reached a completed
        // terminal state; a fully-resumed run schedules nothing.
        let success = items.iter().all(|i| i.status == ItemStatus::Completed);
        let report = RunReport {
            run_id: run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            success,
            bars_fetched: items.iter().map(|i| i.bars_fetched).sum(),
            bars_accepted: items.iter().map(|i| i.bars_accepted).sum(),
            bars_rejected: items.iter().map(|i| i.bars_rejected).sum(),
            labels_written: items.iter().map(|i| i.labels_written).sum(),
            items,
            issue_counts,
            cross_tf_findings,
            refetched_requests,
            indicator_rows,
            performance,
            diagnostics,
            governor: self.inner.governor.stats(),
        };

        {
            let mut status = self.inner.status.write();
            status.phase = PipelinePhase::Idle;
            status.run_id = None;
        }
        *self.inner.cancel.lock() = None;
        info!(
            run_id = %run_id,
            success = report.success,
            bars = report.bars_accepted,
            labels = report.labels_written,
            "pipeline run finished"
        );
        report
    }

    /// Shrink requested ranges to what is not yet committed, so a
    /// restarted run resumes from the last durable timestamp per key.
    fn resume_targets(&self, spec: &RunSpec) -> Vec<PlanTarget> {
        let mut targets = Vec::new();
        for symbol in &spec.symbols {
            for &timeframe in &spec.timeframes {
                let mut start = spec.range_start;
                if let Ok(Some(last)) = self.inner.store.last_committed_timestamp(symbol, timeframe)
                {
                    let next = last + timeframe.duration();
                    if next > start {
                        start = next;
                    }
                }
                if start < spec.range_end {
                    targets.push(PlanTarget {
                        symbol: symbol.clone(),
                        timeframe,
                        range_start: start,
                        range_end: spec.range_end,
                    });
                }
            }
        }
        targets
    }

    /// Two-phase shutdown: stop intake, then let callers drain.
    pub fn shutdown(&self) {
        self.inner.governor.shutdown();
        self.inner.status.write().phase = PipelinePhase::Draining;
    }
}

// =============================================================================
// SYMBOL TASK
// =============================================================================

async fn process_symbol<R: RequestRunner>(
    inner: Arc<OrchestratorInner<R>>,
    symbol: String,
    tickets: BTreeMap<Timeframe, Vec<(PlannedRequest, Ticket)>>,
    spec: RunSpec,
    cancel_rx: watch::Receiver<bool>,
) -> SymbolOutcome {
    let mut outcome = SymbolOutcome::default();
    let validator = BarValidator::new(inner.config.validator.clone());
    let mut ingested: Vec<Timeframe> = Vec::new();

    // Stage 1: fetch, validate, store, one timeframe at a time so each
    // key's bars stay in strict timestamp order.
    for (timeframe, shard_tickets) in tickets {
        let item = ingest_timeframe(
            &inner,
            &validator,
            &symbol,
            timeframe,
            shard_tickets,
            &cancel_rx,
            &mut outcome,
        )
        .await;
        if item.status == ItemStatus::Completed {
            ingested.push(timeframe);
        }
        outcome.items.push(item);
    }

    if *cancel_rx.borrow() {
        return outcome;
    }

    // Stage 2: cross-timeframe consistency over what just landed, with
    // a single bounded refetch round per directive.
    let cross = CrossTfValidator::new(RefetchPolicy::Coarser);
    for (coarse_tf, fine_tf) in CrossTfValidator::aggregation_pairs() {
        if !ingested.contains(&coarse_tf) || !ingested.contains(&fine_tf) {
            continue;
        }
        let coarse = query_bars(&inner.store, &symbol, coarse_tf, &spec);
        let fine = query_bars(&inner.store, &symbol, fine_tf, &spec);
        let findings = cross.check(coarse_tf, &coarse, fine_tf, &fine);
        outcome.cross_tf_findings += findings.len();
        for finding in findings {
            outcome.diagnostics.push(finding.issue.message.clone());
            let payload = RequestPayload::HistoricalBars {
                symbol: finding.refetch.symbol.clone(),
                timeframe: finding.refetch.timeframe,
                range_start: finding.refetch.range_start,
                range_end: finding.refetch.range_end,
            };
            match inner.governor.submit(payload, 4) {
                Ok(ticket) => {
                    outcome.refetched_requests += 1;
                    if let Ok(RequestOutput::Bars(wire_bars)) = ticket.wait().await {
                        let bars =
                            to_bars(&symbol, finding.refetch.timeframe, wire_bars);
                        let batch = validator.validate_batch(finding.refetch.timeframe, &bars);
                        let accepted: Vec<_> =
                            batch.bars.iter().filter(|b| b.quality.accepted).cloned().collect();
                        if let Err(e) = inner.store.bulk_upsert(&accepted) {
                            outcome.diagnostics.push(format!("refetch upsert failed: {e}"));
                        }
                    }
                }
                Err(e) => outcome.diagnostics.push(format!("refetch rejected: {e}")),
            }
        }
    }

    // Stage 3 and 4: indicators, then labels, per completed timeframe.
    let simulator = TradeSimulator::new(inner.config.simulation.clone());
    for &timeframe in &ingested {
        let bars = query_bars(&inner.store, &symbol, timeframe, &spec);
        if bars.is_empty() {
            continue;
        }

        let series = compute_series(&inner.config.indicators, &bars);
        match inner.store.write_indicators(&series) {
            Ok(written) => outcome.indicator_rows += written,
            Err(e) => outcome.diagnostics.push(format!("indicator write failed: {e}")),
        }

        match simulator.simulate(&bars) {
            Ok(run) => {
                match inner.store.mark_labels(&run.labels) {
                    Ok(written) => {
                        if let Some(item) = outcome
                            .items
                            .iter_mut()
                            .find(|i| i.symbol == symbol && i.timeframe == timeframe)
                        {
                            item.labels_written = written;
                        }
                    }
                    Err(e) => outcome.diagnostics.push(format!("label write failed: {e}")),
                }
                for skipped in &run.indeterminate {
                    outcome.diagnostics.push(format!(
                        "indeterminate tie at {symbol}/{timeframe}/{skipped}, label omitted"
                    ));
                }
                outcome.performance.merge(&run.summary);
            }
            Err(e) => outcome.diagnostics.push(format!("simulation failed: {e}")),
        }
    }

    outcome
}

/// Fetch and persist one (symbol, timeframe): await shard tickets in
/// stitch order, validate the merged batch, record rejections, upsert.
async fn ingest_timeframe<R: RequestRunner>(
    inner: &Arc<OrchestratorInner<R>>,
    validator: &BarValidator,
    symbol: &str,
    timeframe: Timeframe,
    shard_tickets: Vec<(PlannedRequest, Ticket)>,
    cancel_rx: &watch::Receiver<bool>,
    outcome: &mut SymbolOutcome,
) -> RunItemReport {
    let mut item = RunItemReport {
        symbol: symbol.to_string(),
        timeframe,
        status: ItemStatus::Completed,
        error: None,
        bars_fetched: 0,
        bars_accepted: 0,
        bars_rejected: 0,
        labels_written: 0,
    };

    let mut wire_bars: Vec<WireBar> = Vec::new();
    for (request, ticket) in shard_tickets {
        if *cancel_rx.borrow() {
            inner.governor.cancel(ticket.id);
        }
        match ticket.wait().await {
            Ok(RequestOutput::Bars(bars)) => {
                if bars.is_empty() {
                    outcome.diagnostics.push(
                        ErrorKind::MissingRange(format!(
                            "{symbol}/{timeframe} {} .. {}",
                            request.range_start, request.range_end
                        ))
                        .to_string(),
                    );
                }
                wire_bars.extend(bars);
            }
            Ok(_) => {
                item.status = ItemStatus::Failed;
                item.error = Some("unexpected response shape".into());
                return item;
            }
            Err(GovernorError::Cancelled) => {
                item.status = ItemStatus::Cancelled;
                item.error = Some(ErrorKind::Cancelled("run cancelled".into()).tag().into());
                return item;
            }
            Err(e) => {
                item.status = ItemStatus::Failed;
                item.error = Some(map_governor_error(&e).tag().into());
                return item;
            }
        }
    }

    item.bars_fetched = wire_bars.len();
    let bars = to_bars(symbol, timeframe, wire_bars);
    let batch = validator.validate_batch(timeframe, &bars);
    for (key, count) in &batch.summary.issue_counts {
        *outcome.issue_counts.entry(key.clone()).or_default() += *count;
    }
    item.bars_rejected = batch.summary.rejected;

    let rejected: Vec<_> = batch.rejected().cloned().collect();
    if !rejected.is_empty() {
        if let Err(e) = inner.store.record_rejections(&rejected) {
            outcome.diagnostics.push(format!("rejection log failed: {e}"));
        }
    }

    let accepted: Vec<_> = batch.bars.iter().filter(|b| b.quality.accepted).cloned().collect();
    match inner.store.bulk_upsert(&accepted) {
        Ok(upsert) => {
            item.bars_accepted = accepted.len();
            for conflict in upsert.conflicts {
                outcome.diagnostics.push(conflict);
            }
        }
        Err(e) => {
            item.status = ItemStatus::Failed;
            item.error = Some(e.tag().into());
        }
    }
    item
}

fn query_bars(store: &BarStore, symbol: &str, timeframe: Timeframe, spec: &RunSpec) -> Vec<Bar> {
    store
        .query(symbol, timeframe, spec.range_start, spec.range_end, QueryFilters::default())
        .map(|rows| rows.into_iter().map(|r| r.bar).collect())
        .unwrap_or_default()
}

fn to_bars(symbol: &str, timeframe: Timeframe, wire_bars: Vec<WireBar>) -> Vec<Bar> {
    let ingested_at = Utc::now();
    wire_bars
        .into_iter()
        .map(|w| Bar {
            symbol: symbol.to_string(),
            timeframe,
            timestamp: w.timestamp,
            open: w.open,
            high: w.high,
            low: w.low,
            close: w.close,
            volume: w.volume,
            source: "broker".into(),
            ingested_at,
        })
        .collect()
}

fn map_governor_error(error: &GovernorError) -> ErrorKind {
    match error {
        GovernorError::Cancelled => ErrorKind::Cancelled("run cancelled".into()),
        GovernorError::ShutDown => ErrorKind::Cancelled("governor shut down".into()),
        GovernorError::Failed(BrokerError::Fatal(msg)) => {
            ErrorKind::ConfigInvalid(format!("broker rejected request: {msg}"))
        }
        GovernorError::Exhausted { last: BrokerError::Throttled(msg), .. } => {
            ErrorKind::Throttled(msg.clone())
        }
        GovernorError::Exhausted { last, .. } => ErrorKind::SessionUnavailable(last.to_string()),
        GovernorError::Failed(e) => ErrorKind::SessionUnavailable(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use chrono::{Duration, TimeZone};
    use chrono_tz::America::New_York;

    /// Runner that serves synthetic sessions straight from memory.
    struct SyntheticFeed {
        /// Minute offsets from the session open to drop, per symbol.
        drop_minutes: Vec<(String, i64)>,
        /// Inject one inverted-range bar at this offset.
        corrupt_minute: Option<i64>,
    }

    impl SyntheticFeed {
        fn clean() -> Self {
            Self { drop_minutes: Vec::new(), corrupt_minute: None }
        }
    }

    impl RequestRunner for SyntheticFeed {
        async fn run(&self, payload: RequestPayload) -> Result<RequestOutput, BrokerError> {
            let RequestPayload::HistoricalBars { symbol, timeframe, range_start, range_end } =
                payload
            else {
                return Ok(RequestOutput::Subscribed);
            };
            let mut bars = Vec::new();
            let mut cursor = range_start;
            let mut minute = 0i64;
            while cursor < range_end {
                let session = crate::models::TradingSession::classify(cursor);
                if session == crate::models::TradingSession::Regular {
                    let dropped = self
                        .drop_minutes
                        .iter()
                        .any(|(s, m)| *s == symbol && *m == minute);
                    if !dropped {
                        let px = 150.0 + (minute % 7) as f64 * 0.1;
                        let corrupt = self.corrupt_minute == Some(minute);
                        bars.push(WireBar {
                            timestamp: cursor,
                            open: px,
                            high: if corrupt { px - 5.0 } else { px + 0.4 },
                            low: if corrupt { px + 5.0 } else { px - 0.4 },
                            close: px + 0.05,
                            volume: 1000 + minute,
                        });
                    }
                    minute += 1;
                }
                cursor = cursor + timeframe.duration();
            }
            Ok(RequestOutput::Bars(bars))
        }
    }

    fn fast_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.rate_limits.historical.window_ms = 50;
        config.rate_limits.historical.max_in_window = 50;
        config.worker_budget = 2;
        config
    }

    fn one_session_spec(symbols: Vec<String>) -> RunSpec {
        let open = New_York
            .with_ymd_and_hms(2024, 1, 15, 9, 30, 0)
            .unwrap()
            .with_timezone(&Utc);
        RunSpec {
            symbols,
            timeframes: vec![Timeframe::Min1],
            range_start: open,
            range_end: open + Duration::minutes(390),
            strategy: BatchStrategy::Sequential,
        }
    }

    fn orchestrator(feed: SyntheticFeed, config: PipelineConfig) -> Orchestrator<SyntheticFeed> {
        let store = BarStore::open_in_memory().unwrap();
        let governor = RateGovernor::new(feed, config.rate_limits.clone());
        Orchestrator::new(config, store, governor)
    }

    #[tokio::test]
    async fn happy_path_stores_and_labels_one_session() {
        let orch = orchestrator(SyntheticFeed::clean(), fast_config());
        let spec = one_session_spec(vec!["MSTR".into()]);
        let report = orch.run(spec.clone()).await;

        assert!(report.success, "diagnostics: {:?}", report.diagnostics);
        assert_eq!(report.bars_fetched, 390);
        assert_eq!(report.bars_accepted, 390);
        assert_eq!(report.bars_rejected, 0);
        // Entry window 09:45..16:00 labels every eligible minute.
        assert_eq!(report.labels_written, 375);
        assert!(report.indicator_rows > 0);

        let quality = orch
            .inner
            .store
            .quality_report(Some("MSTR"), spec.range_start, spec.range_end)
            .unwrap();
        assert_eq!(quality.total_bars, 390);
        assert!((quality.score_mean - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn missing_minute_is_detected_and_unlabeled() {
        let feed = SyntheticFeed {
            drop_minutes: vec![("MSTR".to_string(), 43)], // 10:13 local
            corrupt_minute: None,
        };
        let orch = orchestrator(feed, fast_config());
        let spec = one_session_spec(vec!["MSTR".into()]);
        let report = orch.run(spec.clone()).await;
        assert!(report.success);
        assert_eq!(report.bars_accepted, 389);

        let missing = orch
            .inner
            .store
            .detect_missing("MSTR", Timeframe::Min1, spec.range_start, spec.range_end)
            .unwrap();
        let gap = spec.range_start + Duration::minutes(43);
        assert_eq!(missing.missing, vec![gap]);

        let labels =
            orch.inner.store.get_labels("MSTR", spec.range_start, spec.range_end).unwrap();
        assert!(labels.iter().all(|l| l.entry_timestamp != gap));
        // The bar before the gap still labels normally.
        assert!(labels.iter().any(|l| l.entry_timestamp == gap - Duration::minutes(28)));
    }

    #[tokio::test]
    async fn corrupt_bar_is_rejected_and_counted() {
        let feed = SyntheticFeed {
            drop_minutes: Vec::new(),
            corrupt_minute: Some(100),
        };
        let orch = orchestrator(feed, fast_config());
        let spec = one_session_spec(vec!["MSTR".into()]);
        let report = orch.run(spec.clone()).await;

        assert_eq!(report.bars_rejected, 1);
        assert_eq!(report.bars_accepted, 389);
        assert!(report.issue_counts.get("OHLC_LOGIC/ERROR").copied().unwrap_or(0) >= 1);

        let quality = orch
            .inner
            .store
            .quality_report(Some("MSTR"), spec.range_start, spec.range_end)
            .unwrap();
        assert_eq!(quality.rejected_count, 1);
        assert_eq!(quality.total_bars, 389);
    }

    #[tokio::test]
    async fn rerun_resumes_and_relabels_identically() {
        let orch = orchestrator(SyntheticFeed::clean(), fast_config());
        let spec = one_session_spec(vec!["MSTR".into()]);
        let first = orch.run(spec.clone()).await;
        assert!(first.success);
        let labels_first =
            orch.inner.store.get_labels("MSTR", spec.range_start, spec.range_end).unwrap();

        let second = orch.run(spec.clone()).await;
        assert!(second.success);
        // Everything was already durable, so nothing is refetched.
        assert_eq!(second.bars_fetched, 0);
        let labels_second =
            orch.inner.store.get_labels("MSTR", spec.range_start, spec.range_end).unwrap();
        assert_eq!(
            serde_json::to_vec(&labels_first).unwrap(),
            serde_json::to_vec(&labels_second).unwrap()
        );
    }

    #[tokio::test]
    async fn one_symbol_failure_does_not_block_others() {
        struct SelectiveFeed;
        impl RequestRunner for SelectiveFeed {
            async fn run(&self, payload: RequestPayload) -> Result<RequestOutput, BrokerError> {
                let RequestPayload::HistoricalBars { symbol, .. } = &payload else {
                    return Ok(RequestOutput::Subscribed);
                };
                if symbol == "BAD" {
                    return Err(BrokerError::Fatal("no security definition".into()));
                }
                SyntheticFeed::clean().run(payload).await
            }
        }

        let store = BarStore::open_in_memory().unwrap();
        let config = fast_config();
        let governor = RateGovernor::new(SelectiveFeed, config.rate_limits.clone());
        let orch = Orchestrator::new(config, store, governor);
        let report = orch.run(one_session_spec(vec!["BAD".into(), "MSTR".into()])).await;

        assert!(!report.success);
        let good = report.items.iter().find(|i| i.symbol == "MSTR").unwrap();
        let bad = report.items.iter().find(|i| i.symbol == "BAD").unwrap();
        assert_eq!(good.status, ItemStatus::Completed);
        assert_eq!(bad.status, ItemStatus::Failed);
        assert!(bad.error.is_some());
        assert_eq!(good.bars_accepted, 390);
    }

    #[tokio::test]
    async fn status_returns_to_idle_after_run() {
        let orch = orchestrator(SyntheticFeed::clean(), fast_config());
        assert_eq!(orch.status().phase, PipelinePhase::Idle);
        let report = orch.run(one_session_spec(vec!["MSTR".into()])).await;
        assert!(report.success);
        let status = orch.status();
        assert_eq!(status.phase, PipelinePhase::Idle);
        assert!(status.run_id.is_none());
    }
}
