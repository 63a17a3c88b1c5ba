//! Priority-queued, rate-limited request governor.
//!
//! Every broker request in the system flows through here: rolling-window
//! token buckets per request kind, a priority queue ordered by
//! (priority, arrival), exponential retry with jitter for transient
//! failures, and best-effort cancellation. No other component retries
//! the broker.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::broker::session::BrokerError;
use crate::broker::wire::WireBar;
use crate::config::RateLimitConfig;
use crate::models::{RequestKind, RequestStatus, Timeframe};

// =============================================================================
// REQUESTS & TICKETS
// =============================================================================

/// Work the governor can schedule against the broker.
#[derive(Debug, Clone)]
pub enum RequestPayload {
    HistoricalBars {
        symbol: String,
        timeframe: Timeframe,
        range_start: chrono::DateTime<chrono::Utc>,
        range_end: chrono::DateTime<chrono::Utc>,
    },
    MarketData {
        symbol: String,
    },
    AccountInfo,
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestPayload::HistoricalBars { .. } => RequestKind::Historical,
            RequestPayload::MarketData { .. } => RequestKind::Market,
            RequestPayload::AccountInfo => RequestKind::Account,
        }
    }
}

/// Successful result of a governed request.
#[derive(Debug, Clone)]
pub enum RequestOutput {
    Bars(Vec<WireBar>),
    Account(Vec<(String, String)>),
    Subscribed,
}

/// Terminal failure of a governed request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GovernorError {
    #[error("request failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: BrokerError },
    #[error("request failed: {0}")]
    Failed(BrokerError),
    #[error("request cancelled")]
    Cancelled,
    #[error("governor shut down")]
    ShutDown,
}

/// Claim on a submitted request.
pub struct Ticket {
    pub id: u64,
    rx: oneshot::Receiver<Result<RequestOutput, GovernorError>>,
}

impl Ticket {
    /// Resolve to the terminal result.
    pub async fn wait(self) -> Result<RequestOutput, GovernorError> {
        self.rx.await.unwrap_or(Err(GovernorError::ShutDown))
    }
}

// =============================================================================
// RUNNER
// =============================================================================

/// Executes one attempt of a request against the broker session. The
/// governor owns deadlines, classification, and retries; the runner just
/// performs the exchange.
pub trait RequestRunner: Send + Sync + 'static {
    fn run(
        &self,
        payload: RequestPayload,
    ) -> impl std::future::Future<Output = Result<RequestOutput, BrokerError>> + Send;

    /// Best-effort abort of whatever the runner has in flight for this
    /// governor request id.
    fn abort(&self, _request_id: u64) {}

    /// Called when an attempt misses its deadline, so the session can
    /// track degradation.
    fn note_timeout(&self) {}
}

// =============================================================================
// QUEUE ORDERING
// =============================================================================

struct QueuedItem {
    id: u64,
    kind: RequestKind,
    /// Higher value wins.
    priority: u8,
    first_seen: Instant,
    seq: u64,
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for QueuedItem {}

impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: priority descending, then oldest first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.first_seen.cmp(&self.first_seen))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// =============================================================================
// STATS
// =============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct KindStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
    pub queue_depth: usize,
    pub average_wait_secs: f64,
}

impl KindStats {
    pub fn success_ratio(&self) -> f64 {
        let terminal = self.completed + self.failed;
        if terminal == 0 {
            0.0
        } else {
            self.completed as f64 / terminal as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GovernorStats {
    pub historical: KindStats,
    pub market: KindStats,
    pub account: KindStats,
    pub order: KindStats,
}

impl GovernorStats {
    pub fn for_kind(&self, kind: RequestKind) -> &KindStats {
        match kind {
            RequestKind::Historical => &self.historical,
            RequestKind::Market => &self.market,
            RequestKind::Account => &self.account,
            RequestKind::Order => &self.order,
        }
    }

    fn for_kind_mut(&mut self, kind: RequestKind) -> &mut KindStats {
        match kind {
            RequestKind::Historical => &mut self.historical,
            RequestKind::Market => &mut self.market,
            RequestKind::Account => &mut self.account,
            RequestKind::Order => &mut self.order,
        }
    }
}

// =============================================================================
// GOVERNOR
// =============================================================================

struct RequestEntry {
    payload: RequestPayload,
    priority: u8,
    status: RequestStatus,
    submitted_at: Instant,
    attempts: u32,
    cancel_tx: watch::Sender<bool>,
    done_tx: Option<oneshot::Sender<Result<RequestOutput, GovernorError>>>,
}

struct GovernorInner<R: RequestRunner> {
    runner: R,
    config: RateLimitConfig,
    queue: Mutex<BinaryHeap<QueuedItem>>,
    entries: Mutex<HashMap<u64, RequestEntry>>,
    /// Rolling window of recent grants per kind.
    buckets: Mutex<HashMap<RequestKind, VecDeque<Instant>>>,
    stats: Mutex<GovernorStats>,
    wake: Notify,
    accepting: Mutex<bool>,
    next_id: Mutex<u64>,
}

pub struct RateGovernor<R: RequestRunner> {
    inner: Arc<GovernorInner<R>>,
    scheduler: tokio::task::JoinHandle<()>,
}

impl<R: RequestRunner> RateGovernor<R> {
    pub fn new(runner: R, config: RateLimitConfig) -> Self {
        let inner = Arc::new(GovernorInner {
            runner,
            config,
            queue: Mutex::new(BinaryHeap::new()),
            entries: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
            stats: Mutex::new(GovernorStats::default()),
            wake: Notify::new(),
            accepting: Mutex::new(true),
            next_id: Mutex::new(1),
        });
        let scheduler_inner = Arc::clone(&inner);
        let scheduler = tokio::spawn(async move { scheduler_loop(scheduler_inner).await });
        Self { inner, scheduler }
    }

    /// Enqueue a request. Priority runs 0 (lowest) to 4 (most urgent).
    pub fn submit(&self, payload: RequestPayload, priority: u8) -> Result<Ticket, GovernorError> {
        if !*self.inner.accepting.lock() {
            return Err(GovernorError::ShutDown);
        }
        let kind = payload.kind();
        let priority = priority.min(4);
        let (done_tx, done_rx) = oneshot::channel();
        let (cancel_tx, _) = watch::channel(false);
        let now = Instant::now();

        let id = {
            let mut next = self.inner.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };

        {
            // The entry must read QUEUED before the scheduler can pop
            // it, or the pop would discard it as a dead item.
            let mut entries = self.inner.entries.lock();
            entries.insert(
                id,
                RequestEntry {
                    payload,
                    priority,
                    status: RequestStatus::Pending,
                    submitted_at: now,
                    attempts: 0,
                    cancel_tx,
                    done_tx: Some(done_tx),
                },
            );
            if let Some(entry) = entries.get_mut(&id) {
                entry.status = RequestStatus::Queued;
            }
        }
        self.inner
            .queue
            .lock()
            .push(QueuedItem { id, kind, priority, first_seen: now, seq: id });
        self.inner.stats.lock().for_kind_mut(kind).submitted += 1;
        self.inner.wake.notify_one();
        debug!(id, kind = %kind, priority, "request queued");
        Ok(Ticket { id, rx: done_rx })
    }

    /// Cancel a request. Queued requests leave without consuming a
    /// token; in-flight requests get a best-effort broker abort and
    /// resolve once the attempt observes the flag.
    pub fn cancel(&self, id: u64) {
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(&id) else { return };
        match entry.status {
            RequestStatus::Pending | RequestStatus::Queued => {
                entry.status = RequestStatus::Cancelled;
                let kind = entry.payload.kind();
                if let Some(tx) = entry.done_tx.take() {
                    let _ = tx.send(Err(GovernorError::Cancelled));
                }
                self.inner.stats.lock().for_kind_mut(kind).cancelled += 1;
            }
            RequestStatus::InFlight => {
                let _ = entry.cancel_tx.send(true);
                self.inner.runner.abort(id);
            }
            _ => {}
        }
    }

    pub fn stats(&self) -> GovernorStats {
        let mut stats = self.inner.stats.lock().clone();
        let entries = self.inner.entries.lock();
        for kind in RequestKind::ALL {
            let depth = entries
                .values()
                .filter(|e| {
                    e.payload.kind() == kind
                        && matches!(e.status, RequestStatus::Pending | RequestStatus::Queued)
                })
                .count();
            stats.for_kind_mut(kind).queue_depth = depth;
        }
        stats
    }

    /// Stop accepting new requests and cancel everything still queued.
    /// In-flight requests are left to finish; callers drain via their
    /// tickets.
    pub fn shutdown(&self) {
        *self.inner.accepting.lock() = false;
        let ids: Vec<u64> = {
            let entries = self.inner.entries.lock();
            entries
                .iter()
                .filter(|(_, e)| matches!(e.status, RequestStatus::Pending | RequestStatus::Queued))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.cancel(id);
        }
        self.inner.wake.notify_one();
        info!("rate governor intake closed");
    }
}

impl<R: RequestRunner> Drop for RateGovernor<R> {
    fn drop(&mut self) {
        self.scheduler.abort();
    }
}

// =============================================================================
// SCHEDULING
// =============================================================================

async fn scheduler_loop<R: RequestRunner>(inner: Arc<GovernorInner<R>>) {
    loop {
        let dispatched = try_dispatch(&inner);
        if dispatched {
            continue;
        }
        let wait = next_token_wait(&inner).unwrap_or(Duration::from_millis(250));
        tokio::select! {
            _ = inner.wake.notified() => {}
            _ = sleep(wait) => {}
        }
    }
}

/// Pick the highest-priority queued request whose bucket has capacity
/// and launch an attempt task for it. Blocked kinds never hold back
/// other kinds.
fn try_dispatch<R: RequestRunner>(inner: &Arc<GovernorInner<R>>) -> bool {
    let mut skipped = Vec::new();
    let picked = {
        let mut queue = inner.queue.lock();
        let mut picked = None;
        while let Some(item) = queue.pop() {
            let alive = {
                let entries = inner.entries.lock();
                entries
                    .get(&item.id)
                    .map(|e| e.status == RequestStatus::Queued)
                    .unwrap_or(false)
            };
            if !alive {
                continue; // cancelled while queued
            }
            if try_take_token(inner, item.kind) {
                picked = Some(item);
                break;
            }
            skipped.push(item);
        }
        for item in skipped {
            queue.push(item);
        }
        picked
    };

    let Some(item) = picked else { return false };

    let (payload, cancel_rx) = {
        let mut entries = inner.entries.lock();
        let Some(entry) = entries.get_mut(&item.id) else { return true };
        entry.status = RequestStatus::InFlight;
        let waited = entry.submitted_at.elapsed().as_secs_f64();
        let mut stats = inner.stats.lock();
        let kind_stats = stats.for_kind_mut(item.kind);
        // Exponential moving average over queue wait times.
        kind_stats.average_wait_secs = if kind_stats.average_wait_secs == 0.0 {
            waited
        } else {
            0.1 * waited + 0.9 * kind_stats.average_wait_secs
        };
        (entry.payload.clone(), entry.cancel_tx.subscribe())
    };

    let task_inner = Arc::clone(inner);
    tokio::spawn(async move {
        attempt_request(task_inner, item.id, item.kind, payload, cancel_rx).await;
    });
    true
}

fn try_take_token<R: RequestRunner>(inner: &Arc<GovernorInner<R>>, kind: RequestKind) -> bool {
    let limit = inner.config.limit_for(kind);
    let window = Duration::from_millis(limit.window_ms);
    let now = Instant::now();
    let mut buckets = inner.buckets.lock();
    let bucket = buckets.entry(kind).or_default();
    while let Some(front) = bucket.front() {
        if now.duration_since(*front) >= window {
            bucket.pop_front();
        } else {
            break;
        }
    }
    if bucket.len() < limit.max_in_window as usize {
        bucket.push_back(now);
        true
    } else {
        false
    }
}

/// Wait until a token somewhere becomes available again.
fn next_token_wait<R: RequestRunner>(inner: &Arc<GovernorInner<R>>) -> Option<Duration> {
    let buckets = inner.buckets.lock();
    let now = Instant::now();
    let mut earliest: Option<Duration> = None;
    for (kind, bucket) in buckets.iter() {
        let limit = inner.config.limit_for(*kind);
        if bucket.len() < limit.max_in_window as usize {
            continue;
        }
        if let Some(front) = bucket.front() {
            let window = Duration::from_millis(limit.window_ms);
            let free_in = window.saturating_sub(now.duration_since(*front));
            earliest = Some(match earliest {
                Some(d) => d.min(free_in),
                None => free_in,
            });
        }
    }
    earliest
}

/// Token wait used between retry attempts of one request.
async fn acquire_token<R: RequestRunner>(inner: &Arc<GovernorInner<R>>, kind: RequestKind) {
    loop {
        if try_take_token(inner, kind) {
            return;
        }
        let wait = next_token_wait(inner).unwrap_or(Duration::from_millis(100));
        sleep(wait.max(Duration::from_millis(10))).await;
    }
}

fn backoff_delay(config: &RateLimitConfig, attempt: u32) -> Duration {
    let exp = config.backoff_base_ms as f64 * config.backoff_factor.powi(attempt as i32 - 1);
    let capped = exp.min(config.backoff_cap_ms as f64);
    let jitter = 1.0 + config.jitter_factor * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
    Duration::from_millis((capped * jitter).max(0.0) as u64)
}

async fn attempt_request<R: RequestRunner>(
    inner: Arc<GovernorInner<R>>,
    id: u64,
    kind: RequestKind,
    payload: RequestPayload,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let limit = inner.config.limit_for(kind);
    let deadline = Duration::from_secs(limit.deadline_secs);
    let mut attempt: u32 = 0;

    let terminal = loop {
        attempt += 1;
        if *cancel_rx.borrow() {
            break Err(GovernorError::Cancelled);
        }

        let run = inner.runner.run(payload.clone());
        let outcome = tokio::select! {
            result = timeout(deadline, run) => result,
            _ = cancel_rx.changed() => {
                inner.runner.abort(id);
                break Err(GovernorError::Cancelled);
            }
        };

        let error = match outcome {
            Ok(Ok(output)) => break Ok(output),
            Ok(Err(e)) => e,
            Err(_) => {
                inner.runner.note_timeout();
                BrokerError::Timeout
            }
        };

        if !error.is_retryable() {
            break Err(GovernorError::Failed(error));
        }
        if attempt >= limit.attempt_cap {
            break Err(GovernorError::Exhausted { attempts: attempt, last: error });
        }

        inner.stats.lock().for_kind_mut(kind).retries += 1;
        let delay = backoff_delay(&inner.config, attempt);
        warn!(id, kind = %kind, attempt, delay_ms = delay.as_millis() as u64, error = %error,
            "transient failure, retrying");
        sleep(delay).await;
        acquire_token(&inner, kind).await;
    };

    let mut entries = inner.entries.lock();
    if let Some(entry) = entries.get_mut(&id) {
        entry.attempts = attempt;
        let mut stats = inner.stats.lock();
        let kind_stats = stats.for_kind_mut(kind);
        entry.status = match &terminal {
            Ok(_) => {
                kind_stats.completed += 1;
                RequestStatus::Completed
            }
            Err(GovernorError::Cancelled) => {
                kind_stats.cancelled += 1;
                RequestStatus::Cancelled
            }
            Err(_) => {
                kind_stats.failed += 1;
                RequestStatus::Failed
            }
        };
        if let Some(tx) = entry.done_tx.take() {
            let _ = tx.send(terminal);
        }
    }
    inner.wake.notify_one();
}
