//! Domain vocabulary shared by every subsystem.
//!
//! Bars, timeframes, trading sessions, quality reports, and simulation
//! labels. All timestamps are UTC; the exchange session calendar is
//! America/New_York and is only consulted through the helpers here.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::America::New_York;
use serde::{Deserialize, Serialize};

/// Minutes past local midnight where the regular session opens (09:30).
/// Intraday bar grids are anchored here.
const SESSION_ANCHOR_MINUTES: i64 = 9 * 60 + 30;

// =============================================================================
// TIMEFRAMES & SESSIONS
// =============================================================================

/// Supported bar timeframes, ordered finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    Min1,
    Min15,
    Hour1,
    Hour4,
    Day1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 5] = [
        Timeframe::Min1,
        Timeframe::Min15,
        Timeframe::Hour1,
        Timeframe::Hour4,
        Timeframe::Day1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Min1 => "1m",
            Timeframe::Min15 => "15m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour4 => "4h",
            Timeframe::Day1 => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Timeframe> {
        match s {
            "1m" => Some(Timeframe::Min1),
            "15m" => Some(Timeframe::Min15),
            "1h" => Some(Timeframe::Hour1),
            "4h" => Some(Timeframe::Hour4),
            "1d" => Some(Timeframe::Day1),
            _ => None,
        }
    }

    /// Bar width in minutes. The daily bar is treated as one regular
    /// session for grid purposes.
    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::Min1 => 1,
            Timeframe::Min15 => 15,
            Timeframe::Hour1 => 60,
            Timeframe::Hour4 => 240,
            Timeframe::Day1 => 24 * 60,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes())
    }

    /// Expected bar count inside one regular session (09:30 to 16:00).
    pub fn bars_per_regular_session(&self) -> usize {
        match self {
            Timeframe::Min1 => 390,
            Timeframe::Min15 => 26,
            Timeframe::Hour1 => 7,
            Timeframe::Hour4 => 2,
            Timeframe::Day1 => 1,
        }
    }

    /// Whether a timestamp sits on this timeframe's canonical grid.
    ///
    /// Intraday grids are anchored at the 09:30 session open, so a valid
    /// slot is `09:30 + k * width` for any whole `k` in the local day.
    /// The daily bar carries the session-open timestamp itself.
    pub fn is_on_grid(&self, ts: DateTime<Utc>) -> bool {
        let local = ts.with_timezone(&New_York);
        if local.second() != 0 || local.nanosecond() != 0 {
            return false;
        }
        let minute_of_day = i64::from(local.hour()) * 60 + i64::from(local.minute());
        match self {
            Timeframe::Day1 => minute_of_day == SESSION_ANCHOR_MINUTES,
            _ => (minute_of_day - SESSION_ANCHOR_MINUTES).rem_euclid(self.minutes()) == 0,
        }
    }

    /// Canonical grid slots inside the regular session of the local day
    /// containing `day_anchor` (itself any UTC instant on that day).
    pub fn regular_session_slots(&self, day_anchor: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let local = day_anchor.with_timezone(&New_York);
        if local.weekday().num_days_from_monday() >= 5 {
            return Vec::new();
        }
        let open = New_York
            .with_ymd_and_hms(local.year(), local.month(), local.day(), 9, 30, 0)
            .single();
        let Some(open) = open else { return Vec::new() };
        let mut slots = Vec::with_capacity(self.bars_per_regular_session());
        let step = self.duration();
        let close = open + Duration::minutes(390);
        let mut cursor = open;
        while cursor < close {
            slots.push(cursor.with_timezone(&Utc));
            if *self == Timeframe::Day1 {
                break;
            }
            cursor += step;
        }
        slots
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trading session phases of the exchange day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingSession {
    PreMarket,
    Regular,
    AfterHours,
    Closed,
}

impl TradingSession {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingSession::PreMarket => "pre_market",
            TradingSession::Regular => "regular",
            TradingSession::AfterHours => "after_hours",
            TradingSession::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<TradingSession> {
        match s {
            "pre_market" => Some(TradingSession::PreMarket),
            "regular" => Some(TradingSession::Regular),
            "after_hours" => Some(TradingSession::AfterHours),
            "closed" => Some(TradingSession::Closed),
            _ => None,
        }
    }

    /// Classify a UTC instant. Boundaries are start-inclusive and
    /// end-exclusive; weekends are closed.
    pub fn classify(ts: DateTime<Utc>) -> TradingSession {
        let local = ts.with_timezone(&New_York);
        if local.weekday().num_days_from_monday() >= 5 {
            return TradingSession::Closed;
        }
        let t = local.time();
        let pre = NaiveTime::from_hms_opt(4, 0, 0).unwrap();
        let open = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let close = NaiveTime::from_hms_opt(16, 0, 0).unwrap();
        let late = NaiveTime::from_hms_opt(20, 0, 0).unwrap();
        if t >= pre && t < open {
            TradingSession::PreMarket
        } else if t >= open && t < close {
            TradingSession::Regular
        } else if t >= close && t < late {
            TradingSession::AfterHours
        } else {
            TradingSession::Closed
        }
    }

    /// End of after-hours trading on the local day of `ts`, as UTC.
    pub fn after_hours_end(ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = ts.with_timezone(&New_York);
        New_York
            .with_ymd_and_hms(local.year(), local.month(), local.day(), 20, 0, 0)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl std::fmt::Display for TradingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// BARS
// =============================================================================

/// One OHLCV sample for a symbol over a timeframe-aligned interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub source: String,
    pub ingested_at: DateTime<Utc>,
}

impl Bar {
    /// Structural OHLCV invariants. Grid and session checks live in the
    /// validator; this is the hard floor no stored bar may violate.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.open < 0.0 || self.high < 0.0 || self.low < 0.0 || self.close < 0.0 {
            return Err("negative price".into());
        }
        if self.high < self.low {
            return Err(format!("high {} below low {}", self.high, self.low));
        }
        if self.open < self.low || self.open > self.high {
            return Err(format!("open {} outside [{}, {}]", self.open, self.low, self.high));
        }
        if self.close < self.low || self.close > self.high {
            return Err(format!("close {} outside [{}, {}]", self.close, self.low, self.high));
        }
        if self.volume < 0 {
            return Err(format!("negative volume {}", self.volume));
        }
        Ok(())
    }

    pub fn session(&self) -> TradingSession {
        TradingSession::classify(self.timestamp)
    }

    pub fn is_regular_hours(&self) -> bool {
        self.session() == TradingSession::Regular
    }

    /// True if both bars carry the same key and identical content.
    pub fn same_content(&self, other: &Bar) -> bool {
        self.symbol == other.symbol
            && self.timeframe == other.timeframe
            && self.timestamp == other.timestamp
            && self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
    }
}

// =============================================================================
// QUALITY
// =============================================================================

/// Severity of a validation issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }
}

/// Issue categories emitted by the validators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    OhlcLogic,
    TimeSeries,
    PriceMovement,
    VolumeCorrelation,
    CrossTfInconsistent,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::OhlcLogic => "OHLC_LOGIC",
            IssueCode::TimeSeries => "TIME_SERIES",
            IssueCode::PriceMovement => "PRICE_MOVEMENT",
            IssueCode::VolumeCorrelation => "VOLUME_CORRELATION",
            IssueCode::CrossTfInconsistent => "CROSS_TF_INCONSISTENT",
        }
    }
}

/// A single validation finding attached to a bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: IssueCode,
    pub severity: Severity,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(code: IssueCode, severity: Severity, message: impl Into<String>) -> Self {
        Self { code, severity, message: message.into() }
    }
}

/// Per-bar quality verdict. An ERROR issue always caps the score below
/// the acceptance threshold, so `accepted` implies error-free.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarQuality {
    pub score: f64,
    pub issues: Vec<ValidationIssue>,
    pub accepted: bool,
}

impl BarQuality {
    pub fn clean() -> Self {
        Self { score: 100.0, issues: Vec::new(), accepted: true }
    }

    pub fn has_error(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }
}

// =============================================================================
// SIMULATION LABELS
// =============================================================================

/// Why a simulated trade left the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    ForcedClose,
    OpenAtSessionEnd,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::ForcedClose => "FORCED_CLOSE",
            ExitReason::OpenAtSessionEnd => "OPEN_AT_SESSION_END",
        }
    }

    pub fn parse(s: &str) -> Option<ExitReason> {
        match s {
            "TAKE_PROFIT" => Some(ExitReason::TakeProfit),
            "STOP_LOSS" => Some(ExitReason::StopLoss),
            "FORCED_CLOSE" => Some(ExitReason::ForcedClose),
            "OPEN_AT_SESSION_END" => Some(ExitReason::OpenAtSessionEnd),
            _ => None,
        }
    }
}

/// Win or loss on realized pnl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeOutcome {
    Success,
    Failure,
}

impl TradeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOutcome::Success => "SUCCESS",
            TradeOutcome::Failure => "FAILURE",
        }
    }

    pub fn parse(s: &str) -> Option<TradeOutcome> {
        match s {
            "SUCCESS" => Some(TradeOutcome::Success),
            "FAILURE" => Some(TradeOutcome::Failure),
            _ => None,
        }
    }
}

/// Deterministic outcome of the fixed LONG entry anchored at one bar.
///
/// Exit fields are `None` only for `OpenAtSessionEnd`, where the
/// simulated range ended before any trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationLabel {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub entry_timestamp: DateTime<Utc>,
    pub entry_price: f64,
    pub stop_price: f64,
    pub take_price: f64,
    pub shares: i64,
    pub exit_timestamp: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub exit_reason: ExitReason,
    pub bars_to_exit: Option<i64>,
    pub pnl: Option<f64>,
    pub outcome: Option<TradeOutcome>,
}

// =============================================================================
// REQUESTS
// =============================================================================

/// Broker request categories, each with its own rate bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Historical,
    Market,
    Account,
    Order,
}

impl RequestKind {
    pub const ALL: [RequestKind; 4] = [
        RequestKind::Historical,
        RequestKind::Market,
        RequestKind::Account,
        RequestKind::Order,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Historical => "historical",
            RequestKind::Market => "market",
            RequestKind::Account => "account",
            RequestKind::Order => "order",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a governed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Queued,
    InFlight,
    Completed,
    Failed,
    Cancelled,
}
