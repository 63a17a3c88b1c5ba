//! Structured configuration for the whole pipeline.
//!
//! One `PipelineConfig` object is loaded from TOML at startup, selected
//! fields can be overridden from `TICKDNA_*` environment variables, and
//! every level rejects unknown keys. Cross-field validation runs once at
//! startup; any failure is fatal.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::indicators::IndicatorSpec;
use crate::models::RequestKind;

// =============================================================================
// BROKER
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BrokerConfig {
    /// host:port of the broker gateway socket.
    pub endpoint: String,
    pub client_id: u32,
    pub connect_timeout_secs: u64,
    /// The post-connect account probe must answer within this window or
    /// the session is declared not ready.
    pub probe_timeout_secs: u64,
    pub keepalive_secs: u64,
    /// Consecutive request timeouts before the session degrades.
    pub degraded_after_timeouts: u32,
    pub reconnect_backoff_base_secs: u64,
    pub reconnect_backoff_cap_secs: u64,
    /// Connection attempts before the session is declared unavailable.
    pub connect_attempt_cap: u32,
    /// Historical-bars allowance per single request, used by the batch
    /// planner to shard ranges.
    pub max_bars_per_request: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:7496".into(),
            client_id: 4,
            connect_timeout_secs: 10,
            probe_timeout_secs: 10,
            keepalive_secs: 30,
            degraded_after_timeouts: 3,
            reconnect_backoff_base_secs: 2,
            reconnect_backoff_cap_secs: 30,
            connect_attempt_cap: 5,
            max_bars_per_request: 2000,
        }
    }
}

// =============================================================================
// RATE LIMITS
// =============================================================================

/// Rolling-window limit plus retry policy for one request kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KindLimit {
    pub max_in_window: u32,
    pub window_ms: u64,
    pub attempt_cap: u32,
    pub deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RateLimitConfig {
    pub historical: KindLimit,
    pub market: KindLimit,
    pub account: KindLimit,
    pub order: KindLimit,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_cap_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            // 6 historical requests per rolling minute
            historical: KindLimit {
                max_in_window: 6,
                window_ms: 60_000,
                attempt_cap: 5,
                deadline_secs: 30,
            },
            // up to 100 concurrent market-data streams
            market: KindLimit {
                max_in_window: 100,
                window_ms: 1_000,
                attempt_cap: 5,
                deadline_secs: 10,
            },
            account: KindLimit {
                max_in_window: 60,
                window_ms: 60_000,
                attempt_cap: 5,
                deadline_secs: 10,
            },
            order: KindLimit {
                max_in_window: 30,
                window_ms: 60_000,
                attempt_cap: 3,
                deadline_secs: 10,
            },
            backoff_base_ms: 1_000,
            backoff_factor: 2.0,
            backoff_cap_ms: 30_000,
            jitter_factor: 0.1,
        }
    }
}

impl RateLimitConfig {
    pub fn limit_for(&self, kind: RequestKind) -> KindLimit {
        match kind {
            RequestKind::Historical => self.historical,
            RequestKind::Market => self.market,
            RequestKind::Account => self.account,
            RequestKind::Order => self.order,
        }
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Score penalties per issue class. An OHLC or time-series violation
/// zeroes the bar outright.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PenaltyWeights {
    pub ohlc_logic: f64,
    pub time_series: f64,
    pub tolerance_breach: f64,
    pub movement_sigma: f64,
    pub zero_volume: f64,
    pub volume_outlier: f64,
}

impl Default for PenaltyWeights {
    fn default() -> Self {
        Self {
            ohlc_logic: 100.0,
            time_series: 100.0,
            tolerance_breach: 20.0,
            movement_sigma: 2.0,
            zero_volume: 2.0,
            volume_outlier: 0.0,
        }
    }
}

/// Max inter-bar move per trading session, as a fraction of the previous
/// close. Regular hours are stricter than the extended sessions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MovementTolerances {
    pub regular: f64,
    pub pre_market: f64,
    pub after_hours: f64,
}

impl Default for MovementTolerances {
    fn default() -> Self {
        Self { regular: 0.20, pre_market: 0.30, after_hours: 0.30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ValidatorConfig {
    pub acceptance_threshold: f64,
    pub penalties: PenaltyWeights,
    pub tolerances: MovementTolerances,
    /// Rolling window for the sigma-move check.
    pub movement_window: usize,
    /// WARN when a move exceeds this many rolling standard deviations.
    pub movement_sigma: f64,
    /// INFO when volume exceeds the rolling median by this multiplier.
    pub volume_outlier_multiplier: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 95.0,
            penalties: PenaltyWeights::default(),
            tolerances: MovementTolerances::default(),
            movement_window: 50,
            movement_sigma: 8.0,
            volume_outlier_multiplier: 20.0,
        }
    }
}

// =============================================================================
// SIMULATION
// =============================================================================

/// How stop and take distances are derived from the entry price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopTakeMode {
    Absolute,
    Percent,
}

/// Resolution when one bar touches both the stop and the take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakPolicy {
    StopLoss,
    TakeProfit,
    Indeterminate,
}

/// Price at which a triggered exit is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillModel {
    NextBarOpen,
    TriggerPrice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SimulationConfig {
    pub mode: StopTakeMode,
    pub stop_abs: f64,
    pub take_abs: f64,
    pub stop_pct: f64,
    pub take_pct: f64,
    pub shares: i64,
    /// Entry window inside regular hours, exchange local, "HH:MM".
    pub entry_window_start: String,
    pub entry_window_end: String,
    /// Force-close this many minutes before after-hours trading ends.
    pub force_close_offset_minutes: i64,
    pub tie_break: TieBreakPolicy,
    pub fill_model: FillModel,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            mode: StopTakeMode::Absolute,
            stop_abs: 2.80,
            take_abs: 3.20,
            stop_pct: 0.004,
            take_pct: 0.005,
            shares: 50,
            entry_window_start: "09:45".into(),
            entry_window_end: "16:00".into(),
            force_close_offset_minutes: 30,
            tie_break: TieBreakPolicy::StopLoss,
            fill_model: FillModel::NextBarOpen,
        }
    }
}

impl SimulationConfig {
    pub fn entry_window(&self) -> Result<(NaiveTime, NaiveTime), ErrorKind> {
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s, "%H:%M")
                .map_err(|e| ErrorKind::ConfigInvalid(format!("bad entry window time '{s}': {e}")))
        };
        Ok((parse(&self.entry_window_start)?, parse(&self.entry_window_end)?))
    }

    /// Stop distance below entry for a given entry price.
    pub fn stop_distance(&self, entry: f64) -> f64 {
        match self.mode {
            StopTakeMode::Absolute => self.stop_abs,
            StopTakeMode::Percent => entry * self.stop_pct,
        }
    }

    /// Take distance above entry for a given entry price.
    pub fn take_distance(&self, entry: f64) -> f64 {
        match self.mode {
            StopTakeMode::Absolute => self.take_abs,
            StopTakeMode::Percent => entry * self.take_pct,
        }
    }
}

// =============================================================================
// STORAGE
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StorageConfig {
    pub path: String,
    /// Highest schema version this binary understands. A store reporting
    /// a newer version refuses to open.
    pub expected_schema_version: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: "tickdna.db".into(), expected_schema_version: 2 }
    }
}

// =============================================================================
// TOP LEVEL
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineConfig {
    pub broker: BrokerConfig,
    pub rate_limits: RateLimitConfig,
    pub validator: ValidatorConfig,
    pub simulation: SimulationConfig,
    pub storage: StorageConfig,
    /// Enabled indicator parameter sets.
    pub indicators: Vec<IndicatorSpec>,
    /// CPU worker budget for validation, indicators, and simulation.
    pub worker_budget: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            rate_limits: RateLimitConfig::default(),
            validator: ValidatorConfig::default(),
            simulation: SimulationConfig::default(),
            storage: StorageConfig::default(),
            indicators: IndicatorSpec::default_catalog(),
            worker_budget: default_worker_budget(),
        }
    }
}

fn default_worker_budget() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(8))
        .unwrap_or(4)
}

impl PipelineConfig {
    /// Load from a TOML file, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, ErrorKind> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ErrorKind::ConfigInvalid(format!("read {}: {e}", path.display())))?;
        let mut config: PipelineConfig = toml::from_str(&raw)
            .map_err(|e| ErrorKind::ConfigInvalid(format!("parse {}: {e}", path.display())))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides for deployment-varying fields.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TICKDNA_BROKER_ENDPOINT") {
            self.broker.endpoint = v;
        }
        if let Ok(v) = std::env::var("TICKDNA_CLIENT_ID") {
            if let Ok(id) = v.parse() {
                self.broker.client_id = id;
            }
        }
        if let Ok(v) = std::env::var("TICKDNA_DB_PATH") {
            self.storage.path = v;
        }
        if let Ok(v) = std::env::var("TICKDNA_WORKER_BUDGET") {
            if let Ok(n) = v.parse() {
                self.worker_budget = n;
            }
        }
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ErrorKind> {
        let fail = |msg: String| Err(ErrorKind::ConfigInvalid(msg));

        if self.broker.endpoint.split(':').count() != 2 {
            return fail(format!("broker endpoint '{}' is not host:port", self.broker.endpoint));
        }
        if self.broker.max_bars_per_request == 0 {
            return fail("max_bars_per_request must be positive".into());
        }
        if !(0.0..=100.0).contains(&self.validator.acceptance_threshold) {
            return fail(format!(
                "acceptance threshold {} outside [0, 100]",
                self.validator.acceptance_threshold
            ));
        }
        if self.validator.movement_window < 2 {
            return fail("movement window must be at least 2 bars".into());
        }
        for (name, limit) in [
            ("historical", self.rate_limits.historical),
            ("market", self.rate_limits.market),
            ("account", self.rate_limits.account),
            ("order", self.rate_limits.order),
        ] {
            if limit.max_in_window == 0 || limit.window_ms == 0 {
                return fail(format!("rate limit for {name} must allow at least one request"));
            }
            if limit.attempt_cap == 0 {
                return fail(format!("attempt cap for {name} must be at least 1"));
            }
        }
        if self.rate_limits.backoff_factor < 1.0 {
            return fail("backoff factor below 1 would shrink delays".into());
        }
        if self.simulation.shares <= 0 {
            return fail(format!("share quantity {} must be positive", self.simulation.shares));
        }
        if self.simulation.stop_abs <= 0.0 || self.simulation.take_abs <= 0.0 {
            return fail("absolute stop/take distances must be positive".into());
        }
        if self.simulation.stop_pct <= 0.0 || self.simulation.take_pct <= 0.0 {
            return fail("percent stop/take distances must be positive".into());
        }
        let (start, end) = self.simulation.entry_window()?;
        if start >= end {
            return fail(format!("entry window {start} .. {end} is empty"));
        }
        if self.simulation.force_close_offset_minutes < 0 {
            return fail("force-close offset cannot be negative".into());
        }
        if self.worker_budget == 0 {
            return fail("worker budget must be at least 1".into());
        }
        if self.storage.expected_schema_version < 1 {
            return fail("expected schema version must be at least 1".into());
        }
        // Duplicate parameter sets would collide on fingerprint.
        let mut seen = BTreeMap::new();
        for spec in &self.indicators {
            if let Some(prev) = seen.insert(spec.fingerprint(), spec) {
                return fail(format!(
                    "duplicate indicator parameter set: {} and {} share a fingerprint",
                    prev.describe(),
                    spec.describe()
                ));
            }
        }
        Ok(())
    }
}
