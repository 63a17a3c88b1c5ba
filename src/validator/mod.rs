//! Four-layer bar quality engine.
//!
//! Layers run per bar in order: OHLC logic, time-series shape, price
//! movement against session-aware tolerances, and volume correlation.
//! Each appends issues and subtracts configured penalty weights from a
//! score that starts at 100. A bar is accepted only with no ERROR issue
//! and a final score at or above the acceptance threshold.

pub mod cross_tf;

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::ValidatorConfig;
use crate::models::{
    Bar, BarQuality, IssueCode, Severity, Timeframe, TradingSession, ValidationIssue,
};

/// A bar with its quality verdict attached.
#[derive(Debug, Clone)]
pub struct ValidatedBar {
    pub bar: Bar,
    pub quality: BarQuality,
}

/// Aggregate over one validated batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub score_mean: f64,
    pub score_min: f64,
    /// Issue counts keyed "CODE/SEVERITY".
    pub issue_counts: BTreeMap<String, usize>,
}

/// Output of validating one (symbol, timeframe) batch.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub bars: Vec<ValidatedBar>,
    pub summary: ValidationSummary,
}

impl BatchOutcome {
    pub fn accepted_bars(&self) -> Vec<Bar> {
        self.bars
            .iter()
            .filter(|v| v.quality.accepted)
            .map(|v| v.bar.clone())
            .collect()
    }

    pub fn rejected(&self) -> impl Iterator<Item = &ValidatedBar> {
        self.bars.iter().filter(|v| !v.quality.accepted)
    }
}

/// Stateful per-batch validator. Rolling statistics reset per batch, so
/// batches for different (symbol, timeframe) keys never bleed into each
/// other.
pub struct BarValidator {
    config: ValidatorConfig,
}

impl BarValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Validate a batch in input order. Bars are expected sorted by
    /// timestamp; out-of-order rows are themselves a violation.
    pub fn validate_batch(&self, timeframe: Timeframe, bars: &[Bar]) -> BatchOutcome {
        let mut out = Vec::with_capacity(bars.len());
        let mut seen_timestamps: HashSet<DateTime<Utc>> = HashSet::with_capacity(bars.len());
        let mut last_timestamp: Option<DateTime<Utc>> = None;
        let mut prev_close: Option<f64> = None;
        let mut move_window: VecDeque<f64> = VecDeque::with_capacity(self.config.movement_window);
        let mut volume_window: VecDeque<i64> = VecDeque::with_capacity(self.config.movement_window);

        for bar in bars {
            let mut issues = Vec::new();
            let mut score = 100.0f64;
            let session = bar.session();

            self.layer_ohlc(bar, &mut issues, &mut score);
            self.layer_time_series(
                bar,
                timeframe,
                &mut seen_timestamps,
                &mut last_timestamp,
                &mut issues,
                &mut score,
            );
            self.layer_price_movement(
                bar,
                session,
                prev_close,
                &move_window,
                &mut issues,
                &mut score,
            );
            self.layer_volume(bar, session, &volume_window, &mut issues, &mut score);

            // Feed rolling state with the raw observation regardless of
            // the verdict; the window models the feed, not the store.
            if let Some(prev) = prev_close {
                if prev > 0.0 {
                    push_window(&mut move_window, (bar.close - prev) / prev, self.config.movement_window);
                }
            }
            push_window(&mut volume_window, bar.volume, self.config.movement_window);
            prev_close = Some(bar.close);

            let score = score.clamp(0.0, 100.0);
            let has_error = issues.iter().any(|i| i.severity == Severity::Error);
            let accepted = !has_error && score >= self.config.acceptance_threshold;
            out.push(ValidatedBar {
                bar: bar.clone(),
                quality: BarQuality { score, issues, accepted },
            });
        }

        let summary = summarize(&out);
        debug!(
            timeframe = %timeframe,
            total = summary.total,
            accepted = summary.accepted,
            rejected = summary.rejected,
            score_mean = summary.score_mean,
            "batch validated"
        );
        BatchOutcome { bars: out, summary }
    }

    /// Layer 1: structural OHLCV logic. Any violation rejects the bar.
    fn layer_ohlc(&self, bar: &Bar, issues: &mut Vec<ValidationIssue>, score: &mut f64) {
        if let Err(reason) = bar.check_invariants() {
            issues.push(ValidationIssue::new(IssueCode::OhlcLogic, Severity::Error, reason));
            *score -= self.config.penalties.ohlc_logic;
        }
    }

    /// Layer 2: grid alignment, duplicates, chronological order.
    fn layer_time_series(
        &self,
        bar: &Bar,
        timeframe: Timeframe,
        seen: &mut HashSet<DateTime<Utc>>,
        last: &mut Option<DateTime<Utc>>,
        issues: &mut Vec<ValidationIssue>,
        score: &mut f64,
    ) {
        if !timeframe.is_on_grid(bar.timestamp) {
            issues.push(ValidationIssue::new(
                IssueCode::TimeSeries,
                Severity::Error,
                format!("timestamp {} off the {} grid", bar.timestamp, timeframe),
            ));
            *score -= self.config.penalties.time_series;
        }
        if !seen.insert(bar.timestamp) {
            issues.push(ValidationIssue::new(
                IssueCode::TimeSeries,
                Severity::Error,
                format!("duplicate timestamp {}", bar.timestamp),
            ));
            *score -= self.config.penalties.time_series;
        }
        if let Some(prev) = *last {
            if bar.timestamp < prev {
                issues.push(ValidationIssue::new(
                    IssueCode::TimeSeries,
                    Severity::Error,
                    format!("timestamp {} breaks chronological order", bar.timestamp),
                ));
                *score -= self.config.penalties.time_series;
            }
        }
        *last = Some((*last).map_or(bar.timestamp, |prev| prev.max(bar.timestamp)));
    }

    /// Layer 3: inter-bar move against the session tolerance table plus
    /// a rolling-sigma outlier check.
    fn layer_price_movement(
        &self,
        bar: &Bar,
        session: TradingSession,
        prev_close: Option<f64>,
        window: &VecDeque<f64>,
        issues: &mut Vec<ValidationIssue>,
        score: &mut f64,
    ) {
        let Some(prev) = prev_close else { return };
        if prev <= 0.0 {
            return;
        }
        let change = (bar.close - prev) / prev;

        let tolerance = match session {
            TradingSession::Regular => Some(self.config.tolerances.regular),
            TradingSession::PreMarket => Some(self.config.tolerances.pre_market),
            TradingSession::AfterHours => Some(self.config.tolerances.after_hours),
            // Gaps across closed hours are expected.
            TradingSession::Closed => None,
        };
        if let Some(tolerance) = tolerance {
            if change.abs() > tolerance {
                issues.push(ValidationIssue::new(
                    IssueCode::PriceMovement,
                    Severity::Error,
                    format!(
                        "{:.2}% move exceeds the {:.0}% {} tolerance",
                        change.abs() * 100.0,
                        tolerance * 100.0,
                        session
                    ),
                ));
                *score -= self.config.penalties.tolerance_breach;
            }
        }

        // Rolling-sigma check only once the window carries signal.
        if window.len() >= 10 {
            let n = window.len() as f64;
            let mean = window.iter().sum::<f64>() / n;
            let var = window.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0);
            let sd = var.sqrt();
            if sd > 0.0 && (change - mean).abs() > self.config.movement_sigma * sd {
                issues.push(ValidationIssue::new(
                    IssueCode::PriceMovement,
                    Severity::Warn,
                    format!(
                        "move of {:.3}% is beyond {} rolling standard deviations",
                        change * 100.0,
                        self.config.movement_sigma
                    ),
                ));
                *score -= self.config.penalties.movement_sigma;
            }
        }
    }

    /// Layer 4: zero-volume and volume-outlier checks.
    fn layer_volume(
        &self,
        bar: &Bar,
        session: TradingSession,
        volume_window: &VecDeque<i64>,
        issues: &mut Vec<ValidationIssue>,
        score: &mut f64,
    ) {
        let quiet_session =
            matches!(session, TradingSession::Closed | TradingSession::PreMarket);
        if bar.volume == 0 && !quiet_session {
            issues.push(ValidationIssue::new(
                IssueCode::VolumeCorrelation,
                Severity::Warn,
                format!("zero volume during {session}"),
            ));
            *score -= self.config.penalties.zero_volume;
        }

        if volume_window.len() >= 10 {
            let mut sorted: Vec<i64> = volume_window.iter().copied().collect();
            sorted.sort_unstable();
            let median = sorted[sorted.len() / 2];
            if median > 0
                && (bar.volume as f64) > median as f64 * self.config.volume_outlier_multiplier
            {
                issues.push(ValidationIssue::new(
                    IssueCode::VolumeCorrelation,
                    Severity::Info,
                    format!(
                        "volume {} exceeds {}x the rolling median {}",
                        bar.volume, self.config.volume_outlier_multiplier, median
                    ),
                ));
                *score -= self.config.penalties.volume_outlier;
            }
        }
    }
}

fn push_window<T>(window: &mut VecDeque<T>, value: T, cap: usize) {
    window.push_back(value);
    while window.len() > cap {
        window.pop_front();
    }
}

fn summarize(bars: &[ValidatedBar]) -> ValidationSummary {
    let total = bars.len();
    let accepted = bars.iter().filter(|b| b.quality.accepted).count();
    let mut issue_counts: BTreeMap<String, usize> = BTreeMap::new();
    for validated in bars {
        for issue in &validated.quality.issues {
            let key = format!("{}/{}", issue.code.as_str(), issue.severity.as_str());
            *issue_counts.entry(key).or_default() += 1;
        }
    }
    let score_mean = if total == 0 {
        0.0
    } else {
        bars.iter().map(|b| b.quality.score).sum::<f64>() / total as f64
    };
    let score_min = bars.iter().map(|b| b.quality.score).fold(100.0, f64::min);
    ValidationSummary {
        total,
        accepted,
        rejected: total - accepted,
        score_mean,
        score_min,
        issue_counts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ValidatorConfig;
    use chrono::{Duration, TimeZone, Utc};
    use chrono_tz::America::New_York;

    fn session_bar(minute_offset: i64, o: f64, h: f64, l: f64, c: f64, v: i64) -> Bar {
        let open = New_York.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        Bar {
            symbol: "MSTR".into(),
            timeframe: Timeframe::Min1,
            timestamp: (open + Duration::minutes(minute_offset)).with_timezone(&Utc),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
            source: "broker".into(),
            ingested_at: Utc.with_ymd_and_hms(2024, 1, 15, 22, 0, 0).unwrap(),
        }
    }

    fn steady_bars(count: i64) -> Vec<Bar> {
        (0..count)
            .map(|i| {
                let px = 150.0 + (i % 5) as f64 * 0.05;
                session_bar(i, px, px + 0.2, px - 0.2, px + 0.05, 1000 + i)
            })
            .collect()
    }

    fn validator() -> BarValidator {
        BarValidator::new(ValidatorConfig::default())
    }

    #[test]
    fn clean_batch_scores_one_hundred() {
        let outcome = validator().validate_batch(Timeframe::Min1, &steady_bars(30));
        assert_eq!(outcome.summary.total, 30);
        assert_eq!(outcome.summary.accepted, 30);
        assert!((outcome.summary.score_mean - 100.0).abs() < f64::EPSILON);
        assert!(outcome.summary.issue_counts.is_empty());
    }

    #[test]
    fn inverted_range_is_rejected_with_ohlc_error() {
        let mut bars = steady_bars(3);
        bars[1].low = 100.0;
        bars[1].high = 99.0;
        bars[1].open = 99.5;
        bars[1].close = 99.5;
        let outcome = validator().validate_batch(Timeframe::Min1, &bars);
        let bad = &outcome.bars[1];
        assert!(!bad.quality.accepted);
        assert_eq!(bad.quality.issues[0].code, IssueCode::OhlcLogic);
        assert_eq!(bad.quality.issues[0].severity, Severity::Error);
        assert_eq!(outcome.summary.rejected, 1);
        assert_eq!(outcome.summary.issue_counts.get("OHLC_LOGIC/ERROR"), Some(&1));
    }

    #[test]
    fn duplicate_timestamps_are_rejected() {
        let mut bars = steady_bars(3);
        bars[2].timestamp = bars[1].timestamp;
        let outcome = validator().validate_batch(Timeframe::Min1, &bars);
        assert!(!outcome.bars[2].quality.accepted);
        assert!(outcome.bars[2]
            .quality
            .issues
            .iter()
            .any(|i| i.code == IssueCode::TimeSeries && i.message.contains("duplicate")));
    }

    #[test]
    fn off_grid_timestamp_is_rejected() {
        let mut bars = steady_bars(2);
        bars[1].timestamp = bars[1].timestamp + Duration::seconds(30);
        let outcome = validator().validate_batch(Timeframe::Min1, &bars);
        assert!(!outcome.bars[1].quality.accepted);
    }

    #[test]
    fn out_of_order_bar_is_rejected() {
        let mut bars = steady_bars(3);
        bars[2].timestamp = bars[0].timestamp - Duration::minutes(1);
        let outcome = validator().validate_batch(Timeframe::Min1, &bars);
        assert!(!outcome.bars[2].quality.accepted);
    }

    #[test]
    fn regular_hours_tolerance_breach_is_error() {
        let mut bars = steady_bars(2);
        // 30% jump in regular hours against the 20% tolerance.
        bars[1].open = 195.0;
        bars[1].close = 195.0;
        bars[1].high = 196.0;
        bars[1].low = 194.0;
        let outcome = validator().validate_batch(Timeframe::Min1, &bars);
        let bad = &outcome.bars[1];
        assert!(!bad.quality.accepted);
        assert!(bad
            .quality
            .issues
            .iter()
            .any(|i| i.code == IssueCode::PriceMovement && i.severity == Severity::Error));
    }

    #[test]
    fn zero_volume_in_regular_hours_warns_but_accepts() {
        let mut bars = steady_bars(2);
        bars[1].volume = 0;
        let outcome = validator().validate_batch(Timeframe::Min1, &bars);
        let flagged = &outcome.bars[1];
        assert!(flagged.quality.accepted, "warn must not reject on its own");
        assert!(flagged
            .quality
            .issues
            .iter()
            .any(|i| i.code == IssueCode::VolumeCorrelation && i.severity == Severity::Warn));
        assert!(flagged.quality.score < 100.0);
    }

    #[test]
    fn sigma_outlier_raises_warn() {
        let mut bars = steady_bars(40);
        // Still inside the 20% tolerance, far outside 8 rolling sigmas.
        let base = bars[30].close;
        bars[31].open = base * 1.08;
        bars[31].close = base * 1.08;
        bars[31].high = base * 1.09;
        bars[31].low = base * 1.07;
        let outcome = validator().validate_batch(Timeframe::Min1, &bars);
        assert!(outcome.bars[31]
            .quality
            .issues
            .iter()
            .any(|i| i.code == IssueCode::PriceMovement && i.severity == Severity::Warn));
    }

    #[test]
    fn volume_outlier_is_informational_only() {
        let mut bars = steady_bars(20);
        bars[15].volume = 1_000_000;
        let outcome = validator().validate_batch(Timeframe::Min1, &bars);
        let flagged = &outcome.bars[15];
        assert!(flagged.quality.accepted);
        assert!(flagged
            .quality
            .issues
            .iter()
            .any(|i| i.code == IssueCode::VolumeCorrelation && i.severity == Severity::Info));
        assert!((flagged.quality.score - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn accepted_bars_helper_filters_rejects() {
        let mut bars = steady_bars(5);
        bars[2].high = bars[2].low - 1.0;
        let outcome = validator().validate_batch(Timeframe::Min1, &bars);
        assert_eq!(outcome.accepted_bars().len(), 4);
        assert_eq!(outcome.rejected().count(), 1);
    }
}
