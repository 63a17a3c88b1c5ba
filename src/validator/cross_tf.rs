//! Consistency checks between aligned timeframes.
//!
//! For each coarser bar exactly covered by a set of finer bars, the
//! aggregation identity must hold: open of the first, close of the
//! last, max of highs, min of lows, sum of volumes. Mismatches flag the
//! coarser bar and produce a refetch directive per policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::{Bar, IssueCode, Severity, Timeframe, ValidationIssue};

const PRICE_EPSILON: f64 = 1e-9;

/// Which side of a disagreement gets refetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefetchPolicy {
    Coarser,
    Finer,
}

impl Default for RefetchPolicy {
    fn default() -> Self {
        RefetchPolicy::Coarser
    }
}

/// Range to fetch again after an inconsistency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefetchDirective {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
}

/// One detected inconsistency, attached to the coarser bar.
#[derive(Debug, Clone)]
pub struct CrossTfFinding {
    pub symbol: String,
    pub coarse_timeframe: Timeframe,
    pub coarse_timestamp: DateTime<Utc>,
    pub issue: ValidationIssue,
    pub refetch: RefetchDirective,
}

pub struct CrossTfValidator {
    policy: RefetchPolicy,
}

impl CrossTfValidator {
    pub fn new(policy: RefetchPolicy) -> Self {
        Self { policy }
    }

    /// Compare accepted bars of a coarser timeframe against the finer
    /// bars of the same symbol over the same window. Coarse bars
    /// without an exact finer cover are skipped; partial covers are a
    /// gap problem, not an aggregation problem.
    pub fn check(
        &self,
        coarse_timeframe: Timeframe,
        coarse: &[Bar],
        fine_timeframe: Timeframe,
        fine: &[Bar],
    ) -> Vec<CrossTfFinding> {
        let mut findings = Vec::new();
        if coarse_timeframe.minutes() <= fine_timeframe.minutes() {
            return findings;
        }
        let per_coarse = (coarse_timeframe.minutes() / fine_timeframe.minutes()) as usize;

        for coarse_bar in coarse {
            let window_end = coarse_bar.timestamp + coarse_timeframe.duration();
            let cover: Vec<&Bar> = fine
                .iter()
                .filter(|b| b.timestamp >= coarse_bar.timestamp && b.timestamp < window_end)
                .collect();
            if cover.len() != per_coarse || cover[0].timestamp != coarse_bar.timestamp {
                continue;
            }

            let agg_open = cover[0].open;
            let agg_close = cover[cover.len() - 1].close;
            let agg_high = cover.iter().map(|b| b.high).fold(f64::MIN, f64::max);
            let agg_low = cover.iter().map(|b| b.low).fold(f64::MAX, f64::min);
            let agg_volume: i64 = cover.iter().map(|b| b.volume).sum();

            let mut mismatches = Vec::new();
            if (coarse_bar.open - agg_open).abs() > PRICE_EPSILON {
                mismatches.push(format!("open {} vs {}", coarse_bar.open, agg_open));
            }
            if (coarse_bar.close - agg_close).abs() > PRICE_EPSILON {
                mismatches.push(format!("close {} vs {}", coarse_bar.close, agg_close));
            }
            if (coarse_bar.high - agg_high).abs() > PRICE_EPSILON {
                mismatches.push(format!("high {} vs {}", coarse_bar.high, agg_high));
            }
            if (coarse_bar.low - agg_low).abs() > PRICE_EPSILON {
                mismatches.push(format!("low {} vs {}", coarse_bar.low, agg_low));
            }
            if coarse_bar.volume != agg_volume {
                mismatches.push(format!("volume {} vs {}", coarse_bar.volume, agg_volume));
            }
            if mismatches.is_empty() {
                continue;
            }

            let (refetch_tf, range_start, range_end) = match self.policy {
                RefetchPolicy::Coarser => (coarse_timeframe, coarse_bar.timestamp, window_end),
                RefetchPolicy::Finer => (fine_timeframe, coarse_bar.timestamp, window_end),
            };
            warn!(
                symbol = %coarse_bar.symbol,
                coarse = %coarse_timeframe,
                fine = %fine_timeframe,
                timestamp = %coarse_bar.timestamp,
                detail = %mismatches.join(", "),
                "cross-timeframe aggregation mismatch"
            );
            findings.push(CrossTfFinding {
                symbol: coarse_bar.symbol.clone(),
                coarse_timeframe,
                coarse_timestamp: coarse_bar.timestamp,
                issue: ValidationIssue::new(
                    IssueCode::CrossTfInconsistent,
                    Severity::Warn,
                    format!(
                        "{} bar disagrees with {} aggregation: {}",
                        coarse_timeframe,
                        fine_timeframe,
                        mismatches.join(", ")
                    ),
                ),
                refetch: RefetchDirective {
                    symbol: coarse_bar.symbol.clone(),
                    timeframe: refetch_tf,
                    range_start,
                    range_end,
                },
            });
        }
        findings
    }

    /// Aggregation pairs checked between adjacent timeframes.
    pub fn aggregation_pairs() -> [(Timeframe, Timeframe); 4] {
        [
            (Timeframe::Min15, Timeframe::Min1),
            (Timeframe::Hour1, Timeframe::Min15),
            (Timeframe::Hour4, Timeframe::Hour1),
            (Timeframe::Day1, Timeframe::Hour4),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use chrono_tz::America::New_York;

    fn fine_bars(start_minute: i64, count: i64) -> Vec<Bar> {
        let open = New_York.with_ymd_and_hms(2024, 1, 15, 9, 30, 0).unwrap();
        (0..count)
            .map(|i| {
                let px = 150.0 + i as f64 * 0.1;
                Bar {
                    symbol: "MSTR".into(),
                    timeframe: Timeframe::Min1,
                    timestamp: (open + Duration::minutes(start_minute + i)).with_timezone(&Utc),
                    open: px,
                    high: px + 0.5,
                    low: px - 0.5,
                    close: px + 0.1,
                    volume: 100 + i,
                    source: "broker".into(),
                    ingested_at: Utc.with_ymd_and_hms(2024, 1, 15, 22, 0, 0).unwrap(),
                }
            })
            .collect()
    }

    fn aggregate(fine: &[Bar], timeframe: Timeframe) -> Bar {
        Bar {
            symbol: fine[0].symbol.clone(),
            timeframe,
            timestamp: fine[0].timestamp,
            open: fine[0].open,
            high: fine.iter().map(|b| b.high).fold(f64::MIN, f64::max),
            low: fine.iter().map(|b| b.low).fold(f64::MAX, f64::min),
            close: fine[fine.len() - 1].close,
            volume: fine.iter().map(|b| b.volume).sum(),
            source: "broker".into(),
            ingested_at: fine[0].ingested_at,
        }
    }

    #[test]
    fn exact_aggregation_passes() {
        let fine = fine_bars(0, 15);
        let coarse = aggregate(&fine, Timeframe::Min15);
        let validator = CrossTfValidator::new(RefetchPolicy::Coarser);
        let findings = validator.check(Timeframe::Min15, &[coarse], Timeframe::Min1, &fine);
        assert!(findings.is_empty());
    }

    #[test]
    fn volume_mismatch_flags_coarse_bar() {
        let fine = fine_bars(0, 15);
        let mut coarse = aggregate(&fine, Timeframe::Min15);
        coarse.volume += 500;
        let validator = CrossTfValidator::new(RefetchPolicy::Coarser);
        let findings = validator.check(Timeframe::Min15, &[coarse.clone()], Timeframe::Min1, &fine);
        assert_eq!(findings.len(), 1);
        let finding = &findings[0];
        assert_eq!(finding.issue.code, IssueCode::CrossTfInconsistent);
        assert_eq!(finding.issue.severity, Severity::Warn);
        assert_eq!(finding.refetch.timeframe, Timeframe::Min15);
        assert_eq!(finding.refetch.range_start, coarse.timestamp);
    }

    #[test]
    fn high_mismatch_flags_with_finer_refetch_policy() {
        let fine = fine_bars(0, 15);
        let mut coarse = aggregate(&fine, Timeframe::Min15);
        coarse.high += 1.0;
        let validator = CrossTfValidator::new(RefetchPolicy::Finer);
        let findings = validator.check(Timeframe::Min15, &[coarse], Timeframe::Min1, &fine);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].refetch.timeframe, Timeframe::Min1);
    }

    #[test]
    fn partial_cover_is_skipped() {
        // Only 10 of the 15 covering minutes exist.
        let fine = fine_bars(0, 10);
        let full = fine_bars(0, 15);
        let coarse = aggregate(&full, Timeframe::Min15);
        let validator = CrossTfValidator::new(RefetchPolicy::Coarser);
        let findings = validator.check(Timeframe::Min15, &[coarse], Timeframe::Min1, &fine);
        assert!(findings.is_empty());
    }

    #[test]
    fn finer_than_coarse_input_is_ignored() {
        let fine = fine_bars(0, 15);
        let validator = CrossTfValidator::new(RefetchPolicy::Coarser);
        let findings = validator.check(Timeframe::Min1, &fine, Timeframe::Min15, &fine);
        assert!(findings.is_empty());
    }
}
