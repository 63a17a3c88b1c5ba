//! Deterministic per-bar trade simulation.
//!
//! Every bar inside the configured entry window anchors one fixed LONG
//! trade: entry at the bar open, stop below, take above, then a forward
//! scan over subsequent bars of the same timeframe until a trigger, the
//! forced-close cutoff, or the end of the range. The scan is a pure
//! function of the bar sequence, so re-running a range reproduces every
//! label byte for byte.
//!
//! Trade state machine: OPEN -> (TP_HIT | SL_HIT | FORCED | ORPHAN),
//! terminal in one step once a trigger is seen.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::America::New_York;
use serde::Serialize;
use tracing::debug;

use crate::config::{FillModel, SimulationConfig, TieBreakPolicy};
use crate::error::ErrorKind;
use crate::models::{Bar, ExitReason, SimulationLabel, TradeOutcome, TradingSession};

/// Run-level aggregate over the produced labels.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceSummary {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub open_trades: usize,
    pub forced_closes: usize,
    pub indeterminate_skips: usize,
    pub win_rate_pct: f64,
    pub total_pnl: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub profit_factor: f64,
    pub avg_bars_held: f64,
}

impl PerformanceSummary {
    /// Fold another summary into this one, recomputing the derived
    /// ratios from the merged raw sums.
    pub fn merge(&mut self, other: &PerformanceSummary) {
        let bars_self = self.avg_bars_held * self.total_trades as f64;
        let bars_other = other.avg_bars_held * other.total_trades as f64;
        self.total_trades += other.total_trades;
        self.winning_trades += other.winning_trades;
        self.losing_trades += other.losing_trades;
        self.open_trades += other.open_trades;
        self.forced_closes += other.forced_closes;
        self.indeterminate_skips += other.indeterminate_skips;
        self.total_pnl += other.total_pnl;
        self.gross_profit += other.gross_profit;
        self.gross_loss += other.gross_loss;
        self.largest_win = self.largest_win.max(other.largest_win);
        self.largest_loss = self.largest_loss.min(other.largest_loss);
        if self.total_trades > 0 {
            self.win_rate_pct = self.winning_trades as f64 / self.total_trades as f64 * 100.0;
            self.avg_bars_held = (bars_self + bars_other) / self.total_trades as f64;
        }
        self.profit_factor = if self.gross_loss > 0.0 {
            self.gross_profit / self.gross_loss
        } else if self.gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
    }
}

/// Output of simulating one (symbol, timeframe) range.
#[derive(Debug, Clone)]
pub struct SimulationRun {
    pub labels: Vec<SimulationLabel>,
    /// Entry timestamps skipped under the indeterminate tie-break.
    pub indeterminate: Vec<DateTime<Utc>>,
    pub summary: PerformanceSummary,
}

pub struct TradeSimulator {
    config: SimulationConfig,
}

impl TradeSimulator {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    /// Simulate over a sorted bar sequence. Bars must all share one
    /// (symbol, timeframe); the range is taken as complete, so a trade
    /// that outlives it is labeled open-at-session-end.
    pub fn simulate(&self, bars: &[Bar]) -> Result<SimulationRun, ErrorKind> {
        let (window_start, window_end) = self.config.entry_window()?;
        let mut labels = Vec::new();
        let mut indeterminate = Vec::new();

        for (i, entry_bar) in bars.iter().enumerate() {
            if entry_bar.session() == TradingSession::Closed {
                continue;
            }
            let local_time = entry_bar.timestamp.with_timezone(&New_York).time();
            if local_time < window_start || local_time >= window_end {
                continue;
            }

            match self.run_trade(entry_bar, &bars[i + 1..]) {
                TradeEnd::Label(label) => labels.push(label),
                TradeEnd::Indeterminate => {
                    debug!(
                        symbol = %entry_bar.symbol,
                        timestamp = %entry_bar.timestamp,
                        "stop and take touched in one bar, label omitted"
                    );
                    indeterminate.push(entry_bar.timestamp);
                }
            }
        }

        let summary = summarize(&labels, indeterminate.len());
        Ok(SimulationRun { labels, indeterminate, summary })
    }

    /// Forward-scan a single trade to its terminal state.
    fn run_trade(&self, entry_bar: &Bar, forward: &[Bar]) -> TradeEnd {
        let entry = entry_bar.open;
        let stop = entry - self.config.stop_distance(entry);
        let take = entry + self.config.take_distance(entry);
        let shares = self.config.shares;
        let cutoff = forced_close_cutoff(entry_bar.timestamp, self.config.force_close_offset_minutes);

        for (offset, bar) in forward.iter().enumerate() {
            let bars_held = (offset + 1) as i64;

            // The forced-close cutoff outranks same-bar triggers.
            if let Some(cutoff) = cutoff {
                if bar.timestamp >= cutoff {
                    return TradeEnd::Label(self.finish(
                        entry_bar,
                        entry,
                        stop,
                        take,
                        shares,
                        bar.timestamp,
                        bar.close,
                        ExitReason::ForcedClose,
                        bars_held,
                    ));
                }
            }

            let hit_take = bar.high >= take;
            let hit_stop = bar.low <= stop;
            let (exit_reason, trigger_price) = match (hit_take, hit_stop) {
                (false, false) => continue,
                (true, false) => (ExitReason::TakeProfit, take),
                (false, true) => (ExitReason::StopLoss, stop),
                (true, true) => match self.config.tie_break {
                    TieBreakPolicy::StopLoss => (ExitReason::StopLoss, stop),
                    TieBreakPolicy::TakeProfit => (ExitReason::TakeProfit, take),
                    TieBreakPolicy::Indeterminate => return TradeEnd::Indeterminate,
                },
            };

            let exit_price = match self.config.fill_model {
                FillModel::TriggerPrice => trigger_price,
                // Fill at the next bar's open; the trigger price stands
                // in when the range ends on the trigger bar.
                FillModel::NextBarOpen => {
                    forward.get(offset + 1).map(|next| next.open).unwrap_or(trigger_price)
                }
            };

            return TradeEnd::Label(self.finish(
                entry_bar,
                entry,
                stop,
                take,
                shares,
                bar.timestamp,
                exit_price,
                exit_reason,
                bars_held,
            ));
        }

        // Range exhausted with the trade still open.
        TradeEnd::Label(SimulationLabel {
            symbol: entry_bar.symbol.clone(),
            timeframe: entry_bar.timeframe,
            entry_timestamp: entry_bar.timestamp,
            entry_price: entry,
            stop_price: stop,
            take_price: take,
            shares,
            exit_timestamp: None,
            exit_price: None,
            exit_reason: ExitReason::OpenAtSessionEnd,
            bars_to_exit: None,
            pnl: None,
            outcome: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        entry_bar: &Bar,
        entry: f64,
        stop: f64,
        take: f64,
        shares: i64,
        exit_timestamp: DateTime<Utc>,
        exit_price: f64,
        exit_reason: ExitReason,
        bars_held: i64,
    ) -> SimulationLabel {
        let pnl = (exit_price - entry) * shares as f64;
        let outcome = if pnl > 0.0 { TradeOutcome::Success } else { TradeOutcome::Failure };
        SimulationLabel {
            symbol: entry_bar.symbol.clone(),
            timeframe: entry_bar.timeframe,
            entry_timestamp: entry_bar.timestamp,
            entry_price: entry,
            stop_price: stop,
            take_price: take,
            shares,
            exit_timestamp: Some(exit_timestamp),
            exit_price: Some(exit_price),
            exit_reason,
            bars_to_exit: Some(bars_held),
            pnl: Some(pnl),
            outcome: Some(outcome),
        }
    }
}

enum TradeEnd {
    Label(SimulationLabel),
    Indeterminate,
}

/// Absolute instant of the forced close on the entry's local day:
/// `offset` minutes before after-hours trading ends.
fn forced_close_cutoff(entry: DateTime<Utc>, offset_minutes: i64) -> Option<DateTime<Utc>> {
    TradingSession::after_hours_end(entry).map(|end| end - Duration::minutes(offset_minutes))
}

fn summarize(labels: &[SimulationLabel], indeterminate_skips: usize) -> PerformanceSummary {
    let mut summary = PerformanceSummary {
        indeterminate_skips,
        largest_loss: 0.0,
        largest_win: 0.0,
        ..Default::default()
    };
    let mut gross_profit = 0.0f64;
    let mut gross_loss = 0.0f64;
    let mut bars_held_total = 0i64;

    for label in labels {
        match label.exit_reason {
            ExitReason::OpenAtSessionEnd => {
                summary.open_trades += 1;
                continue;
            }
            ExitReason::ForcedClose => summary.forced_closes += 1,
            _ => {}
        }
        summary.total_trades += 1;
        let pnl = label.pnl.unwrap_or(0.0);
        summary.total_pnl += pnl;
        bars_held_total += label.bars_to_exit.unwrap_or(0);
        if label.outcome == Some(TradeOutcome::Success) {
            summary.winning_trades += 1;
            gross_profit += pnl;
            summary.largest_win = summary.largest_win.max(pnl);
        } else {
            summary.losing_trades += 1;
            gross_loss += -pnl;
            summary.largest_loss = summary.largest_loss.min(pnl);
        }
    }

    if summary.total_trades > 0 {
        summary.win_rate_pct =
            summary.winning_trades as f64 / summary.total_trades as f64 * 100.0;
        summary.avg_bars_held = bars_held_total as f64 / summary.total_trades as f64;
    }
    summary.gross_profit = gross_profit;
    summary.gross_loss = gross_loss;
    summary.profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    summary
}
