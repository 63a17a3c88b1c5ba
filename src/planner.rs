//! Batch planning across the (symbol x timeframe) matrix.
//!
//! Turns a set of download targets into an ordered request sequence with
//! priorities. Ranges larger than the broker's per-request bar allowance
//! are sharded into stitched subranges; adjacency and no-overlap are
//! invariants of the output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Timeframe;

/// One requested (symbol, timeframe, range) download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanTarget {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
}

/// Batch execution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    Sequential,
    ParallelBySymbol,
    ParallelByTimeframe,
    Mixed,
}

/// One plannable broker request, already sharded to the allowance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub priority: u8,
}

const PRIORITY_NORMAL: u8 = 2;
const PRIORITY_HIGH: u8 = 3;

/// Plans request batches under one strategy.
pub struct BatchPlanner {
    max_bars_per_request: usize,
    /// Symbols dispatched together per timeframe slot under
    /// parallel-by-symbol.
    parallel_width: usize,
}

impl BatchPlanner {
    pub fn new(max_bars_per_request: usize) -> Self {
        Self { max_bars_per_request: max_bars_per_request.max(1), parallel_width: 8 }
    }

    pub fn with_parallel_width(mut self, width: usize) -> Self {
        self.parallel_width = width.max(1);
        self
    }

    /// Produce the ordered request sequence for a target set. Output
    /// order is the dispatch order for requests of equal priority.
    pub fn plan(&self, targets: &[PlanTarget], strategy: BatchStrategy) -> Vec<PlannedRequest> {
        match strategy {
            BatchStrategy::Sequential => self.plan_sequential(targets),
            BatchStrategy::ParallelBySymbol => self.plan_parallel_by_symbol(targets),
            BatchStrategy::ParallelByTimeframe => self.plan_parallel_by_timeframe(targets),
            BatchStrategy::Mixed => self.plan_mixed(targets),
        }
    }

    /// Split one target into adjacent, non-overlapping subranges that
    /// each fit the per-request allowance.
    pub fn shard(&self, target: &PlanTarget, priority: u8) -> Vec<PlannedRequest> {
        let step = target
            .timeframe
            .duration()
            .checked_mul(self.max_bars_per_request as i32)
            .unwrap_or_else(|| target.timeframe.duration());
        let mut out = Vec::new();
        let mut cursor = target.range_start;
        while cursor < target.range_end {
            let end = (cursor + step).min(target.range_end);
            out.push(PlannedRequest {
                symbol: target.symbol.clone(),
                timeframe: target.timeframe,
                range_start: cursor,
                range_end: end,
                priority,
            });
            cursor = end;
        }
        out
    }

    /// One request at a time: symbol-major, timeframe-minor.
    fn plan_sequential(&self, targets: &[PlanTarget]) -> Vec<PlannedRequest> {
        let mut symbols = unique_symbols(targets);
        symbols.sort();
        let mut out = Vec::new();
        for symbol in symbols {
            for timeframe in Timeframe::ALL {
                for target in targets.iter().filter(|t| t.symbol == symbol && t.timeframe == timeframe) {
                    out.extend(self.shard(target, PRIORITY_NORMAL));
                }
            }
        }
        out
    }

    /// For each timeframe slot, up to `parallel_width` symbols enqueued
    /// at equal priority.
    fn plan_parallel_by_symbol(&self, targets: &[PlanTarget]) -> Vec<PlannedRequest> {
        let mut out = Vec::new();
        for timeframe in Timeframe::ALL {
            let slot: Vec<&PlanTarget> = targets.iter().filter(|t| t.timeframe == timeframe).collect();
            for group in slot.chunks(self.parallel_width) {
                for target in group {
                    out.extend(self.shard(target, PRIORITY_NORMAL));
                }
            }
        }
        out
    }

    /// For each symbol, all timeframes enqueued together.
    fn plan_parallel_by_timeframe(&self, targets: &[PlanTarget]) -> Vec<PlannedRequest> {
        let mut symbols = unique_symbols(targets);
        symbols.sort();
        let mut out = Vec::new();
        for symbol in symbols {
            for timeframe in Timeframe::ALL {
                for target in targets.iter().filter(|t| t.symbol == symbol && t.timeframe == timeframe) {
                    out.extend(self.shard(target, PRIORITY_NORMAL));
                }
            }
        }
        out
    }

    /// Round-robin across the matrix, finer timeframes first so
    /// downstream validation unblocks as early as possible. Finer
    /// timeframes also carry a higher priority.
    fn plan_mixed(&self, targets: &[PlanTarget]) -> Vec<PlannedRequest> {
        // Shard every cell up front, keeping per-cell FIFO order.
        let mut cells: Vec<(Timeframe, std::collections::VecDeque<PlannedRequest>)> = Vec::new();
        for timeframe in Timeframe::ALL {
            for target in targets.iter().filter(|t| t.timeframe == timeframe) {
                let priority = if timeframe == Timeframe::Min1 {
                    PRIORITY_HIGH
                } else {
                    PRIORITY_NORMAL
                };
                let shards = self.shard(target, priority);
                if !shards.is_empty() {
                    cells.push((timeframe, shards.into()));
                }
            }
        }
        // Cells are already ordered finest-first because Timeframe::ALL
        // runs from 1m to 1d.
        let mut out = Vec::new();
        while cells.iter().any(|(_, q)| !q.is_empty()) {
            for (_, queue) in cells.iter_mut() {
                if let Some(request) = queue.pop_front() {
                    out.push(request);
                }
            }
        }
        out
    }
}

fn unique_symbols(targets: &[PlanTarget]) -> Vec<String> {
    let mut symbols: Vec<String> = targets.iter().map(|t| t.symbol.clone()).collect();
    symbols.dedup();
    let mut seen = std::collections::HashSet::new();
    symbols.retain(|s| seen.insert(s.clone()));
    symbols
}
