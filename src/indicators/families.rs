//! Streaming indicator state machines.
//!
//! Each family consumes bars one at a time and emits a value plus a
//! validity flag; the flag stays false until the warmup window has
//! filled. No state ever looks ahead, and none of the math touches a
//! clock or RNG, so replaying a bar sequence reproduces every output
//! bit for bit.

use std::collections::VecDeque;

use chrono_tz::America::New_York;

use crate::models::Bar;

/// One emitted sample. `value` is NaN whenever `valid` is false.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorPoint {
    pub value: f64,
    pub valid: bool,
}

impl IndicatorPoint {
    pub fn warming() -> Self {
        Self { value: f64::NAN, valid: false }
    }

    pub fn ready(value: f64) -> Self {
        Self { value, valid: true }
    }
}

/// A streaming indicator over one (symbol, timeframe) bar sequence.
pub trait IndicatorState: Send {
    fn update(&mut self, bar: &Bar) -> IndicatorPoint;
}

// =============================================================================
// MOVING AVERAGES
// =============================================================================

/// Simple moving average of closes.
pub struct SmaState {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl SmaState {
    pub fn new(period: usize) -> Self {
        Self { period, window: VecDeque::with_capacity(period), sum: 0.0 }
    }
}

impl IndicatorState for SmaState {
    fn update(&mut self, bar: &Bar) -> IndicatorPoint {
        self.window.push_back(bar.close);
        self.sum += bar.close;
        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
        if self.window.len() < self.period {
            IndicatorPoint::warming()
        } else {
            IndicatorPoint::ready(self.sum / self.period as f64)
        }
    }
}

/// Exponential moving average seeded with the SMA of the first period.
pub struct EmaState {
    period: usize,
    alpha: f64,
    seed: Vec<f64>,
    value: Option<f64>,
}

impl EmaState {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            alpha: 2.0 / (period as f64 + 1.0),
            seed: Vec::with_capacity(period),
            value: None,
        }
    }

    fn advance(&mut self, close: f64) -> Option<f64> {
        match self.value {
            Some(prev) => {
                let next = self.alpha * close + (1.0 - self.alpha) * prev;
                self.value = Some(next);
                Some(next)
            }
            None => {
                self.seed.push(close);
                if self.seed.len() == self.period {
                    let seeded = self.seed.iter().sum::<f64>() / self.period as f64;
                    self.value = Some(seeded);
                    Some(seeded)
                } else {
                    None
                }
            }
        }
    }
}

impl IndicatorState for EmaState {
    fn update(&mut self, bar: &Bar) -> IndicatorPoint {
        match self.advance(bar.close) {
            Some(v) => IndicatorPoint::ready(v),
            None => IndicatorPoint::warming(),
        }
    }
}

// =============================================================================
// MOMENTUM
// =============================================================================

/// Relative Strength Index with Wilder smoothing.
pub struct RsiState {
    period: usize,
    prev_close: Option<f64>,
    seed_gains: Vec<f64>,
    seed_losses: Vec<f64>,
    avg_gain: Option<f64>,
    avg_loss: Option<f64>,
}

impl RsiState {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            prev_close: None,
            seed_gains: Vec::with_capacity(period),
            seed_losses: Vec::with_capacity(period),
            avg_gain: None,
            avg_loss: None,
        }
    }
}

impl IndicatorState for RsiState {
    fn update(&mut self, bar: &Bar) -> IndicatorPoint {
        let Some(prev) = self.prev_close.replace(bar.close) else {
            return IndicatorPoint::warming();
        };
        let delta = bar.close - prev;
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        match (self.avg_gain, self.avg_loss) {
            (Some(ag), Some(al)) => {
                let n = self.period as f64;
                let ag = (ag * (n - 1.0) + gain) / n;
                let al = (al * (n - 1.0) + loss) / n;
                self.avg_gain = Some(ag);
                self.avg_loss = Some(al);
                IndicatorPoint::ready(rsi_from_averages(ag, al))
            }
            _ => {
                self.seed_gains.push(gain);
                self.seed_losses.push(loss);
                if self.seed_gains.len() < self.period {
                    return IndicatorPoint::warming();
                }
                let n = self.period as f64;
                let ag = self.seed_gains.iter().sum::<f64>() / n;
                let al = self.seed_losses.iter().sum::<f64>() / n;
                self.avg_gain = Some(ag);
                self.avg_loss = Some(al);
                IndicatorPoint::ready(rsi_from_averages(ag, al))
            }
        }
    }
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// Which MACD series an instance emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacdOutput {
    #[default]
    Line,
    Signal,
    Histogram,
}

impl MacdOutput {
    pub fn as_str(&self) -> &'static str {
        match self {
            MacdOutput::Line => "line",
            MacdOutput::Signal => "signal",
            MacdOutput::Histogram => "histogram",
        }
    }
}

/// MACD: fast EMA minus slow EMA, with a signal EMA over the line.
pub struct MacdState {
    fast: EmaState,
    slow: EmaState,
    signal: EmaState,
    output: MacdOutput,
}

impl MacdState {
    pub fn new(fast: usize, slow: usize, signal: usize, output: MacdOutput) -> Self {
        Self {
            fast: EmaState::new(fast),
            slow: EmaState::new(slow),
            signal: EmaState::new(signal),
            output,
        }
    }
}

impl IndicatorState for MacdState {
    fn update(&mut self, bar: &Bar) -> IndicatorPoint {
        let fast = self.fast.advance(bar.close);
        let slow = self.slow.advance(bar.close);
        let (Some(fast), Some(slow)) = (fast, slow) else {
            return IndicatorPoint::warming();
        };
        let line = fast - slow;
        let signal = self.signal.advance(line);
        match self.output {
            MacdOutput::Line => IndicatorPoint::ready(line),
            MacdOutput::Signal => match signal {
                Some(s) => IndicatorPoint::ready(s),
                None => IndicatorPoint::warming(),
            },
            MacdOutput::Histogram => match signal {
                Some(s) => IndicatorPoint::ready(line - s),
                None => IndicatorPoint::warming(),
            },
        }
    }
}

// =============================================================================
// VOLATILITY
// =============================================================================

/// Which Bollinger band an instance emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BollingerBand {
    Upper,
    #[default]
    Middle,
    Lower,
}

impl BollingerBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            BollingerBand::Upper => "upper",
            BollingerBand::Middle => "middle",
            BollingerBand::Lower => "lower",
        }
    }
}

/// Bollinger band over a close window. Standard deviation is the sample
/// deviation of the window, matching the rolling-window reference data.
pub struct BollingerState {
    period: usize,
    std_dev: f64,
    band: BollingerBand,
    window: VecDeque<f64>,
}

impl BollingerState {
    pub fn new(period: usize, std_dev: f64, band: BollingerBand) -> Self {
        Self { period, std_dev, band, window: VecDeque::with_capacity(period) }
    }
}

impl IndicatorState for BollingerState {
    fn update(&mut self, bar: &Bar) -> IndicatorPoint {
        self.window.push_back(bar.close);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        if self.window.len() < self.period {
            return IndicatorPoint::warming();
        }
        let n = self.period as f64;
        let mean = self.window.iter().sum::<f64>() / n;
        let var = self.window.iter().map(|c| (c - mean) * (c - mean)).sum::<f64>() / (n - 1.0);
        let sd = var.sqrt();
        let value = match self.band {
            BollingerBand::Upper => mean + self.std_dev * sd,
            BollingerBand::Middle => mean,
            BollingerBand::Lower => mean - self.std_dev * sd,
        };
        IndicatorPoint::ready(value)
    }
}

/// Average True Range with Wilder smoothing. The first bar has no
/// previous close, so its range is excluded from the seed window.
pub struct AtrState {
    period: usize,
    prev_close: Option<f64>,
    seed: Vec<f64>,
    value: Option<f64>,
}

impl AtrState {
    pub fn new(period: usize) -> Self {
        Self { period, prev_close: None, seed: Vec::with_capacity(period), value: None }
    }
}

impl IndicatorState for AtrState {
    fn update(&mut self, bar: &Bar) -> IndicatorPoint {
        let Some(prev) = self.prev_close.replace(bar.close) else {
            return IndicatorPoint::warming();
        };
        let tr = true_range(bar.high, bar.low, prev);
        match self.value {
            Some(prev_atr) => {
                let n = self.period as f64;
                let next = (prev_atr * (n - 1.0) + tr) / n;
                self.value = Some(next);
                IndicatorPoint::ready(next)
            }
            None => {
                self.seed.push(tr);
                if self.seed.len() < self.period {
                    return IndicatorPoint::warming();
                }
                let seeded = self.seed.iter().sum::<f64>() / self.period as f64;
                self.value = Some(seeded);
                IndicatorPoint::ready(seeded)
            }
        }
    }
}

fn true_range(high: f64, low: f64, prev_close: f64) -> f64 {
    (high - low)
        .max((high - prev_close).abs())
        .max((low - prev_close).abs())
}

// =============================================================================
// STOCHASTIC
// =============================================================================

/// Which stochastic series an instance emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StochasticOutput {
    #[default]
    K,
    D,
}

impl StochasticOutput {
    pub fn as_str(&self) -> &'static str {
        match self {
            StochasticOutput::K => "k",
            StochasticOutput::D => "d",
        }
    }
}

/// Stochastic oscillator. Raw %K over `k_period`, slowed by an SMA of
/// `slowing` samples, %D as an SMA of `d_period` slowed values.
pub struct StochasticState {
    k_period: usize,
    output: StochasticOutput,
    highs: VecDeque<f64>,
    lows: VecDeque<f64>,
    slow_window: VecDeque<f64>,
    slowing: usize,
    d_window: VecDeque<f64>,
    d_period: usize,
}

impl StochasticState {
    pub fn new(k_period: usize, d_period: usize, slowing: usize, output: StochasticOutput) -> Self {
        Self {
            k_period,
            output,
            highs: VecDeque::with_capacity(k_period),
            lows: VecDeque::with_capacity(k_period),
            slow_window: VecDeque::with_capacity(slowing),
            slowing,
            d_window: VecDeque::with_capacity(d_period),
            d_period,
        }
    }
}

impl IndicatorState for StochasticState {
    fn update(&mut self, bar: &Bar) -> IndicatorPoint {
        self.highs.push_back(bar.high);
        self.lows.push_back(bar.low);
        if self.highs.len() > self.k_period {
            self.highs.pop_front();
            self.lows.pop_front();
        }
        if self.highs.len() < self.k_period {
            return IndicatorPoint::warming();
        }
        let hh = self.highs.iter().cloned().fold(f64::MIN, f64::max);
        let ll = self.lows.iter().cloned().fold(f64::MAX, f64::min);
        // A flat window pins %K at the midpoint.
        let raw_k = if hh > ll { (bar.close - ll) / (hh - ll) * 100.0 } else { 50.0 };

        self.slow_window.push_back(raw_k);
        if self.slow_window.len() > self.slowing {
            self.slow_window.pop_front();
        }
        if self.slow_window.len() < self.slowing {
            return IndicatorPoint::warming();
        }
        let slowed = self.slow_window.iter().sum::<f64>() / self.slowing as f64;

        match self.output {
            StochasticOutput::K => IndicatorPoint::ready(slowed),
            StochasticOutput::D => {
                self.d_window.push_back(slowed);
                if self.d_window.len() > self.d_period {
                    self.d_window.pop_front();
                }
                if self.d_window.len() < self.d_period {
                    IndicatorPoint::warming()
                } else {
                    IndicatorPoint::ready(self.d_window.iter().sum::<f64>() / self.d_period as f64)
                }
            }
        }
    }
}

// =============================================================================
// VOLUME
// =============================================================================

/// Volume-weighted average price over the typical price, optionally
/// resetting at each new exchange-local trading day.
pub struct VwapState {
    session_reset: bool,
    current_day: Option<(i32, u32)>,
    cum_pv: f64,
    cum_volume: f64,
}

impl VwapState {
    pub fn new(session_reset: bool) -> Self {
        Self { session_reset, current_day: None, cum_pv: 0.0, cum_volume: 0.0 }
    }
}

impl IndicatorState for VwapState {
    fn update(&mut self, bar: &Bar) -> IndicatorPoint {
        use chrono::Datelike;
        if self.session_reset {
            let local = bar.timestamp.with_timezone(&New_York);
            let day = (local.year(), local.ordinal());
            if self.current_day != Some(day) {
                self.current_day = Some(day);
                self.cum_pv = 0.0;
                self.cum_volume = 0.0;
            }
        }
        let typical = (bar.high + bar.low + bar.close) / 3.0;
        self.cum_pv += typical * bar.volume as f64;
        self.cum_volume += bar.volume as f64;
        if self.cum_volume > 0.0 {
            IndicatorPoint::ready(self.cum_pv / self.cum_volume)
        } else {
            IndicatorPoint::warming()
        }
    }
}

/// On-balance volume, anchored at zero on the first bar.
pub struct ObvState {
    prev_close: Option<f64>,
    value: f64,
}

impl ObvState {
    pub fn new() -> Self {
        Self { prev_close: None, value: 0.0 }
    }
}

impl IndicatorState for ObvState {
    fn update(&mut self, bar: &Bar) -> IndicatorPoint {
        if let Some(prev) = self.prev_close {
            if bar.close > prev {
                self.value += bar.volume as f64;
            } else if bar.close < prev {
                self.value -= bar.volume as f64;
            }
        }
        self.prev_close = Some(bar.close);
        IndicatorPoint::ready(self.value)
    }
}

// =============================================================================
// TREND
// =============================================================================

/// Which directional-movement series an instance emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdxOutput {
    #[default]
    Adx,
    PlusDi,
    MinusDi,
}

impl AdxOutput {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdxOutput::Adx => "adx",
            AdxOutput::PlusDi => "plus_di",
            AdxOutput::MinusDi => "minus_di",
        }
    }
}

/// Average Directional Index (Wilder). Smoothed +DM, -DM, and TR feed
/// the DI lines; ADX is a second Wilder smooth over DX.
pub struct AdxState {
    period: usize,
    prev: Option<(f64, f64, f64)>,
    seed_plus: Vec<f64>,
    seed_minus: Vec<f64>,
    seed_tr: Vec<f64>,
    smoothed: Option<(f64, f64, f64)>,
    dx_seed: Vec<f64>,
    adx: Option<f64>,
    output: AdxOutput,
}

impl AdxState {
    pub fn new(period: usize, output: AdxOutput) -> Self {
        Self {
            period,
            prev: None,
            seed_plus: Vec::with_capacity(period),
            seed_minus: Vec::with_capacity(period),
            seed_tr: Vec::with_capacity(period),
            smoothed: None,
            dx_seed: Vec::with_capacity(period),
            adx: None,
            output,
        }
    }

    fn emit(&mut self, plus: f64, minus: f64, tr: f64) -> IndicatorPoint {
        if tr <= 0.0 {
            return IndicatorPoint::warming();
        }
        let plus_di = 100.0 * plus / tr;
        let minus_di = 100.0 * minus / tr;
        match self.output {
            AdxOutput::PlusDi => IndicatorPoint::ready(plus_di),
            AdxOutput::MinusDi => IndicatorPoint::ready(minus_di),
            AdxOutput::Adx => {
                let di_sum = plus_di + minus_di;
                if di_sum == 0.0 {
                    return IndicatorPoint::warming();
                }
                let dx = 100.0 * (plus_di - minus_di).abs() / di_sum;
                if let Some(prev_adx) = self.adx {
                    let n = self.period as f64;
                    let next = (prev_adx * (n - 1.0) + dx) / n;
                    self.adx = Some(next);
                    IndicatorPoint::ready(next)
                } else {
                    self.dx_seed.push(dx);
                    if self.dx_seed.len() < self.period {
                        return IndicatorPoint::warming();
                    }
                    let seeded = self.dx_seed.iter().sum::<f64>() / self.period as f64;
                    self.adx = Some(seeded);
                    IndicatorPoint::ready(seeded)
                }
            }
        }
    }
}

impl IndicatorState for AdxState {
    fn update(&mut self, bar: &Bar) -> IndicatorPoint {
        let Some((prev_high, prev_low, prev_close)) =
            self.prev.replace((bar.high, bar.low, bar.close))
        else {
            return IndicatorPoint::warming();
        };

        let up = bar.high - prev_high;
        let down = prev_low - bar.low;
        let plus_dm = if up > down && up > 0.0 { up } else { 0.0 };
        let minus_dm = if down > up && down > 0.0 { down } else { 0.0 };
        let tr = true_range(bar.high, bar.low, prev_close);

        match self.smoothed {
            Some((sp, sm, st)) => {
                let n = self.period as f64;
                let sp = sp - sp / n + plus_dm;
                let sm = sm - sm / n + minus_dm;
                let st = st - st / n + tr;
                self.smoothed = Some((sp, sm, st));
                self.emit(sp, sm, st)
            }
            None => {
                self.seed_plus.push(plus_dm);
                self.seed_minus.push(minus_dm);
                self.seed_tr.push(tr);
                if self.seed_plus.len() < self.period {
                    return IndicatorPoint::warming();
                }
                let sp = self.seed_plus.iter().sum::<f64>();
                let sm = self.seed_minus.iter().sum::<f64>();
                let st = self.seed_tr.iter().sum::<f64>();
                self.smoothed = Some((sp, sm, st));
                self.emit(sp, sm, st)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Timeframe;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    const EPSILON: f64 = 1e-10;

    fn base_ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 15, 0, 0).unwrap()
    }

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = if i == 0 { close } else { closes[i - 1] };
                Bar {
                    symbol: "TEST".into(),
                    timeframe: Timeframe::Min1,
                    timestamp: base_ts() + Duration::minutes(i as i64),
                    open,
                    high: open.max(close) + 1.0,
                    low: open.min(close) - 1.0,
                    close,
                    volume: 1000,
                    source: "test".into(),
                    ingested_at: base_ts(),
                }
            })
            .collect()
    }

    fn bars_from_ohlc(data: &[(f64, f64, f64, f64)]) -> Vec<Bar> {
        data.iter()
            .enumerate()
            .map(|(i, &(open, high, low, close))| Bar {
                symbol: "TEST".into(),
                timeframe: Timeframe::Min1,
                timestamp: base_ts() + Duration::minutes(i as i64),
                open,
                high,
                low,
                close,
                volume: 1000,
                source: "test".into(),
                ingested_at: base_ts(),
            })
            .collect()
    }

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < EPSILON,
            "actual={actual}, expected={expected}"
        );
    }

    #[test]
    fn sma_warmup_then_rolls() {
        let bars = bars_from_closes(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let mut state = SmaState::new(3);
        let points: Vec<_> = bars.iter().map(|b| state.update(b)).collect();
        assert!(!points[0].valid);
        assert!(!points[1].valid);
        assert_approx(points[2].value, 2.0);
        assert_approx(points[3].value, 3.0);
        assert_approx(points[4].value, 4.0);
    }

    #[test]
    fn ema_seeds_with_sma() {
        let bars = bars_from_closes(&[2.0, 4.0, 6.0, 8.0]);
        let mut state = EmaState::new(3);
        let points: Vec<_> = bars.iter().map(|b| state.update(b)).collect();
        assert!(!points[1].valid);
        assert_approx(points[2].value, 4.0);
        // alpha = 0.5: 0.5 * 8 + 0.5 * 4
        assert_approx(points[3].value, 6.0);
    }

    #[test]
    fn rsi_all_gains_is_hundred() {
        let bars = bars_from_closes(&[1.0, 2.0, 3.0]);
        let mut state = RsiState::new(2);
        let points: Vec<_> = bars.iter().map(|b| state.update(b)).collect();
        assert!(!points[1].valid);
        assert_approx(points[2].value, 100.0);
    }

    #[test]
    fn rsi_balanced_moves_is_fifty() {
        let bars = bars_from_closes(&[10.0, 11.0, 10.0, 11.0, 10.0]);
        let mut state = RsiState::new(4);
        let points: Vec<_> = bars.iter().map(|b| state.update(b)).collect();
        assert_approx(points[4].value, 50.0);
    }

    #[test]
    fn atr_matches_wilder_seed_and_smooth() {
        let bars = bars_from_ohlc(&[
            (100.0, 105.0, 95.0, 102.0),
            (102.0, 108.0, 100.0, 106.0), // TR 8
            (106.0, 107.0, 98.0, 99.0),   // TR 9
            (99.0, 103.0, 97.0, 101.0),   // TR 6
            (101.0, 106.0, 100.0, 105.0), // TR 6
        ]);
        let mut state = AtrState::new(3);
        let points: Vec<_> = bars.iter().map(|b| state.update(b)).collect();
        assert!(!points[2].valid);
        // Seed over TRs of bars 1..=3: mean(8, 9, 6)
        assert_approx(points[3].value, 23.0 / 3.0);
        // Wilder step: (23/3 * 2 + 6) / 3
        assert_approx(points[4].value, 64.0 / 9.0);
    }

    #[test]
    fn bollinger_bands_bracket_the_mean() {
        let bars = bars_from_closes(&[1.0, 2.0, 3.0]);
        let mut mid = BollingerState::new(3, 2.0, BollingerBand::Middle);
        let mut upper = BollingerState::new(3, 2.0, BollingerBand::Upper);
        let mut lower = BollingerState::new(3, 2.0, BollingerBand::Lower);
        let (mut m, mut u, mut l) = (IndicatorPoint::warming(), IndicatorPoint::warming(), IndicatorPoint::warming());
        for b in &bars {
            m = mid.update(b);
            u = upper.update(b);
            l = lower.update(b);
        }
        assert_approx(m.value, 2.0);
        // Sample deviation of [1, 2, 3] is 1.0
        assert_approx(u.value, 4.0);
        assert_approx(l.value, 0.0);
    }

    #[test]
    fn macd_line_with_unit_periods() {
        let bars = bars_from_closes(&[2.0, 4.0]);
        let mut state = MacdState::new(1, 2, 1, MacdOutput::Line);
        let points: Vec<_> = bars.iter().map(|b| state.update(b)).collect();
        assert!(!points[0].valid);
        // fast EMA(1) = 4, slow seeds with mean(2, 4) = 3
        assert_approx(points[1].value, 1.0);
    }

    #[test]
    fn stochastic_k_at_window_top() {
        let bars = bars_from_ohlc(&[
            (10.0, 12.0, 8.0, 10.0),
            (10.0, 14.0, 10.0, 14.0),
        ]);
        let mut state = StochasticState::new(2, 1, 1, StochasticOutput::K);
        let points: Vec<_> = bars.iter().map(|b| state.update(b)).collect();
        assert!(!points[0].valid);
        // Close at the window high: (14 - 8) / (14 - 8)
        assert_approx(points[1].value, 100.0);
    }

    #[test]
    fn vwap_weighs_by_volume() {
        let mut bars = bars_from_ohlc(&[(10.0, 10.0, 10.0, 10.0), (20.0, 20.0, 20.0, 20.0)]);
        bars[0].volume = 100;
        bars[1].volume = 300;
        let mut state = VwapState::new(false);
        let mut last = IndicatorPoint::warming();
        for b in &bars {
            last = state.update(b);
        }
        // (10 * 100 + 20 * 300) / 400
        assert_approx(last.value, 17.5);
    }

    #[test]
    fn obv_tracks_signed_volume() {
        let bars = bars_from_closes(&[10.0, 11.0, 10.5, 10.5, 12.0]);
        let mut state = ObvState::new();
        let points: Vec<_> = bars.iter().map(|b| state.update(b)).collect();
        assert_approx(points[0].value, 0.0);
        assert_approx(points[1].value, 1000.0);
        assert_approx(points[2].value, 0.0);
        assert_approx(points[3].value, 0.0); // unchanged close
        assert_approx(points[4].value, 1000.0);
    }

    #[test]
    fn adx_warmup_spans_two_periods() {
        let closes: Vec<f64> = (0..12).map(|i| 100.0 + (i as f64) * ((i % 3) as f64 - 1.0)).collect();
        let bars = bars_from_closes(&closes);
        let mut state = AdxState::new(3, AdxOutput::Adx);
        let points: Vec<_> = bars.iter().map(|b| state.update(b)).collect();
        // DI needs period deltas, ADX needs period DX values on top.
        assert!(points[..5].iter().all(|p| !p.valid));
        assert!(points.last().unwrap().valid);
    }

    #[test]
    fn replay_is_bit_identical() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + ((i * 37) % 11) as f64 * 0.73).collect();
        let bars = bars_from_closes(&closes);
        let run = |bars: &[Bar]| -> Vec<u64> {
            let mut states: Vec<Box<dyn IndicatorState>> = vec![
                Box::new(SmaState::new(14)),
                Box::new(EmaState::new(14)),
                Box::new(RsiState::new(14)),
                Box::new(MacdState::new(12, 26, 9, MacdOutput::Histogram)),
                Box::new(BollingerState::new(20, 2.0, BollingerBand::Upper)),
                Box::new(AtrState::new(14)),
                Box::new(StochasticState::new(14, 3, 3, StochasticOutput::D)),
                Box::new(VwapState::new(true)),
                Box::new(ObvState::new()),
                Box::new(AdxState::new(14, AdxOutput::Adx)),
            ];
            let mut bits = Vec::new();
            for bar in bars {
                for state in &mut states {
                    bits.push(state.update(bar).value.to_bits());
                }
            }
            bits
        };
        assert_eq!(run(&bars), run(&bars));
    }
}
