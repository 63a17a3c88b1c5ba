//! Indicator catalog and streaming computation engine.
//!
//! Each enabled parameter set is identified by a fingerprint derived
//! from its canonical encoding, so multiple parameterizations of one
//! family coexist and a reconfigured set never collides with the values
//! cached under the old fingerprint.

pub mod families;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::models::Bar;
use families::{
    AdxOutput, AdxState, AtrState, BollingerBand, BollingerState, EmaState, IndicatorPoint,
    IndicatorState, MacdOutput, MacdState, ObvState, RsiState, SmaState, StochasticOutput,
    StochasticState, VwapState,
};

fn default_session_reset() -> bool {
    true
}

// =============================================================================
// CATALOG
// =============================================================================

/// One enabled indicator parameter set. Families with several output
/// series carry the selector inside the parameter set, so every spec
/// produces exactly one value per bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum IndicatorSpec {
    Sma { period: usize },
    Ema { period: usize },
    Rsi { period: usize },
    Macd {
        fast: usize,
        slow: usize,
        signal: usize,
        #[serde(default)]
        output: MacdOutput,
    },
    BollingerBands {
        period: usize,
        std_dev: f64,
        #[serde(default)]
        band: BollingerBand,
    },
    Atr { period: usize },
    Stochastic {
        k_period: usize,
        d_period: usize,
        slowing: usize,
        #[serde(default)]
        output: StochasticOutput,
    },
    Vwap {
        #[serde(default = "default_session_reset")]
        session_reset: bool,
    },
    Obv,
    Adx {
        period: usize,
        #[serde(default)]
        output: AdxOutput,
    },
}

impl IndicatorSpec {
    pub fn family(&self) -> &'static str {
        match self {
            IndicatorSpec::Sma { .. } => "sma",
            IndicatorSpec::Ema { .. } => "ema",
            IndicatorSpec::Rsi { .. } => "rsi",
            IndicatorSpec::Macd { .. } => "macd",
            IndicatorSpec::BollingerBands { .. } => "bollinger_bands",
            IndicatorSpec::Atr { .. } => "atr",
            IndicatorSpec::Stochastic { .. } => "stochastic",
            IndicatorSpec::Vwap { .. } => "vwap",
            IndicatorSpec::Obv => "obv",
            IndicatorSpec::Adx { .. } => "adx",
        }
    }

    /// Canonical human-readable encoding. This string, not the TOML
    /// source, is what the fingerprint hashes, so key order and
    /// formatting in configuration files never matter.
    pub fn describe(&self) -> String {
        match self {
            IndicatorSpec::Sma { period } => format!("sma(period={period})"),
            IndicatorSpec::Ema { period } => format!("ema(period={period})"),
            IndicatorSpec::Rsi { period } => format!("rsi(period={period})"),
            IndicatorSpec::Macd { fast, slow, signal, output } => {
                format!("macd(fast={fast},slow={slow},signal={signal},output={})", output.as_str())
            }
            IndicatorSpec::BollingerBands { period, std_dev, band } => format!(
                "bollinger_bands(period={period},std_dev={std_dev},band={})",
                band.as_str()
            ),
            IndicatorSpec::Atr { period } => format!("atr(period={period})"),
            IndicatorSpec::Stochastic { k_period, d_period, slowing, output } => format!(
                "stochastic(k={k_period},d={d_period},slowing={slowing},output={})",
                output.as_str()
            ),
            IndicatorSpec::Vwap { session_reset } => format!("vwap(session_reset={session_reset})"),
            IndicatorSpec::Obv => "obv()".into(),
            IndicatorSpec::Adx { period, output } => {
                format!("adx(period={period},output={})", output.as_str())
            }
        }
    }

    /// Stable fingerprint of the canonical encoding, hex-rendered.
    pub fn fingerprint(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.describe().hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    fn build_state(&self) -> Box<dyn IndicatorState> {
        match self {
            IndicatorSpec::Sma { period } => Box::new(SmaState::new(*period)),
            IndicatorSpec::Ema { period } => Box::new(EmaState::new(*period)),
            IndicatorSpec::Rsi { period } => Box::new(RsiState::new(*period)),
            IndicatorSpec::Macd { fast, slow, signal, output } => {
                Box::new(MacdState::new(*fast, *slow, *signal, *output))
            }
            IndicatorSpec::BollingerBands { period, std_dev, band } => {
                Box::new(BollingerState::new(*period, *std_dev, *band))
            }
            IndicatorSpec::Atr { period } => Box::new(AtrState::new(*period)),
            IndicatorSpec::Stochastic { k_period, d_period, slowing, output } => {
                Box::new(StochasticState::new(*k_period, *d_period, *slowing, *output))
            }
            IndicatorSpec::Vwap { session_reset } => Box::new(VwapState::new(*session_reset)),
            IndicatorSpec::Obv => Box::new(ObvState::new()),
            IndicatorSpec::Adx { period, output } => Box::new(AdxState::new(*period, *output)),
        }
    }

    /// The catalog shipped when no indicator table is configured.
    pub fn default_catalog() -> Vec<IndicatorSpec> {
        vec![
            IndicatorSpec::Sma { period: 20 },
            IndicatorSpec::Ema { period: 20 },
            IndicatorSpec::Rsi { period: 14 },
            IndicatorSpec::Macd { fast: 12, slow: 26, signal: 9, output: MacdOutput::Line },
            IndicatorSpec::BollingerBands { period: 20, std_dev: 2.0, band: BollingerBand::Upper },
            IndicatorSpec::BollingerBands { period: 20, std_dev: 2.0, band: BollingerBand::Middle },
            IndicatorSpec::BollingerBands { period: 20, std_dev: 2.0, band: BollingerBand::Lower },
            IndicatorSpec::Atr { period: 14 },
            IndicatorSpec::Stochastic {
                k_period: 14,
                d_period: 3,
                slowing: 3,
                output: StochasticOutput::K,
            },
            IndicatorSpec::Vwap { session_reset: true },
            IndicatorSpec::Obv,
            IndicatorSpec::Adx { period: 14, output: AdxOutput::Adx },
        ]
    }
}

// =============================================================================
// ENGINE
// =============================================================================

/// One computed sample, ready for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorValue {
    pub family: String,
    pub fingerprint: String,
    /// None while the state is warming up.
    pub value: Option<f64>,
    pub valid: bool,
}

/// Streaming engine for one (symbol, timeframe) bar sequence. The
/// pipeline owns one engine per key; state never crosses threads.
pub struct SeriesEngine {
    specs: Vec<(IndicatorSpec, String, Box<dyn IndicatorState>)>,
}

impl SeriesEngine {
    pub fn new(catalog: &[IndicatorSpec]) -> Self {
        let specs = catalog
            .iter()
            .map(|spec| (spec.clone(), spec.fingerprint(), spec.build_state()))
            .collect();
        Self { specs }
    }

    /// Advance every enabled state with one bar, in catalog order.
    pub fn update(&mut self, bar: &Bar) -> Vec<IndicatorValue> {
        self.specs
            .iter_mut()
            .map(|(spec, fingerprint, state)| {
                let point: IndicatorPoint = state.update(bar);
                IndicatorValue {
                    family: spec.family().to_string(),
                    fingerprint: fingerprint.clone(),
                    value: point.valid.then_some(point.value),
                    valid: point.valid,
                }
            })
            .collect()
    }

    pub fn fingerprints(&self) -> Vec<String> {
        self.specs.iter().map(|(_, fp, _)| fp.clone()).collect()
    }
}

/// Convenience wrapper for recomputation over a stored range: runs a
/// fresh engine over the bars and pairs each output with its bar.
pub fn compute_series(
    catalog: &[IndicatorSpec],
    bars: &[Bar],
) -> Vec<(Bar, Vec<IndicatorValue>)> {
    let mut engine = SeriesEngine::new(catalog);
    bars.iter().map(|bar| (bar.clone(), engine.update(bar))).collect()
}
