//! Error taxonomy for the pipeline core.
//!
//! Transient kinds are handled locally with retry and backoff; warnings
//! accumulate into run reports; fatal kinds abort the run but never
//! corrupt the store.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure surfaced across a subsystem boundary is one of these.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ErrorKind {
    /// Configuration schema or cross-field check failed. Fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Broker session cannot reach READY after the retry cap.
    #[error("broker session unavailable: {0}")]
    SessionUnavailable(String),

    /// Broker signalled back-pressure. Retried with backoff.
    #[error("broker throttled: {0}")]
    Throttled(String),

    /// Validator ERROR. The bar is dropped and recorded in the quality
    /// report.
    #[error("bar rejected: {0}")]
    BarRejected(String),

    /// Concurrent writer or schema mismatch. Fatal for the run.
    #[error("store conflict: {0}")]
    StoreConflict(String),

    /// Transient storage failure, retried by the storage wrapper.
    #[error("store I/O error: {0}")]
    StoreIoError(String),

    /// Requested range has no broker data. A warning, not a failure.
    #[error("no data for requested range: {0}")]
    MissingRange(String),

    /// Derived values not yet valid. Surfaced via the validity flag.
    #[error("indicator warming up: {0}")]
    IndicatorWarmup(String),

    /// Same-bar stop/take tie with the tie-break policy set to
    /// indeterminate. The label is omitted with a diagnostic.
    #[error("simulation indeterminate: {0}")]
    SimulationIndeterminate(String),

    /// User-initiated cancellation.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// An upstream component violated a data-model invariant. Fatal.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl ErrorKind {
    /// Transient errors are retried locally and never abort a run by
    /// themselves.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Throttled(_) | ErrorKind::StoreIoError(_))
    }

    /// Fatal errors abort the current run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConfigInvalid(_)
                | ErrorKind::StoreConflict(_)
                | ErrorKind::InternalInvariant(_)
        )
    }

    /// Short machine-readable tag, stable across releases.
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid(_) => "config_invalid",
            ErrorKind::SessionUnavailable(_) => "session_unavailable",
            ErrorKind::Throttled(_) => "throttled",
            ErrorKind::BarRejected(_) => "bar_rejected",
            ErrorKind::StoreConflict(_) => "store_conflict",
            ErrorKind::StoreIoError(_) => "store_io_error",
            ErrorKind::MissingRange(_) => "missing_range",
            ErrorKind::IndicatorWarmup(_) => "indicator_warmup",
            ErrorKind::SimulationIndeterminate(_) => "simulation_indeterminate",
            ErrorKind::Cancelled(_) => "cancelled",
            ErrorKind::InternalInvariant(_) => "internal_invariant",
        }
    }
}

pub type CoreResult<T> = Result<T, ErrorKind>;
