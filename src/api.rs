//! Core API surface for REST and CLI collaborators.
//!
//! A thin facade over the orchestrator and the store. Every operation
//! returns a result envelope carrying either data or an error kind,
//! plus free-form diagnostics; collaborators never touch storage or the
//! broker directly.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ErrorKind;
use crate::governor::RequestRunner;
use crate::models::{SimulationLabel, Timeframe};
use crate::pipeline::{Orchestrator, PipelineStatus, RunReport, RunSpec};
use crate::storage::{BarRow, BarStore, MissingReport, QueryFilters, StoreQualityReport};

/// Uniform response wrapper: data or an error kind, never both.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T> {
    pub data: Option<T>,
    pub error: Option<ErrorKind>,
    pub diagnostics: Vec<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self { data: Some(data), error: None, diagnostics: Vec::new() }
    }

    pub fn err(error: ErrorKind) -> Self {
        Self { data: None, error: Some(error), diagnostics: Vec::new() }
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<String>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl<T> From<Result<T, ErrorKind>> for Envelope<T> {
    fn from(result: Result<T, ErrorKind>) -> Self {
        match result {
            Ok(data) => Envelope::ok(data),
            Err(error) => Envelope::err(error),
        }
    }
}

/// The facade consumed by external collaborators.
pub struct CoreApi<R: RequestRunner> {
    orchestrator: Orchestrator<R>,
    store: BarStore,
}

impl<R: RequestRunner> CoreApi<R> {
    pub fn new(orchestrator: Orchestrator<R>, store: BarStore) -> Self {
        Self { orchestrator, store }
    }

    // =========================================================================
    // READ-ONLY
    // =========================================================================

    pub fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Envelope<Vec<BarRow>> {
        self.store.query(symbol, timeframe, from, to, QueryFilters::default()).into()
    }

    pub fn get_labels(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Envelope<Vec<SimulationLabel>> {
        self.store.get_labels(symbol, from, to).into()
    }

    pub fn quality_report(
        &self,
        symbol: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Envelope<StoreQualityReport> {
        self.store.quality_report(symbol, from, to).into()
    }

    pub fn missing_minutes(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Envelope<MissingReport> {
        self.store.detect_missing(symbol, timeframe, from, to).into()
    }

    pub fn pipeline_status(&self) -> Envelope<PipelineStatus> {
        Envelope::ok(self.orchestrator.status())
    }

    // =========================================================================
    // CONTROL
    // =========================================================================

    /// Run the pipeline to completion and return the full report. The
    /// report's partial-failure detail rides in the envelope
    /// diagnostics.
    pub async fn run_pipeline(&self, spec: RunSpec) -> Envelope<RunReport> {
        if spec.symbols.is_empty() || spec.timeframes.is_empty() {
            return Envelope::err(ErrorKind::ConfigInvalid(
                "run spec needs at least one symbol and one timeframe".into(),
            ));
        }
        if spec.range_start >= spec.range_end {
            return Envelope::err(ErrorKind::ConfigInvalid(format!(
                "empty range {} .. {}",
                spec.range_start, spec.range_end
            )));
        }
        let report = self.orchestrator.run(spec).await;
        let diagnostics = report.diagnostics.clone();
        Envelope::ok(report).with_diagnostics(diagnostics)
    }

    pub fn cancel_run(&self, run_id: &str) -> Envelope<bool> {
        let cancelled = self.orchestrator.cancel_run(run_id);
        if cancelled {
            Envelope::ok(true)
        } else {
            Envelope::err(ErrorKind::Cancelled(format!("no active run with id {run_id}")))
        }
    }
}
