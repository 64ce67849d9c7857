//! NextClose Runner — configuration, pipeline orchestration, error reporting.
//!
//! This crate builds on `nextclose-core` to provide:
//! - TOML pipeline configuration with store, source chain and model registry
//! - The staged pipeline (ingest, forecast, ensemble, evaluate) over a
//!   bounded worker pool with coarse cancellation
//! - Aggregate error metrics (MAE, MAPE, RMSE, direction accuracy) and export
//! - The per-entity top-signal report

pub mod config;
pub mod pipeline;
pub mod report;

pub use config::{
    ConfigError, ExecutionConfig, IngestConfig, PipelineConfig, SourceConfig, StoreBackend,
    StoreConfig,
};
pub use pipeline::{
    CancelHandle, EnsembleReport, EntityFailure, EntityStatus, EvaluationReport, ForecastReport,
    IngestReport, Pipeline, PipelineError, RunReport, Stage, StatusReport,
};
pub use report::{summarize, top_signals, ErrorSummary, GroupBy, SignalRow, SummaryRow};

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn pipeline_is_send_sync() {
        assert_send::<Pipeline>();
        assert_sync::<Pipeline>();
        assert_send::<CancelHandle>();
        assert_sync::<CancelHandle>();
    }

    #[test]
    fn reports_are_send_sync() {
        assert_send::<RunReport>();
        assert_sync::<RunReport>();
        assert_send::<SummaryRow>();
        assert_sync::<SummaryRow>();
    }

    #[test]
    fn errors_are_send_sync() {
        assert_send::<PipelineError>();
        assert_sync::<PipelineError>();
        assert_send::<ConfigError>();
        assert_sync::<ConfigError>();
    }
}
