//! NextClose Core — series store, ingestion, walk-forward models, ensembles, evaluation.
//!
//! This crate contains everything below the orchestrator:
//! - Domain rows (prices, forecasts, evaluation records)
//! - Series Store trait with in-memory and Parquet backends
//! - Upstream sources, cleaning and the Incremental Fetch Planner
//! - Model registry and the Walk-Forward Forecaster
//! - Ensemble Aggregator and Evaluation Joiner
//!
//! Every stage is a function of explicit inputs (one entity's stored rows plus
//! configuration) returning rows to upsert. There is no module-level state.

pub mod data;
pub mod domain;
pub mod ensemble;
pub mod error;
pub mod evaluation;
pub mod models;
pub mod store;

pub use error::{DataQualityError, ModelError, StorageError};
