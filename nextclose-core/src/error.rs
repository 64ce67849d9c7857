//! Error taxonomy shared by the store, the models and the cleaning step.
//!
//! Propagation policy:
//! - `StorageError` aborts the current batch; `is_retryable()` tells the
//!   orchestrator's caller whether a whole-batch retry makes sense.
//! - `ModelError` is isolated to one (entity, model) pair, or to one family
//!   for `Unavailable`.
//! - `DataQualityError` drops one raw row.

use chrono::NaiveDate;
use std::time::Duration;
use thiserror::Error;

/// Failures of the Series Store boundary.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage call on '{table}' exceeded its {timeout:?} deadline")]
    Timeout { table: &'static str, timeout: Duration },

    #[error("constraint violation on '{table}': {reason}")]
    Constraint { table: &'static str, reason: String },

    #[error("corrupt partition {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

impl StorageError {
    /// Connectivity loss and deadline expiry may succeed on retry; constraint
    /// violations and corrupt partitions will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }

    pub(crate) fn constraint(table: &'static str, reason: impl Into<String>) -> Self {
        Self::Constraint {
            table,
            reason: reason.into(),
        }
    }
}

/// Failures of a single forecasting model.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("{model}: insufficient history ({available} < {required} observations)")]
    InsufficientHistory {
        model: String,
        required: usize,
        available: usize,
    },

    #[error("model family '{family}' is unavailable in this build: {reason}")]
    Unavailable { family: String, reason: String },

    #[error("{model}: numeric failure: {reason}")]
    Numeric { model: String, reason: String },

    #[error("invalid model spec '{model}': {reason}")]
    InvalidSpec { model: String, reason: String },
}

/// A raw upstream row rejected by cleaning. The row is dropped; the batch
/// continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataQualityError {
    #[error("{entity_id} {date}: negative volume {volume}")]
    NegativeVolume {
        entity_id: String,
        date: NaiveDate,
        volume: i64,
    },

    #[error("{entity_id} {date}: duplicate trade date in raw feed")]
    DuplicateKey { entity_id: String, date: NaiveDate },

    #[error("{entity_id} {date}: non-finite or non-positive price")]
    InvalidPrice { entity_id: String, date: NaiveDate },

    #[error("{entity_id} {date}: high/low do not bracket open/close")]
    InconsistentRange { entity_id: String, date: NaiveDate },

    #[error("row for '{found}' delivered in a batch for '{expected}'")]
    EntityMismatch { expected: String, found: String },
}
