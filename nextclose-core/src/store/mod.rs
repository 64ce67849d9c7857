//! Series Store — typed rows with natural-key upsert and ordered range query.
//!
//! Three tables: prices, forecasts (base and ensemble), evaluations. The natural
//! key of each row type is the only deduplication mechanism: upserting a row
//! whose key exists overwrites every non-key column, so re-applying an identical
//! batch is a no-op in observable state.
//!
//! Every call carries a caller-supplied timeout. Exceeding it yields
//! `StorageError::Timeout`, which is retryable.
//!
//! Backends:
//! - `MemoryStore`: `BTreeMap` tables behind `parking_lot` locks
//! - `ParquetStore`: one Parquet partition per (table, entity)

pub mod memory;
pub mod parquet;

pub use memory::MemoryStore;
pub use parquet::ParquetStore;

use crate::domain::{EvaluationRecord, Forecast, PricePoint};
use crate::error::StorageError;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::time::{Duration, Instant};

/// Default per-call deadline used by the CLI when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ── Row types ────────────────────────────────────────────────────────

/// A row type persisted in the store.
///
/// `Key` orders entity first, then date, so iterating a keyed map yields the
/// query order `(entity_id, trade_date, ...)` ascending.
pub trait Record: Clone + Debug + Send + Sync + 'static {
    type Key: Ord + Clone + Debug + Send + Sync;

    const TABLE: &'static str;
    const KEY_COLUMNS: &'static [&'static str];

    fn key(&self) -> Self::Key;
    fn entity_id(&self) -> &str;
    fn date(&self) -> NaiveDate;

    fn model_name(&self) -> Option<&str> {
        None
    }

    /// Column-level constraints (NOT NULL, CHECK) enforced before any write.
    fn check(&self) -> Result<(), StorageError>;
}

impl Record for PricePoint {
    type Key = (String, NaiveDate);

    const TABLE: &'static str = "prices";
    const KEY_COLUMNS: &'static [&'static str] = &["entity_id", "trade_date"];

    fn key(&self) -> Self::Key {
        (self.entity_id.clone(), self.trade_date)
    }

    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    fn date(&self) -> NaiveDate {
        self.trade_date
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.entity_id.is_empty() {
            return Err(StorageError::constraint(Self::TABLE, "empty entity_id"));
        }
        if !self.close.is_finite() {
            return Err(StorageError::constraint(
                Self::TABLE,
                format!("{} {}: close is not finite", self.entity_id, self.trade_date),
            ));
        }
        if let Some(v) = self.volume {
            if v < 0 {
                return Err(StorageError::constraint(
                    Self::TABLE,
                    format!("{} {}: negative volume {v}", self.entity_id, self.trade_date),
                ));
            }
        }
        Ok(())
    }
}

impl Record for Forecast {
    type Key = (String, NaiveDate, String, u32);

    const TABLE: &'static str = "forecasts";
    const KEY_COLUMNS: &'static [&'static str] = &["as_of", "entity_id", "model_name", "horizon"];

    fn key(&self) -> Self::Key {
        (
            self.entity_id.clone(),
            self.as_of,
            self.model_name.clone(),
            self.horizon,
        )
    }

    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    fn date(&self) -> NaiveDate {
        self.as_of
    }

    fn model_name(&self) -> Option<&str> {
        Some(&self.model_name)
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.entity_id.is_empty() || self.model_name.is_empty() {
            return Err(StorageError::constraint(
                Self::TABLE,
                "empty entity_id or model_name",
            ));
        }
        if !self.predicted_value.is_finite() {
            return Err(StorageError::constraint(
                Self::TABLE,
                format!(
                    "{} {} {}: predicted_value is not finite",
                    self.entity_id, self.as_of, self.model_name
                ),
            ));
        }
        Ok(())
    }
}

impl Record for EvaluationRecord {
    type Key = (String, NaiveDate, String, u32);

    const TABLE: &'static str = "evaluations";
    const KEY_COLUMNS: &'static [&'static str] = &["as_of", "entity_id", "model_name", "horizon"];

    fn key(&self) -> Self::Key {
        (
            self.entity_id.clone(),
            self.as_of,
            self.model_name.clone(),
            self.horizon,
        )
    }

    fn entity_id(&self) -> &str {
        &self.entity_id
    }

    fn date(&self) -> NaiveDate {
        self.as_of
    }

    fn model_name(&self) -> Option<&str> {
        Some(&self.model_name)
    }

    fn check(&self) -> Result<(), StorageError> {
        let finite = self.predicted_value.is_finite()
            && self.realized_value.is_finite()
            && self.absolute_error.is_finite();
        if !finite {
            return Err(StorageError::constraint(
                Self::TABLE,
                format!(
                    "{} {} {}: non-finite score",
                    self.entity_id, self.as_of, self.model_name
                ),
            ));
        }
        Ok(())
    }
}

/// An entity id must be usable as a single file-name component: non-empty,
/// no path separators, no `..` and no control characters.
pub fn is_valid_entity_id(entity_id: &str) -> bool {
    !entity_id.is_empty()
        && !entity_id.contains(['/', '\\'])
        && !entity_id.contains("..")
        && !entity_id.chars().any(char::is_control)
}

/// Validate a whole batch before any row is applied.
///
/// A key appearing twice in one batch is a caller bug, as in
/// `ON CONFLICT DO UPDATE` affecting the same row twice.
pub(crate) fn validate_batch<R: Record>(rows: &[R]) -> Result<(), StorageError> {
    let mut seen = BTreeSet::new();
    for row in rows {
        if !is_valid_entity_id(row.entity_id()) {
            return Err(StorageError::constraint(
                R::TABLE,
                format!("entity id '{}' cannot name a partition", row.entity_id()),
            ));
        }
        row.check()?;
        if !seen.insert(row.key()) {
            return Err(StorageError::constraint(
                R::TABLE,
                format!("key {:?} appears twice in one batch", row.key()),
            ));
        }
    }
    Ok(())
}

/// Overwrite-or-insert every row of an already validated batch.
pub(crate) fn merge_into<R: Record>(table: &mut BTreeMap<R::Key, R>, rows: &[R]) -> usize {
    for row in rows {
        table.insert(row.key(), row.clone());
    }
    rows.len()
}

// ── Queries ──────────────────────────────────────────────────────────

/// Row filter. Every `None` means "no restriction".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesQuery {
    pub entity_ids: Option<BTreeSet<String>>,
    /// Inclusive `[start, end]` on the row's date column.
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    /// Only meaningful for forecast and evaluation rows.
    pub model_names: Option<BTreeSet<String>>,
}

impl SeriesQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn entity(entity_id: &str) -> Self {
        Self::all().with_entities([entity_id])
    }

    pub fn with_entities<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn between(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.date_range = Some((start, end));
        self
    }

    pub fn with_models<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.model_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn admits_entity(&self, entity_id: &str) -> bool {
        self.entity_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(entity_id))
    }

    pub fn matches<R: Record>(&self, row: &R) -> bool {
        if !self.admits_entity(row.entity_id()) {
            return false;
        }
        if let Some((start, end)) = self.date_range {
            let d = row.date();
            if d < start || d > end {
                return false;
            }
        }
        match (&self.model_names, row.model_name()) {
            (Some(names), Some(name)) => names.contains(name),
            _ => true,
        }
    }
}

// ── Store trait ──────────────────────────────────────────────────────

/// The persistence boundary.
///
/// Implementations must be safe under concurrent upserts to disjoint natural
/// keys, and every query returns rows ordered by `(entity_id, date, ...)`
/// ascending with at most one row per key.
pub trait SeriesStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    fn upsert_prices(&self, rows: &[PricePoint], timeout: Duration)
        -> Result<usize, StorageError>;

    fn query_prices(
        &self,
        query: &SeriesQuery,
        timeout: Duration,
    ) -> Result<Vec<PricePoint>, StorageError>;

    fn upsert_forecasts(&self, rows: &[Forecast], timeout: Duration)
        -> Result<usize, StorageError>;

    fn query_forecasts(
        &self,
        query: &SeriesQuery,
        timeout: Duration,
    ) -> Result<Vec<Forecast>, StorageError>;

    fn upsert_evaluations(
        &self,
        rows: &[EvaluationRecord],
        timeout: Duration,
    ) -> Result<usize, StorageError>;

    fn query_evaluations(
        &self,
        query: &SeriesQuery,
        timeout: Duration,
    ) -> Result<Vec<EvaluationRecord>, StorageError>;

    /// Distinct entity ids that have at least one stored price.
    fn entities(&self, timeout: Duration) -> Result<Vec<String>, StorageError> {
        Ok(self.last_price_dates(timeout)?.into_keys().collect())
    }

    /// The ingestion cursor: maximum stored `trade_date` per entity.
    fn last_price_dates(
        &self,
        timeout: Duration,
    ) -> Result<BTreeMap<String, NaiveDate>, StorageError> {
        let rows = self.query_prices(&SeriesQuery::all(), timeout)?;
        let mut out = BTreeMap::new();
        for row in rows {
            out.insert(row.entity_id, row.trade_date);
        }
        Ok(out)
    }

    /// Latest stored as-of date per `(model_name, horizon)` for one entity.
    fn last_forecast_dates(
        &self,
        entity_id: &str,
        timeout: Duration,
    ) -> Result<BTreeMap<(String, u32), NaiveDate>, StorageError> {
        let rows = self.query_forecasts(&SeriesQuery::entity(entity_id), timeout)?;
        let mut out: BTreeMap<(String, u32), NaiveDate> = BTreeMap::new();
        for row in rows {
            let slot = out.entry((row.model_name, row.horizon)).or_insert(row.as_of);
            if row.as_of > *slot {
                *slot = row.as_of;
            }
        }
        Ok(out)
    }
}

// ── Deadlines ────────────────────────────────────────────────────────

/// Absolute deadline derived from a caller timeout.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    at: Instant,
    timeout: Duration,
    table: &'static str,
}

impl Deadline {
    pub(crate) fn new(table: &'static str, timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
            table,
        }
    }

    /// Time left, or `Timeout` once the deadline has passed.
    pub(crate) fn remaining(&self) -> Result<Duration, StorageError> {
        self.at
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or_else(|| self.expired())
    }

    pub(crate) fn expired(&self) -> StorageError {
        StorageError::Timeout {
            table: self.table,
            timeout: self.timeout,
        }
    }
}
