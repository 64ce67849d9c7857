//! In-memory Series Store.
//!
//! Each table is a `BTreeMap` keyed entity-first behind a `parking_lot::RwLock`.
//! Lock acquisition honours the caller deadline (`try_*_for`), so a stalled
//! writer surfaces as a retryable `Timeout` instead of blocking forever.

use super::{merge_into, validate_batch, Deadline, Record, SeriesQuery, SeriesStore};
use crate::domain::{EvaluationRecord, Forecast, PricePoint};
use crate::error::StorageError;
use chrono::NaiveDate;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

struct Table<R: Record> {
    rows: RwLock<BTreeMap<R::Key, R>>,
}

impl<R: Record> Table<R> {
    fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    fn upsert(&self, rows: &[R], timeout: Duration) -> Result<usize, StorageError> {
        let deadline = Deadline::new(R::TABLE, timeout);
        validate_batch(rows)?;
        let mut table = self
            .rows
            .try_write_for(deadline.remaining()?)
            .ok_or_else(|| deadline.expired())?;
        Ok(merge_into(&mut table, rows))
    }

    fn query(&self, query: &SeriesQuery, timeout: Duration) -> Result<Vec<R>, StorageError> {
        let deadline = Deadline::new(R::TABLE, timeout);
        let table = self
            .rows
            .try_read_for(deadline.remaining()?)
            .ok_or_else(|| deadline.expired())?;
        Ok(table
            .values()
            .filter(|row| query.matches(*row))
            .cloned()
            .collect())
    }
}

/// Series Store held entirely in process memory.
///
/// Used by tests and by `store.backend = "memory"` dry runs. `disconnect()`
/// simulates loss of connectivity so batch-level failure handling can be
/// exercised.
pub struct MemoryStore {
    prices: Table<PricePoint>,
    forecasts: Table<Forecast>,
    evaluations: Table<EvaluationRecord>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            prices: Table::new(),
            forecasts: Table::new(),
            evaluations: Table::new(),
            offline: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with `StorageError::Unavailable`.
    pub fn disconnect(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.offline.store(false, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> Result<(), StorageError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store disconnected".into()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SeriesStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn upsert_prices(
        &self,
        rows: &[PricePoint],
        timeout: Duration,
    ) -> Result<usize, StorageError> {
        self.ensure_connected()?;
        self.prices.upsert(rows, timeout)
    }

    fn query_prices(
        &self,
        query: &SeriesQuery,
        timeout: Duration,
    ) -> Result<Vec<PricePoint>, StorageError> {
        self.ensure_connected()?;
        self.prices.query(query, timeout)
    }

    fn upsert_forecasts(&self, rows: &[Forecast], timeout: Duration) -> Result<usize, StorageError> {
        self.ensure_connected()?;
        self.forecasts.upsert(rows, timeout)
    }

    fn query_forecasts(
        &self,
        query: &SeriesQuery,
        timeout: Duration,
    ) -> Result<Vec<Forecast>, StorageError> {
        self.ensure_connected()?;
        self.forecasts.query(query, timeout)
    }

    fn upsert_evaluations(
        &self,
        rows: &[EvaluationRecord],
        timeout: Duration,
    ) -> Result<usize, StorageError> {
        self.ensure_connected()?;
        self.evaluations.upsert(rows, timeout)
    }

    fn query_evaluations(
        &self,
        query: &SeriesQuery,
        timeout: Duration,
    ) -> Result<Vec<EvaluationRecord>, StorageError> {
        self.ensure_connected()?;
        self.evaluations.query(query, timeout)
    }

    fn last_price_dates(
        &self,
        timeout: Duration,
    ) -> Result<BTreeMap<String, NaiveDate>, StorageError> {
        self.ensure_connected()?;
        let deadline = Deadline::new(PricePoint::TABLE, timeout);
        let table = self
            .prices
            .rows
            .try_read_for(deadline.remaining()?)
            .ok_or_else(|| deadline.expired())?;
        // Keys iterate in (entity, date) order, so the last insert per entity wins.
        let mut out = BTreeMap::new();
        for (entity_id, date) in table.keys() {
            out.insert(entity_id.clone(), *date);
        }
        Ok(out)
    }
}
