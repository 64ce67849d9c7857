//! Parquet-backed Series Store with Hive-style partitioning.
//!
//! Layout: `{root}/{table}/entity={ID}.parquet` plus a sidecar
//! `{root}/{table}/entity={ID}.meta.json`.
//!
//! - Upsert reads the entity partition, merges by natural key, and writes the
//!   merged rows back atomically (write to `.tmp`, rename into place).
//! - The sidecar carries a BLAKE3 hash of the partition contents; when a merge
//!   produces identical contents the rewrite is skipped.
//! - One lock per partition, acquired with the caller deadline, serialises
//!   writers of the same entity. Writers of different entities never contend.

use super::{
    is_valid_entity_id, merge_into, validate_batch, Deadline, Record, SeriesQuery, SeriesStore,
};
use crate::domain::{EvaluationRecord, Forecast, PricePoint};
use crate::error::StorageError;
use chrono::NaiveDate;
use parking_lot::Mutex;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Sidecar describing one partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub table: String,
    pub entity_id: String,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    pub row_count: usize,
    pub data_hash: String,
    pub written_at: chrono::NaiveDateTime,
}

/// Series Store persisted as Parquet partitions under a root directory.
pub struct ParquetStore {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ParquetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    fn partition_path(&self, table: &'static str, entity_id: &str) -> Result<PathBuf, StorageError> {
        if !is_valid_entity_id(entity_id) {
            return Err(StorageError::constraint(
                table,
                format!("entity id '{entity_id}' cannot name a partition"),
            ));
        }
        Ok(self.table_dir(table).join(format!("entity={entity_id}.parquet")))
    }

    fn partition_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    /// Read the sidecar for one partition, if present and parseable.
    pub fn partition_meta(&self, table: &'static str, entity_id: &str) -> Option<PartitionMeta> {
        let path = self.partition_path(table, entity_id).ok()?;
        let content = fs::read_to_string(meta_path(&path)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Entity ids with a partition in `table`, sorted.
    fn partition_entities(&self, table: &str) -> Result<BTreeSet<String>, StorageError> {
        let dir = self.table_dir(table);
        if !dir.exists() {
            return Ok(BTreeSet::new());
        }
        let entries = fs::read_dir(&dir).map_err(|e| io_err(&dir, e))?;
        let mut out = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name
                .strip_prefix("entity=")
                .and_then(|rest| rest.strip_suffix(".parquet"))
            {
                out.insert(id.to_string());
            }
        }
        Ok(out)
    }

    fn upsert_table<R: FrameCodec>(&self, rows: &[R], timeout: Duration) -> Result<usize, StorageError> {
        let deadline = Deadline::new(R::TABLE, timeout);
        validate_batch(rows)?;

        let mut by_entity: BTreeMap<&str, Vec<R>> = BTreeMap::new();
        for row in rows {
            by_entity.entry(row.entity_id()).or_default().push(row.clone());
        }

        // Resolve every partition and take every lock (in entity order) before
        // touching disk, so a rejected batch writes nothing.
        let mut partitions = Vec::with_capacity(by_entity.len());
        for (entity_id, batch) in by_entity {
            let path = self.partition_path(R::TABLE, entity_id)?;
            let lock = self.partition_lock(&path);
            partitions.push((entity_id, path, lock, batch));
        }
        let mut guards = Vec::with_capacity(partitions.len());
        for (_, _, lock, _) in &partitions {
            let guard = lock
                .try_lock_for(deadline.remaining()?)
                .ok_or_else(|| deadline.expired())?;
            guards.push(guard);
        }

        let mut merged_partitions = Vec::with_capacity(partitions.len());
        for (entity_id, path, _, batch) in &partitions {
            let mut merged: BTreeMap<R::Key, R> = read_partition::<R>(path)?
                .into_iter()
                .map(|r| (r.key(), r))
                .collect();
            merge_into(&mut merged, batch);
            merged_partitions.push((*entity_id, path, merged.into_values().collect::<Vec<R>>()));
        }
        deadline.remaining()?;

        let dir = self.table_dir(R::TABLE);
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        for (entity_id, path, merged) in merged_partitions {
            write_partition(path, entity_id, &merged)?;
        }
        drop(guards);

        Ok(rows.len())
    }

    fn query_table<R: FrameCodec>(
        &self,
        query: &SeriesQuery,
        timeout: Duration,
    ) -> Result<Vec<R>, StorageError> {
        let deadline = Deadline::new(R::TABLE, timeout);
        let entities = match &query.entity_ids {
            Some(ids) => ids.clone(),
            None => self.partition_entities(R::TABLE)?,
        };

        let mut out = Vec::new();
        for entity_id in &entities {
            deadline.remaining()?;
            let path = self.partition_path(R::TABLE, entity_id)?;
            out.extend(
                read_partition::<R>(&path)?
                    .into_iter()
                    .filter(|row| query.matches(row)),
            );
        }
        Ok(out)
    }
}

impl SeriesStore for ParquetStore {
    fn name(&self) -> &str {
        "parquet"
    }

    fn upsert_prices(
        &self,
        rows: &[PricePoint],
        timeout: Duration,
    ) -> Result<usize, StorageError> {
        self.upsert_table(rows, timeout)
    }

    fn query_prices(
        &self,
        query: &SeriesQuery,
        timeout: Duration,
    ) -> Result<Vec<PricePoint>, StorageError> {
        self.query_table(query, timeout)
    }

    fn upsert_forecasts(&self, rows: &[Forecast], timeout: Duration) -> Result<usize, StorageError> {
        self.upsert_table(rows, timeout)
    }

    fn query_forecasts(
        &self,
        query: &SeriesQuery,
        timeout: Duration,
    ) -> Result<Vec<Forecast>, StorageError> {
        self.query_table(query, timeout)
    }

    fn upsert_evaluations(
        &self,
        rows: &[EvaluationRecord],
        timeout: Duration,
    ) -> Result<usize, StorageError> {
        self.upsert_table(rows, timeout)
    }

    fn query_evaluations(
        &self,
        query: &SeriesQuery,
        timeout: Duration,
    ) -> Result<Vec<EvaluationRecord>, StorageError> {
        self.query_table(query, timeout)
    }

    fn entities(&self, timeout: Duration) -> Result<Vec<String>, StorageError> {
        let deadline = Deadline::new(PricePoint::TABLE, timeout);
        deadline.remaining()?;
        let entities = self.partition_entities(PricePoint::TABLE)?;
        deadline.remaining()?;
        Ok(entities.into_iter().collect())
    }

    /// Served from the sidecars; a partition without a readable sidecar is
    /// loaded instead.
    fn last_price_dates(
        &self,
        timeout: Duration,
    ) -> Result<BTreeMap<String, NaiveDate>, StorageError> {
        let deadline = Deadline::new(PricePoint::TABLE, timeout);
        let mut out = BTreeMap::new();
        for entity_id in self.partition_entities(PricePoint::TABLE)? {
            deadline.remaining()?;
            let last = match self.partition_meta(PricePoint::TABLE, &entity_id) {
                Some(meta) => Some(meta.last_date),
                None => {
                    let path = self.partition_path(PricePoint::TABLE, &entity_id)?;
                    read_partition::<PricePoint>(&path)?
                        .last()
                        .map(|p| p.trade_date)
                }
            };
            if let Some(last) = last {
                out.insert(entity_id, last);
            }
        }
        Ok(out)
    }
}

// ── Partition I/O ───────────────────────────────────────────────────

fn meta_path(partition: &Path) -> PathBuf {
    partition.with_extension("meta.json")
}

fn io_err(path: &Path, e: std::io::Error) -> StorageError {
    StorageError::Unavailable(format!("{}: {e}", path.display()))
}

fn corrupt(path: &Path, reason: impl std::fmt::Display) -> StorageError {
    StorageError::Corrupt {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn read_partition<R: FrameCodec>(path: &Path) -> Result<Vec<R>, StorageError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path).map_err(|e| io_err(path, e))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| corrupt(path, format!("read: {e}")))?;
    R::from_frame(&df).map_err(|reason| corrupt(path, reason))
}

fn content_hash<R: FrameCodec>(rows: &[R]) -> Result<String, StorageError> {
    let bytes = serde_json::to_vec(rows)
        .map_err(|e| StorageError::constraint(R::TABLE, format!("hash serialization: {e}")))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn write_partition<R: FrameCodec>(path: &Path, entity_id: &str, rows: &[R]) -> Result<(), StorageError> {
    let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
        return Ok(());
    };

    let data_hash = content_hash(rows)?;
    let meta_file = meta_path(path);
    let unchanged = fs::read_to_string(&meta_file)
        .ok()
        .and_then(|s| serde_json::from_str::<PartitionMeta>(&s).ok())
        .is_some_and(|m| m.data_hash == data_hash && path.exists());
    if unchanged {
        log::debug!("{} {entity_id}: partition unchanged, skipping rewrite", R::TABLE);
        return Ok(());
    }

    let mut df = R::to_frame(rows).map_err(|e| corrupt(path, format!("frame build: {e}")))?;
    let tmp_path = path.with_extension("parquet.tmp");
    let file = fs::File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
    ParquetWriter::new(file)
        .finish(&mut df)
        .map_err(|e| StorageError::Unavailable(format!("write {}: {e}", tmp_path.display())))?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        io_err(path, e)
    })?;

    let meta = PartitionMeta {
        table: R::TABLE.to_string(),
        entity_id: entity_id.to_string(),
        first_date: first.date(),
        last_date: last.date(),
        row_count: rows.len(),
        data_hash,
        written_at: chrono::Local::now().naive_local(),
    };
    let json = serde_json::to_string_pretty(&meta)
        .map_err(|e| StorageError::Unavailable(format!("meta serialization: {e}")))?;
    let tmp_meta = meta_file.with_extension("json.tmp");
    fs::write(&tmp_meta, json).map_err(|e| io_err(&tmp_meta, e))?;
    fs::rename(&tmp_meta, &meta_file).map_err(|e| io_err(&meta_file, e))?;
    Ok(())
}

// ── Frame codecs ────────────────────────────────────────────────────

/// Conversion between a row type and a Polars frame.
pub trait FrameCodec: Record + Serialize {
    fn to_frame(rows: &[Self]) -> PolarsResult<DataFrame>;
    fn from_frame(df: &DataFrame) -> Result<Vec<Self>, String>;
}

fn epoch() -> NaiveDate {
    NaiveDate::default()
}

fn date_column(name: &str, dates: impl Iterator<Item = NaiveDate>) -> PolarsResult<Column> {
    let days: Vec<i32> = dates
        .map(|d| (d - epoch()).num_days() as i32)
        .collect();
    Column::new(name.into(), days).cast(&DataType::Date)
}

fn read_dates(df: &DataFrame, name: &str) -> Result<Vec<NaiveDate>, String> {
    let col = df
        .column(name)
        .and_then(|c| c.cast(&DataType::Int32))
        .map_err(|e| format!("column '{name}': {e}"))?;
    let ca = col.i32().map_err(|e| format!("column '{name}': {e}"))?;
    ca.into_iter()
        .enumerate()
        .map(|(i, v)| {
            v.map(|days| epoch() + chrono::Duration::days(days as i64))
                .ok_or_else(|| format!("null {name} at row {i}"))
        })
        .collect()
}

fn read_strings(df: &DataFrame, name: &str) -> Result<Vec<String>, String> {
    let ca = df
        .column(name)
        .and_then(|c| c.str())
        .map_err(|e| format!("column '{name}': {e}"))?;
    ca.into_iter()
        .enumerate()
        .map(|(i, v)| {
            v.map(str::to_string)
                .ok_or_else(|| format!("null {name} at row {i}"))
        })
        .collect()
}

fn read_opt_f64(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, String> {
    let ca = df
        .column(name)
        .and_then(|c| c.f64())
        .map_err(|e| format!("column '{name}': {e}"))?;
    Ok(ca.into_iter().collect())
}

fn read_f64(df: &DataFrame, name: &str) -> Result<Vec<f64>, String> {
    read_opt_f64(df, name)?
        .into_iter()
        .enumerate()
        .map(|(i, v)| v.ok_or_else(|| format!("null {name} at row {i}")))
        .collect()
}

fn read_u32(df: &DataFrame, name: &str) -> Result<Vec<u32>, String> {
    let ca = df
        .column(name)
        .and_then(|c| c.u32())
        .map_err(|e| format!("column '{name}': {e}"))?;
    ca.into_iter()
        .enumerate()
        .map(|(i, v)| v.ok_or_else(|| format!("null {name} at row {i}")))
        .collect()
}

impl FrameCodec for PricePoint {
    fn to_frame(rows: &[Self]) -> PolarsResult<DataFrame> {
        let f = |get: fn(&PricePoint) -> f64| rows.iter().map(get).collect::<Vec<f64>>();
        DataFrame::new(vec![
            Column::new(
                "entity_id".into(),
                rows.iter().map(|r| r.entity_id.as_str()).collect::<Vec<_>>(),
            ),
            date_column("trade_date", rows.iter().map(|r| r.trade_date))?,
            Column::new("open".into(), f(|r| r.open)),
            Column::new("high".into(), f(|r| r.high)),
            Column::new("low".into(), f(|r| r.low)),
            Column::new("close".into(), f(|r| r.close)),
            Column::new(
                "adjusted_close".into(),
                rows.iter().map(|r| r.adjusted_close).collect::<Vec<_>>(),
            ),
            Column::new(
                "volume".into(),
                rows.iter().map(|r| r.volume).collect::<Vec<_>>(),
            ),
            Column::new(
                "change".into(),
                rows.iter().map(|r| r.change).collect::<Vec<_>>(),
            ),
        ])
    }

    fn from_frame(df: &DataFrame) -> Result<Vec<Self>, String> {
        let entity_ids = read_strings(df, "entity_id")?;
        let dates = read_dates(df, "trade_date")?;
        let opens = read_f64(df, "open")?;
        let highs = read_f64(df, "high")?;
        let lows = read_f64(df, "low")?;
        let closes = read_f64(df, "close")?;
        let adjusted = read_opt_f64(df, "adjusted_close")?;
        let changes = read_opt_f64(df, "change")?;
        let volumes: Vec<Option<i64>> = df
            .column("volume")
            .and_then(|c| c.i64())
            .map_err(|e| format!("column 'volume': {e}"))?
            .into_iter()
            .collect();

        Ok((0..df.height())
            .map(|i| PricePoint {
                entity_id: entity_ids[i].clone(),
                trade_date: dates[i],
                open: opens[i],
                high: highs[i],
                low: lows[i],
                close: closes[i],
                adjusted_close: adjusted[i],
                volume: volumes[i],
                change: changes[i],
            })
            .collect())
    }
}

impl FrameCodec for Forecast {
    fn to_frame(rows: &[Self]) -> PolarsResult<DataFrame> {
        DataFrame::new(vec![
            date_column("as_of", rows.iter().map(|r| r.as_of))?,
            Column::new(
                "entity_id".into(),
                rows.iter().map(|r| r.entity_id.as_str()).collect::<Vec<_>>(),
            ),
            Column::new(
                "model_name".into(),
                rows.iter().map(|r| r.model_name.as_str()).collect::<Vec<_>>(),
            ),
            Column::new(
                "horizon".into(),
                rows.iter().map(|r| r.horizon).collect::<Vec<u32>>(),
            ),
            Column::new(
                "predicted_value".into(),
                rows.iter().map(|r| r.predicted_value).collect::<Vec<f64>>(),
            ),
        ])
    }

    fn from_frame(df: &DataFrame) -> Result<Vec<Self>, String> {
        let as_of = read_dates(df, "as_of")?;
        let entity_ids = read_strings(df, "entity_id")?;
        let models = read_strings(df, "model_name")?;
        let horizons = read_u32(df, "horizon")?;
        let values = read_f64(df, "predicted_value")?;

        Ok((0..df.height())
            .map(|i| Forecast {
                as_of: as_of[i],
                entity_id: entity_ids[i].clone(),
                model_name: models[i].clone(),
                horizon: horizons[i],
                predicted_value: values[i],
            })
            .collect())
    }
}

impl FrameCodec for EvaluationRecord {
    fn to_frame(rows: &[Self]) -> PolarsResult<DataFrame> {
        let f = |get: fn(&EvaluationRecord) -> f64| rows.iter().map(get).collect::<Vec<f64>>();
        DataFrame::new(vec![
            date_column("as_of", rows.iter().map(|r| r.as_of))?,
            Column::new(
                "entity_id".into(),
                rows.iter().map(|r| r.entity_id.as_str()).collect::<Vec<_>>(),
            ),
            Column::new(
                "model_name".into(),
                rows.iter().map(|r| r.model_name.as_str()).collect::<Vec<_>>(),
            ),
            Column::new(
                "horizon".into(),
                rows.iter().map(|r| r.horizon).collect::<Vec<u32>>(),
            ),
            Column::new("predicted_value".into(), f(|r| r.predicted_value)),
            Column::new("realized_value".into(), f(|r| r.realized_value)),
            Column::new("absolute_error".into(), f(|r| r.absolute_error)),
            Column::new(
                "direction_correct".into(),
                rows.iter().map(|r| r.direction_correct).collect::<Vec<bool>>(),
            ),
        ])
    }

    fn from_frame(df: &DataFrame) -> Result<Vec<Self>, String> {
        let as_of = read_dates(df, "as_of")?;
        let entity_ids = read_strings(df, "entity_id")?;
        let models = read_strings(df, "model_name")?;
        let horizons = read_u32(df, "horizon")?;
        let predicted = read_f64(df, "predicted_value")?;
        let realized = read_f64(df, "realized_value")?;
        let errors = read_f64(df, "absolute_error")?;
        let directions: Vec<bool> = df
            .column("direction_correct")
            .and_then(|c| c.bool())
            .map_err(|e| format!("column 'direction_correct': {e}"))?
            .into_iter()
            .enumerate()
            .map(|(i, v)| v.ok_or_else(|| format!("null direction_correct at row {i}")))
            .collect::<Result<_, _>>()?;

        Ok((0..df.height())
            .map(|i| EvaluationRecord {
                as_of: as_of[i],
                entity_id: entity_ids[i].clone(),
                model_name: models[i].clone(),
                horizon: horizons[i],
                predicted_value: predicted[i],
                realized_value: realized[i],
                absolute_error: errors[i],
                direction_correct: directions[i],
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(5);

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
    }

    fn bar(entity: &str, day: u32, close: f64) -> PricePoint {
        PricePoint {
            entity_id: entity.into(),
            trade_date: d(day),
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            adjusted_close: Some(close),
            volume: Some(1_000),
            change: None,
        }
    }

    #[test]
    fn prices_survive_a_write_read_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        store
            .upsert_prices(&[bar("A", 4, 101.0), bar("A", 3, 100.0)], T)
            .unwrap();

        let rows = store.query_prices(&SeriesQuery::entity("A"), T).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].trade_date, d(3));
        assert_eq!(rows[1], bar("A", 4, 101.0));
    }

    #[test]
    fn upsert_merges_with_existing_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        store.upsert_prices(&[bar("A", 3, 100.0)], T).unwrap();
        store
            .upsert_prices(&[bar("A", 3, 99.0), bar("A", 5, 102.0)], T)
            .unwrap();

        let rows = store.query_prices(&SeriesQuery::all(), T).unwrap();
        let closes: Vec<f64> = rows.iter().map(|r| r.close).collect();
        assert_eq!(closes, vec![99.0, 102.0]);

        let meta = store.partition_meta("prices", "A").unwrap();
        assert_eq!(meta.row_count, 2);
        assert_eq!(meta.last_date, d(5));
    }

    #[test]
    fn identical_reapply_does_not_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let rows = vec![bar("A", 3, 100.0), bar("A", 4, 101.0)];
        store.upsert_prices(&rows, T).unwrap();
        let first = store.partition_meta("prices", "A").unwrap();

        store.upsert_prices(&rows, T).unwrap();
        let second = store.partition_meta("prices", "A").unwrap();

        assert_eq!(first.data_hash, second.data_hash);
        assert_eq!(first.written_at, second.written_at);
    }

    #[test]
    fn forecasts_and_evaluations_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        store
            .upsert_forecasts(&[Forecast::new(d(3), "A", "safe_ma_w5", 101.5)], T)
            .unwrap();
        store
            .upsert_evaluations(
                &[EvaluationRecord {
                    as_of: d(3),
                    entity_id: "A".into(),
                    model_name: "safe_ma_w5".into(),
                    horizon: 1,
                    predicted_value: 101.5,
                    realized_value: 100.0,
                    absolute_error: 1.5,
                    direction_correct: false,
                }],
                T,
            )
            .unwrap();

        let f = store.query_forecasts(&SeriesQuery::all(), T).unwrap();
        assert_eq!(f[0].predicted_value, 101.5);
        let e = store.query_evaluations(&SeriesQuery::all(), T).unwrap();
        assert!(!e[0].direction_correct);
        assert_eq!(e[0].absolute_error, 1.5);
    }

    #[test]
    fn cursor_comes_from_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        store
            .upsert_prices(&[bar("A", 3, 1.0), bar("B", 9, 1.0), bar("A", 6, 1.0)], T)
            .unwrap();
        let cursor = store.last_price_dates(T).unwrap();
        assert_eq!(cursor.get("A"), Some(&d(6)));
        assert_eq!(cursor.get("B"), Some(&d(9)));
        assert_eq!(store.entities(T).unwrap(), vec!["A", "B"]);
    }

    #[test]
    fn path_like_entity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let err = store.upsert_prices(&[bar("../x", 3, 1.0)], T).unwrap_err();
        assert!(matches!(err, StorageError::Constraint { .. }));
    }

    #[test]
    fn rejected_batch_writes_no_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let batch = [bar("A", 3, 1.0), bar("Z/../x", 3, 1.0)];
        assert!(store.upsert_prices(&batch, T).is_err());
        assert!(store.partition_meta("prices", "A").is_none());
        assert!(!dir.path().join("prices/entity=A.parquet").exists());
    }

    #[test]
    fn corrupt_later_partition_leaves_earlier_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        fs::create_dir_all(dir.path().join("prices")).unwrap();
        fs::write(dir.path().join("prices/entity=B.parquet"), b"not parquet").unwrap();
        let err = store
            .upsert_prices(&[bar("A", 3, 1.0), bar("B", 3, 1.0)], T)
            .unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
        assert!(!dir.path().join("prices/entity=A.parquet").exists());
    }

    #[test]
    fn entities_honours_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        store.upsert_prices(&[bar("A", 3, 1.0)], T).unwrap();
        assert!(matches!(
            store.entities(Duration::ZERO),
            Err(StorageError::Timeout { .. })
        ));
    }

    #[test]
    fn unreadable_partition_is_corrupt_not_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        fs::create_dir_all(dir.path().join("prices")).unwrap();
        fs::write(dir.path().join("prices/entity=A.parquet"), b"not parquet").unwrap();
        let err = store.query_prices(&SeriesQuery::all(), T).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
        assert!(!err.is_retryable());
    }
}
