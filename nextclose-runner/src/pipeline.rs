//! Pipeline Orchestrator.
//!
//! Runs ingest → forecast → ensemble → evaluate. Each stage fans entities out
//! over a bounded rayon pool and returns only once every write of the stage
//! has returned, so the next stage always reads committed rows.
//!
//! Failure policy:
//! - Fetch and model failures are per-entity and only show up in the stage
//!   report.
//! - A `StorageError` stops the stage: entities not yet started are
//!   abandoned and the stage returns `PipelineError::Storage`.
//! - A tripped `CancelHandle` abandons remaining entities the same way.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use nextclose_core::data::{clean_batch, FetchError, FetchPlanner, FetchTask, PriceSource};
use nextclose_core::ensemble::{build_ensembles, EnsembleConfig};
use nextclose_core::evaluation::evaluate_entity;
use nextclose_core::models::{forecast_entity, ModelRegistry};
use nextclose_core::store::{SeriesQuery, SeriesStore};
use nextclose_core::{ModelError, StorageError};

use crate::config::{ConfigError, PipelineConfig};

// ── Errors ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ingest,
    Forecast,
    Ensemble,
    Evaluate,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ingest => "ingest",
            Self::Forecast => "forecast",
            Self::Ensemble => "ensemble",
            Self::Evaluate => "evaluate",
        })
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} stage: storage failure{}: {source}", entity_suffix(.entity_id))]
    Storage {
        stage: Stage,
        entity_id: Option<String>,
        #[source]
        source: StorageError,
    },

    #[error("{stage} stage cancelled after {completed}/{total} entities")]
    Cancelled {
        stage: Stage,
        completed: usize,
        total: usize,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("model registry: {0}")]
    Model(#[from] ModelError),

    #[error("source chain: {0}")]
    Source(#[from] FetchError),

    #[error("worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

fn entity_suffix(entity_id: &Option<String>) -> String {
    entity_id
        .as_deref()
        .map(|id| format!(" on {id}"))
        .unwrap_or_default()
}

impl PipelineError {
    /// Whether re-running the whole batch may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    fn storage(stage: Stage, entity_id: Option<&str>, source: StorageError) -> Self {
        Self::Storage {
            stage,
            entity_id: entity_id.map(str::to_string),
            source,
        }
    }
}

// ── Cancellation ─────────────────────────────────────────────────────

/// Coarse cancellation: entities not yet started in the running stage are
/// abandoned. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Clear the flag so the pipeline can be run again.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

// ── Reports ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFailure {
    pub entity_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub planned: usize,
    pub up_to_date: usize,
    pub rows_fetched: usize,
    pub rows_stored: usize,
    pub rows_rejected: usize,
    pub failures: Vec<EntityFailure>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForecastReport {
    pub entities: usize,
    pub forecasts_written: usize,
    /// (entity, model) pairs below their history floor.
    pub insufficient_history: usize,
    /// Other isolated model failures.
    pub failures: Vec<EntityFailure>,
    /// Model families missing from this build.
    pub unavailable: Vec<String>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnsembleReport {
    pub entities: usize,
    pub rows_written: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub entities: usize,
    pub records_written: usize,
    /// Forecasts still waiting for their next session.
    pub pending: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub ingest: IngestReport,
    pub forecast: ForecastReport,
    pub ensemble: EnsembleReport,
    pub evaluate: EvaluationReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStatus {
    pub entity_id: String,
    pub prices: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub forecasts: usize,
    pub last_forecast: Option<NaiveDate>,
    pub evaluations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub store: String,
    pub models: Vec<String>,
    pub entities: Vec<EntityStatus>,
}

// ── Pipeline ─────────────────────────────────────────────────────────

/// Unit of work the stage driver can attribute to an entity.
trait EntityWork: Sync {
    fn entity_id(&self) -> &str;
}

impl EntityWork for String {
    fn entity_id(&self) -> &str {
        self
    }
}

impl EntityWork for FetchTask {
    fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

pub struct Pipeline {
    store: Arc<dyn SeriesStore>,
    source: Box<dyn PriceSource>,
    registry: ModelRegistry,
    planner: FetchPlanner,
    ensemble: EnsembleConfig,
    timeout: Duration,
    include_live: bool,
    pool: rayon::ThreadPool,
    cancel: CancelHandle,
}

impl Pipeline {
    /// Open the configured store and source chain.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let store = config.store.open();
        let source = Box::new(config.ingest.build_chain()?);
        Self::from_parts(config, store, source)
    }

    /// Build around an existing store and source (tests, embedding).
    pub fn from_parts(
        config: &PipelineConfig,
        store: Arc<dyn SeriesStore>,
        source: Box<dyn PriceSource>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let registry = ModelRegistry::from_specs(&config.models)?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.execution.workers)
            .thread_name(|i| format!("nextclose-worker-{i}"))
            .build()?;

        info!(
            "pipeline: store={} models={} workers={}",
            store.name(),
            registry.len(),
            config.execution.workers
        );

        Ok(Self {
            store,
            source,
            registry,
            planner: FetchPlanner::new(config.ingest.backfill),
            ensemble: config.ensemble.clone(),
            timeout: config.store.timeout(),
            include_live: config.execution.include_live,
            pool,
            cancel: CancelHandle::new(),
        })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn store(&self) -> &Arc<dyn SeriesStore> {
        &self.store
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Every entity with stored prices.
    pub fn stored_entities(&self) -> Result<Vec<String>, PipelineError> {
        self.store
            .entities(self.timeout)
            .map_err(|e| PipelineError::storage(Stage::Forecast, None, e))
    }

    /// All four stages in order, each a barrier for the next.
    pub fn run(
        &self,
        entities: &[String],
        today: NaiveDate,
        start_override: Option<NaiveDate>,
    ) -> Result<RunReport, PipelineError> {
        let ingest = self.ingest(entities, today, start_override)?;
        let forecast = self.forecast(entities, false)?;
        let ensemble = self.ensemble(entities)?;
        let evaluate = self.evaluate(entities)?;
        Ok(RunReport {
            ingest,
            forecast,
            ensemble,
            evaluate,
        })
    }

    // ── Stages ───────────────────────────────────────────────────────

    /// Fetch and store the sessions each entity is missing through `today`.
    pub fn ingest(
        &self,
        entities: &[String],
        today: NaiveDate,
        start_override: Option<NaiveDate>,
    ) -> Result<IngestReport, PipelineError> {
        let started = Instant::now();
        let cursor = self
            .store
            .last_price_dates(self.timeout)
            .map_err(|e| PipelineError::storage(Stage::Ingest, None, e))?;
        let plan = self.planner.plan(entities, &cursor, today, start_override);

        let outcomes = self.run_stage(Stage::Ingest, &plan.tasks, |task| {
            self.ingest_one(task, cursor.get(&task.entity_id).copied())
        })?;

        let mut report = IngestReport {
            planned: plan.tasks.len(),
            up_to_date: plan.up_to_date.len(),
            ..Default::default()
        };
        for o in outcomes {
            report.rows_fetched += o.fetched;
            report.rows_stored += o.stored;
            report.rows_rejected += o.rejected;
            if let Some(reason) = o.failure {
                report.failures.push(EntityFailure {
                    entity_id: o.entity_id,
                    model_name: None,
                    reason,
                });
            }
        }
        report.elapsed_ms = elapsed_ms(started);

        info!(
            "ingest: {} planned, {} up to date, {} rows stored, {} rejected, {} failed",
            report.planned,
            report.up_to_date,
            report.rows_stored,
            report.rows_rejected,
            report.failures.len()
        );
        Ok(report)
    }

    /// Walk-forward forecasts for every registry model.
    ///
    /// Incremental by default: only as-of dates after the latest stored
    /// forecast of each model are computed. `full` recomputes from the start
    /// of history and overwrites.
    pub fn forecast(&self, entities: &[String], full: bool) -> Result<ForecastReport, PipelineError> {
        let started = Instant::now();
        let ids = ordered(entities);

        let outcomes = self.run_stage(Stage::Forecast, &ids, |entity_id| {
            let prices = self
                .store
                .query_prices(&SeriesQuery::entity(entity_id), self.timeout)?;
            let latest = if full {
                BTreeMap::new()
            } else {
                self.store.last_forecast_dates(entity_id, self.timeout)?
            };
            let result = forecast_entity(entity_id, &prices, &self.registry, &latest, self.include_live);
            let written = if result.forecasts.is_empty() {
                0
            } else {
                self.store.upsert_forecasts(&result.forecasts, self.timeout)?
            };
            debug!("forecast {entity_id}: {written} rows");
            Ok((written, result.skipped))
        })?;

        let mut report = ForecastReport {
            entities: ids.len(),
            unavailable: self.registry.unavailable().iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        };
        for ((written, skipped), entity_id) in outcomes.into_iter().zip(&ids) {
            report.forecasts_written += written;
            for skip in skipped {
                if matches!(skip.error, ModelError::InsufficientHistory { .. }) {
                    report.insufficient_history += 1;
                } else {
                    report.failures.push(EntityFailure {
                        entity_id: entity_id.clone(),
                        model_name: Some(skip.model_name),
                        reason: skip.error.to_string(),
                    });
                }
            }
        }
        report.elapsed_ms = elapsed_ms(started);

        info!(
            "forecast: {} entities, {} rows written, {} below history floor, {} failed",
            report.entities,
            report.forecasts_written,
            report.insufficient_history,
            report.failures.len()
        );
        Ok(report)
    }

    /// Recompute mean/median ensembles from the stored member forecasts.
    pub fn ensemble(&self, entities: &[String]) -> Result<EnsembleReport, PipelineError> {
        let started = Instant::now();
        let ids = ordered(entities);

        let written = self.run_stage(Stage::Ensemble, &ids, |entity_id| {
            let base = self
                .store
                .query_forecasts(&SeriesQuery::entity(entity_id), self.timeout)?;
            let rows = build_ensembles(&base, &self.ensemble);
            if rows.is_empty() {
                return Ok(0);
            }
            self.store.upsert_forecasts(&rows, self.timeout)
        })?;

        let report = EnsembleReport {
            entities: ids.len(),
            rows_written: written.iter().sum(),
            elapsed_ms: elapsed_ms(started),
        };
        info!(
            "ensemble: {} entities, {} rows written",
            report.entities, report.rows_written
        );
        Ok(report)
    }

    /// Score every stored forecast whose next session has been stored.
    pub fn evaluate(&self, entities: &[String]) -> Result<EvaluationReport, PipelineError> {
        let started = Instant::now();
        let ids = ordered(entities);

        let outcomes = self.run_stage(Stage::Evaluate, &ids, |entity_id| {
            let query = SeriesQuery::entity(entity_id);
            let prices = self.store.query_prices(&query, self.timeout)?;
            let forecasts = self.store.query_forecasts(&query, self.timeout)?;
            let scored = evaluate_entity(&prices, &forecasts);
            let written = if scored.records.is_empty() {
                0
            } else {
                self.store.upsert_evaluations(&scored.records, self.timeout)?
            };
            Ok((written, scored.pending))
        })?;

        let report = EvaluationReport {
            entities: ids.len(),
            records_written: outcomes.iter().map(|(w, _)| w).sum(),
            pending: outcomes.iter().map(|(_, p)| p).sum(),
            elapsed_ms: elapsed_ms(started),
        };
        info!(
            "evaluate: {} entities, {} records written, {} pending",
            report.entities, report.records_written, report.pending
        );
        Ok(report)
    }

    /// Row counts and date coverage per entity.
    pub fn status(&self, entities: &[String]) -> Result<StatusReport, PipelineError> {
        let storage = |e| PipelineError::storage(Stage::Ingest, None, e);
        let ids = if entities.is_empty() {
            self.store.entities(self.timeout).map_err(storage)?
        } else {
            ordered(entities)
        };
        let query = SeriesQuery::all().with_entities(ids.iter().cloned());
        let prices = self.store.query_prices(&query, self.timeout).map_err(storage)?;
        let forecasts = self.store.query_forecasts(&query, self.timeout).map_err(storage)?;
        let evaluations = self.store.query_evaluations(&query, self.timeout).map_err(storage)?;

        let mut by_entity: BTreeMap<&str, EntityStatus> = ids
            .iter()
            .map(|id| {
                (
                    id.as_str(),
                    EntityStatus {
                        entity_id: id.clone(),
                        prices: 0,
                        first_date: None,
                        last_date: None,
                        forecasts: 0,
                        last_forecast: None,
                        evaluations: 0,
                    },
                )
            })
            .collect();

        for p in &prices {
            if let Some(s) = by_entity.get_mut(p.entity_id.as_str()) {
                s.prices += 1;
                s.first_date = s.first_date.or(Some(p.trade_date));
                s.last_date = Some(p.trade_date);
            }
        }
        for f in &forecasts {
            if let Some(s) = by_entity.get_mut(f.entity_id.as_str()) {
                s.forecasts += 1;
                s.last_forecast = s.last_forecast.max(Some(f.as_of));
            }
        }
        for e in &evaluations {
            if let Some(s) = by_entity.get_mut(e.entity_id.as_str()) {
                s.evaluations += 1;
            }
        }

        Ok(StatusReport {
            store: self.store.name().to_string(),
            models: self.registry.names().into_iter().map(str::to_string).collect(),
            entities: by_entity.into_values().collect(),
        })
    }

    // ── Internals ────────────────────────────────────────────────────

    fn ingest_one(
        &self,
        task: &FetchTask,
        last_stored: Option<NaiveDate>,
    ) -> Result<IngestOutcome, StorageError> {
        let mut outcome = IngestOutcome {
            entity_id: task.entity_id.clone(),
            ..Default::default()
        };

        let raw = match self.source.fetch(&task.entity_id, task.start, task.end) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("ingest {}: {e}", task.entity_id);
                outcome.failure = Some(e.to_string());
                return Ok(outcome);
            }
        };
        let raw: Vec<_> = raw
            .into_iter()
            .filter(|p| p.trade_date >= task.start && p.trade_date <= task.end)
            .collect();
        outcome.fetched = raw.len();
        if raw.is_empty() {
            debug!("ingest {}: no sessions in {}..={}", task.entity_id, task.start, task.end);
            return Ok(outcome);
        }

        let prev_close = match last_stored {
            Some(last) => self
                .store
                .query_prices(&SeriesQuery::entity(&task.entity_id).between(last, last), self.timeout)?
                .last()
                .map(|p| p.close),
            None => None,
        };

        let cleaned = clean_batch(&task.entity_id, raw, prev_close);
        for rejected in &cleaned.rejected {
            warn!("ingest {}: dropped row: {rejected}", task.entity_id);
        }
        outcome.rejected = cleaned.rejected.len();
        if !cleaned.rows.is_empty() {
            outcome.stored = self.store.upsert_prices(&cleaned.rows, self.timeout)?;
        }
        Ok(outcome)
    }

    /// Run `work` for every item on the pool, in item order.
    ///
    /// The first `StorageError` stops new items from starting; the error
    /// reported is the one for the earliest item. Cancellation is checked
    /// before each item.
    fn run_stage<I, T, F>(&self, stage: Stage, items: &[I], work: F) -> Result<Vec<T>, PipelineError>
    where
        I: EntityWork,
        T: Send,
        F: Fn(&I) -> Result<T, StorageError> + Sync,
    {
        let abort = AtomicBool::new(false);
        let results: Vec<Option<Result<T, StorageError>>> = self.pool.install(|| {
            items
                .par_iter()
                .map(|item| {
                    if abort.load(Ordering::Relaxed) || self.cancel.is_cancelled() {
                        return None;
                    }
                    let result = work(item);
                    if result.is_err() {
                        abort.store(true, Ordering::Relaxed);
                    }
                    Some(result)
                })
                .collect()
        });

        let total = items.len();
        let mut done = Vec::with_capacity(total);
        let mut abandoned = 0usize;
        for (item, result) in items.iter().zip(results) {
            match result {
                Some(Ok(value)) => done.push(value),
                Some(Err(source)) => {
                    return Err(PipelineError::storage(stage, Some(item.entity_id()), source));
                }
                None => abandoned += 1,
            }
        }
        if abandoned > 0 {
            warn!("{stage}: cancelled, {abandoned}/{total} entities abandoned");
            return Err(PipelineError::Cancelled {
                stage,
                completed: done.len(),
                total,
            });
        }
        Ok(done)
    }
}

#[derive(Debug, Default)]
struct IngestOutcome {
    entity_id: String,
    fetched: usize,
    stored: usize,
    rejected: usize,
    failure: Option<String>,
}

/// Sorted and deduplicated.
fn ordered(entities: &[String]) -> Vec<String> {
    entities
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use nextclose_core::data::SyntheticSource;
    use nextclose_core::store::MemoryStore;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn pipeline(store: Arc<dyn SeriesStore>) -> Pipeline {
        let mut config = PipelineConfig::default();
        config.execution.workers = 2;
        Pipeline::from_parts(&config, store, Box::new(SyntheticSource::new())).unwrap()
    }

    #[test]
    fn ordered_sorts_and_dedups() {
        let ids = vec!["B".to_string(), "A".to_string(), "B".to_string()];
        assert_eq!(ordered(&ids), vec!["A", "B"]);
    }

    #[test]
    fn storage_error_retryability_passes_through() {
        let err = PipelineError::storage(Stage::Forecast, Some("A"), StorageError::Unavailable("down".into()));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("forecast stage"));
        assert!(err.to_string().contains("on A"));

        let err = PipelineError::Cancelled {
            stage: Stage::Ingest,
            completed: 1,
            total: 3,
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn cancel_handle_is_shared() {
        let h = CancelHandle::new();
        let clone = h.clone();
        clone.cancel();
        assert!(h.is_cancelled());
        h.reset();
        assert!(!clone.is_cancelled());
    }

    #[test]
    fn status_reports_coverage() {
        let store: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
        let p = pipeline(Arc::clone(&store));
        let ids = vec!["A".to_string()];
        p.ingest(&ids, d(2025, 6, 30), Some(d(2025, 6, 2))).unwrap();

        let status = p.status(&[]).unwrap();
        assert_eq!(status.store, "memory");
        assert_eq!(status.entities.len(), 1);
        let a = &status.entities[0];
        assert_eq!(a.prices, 21);
        assert_eq!(a.first_date, Some(d(2025, 6, 2)));
        assert_eq!(a.last_date, Some(d(2025, 6, 30)));
        assert_eq!(a.forecasts, 0);
    }

    #[test]
    fn pre_cancelled_stage_abandons_everything() {
        let store: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
        let p = pipeline(store);
        p.cancel_handle().cancel();
        let ids = vec!["A".to_string(), "B".to_string()];
        let err = p.forecast(&ids, false).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Cancelled {
                stage: Stage::Forecast,
                completed: 0,
                total: 2
            }
        ));
    }
}
