//! End-to-end pipeline properties against a scripted upstream.
//!
//! 1. Idempotence: a second run on unchanged input changes nothing
//! 2. Monotonic extension: one new session adds exactly its own as-of rows,
//!    and day-by-day runs store the same rows as one backfill
//! 3. Truth exclusion: the latest session is never evaluated
//! 4. Ensemble and evaluation worked examples through the stage API
//! 5. Minimum-history gating
//! 6. Failure isolation, fatal storage loss, cancellation
//! 7. Same stored rows regardless of backend and worker count

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use chrono::{Datelike, NaiveDate, Weekday};
use nextclose_core::data::{FetchError, PriceSource};
use nextclose_core::domain::{EvaluationRecord, Forecast, PricePoint};
use nextclose_core::ensemble::{ENSEMBLE_MEAN, ENSEMBLE_MEDIAN};
use nextclose_core::models::{ModelKind, ModelSpec};
use nextclose_core::store::{MemoryStore, ParquetStore, SeriesQuery, SeriesStore};
use nextclose_runner::{Pipeline, PipelineConfig, PipelineError, Stage};

const T: std::time::Duration = std::time::Duration::from_secs(10);

// ── Fixtures ─────────────────────────────────────────────────────────

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `n` consecutive weekdays from Monday 2025-01-06.
fn sessions(n: usize) -> Vec<NaiveDate> {
    let mut out = Vec::with_capacity(n);
    let mut d = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
    while out.len() < n {
        if !matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
            out.push(d);
        }
        d = d.succ_opt().unwrap();
    }
    out
}

fn wave(n: usize, phase: f64) -> Vec<f64> {
    (0..n)
        .map(|i| 100.0 + 5.0 * (i as f64 * 0.3 + phase).sin() + i as f64 * 0.1)
        .collect()
}

fn series(entity: &str, closes: &[f64]) -> Vec<PricePoint> {
    sessions(closes.len())
        .into_iter()
        .zip(closes)
        .map(|(d, &c)| {
            let mut p = PricePoint::from_close(entity, d, c);
            p.volume = Some(1_000);
            p
        })
        .collect()
}

/// Upstream with a fixed per-entity history; serves whatever falls inside
/// the requested window.
#[derive(Default)]
struct Scripted {
    series: RwLock<BTreeMap<String, Vec<PricePoint>>>,
    failing: RwLock<BTreeSet<String>>,
}

impl Scripted {
    fn with(entries: Vec<(&str, Vec<PricePoint>)>) -> Arc<Self> {
        let s = Self::default();
        {
            let mut map = s.series.write().unwrap();
            for (id, rows) in entries {
                map.insert(id.to_string(), rows);
            }
        }
        Arc::new(s)
    }

    fn fail(&self, entity: &str) {
        self.failing.write().unwrap().insert(entity.to_string());
    }
}

struct Shared(Arc<Scripted>);

impl PriceSource for Shared {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch(
        &self,
        entity_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PricePoint>, FetchError> {
        if self.0.failing.read().unwrap().contains(entity_id) {
            return Err(FetchError::NetworkUnreachable("scripted outage".into()));
        }
        Ok(self
            .0
            .series
            .read()
            .unwrap()
            .get(entity_id)
            .map(|rows| {
                rows.iter()
                    .filter(|p| p.trade_date >= start && p.trade_date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn config(workers: usize) -> PipelineConfig {
    let mut c = PipelineConfig::default();
    c.models = vec![
        ModelSpec::new("safe_ma_w3", ModelKind::MovingAverage { window: 3 }),
        ModelSpec::new("safe_ma_w5", ModelKind::MovingAverage { window: 5 }),
        ModelSpec::new(
            "safe_ses_a0.5",
            ModelKind::ExponentialSmoothing {
                alpha: 0.5,
                warmup: 5,
            },
        ),
        ModelSpec::new("naive_ma_w2", ModelKind::MovingAverage { window: 2 }),
    ];
    c.execution.workers = workers;
    c
}

fn pipeline(store: Arc<dyn SeriesStore>, source: &Arc<Scripted>, workers: usize) -> Pipeline {
    Pipeline::from_parts(&config(workers), store, Box::new(Shared(Arc::clone(source)))).unwrap()
}

type Snapshot = (Vec<PricePoint>, Vec<Forecast>, Vec<EvaluationRecord>);

fn snapshot(store: &dyn SeriesStore) -> Snapshot {
    let all = SeriesQuery::all();
    (
        store.query_prices(&all, T).unwrap(),
        store.query_forecasts(&all, T).unwrap(),
        store.query_evaluations(&all, T).unwrap(),
    )
}

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

// ── Properties ───────────────────────────────────────────────────────

#[test]
fn second_run_on_unchanged_input_is_a_no_op() {
    init_logging();
    let source = Scripted::with(vec![("A", series("A", &wave(40, 0.0))), ("B", series("B", &wave(40, 1.0)))]);
    let today = sessions(40)[39];
    let store: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
    let p = pipeline(Arc::clone(&store), &source, 2);
    let entities = ids(&["A", "B"]);

    let first = p.run(&entities, today, None).unwrap();
    assert_eq!(first.ingest.rows_stored, 80);
    assert!(first.forecast.forecasts_written > 0);
    let before = snapshot(store.as_ref());

    let second = p.run(&entities, today, None).unwrap();
    assert_eq!(second.ingest.planned, 0);
    assert_eq!(second.ingest.up_to_date, 2);
    assert_eq!(second.forecast.forecasts_written, 0);
    assert_eq!(snapshot(store.as_ref()), before);

    p.forecast(&entities, true).unwrap();
    assert_eq!(snapshot(store.as_ref()), before, "full recompute must overwrite with equal values");
}

#[test]
fn appending_one_session_only_adds_its_own_forecasts() {
    init_logging();
    let days = sessions(30);
    let source = Scripted::with(vec![("A", series("A", &wave(30, 0.5)))]);
    let store: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
    let p = pipeline(Arc::clone(&store), &source, 2);
    let entities = ids(&["A"]);

    p.run(&entities, days[28], None).unwrap();
    let (_, old_forecasts, _) = snapshot(store.as_ref());

    let report = p.run(&entities, days[29], None).unwrap();
    assert_eq!(report.ingest.rows_stored, 1);
    let (prices, new_forecasts, evaluations) = snapshot(store.as_ref());

    let kept: Vec<_> = new_forecasts
        .iter()
        .filter(|f| f.as_of <= days[28])
        .cloned()
        .collect();
    assert_eq!(kept, old_forecasts);

    let added: BTreeSet<_> = new_forecasts
        .iter()
        .filter(|f| f.as_of > days[28])
        .map(|f| {
            assert_eq!(f.as_of, days[29]);
            f.model_name.as_str()
        })
        .collect();
    assert_eq!(
        added,
        BTreeSet::from([
            ENSEMBLE_MEAN,
            ENSEMBLE_MEDIAN,
            "naive_ma_w2",
            "safe_ma_w3",
            "safe_ma_w5",
            "safe_ses_a0.5",
        ])
    );

    // The previous live point now has its truth.
    assert!(evaluations.iter().any(|e| e.as_of == days[28]));

    // Incremental ingest lands on the same rows as a one-shot backfill.
    let fresh: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
    pipeline(Arc::clone(&fresh), &source, 2)
        .ingest(&entities, days[29], None)
        .unwrap();
    assert_eq!(fresh.query_prices(&SeriesQuery::all(), T).unwrap(), prices);

    // And so does every forecast, ensemble and evaluation row.
    pipeline(Arc::clone(&fresh), &source, 2)
        .run(&entities, days[29], None)
        .unwrap();
    assert_eq!(snapshot(fresh.as_ref()), (prices, new_forecasts, evaluations));
}

#[test]
fn daily_increments_match_one_backfill_for_every_family() {
    init_logging();
    let n = 140;
    let days = sessions(n);
    let closes: Vec<f64> = (0..n)
        .map(|i| 100.0 + 7.3 * (i as f64 * 0.17).sin() + 2.1 * (i as f64 * 0.05).cos())
        .collect();
    let source = Scripted::with(vec![("A", series("A", &closes))]);
    let entities = ids(&["A"]);
    let defaults = PipelineConfig::default();
    let build = |store: &Arc<dyn SeriesStore>| {
        Pipeline::from_parts(&defaults, Arc::clone(store), Box::new(Shared(Arc::clone(&source))))
            .unwrap()
    };

    let daily: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
    let p = build(&daily);
    p.run(&entities, days[125], None).unwrap();
    for today in &days[126..] {
        p.run(&entities, *today, None).unwrap();
    }

    let once: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
    build(&once).run(&entities, days[n - 1], None).unwrap();

    let incremental = snapshot(daily.as_ref());
    assert_eq!(incremental, snapshot(once.as_ref()));

    let families: BTreeSet<_> = incremental.1.iter().map(|f| f.model_name.as_str()).collect();
    for spec in &defaults.models {
        assert!(families.contains(spec.name.as_str()), "{} produced nothing", spec.name);
    }
}

#[test]
fn latest_session_is_never_evaluated() {
    init_logging();
    let source = Scripted::with(vec![("A", series("A", &wave(25, 2.0)))]);
    let days = sessions(25);
    let store: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
    let p = pipeline(Arc::clone(&store), &source, 1);

    let report = p.run(&ids(&["A"]), days[24], None).unwrap();
    let (_, forecasts, evaluations) = snapshot(store.as_ref());

    assert!(forecasts.iter().any(|f| f.as_of == days[24]));
    assert!(evaluations.iter().all(|e| e.as_of < days[24]));
    let live = forecasts.iter().filter(|f| f.as_of == days[24]).count();
    assert_eq!(report.evaluate.pending, live);
    assert_eq!(evaluations.len(), forecasts.len() - live);
}

#[test]
fn ensemble_stage_mean_and_median() {
    let source = Scripted::with(vec![]);
    let store: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
    let p = pipeline(Arc::clone(&store), &source, 1);
    let as_of = sessions(1)[0];
    store
        .upsert_forecasts(
            &[
                Forecast::new(as_of, "E", "safe_ma_w5", 10.0),
                Forecast::new(as_of, "E", "safe_ses_a0.3", 12.0),
                Forecast::new(as_of, "E", "safe_dl_lb20", 14.0),
                Forecast::new(as_of, "E", "naive_ma_w2", 1_000.0),
            ],
            T,
        )
        .unwrap();

    let report = p.ensemble(&ids(&["E"])).unwrap();
    assert_eq!(report.rows_written, 2);

    let rows = store
        .query_forecasts(
            &SeriesQuery::entity("E").with_models([ENSEMBLE_MEAN, ENSEMBLE_MEDIAN]),
            T,
        )
        .unwrap();
    let values: BTreeMap<_, _> = rows
        .iter()
        .map(|f| (f.model_name.as_str(), f.predicted_value))
        .collect();
    assert_eq!(values[ENSEMBLE_MEAN], 12.0);
    assert_eq!(values[ENSEMBLE_MEDIAN], 12.0);
}

#[test]
fn evaluation_stage_worked_example() {
    let source = Scripted::with(vec![]);
    let store: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
    let p = pipeline(Arc::clone(&store), &source, 1);
    let days = sessions(3);
    store
        .upsert_prices(&series("E", &[100.0, 102.0, 99.0]), T)
        .unwrap();
    store
        .upsert_forecasts(
            &[
                Forecast::new(days[1], "E", "manual", 101.0),
                Forecast::new(days[2], "E", "manual", 98.0),
            ],
            T,
        )
        .unwrap();

    let report = p.evaluate(&ids(&["E"])).unwrap();
    assert_eq!(report.records_written, 1);
    assert_eq!(report.pending, 1);

    let rec = &store.query_evaluations(&SeriesQuery::all(), T).unwrap()[0];
    assert_eq!(rec.as_of, days[1]);
    assert_eq!(rec.realized_value, 99.0);
    assert_eq!(rec.absolute_error, 2.0);
    assert!(!rec.direction_correct);
}

#[test]
fn moving_average_needs_window_observations() {
    let source = Scripted::with(vec![
        ("FOUR", series("FOUR", &[1.0, 2.0, 3.0, 4.0])),
        ("FIVE", series("FIVE", &[1.0, 2.0, 3.0, 4.0, 5.0])),
    ]);
    let mut cfg = config(2);
    cfg.models = vec![ModelSpec::new("safe_ma_w5", ModelKind::MovingAverage { window: 5 })];
    let store: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
    let p = Pipeline::from_parts(&cfg, Arc::clone(&store), Box::new(Shared(source))).unwrap();

    let entities = ids(&["FIVE", "FOUR"]);
    p.ingest(&entities, sessions(5)[4], None).unwrap();
    let report = p.forecast(&entities, false).unwrap();
    assert_eq!(report.insufficient_history, 1);
    assert!(report.failures.is_empty());

    let four = store.query_forecasts(&SeriesQuery::entity("FOUR"), T).unwrap();
    let five = store.query_forecasts(&SeriesQuery::entity("FIVE"), T).unwrap();
    assert!(four.is_empty());
    assert_eq!(five.len(), 1);
    assert_eq!(five[0].predicted_value, 3.0);
}

#[test]
fn upstream_failures_and_bad_rows_stay_isolated() {
    init_logging();
    let mut rows = series("A", &wave(20, 0.0));
    rows[7].volume = Some(-5);
    let source = Scripted::with(vec![("A", rows), ("DOWN", series("DOWN", &wave(20, 0.0)))]);
    source.fail("DOWN");
    let store: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
    let p = pipeline(Arc::clone(&store), &source, 2);

    let report = p.run(&ids(&["A", "DOWN"]), sessions(20)[19], None).unwrap();
    assert_eq!(report.ingest.rows_rejected, 1);
    assert_eq!(report.ingest.rows_stored, 19);
    assert_eq!(report.ingest.failures.len(), 1);
    assert_eq!(report.ingest.failures[0].entity_id, "DOWN");

    assert!(!store.query_forecasts(&SeriesQuery::entity("A"), T).unwrap().is_empty());
    assert!(store.query_prices(&SeriesQuery::entity("DOWN"), T).unwrap().is_empty());
}

#[test]
fn storage_loss_is_fatal_and_retryable() {
    let source = Scripted::with(vec![("A", series("A", &wave(10, 0.0)))]);
    let memory = Arc::new(MemoryStore::new());
    let store: Arc<dyn SeriesStore> = memory.clone();
    let p = pipeline(store, &source, 2);
    let entities = ids(&["A"]);

    memory.disconnect();
    let err = p.run(&entities, sessions(10)[9], None).unwrap_err();
    assert!(matches!(err, PipelineError::Storage { stage: Stage::Ingest, .. }));
    assert!(err.is_retryable());

    memory.reconnect();
    p.ingest(&entities, sessions(10)[9], None).unwrap();
    memory.disconnect();
    let err = p.forecast(&entities, false).unwrap_err();
    match err {
        PipelineError::Storage {
            stage, entity_id, ..
        } => {
            assert_eq!(stage, Stage::Forecast);
            assert_eq!(entity_id.as_deref(), Some("A"));
        }
        other => panic!("expected storage error, got {other}"),
    }
}

#[test]
fn cancelled_run_can_be_resumed() {
    let source = Scripted::with(vec![("A", series("A", &wave(15, 0.0))), ("B", series("B", &wave(15, 1.0)))]);
    let today = sessions(15)[14];
    let entities = ids(&["A", "B"]);

    let store: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
    let p = pipeline(Arc::clone(&store), &source, 2);
    let cancel = p.cancel_handle();
    cancel.cancel();
    let err = p.run(&entities, today, None).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Cancelled {
            stage: Stage::Ingest,
            completed: 0,
            total: 2
        }
    ));
    assert!(store.query_prices(&SeriesQuery::all(), T).unwrap().is_empty());

    cancel.reset();
    p.run(&entities, today, None).unwrap();

    let reference: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
    pipeline(Arc::clone(&reference), &source, 2)
        .run(&entities, today, None)
        .unwrap();
    assert_eq!(snapshot(store.as_ref()), snapshot(reference.as_ref()));
}

#[test]
fn stored_rows_do_not_depend_on_worker_count_or_backend() {
    let entries: Vec<_> = ["A", "B", "C", "D", "E"]
        .iter()
        .enumerate()
        .map(|(k, id)| (*id, series(id, &wave(30, k as f64))))
        .collect();
    let source = Scripted::with(entries);
    let today = sessions(30)[29];
    let entities = ids(&["A", "B", "C", "D", "E"]);

    let serial: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
    pipeline(Arc::clone(&serial), &source, 1)
        .run(&entities, today, None)
        .unwrap();

    let parallel: Arc<dyn SeriesStore> = Arc::new(MemoryStore::new());
    pipeline(Arc::clone(&parallel), &source, 4)
        .run(&entities, today, None)
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let parquet: Arc<dyn SeriesStore> = Arc::new(ParquetStore::new(dir.path()));
    let p = pipeline(Arc::clone(&parquet), &source, 3);
    p.run(&entities, today, None).unwrap();
    let once = snapshot(parquet.as_ref());
    p.run(&entities, today, None).unwrap();

    let expected = snapshot(serial.as_ref());
    assert_eq!(snapshot(parallel.as_ref()), expected);
    assert_eq!(once, expected);
    assert_eq!(snapshot(parquet.as_ref()), expected);
}
