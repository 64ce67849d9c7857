//! Series Store contract, run against every backend.
//!
//! 1. Upsert overwrites non-key columns and is idempotent
//! 2. Query order is (entity_id, date) ascending, one row per key
//! 3. A batch with a constraint violation, including an entity id that cannot
//!    name a partition, is rejected whole
//! 4. Concurrent upserts to disjoint entities all land

use chrono::NaiveDate;
use nextclose_core::domain::{EvaluationRecord, Forecast, PricePoint};
use nextclose_core::store::{MemoryStore, ParquetStore, SeriesQuery, SeriesStore};
use nextclose_core::StorageError;
use std::sync::Arc;
use std::time::Duration;

const T: Duration = Duration::from_secs(10);

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 4, day).unwrap()
}

fn price(entity: &str, day: u32, close: f64) -> PricePoint {
    let mut p = PricePoint::from_close(entity, d(day), close);
    p.volume = Some(100);
    p
}

fn with_backends(check: impl Fn(Arc<dyn SeriesStore>)) {
    check(Arc::new(MemoryStore::new()));
    let dir = tempfile::tempdir().unwrap();
    check(Arc::new(ParquetStore::new(dir.path())));
}

#[test]
fn upsert_is_idempotent_and_overwrites() {
    with_backends(|store| {
        let batch = vec![price("A", 1, 10.0), price("A", 2, 11.0)];
        assert_eq!(store.upsert_prices(&batch, T).unwrap(), 2);
        let first = store.query_prices(&SeriesQuery::all(), T).unwrap();
        store.upsert_prices(&batch, T).unwrap();
        assert_eq!(store.query_prices(&SeriesQuery::all(), T).unwrap(), first, "{}", store.name());

        store.upsert_prices(&[price("A", 2, 12.5)], T).unwrap();
        let rows = store.query_prices(&SeriesQuery::all(), T).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].close, 12.5);
    });
}

#[test]
fn query_order_and_filters() {
    with_backends(|store| {
        store
            .upsert_forecasts(
                &[
                    Forecast::new(d(3), "B", "safe_ma_w5", 1.0),
                    Forecast::new(d(2), "A", "safe_ses_a0.3", 2.0),
                    Forecast::new(d(2), "A", "safe_ma_w5", 3.0),
                    Forecast::new(d(1), "A", "safe_ma_w5", 4.0),
                ],
                T,
            )
            .unwrap();

        let all = store.query_forecasts(&SeriesQuery::all(), T).unwrap();
        let keys: Vec<_> = all
            .iter()
            .map(|f| (f.entity_id.as_str(), f.as_of, f.model_name.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("A", d(1), "safe_ma_w5"),
                ("A", d(2), "safe_ma_w5"),
                ("A", d(2), "safe_ses_a0.3"),
                ("B", d(3), "safe_ma_w5"),
            ],
            "{}",
            store.name()
        );

        let filtered = store
            .query_forecasts(
                &SeriesQuery::entity("A")
                    .between(d(2), d(9))
                    .with_models(["safe_ma_w5"]),
                T,
            )
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].predicted_value, 3.0);

        let latest = store.last_forecast_dates("A", T).unwrap();
        assert_eq!(latest[&("safe_ma_w5".to_string(), 1)], d(2));
    });
}

#[test]
fn constraint_violation_rejects_whole_batch() {
    with_backends(|store| {
        let mut bad = price("B", 2, 10.0);
        bad.volume = Some(-1);
        let err = store
            .upsert_prices(&[price("A", 1, 10.0), bad], T)
            .unwrap_err();
        assert!(matches!(err, StorageError::Constraint { .. }));
        assert!(!err.is_retryable());
        assert!(store.query_prices(&SeriesQuery::all(), T).unwrap().is_empty());
    });
}

#[test]
fn unusable_entity_id_rejects_whole_batch() {
    with_backends(|store| {
        for bad_id in ["Z/../x", "..", "a\\b", ""] {
            let err = store
                .upsert_prices(&[price("A", 3, 10.0), price(bad_id, 3, 11.0)], T)
                .unwrap_err();
            assert!(matches!(err, StorageError::Constraint { .. }), "{}: {bad_id}", store.name());
            assert!(store.query_prices(&SeriesQuery::all(), T).unwrap().is_empty());
            assert!(store.entities(T).unwrap().is_empty());
        }

        let forecasts = [
            Forecast::new(d(3), "A", "safe_ma_w5", 10.0),
            Forecast::new(d(3), "Z/x", "safe_ma_w5", 10.0),
        ];
        assert!(store.upsert_forecasts(&forecasts, T).is_err());
        assert!(store.query_forecasts(&SeriesQuery::all(), T).unwrap().is_empty());
    });
}

#[test]
fn evaluations_round_trip() {
    with_backends(|store| {
        let rec = EvaluationRecord {
            as_of: d(2),
            entity_id: "A".into(),
            model_name: "ensemble_mean".into(),
            horizon: 1,
            predicted_value: 101.0,
            realized_value: 99.0,
            absolute_error: 2.0,
            direction_correct: false,
        };
        store.upsert_evaluations(std::slice::from_ref(&rec), T).unwrap();
        assert_eq!(
            store.query_evaluations(&SeriesQuery::all(), T).unwrap(),
            vec![rec]
        );
    });
}

#[test]
fn concurrent_disjoint_upserts() {
    with_backends(|store| {
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let entity = format!("E{i}");
                    let rows: Vec<_> = (1..=10).map(|day| price(&entity, day, day as f64)).collect();
                    store.upsert_prices(&rows, T).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let cursor = store.last_price_dates(T).unwrap();
        assert_eq!(cursor.len(), 6);
        assert!(cursor.values().all(|last| *last == d(10)));
        assert_eq!(store.query_prices(&SeriesQuery::all(), T).unwrap().len(), 60);
    });
}
