//! Aggregate error metrics over stored evaluation records, plus CSV/JSON export.
//!
//! Only per-row `EvaluationRecord`s are stored. Aggregates are computed here
//! on demand:
//! - **MAE**: mean absolute error
//! - **MAPE**: mean absolute percentage error, in percent; rows whose realized
//!   value is zero are left out
//! - **RMSE**: root mean squared error
//! - **Direction accuracy**: share of rows with `direction_correct`
//!
//! The signals view ranks stored forecasts instead: the top-predicted base
//! model per entity on the latest as-of date.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use nextclose_core::domain::{EvaluationRecord, Forecast};
use nextclose_core::ensemble::ENSEMBLE_NAMES;
use serde::{Deserialize, Serialize};

/// Aggregate metrics for one group of evaluation rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub count: usize,
    pub mae: f64,
    /// `None` when every realized value in the group is zero.
    pub mape: Option<f64>,
    pub rmse: f64,
    pub direction_accuracy: f64,
}

impl ErrorSummary {
    /// `None` for an empty group.
    pub fn from_records<'a, I>(records: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a EvaluationRecord>,
    {
        let mut count = 0usize;
        let mut abs_sum = 0.0;
        let mut sq_sum = 0.0;
        let mut pct_sum = 0.0;
        let mut pct_count = 0usize;
        let mut hits = 0usize;

        for r in records {
            count += 1;
            abs_sum += r.absolute_error;
            sq_sum += r.absolute_error * r.absolute_error;
            if r.realized_value != 0.0 {
                pct_sum += (r.absolute_error / r.realized_value).abs() * 100.0;
                pct_count += 1;
            }
            if r.direction_correct {
                hits += 1;
            }
        }

        if count == 0 {
            return None;
        }
        let n = count as f64;
        Some(Self {
            count,
            mae: abs_sum / n,
            mape: (pct_count > 0).then(|| pct_sum / pct_count as f64),
            rmse: (sq_sum / n).sqrt(),
            direction_accuracy: hits as f64 / n,
        })
    }
}

/// Grouping key for [`summarize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    /// One row per model across all entities and dates.
    #[default]
    Model,
    /// One row per (entity, model).
    EntityModel,
    /// One row per (as-of date, model): the daily leaderboard view.
    DateModel,
}

impl std::str::FromStr for GroupBy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "model" => Ok(Self::Model),
            "entity-model" | "entity_model" => Ok(Self::EntityModel),
            "date-model" | "date_model" => Ok(Self::DateModel),
            other => Err(format!(
                "unknown grouping '{other}' (expected model, entity-model or date-model)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub as_of: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub model_name: String,
    pub horizon: u32,
    #[serde(flatten)]
    pub summary: ErrorSummary,
}

type GroupKey = (Option<NaiveDate>, Option<String>, String, u32);

/// Aggregate `records` by `group`, ordered by the group key.
pub fn summarize(records: &[EvaluationRecord], group: GroupBy) -> Vec<SummaryRow> {
    let mut groups: BTreeMap<GroupKey, Vec<&EvaluationRecord>> = BTreeMap::new();
    for r in records {
        let key = match group {
            GroupBy::Model => (None, None, r.model_name.clone(), r.horizon),
            GroupBy::EntityModel => (None, Some(r.entity_id.clone()), r.model_name.clone(), r.horizon),
            GroupBy::DateModel => (Some(r.as_of), None, r.model_name.clone(), r.horizon),
        };
        groups.entry(key).or_default().push(r);
    }

    groups
        .into_iter()
        .filter_map(|((as_of, entity_id, model_name, horizon), rows)| {
            ErrorSummary::from_records(rows).map(|summary| SummaryRow {
                as_of,
                entity_id,
                model_name,
                horizon,
                summary,
            })
        })
        .collect()
}

// ─── Export ─────────────────────────────────────────────────────────

pub fn summary_json(rows: &[SummaryRow]) -> Result<String> {
    serde_json::to_string_pretty(rows).context("failed to serialize summary to JSON")
}

/// Columns: as_of, entity_id, model_name, horizon, count, mae, mape, rmse,
/// direction_accuracy. Grouping columns that do not apply are left empty.
pub fn summary_csv(rows: &[SummaryRow]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record([
        "as_of",
        "entity_id",
        "model_name",
        "horizon",
        "count",
        "mae",
        "mape",
        "rmse",
        "direction_accuracy",
    ])?;

    for row in rows {
        let s = &row.summary;
        wtr.write_record([
            &row.as_of.map(|d| d.to_string()).unwrap_or_default(),
            row.entity_id.as_deref().unwrap_or(""),
            &row.model_name,
            &row.horizon.to_string(),
            &s.count.to_string(),
            &format!("{:.6}", s.mae),
            &s.mape.map(|m| format!("{m:.4}")).unwrap_or_default(),
            &format!("{:.6}", s.rmse),
            &format!("{:.4}", s.direction_accuracy),
        ])?;
    }

    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

/// Raw evaluation rows, one line per record. The header is written even when
/// there are no records.
pub fn evaluations_csv(records: &[EvaluationRecord]) -> Result<String> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(vec![]);
    wtr.write_record(EVALUATION_COLUMNS)?;
    for r in records {
        wtr.serialize(r)?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

const EVALUATION_COLUMNS: [&str; 8] = [
    "as_of",
    "entity_id",
    "model_name",
    "horizon",
    "predicted_value",
    "realized_value",
    "absolute_error",
    "direction_correct",
];

// ─── Signals ────────────────────────────────────────────────────────

/// The base model with the highest predicted next close for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRow {
    pub as_of: NaiveDate,
    pub entity_id: String,
    pub model_name: String,
    pub predicted_value: f64,
}

/// Top-predicted base model per entity on `as_of`, or on the latest stored
/// as-of date when `as_of` is `None`.
///
/// Ensemble rows are not ranked. Tied models are all reported, ordered by
/// entity then model name.
pub fn top_signals(forecasts: &[Forecast], as_of: Option<NaiveDate>) -> Vec<SignalRow> {
    let base = || {
        forecasts
            .iter()
            .filter(|f| !ENSEMBLE_NAMES.contains(&f.model_name.as_str()))
    };
    let Some(as_of) = as_of.or_else(|| base().map(|f| f.as_of).max()) else {
        return Vec::new();
    };

    let mut by_entity: BTreeMap<&str, Vec<&Forecast>> = BTreeMap::new();
    for f in base().filter(|f| f.as_of == as_of) {
        by_entity.entry(f.entity_id.as_str()).or_default().push(f);
    }

    let mut out = Vec::new();
    for (entity_id, rows) in by_entity {
        let Some(best) = rows
            .iter()
            .map(|f| f.predicted_value)
            .max_by(f64::total_cmp)
        else {
            continue;
        };
        let mut top: Vec<&Forecast> = rows
            .into_iter()
            .filter(|f| f.predicted_value == best)
            .collect();
        top.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        out.extend(top.into_iter().map(|f| SignalRow {
            as_of,
            entity_id: entity_id.to_string(),
            model_name: f.model_name.clone(),
            predicted_value: f.predicted_value,
        }));
    }
    out
}

/// Columns: as_of, entity_id, model_name, predicted_value.
pub fn signals_csv(rows: &[SignalRow]) -> Result<String> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(vec![]);
    wtr.write_record(["as_of", "entity_id", "model_name", "predicted_value"])?;
    for row in rows {
        wtr.serialize(row)?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}
