//! Walk-Forward Forecaster.
//!
//! For a model with history floor `m` and a series of `N` closes, as-of
//! indices run from `m - 1` to `N - 2` (every point whose next close is known),
//! plus the live point `N - 1` when `include_live` is set. The prediction at
//! index `i` is computed from `closes[..=i]` only.
//!
//! Incremental runs pass the latest stored as-of date per model; only as-of
//! dates strictly after it are produced.

use super::{insufficient, ForecastModel, ModelRegistry};
use crate::domain::{Forecast, PricePoint, HORIZON};
use crate::error::ModelError;
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// `(as_of_index, predicted_next_close)` pairs in increasing index order.
///
/// Fails with `InsufficientHistory` when the series is shorter than the
/// model's floor, and with `Numeric` if the model produces a non-finite value.
pub fn walk_forward(
    model: &dyn ForecastModel,
    closes: &[f64],
    start_index: usize,
    include_live: bool,
) -> Result<Vec<(usize, f64)>, ModelError> {
    let n = closes.len();
    let floor = model.min_history().max(1);
    if n < floor {
        return Err(insufficient(model.name(), floor, n));
    }

    let first = start_index.max(floor - 1);
    let end = if include_live { n } else { n - 1 };
    if first >= end {
        return Ok(Vec::new());
    }

    // The live point is only visible to the model when it is requested.
    let values = model.predict_range(&closes[..end], first)?;
    if values.len() != end - first {
        return Err(ModelError::Numeric {
            model: model.name().to_string(),
            reason: format!("expected {} predictions, got {}", end - first, values.len()),
        });
    }
    if let Some((k, v)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(ModelError::Numeric {
            model: model.name().to_string(),
            reason: format!("non-finite prediction {v} at index {}", first + k),
        });
    }

    Ok((first..end).zip(values).collect())
}

/// A model that produced nothing for an entity this run.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSkip {
    pub model_name: String,
    pub error: ModelError,
}

/// Forecast rows for one entity across every registered model.
#[derive(Debug, Clone, Default)]
pub struct EntityForecast {
    pub entity_id: String,
    pub forecasts: Vec<Forecast>,
    pub skipped: Vec<ModelSkip>,
}

/// Run every registry model over one entity's stored prices.
///
/// `prices` must be the entity's rows in ascending date order (as returned by
/// the store). `latest` maps `(model_name, horizon)` to the latest stored
/// as-of date; models missing from it start from their history floor.
///
/// A model failure is recorded in `skipped` and never affects other models.
pub fn forecast_entity(
    entity_id: &str,
    prices: &[PricePoint],
    registry: &ModelRegistry,
    latest: &BTreeMap<(String, u32), NaiveDate>,
    include_live: bool,
) -> EntityForecast {
    let closes = crate::domain::closes(prices);
    let dates: Vec<NaiveDate> = prices.iter().map(|p| p.trade_date).collect();
    let mut out = EntityForecast {
        entity_id: entity_id.to_string(),
        ..Default::default()
    };

    for model in registry.models() {
        let start_index = latest
            .get(&(model.name().to_string(), HORIZON))
            .map_or(0, |last| dates.partition_point(|d| d <= last));

        match walk_forward(model.as_ref(), &closes, start_index, include_live) {
            Ok(points) => {
                out.forecasts.extend(
                    points
                        .into_iter()
                        .map(|(i, value)| Forecast::new(dates[i], entity_id, model.name(), value)),
                );
            }
            Err(error) => {
                match &error {
                    ModelError::InsufficientHistory { .. } => {
                        log::debug!("{entity_id}: {error}")
                    }
                    _ => log::warn!("{entity_id}: model '{}' skipped: {error}", model.name()),
                }
                out.skipped.push(ModelSkip {
                    model_name: model.name().to_string(),
                    error,
                });
            }
        }
    }

    out
}
