//! Ensemble Aggregator.
//!
//! Groups member-family forecasts by `(entity_id, as_of, horizon)` and emits
//! `ensemble_mean` and `ensemble_median` for every group with at least one
//! member. Values are sorted before aggregation, so the output does not depend
//! on input order.

use crate::domain::{EnsembleForecast, Forecast};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ENSEMBLE_MEAN: &str = "ensemble_mean";
pub const ENSEMBLE_MEDIAN: &str = "ensemble_median";

/// Aggregator names; never treated as members.
pub const ENSEMBLE_NAMES: [&str; 2] = [ENSEMBLE_MEAN, ENSEMBLE_MEDIAN];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// A base model is a member when its name starts with one of these.
    pub member_prefixes: Vec<String>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            member_prefixes: vec!["safe_ma_".into(), "safe_ses_".into(), "safe_dl_".into()],
        }
    }
}

impl EnsembleConfig {
    pub fn is_member(&self, model_name: &str) -> bool {
        !ENSEMBLE_NAMES.contains(&model_name)
            && self
                .member_prefixes
                .iter()
                .any(|p| model_name.starts_with(p.as_str()))
    }
}

/// Mean and median of an ascending, non-empty slice.
fn mean_median(sorted: &[f64]) -> (f64, f64) {
    let n = sorted.len();
    let mean = sorted.iter().sum::<f64>() / n as f64;
    let median = if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    };
    (mean, median)
}

/// Ensemble rows for every group in `base`, ordered by group key.
pub fn build_ensembles(base: &[Forecast], config: &EnsembleConfig) -> Vec<EnsembleForecast> {
    let mut groups: BTreeMap<(&str, chrono::NaiveDate, u32), Vec<f64>> = BTreeMap::new();
    for f in base.iter().filter(|f| config.is_member(&f.model_name)) {
        groups
            .entry((f.entity_id.as_str(), f.as_of, f.horizon))
            .or_default()
            .push(f.predicted_value);
    }

    let mut out = Vec::with_capacity(groups.len() * 2);
    for ((entity_id, as_of, horizon), mut values) in groups {
        values.sort_by(f64::total_cmp);
        let (mean, median) = mean_median(&values);
        for (name, value) in [(ENSEMBLE_MEAN, mean), (ENSEMBLE_MEDIAN, median)] {
            out.push(Forecast {
                as_of,
                entity_id: entity_id.to_string(),
                model_name: name.to_string(),
                horizon,
                predicted_value: value,
            });
        }
    }
    out
}
