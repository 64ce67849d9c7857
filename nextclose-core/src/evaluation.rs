//! Evaluation Joiner.
//!
//! The truth for as-of date `d` is the close of the next stored session after
//! `d`. The last stored date of an entity has no truth, so forecasts made on it
//! are left unscored until a later session arrives.

use crate::domain::{EvaluationRecord, Forecast, PricePoint};
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// What was known at the as-of date and what happened next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TruthPoint {
    pub close_as_of: f64,
    pub realized: f64,
    pub realized_date: NaiveDate,
}

/// `as_of -> TruthPoint` for every stored date except the last.
///
/// `prices` must be one entity's rows in ascending date order.
pub fn truth_sequence(prices: &[PricePoint]) -> BTreeMap<NaiveDate, TruthPoint> {
    prices
        .windows(2)
        .map(|w| {
            (
                w[0].trade_date,
                TruthPoint {
                    close_as_of: w[0].close,
                    realized: w[1].close,
                    realized_date: w[1].trade_date,
                },
            )
        })
        .collect()
}

fn sign(x: f64) -> i8 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}

/// Predicted and realized moves relative to the as-of close have the same
/// sign. No move predicted and no move realized counts as correct.
pub fn direction_correct(close_as_of: f64, predicted: f64, realized: f64) -> bool {
    sign(realized - close_as_of) == sign(predicted - close_as_of)
}

pub fn score(forecast: &Forecast, truth: &TruthPoint) -> EvaluationRecord {
    EvaluationRecord {
        as_of: forecast.as_of,
        entity_id: forecast.entity_id.clone(),
        model_name: forecast.model_name.clone(),
        horizon: forecast.horizon,
        predicted_value: forecast.predicted_value,
        realized_value: truth.realized,
        absolute_error: (forecast.predicted_value - truth.realized).abs(),
        direction_correct: direction_correct(
            truth.close_as_of,
            forecast.predicted_value,
            truth.realized,
        ),
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntityEvaluation {
    pub records: Vec<EvaluationRecord>,
    /// Forecasts without a truth value yet (latest date, or an as-of date
    /// with no stored session).
    pub pending: usize,
}

/// Score every forecast (base or ensemble) of one entity that has a truth.
pub fn evaluate_entity(prices: &[PricePoint], forecasts: &[Forecast]) -> EntityEvaluation {
    let truth = truth_sequence(prices);
    let mut out = EntityEvaluation::default();
    for f in forecasts {
        match truth.get(&f.as_of) {
            Some(t) => out.records.push(score(f, t)),
            None => out.pending += 1,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
    }

    fn prices(closes: &[f64]) -> Vec<PricePoint> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| PricePoint::from_close("A", d(i as u32 + 1), c))
            .collect()
    }

    #[test]
    fn down_move_predicted_up_is_wrong() {
        let p = prices(&[100.0, 102.0, 99.0]);
        let f = Forecast::new(d(2), "A", "m", 101.0);
        let out = evaluate_entity(&p, &[f]);
        let r = &out.records[0];
        assert_eq!(r.realized_value, 99.0);
        assert_eq!(r.absolute_error, 2.0);
        assert!(!r.direction_correct);
    }

    #[test]
    fn last_date_has_no_truth() {
        let p = prices(&[100.0, 102.0, 99.0]);
        let truth = truth_sequence(&p);
        assert_eq!(truth.len(), 2);
        assert!(!truth.contains_key(&d(3)));

        let out = evaluate_entity(&p, &[Forecast::new(d(3), "A", "m", 98.0)]);
        assert!(out.records.is_empty());
        assert_eq!(out.pending, 1);
    }

    #[test]
    fn truth_skips_calendar_gaps() {
        let p = vec![
            PricePoint::from_close("A", d(7), 10.0),
            PricePoint::from_close("A", d(10), 11.0),
        ];
        let truth = truth_sequence(&p);
        assert_eq!(truth[&d(7)].realized, 11.0);
        assert_eq!(truth[&d(7)].realized_date, d(10));
    }

    #[test]
    fn flat_tie_counts_as_correct() {
        assert!(direction_correct(10.0, 10.0, 10.0));
        assert!(!direction_correct(10.0, 10.0, 11.0));
        assert!(!direction_correct(10.0, 11.0, 10.0));
        assert!(direction_correct(10.0, 9.0, 8.0));
    }

    #[test]
    fn unknown_as_of_is_pending() {
        let p = prices(&[100.0, 101.0]);
        let out = evaluate_entity(&p, &[Forecast::new(d(20), "A", "m", 1.0)]);
        assert_eq!(out.pending, 1);
    }
}
