//! Incremental Fetch Planner.
//!
//! Turns the ingestion cursor (last stored trade date per entity) into the
//! minimal set of fetch windows. A planned window never starts on or before a
//! stored date, so planning alone can never re-fetch stored sessions.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What to fetch for an entity the store has never seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum BackfillPolicy {
    /// `[today - days, today]`.
    Lookback { days: u32 },
    /// `[today, today]`: new entities start accumulating from the current session.
    TodayOnly,
}

impl Default for BackfillPolicy {
    /// Three calendar years, enough history for every default model family.
    fn default() -> Self {
        Self::Lookback { days: 365 * 3 }
    }
}

impl BackfillPolicy {
    fn start(&self, today: NaiveDate) -> NaiveDate {
        match self {
            Self::Lookback { days } => today - chrono::Duration::days(i64::from(*days)),
            Self::TodayOnly => today,
        }
    }
}

/// One inclusive fetch window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchTask {
    pub entity_id: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// True when the entity had no stored prices at planning time.
    pub backfill: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchPlan {
    /// Ordered by entity id.
    pub tasks: Vec<FetchTask>,
    /// Entities already current through `today`.
    pub up_to_date: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchPlanner {
    pub policy: BackfillPolicy,
}

impl FetchPlanner {
    pub fn new(policy: BackfillPolicy) -> Self {
        Self { policy }
    }

    /// Window for one entity, or `None` when nothing needs fetching.
    ///
    /// `start_override` replaces the backfill start for new entities. For
    /// entities with stored data it can only move the start later than
    /// `last + 1`, never earlier.
    pub fn plan_entity(
        &self,
        entity_id: &str,
        last_stored: Option<NaiveDate>,
        today: NaiveDate,
        start_override: Option<NaiveDate>,
    ) -> Option<FetchTask> {
        let start = match last_stored {
            None => start_override.unwrap_or_else(|| self.policy.start(today)),
            Some(last) => {
                let next = last.succ_opt()?;
                start_override.map_or(next, |s| s.max(next))
            }
        };
        if start > today {
            return None;
        }
        Some(FetchTask {
            entity_id: entity_id.to_string(),
            start,
            end: today,
            backfill: last_stored.is_none(),
        })
    }

    /// Plan every entity in `entities` against one snapshot of the cursor.
    pub fn plan<I, S>(
        &self,
        entities: I,
        cursor: &BTreeMap<String, NaiveDate>,
        today: NaiveDate,
        start_override: Option<NaiveDate>,
    ) -> FetchPlan
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ordered: BTreeSet<String> = entities
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect();

        let mut plan = FetchPlan::default();
        for entity_id in ordered {
            let last = cursor.get(&entity_id).copied();
            match self.plan_entity(&entity_id, last, today, start_override) {
                Some(task) => {
                    log::debug!(
                        "plan {entity_id}: {}..={} ({})",
                        task.start,
                        task.end,
                        if task.backfill { "backfill" } else { "incremental" }
                    );
                    plan.tasks.push(task);
                }
                None => {
                    log::debug!("plan {entity_id}: up to date");
                    plan.up_to_date.push(entity_id);
                }
            }
        }
        plan
    }
}
