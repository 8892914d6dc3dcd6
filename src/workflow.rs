//! Pipeline workflow engine: stage transitions, staleness and the
//! "what do I do today" aggregations. Follow-up cadence lives in `followup`.

use anyhow::Result;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Ordering;
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::{format_date, parse_date, Clock};
use crate::models::{
    ActivityType, Contact, ContactFilter, ContactUpdate, NewActivity, Opportunity,
    OpportunityFilter, OpportunityUpdate,
};
use crate::stages::{NextAction, StageVocabulary};

pub const DEFAULT_STALE_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{kind} #{id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("Invalid stage '{stage}'{}", suggestion_hint(.suggestion))]
    InvalidStage { stage: String, suggestion: Option<String> },

    #[error("Staleness threshold must be at least one day, got {0}")]
    InvalidThreshold(i64),

    #[error("Note text is empty")]
    EmptyNote,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Storage operations the engine relies on. `db::Database` is the real one.
pub trait PipelineStore {
    fn get_opportunity(&self, id: i64) -> Result<Option<Opportunity>>;
    /// Fails if the opportunity does not exist.
    fn update_opportunity(&self, id: i64, update: &OpportunityUpdate) -> Result<()>;
    fn list_opportunities(&self, filter: &OpportunityFilter) -> Result<Vec<Opportunity>>;
    fn get_contact(&self, id: i64) -> Result<Option<Contact>>;
    fn list_contacts(&self, filter: &ContactFilter) -> Result<Vec<Contact>>;
    fn update_contact(&self, id: i64, update: &ContactUpdate) -> Result<()>;
    fn log_activity(&self, entry: &NewActivity) -> Result<i64>;
    /// Run `work` as one unit: every write inside it lands, or none does.
    fn atomically(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

/// What happens to `date_closed` when an already closed opportunity is closed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosePolicy {
    /// Re-stamp with today on every transition into the terminal stage.
    #[default]
    AlwaysRefresh,
    /// Keep the first close date.
    KeepFirst,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageCount {
    pub stage: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineSummary {
    pub rows: Vec<StageCount>,
}

impl PipelineSummary {
    pub fn total(&self) -> usize {
        self.rows.iter().map(|r| r.count).sum()
    }

    pub fn count(&self, stage: &str) -> usize {
        self.rows
            .iter()
            .find(|r| r.stage == stage)
            .map_or(0, |r| r.count)
    }

    /// Every vocabulary stage in order, zero-filled, for dashboards.
    pub fn with_all_stages(&self, stages: &StageVocabulary) -> Vec<StageCount> {
        stages
            .names()
            .map(|stage| StageCount { stage: stage.to_string(), count: self.count(stage) })
            .collect()
    }
}

pub struct Workflow<'a> {
    store: &'a dyn PipelineStore,
    stages: &'a StageVocabulary,
    clock: &'a dyn Clock,
    close_policy: ClosePolicy,
}

impl<'a> Workflow<'a> {
    pub fn new(store: &'a dyn PipelineStore, stages: &'a StageVocabulary, clock: &'a dyn Clock) -> Self {
        Self { store, stages, clock, close_policy: ClosePolicy::default() }
    }

    pub fn with_close_policy(mut self, policy: ClosePolicy) -> Self {
        self.close_policy = policy;
        self
    }

    pub fn stages(&self) -> &StageVocabulary {
        self.stages
    }

    pub(crate) fn store(&self) -> &dyn PipelineStore {
        self.store
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock
    }

    pub fn calculate_next_action(&self, stage: &str) -> Result<NextAction, WorkflowError> {
        self.stages.calculate_next_action(stage)
    }

    /// Next action text and its due date counted from today.
    pub fn next_action_due(&self, stage: &str) -> Result<(String, String), WorkflowError> {
        let action = self.calculate_next_action(stage)?;
        let due = self.clock.today() + Duration::days(i64::from(action.days_out));
        Ok((action.text, format_date(due)))
    }

    /// Move an opportunity to `new_stage`, maintain its derived dates and next
    /// action, and record one Stage Change activity.
    pub fn advance_stage(&self, opportunity_id: i64, new_stage: &str, note: Option<&str>) -> Result<(), WorkflowError> {
        if !self.stages.contains(new_stage) {
            return Err(self.stages.invalid_stage(new_stage));
        }

        let opp = self
            .store
            .get_opportunity(opportunity_id)?
            .ok_or(WorkflowError::NotFound { kind: "Opportunity", id: opportunity_id })?;

        let today = format_date(self.clock.today());
        let mut update = OpportunityUpdate {
            stage: Some(new_stage.to_string()),
            ..Default::default()
        };

        if self.stages.is_applied_or_later(new_stage) && opp.date_applied.is_none() {
            update.date_applied = Some(today.clone());
        }

        if self.stages.is_terminal(new_stage) {
            let keep = self.close_policy == ClosePolicy::KeepFirst && opp.date_closed.is_some();
            if !keep {
                update.date_closed = Some(Some(today));
            }
        } else {
            // reopening: date_closed is only ever set on the terminal stage
            if opp.date_closed.is_some() {
                update.date_closed = Some(None);
            }
            let (text, due) = self.next_action_due(new_stage)?;
            update.next_action = Some(text);
            update.next_action_date = Some(due);
        }

        let mut description = format!("Stage changed to {}", new_stage);
        if let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) {
            description.push_str(&format!(". Note: {}", note));
        }
        let activity = NewActivity::new(ActivityType::StageChange, description)
            .opportunity(Some(opportunity_id))
            .metadata(json!({ "from": opp.stage, "to": new_stage }));
        self.update_opportunity_logged(opportunity_id, &update, &activity)?;

        info!(opportunity_id, from = %opp.stage, to = new_stage, "advanced stage");
        Ok(())
    }

    /// Append a dated line to the opportunity's notes and log it as Note Added.
    /// Returns the full notes text.
    pub fn add_note(&self, opportunity_id: i64, text: &str) -> Result<String, WorkflowError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(WorkflowError::EmptyNote);
        }
        let opp = self
            .store
            .get_opportunity(opportunity_id)?
            .ok_or(WorkflowError::NotFound { kind: "Opportunity", id: opportunity_id })?;

        let line = format!("[{}] {}", format_date(self.clock.today()), text);
        let notes = match opp.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            Some(existing) => format!("{existing}\n{line}"),
            None => line,
        };

        let update = OpportunityUpdate { notes: Some(notes.clone()), ..Default::default() };
        let activity = NewActivity::new(ActivityType::NoteAdded, text).opportunity(Some(opportunity_id));
        self.update_opportunity_logged(opportunity_id, &update, &activity)?;

        debug!(opportunity_id, "added note");
        Ok(notes)
    }

    pub(crate) fn update_opportunity_logged(
        &self,
        opportunity_id: i64,
        update: &OpportunityUpdate,
        activity: &NewActivity,
    ) -> Result<()> {
        self.store.atomically(&mut || -> Result<()> {
            self.store.update_opportunity(opportunity_id, update)?;
            self.store.log_activity(activity)?;
            Ok(())
        })
    }

    /// Contact update plus an optional activity entry, applied together.
    pub(crate) fn update_contact_logged(
        &self,
        contact_id: i64,
        update: &ContactUpdate,
        activity: Option<&NewActivity>,
    ) -> Result<()> {
        self.store.atomically(&mut || -> Result<()> {
            self.store.update_contact(contact_id, update)?;
            if let Some(activity) = activity {
                self.store.log_activity(activity)?;
            }
            Ok(())
        })
    }

    /// Non-terminal opportunities untouched for at least `days_stale` days.
    pub fn flag_stale_records(&self, days_stale: i64) -> Result<Vec<Opportunity>, WorkflowError> {
        if days_stale <= 0 {
            return Err(WorkflowError::InvalidThreshold(days_stale));
        }

        let today = self.clock.today();
        let stale: Vec<Opportunity> = self
            .active_opportunities()?
            .into_iter()
            .filter(|opp| {
                parse_date(&opp.updated_at)
                    .is_some_and(|updated| (today - updated).num_days() >= days_stale)
            })
            .collect();

        debug!(days_stale, count = stale.len(), "stale check");
        Ok(stale)
    }

    /// Non-terminal opportunities whose next action is due today or earlier,
    /// soonest first, then by tier (tier 1 first, untiered last).
    pub fn get_today_queue(&self) -> Result<Vec<Opportunity>, WorkflowError> {
        let today = self.clock.today();
        let mut due: Vec<(chrono::NaiveDate, Opportunity)> = self
            .active_opportunities()?
            .into_iter()
            .filter_map(|opp| {
                let date = opp.next_action_date.as_deref().and_then(parse_date)?;
                (date <= today).then_some((date, opp))
            })
            .collect();

        due.sort_by(|(a_date, a), (b_date, b)| {
            a_date
                .cmp(b_date)
                .then_with(|| compare_tier(a.tier, b.tier))
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(due.into_iter().map(|(_, opp)| opp).collect())
    }

    /// Opportunity counts per stage, only for stages that have any.
    pub fn get_pipeline_summary(&self) -> Result<PipelineSummary, WorkflowError> {
        let all = self.store.list_opportunities(&OpportunityFilter::default())?;

        let mut rows: Vec<StageCount> = self
            .stages
            .names()
            .map(|stage| StageCount {
                stage: stage.to_string(),
                count: all.iter().filter(|o| o.stage == stage).count(),
            })
            .filter(|row| row.count > 0)
            .collect();

        for opp in all.iter().filter(|o| !self.stages.contains(&o.stage)) {
            match rows.iter_mut().find(|r| r.stage == opp.stage) {
                Some(row) => row.count += 1,
                None => rows.push(StageCount { stage: opp.stage.clone(), count: 1 }),
            }
        }

        Ok(PipelineSummary { rows })
    }

    fn active_opportunities(&self) -> Result<Vec<Opportunity>> {
        self.store.list_opportunities(&OpportunityFilter {
            exclude_stage: Some(self.stages.terminal().to_string()),
            ..Default::default()
        })
    }
}

fn suggestion_hint(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean '{s}'?)"))
        .unwrap_or_default()
}

fn compare_tier(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
