//! Day 0 / Day 3 / Day 7 outreach cadence.
//!
//! The queue labels a contact by the read-time thresholds below, while
//! marking a follow-up as sent picks the field to stamp with
//! [`DAY7_STAMP_AFTER_DAYS`]. The two disagree on day 6: a contact labelled
//! "Day 3 follow-up due" on day 6 gets its Day 7 field stamped. This matches
//! the behaviour users already rely on and is kept until it is reconciled.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::clock::{format_date, parse_date};
use crate::models::{
    ActivityType, Contact, ContactFilter, ContactType, ContactUpdate, NewActivity, OpportunityFilter,
    ResponseStatus,
};
use crate::workflow::{Workflow, WorkflowError};

/// Days after Day 0 before the first follow-up is due.
pub const DAY3_DUE_AFTER_DAYS: i64 = 3;
/// Days after Day 0 before the second follow-up is due.
pub const DAY7_DUE_AFTER_DAYS: i64 = 7;
/// When marking a follow-up sent, at or past this many days the Day 7 field is
/// stamped instead of Day 3.
pub const DAY7_STAMP_AFTER_DAYS: i64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CadenceStep {
    Day3,
    Day7,
}

impl CadenceStep {
    pub fn label(&self) -> &'static str {
        match self {
            CadenceStep::Day3 => "Day 3",
            CadenceStep::Day7 => "Day 7",
        }
    }

    pub fn reason(&self) -> String {
        format!("{} follow-up due", self.label())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FollowUpItem {
    pub contact_id: i64,
    pub opportunity_id: Option<i64>,
    pub full_name: String,
    pub contact_type: Option<ContactType>,
    pub company: Option<String>,
    pub role_title: Option<String>,
    pub outreach_day0: String,
    pub days_since: i64,
    pub step: CadenceStep,
    pub followup_reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUpAction {
    Sent,
    Skip,
    Responded,
    NoResponse,
}

impl std::str::FromStr for FollowUpAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sent" | "s" => Ok(FollowUpAction::Sent),
            "skip" | "k" => Ok(FollowUpAction::Skip),
            "responded" | "r" => Ok(FollowUpAction::Responded),
            "no-response" | "no response" | "n" => Ok(FollowUpAction::NoResponse),
            other => Err(anyhow::anyhow!(
                "Unknown action '{}'. Choose sent, skip, responded or no-response",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUpOutcome {
    Stamped(CadenceStep),
    MarkedResponded,
    MarkedNoResponse,
    Skipped,
}

/// Which follow-up, if any, a contact owes as of `today`.
pub fn due_step(contact: &Contact, today: NaiveDate) -> Option<CadenceStep> {
    if contact.response_status != ResponseStatus::Pending {
        return None;
    }
    let day0 = parse_date(contact.outreach_day0.as_deref()?)?;
    let days_since = (today - day0).num_days();

    if days_since >= DAY7_DUE_AFTER_DAYS && contact.outreach_day7.is_none() {
        Some(CadenceStep::Day7)
    } else if days_since >= DAY3_DUE_AFTER_DAYS && contact.outreach_day3.is_none() {
        Some(CadenceStep::Day3)
    } else {
        None
    }
}

/// Field to stamp when a follow-up is marked sent `days_since` days after Day 0.
pub fn step_to_stamp(days_since: i64) -> CadenceStep {
    if days_since >= DAY7_STAMP_AFTER_DAYS {
        CadenceStep::Day7
    } else {
        CadenceStep::Day3
    }
}

impl Workflow<'_> {
    /// Pending contacts whose Day 3 or Day 7 follow-up is due, oldest Day 0 first.
    pub fn get_followup_queue(&self) -> Result<Vec<FollowUpItem>, WorkflowError> {
        let today = self.clock().today();
        let contacts = self.store().list_contacts(&ContactFilter {
            response_status: Some(ResponseStatus::Pending),
            ..Default::default()
        })?;

        let opportunities: HashMap<i64, (String, String)> = self
            .store()
            .list_opportunities(&OpportunityFilter::default())?
            .into_iter()
            .map(|o| (o.id, (o.company, o.role_title)))
            .collect();

        let mut queue: Vec<(NaiveDate, FollowUpItem)> = Vec::new();
        for contact in contacts {
            let Some(raw_day0) = contact.outreach_day0.clone() else { continue };
            let Some(day0) = parse_date(&raw_day0) else {
                warn!(contact_id = contact.id, day0 = %raw_day0, "skipping contact with unreadable Day 0");
                continue;
            };
            let Some(step) = due_step(&contact, today) else { continue };

            let (company, role_title) = match contact.opportunity_id.and_then(|id| opportunities.get(&id)) {
                Some((company, role)) => (Some(company.clone()), Some(role.clone())),
                None => (contact.company.clone(), None),
            };

            queue.push((
                day0,
                FollowUpItem {
                    contact_id: contact.id,
                    opportunity_id: contact.opportunity_id,
                    full_name: contact.full_name,
                    contact_type: contact.contact_type,
                    company,
                    role_title,
                    outreach_day0: raw_day0,
                    days_since: (today - day0).num_days(),
                    step,
                    followup_reason: step.reason(),
                },
            ));
        }

        queue.sort_by(|(a_day0, a), (b_day0, b)| a_day0.cmp(b_day0).then(a.contact_id.cmp(&b.contact_id)));
        Ok(queue.into_iter().map(|(_, item)| item).collect())
    }

    /// Apply the user's decision for one follow-up queue entry.
    pub fn resolve_followup(&self, contact_id: i64, action: FollowUpAction) -> Result<FollowUpOutcome, WorkflowError> {
        let contact = self
            .store()
            .get_contact(contact_id)?
            .ok_or(WorkflowError::NotFound { kind: "Contact", id: contact_id })?;
        let today = self.clock().today();

        let outcome = match action {
            FollowUpAction::Sent => {
                let days_since = contact
                    .outreach_day0
                    .as_deref()
                    .and_then(parse_date)
                    .map_or(0, |day0| (today - day0).num_days());
                let step = step_to_stamp(days_since);
                let stamp = Some(format_date(today));
                let update = match step {
                    CadenceStep::Day7 => ContactUpdate { outreach_day7: stamp, ..Default::default() },
                    CadenceStep::Day3 => ContactUpdate { outreach_day3: stamp, ..Default::default() },
                };
                let activity = NewActivity::new(
                    ActivityType::FollowUpSent,
                    format!("{} follow-up sent to {}", step.label(), contact.full_name),
                )
                .opportunity(contact.opportunity_id)
                .contact(contact_id);
                self.update_contact_logged(contact_id, &update, Some(&activity))?;
                FollowUpOutcome::Stamped(step)
            }
            FollowUpAction::Responded => {
                let activity =
                    NewActivity::new(ActivityType::ResponseReceived, format!("{} responded", contact.full_name))
                        .opportunity(contact.opportunity_id)
                        .contact(contact_id);
                self.update_contact_logged(
                    contact_id,
                    &ContactUpdate { response_status: Some(ResponseStatus::Responded), ..Default::default() },
                    Some(&activity),
                )?;
                FollowUpOutcome::MarkedResponded
            }
            FollowUpAction::NoResponse => {
                self.update_contact_logged(
                    contact_id,
                    &ContactUpdate { response_status: Some(ResponseStatus::NoResponse), ..Default::default() },
                    None,
                )?;
                FollowUpOutcome::MarkedNoResponse
            }
            FollowUpAction::Skip => FollowUpOutcome::Skipped,
        };

        info!(contact_id, ?action, ?outcome, "resolved follow-up");
        Ok(outcome)
    }

    /// Stamp Day 0 for a contact and restart its cadence.
    pub fn record_outreach(&self, contact_id: i64) -> Result<String, WorkflowError> {
        let contact = self
            .store()
            .get_contact(contact_id)?
            .ok_or(WorkflowError::NotFound { kind: "Contact", id: contact_id })?;
        let today = format_date(self.clock().today());

        let activity =
            NewActivity::new(ActivityType::OutreachSent, format!("Day 0 outreach sent to {}", contact.full_name))
                .opportunity(contact.opportunity_id)
                .contact(contact_id);
        self.update_contact_logged(
            contact_id,
            &ContactUpdate {
                outreach_day0: Some(today.clone()),
                response_status: Some(ResponseStatus::Pending),
                ..Default::default()
            },
            Some(&activity),
        )?;

        info!(contact_id, day0 = %today, "recorded outreach");
        Ok(today)
    }

    /// Set a contact's response status directly and log it.
    pub fn set_response_status(&self, contact_id: i64, status: ResponseStatus) -> Result<(), WorkflowError> {
        let contact = self
            .store()
            .get_contact(contact_id)?
            .ok_or(WorkflowError::NotFound { kind: "Contact", id: contact_id })?;

        let activity =
            NewActivity::new(ActivityType::ResponseReceived, format!("Response status updated to: {}", status))
                .opportunity(contact.opportunity_id)
                .contact(contact_id);
        self.update_contact_logged(
            contact_id,
            &ContactUpdate { response_status: Some(status), ..Default::default() },
            Some(&activity),
        )?;
        Ok(())
    }
}
