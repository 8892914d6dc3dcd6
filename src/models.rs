use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: i64,
    pub company: String,
    pub role_title: String,
    pub job_family: Option<String>, // key into config::JOB_FAMILIES ("A".."E")
    pub tier: Option<i64>,          // 1 = top priority, 3 = low
    pub stage: String,
    pub source: Option<String>,
    pub salary_range: Option<String>,
    pub jd_url: Option<String>,
    pub jd_raw: Option<String>,
    pub jd_keywords: Option<String>, // JSON-encoded list
    pub fit_score: Option<f64>,
    pub ai_fit_summary: Option<String>, // JSON blob from the AI fit scorer
    pub next_action: Option<String>,
    pub next_action_date: Option<String>, // YYYY-MM-DD
    pub date_applied: Option<String>,
    pub date_closed: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Opportunity {
    pub fn keywords(&self) -> Vec<String> {
        self.jd_keywords
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

/// Fields for a new opportunity. Stage and next action are filled in by the caller
/// from the stage vocabulary.
#[derive(Debug, Clone, Default)]
pub struct NewOpportunity {
    pub company: String,
    pub role_title: String,
    pub job_family: Option<String>,
    pub tier: Option<i64>,
    pub stage: String,
    pub source: Option<String>,
    pub salary_range: Option<String>,
    pub jd_url: Option<String>,
    pub jd_raw: Option<String>,
    pub jd_keywords: Vec<String>,
    pub next_action: Option<String>,
    pub next_action_date: Option<String>,
}

/// Partial update. `None` leaves a column untouched; `date_closed: Some(None)`
/// clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpportunityUpdate {
    pub stage: Option<String>,
    pub date_applied: Option<String>,
    pub date_closed: Option<Option<String>>,
    pub next_action: Option<String>,
    pub next_action_date: Option<String>,
    pub fit_score: Option<f64>,
    pub ai_fit_summary: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OpportunityFilter {
    pub stage: Option<String>,
    pub tier: Option<i64>,
    pub job_family: Option<String>,
    pub exclude_stage: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub opportunity_id: Option<i64>,
    pub full_name: String,
    pub title: Option<String>,
    pub company: Option<String>,
    pub linkedin_url: Option<String>,
    pub email: Option<String>,
    pub contact_type: Option<ContactType>,
    pub outreach_day0: Option<String>,
    pub outreach_day3: Option<String>,
    pub outreach_day7: Option<String>,
    pub response_status: ResponseStatus,
    pub call_completed: bool,
    pub referral_asked: bool,
    pub referral_given: bool,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewContact {
    pub opportunity_id: Option<i64>,
    pub full_name: String,
    pub title: Option<String>,
    pub company: Option<String>,
    pub linkedin_url: Option<String>,
    pub email: Option<String>,
    pub contact_type: Option<ContactType>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactUpdate {
    pub outreach_day0: Option<String>,
    pub outreach_day3: Option<String>,
    pub outreach_day7: Option<String>,
    pub response_status: Option<ResponseStatus>,
    pub call_completed: Option<bool>,
    pub referral_asked: Option<bool>,
    pub referral_given: Option<bool>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContactFilter {
    pub opportunity_id: Option<i64>,
    pub response_status: Option<ResponseStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactType {
    HiringManager,
    Peer,
    Recruiter,
    Alumni,
    ReferralSource,
    Other,
}

impl ContactType {
    pub const ALL: [ContactType; 6] = [
        ContactType::HiringManager,
        ContactType::Peer,
        ContactType::Recruiter,
        ContactType::Alumni,
        ContactType::ReferralSource,
        ContactType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContactType::HiringManager => "Hiring Manager",
            ContactType::Peer => "Peer",
            ContactType::Recruiter => "Recruiter",
            ContactType::Alumni => "Alumni",
            ContactType::ReferralSource => "Referral Source",
            ContactType::Other => "Other",
        }
    }
}

impl FromStr for ContactType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase().replace(['-', '_'], " ");
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().to_lowercase() == wanted)
            .ok_or_else(|| anyhow!("Unknown contact type '{}'", s))
    }
}

impl fmt::Display for ContactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResponseStatus {
    #[default]
    Pending,
    Responded,
    NoResponse,
    MeetingScheduled,
}

impl ResponseStatus {
    pub const ALL: [ResponseStatus; 4] = [
        ResponseStatus::Pending,
        ResponseStatus::Responded,
        ResponseStatus::NoResponse,
        ResponseStatus::MeetingScheduled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Pending => "Pending",
            ResponseStatus::Responded => "Responded",
            ResponseStatus::NoResponse => "No Response",
            ResponseStatus::MeetingScheduled => "Meeting Scheduled",
        }
    }
}

impl FromStr for ResponseStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase().replace(['-', '_'], " ");
        Self::ALL
            .into_iter()
            .find(|r| r.as_str().to_lowercase() == wanted)
            .ok_or_else(|| anyhow!("Unknown response status '{}'", s))
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityType {
    NoteAdded,
    StageChange,
    OutreachSent,
    FollowUpSent,
    ResponseReceived,
    AiAction,
}

impl ActivityType {
    pub const ALL: [ActivityType; 6] = [
        ActivityType::NoteAdded,
        ActivityType::StageChange,
        ActivityType::OutreachSent,
        ActivityType::FollowUpSent,
        ActivityType::ResponseReceived,
        ActivityType::AiAction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::NoteAdded => "Note Added",
            ActivityType::StageChange => "Stage Change",
            ActivityType::OutreachSent => "Outreach Sent",
            ActivityType::FollowUpSent => "Follow-Up Sent",
            ActivityType::ResponseReceived => "Response Received",
            ActivityType::AiAction => "AI Action",
        }
    }
}

impl FromStr for ActivityType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| anyhow!("Unknown activity type '{}'", s))
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLog {
    pub id: i64,
    pub opportunity_id: Option<i64>,
    pub contact_id: Option<i64>,
    pub activity_type: ActivityType,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub activity_type: ActivityType,
    pub description: String,
    pub opportunity_id: Option<i64>,
    pub contact_id: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}

impl NewActivity {
    pub fn new(activity_type: ActivityType, description: impl Into<String>) -> Self {
        Self {
            activity_type,
            description: description.into(),
            opportunity_id: None,
            contact_id: None,
            metadata: None,
        }
    }

    pub fn opportunity(mut self, id: Option<i64>) -> Self {
        self.opportunity_id = id;
        self
    }

    pub fn contact(mut self, id: i64) -> Self {
        self.contact_id = Some(id);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
