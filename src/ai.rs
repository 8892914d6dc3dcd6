use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::env;
use tracing::debug;

use crate::config::{JOB_FAMILIES, OWNER_BACKGROUND};
use crate::followup::FollowUpItem;
use crate::models::Opportunity;
use crate::workflow::PipelineSummary;

// --- Provider trait ---

pub trait AIProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String>;
    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone)]
pub enum ProviderKind {
    Anthropic,
    OpenAI,
    ClaudeCode,
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model_id: String,
    pub short_name: String,
}

pub fn resolve_model(name: &str) -> Result<ModelSpec> {
    let (provider, model_id, short_name) = match name {
        // Claude Code provider (uses `claude` CLI, no API key needed)
        "claude-sonnet" | "sonnet" => (ProviderKind::ClaudeCode, "claude-sonnet-4-6", "claude-sonnet"),
        "claude-haiku" | "haiku" => (ProviderKind::ClaudeCode, "claude-haiku-4-5-20251001", "claude-haiku"),
        // Direct Anthropic API (requires ANTHROPIC_API_KEY)
        "api-sonnet" => (ProviderKind::Anthropic, "claude-sonnet-4-6", "api-sonnet"),
        "api-haiku" => (ProviderKind::Anthropic, "claude-haiku-4-5-20251001", "api-haiku"),
        // OpenAI (requires OPENAI_API_KEY)
        "gpt-4o" => (ProviderKind::OpenAI, "gpt-4o", "gpt-4o"),
        "gpt-4o-mini" => (ProviderKind::OpenAI, "gpt-4o-mini", "gpt-4o-mini"),
        _ => {
            return Err(anyhow!(
                "Unknown model '{}'. Available: claude-sonnet (default), claude-haiku, \
                 api-sonnet, api-haiku, gpt-4o, gpt-4o-mini",
                name
            ))
        }
    };
    Ok(ModelSpec {
        provider,
        model_id: model_id.to_string(),
        short_name: short_name.to_string(),
    })
}

pub fn create_provider(spec: &ModelSpec) -> Result<Box<dyn AIProvider>> {
    match spec.provider {
        ProviderKind::ClaudeCode => Ok(Box::new(ClaudeCodeProvider::new(spec.model_id.clone())?)),
        ProviderKind::Anthropic => Ok(Box::new(AnthropicProvider::new(spec.model_id.clone())?)),
        ProviderKind::OpenAI => Ok(Box::new(OpenAIProvider::new(spec.model_id.clone())?)),
    }
}

// --- Anthropic provider ---

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ChatMessage>,
}

impl ChatRequest {
    fn user(model: &str, max_tokens: u32, prompt: &str) -> Self {
        Self {
            model: model.to_string(),
            max_tokens,
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug)]
pub struct AnthropicProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl AnthropicProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY environment variable not set. Add it to .env or export it")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

impl AIProvider for AnthropicProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let response = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&ChatRequest::user(&self.model_id, max_tokens, prompt))
            .send()
            .context("Failed to send request to Anthropic API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "Anthropic API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: AnthropicResponse = response
            .json()
            .context("Failed to parse Anthropic API response")?;

        api_response
            .content
            .first()
            .map(|block| block.text.clone())
            .ok_or_else(|| anyhow!("No content in Anthropic API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Claude Code provider (shells out to `claude` CLI) ---

#[derive(Debug)]
pub struct ClaudeCodeProvider {
    model_id: String,
}

impl ClaudeCodeProvider {
    pub fn new(model_id: String) -> Result<Self> {
        std::process::Command::new("claude")
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .context("'claude' CLI not found. Install it or set JOBOPS_MODEL=api-sonnet")?;
        Ok(Self { model_id })
    }
}

impl AIProvider for ClaudeCodeProvider {
    fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String> {
        let output = std::process::Command::new("claude")
            .arg("-p")
            .arg(prompt)
            .arg("--model")
            .arg(&self.model_id)
            .output()
            .context("Failed to run 'claude' CLI")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("claude CLI failed: {}", stderr));
        }

        let response = String::from_utf8(output.stdout)
            .context("Invalid UTF-8 in claude CLI output")?;

        if response.trim().is_empty() {
            return Err(anyhow!("Empty response from claude CLI"));
        }

        Ok(response)
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- OpenAI provider ---

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug)]
pub struct OpenAIProvider {
    api_key: String,
    model_id: String,
    client: reqwest::blocking::Client,
}

impl OpenAIProvider {
    pub fn new(model_id: String) -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .context("OPENAI_API_KEY environment variable not set. Add it to .env or export it")?;
        let client = reqwest::blocking::Client::new();
        Ok(Self { api_key, model_id, client })
    }
}

impl AIProvider for OpenAIProvider {
    fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let response = self
            .client
            .post(OPENAI_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&ChatRequest::user(&self.model_id, max_tokens, prompt))
            .send()
            .context("Failed to send request to OpenAI API")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            return Err(anyhow!(
                "OpenAI API request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: OpenAIResponse = response
            .json()
            .context("Failed to parse OpenAI API response")?;

        api_response
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .ok_or_else(|| anyhow!("No choices in OpenAI API response"))
    }

    fn model_name(&self) -> &str {
        &self.model_id
    }
}

// --- Response parsing ---

/// Pull the JSON object out of a model reply, tolerating code fences and chatter.
fn parse_json_reply<T: DeserializeOwned>(reply: &str) -> Result<T> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if e > s => &reply[s..=e],
        _ => return Err(anyhow!("No JSON object in model reply: {}", truncate_for_error(reply))),
    };
    serde_json::from_str(body)
        .with_context(|| format!("Model reply was not the expected JSON: {}", truncate_for_error(body)))
}

fn truncate_for_error(text: &str) -> String {
    text.chars().take(200).collect()
}

fn ask_json<T: DeserializeOwned>(provider: &dyn AIProvider, prompt: &str, max_tokens: u32) -> Result<T> {
    debug!(model = provider.model_name(), prompt_chars = prompt.len(), "AI request");
    let reply = provider.complete(prompt, max_tokens)?;
    parse_json_reply(&reply)
}

// --- Job description structure ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JdStructure {
    pub company: Option<String>,
    pub role_title: Option<String>,
    pub job_family_guess: Option<String>,
    pub required_skills: Vec<String>,
    pub preferred_skills: Vec<String>,
    pub keywords: Vec<String>,
    pub salary_range: Option<String>,
    pub remote_ok: Option<bool>,
    pub seniority: Option<String>,
}

pub fn extract_jd_structure(provider: &dyn AIProvider, jd_text: &str) -> Result<JdStructure> {
    let families = JOB_FAMILIES
        .iter()
        .map(|(_, label)| *label)
        .collect::<Vec<_>>()
        .join(", ");
    let prompt = format!(
        "Extract the structure of this job description.\n\n\
        Return ONLY a JSON object with these keys:\n\
        company (string), role_title (string), job_family_guess (one of: {families}),\n\
        required_skills (list), preferred_skills (list), keywords (list of ATS keywords, max 15),\n\
        salary_range (string or null), remote_ok (true/false/null), seniority (string)\n\n\
        Job description:\n{jd_text}"
    );
    ask_json(provider, &prompt, 1500)
}

// --- Fit scoring ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FitScore {
    pub fit_score: f64,
    pub score_rationale: String,
    pub top_strengths: Vec<String>,
    pub gaps_or_risks: Vec<String>,
    pub ats_keywords: Vec<String>,
    pub suggested_bullet_rewrite: String,
}

pub fn score_fit(provider: &dyn AIProvider, resume: &str, jd_text: &str) -> Result<FitScore> {
    let prompt = format!(
        "Score how well this candidate fits the job on a 1-10 scale.\n\n\
        Candidate background: {OWNER_BACKGROUND}\n\n\
        Return ONLY a JSON object with these keys:\n\
        fit_score (number 1-10), score_rationale (2-3 sentences), top_strengths (list of 3),\n\
        gaps_or_risks (list), ats_keywords (list of keywords to mirror in the resume),\n\
        suggested_bullet_rewrite (one resume bullet tailored to this job)\n\n\
        Job description:\n{jd_text}\n\n\
        Resume:\n{resume}"
    );
    let mut score: FitScore = ask_json(provider, &prompt, 2000)?;
    score.fit_score = score.fit_score.clamp(0.0, 10.0);
    Ok(score)
}

// --- Outreach ---

#[derive(Debug, Clone)]
pub struct OutreachContext {
    pub contact_name: String,
    pub contact_title: String,
    pub company: String,
    pub contact_type: String,
    pub hook: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutreachDraft {
    pub linkedin_note: String,
    pub inmail_or_email: String,
    pub subject_line: String,
}

pub fn draft_outreach(provider: &dyn AIProvider, ctx: &OutreachContext) -> Result<OutreachDraft> {
    let prompt = format!(
        "Draft a short, specific outreach message from a job seeker.\n\n\
        Sender background: {OWNER_BACKGROUND}\n\
        Recipient: {} ({}, {}) at {}\n\
        Reason for reaching out: {}\n\n\
        Return ONLY a JSON object with these keys:\n\
        linkedin_note (max 300 characters), inmail_or_email (under 120 words, ends with a low-friction ask),\n\
        subject_line (under 8 words)",
        ctx.contact_name, ctx.contact_title, ctx.contact_type, ctx.company, ctx.hook
    );
    let mut draft: OutreachDraft = ask_json(provider, &prompt, 1000)?;
    if draft.linkedin_note.chars().count() > 300 {
        draft.linkedin_note = draft.linkedin_note.chars().take(300).collect();
    }
    Ok(draft)
}

// --- Interview prep ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InterviewPrep {
    pub company_briefing: String,
    pub watch_out_for: String,
    pub behavioral_questions: Vec<String>,
    pub technical_questions: Vec<String>,
    pub questions_to_ask_them: Vec<String>,
}

pub fn generate_interview_prep(
    provider: &dyn AIProvider,
    role_title: &str,
    company: &str,
    jd_text: &str,
) -> Result<InterviewPrep> {
    let prompt = format!(
        "Prepare a candidate for an interview for {role_title} at {company}.\n\n\
        Candidate background: {OWNER_BACKGROUND}\n\n\
        Return ONLY a JSON object with these keys:\n\
        company_briefing (one paragraph), watch_out_for (one paragraph),\n\
        behavioral_questions (list of 5), technical_questions (list of 5),\n\
        questions_to_ask_them (list of 4)\n\n\
        Job description:\n{jd_text}"
    );
    ask_json(provider, &prompt, 2500)
}

// --- Resume bullet tailoring ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BulletRewrite {
    pub original: String,
    pub rewritten: String,
    pub changes_made: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TailoredBullets {
    pub rewritten_bullets: Vec<BulletRewrite>,
    pub overall_notes: String,
}

pub fn tailor_resume_bullets(
    provider: &dyn AIProvider,
    bullets: &[String],
    keywords: &[String],
    jd_context: &str,
) -> Result<TailoredBullets> {
    let numbered = bullets
        .iter()
        .enumerate()
        .map(|(i, b)| format!("{}. {}", i + 1, b))
        .collect::<Vec<_>>()
        .join("\n");
    let prompt = format!(
        "Rewrite these resume bullets to mirror the job's keywords. Stay 100% truthful: \
        never invent numbers, tools or scope that are not in the original bullet.\n\n\
        Target keywords: {}\n\n\
        Job context:\n{jd_context}\n\n\
        Bullets:\n{numbered}\n\n\
        Return ONLY a JSON object with these keys:\n\
        rewritten_bullets (list of objects with original, rewritten, changes_made),\n\
        overall_notes (string)",
        keywords.join(", ")
    );
    ask_json(provider, &prompt, 2500)
}

// --- Daily digest ---

pub fn generate_daily_digest(
    provider: &dyn AIProvider,
    today_queue: &[Opportunity],
    followups: &[FollowUpItem],
    summary: &PipelineSummary,
) -> Result<String> {
    let actions = today_queue
        .iter()
        .map(|o| {
            format!(
                "- {} / {} [{}] tier {}: {} (due {})",
                o.company,
                o.role_title,
                o.stage,
                o.tier.map_or_else(|| "-".to_string(), |t| t.to_string()),
                o.next_action.as_deref().unwrap_or("no action set"),
                o.next_action_date.as_deref().unwrap_or("-"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let follow = followups
        .iter()
        .map(|f| {
            format!(
                "- {} at {}: {} (Day 0 {})",
                f.full_name,
                f.company.as_deref().unwrap_or("?"),
                f.followup_reason,
                f.outreach_day0
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let pipeline = summary
        .rows
        .iter()
        .map(|r| format!("{}: {}", r.stage, r.count))
        .collect::<Vec<_>>()
        .join(", ");

    let prompt = format!(
        "You are a job search coach writing a short daily digest in plain text (no markdown tables).\n\
        Open with the single most important thing to do today, then list today's actions in\n\
        priority order, then follow-ups, then one line on pipeline health.\n\n\
        Actions due:\n{}\n\n\
        Follow-ups due:\n{}\n\n\
        Pipeline: {}",
        if actions.is_empty() { "(none)".to_string() } else { actions },
        if follow.is_empty() { "(none)".to_string() } else { follow },
        pipeline
    );

    let digest = provider.complete(&prompt, 1200)?;
    Ok(digest.trim().to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Replays canned replies and records the prompts it was given.
    pub(crate) struct MockProvider {
        replies: RefCell<Vec<String>>,
        pub prompts: RefCell<Vec<String>>,
    }

    impl MockProvider {
        pub(crate) fn new(replies: &[&str]) -> Self {
            Self {
                replies: RefCell::new(replies.iter().rev().map(|r| r.to_string()).collect()),
                prompts: RefCell::new(Vec::new()),
            }
        }
    }

    impl AIProvider for MockProvider {
        fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String> {
            self.prompts.borrow_mut().push(prompt.to_string());
            self.replies
                .borrow_mut()
                .pop()
                .ok_or_else(|| anyhow!("mock provider has no replies left"))
        }

        fn model_name(&self) -> &str {
            "mock"
        }
    }

    pub(crate) const FIT_REPLY: &str = r#"{
        "fit_score": 8,
        "score_rationale": "Strong SQL and analytics background aligns well.",
        "top_strengths": ["20+ years fintech", "Team leadership", "BI tooling breadth"],
        "gaps_or_risks": ["No Looker experience mentioned"],
        "ats_keywords": ["data governance", "SQL"],
        "suggested_bullet_rewrite": "Led data governance initiative across 3 platforms."
    }"#;

    const JD_REPLY: &str = r#"```json
    {
        "company": "Acme Fintech",
        "role_title": "Analytics Manager",
        "job_family_guess": "Analytics Manager",
        "required_skills": ["SQL", "Python", "Tableau"],
        "keywords": ["data governance", "KPIs", "fintech"],
        "salary_range": "$130,000 - $160,000",
        "remote_ok": true
    }
    ```"#;

    #[test]
    fn test_resolve_model() {
        let spec = resolve_model("sonnet").unwrap();
        assert_eq!(spec.short_name, "claude-sonnet");
        assert!(matches!(spec.provider, ProviderKind::ClaudeCode));

        let spec = resolve_model("api-sonnet").unwrap();
        assert!(matches!(spec.provider, ProviderKind::Anthropic));

        let spec = resolve_model("gpt-4o").unwrap();
        assert!(matches!(spec.provider, ProviderKind::OpenAI));

        assert!(resolve_model("gpt-3").is_err());
    }

    #[test]
    fn test_anthropic_provider_requires_api_key() {
        let original = env::var("ANTHROPIC_API_KEY").ok();
        unsafe { env::remove_var("ANTHROPIC_API_KEY"); }

        let result = AnthropicProvider::new("claude-sonnet-4-6".to_string());

        if let Some(val) = original {
            unsafe { env::set_var("ANTHROPIC_API_KEY", val); }
        }

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn test_extract_jd_structure_strips_fences() {
        let provider = MockProvider::new(&[JD_REPLY]);
        let jd = extract_jd_structure(&provider, "We are hiring an Analytics Manager...").unwrap();
        assert_eq!(jd.company.as_deref(), Some("Acme Fintech"));
        assert_eq!(jd.keywords.len(), 3);
        assert_eq!(jd.remote_ok, Some(true));
        assert!(jd.preferred_skills.is_empty());
        assert!(provider.prompts.borrow()[0].contains("Decision Science"));
    }

    #[test]
    fn test_score_fit_parses_and_clamps() {
        let provider = MockProvider::new(&[FIT_REPLY, r#"{"fit_score": 14}"#]);
        let score = score_fit(&provider, "resume", "jd").unwrap();
        assert_eq!(score.fit_score, 8.0);
        assert_eq!(score.top_strengths.len(), 3);

        let clamped = score_fit(&provider, "resume", "jd").unwrap();
        assert_eq!(clamped.fit_score, 10.0);
        assert!(clamped.gaps_or_risks.is_empty());
    }

    #[test]
    fn test_non_json_reply_is_an_error() {
        let provider = MockProvider::new(&["I'm sorry, I can't help with that."]);
        let err = score_fit(&provider, "resume", "jd").unwrap_err();
        assert!(err.to_string().contains("No JSON object"));
    }

    #[test]
    fn test_draft_outreach_caps_linkedin_note() {
        let long_note = "x".repeat(400);
        let reply = format!(
            r#"{{"linkedin_note": "{long_note}", "inmail_or_email": "Hi Alex", "subject_line": "Hello"}}"#
        );
        let provider = MockProvider::new(&[reply.as_str()]);
        let ctx = OutreachContext {
            contact_name: "Alex".into(),
            contact_title: "Director".into(),
            company: "Acme".into(),
            contact_type: "Hiring Manager".into(),
            hook: "Saw the analytics team is growing".into(),
        };
        let draft = draft_outreach(&provider, &ctx).unwrap();
        assert_eq!(draft.linkedin_note.chars().count(), 300);
        assert_eq!(draft.subject_line, "Hello");
        assert!(provider.prompts.borrow()[0].contains("Saw the analytics team is growing"));
    }

    #[test]
    fn test_tailor_resume_bullets_numbers_input() {
        let provider = MockProvider::new(&[
            r#"{"rewritten_bullets": [{"original": "a", "rewritten": "b", "changes_made": "c"}], "overall_notes": "ok"}"#,
        ]);
        let result =
            tailor_resume_bullets(&provider, &["Built dashboards".into(), "Ran team".into()], &["KPIs".into()], "ctx")
                .unwrap();
        assert_eq!(result.rewritten_bullets.len(), 1);
        let prompt = &provider.prompts.borrow()[0];
        assert!(prompt.contains("1. Built dashboards"));
        assert!(prompt.contains("2. Ran team"));
    }

    #[test]
    fn test_digest_prompt_marks_empty_sections() {
        let provider = MockProvider::new(&["  Focus on Acme today.  "]);
        let digest = generate_daily_digest(&provider, &[], &[], &PipelineSummary::default()).unwrap();
        assert_eq!(digest, "Focus on Acme today.");
        assert!(provider.prompts.borrow()[0].contains("Actions due:\n(none)"));
    }
}
