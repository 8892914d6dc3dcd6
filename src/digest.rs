use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::info;

use crate::ai::{generate_daily_digest, AIProvider};
use crate::workflow::Workflow;

pub const EMPTY_PIPELINE_HINT: &str =
    "No active opportunities in pipeline. Add your first job with: jobops add <JD text or URL>";

#[derive(Debug, Clone, PartialEq)]
pub enum Digest {
    /// Nothing tracked yet; no model call was made.
    EmptyPipeline,
    /// Framed digest text, as printed and logged.
    Report(String),
}

impl Digest {
    pub fn text(&self) -> &str {
        match self {
            Digest::EmptyPipeline => EMPTY_PIPELINE_HINT,
            Digest::Report(text) => text,
        }
    }
}

/// Build today's digest and append it to `log_path` when given.
pub fn run_daily_digest(workflow: &Workflow, provider: &dyn AIProvider, log_path: Option<&Path>) -> Result<Digest> {
    let today_queue = workflow.get_today_queue()?;
    let followups = workflow.get_followup_queue()?;
    let summary = workflow.get_pipeline_summary()?;

    if today_queue.is_empty() && followups.is_empty() && summary.total() == 0 {
        return Ok(Digest::EmptyPipeline);
    }

    let body = generate_daily_digest(provider, &today_queue, &followups, &summary)?;
    let rule = "=".repeat(60);
    let stamp = workflow.clock().now().format("%Y-%m-%d %H:%M");
    let output = format!("\n{rule}\nJOB SEARCH DAILY DIGEST - {stamp}\n{rule}\n{body}\n");

    if let Some(path) = log_path {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open digest log {}", path.display()))?;
        file.write_all(output.as_bytes())?;
        info!(path = %path.display(), "digest written");
    }

    Ok(Digest::Report(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::tests::MockProvider;
    use crate::clock::ManualClock;
    use crate::stages::StageVocabulary;
    use crate::workflow::tests::{make_opp, test_db};
    use chrono::NaiveDate;

    fn clock() -> ManualClock {
        ManualClock::new(NaiveDate::from_ymd_opt(2026, 5, 4).unwrap().and_hms_opt(8, 0, 0).unwrap())
    }

    #[test]
    fn test_empty_pipeline_skips_model() {
        let db = test_db();
        let stages = StageVocabulary::standard();
        let clock = clock();
        let workflow = Workflow::new(&db, &stages, &clock);
        let provider = MockProvider::new(&[]);

        let digest = run_daily_digest(&workflow, &provider, None).unwrap();
        assert_eq!(digest, Digest::EmptyPipeline);
        assert!(digest.text().starts_with("No active opportunities"));
        assert!(provider.prompts.borrow().is_empty());
    }

    #[test]
    fn test_digest_is_framed_and_appended() {
        let db = test_db();
        let stages = StageVocabulary::standard();
        let clock = clock();
        let workflow = Workflow::new(&db, &stages, &clock);
        make_opp(&db, "Acme", Some(1));

        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("digest_log.txt");
        let provider = MockProvider::new(&["Apply to Acme.", "Follow up with Beta."]);

        let first = run_daily_digest(&workflow, &provider, Some(&log)).unwrap();
        assert!(first.text().contains("JOB SEARCH DAILY DIGEST - 2026-05-04 08:00"));
        assert!(first.text().contains("Apply to Acme."));

        run_daily_digest(&workflow, &provider, Some(&log)).unwrap();
        let written = std::fs::read_to_string(&log).unwrap();
        assert_eq!(written.matches("JOB SEARCH DAILY DIGEST").count(), 2);
        assert!(written.ends_with("Follow up with Beta.\n"));
    }
}
