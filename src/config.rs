use anyhow::{anyhow, Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::db::Database;
use crate::workflow::{ClosePolicy, DEFAULT_STALE_DAYS};

/// Job family labels, keyed by the single letter stored on an opportunity.
pub const JOB_FAMILIES: [(&str, &str); 5] = [
    ("A", "Analytics Manager"),
    ("B", "Data Manager"),
    ("C", "BI Manager"),
    ("D", "Decision Science"),
    ("E", "Director Stretch"),
];

pub const SOURCES: [&str; 5] = ["LinkedIn", "Referral", "Job Board", "Outbound", "Other"];

/// Candidate background fed to the AI prompts.
pub const OWNER_BACKGROUND: &str = "Data & Analytics Manager with 20+ years in financial services \
(fintech, lending, payments). Core stack: SQL (T-SQL, MySQL, BigQuery, Redshift), Python (Pandas, \
SQLAlchemy), Tableau, Power BI (DAX), Amazon QuickSight, Looker. Managed a team of 3 covering \
intake, QA and prioritization. PII-safe data handling and field-level encryption. Remote or hybrid \
(Charlotte NC metro).";

pub fn job_family_label(key: &str) -> Option<&'static str> {
    JOB_FAMILIES
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, label)| *label)
}

/// Process configuration, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub settings_path: PathBuf,
    pub model: String,
    pub resume_cache: PathBuf,
    pub digest_log: PathBuf,
    pub rust_log: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let db_path = std::env::var("JOBOPS_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Database::default_path());
        let settings_path = std::env::var("JOBOPS_SETTINGS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| db_path.with_file_name("app_settings.json"));

        Ok(AppConfig {
            db_path,
            settings_path,
            model: std::env::var("JOBOPS_MODEL").unwrap_or_else(|_| "claude-sonnet".to_string()),
            resume_cache: std::env::var("JOBOPS_RESUME_CACHE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".resume_cache.txt")),
            digest_log: std::env::var("JOBOPS_DIGEST_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("digest_log.txt")),
            rust_log: std::env::var("JOBOPS_LOG").unwrap_or_else(|_| "warn".to_string()),
        })
    }

    pub fn load_settings(&self) -> Result<Settings> {
        Settings::load(&self.settings_path)
    }
}

/// User-editable settings persisted as JSON next to the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub digest_time: String,
    pub stale_days: i64,
    pub close_policy: ClosePolicy,
    pub feed_urls: Vec<String>,
    pub feed_keywords: Vec<String>,
    pub feed_auto_score: bool,
    pub feed_min_score: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            digest_time: "08:00".to_string(),
            stale_days: DEFAULT_STALE_DAYS,
            close_policy: ClosePolicy::default(),
            feed_urls: Vec::new(),
            feed_keywords: Vec::new(),
            feed_auto_score: false,
            feed_min_score: 0.0,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Malformed settings file: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .with_context(|| format!("Failed to write settings file: {}", path.display()))
    }

    pub fn digest_time(&self) -> Result<NaiveTime> {
        parse_digest_time(&self.digest_time)
    }
}

pub fn parse_digest_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| anyhow!("Digest time must be HH:MM (24h), got '{}'", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_settings_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("app_settings.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.stale_days, 7);
        assert_eq!(settings.digest_time().unwrap(), NaiveTime::from_hms_opt(8, 0, 0).unwrap());
    }

    #[test]
    fn test_settings_roundtrip_and_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("app_settings.json");

        let settings = Settings {
            digest_time: "07:30".into(),
            close_policy: ClosePolicy::KeepFirst,
            feed_urls: vec!["https://example.com/jobs.rss".into()],
            ..Default::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);

        std::fs::write(&path, r#"{"digest_time": "09:15", "close_policy": "keep_first"}"#).unwrap();
        let partial = Settings::load(&path).unwrap();
        assert_eq!(partial.digest_time, "09:15");
        assert_eq!(partial.close_policy, ClosePolicy::KeepFirst);
        assert_eq!(partial.stale_days, 7);
    }

    #[test]
    fn test_malformed_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app_settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(err.to_string().contains("Malformed settings file"));
    }

    #[test]
    fn test_parse_digest_time() {
        assert!(parse_digest_time("23:59").is_ok());
        assert!(parse_digest_time("8am").is_err());
        assert!(parse_digest_time("25:00").is_err());
    }

    #[test]
    fn test_job_family_label() {
        assert_eq!(job_family_label("c"), Some("BI Manager"));
        assert_eq!(job_family_label("Z"), None);
    }
}
