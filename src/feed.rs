//! RSS 2.0 / Atom job feed polling. New postings land as Prospect
//! opportunities built from the feed item alone; scoring is optional.

use anyhow::{Context, Result};
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{info, warn};

use crate::ai::{score_fit, AIProvider};
use crate::db::Database;
use crate::models::{ActivityType, NewActivity, NewOpportunity, OpportunityUpdate};
use crate::workflow::Workflow;

const FEED_TIMEOUT: Duration = Duration::from_secs(15);
const FEED_USER_AGENT: &str = "jobops/0.1 (personal-use job search tool)";

static RSS_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<item\b[^>]*>(.*?)</item>").expect("valid regex"));
static ATOM_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<entry\b[^>]*>(.*?)</entry>").expect("valid regex"));
static ATOM_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<link\b[^>]*?\bhref\s*=\s*["']([^"']*)["']"#).expect("valid regex"));
static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static TITLE_DASH_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?)\s*[|\u{2013}\u{2014}-]\s*(.+)$").expect("valid regex"));

#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedPollStats {
    pub added: usize,
    pub skipped: usize,
    pub filtered: usize,
    pub errors: usize,
    pub new_titles: Vec<String>,
}

/// Resume-based scoring applied to each imported posting.
pub struct FeedScorer<'a> {
    pub provider: &'a dyn AIProvider,
    pub resume: &'a str,
    /// Postings scoring below this are discarded; 0 keeps everything.
    pub min_score: f64,
}

pub fn poll_feeds(
    db: &Database,
    workflow: &Workflow,
    urls: &[String],
    keywords: &[String],
    scorer: Option<&FeedScorer>,
) -> FeedPollStats {
    let mut stats = FeedPollStats::default();
    for url in urls.iter().map(|u| u.trim()).filter(|u| !u.is_empty()) {
        match fetch_feed(url) {
            Ok(items) => {
                info!(url, items = items.len(), "fetched feed");
                import_items(db, workflow, &items, keywords, scorer, &mut stats);
            }
            Err(e) => {
                warn!(url, error = %e, "feed fetch failed");
                stats.errors += 1;
            }
        }
    }
    stats
}

fn fetch_feed(url: &str) -> Result<Vec<FeedItem>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(FEED_TIMEOUT)
        .user_agent(FEED_USER_AGENT)
        .build()?;
    let body = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.text())
        .with_context(|| format!("Feed fetch failed: {}", url))?;
    Ok(parse_feed(&body))
}

/// Items from an RSS 2.0 or Atom document. Entries without a link are dropped.
pub fn parse_feed(xml: &str) -> Vec<FeedItem> {
    let mut items = Vec::new();

    for cap in RSS_ITEM.captures_iter(xml) {
        let body = &cap[1];
        let link = tag_text(body, "link").unwrap_or_default();
        if link.is_empty() {
            continue;
        }
        items.push(FeedItem {
            title: tag_text(body, "title").unwrap_or_default(),
            link,
            description: tag_text(body, "description").unwrap_or_default(),
        });
    }

    for cap in ATOM_ENTRY.captures_iter(xml) {
        let body = &cap[1];
        let link = ATOM_LINK
            .captures(body)
            .map(|c| decode_entities(c[1].trim()))
            .unwrap_or_default();
        if link.is_empty() {
            continue;
        }
        items.push(FeedItem {
            title: tag_text(body, "title").unwrap_or_default(),
            link,
            description: tag_text(body, "summary")
                .or_else(|| tag_text(body, "content"))
                .unwrap_or_default(),
        });
    }

    items
}

fn tag_text(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut search = 0;
    // skip longer tag names sharing the prefix, e.g. <linkedin> for <link>
    let start = loop {
        let at = search + body[search..].find(&open)?;
        let after = body[at + open.len()..].chars().next()?;
        if after == '>' || after.is_whitespace() {
            break at;
        }
        search = at + open.len();
    };
    let content_start = start + body[start..].find('>')? + 1;
    let content_end = content_start + body[content_start..].find(&close)?;
    let raw = body[content_start..content_end].trim();
    let raw = raw
        .strip_prefix("<![CDATA[")
        .and_then(|r| r.strip_suffix("]]>"))
        .unwrap_or(raw);
    Some(decode_entities(raw.trim()))
}

fn decode_entities(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

pub fn strip_html(text: &str) -> String {
    HTML_TAG.replace_all(text, " ").trim().to_string()
}

/// Split "Role at Company", "Role | Company" or "Role - Company".
/// The company is empty when no separator is found.
pub fn split_title_company(raw: &str) -> (String, String) {
    let lower = raw.to_ascii_lowercase();
    for sep in [" at ", " @ "] {
        if let Some(idx) = lower.find(sep) {
            return (raw[..idx].trim().to_string(), raw[idx + sep.len()..].trim().to_string());
        }
    }
    if let Some(cap) = TITLE_DASH_SPLIT.captures(raw) {
        return (cap[1].trim().to_string(), cap[2].trim().to_string());
    }
    (raw.trim().to_string(), String::new())
}

pub fn import_items(
    db: &Database,
    workflow: &Workflow,
    items: &[FeedItem],
    keywords: &[String],
    scorer: Option<&FeedScorer>,
    stats: &mut FeedPollStats,
) {
    let keywords: Vec<String> = keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();

    for item in items {
        let title_lower = item.title.to_lowercase();
        if !keywords.is_empty() && !keywords.iter().any(|k| title_lower.contains(k.as_str())) {
            stats.skipped += 1;
            continue;
        }
        match db.url_exists(&item.link) {
            Ok(true) => {
                stats.skipped += 1;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(link = %item.link, error = %e, "feed dedup lookup failed");
                stats.errors += 1;
                continue;
            }
        }

        match import_item(db, workflow, item, scorer) {
            Ok(Some(label)) => {
                info!(title = %item.title, link = %item.link, "feed: added posting");
                stats.added += 1;
                stats.new_titles.push(label);
            }
            Ok(None) => stats.filtered += 1,
            Err(e) => {
                warn!(link = %item.link, error = %e, "feed: failed to create opportunity");
                stats.errors += 1;
            }
        }
    }
}

/// Returns the display label of the new opportunity, or `None` when the
/// posting scored below the threshold. Scoring happens before any write, so a
/// discarded posting leaves nothing behind and is reconsidered on later polls.
fn import_item(
    db: &Database,
    workflow: &Workflow,
    item: &FeedItem,
    scorer: Option<&FeedScorer>,
) -> Result<Option<String>> {
    let (role_title, company) = split_title_company(&item.title);
    let role_title = if role_title.is_empty() { item.title.clone() } else { role_title };
    let company = if company.is_empty() { "Unknown".to_string() } else { company };
    let jd_raw = match strip_html(&item.description) {
        d if d.is_empty() => item.title.clone(),
        d => d,
    };

    let mut fit = None;
    if let Some(scorer) = scorer.filter(|s| !s.resume.trim().is_empty()) {
        match score_fit(scorer.provider, scorer.resume, &jd_raw) {
            Ok(score) if scorer.min_score > 0.0 && score.fit_score < scorer.min_score => {
                info!(
                    title = %item.title,
                    score = score.fit_score,
                    threshold = scorer.min_score,
                    "feed: filtered low-fit posting"
                );
                return Ok(None);
            }
            Ok(score) => fit = Some(score),
            Err(e) => warn!(link = %item.link, error = %e, "feed: auto-score failed"),
        }
    }

    let stage = workflow.stages().initial().to_string();
    let (next_action, next_action_date) = workflow.next_action_due(&stage)?;
    db.in_transaction(|| {
        let id = db.create_opportunity(&NewOpportunity {
            company: company.clone(),
            role_title: role_title.clone(),
            stage,
            source: Some("Other".to_string()),
            jd_url: Some(item.link.clone()),
            jd_raw: Some(jd_raw.clone()),
            next_action: Some(next_action),
            next_action_date: Some(next_action_date),
            ..Default::default()
        })?;
        db.log_activity(
            &NewActivity::new(ActivityType::NoteAdded, format!("Auto-added from job feed: {}", item.title))
                .opportunity(Some(id)),
        )?;

        if let Some(score) = &fit {
            db.update_opportunity(
                id,
                &OpportunityUpdate {
                    fit_score: Some(score.fit_score),
                    ai_fit_summary: Some(serde_json::to_string(score)?),
                    ..Default::default()
                },
            )?;
            db.log_activity(
                &NewActivity::new(
                    ActivityType::AiAction,
                    format!("Auto-scored on feed import: {}/10", score.fit_score),
                )
                .opportunity(Some(id)),
            )?;
        }
        Ok(())
    })?;

    Ok(Some(format!("{} / {}", company, role_title)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::tests::{MockProvider, FIT_REPLY};
    use crate::clock::ManualClock;
    use crate::models::OpportunityFilter;
    use crate::stages::StageVocabulary;
    use crate::workflow::tests::test_db;
    use chrono::NaiveDate;

    const RSS: &str = r#"<?xml version="1.0"?>
        <rss version="2.0"><channel>
          <title>Jobs</title>
          <item>
            <title>Analytics Manager at Acme Fintech</title>
            <link>https://jobs.example.com/1</link>
            <description><![CDATA[<p>Lead the <b>analytics</b> team.</p>]]></description>
          </item>
          <item>
            <title>Warehouse Associate</title>
            <link>https://jobs.example.com/2</link>
          </item>
          <item><title>No link here</title></item>
        </channel></rss>"#;

    const ATOM: &str = r#"<feed xmlns="http://www.w3.org/2005/Atom">
          <entry>
            <title>BI Manager | Beta &amp; Co</title>
            <link rel="alternate" href="https://jobs.example.com/atom/9"/>
            <summary>Own dashboards.</summary>
          </entry>
        </feed>"#;

    fn clock() -> ManualClock {
        ManualClock::new(NaiveDate::from_ymd_opt(2026, 3, 2).unwrap().and_hms_opt(9, 0, 0).unwrap())
    }

    #[test]
    fn test_parse_rss_and_atom() {
        let items = parse_feed(RSS);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Analytics Manager at Acme Fintech");
        assert_eq!(items[0].description, "<p>Lead the <b>analytics</b> team.</p>");
        assert_eq!(items[1].description, "");

        let atom = parse_feed(ATOM);
        assert_eq!(atom.len(), 1);
        assert_eq!(atom[0].title, "BI Manager | Beta & Co");
        assert_eq!(atom[0].link, "https://jobs.example.com/atom/9");
        assert_eq!(atom[0].description, "Own dashboards.");
    }

    #[test]
    fn test_split_title_company() {
        assert_eq!(
            split_title_company("Analytics Manager at Acme Corp"),
            ("Analytics Manager".to_string(), "Acme Corp".to_string())
        );
        assert_eq!(
            split_title_company("Data Manager @ Acme"),
            ("Data Manager".to_string(), "Acme".to_string())
        );
        assert_eq!(
            split_title_company("BI Manager - Acme Corp"),
            ("BI Manager".to_string(), "Acme Corp".to_string())
        );
        assert_eq!(
            split_title_company("Director \u{2014} Gamma"),
            ("Director".to_string(), "Gamma".to_string())
        );
        assert_eq!(split_title_company("Analyst"), ("Analyst".to_string(), String::new()));
    }

    #[test]
    fn test_strip_html() {
        assert_eq!(strip_html("<p>Lead the <b>team</b></p>"), "Lead the  team");
    }

    #[test]
    fn test_import_creates_prospects_and_dedups() {
        let db = test_db();
        let stages = StageVocabulary::standard();
        let clock = clock();
        let workflow = Workflow::new(&db, &stages, &clock);
        let items = parse_feed(RSS);

        let mut stats = FeedPollStats::default();
        import_items(&db, &workflow, &items, &["manager".to_string()], None, &mut stats);
        assert_eq!(stats.added, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.new_titles, vec!["Acme Fintech / Analytics Manager".to_string()]);

        let opps = db.list_opportunities(&OpportunityFilter::default()).unwrap();
        assert_eq!(opps.len(), 1);
        let opp = &opps[0];
        assert_eq!(opp.stage, "Prospect");
        assert_eq!(opp.company, "Acme Fintech");
        assert_eq!(opp.jd_raw.as_deref(), Some("Lead the  analytics  team."));
        assert_eq!(opp.next_action_date.as_deref(), Some("2026-03-04"));

        let log = db.get_activity_log(Some(opp.id), 10).unwrap();
        assert_eq!(log[0].activity_type, ActivityType::NoteAdded);
        assert_eq!(
            log[0].description.as_deref(),
            Some("Auto-added from job feed: Analytics Manager at Acme Fintech")
        );

        // second poll sees the same URL
        let mut again = FeedPollStats::default();
        import_items(&db, &workflow, &items, &[], None, &mut again);
        assert_eq!(again.added, 1);
        assert_eq!(again.skipped, 1);
        assert_eq!(again.new_titles, vec!["Unknown / Warehouse Associate".to_string()]);
    }

    #[test]
    fn test_auto_score_discards_below_threshold() {
        let db = test_db();
        let stages = StageVocabulary::standard();
        let clock = clock();
        let workflow = Workflow::new(&db, &stages, &clock);
        let items = parse_feed(RSS);
        let provider = MockProvider::new(&[FIT_REPLY, r#"{"fit_score": 3}"#]);
        let scorer = FeedScorer { provider: &provider, resume: "SQL, Tableau", min_score: 5.0 };

        let mut stats = FeedPollStats::default();
        import_items(&db, &workflow, &items, &[], Some(&scorer), &mut stats);
        assert_eq!(stats.added, 1);
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.errors, 0);

        let opps = db.list_opportunities(&OpportunityFilter::default()).unwrap();
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].fit_score, Some(8.0));
        let log = db.get_activity_log(Some(opps[0].id), 10).unwrap();
        assert!(log.iter().any(|e| e.activity_type == ActivityType::AiAction));

        // nothing was written for the low-fit posting
        assert!(!db.url_exists("https://jobs.example.com/2").unwrap());
        assert_eq!(db.get_activity_log(None, 50).unwrap().len(), 2);
    }

    #[test]
    fn test_low_fit_posting_is_rescored_on_next_poll() {
        let db = test_db();
        let stages = StageVocabulary::standard();
        let clock = clock();
        let workflow = Workflow::new(&db, &stages, &clock);
        let items = parse_feed(ATOM);
        let provider = MockProvider::new(&[r#"{"fit_score": 2}"#, FIT_REPLY]);
        let scorer = FeedScorer { provider: &provider, resume: "SQL", min_score: 5.0 };

        let mut first = FeedPollStats::default();
        import_items(&db, &workflow, &items, &[], Some(&scorer), &mut first);
        assert_eq!((first.added, first.filtered, first.errors), (0, 1, 0));

        let mut second = FeedPollStats::default();
        import_items(&db, &workflow, &items, &[], Some(&scorer), &mut second);
        assert_eq!((second.added, second.filtered, second.skipped), (1, 0, 0));
        assert_eq!(provider.prompts.borrow().len(), 2);
    }

    #[test]
    fn test_failed_score_keeps_posting() {
        let db = test_db();
        let stages = StageVocabulary::standard();
        let clock = clock();
        let workflow = Workflow::new(&db, &stages, &clock);
        let items = parse_feed(ATOM);
        let provider = MockProvider::new(&["not json"]);
        let scorer = FeedScorer { provider: &provider, resume: "SQL", min_score: 5.0 };

        let mut stats = FeedPollStats::default();
        import_items(&db, &workflow, &items, &[], Some(&scorer), &mut stats);
        assert_eq!(stats.added, 1);
        assert_eq!(stats.errors, 0);
        let opps = db.list_opportunities(&OpportunityFilter::default()).unwrap();
        assert_eq!(opps[0].fit_score, None);
    }
}
