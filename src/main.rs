mod ai;
mod clock;
mod config;
mod db;
mod digest;
mod export;
mod feed;
mod followup;
mod ingest;
mod models;
mod scheduler;
mod stages;
mod tui;
mod workflow;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ai::{create_provider, resolve_model, AIProvider};
use clock::{parse_date, Clock, ManualClock, SystemClock};
use config::{parse_digest_time, AppConfig, Settings, JOB_FAMILIES, SOURCES};
use db::Database;
use feed::{poll_feeds, FeedPollStats, FeedScorer};
use followup::{FollowUpAction, FollowUpOutcome};
use models::{
    ActivityType, ContactFilter, ContactType, NewActivity, NewContact, NewOpportunity, Opportunity,
    OpportunityFilter, OpportunityUpdate, ResponseStatus,
};
use scheduler::Scheduler;
use stages::StageVocabulary;
use workflow::Workflow;

#[derive(Parser)]
#[command(name = "jobops")]
#[command(about = "Personal job search pipeline - track opportunities, contacts and follow-ups")]
struct Cli {
    /// Evaluate due dates as of this day (YYYY-MM-DD) instead of today
    #[arg(long, global = true)]
    as_of: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Add an opportunity from a job description (pasted text or URL)
    Add {
        /// JD text or URL
        source: Option<String>,

        /// Read the JD text from a file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Company (overrides the extracted value)
        #[arg(long)]
        company: Option<String>,

        /// Role title (overrides the extracted value)
        #[arg(long)]
        role: Option<String>,

        /// Priority tier, 1 = top
        #[arg(short, long)]
        tier: Option<i64>,

        /// Job family letter (A-E)
        #[arg(long)]
        family: Option<String>,

        /// Where the lead came from (LinkedIn, Referral, Job Board, Outbound, Other)
        #[arg(long)]
        channel: Option<String>,

        /// Skip AI extraction; --company and --role are then required
        #[arg(long)]
        manual: bool,
    },

    /// List opportunities
    List {
        /// Filter by stage
        #[arg(short, long)]
        stage: Option<String>,

        /// Filter by tier
        #[arg(short, long)]
        tier: Option<i64>,

        /// Include closed opportunities
        #[arg(short, long)]
        all: bool,
    },

    /// Show opportunity details
    Show {
        /// Opportunity ID
        id: i64,
    },

    /// Move an opportunity to a new stage
    Advance {
        /// Opportunity ID
        id: i64,

        /// Target stage (case-insensitive)
        stage: String,

        /// Note to record with the stage change
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Actions due today or overdue
    Today,

    /// Count of active opportunities per stage
    Pipeline,

    /// Active opportunities with no update for a while
    Stale {
        /// Days without an update (default from settings)
        #[arg(short, long)]
        days: Option<i64>,
    },

    /// Work through due Day 3 / Day 7 follow-ups interactively
    FollowUp,

    /// Manage contacts
    Contact {
        #[command(subcommand)]
        command: ContactCommands,
    },

    /// Draft an outreach message for a contact
    Outreach {
        /// Contact ID
        contact_id: i64,

        /// Why you are reaching out
        #[arg(long, default_value = "Interested in the team and the role")]
        hook: String,

        /// Record Day 0 outreach as sent today
        #[arg(long)]
        mark_sent: bool,
    },

    /// Record a contact's response status
    Respond {
        /// Contact ID
        contact_id: i64,

        /// Pending, Responded, No Response or Meeting Scheduled
        status: String,
    },

    /// Score resume fit for an opportunity
    ScoreFit {
        /// Opportunity ID
        id: i64,

        /// Resume file (cached for later runs)
        #[arg(short, long)]
        resume: Option<PathBuf>,
    },

    /// Generate interview prep for an opportunity
    Prep {
        /// Opportunity ID
        id: i64,
    },

    /// Rewrite resume bullets toward an opportunity's keywords
    Tailor {
        /// Opportunity ID
        id: i64,

        /// File with one bullet per line
        #[arg(short, long)]
        bullets: PathBuf,
    },

    /// Generate the daily digest
    Digest {
        /// Print only, do not append to the digest log
        #[arg(long)]
        no_log: bool,
    },

    /// Job feeds
    Feed {
        #[command(subcommand)]
        command: FeedCommands,
    },

    /// Show recent activity
    Log {
        /// Limit to one opportunity
        #[arg(short, long)]
        opportunity: Option<i64>,

        /// Number of entries
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Append a dated note to an opportunity
    Note {
        /// Opportunity ID
        id: i64,

        /// Note text
        text: String,
    },

    /// Export every opportunity to CSV
    Export {
        /// Output file (default: jobsearch_export_<date>.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Interactive pipeline dashboard
    Dashboard,

    /// Run the daily digest, stale check and feed poll until Ctrl-C
    Schedule,

    /// Show or change settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
}

#[derive(Subcommand)]
enum ContactCommands {
    /// Add a contact
    Add {
        /// Full name
        name: String,

        /// Linked opportunity ID
        #[arg(short, long)]
        opportunity: Option<i64>,

        /// Job title
        #[arg(long)]
        title: Option<String>,

        /// Company (defaults to the opportunity's company)
        #[arg(long)]
        company: Option<String>,

        /// Hiring Manager, Peer, Recruiter, Alumni, Referral Source or Other
        #[arg(long = "type")]
        contact_type: Option<String>,

        #[arg(long)]
        email: Option<String>,

        #[arg(long)]
        linkedin: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// List contacts
    List {
        /// Filter by opportunity
        #[arg(short, long)]
        opportunity: Option<i64>,

        /// Filter by response status
        #[arg(short, long)]
        status: Option<String>,
    },
}

#[derive(Subcommand)]
enum FeedCommands {
    /// Poll configured feeds once
    Poll,
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Print current settings
    Show,

    /// Set the daily digest time (HH:MM, 24h)
    SetDigestTime { time: String },
}

fn main() -> Result<()> {
    let config = AppConfig::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = config.load_settings()?;
    let stages = StageVocabulary::standard();
    let clock: Arc<dyn Clock> = match cli.as_of.as_deref() {
        Some(day) => {
            let date = parse_date(day).ok_or_else(|| anyhow!("--as-of must be YYYY-MM-DD, got '{}'", day))?;
            let clock = ManualClock::at_system_now();
            clock.set(date.and_time(clock.now().time()));
            Arc::new(clock)
        }
        None => Arc::new(SystemClock),
    };
    let db = Database::open(&config.db_path)?.with_clock(Arc::clone(&clock));
    let workflow = Workflow::new(&db, &stages, clock.as_ref()).with_close_policy(settings.close_policy);

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Add { source, file, company, role, tier, family, channel, manual } => {
            db.ensure_initialized()?;
            let source = match (source, file) {
                (_, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                (Some(source), None) => source,
                (None, None) => return Err(anyhow!("Provide JD text, a URL, or --file")),
            };

            let channel = channel.map(|c| source_label(&c)).transpose()?;
            let mut new = NewOpportunity {
                tier,
                job_family: family.map(|f| f.to_uppercase()),
                source: channel,
                stage: stages.initial().to_string(),
                ..Default::default()
            };
            let mut used_ai = false;
            if manual {
                let trimmed = source.trim();
                if trimmed.to_lowercase().starts_with("http") {
                    new.jd_url = Some(trimmed.to_string());
                } else {
                    new.jd_raw = Some(trimmed.to_string());
                }
            } else {
                let provider = provider(&config)?;
                println!("Extracting job description with {}...", provider.model_name());
                let ingested = ingest::ingest_jd(provider.as_ref(), &source)?;
                let jd = ingested.structure;
                new.jd_raw = Some(ingested.raw_text);
                new.jd_url = ingested.source_url;
                new.company = jd.company.unwrap_or_default();
                new.role_title = jd.role_title.unwrap_or_default();
                new.salary_range = jd.salary_range;
                new.jd_keywords = jd.keywords;
                if new.job_family.is_none() {
                    new.job_family = jd.job_family_guess.as_deref().and_then(job_family_key);
                }
                used_ai = true;
            }
            if let Some(company) = company {
                new.company = company;
            }
            if let Some(role) = role {
                new.role_title = role;
            }
            if new.company.trim().is_empty() || new.role_title.trim().is_empty() {
                return Err(anyhow!("Company and role are required (use --company and --role)"));
            }

            let (next_action, due) = workflow.next_action_due(&new.stage)?;
            new.next_action = Some(next_action);
            new.next_action_date = Some(due);
            let id = db.create_opportunity(&new)?;
            db.log_activity(
                &NewActivity::new(ActivityType::NoteAdded, format!("Added {} / {}", new.company, new.role_title))
                    .opportunity(Some(id)),
            )?;
            if used_ai {
                db.log_activity(
                    &NewActivity::new(ActivityType::AiAction, "Extracted JD structure").opportunity(Some(id)),
                )?;
            }
            println!("Added opportunity #{}: {} / {}", id, new.company, new.role_title);
        }

        Commands::List { stage, tier, all } => {
            db.ensure_initialized()?;
            let filter = OpportunityFilter {
                stage: stage.map(|s| stages.resolve(&s).map(str::to_string)).transpose()?,
                tier,
                exclude_stage: (!all).then(|| stages.terminal().to_string()),
                ..Default::default()
            };
            let opps = db.list_opportunities(&filter)?;
            if opps.is_empty() {
                println!("No opportunities found.");
            } else {
                print_opportunities(&opps);
            }
        }

        Commands::Show { id } => {
            db.ensure_initialized()?;
            match db.get_opportunity(id)? {
                Some(opp) => show_opportunity(&db, &opp)?,
                None => println!("Opportunity #{} not found.", id),
            }
        }

        Commands::Advance { id, stage, note } => {
            db.ensure_initialized()?;
            let stage = stages.resolve(&stage)?;
            workflow.advance_stage(id, stage, note.as_deref())?;
            let opp = find_opportunity(&db, id)?;
            println!("#{} {} / {} -> {}", id, opp.company, opp.role_title, opp.stage);
            if let (Some(action), Some(due)) = (&opp.next_action, &opp.next_action_date) {
                println!("Next: {} (due {})", action, due);
            }
        }

        Commands::Today => {
            db.ensure_initialized()?;
            let queue = workflow.get_today_queue()?;
            if queue.is_empty() {
                println!("Nothing due today.");
            } else {
                println!("{:<6} {:<4} {:<11} {:<18} {:<22} {}", "ID", "TIER", "DUE", "COMPANY", "STAGE", "ACTION");
                println!("{}", "-".repeat(90));
                for opp in queue {
                    println!(
                        "{:<6} {:<4} {:<11} {:<18} {:<22} {}",
                        opp.id,
                        opp.tier.map_or_else(|| "-".to_string(), |t| t.to_string()),
                        opp.next_action_date.as_deref().unwrap_or("-"),
                        truncate(&opp.company, 16),
                        truncate(&opp.stage, 20),
                        opp.next_action.as_deref().unwrap_or("-")
                    );
                }
            }
        }

        Commands::Pipeline => {
            db.ensure_initialized()?;
            let summary = workflow.get_pipeline_summary()?;
            for row in summary.with_all_stages(&stages) {
                println!("{:<18} {:>4} {}", row.stage, row.count, "#".repeat(row.count));
            }
            println!("{}", "-".repeat(23));
            println!("{:<18} {:>4}", "Total", summary.total());
        }

        Commands::Stale { days } => {
            db.ensure_initialized()?;
            let days = days.unwrap_or(settings.stale_days);
            let stale = workflow.flag_stale_records(days)?;
            if stale.is_empty() {
                println!("No stale records (threshold {} days).", days);
            } else {
                println!("{} record(s) with no update in {}+ days:", stale.len(), days);
                for opp in stale {
                    println!(
                        "  #{} {} / {} ({}) last updated {}",
                        opp.id, opp.company, opp.role_title, opp.stage, opp.updated_at
                    );
                }
            }
        }

        Commands::FollowUp => {
            db.ensure_initialized()?;
            let queue = workflow.get_followup_queue()?;
            if queue.is_empty() {
                println!("No follow-ups due.");
            }
            for item in queue {
                println!(
                    "\n{} ({}) at {} - {}",
                    item.full_name,
                    item.contact_type.map_or("?", |t| t.as_str()),
                    item.company.as_deref().unwrap_or("?"),
                    item.role_title.as_deref().unwrap_or("-")
                );
                println!("  {} (Day 0 {}, {} days ago)", item.followup_reason, item.outreach_day0, item.days_since);
                let action = loop {
                    let answer = prompt("  [s]ent / s[k]ip / [r]esponded / [n]o-response / [q]uit: ")?;
                    if answer.trim().eq_ignore_ascii_case("q") {
                        return Ok(());
                    }
                    match answer.parse::<FollowUpAction>() {
                        Ok(action) => break action,
                        Err(e) => println!("  {}", e),
                    }
                };
                match workflow.resolve_followup(item.contact_id, action)? {
                    FollowUpOutcome::Stamped(step) => println!("  {} follow-up recorded.", step.label()),
                    FollowUpOutcome::MarkedResponded => println!("  Marked as responded."),
                    FollowUpOutcome::MarkedNoResponse => println!("  Marked as no response."),
                    FollowUpOutcome::Skipped => println!("  Skipped."),
                }
            }
        }

        Commands::Contact { command } => match command {
            ContactCommands::Add { name, opportunity, title, company, contact_type, email, linkedin, notes } => {
                db.ensure_initialized()?;
                let company = match (company, opportunity) {
                    (Some(c), _) => Some(c),
                    (None, Some(opp_id)) => Some(find_opportunity(&db, opp_id)?.company),
                    (None, None) => None,
                };
                let contact_type = contact_type.map(|t| t.parse::<ContactType>()).transpose()?;
                let id = db.create_contact(&NewContact {
                    opportunity_id: opportunity,
                    full_name: name.clone(),
                    title,
                    company,
                    linkedin_url: linkedin,
                    email,
                    contact_type,
                    notes,
                })?;
                println!("Added contact #{}: {}", id, name);
            }

            ContactCommands::List { opportunity, status } => {
                db.ensure_initialized()?;
                let filter = ContactFilter {
                    opportunity_id: opportunity,
                    response_status: status.map(|s| s.parse::<ResponseStatus>()).transpose()?,
                };
                let contacts = db.list_contacts(&filter)?;
                if contacts.is_empty() {
                    println!("No contacts found.");
                } else {
                    println!("{:<6} {:<22} {:<16} {:<18} {:<12} {:<11}", "ID", "NAME", "TYPE", "COMPANY", "STATUS", "DAY 0");
                    println!("{}", "-".repeat(88));
                    for c in contacts {
                        println!(
                            "{:<6} {:<22} {:<16} {:<18} {:<12} {:<11}",
                            c.id,
                            truncate(&c.full_name, 20),
                            c.contact_type.map_or("-", |t| t.as_str()),
                            truncate(c.company.as_deref().unwrap_or("-"), 16),
                            c.response_status,
                            c.outreach_day0.as_deref().unwrap_or("-")
                        );
                    }
                }
            }
        },

        Commands::Outreach { contact_id, hook, mark_sent } => {
            db.ensure_initialized()?;
            let contact = db
                .get_contact(contact_id)?
                .ok_or_else(|| anyhow!("Contact #{} not found", contact_id))?;
            let company = match (&contact.company, contact.opportunity_id) {
                (Some(c), _) => c.clone(),
                (None, Some(opp_id)) => find_opportunity(&db, opp_id)?.company,
                (None, None) => "their company".to_string(),
            };
            let provider = provider(&config)?;
            let draft = ai::draft_outreach(
                provider.as_ref(),
                &ai::OutreachContext {
                    contact_name: contact.full_name.clone(),
                    contact_title: contact.title.clone().unwrap_or_default(),
                    company,
                    contact_type: contact.contact_type.map_or("Other", |t| t.as_str()).to_string(),
                    hook,
                },
            )?;
            db.log_activity(
                &NewActivity::new(ActivityType::AiAction, format!("Drafted outreach for {}", contact.full_name))
                    .opportunity(contact.opportunity_id)
                    .contact(contact_id),
            )?;

            println!("--- LinkedIn note ({} chars) ---\n{}\n", draft.linkedin_note.chars().count(), draft.linkedin_note);
            println!("--- Subject ---\n{}\n", draft.subject_line);
            println!("--- InMail / email ---\n{}", draft.inmail_or_email);

            if mark_sent {
                let day0 = workflow.record_outreach(contact_id)?;
                println!("\nDay 0 outreach recorded for {} ({}).", contact.full_name, day0);
            }
        }

        Commands::Respond { contact_id, status } => {
            db.ensure_initialized()?;
            let status: ResponseStatus = status.parse()?;
            workflow.set_response_status(contact_id, status)?;
            println!("Contact #{} marked {}.", contact_id, status);
        }

        Commands::ScoreFit { id, resume } => {
            db.ensure_initialized()?;
            let opp = find_opportunity(&db, id)?;
            let jd = jd_text(&opp)?;
            let resume = load_resume(&config, resume.as_deref())?;
            let provider = provider(&config)?;
            let score = ai::score_fit(provider.as_ref(), &resume, jd)?;
            db.update_opportunity(
                id,
                &OpportunityUpdate {
                    fit_score: Some(score.fit_score),
                    ai_fit_summary: Some(serde_json::to_string(&score)?),
                    ..Default::default()
                },
            )?;
            db.log_activity(
                &NewActivity::new(ActivityType::AiAction, format!("Fit scored: {}/10", score.fit_score))
                    .opportunity(Some(id)),
            )?;

            println!("Fit score: {:.1}/10\n", score.fit_score);
            println!("{}\n", textwrap::fill(&score.score_rationale, 80));
            print_list("Strengths", &score.top_strengths);
            print_list("Gaps / risks", &score.gaps_or_risks);
            print_list("ATS keywords", &score.ats_keywords);
            if !score.suggested_bullet_rewrite.is_empty() {
                println!("Suggested bullet:\n  {}", score.suggested_bullet_rewrite);
            }
        }

        Commands::Prep { id } => {
            db.ensure_initialized()?;
            let opp = find_opportunity(&db, id)?;
            let provider = provider(&config)?;
            let prep = ai::generate_interview_prep(provider.as_ref(), &opp.role_title, &opp.company, jd_text(&opp)?)?;
            db.log_activity(
                &NewActivity::new(ActivityType::AiAction, "Generated interview prep").opportunity(Some(id)),
            )?;

            println!("COMPANY BRIEFING\n{}\n", textwrap::fill(&prep.company_briefing, 80));
            println!("WATCH OUT FOR\n{}\n", textwrap::fill(&prep.watch_out_for, 80));
            print_list("Behavioral questions", &prep.behavioral_questions);
            print_list("Technical questions", &prep.technical_questions);
            print_list("Questions to ask them", &prep.questions_to_ask_them);
        }

        Commands::Tailor { id, bullets } => {
            db.ensure_initialized()?;
            let opp = find_opportunity(&db, id)?;
            let raw = std::fs::read_to_string(&bullets)
                .with_context(|| format!("Failed to read {}", bullets.display()))?;
            let bullets: Vec<String> = raw
                .lines()
                .map(|l| l.trim().trim_start_matches(['-', '*', '\u{2022}']).trim().to_string())
                .filter(|l| !l.is_empty())
                .collect();
            if bullets.is_empty() {
                return Err(anyhow!("No bullets found in file"));
            }
            let context = format!("{} at {}\n{}", opp.role_title, opp.company, opp.jd_raw.as_deref().unwrap_or(""));
            let provider = provider(&config)?;
            let result = ai::tailor_resume_bullets(provider.as_ref(), &bullets, &opp.keywords(), &context)?;
            db.log_activity(
                &NewActivity::new(ActivityType::AiAction, format!("Tailored {} resume bullets", bullets.len()))
                    .opportunity(Some(id)),
            )?;

            for (i, b) in result.rewritten_bullets.iter().enumerate() {
                println!("{}. {}", i + 1, b.rewritten);
                println!("   was: {}", b.original);
                println!("   changes: {}\n", b.changes_made);
            }
            if !result.overall_notes.is_empty() {
                println!("{}", textwrap::fill(&result.overall_notes, 80));
            }
        }

        Commands::Digest { no_log } => {
            db.ensure_initialized()?;
            let provider = provider(&config)?;
            let log_path = (!no_log).then_some(config.digest_log.as_path());
            let digest = digest::run_daily_digest(&workflow, provider.as_ref(), log_path)?;
            println!("{}", digest.text());
        }

        Commands::Feed { command: FeedCommands::Poll } => {
            db.ensure_initialized()?;
            if settings.feed_urls.is_empty() {
                println!("No feed URLs configured. Add feed_urls to {}", config.settings_path.display());
                return Ok(());
            }
            let stats = run_feed_poll(&config, &settings, &db, &workflow)?;
            print_feed_stats(&stats);
        }

        Commands::Log { opportunity, limit } => {
            db.ensure_initialized()?;
            let entries = db.get_activity_log(opportunity, limit)?;
            if entries.is_empty() {
                println!("No activity recorded.");
            }
            for e in entries {
                let target = match (e.opportunity_id, e.contact_id) {
                    (Some(o), Some(c)) => format!("#{} c{}", o, c),
                    (Some(o), None) => format!("#{}", o),
                    (None, Some(c)) => format!("c{}", c),
                    (None, None) => "-".to_string(),
                };
                println!(
                    "{:<20} {:<18} {:<10} {}",
                    e.created_at,
                    e.activity_type,
                    target,
                    e.description.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Note { id, text } => {
            db.ensure_initialized()?;
            workflow.add_note(id, &text)?;
            let opp = find_opportunity(&db, id)?;
            println!("Note added to #{} {} / {}.", id, opp.company, opp.role_title);
        }

        Commands::Export { output } => {
            db.ensure_initialized()?;
            let path = output.unwrap_or_else(|| export::default_export_path(clock.today()));
            match export::export_opportunities(&db, &path)? {
                0 => println!("No opportunities to export."),
                rows => println!("Exported {} opportunities to {}", rows, path.display()),
            }
        }

        Commands::Dashboard => {
            db.ensure_initialized()?;
            tui::run_dashboard(&db, &workflow, settings.stale_days)?;
        }

        Commands::Schedule => {
            db.ensure_initialized()?;
            run_scheduler(&config, &settings)?;
        }

        Commands::Settings { command } => match command {
            SettingsCommands::Show => {
                println!("Settings file: {}", config.settings_path.display());
                println!("{}", serde_json::to_string_pretty(&settings)?);
            }
            SettingsCommands::SetDigestTime { time } => {
                let at = parse_digest_time(&time)?;
                let updated = Settings { digest_time: at.format("%H:%M").to_string(), ..settings };
                updated.save(&config.settings_path)?;
                println!("Digest time set to {}.", updated.digest_time);
            }
        },
    }

    Ok(())
}

fn provider(config: &AppConfig) -> Result<Box<dyn AIProvider>> {
    create_provider(&resolve_model(&config.model)?)
}

fn find_opportunity(db: &Database, id: i64) -> Result<Opportunity> {
    db.get_opportunity(id)?
        .ok_or_else(|| anyhow!("Opportunity #{} not found", id))
}

fn jd_text(opp: &Opportunity) -> Result<&str> {
    opp.jd_raw
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| anyhow!("Opportunity #{} has no job description text", opp.id))
}

/// Map an extracted family label ("BI Manager") to its letter key.
fn job_family_key(label: &str) -> Option<String> {
    JOB_FAMILIES
        .iter()
        .find(|(key, name)| name.eq_ignore_ascii_case(label.trim()) || key.eq_ignore_ascii_case(label.trim()))
        .map(|(key, _)| key.to_string())
}

fn source_label(input: &str) -> Result<String> {
    SOURCES
        .iter()
        .find(|s| s.eq_ignore_ascii_case(input.trim()))
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("Unknown source '{}'. Use one of: {}", input, SOURCES.join(", ")))
}

/// Resume from `path` (refreshing the cache) or from the cache.
fn load_resume(config: &AppConfig, path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read resume {}", path.display()))?;
            std::fs::write(&config.resume_cache, &text)
                .with_context(|| format!("Failed to cache resume at {}", config.resume_cache.display()))?;
            Ok(text)
        }
        None => std::fs::read_to_string(&config.resume_cache).map_err(|_| {
            anyhow!("No cached resume at {}. Pass --resume <file>", config.resume_cache.display())
        }),
    }
}

fn run_feed_poll(config: &AppConfig, settings: &Settings, db: &Database, workflow: &Workflow) -> Result<FeedPollStats> {
    let resume = if settings.feed_auto_score {
        std::fs::read_to_string(&config.resume_cache).ok()
    } else {
        None
    };
    let provider = match &resume {
        Some(_) => Some(provider(config)?),
        None => None,
    };
    let scorer = match (&provider, &resume) {
        (Some(provider), Some(resume)) => Some(FeedScorer {
            provider: provider.as_ref(),
            resume,
            min_score: settings.feed_min_score,
        }),
        _ => None,
    };
    Ok(poll_feeds(db, workflow, &settings.feed_urls, &settings.feed_keywords, scorer.as_ref()))
}

fn print_feed_stats(stats: &FeedPollStats) {
    println!(
        "Feed poll: {} added, {} skipped, {} filtered, {} errors.",
        stats.added, stats.skipped, stats.filtered, stats.errors
    );
    for title in &stats.new_titles {
        println!("  + {}", title);
    }
}

fn run_scheduler(config: &AppConfig, settings: &Settings) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let digest_config = config.clone();
    let stale_config = config.clone();
    let feed_config = config.clone();
    let settings_path = config.settings_path.clone();

    let mut scheduler = Scheduler::new(Arc::clone(&clock), settings.digest_time()?)
        .with_time_source(move || Settings::load(&settings_path).ok()?.digest_time().ok())
        .every_day("digest", move || {
            with_workflow(&digest_config, |_, workflow, _| {
                let provider = provider(&digest_config)?;
                let digest = digest::run_daily_digest(workflow, provider.as_ref(), Some(digest_config.digest_log.as_path()))?;
                println!("{}", digest.text());
                Ok(())
            })
        })
        .every_day("stale-check", move || {
            with_workflow(&stale_config, |_, workflow, settings| {
                let stale = workflow.flag_stale_records(settings.stale_days)?;
                if stale.is_empty() {
                    println!("[scheduler] Stale check: no stale records.");
                } else {
                    println!(
                        "[scheduler] {} stale record(s), no update in {}+ days:",
                        stale.len(),
                        settings.stale_days
                    );
                    for opp in stale {
                        println!("  - {} / {} (stage: {})", opp.company, opp.role_title, opp.stage);
                    }
                }
                Ok(())
            })
        })
        .every_day("feed-poll", move || {
            with_workflow(&feed_config, |db, workflow, settings| {
                if settings.feed_urls.is_empty() {
                    return Ok(());
                }
                let stats = run_feed_poll(&feed_config, settings, db, workflow)?;
                print_feed_stats(&stats);
                Ok(())
            })
        });

    println!(
        "Scheduler started: {} daily at {}. Next run {}. Ctrl-C to stop.",
        scheduler.job_names().collect::<Vec<_>>().join(", "),
        scheduler.at().format("%H:%M"),
        scheduler.next_run().format("%Y-%m-%d %H:%M")
    );

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() && shutdown_tx.send(true).is_err() {
                debug!("scheduler exited before the shutdown signal");
            }
        });
        scheduler.run(shutdown_rx).await;
    });
    println!("Scheduler stopped.");
    Ok(())
}

/// Fresh connection and settings for one scheduled run.
fn with_workflow<F>(config: &AppConfig, f: F) -> Result<()>
where
    F: FnOnce(&Database, &Workflow, &Settings) -> Result<()>,
{
    let settings = config.load_settings()?;
    let db = Database::open(&config.db_path)?;
    let stages = StageVocabulary::standard();
    let clock = SystemClock;
    let workflow = Workflow::new(&db, &stages, &clock).with_close_policy(settings.close_policy);
    f(&db, &workflow, &settings)
}

fn print_opportunities(opps: &[Opportunity]) {
    println!(
        "{:<6} {:<4} {:<18} {:<26} {:<18} {:>5} {:<11}",
        "ID", "TIER", "COMPANY", "ROLE", "STAGE", "FIT", "NEXT"
    );
    println!("{}", "-".repeat(94));
    for opp in opps {
        println!(
            "{:<6} {:<4} {:<18} {:<26} {:<18} {:>5} {:<11}",
            opp.id,
            opp.tier.map_or_else(|| "-".to_string(), |t| t.to_string()),
            truncate(&opp.company, 16),
            truncate(&opp.role_title, 24),
            truncate(&opp.stage, 16),
            opp.fit_score.map_or_else(|| "-".to_string(), |s| format!("{:.1}", s)),
            opp.next_action_date.as_deref().unwrap_or("-")
        );
    }
}

fn show_opportunity(db: &Database, opp: &Opportunity) -> Result<()> {
    println!("Opportunity #{}", opp.id);
    println!("Company: {}", opp.company);
    println!("Role: {}", opp.role_title);
    println!("Stage: {}", opp.stage);
    if let Some(tier) = opp.tier {
        println!("Tier: {}", tier);
    }
    if let Some(family) = &opp.job_family {
        println!("Job family: {} ({})", family, config::job_family_label(family).unwrap_or("?"));
    }
    if let Some(source) = &opp.source {
        println!("Source: {}", source);
    }
    if let Some(salary) = &opp.salary_range {
        println!("Salary: {}", salary);
    }
    if let Some(url) = &opp.jd_url {
        println!("URL: {}", url);
    }
    if let Some(score) = opp.fit_score {
        println!("Fit score: {:.1}/10", score);
    }
    if let Some(action) = &opp.next_action {
        println!("Next action: {} (due {})", action, opp.next_action_date.as_deref().unwrap_or("-"));
    }
    if let Some(applied) = &opp.date_applied {
        println!("Applied: {}", applied);
    }
    if let Some(closed) = &opp.date_closed {
        println!("Closed: {}", closed);
    }
    println!("Created: {}  Updated: {}", opp.created_at, opp.updated_at);
    let keywords = opp.keywords();
    if !keywords.is_empty() {
        println!("Keywords: {}", keywords.join(", "));
    }
    if let Some(notes) = &opp.notes {
        println!("\n--- Notes ---\n{}", notes);
    }

    let contacts = db.list_contacts(&ContactFilter { opportunity_id: Some(opp.id), ..Default::default() })?;
    if !contacts.is_empty() {
        println!("\nContacts ({}):", contacts.len());
        for c in contacts {
            println!(
                "  #{} {} ({}) - {}",
                c.id,
                c.full_name,
                c.contact_type.map_or("?", |t| t.as_str()),
                c.response_status
            );
        }
    }

    let activity = db.get_activity_log(Some(opp.id), 10)?;
    if !activity.is_empty() {
        println!("\nRecent activity:");
        for e in activity {
            println!("  {} {}: {}", e.created_at, e.activity_type, e.description.as_deref().unwrap_or(""));
        }
    }
    Ok(())
}

fn print_list(title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("{}:", title);
    for item in items {
        println!("  - {}", item);
    }
    println!();
}

fn prompt(message: &str) -> Result<String> {
    print!("{}", message);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max.saturating_sub(3)).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("Acme", 10), "Acme");
        assert_eq!(truncate("Analytics Manager", 10), "Analyti...");
        assert_eq!(truncate("Café Société", 7), "Café...");
    }

    #[test]
    fn test_job_family_key() {
        assert_eq!(job_family_key("BI Manager").as_deref(), Some("C"));
        assert_eq!(job_family_key(" decision science ").as_deref(), Some("D"));
        assert_eq!(job_family_key("e").as_deref(), Some("E"));
        assert_eq!(job_family_key("Astronaut"), None);
    }

    #[test]
    fn test_source_label() {
        assert_eq!(source_label("job board").unwrap(), "Job Board");
        assert!(source_label("Craigslist").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["jobops", "advance", "3", "hm interview", "--note", "went well"]).unwrap();
        assert!(matches!(cli.command, Commands::Advance { id: 3, .. }));
        let cli = Cli::try_parse_from(["jobops", "today", "--as-of", "2026-11-02"]).unwrap();
        assert_eq!(cli.as_of.as_deref(), Some("2026-11-02"));
        let cli = Cli::try_parse_from(["jobops", "contact", "add", "Ana", "--type", "recruiter", "-o", "2"]).unwrap();
        assert!(matches!(cli.command, Commands::Contact { command: ContactCommands::Add { opportunity: Some(2), .. } }));
        let cli = Cli::try_parse_from(["jobops", "note", "4", "Called the recruiter"]).unwrap();
        assert!(matches!(cli.command, Commands::Note { id: 4, ref text } if text == "Called the recruiter"));
        let cli = Cli::try_parse_from(["jobops", "export", "-o", "out.csv"]).unwrap();
        assert!(matches!(cli.command, Commands::Export { output: Some(ref p) } if p == Path::new("out.csv")));
    }
}
