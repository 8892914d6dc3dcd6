use anyhow::{anyhow, Context, Result};
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, params_from_iter, Connection};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::models::{
    ActivityLog, Contact, ContactFilter, ContactUpdate, NewActivity, NewContact, NewOpportunity,
    Opportunity, OpportunityFilter, OpportunityUpdate,
};
use crate::workflow::PipelineStore;

const OPPORTUNITY_COLUMNS: &str = "id, company, role_title, job_family, tier, stage, source, salary_range,
     jd_url, jd_raw, jd_keywords, fit_score, ai_fit_summary, next_action, next_action_date,
     date_applied, date_closed, notes, created_at, updated_at";

const CONTACT_COLUMNS: &str = "id, opportunity_id, full_name, title, company, linkedin_url, email,
     contact_type, outreach_day0, outreach_day3, outreach_day7, response_status, call_completed,
     referral_asked, referral_given, notes, created_at, updated_at";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct Database {
    conn: Connection,
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Ok(Self { conn, path: path.to_path_buf(), clock: Arc::new(SystemClock) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn, path: PathBuf::from(":memory:"), clock: Arc::new(SystemClock) })
    }

    /// Stamp `created_at`/`updated_at` from `clock` instead of the wall clock.
    /// The workflow engine must share this clock for staleness to agree.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn timestamp(&self) -> String {
        self.clock.now().format(TIMESTAMP_FORMAT).to_string()
    }

    /// Run `work` inside one SQLite transaction. Any error rolls back every
    /// write made on this connection since the transaction began.
    pub fn in_transaction<T>(&self, work: impl FnOnce() -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let value = work()?;
        tx.commit()?;
        Ok(value)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn default_path() -> PathBuf {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobops") {
            proj_dirs.data_dir().join("jobops.db")
        } else {
            PathBuf::from("jobops.db")
        }
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS opportunities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company TEXT NOT NULL,
                role_title TEXT NOT NULL,
                job_family TEXT,
                tier INTEGER CHECK (tier IS NULL OR tier BETWEEN 1 AND 3),
                stage TEXT NOT NULL DEFAULT 'Prospect',
                source TEXT,
                salary_range TEXT,
                jd_url TEXT,
                jd_raw TEXT,
                jd_keywords TEXT,
                fit_score REAL,
                ai_fit_summary TEXT,
                next_action TEXT,
                next_action_date TEXT,
                date_applied TEXT,
                date_closed TEXT,
                notes TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
            );

            CREATE TABLE IF NOT EXISTS contacts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                opportunity_id INTEGER REFERENCES opportunities(id),
                full_name TEXT NOT NULL,
                title TEXT,
                company TEXT,
                linkedin_url TEXT,
                email TEXT,
                contact_type TEXT,
                outreach_day0 TEXT,
                outreach_day3 TEXT,
                outreach_day7 TEXT,
                response_status TEXT NOT NULL DEFAULT 'Pending'
                    CHECK (response_status IN ('Pending', 'Responded', 'No Response', 'Meeting Scheduled')),
                call_completed INTEGER NOT NULL DEFAULT 0,
                referral_asked INTEGER NOT NULL DEFAULT 0,
                referral_given INTEGER NOT NULL DEFAULT 0,
                notes TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
            );

            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                opportunity_id INTEGER REFERENCES opportunities(id),
                contact_id INTEGER REFERENCES contacts(id),
                activity_type TEXT NOT NULL,
                description TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
            );

            CREATE INDEX IF NOT EXISTS idx_opps_stage ON opportunities(stage);
            CREATE INDEX IF NOT EXISTS idx_opps_jd_url ON opportunities(jd_url);
            CREATE INDEX IF NOT EXISTS idx_contacts_opp ON contacts(opportunity_id);
            CREATE INDEX IF NOT EXISTS idx_contacts_status ON contacts(response_status);
            CREATE INDEX IF NOT EXISTS idx_activity_opp ON activity_log(opportunity_id);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='opportunities'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'jobops init' first."));
        }
        Ok(())
    }

    // --- Opportunity operations ---

    pub fn create_opportunity(&self, new: &NewOpportunity) -> Result<i64> {
        let keywords = serde_json::to_string(&new.jd_keywords)?;
        let now = self.timestamp();
        self.conn.execute(
            "INSERT INTO opportunities
               (company, role_title, job_family, tier, stage, source, salary_range,
                jd_url, jd_raw, jd_keywords, next_action, next_action_date, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                new.company,
                new.role_title,
                new.job_family,
                new.tier,
                new.stage,
                new.source,
                new.salary_range,
                new.jd_url,
                new.jd_raw,
                keywords,
                new.next_action,
                new.next_action_date,
                now,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!(id, company = %new.company, "created opportunity");
        Ok(id)
    }

    pub fn get_opportunity(&self, id: i64) -> Result<Option<Opportunity>> {
        let result = self.conn.query_row(
            &format!("SELECT {OPPORTUNITY_COLUMNS} FROM opportunities WHERE id = ?1"),
            [id],
            Self::row_to_opportunity,
        );
        match result {
            Ok(opp) => Ok(Some(opp)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_opportunities(&self, filter: &OpportunityFilter) -> Result<Vec<Opportunity>> {
        let mut sql = format!("SELECT {OPPORTUNITY_COLUMNS} FROM opportunities WHERE 1=1");
        let mut params: Vec<Box<dyn ToSql>> = vec![];

        if let Some(stage) = &filter.stage {
            params.push(Box::new(stage.clone()));
            sql.push_str(&format!(" AND stage = ?{}", params.len()));
        }
        if let Some(tier) = filter.tier {
            params.push(Box::new(tier));
            sql.push_str(&format!(" AND tier = ?{}", params.len()));
        }
        if let Some(family) = &filter.job_family {
            params.push(Box::new(family.clone()));
            sql.push_str(&format!(" AND job_family = ?{}", params.len()));
        }
        if let Some(excluded) = &filter.exclude_stage {
            params.push(Box::new(excluded.clone()));
            sql.push_str(&format!(" AND stage != ?{}", params.len()));
        }

        sql.push_str(" ORDER BY COALESCE(tier, 9), COALESCE(next_action_date, '9999-12-31'), id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), Self::row_to_opportunity)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list opportunities")
    }

    pub fn update_opportunity(&self, id: i64, update: &OpportunityUpdate) -> Result<()> {
        let mut sets: Vec<String> = vec![];
        let mut params: Vec<Box<dyn ToSql>> = vec![];
        let mut set = |column: &str, value: Box<dyn ToSql>| {
            params.push(value);
            sets.push(format!("{column} = ?{}", params.len()));
        };

        if let Some(v) = &update.stage {
            set("stage", Box::new(v.clone()));
        }
        if let Some(v) = &update.date_applied {
            set("date_applied", Box::new(v.clone()));
        }
        if let Some(v) = &update.date_closed {
            // Some(None) writes NULL
            set("date_closed", Box::new(v.clone()));
        }
        if let Some(v) = &update.next_action {
            set("next_action", Box::new(v.clone()));
        }
        if let Some(v) = &update.next_action_date {
            set("next_action_date", Box::new(v.clone()));
        }
        if let Some(v) = update.fit_score {
            set("fit_score", Box::new(v));
        }
        if let Some(v) = &update.ai_fit_summary {
            set("ai_fit_summary", Box::new(v.clone()));
        }
        if let Some(v) = &update.notes {
            set("notes", Box::new(v.clone()));
        }

        set("updated_at", Box::new(self.timestamp()));
        params.push(Box::new(id));
        let sql = format!(
            "UPDATE opportunities SET {} WHERE id = ?{}",
            sets.join(", "),
            params.len()
        );

        let changed = self.conn.execute(&sql, params_from_iter(params.iter()))?;
        if changed == 0 {
            return Err(anyhow!("Opportunity #{} not found", id));
        }
        Ok(())
    }

    pub fn url_exists(&self, url: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM opportunities WHERE jd_url = ?1",
            [url],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn row_to_opportunity(row: &rusqlite::Row) -> rusqlite::Result<Opportunity> {
        Ok(Opportunity {
            id: row.get(0)?,
            company: row.get(1)?,
            role_title: row.get(2)?,
            job_family: row.get(3)?,
            tier: row.get(4)?,
            stage: row.get(5)?,
            source: row.get(6)?,
            salary_range: row.get(7)?,
            jd_url: row.get(8)?,
            jd_raw: row.get(9)?,
            jd_keywords: row.get(10)?,
            fit_score: row.get(11)?,
            ai_fit_summary: row.get(12)?,
            next_action: row.get(13)?,
            next_action_date: row.get(14)?,
            date_applied: row.get(15)?,
            date_closed: row.get(16)?,
            notes: row.get(17)?,
            created_at: row.get(18)?,
            updated_at: row.get(19)?,
        })
    }

    // --- Contact operations ---

    pub fn create_contact(&self, new: &NewContact) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO contacts
               (opportunity_id, full_name, title, company, linkedin_url, email, contact_type, notes,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                new.opportunity_id,
                new.full_name,
                new.title,
                new.company,
                new.linkedin_url,
                new.email,
                new.contact_type.map(|t| t.as_str()),
                new.notes,
                self.timestamp(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_contact(&self, id: i64) -> Result<Option<Contact>> {
        let result = self.conn.query_row(
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
            [id],
            Self::row_to_contact,
        );
        match result {
            Ok(contact) => Ok(Some(contact)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_contacts(&self, filter: &ContactFilter) -> Result<Vec<Contact>> {
        let mut sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE 1=1");
        let mut params: Vec<Box<dyn ToSql>> = vec![];

        if let Some(opp_id) = filter.opportunity_id {
            params.push(Box::new(opp_id));
            sql.push_str(&format!(" AND opportunity_id = ?{}", params.len()));
        }
        if let Some(status) = filter.response_status {
            params.push(Box::new(status.as_str()));
            sql.push_str(&format!(" AND response_status = ?{}", params.len()));
        }

        sql.push_str(" ORDER BY created_at DESC, id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params.iter()), Self::row_to_contact)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list contacts")
    }

    pub fn update_contact(&self, id: i64, update: &ContactUpdate) -> Result<()> {
        let mut sets: Vec<String> = vec![];
        let mut params: Vec<Box<dyn ToSql>> = vec![];
        let mut set = |column: &str, value: Box<dyn ToSql>| {
            params.push(value);
            sets.push(format!("{column} = ?{}", params.len()));
        };

        if let Some(v) = &update.outreach_day0 {
            set("outreach_day0", Box::new(v.clone()));
        }
        if let Some(v) = &update.outreach_day3 {
            set("outreach_day3", Box::new(v.clone()));
        }
        if let Some(v) = &update.outreach_day7 {
            set("outreach_day7", Box::new(v.clone()));
        }
        if let Some(v) = update.response_status {
            set("response_status", Box::new(v.as_str()));
        }
        if let Some(v) = update.call_completed {
            set("call_completed", Box::new(v));
        }
        if let Some(v) = update.referral_asked {
            set("referral_asked", Box::new(v));
        }
        if let Some(v) = update.referral_given {
            set("referral_given", Box::new(v));
        }
        if let Some(v) = &update.notes {
            set("notes", Box::new(v.clone()));
        }

        set("updated_at", Box::new(self.timestamp()));
        params.push(Box::new(id));
        let sql = format!(
            "UPDATE contacts SET {} WHERE id = ?{}",
            sets.join(", "),
            params.len()
        );

        let changed = self.conn.execute(&sql, params_from_iter(params.iter()))?;
        if changed == 0 {
            return Err(anyhow!("Contact #{} not found", id));
        }
        Ok(())
    }

    fn row_to_contact(row: &rusqlite::Row) -> rusqlite::Result<Contact> {
        let contact_type: Option<String> = row.get(7)?;
        Ok(Contact {
            id: row.get(0)?,
            opportunity_id: row.get(1)?,
            full_name: row.get(2)?,
            title: row.get(3)?,
            company: row.get(4)?,
            linkedin_url: row.get(5)?,
            email: row.get(6)?,
            contact_type: contact_type.map(|t| parse_column(7, &t)).transpose()?,
            outreach_day0: row.get(8)?,
            outreach_day3: row.get(9)?,
            outreach_day7: row.get(10)?,
            response_status: parse_column(11, &row.get::<_, String>(11)?)?,
            call_completed: row.get(12)?,
            referral_asked: row.get(13)?,
            referral_given: row.get(14)?,
            notes: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    // --- Activity log (append-only) ---

    pub fn log_activity(&self, entry: &NewActivity) -> Result<i64> {
        let metadata = entry.metadata.as_ref().map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT INTO activity_log
               (opportunity_id, contact_id, activity_type, description, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.opportunity_id,
                entry.contact_id,
                entry.activity_type.as_str(),
                entry.description,
                metadata,
                self.timestamp(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Newest first.
    pub fn get_activity_log(&self, opportunity_id: Option<i64>, limit: usize) -> Result<Vec<ActivityLog>> {
        let base = "SELECT id, opportunity_id, contact_id, activity_type, description, metadata, created_at
                    FROM activity_log";
        let mut stmt;
        let rows = if let Some(opp_id) = opportunity_id {
            stmt = self.conn.prepare(&format!(
                "{base} WHERE opportunity_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2"
            ))?;
            stmt.query_map(params![opp_id, limit as i64], Self::row_to_activity)?
        } else {
            stmt = self.conn.prepare(&format!("{base} ORDER BY created_at DESC, id DESC LIMIT ?1"))?;
            stmt.query_map(params![limit as i64], Self::row_to_activity)?
        };

        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to read activity log")
    }

    fn row_to_activity(row: &rusqlite::Row) -> rusqlite::Result<ActivityLog> {
        let metadata: Option<String> = row.get(5)?;
        Ok(ActivityLog {
            id: row.get(0)?,
            opportunity_id: row.get(1)?,
            contact_id: row.get(2)?,
            activity_type: parse_column(3, &row.get::<_, String>(3)?)?,
            description: row.get(4)?,
            metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
            created_at: row.get(6)?,
        })
    }

    #[cfg(test)]
    pub fn set_updated_at(&self, id: i64, updated_at: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE opportunities SET updated_at = ?1 WHERE id = ?2",
            params![updated_at, id],
        )?;
        Ok(())
    }
}

fn parse_column<T>(idx: usize, value: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    value
        .parse()
        .map_err(|e: anyhow::Error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

impl PipelineStore for Database {
    fn get_opportunity(&self, id: i64) -> Result<Option<Opportunity>> {
        Database::get_opportunity(self, id)
    }

    fn update_opportunity(&self, id: i64, update: &OpportunityUpdate) -> Result<()> {
        Database::update_opportunity(self, id, update)
    }

    fn list_opportunities(&self, filter: &OpportunityFilter) -> Result<Vec<Opportunity>> {
        Database::list_opportunities(self, filter)
    }

    fn get_contact(&self, id: i64) -> Result<Option<Contact>> {
        Database::get_contact(self, id)
    }

    fn list_contacts(&self, filter: &ContactFilter) -> Result<Vec<Contact>> {
        Database::list_contacts(self, filter)
    }

    fn update_contact(&self, id: i64, update: &ContactUpdate) -> Result<()> {
        Database::update_contact(self, id, update)
    }

    fn log_activity(&self, entry: &NewActivity) -> Result<i64> {
        Database::log_activity(self, entry)
    }

    fn atomically(&self, work: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        self.in_transaction(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{ActivityType, ContactType, ResponseStatus};
    use chrono::{Duration, NaiveDate};

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        db
    }

    fn new_opp(company: &str) -> NewOpportunity {
        NewOpportunity {
            company: company.to_string(),
            role_title: "Data Manager".to_string(),
            stage: "Prospect".to_string(),
            jd_url: Some(format!("https://jobs.example.com/{}", company.to_lowercase())),
            jd_keywords: vec!["SQL".into(), "Looker".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        let db = test_db();
        db.init().unwrap();
        db.ensure_initialized().unwrap();
    }

    #[test]
    fn test_uninitialized_database_is_reported() {
        let db = Database::open_in_memory().unwrap();
        let err = db.ensure_initialized().unwrap_err();
        assert!(err.to_string().contains("jobops init"));
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jobops.db");
        let db = Database::open(&path).unwrap();
        db.init().unwrap();
        assert!(path.exists());
        assert_eq!(db.path(), &path);
    }

    #[test]
    fn test_opportunity_roundtrip_and_filters() {
        let db = test_db();
        let acme = db.create_opportunity(&NewOpportunity { tier: Some(1), ..new_opp("Acme") }).unwrap();
        let globex = db
            .create_opportunity(&NewOpportunity { job_family: Some("B".into()), ..new_opp("Globex") })
            .unwrap();

        let opp = db.get_opportunity(acme).unwrap().unwrap();
        assert_eq!(opp.company, "Acme");
        assert_eq!(opp.keywords(), vec!["SQL", "Looker"]);
        assert!(!opp.created_at.is_empty());

        let tier1 = db.list_opportunities(&OpportunityFilter { tier: Some(1), ..Default::default() }).unwrap();
        assert_eq!(tier1.len(), 1);
        let family_b = db
            .list_opportunities(&OpportunityFilter { job_family: Some("B".into()), ..Default::default() })
            .unwrap();
        assert_eq!(family_b[0].id, globex);

        db.update_opportunity(globex, &OpportunityUpdate { stage: Some("Closed".into()), ..Default::default() })
            .unwrap();
        let open = db
            .list_opportunities(&OpportunityFilter { exclude_stage: Some("Closed".into()), ..Default::default() })
            .unwrap();
        assert_eq!(open.iter().map(|o| o.id).collect::<Vec<_>>(), vec![acme]);
        let closed = db
            .list_opportunities(&OpportunityFilter { stage: Some("Closed".into()), ..Default::default() })
            .unwrap();
        assert_eq!(closed.len(), 1);
    }

    #[test]
    fn test_update_opportunity_touches_updated_at_and_only_given_fields() {
        let db = test_db();
        let id = db.create_opportunity(&new_opp("Acme")).unwrap();
        db.set_updated_at(id, "2020-01-01 00:00:00").unwrap();

        db.update_opportunity(id, &OpportunityUpdate { fit_score: Some(8.0), ..Default::default() })
            .unwrap();

        let opp = db.get_opportunity(id).unwrap().unwrap();
        assert_eq!(opp.fit_score, Some(8.0));
        assert_eq!(opp.stage, "Prospect");
        assert_ne!(opp.updated_at, "2020-01-01 00:00:00");
    }

    #[test]
    fn test_update_missing_rows_fail() {
        let db = test_db();
        assert!(db.update_opportunity(42, &OpportunityUpdate::default()).is_err());
        assert!(db.update_contact(42, &ContactUpdate::default()).is_err());
    }

    #[test]
    fn test_url_exists() {
        let db = test_db();
        db.create_opportunity(&new_opp("Acme")).unwrap();
        assert!(db.url_exists("https://jobs.example.com/acme").unwrap());
        assert!(!db.url_exists("https://jobs.example.com/globex").unwrap());
    }

    #[test]
    fn test_timestamps_follow_injected_clock() {
        let at = NaiveDate::from_ymd_opt(2031, 5, 4).unwrap().and_hms_opt(9, 15, 0).unwrap();
        let clock = Arc::new(ManualClock::new(at));
        let db = test_db().with_clock(clock.clone());

        let id = db.create_opportunity(&new_opp("Acme")).unwrap();
        let opp = db.get_opportunity(id).unwrap().unwrap();
        assert_eq!(opp.created_at, "2031-05-04 09:15:00");
        assert_eq!(opp.updated_at, "2031-05-04 09:15:00");

        clock.advance(Duration::days(2));
        db.update_opportunity(id, &OpportunityUpdate { notes: Some("x".into()), ..Default::default() })
            .unwrap();
        let opp = db.get_opportunity(id).unwrap().unwrap();
        assert_eq!(opp.created_at, "2031-05-04 09:15:00");
        assert_eq!(opp.updated_at, "2031-05-06 09:15:00");

        let contact = db.create_contact(&NewContact { full_name: "Dana".into(), ..Default::default() }).unwrap();
        assert_eq!(db.get_contact(contact).unwrap().unwrap().created_at, "2031-05-06 09:15:00");
        db.log_activity(&NewActivity::new(ActivityType::NoteAdded, "hi").opportunity(Some(id))).unwrap();
        assert_eq!(db.get_activity_log(Some(id), 1).unwrap()[0].created_at, "2031-05-06 09:15:00");
    }

    #[test]
    fn test_update_can_clear_date_closed() {
        let db = test_db();
        let id = db.create_opportunity(&new_opp("Acme")).unwrap();
        db.update_opportunity(id, &OpportunityUpdate { date_closed: Some(Some("2026-01-02".into())), ..Default::default() })
            .unwrap();
        assert_eq!(db.get_opportunity(id).unwrap().unwrap().date_closed.as_deref(), Some("2026-01-02"));

        db.update_opportunity(id, &OpportunityUpdate { date_closed: Some(None), ..Default::default() })
            .unwrap();
        assert_eq!(db.get_opportunity(id).unwrap().unwrap().date_closed, None);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let db = test_db();
        let id = db.create_opportunity(&new_opp("Acme")).unwrap();

        let result: Result<()> = db.in_transaction(|| {
            db.update_opportunity(id, &OpportunityUpdate { stage: Some("Applied".into()), ..Default::default() })?;
            db.log_activity(&NewActivity::new(ActivityType::StageChange, "moved").opportunity(Some(id)))?;
            Err(anyhow!("log sink unavailable"))
        });

        assert!(result.is_err());
        assert_eq!(db.get_opportunity(id).unwrap().unwrap().stage, "Prospect");
        assert!(db.get_activity_log(Some(id), 10).unwrap().is_empty());

        db.in_transaction(|| {
            db.update_opportunity(id, &OpportunityUpdate { stage: Some("Applied".into()), ..Default::default() })
        })
        .unwrap();
        assert_eq!(db.get_opportunity(id).unwrap().unwrap().stage, "Applied");
    }

    #[test]
    fn test_contact_roundtrip() {
        let db = test_db();
        let opp = db.create_opportunity(&new_opp("Acme")).unwrap();
        let id = db
            .create_contact(&NewContact {
                opportunity_id: Some(opp),
                full_name: "Dana Reyes".into(),
                contact_type: Some(ContactType::HiringManager),
                ..Default::default()
            })
            .unwrap();

        let contact = db.get_contact(id).unwrap().unwrap();
        assert_eq!(contact.response_status, ResponseStatus::Pending);
        assert_eq!(contact.contact_type, Some(ContactType::HiringManager));
        assert!(!contact.call_completed);

        db.update_contact(
            id,
            &ContactUpdate {
                outreach_day0: Some("2025-01-02".into()),
                response_status: Some(ResponseStatus::MeetingScheduled),
                referral_asked: Some(true),
                ..Default::default()
            },
        )
        .unwrap();

        let contact = db.get_contact(id).unwrap().unwrap();
        assert_eq!(contact.outreach_day0.as_deref(), Some("2025-01-02"));
        assert_eq!(contact.response_status, ResponseStatus::MeetingScheduled);
        assert!(contact.referral_asked);

        let pending = db
            .list_contacts(&ContactFilter { response_status: Some(ResponseStatus::Pending), ..Default::default() })
            .unwrap();
        assert!(pending.is_empty());
        let for_opp = db
            .list_contacts(&ContactFilter { opportunity_id: Some(opp), ..Default::default() })
            .unwrap();
        assert_eq!(for_opp.len(), 1);
    }

    #[test]
    fn test_activity_log_is_newest_first_with_metadata() {
        let db = test_db();
        let opp = db.create_opportunity(&new_opp("Acme")).unwrap();
        db.log_activity(&NewActivity::new(ActivityType::NoteAdded, "first").opportunity(Some(opp)))
            .unwrap();
        db.log_activity(
            &NewActivity::new(ActivityType::AiAction, "second")
                .opportunity(Some(opp))
                .metadata(serde_json::json!({ "action": "score_fit" })),
        )
        .unwrap();
        db.log_activity(&NewActivity::new(ActivityType::NoteAdded, "unrelated")).unwrap();

        let log = db.get_activity_log(Some(opp), 10).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].description.as_deref(), Some("second"));
        assert_eq!(log[0].activity_type, ActivityType::AiAction);
        assert_eq!(log[0].metadata.as_ref().unwrap()["action"], "score_fit");

        assert_eq!(db.get_activity_log(None, 10).unwrap().len(), 3);
        assert_eq!(db.get_activity_log(None, 1).unwrap().len(), 1);
    }
}
