//! CSV dump of every opportunity, closed ones included.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::clock::format_date;
use crate::db::Database;
use crate::models::{Opportunity, OpportunityFilter};

pub fn default_export_path(today: NaiveDate) -> PathBuf {
    PathBuf::from(format!("jobsearch_export_{}.csv", format_date(today)))
}

/// One header row named after the opportunity fields, then one row each.
pub fn write_csv<W: Write>(out: W, opps: &[Opportunity]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    for opp in opps {
        writer.serialize(opp)?;
    }
    writer.flush()?;
    Ok(())
}

/// Returns how many rows were written. An empty store creates no file.
pub fn export_opportunities(db: &Database, path: &Path) -> Result<usize> {
    let opps = db.list_opportunities(&OpportunityFilter::default())?;
    if opps.is_empty() {
        return Ok(0);
    }

    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    write_csv(file, &opps).with_context(|| format!("Failed to write {}", path.display()))?;
    info!(rows = opps.len(), path = %path.display(), "exported opportunities");
    Ok(opps.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::stages::{StageVocabulary, CLOSED};
    use crate::workflow::tests::{make_opp, test_db};
    use crate::workflow::Workflow;

    #[test]
    fn test_default_export_path_is_dated() {
        let today = NaiveDate::from_ymd_opt(2026, 4, 9).unwrap();
        assert_eq!(default_export_path(today), PathBuf::from("jobsearch_export_2026-04-09.csv"));
    }

    #[test]
    fn test_export_includes_closed_and_blank_optionals() {
        let db = test_db();
        let stages = StageVocabulary::standard();
        let clock = ManualClock::at_system_now();
        let wf = Workflow::new(&db, &stages, &clock);
        let open = make_opp(&db, "Acme, Inc", Some(1));
        let closed = make_opp(&db, "Beta", None);
        wf.advance_stage(closed, CLOSED, None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.csv");
        assert_eq!(export_opportunities(&db, &path).unwrap(), 2);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "id");
        assert!(headers.iter().any(|h| h == "date_closed"));
        let company = headers.iter().position(|h| h == "company").unwrap();
        let tier = headers.iter().position(|h| h == "tier").unwrap();
        let date_closed = headers.iter().position(|h| h == "date_closed").unwrap();

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        let acme = rows.iter().find(|r| r[0] == open.to_string()).unwrap();
        assert_eq!(&acme[company], "Acme, Inc");
        assert_eq!(&acme[tier], "1");
        assert_eq!(&acme[date_closed], "");
        let beta = rows.iter().find(|r| r[0] == closed.to_string()).unwrap();
        assert_eq!(&beta[date_closed], format_date(clock.today()));
    }

    #[test]
    fn test_empty_store_writes_nothing() {
        let db = test_db();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.csv");
        assert_eq!(export_opportunities(&db, &path).unwrap(), 0);
        assert!(!path.exists());
    }
}
