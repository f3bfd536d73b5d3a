//! SQLite-backed job store.
//!
//! Upserts keep one row per job at its latest state; `job_events` keeps the
//! append-only transition history behind it.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{init, JobFilter, JobStore};
use crate::engine::job::{Job, JobId, JobState, MeetingAddress};

pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open (and migrate) the store at the default data-dir location.
    pub fn open() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(init::init_db()?),
        })
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path).context("Failed to open database connection")?;
        init::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persisted state history for one job, oldest first.
    pub fn events(&self, id: JobId) -> Result<Vec<JobState>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT state FROM job_events WHERE job_id = ?1 ORDER BY id ASC")
            .context("Failed to prepare job_events query")?;
        let rows = stmt
            .query_map(params![id.to_string()], |row| row.get::<_, String>(0))
            .context("Failed to query job_events")?;

        let mut states = Vec::new();
        for row in rows {
            let raw = row?;
            states.push(
                JobState::parse(&raw).ok_or_else(|| anyhow!("unknown persisted state: {}", raw))?,
            );
        }
        Ok(states)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("job store connection poisoned"))
    }

    fn row_to_job(row: &Row<'_>) -> rusqlite::Result<RawJob> {
        Ok(RawJob {
            id: row.get(0)?,
            meeting_url: row.get(1)?,
            meeting_password: row.get(2)?,
            display_name: row.get(3)?,
            state: row.get(4)?,
            requested_at: row.get(5)?,
            started_at: row.get(6)?,
            ended_at: row.get(7)?,
            output_path: row.get(8)?,
            failure_reason: row.get(9)?,
            degraded: row.get(10)?,
            retry_count: row.get(11)?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, meeting_url, meeting_password, display_name, state, \
     requested_at, started_at, ended_at, output_path, failure_reason, degraded, retry_count";

struct RawJob {
    id: String,
    meeting_url: String,
    meeting_password: Option<String>,
    display_name: Option<String>,
    state: String,
    requested_at: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    output_path: Option<String>,
    failure_reason: Option<String>,
    degraded: bool,
    retry_count: u32,
}

impl RawJob {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId::parse(&self.id).ok_or_else(|| anyhow!("bad job id: {}", self.id))?,
            address: MeetingAddress::new(self.meeting_url)
                .with_password(self.meeting_password)
                .with_display_name(self.display_name),
            state: JobState::parse(&self.state)
                .ok_or_else(|| anyhow!("unknown persisted state: {}", self.state))?,
            requested_at: parse_ts(&self.requested_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            ended_at: self.ended_at.as_deref().map(parse_ts).transpose()?,
            output_path: self.output_path.map(PathBuf::from),
            failure_reason: self.failure_reason,
            degraded: self.degraded,
            retry_count: self.retry_count,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("bad timestamp: {}", s))
}

impl JobStore for SqliteJobStore {
    fn save(&self, job: &Job) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO jobs (id, meeting_url, meeting_password, display_name, state, \
             requested_at, started_at, ended_at, output_path, failure_reason, degraded, retry_count) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
             ON CONFLICT(id) DO UPDATE SET \
             state = excluded.state, started_at = excluded.started_at, \
             ended_at = excluded.ended_at, output_path = excluded.output_path, \
             failure_reason = excluded.failure_reason, degraded = excluded.degraded, \
             retry_count = excluded.retry_count",
            params![
                job.id.to_string(),
                job.address.url,
                job.address.password,
                job.address.display_name,
                job.state.as_str(),
                job.requested_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.ended_at.map(|t| t.to_rfc3339()),
                job.output_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                job.failure_reason,
                job.degraded,
                job.retry_count,
            ],
        )
        .context("Failed to save job")?;

        conn.execute(
            "INSERT INTO job_events (job_id, state) VALUES (?1, ?2)",
            params![job.id.to_string(), job.state.as_str()],
        )
        .context("Failed to append job event")?;

        Ok(())
    }

    fn load(&self, id: JobId) -> Result<Option<Job>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM jobs WHERE id = ?1",
                SELECT_COLUMNS
            ))
            .context("Failed to prepare job query")?;

        let mut rows = stmt
            .query_map(params![id.to_string()], Self::row_to_job)
            .context("Failed to query job")?;

        match rows.next() {
            Some(raw) => Ok(Some(raw?.into_job()?)),
            None => Ok(None),
        }
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let conn = self.lock()?;
        let mut sql = format!("SELECT {} FROM jobs WHERE 1=1", SELECT_COLUMNS);
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(search) = &filter.search {
            sql.push_str(&format!(" AND meeting_url LIKE ?{}", args.len() + 1));
            args.push(Box::new(format!("%{}%", search)));
        }
        if let Some(state) = filter.state {
            sql.push_str(&format!(" AND state = ?{}", args.len() + 1));
            args.push(Box::new(state.as_str().to_string()));
        }
        sql.push_str(&format!(
            " ORDER BY requested_at DESC, id DESC LIMIT ?{}",
            args.len() + 1
        ));
        args.push(Box::new(filter.limit as i64));

        let mut stmt = conn.prepare(&sql).context("Failed to prepare jobs list")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), Self::row_to_job)
            .context("Failed to list jobs")?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_job()?);
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteJobStore {
        SqliteJobStore::in_memory().unwrap()
    }

    fn job(url: &str) -> Job {
        Job::new(MeetingAddress::new(url).with_display_name(Some("Bot".into())))
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let store = store();
        let mut job = job("https://zoom.us/j/111?pwd=abc");
        job.address.password = Some("abc".into());
        store.save(&job).unwrap();

        let loaded = store.load(job.id).unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.address.url, job.address.url);
        assert_eq!(loaded.address.password, Some("abc".to_string()));
        assert_eq!(loaded.state, JobState::Queued);
        assert_eq!(loaded.requested_at.timestamp(), job.requested_at.timestamp());
    }

    #[test]
    fn test_load_unknown_is_none() {
        assert!(store().load(JobId::new()).unwrap().is_none());
    }

    #[test]
    fn test_save_is_upsert_and_events_accumulate() {
        let store = store();
        let mut j = job("https://zoom.us/j/222");
        store.save(&j).unwrap();

        j.advance(JobState::Joining).unwrap();
        store.save(&j).unwrap();
        j.advance(JobState::Recording).unwrap();
        j.output_path = Some(PathBuf::from("/tmp/rec.mp4"));
        store.save(&j).unwrap();

        let loaded = store.load(j.id).unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Recording);
        assert_eq!(loaded.output_path, Some(PathBuf::from("/tmp/rec.mp4")));

        assert_eq!(
            store.events(j.id).unwrap(),
            vec![JobState::Queued, JobState::Joining, JobState::Recording]
        );
    }

    #[test]
    fn test_list_ordering_and_search() {
        let store = store();
        let mut a = job("https://zoom.us/j/111");
        let mut b = job("https://zoom.us/j/222");
        // Force distinct, ordered request times.
        a.requested_at = Utc::now() - chrono::Duration::seconds(60);
        b.requested_at = Utc::now();
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        let all = store.list(&JobFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, b.id, "newest first");

        let hits = store.list(&JobFilter::search("111")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, a.id);
    }

    #[test]
    fn test_list_state_filter_and_limit() {
        let store = store();
        for i in 0..5 {
            let mut j = job(&format!("https://zoom.us/j/{}", i));
            if i % 2 == 0 {
                j.advance(JobState::Joining).unwrap();
                j.fail("boom").unwrap();
            }
            store.save(&j).unwrap();
        }

        let failed = store
            .list(&JobFilter {
                state: Some(JobState::Failed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failed.len(), 3);
        assert!(failed.iter().all(|j| j.failure_reason.is_some()));

        let limited = store
            .list(&JobFilter {
                limit: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 2);
    }
}
