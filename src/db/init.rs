use anyhow::{Context, Result};
use rusqlite::Connection;

pub fn init_db() -> Result<Connection> {
    let db_path = crate::global::db_file()?;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let conn = Connection::open(&db_path).context("Failed to open database connection")?;

    migrate(&conn)?;

    Ok(conn)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            meeting_url TEXT NOT NULL,
            meeting_password TEXT,
            display_name TEXT,
            state TEXT NOT NULL DEFAULT 'queued',
            requested_at TEXT NOT NULL,
            started_at TEXT,
            ended_at TEXT,
            output_path TEXT,
            failure_reason TEXT,
            degraded INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )
    .context("Failed to create jobs table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_requested_at ON jobs(requested_at DESC)",
        [],
    )
    .context("Failed to create jobs requested_at index")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state)",
        [],
    )
    .context("Failed to create jobs state index")?;

    // Append-only transition log, for auditing a job's persisted state path.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS job_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT NOT NULL,
            state TEXT NOT NULL,
            at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )
    .context("Failed to create job_events table")?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_job_events_job_id ON job_events(job_id, id)",
        [],
    )
    .context("Failed to create job_events index")?;

    Ok(())
}
