//! Job metadata persistence.
//!
//! The engine writes every state transition through the narrow `JobStore`
//! interface; the backing store is opaque to it. Raw SQL with rusqlite, no
//! ORM.

pub mod init;
pub mod jobs;
pub mod memory;

pub use init::{init_db, migrate};
pub use jobs::SqliteJobStore;
pub use memory::MemoryJobStore;

use anyhow::Result;

use crate::engine::job::{Job, JobId, JobState};

/// Filter for listing jobs. Matches are ordered requested-at descending.
#[derive(Debug, Clone)]
pub struct JobFilter {
    /// Substring match on the meeting URL.
    pub search: Option<String>,
    pub state: Option<JobState>,
    pub limit: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            search: None,
            state: None,
            limit: 50,
        }
    }
}

impl JobFilter {
    pub fn search(query: impl Into<String>) -> Self {
        Self {
            search: Some(query.into()),
            ..Self::default()
        }
    }
}

/// Narrow repository interface the engine persists through. Must provide
/// read-your-writes consistency for a single job id.
pub trait JobStore: Send + Sync {
    /// Upsert the job's current state.
    fn save(&self, job: &Job) -> Result<()>;

    fn load(&self, id: JobId) -> Result<Option<Job>>;

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;
}
