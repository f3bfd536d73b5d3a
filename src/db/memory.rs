//! In-memory job store for tests and ephemeral runs.
//!
//! Also records the full state history per job so tests can replay a job's
//! persisted path through the state machine.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{JobFilter, JobStore};
use crate::engine::job::{Job, JobId, JobState};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
    history: Mutex<HashMap<JobId, Vec<JobState>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every state ever saved for this job, oldest first.
    pub fn state_history(&self, id: JobId) -> Vec<JobState> {
        self.history
            .lock()
            .expect("history poisoned")
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

impl JobStore for MemoryJobStore {
    fn save(&self, job: &Job) -> Result<()> {
        self.jobs
            .lock()
            .expect("jobs poisoned")
            .insert(job.id, job.clone());
        self.history
            .lock()
            .expect("history poisoned")
            .entry(job.id)
            .or_default()
            .push(job.state);
        Ok(())
    }

    fn load(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.lock().expect("jobs poisoned").get(&id).cloned())
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().expect("jobs poisoned");
        let mut matches: Vec<Job> = jobs
            .values()
            .filter(|j| {
                filter
                    .search
                    .as_ref()
                    .map(|q| j.address.url.contains(q.as_str()))
                    .unwrap_or(true)
                    && filter.state.map(|s| j.state == s).unwrap_or(true)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        matches.truncate(filter.limit);
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::job::MeetingAddress;

    #[test]
    fn test_history_tracks_every_save() {
        let store = MemoryJobStore::new();
        let mut job = Job::new(MeetingAddress::new("https://zoom.us/j/1"));
        store.save(&job).unwrap();
        job.advance(JobState::Joining).unwrap();
        store.save(&job).unwrap();

        assert_eq!(
            store.state_history(job.id),
            vec![JobState::Queued, JobState::Joining]
        );
        assert_eq!(store.load(job.id).unwrap().unwrap().state, JobState::Joining);
    }

    #[test]
    fn test_search_filters_by_url_substring() {
        let store = MemoryJobStore::new();
        store
            .save(&Job::new(MeetingAddress::new("https://zoom.us/j/111")))
            .unwrap();
        store
            .save(&Job::new(MeetingAddress::new("https://zoom.us/j/222")))
            .unwrap();

        assert_eq!(store.list(&JobFilter::search("222")).unwrap().len(), 1);
        assert_eq!(store.list(&JobFilter::default()).unwrap().len(), 2);
    }
}
