//! Job identity, meeting address, and the recording lifecycle state machine.
//!
//! A `Job` is one meeting-recording request. It is owned by the orchestrator
//! and mutated only through `advance`, which rejects transitions the state
//! machine does not allow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use super::error::EngineError;

/// Unique identifier for a recording job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where to join, and as whom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingAddress {
    pub url: String,
    pub password: Option<String>,
    pub display_name: Option<String>,
}

impl MeetingAddress {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            password: None,
            display_name: None,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn with_display_name(mut self, name: Option<String>) -> Self {
        self.display_name = name;
        self
    }

    /// Numeric meeting id from a `/j/<digits>` style URL, if present.
    pub fn meeting_id(&self) -> Option<String> {
        let re = regex::Regex::new(r"/j/(\d+)").ok()?;
        re.captures(&self.url)
            .map(|caps| caps[1].to_string())
    }

    /// Rewrite a standard join URL to the web-client form, which avoids the
    /// native-app handoff prompt. URLs without a `/j/<id>` segment pass
    /// through unchanged.
    pub fn web_client_url(&self) -> String {
        let Some(id) = self.meeting_id() else {
            return self.url.clone();
        };
        let base = match self.url.split("/j/").next() {
            Some(b) if !b.is_empty() => b.to_string(),
            _ => return self.url.clone(),
        };
        let pwd = regex::Regex::new(r"pwd=([^&]+)")
            .ok()
            .and_then(|re| re.captures(&self.url).map(|c| c[1].to_string()));
        match pwd {
            Some(p) => format!("{}/wc/join/{}?pwd={}", base, id, p),
            None => format!("{}/wc/join/{}", base, id),
        }
    }
}

/// Lifecycle state of a recording job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Joining,
    Recording,
    Stopping,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Joining => "joining",
            Self::Recording => "recording",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "joining" => Some(Self::Joining),
            "recording" => Some(Self::Recording),
            "stopping" => Some(Self::Stopping),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Joining)
                | (Joining, Recording)
                | (Recording, Stopping)
                | (Stopping, Completed)
                | (Queued, Failed)
                | (Joining, Failed)
                | (Recording, Failed)
                | (Stopping, Failed)
                | (Queued, Cancelled)
                | (Joining, Cancelled)
                | (Recording, Cancelled)
                | (Stopping, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One meeting-recording request and its full lifecycle.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub address: MeetingAddress,
    pub state: JobState,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output_path: Option<PathBuf>,
    pub failure_reason: Option<String>,
    /// Set when the capture process had to be force-killed during finalize;
    /// the artifact is retained but may be truncated.
    pub degraded: bool,
    pub retry_count: u32,
}

impl Job {
    pub fn new(address: MeetingAddress) -> Self {
        Self {
            id: JobId::new(),
            address,
            state: JobState::Queued,
            requested_at: Utc::now(),
            started_at: None,
            ended_at: None,
            output_path: None,
            failure_reason: None,
            degraded: false,
            retry_count: 0,
        }
    }

    /// Move to `next`, stamping timestamps. Invalid transitions are rejected.
    pub fn advance(&mut self, next: JobState) -> Result<(), EngineError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        if next == JobState::Recording {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        self.state = next;
        Ok(())
    }

    /// Record a failure reason and move to FAILED.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), EngineError> {
        self.failure_reason = Some(reason.into());
        self.advance(JobState::Failed)
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            url: self.address.url.clone(),
            display_name: self.address.display_name.clone(),
            state: self.state,
            requested_at: self.requested_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            output_path: self.output_path.clone(),
            failure_reason: self.failure_reason.clone(),
            degraded: self.degraded,
        }
    }
}

/// Read-only snapshot of a job, served to API/CLI callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub url: String,
    pub display_name: Option<String>,
    pub state: JobState,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output_path: Option<PathBuf>,
    pub failure_reason: Option<String>,
    pub degraded: bool,
}

impl JobView {
    pub fn duration_seconds(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_seconds().max(0)),
            (Some(start), None) => Some((Utc::now() - start).num_seconds().max(0)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            JobState::Queued,
            JobState::Joining,
            JobState::Recording,
            JobState::Stopping,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("bogus"), None);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = Job::new(MeetingAddress::new("https://zoom.us/j/111"));
        assert_eq!(job.state, JobState::Queued);

        job.advance(JobState::Joining).unwrap();
        job.advance(JobState::Recording).unwrap();
        assert!(job.started_at.is_some());
        job.advance(JobState::Stopping).unwrap();
        job.advance(JobState::Completed).unwrap();
        assert!(job.ended_at.is_some());
        assert!(job.state.is_terminal());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut job = Job::new(MeetingAddress::new("https://zoom.us/j/111"));
        // Cannot skip JOINING
        assert!(job.advance(JobState::Recording).is_err());
        // Cannot complete from QUEUED
        assert!(job.advance(JobState::Completed).is_err());

        job.advance(JobState::Joining).unwrap();
        job.fail("join timed out").unwrap();
        // Terminal states accept nothing further
        assert!(job.advance(JobState::Joining).is_err());
        assert!(job.advance(JobState::Cancelled).is_err());
    }

    #[test]
    fn test_cancel_reachable_from_all_non_terminal() {
        for intermediate in [
            JobState::Queued,
            JobState::Joining,
            JobState::Recording,
            JobState::Stopping,
        ] {
            assert!(intermediate.can_transition_to(JobState::Cancelled));
        }
        assert!(!JobState::Completed.can_transition_to(JobState::Cancelled));
    }

    #[test]
    fn test_meeting_id_extraction() {
        let addr = MeetingAddress::new("https://us06web.zoom.us/j/88112233445?pwd=abc123");
        assert_eq!(addr.meeting_id(), Some("88112233445".to_string()));

        let no_id = MeetingAddress::new("https://example.com/room/alpha");
        assert_eq!(no_id.meeting_id(), None);
    }

    #[test]
    fn test_web_client_url_rewrite() {
        let addr = MeetingAddress::new("https://us06web.zoom.us/j/123456?pwd=s3cret");
        assert_eq!(
            addr.web_client_url(),
            "https://us06web.zoom.us/wc/join/123456?pwd=s3cret"
        );

        let plain = MeetingAddress::new("https://us06web.zoom.us/j/123456");
        assert_eq!(
            plain.web_client_url(),
            "https://us06web.zoom.us/wc/join/123456"
        );

        let other = MeetingAddress::new("https://example.com/room/alpha");
        assert_eq!(other.web_client_url(), other.url);
    }

    #[test]
    fn test_view_duration() {
        let mut job = Job::new(MeetingAddress::new("https://zoom.us/j/1"));
        job.advance(JobState::Joining).unwrap();
        job.advance(JobState::Recording).unwrap();
        job.advance(JobState::Stopping).unwrap();
        job.advance(JobState::Completed).unwrap();

        let view = job.view();
        assert!(view.duration_seconds().unwrap() >= 0);
    }
}
