//! The recording orchestration engine.
//!
//! Turns a meeting-join request into a supervised, isolated, concurrently
//! running capture job: admission control, per-job state machine, join and
//! capture sessions, and the fixed-size isolation pool they record on.

pub mod capture;
pub mod error;
pub mod isolation;
pub mod job;
pub mod join;
pub mod orchestrator;

pub use capture::{CaptureSession, FinalizeResult};
pub use error::EngineError;
pub use isolation::{IsolationPool, IsolationUnit, UnitLease};
pub use job::{Job, JobId, JobState, JobView, MeetingAddress};
pub use join::{EndWatch, JoinOutcome, JoinSession};
pub use orchestrator::{EngineConfig, Orchestrator};
