//! Engine error taxonomy.
//!
//! Failures that cross the job boundary are folded into a terminal FAILED
//! state with a human-readable reason; these variants are the vocabulary for
//! those reasons and for the orchestrator's synchronous refusals.

use std::time::Duration;
use thiserror::Error;

use super::job::{JobId, JobState};
use crate::drivers::DriverError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The non-terminal job count reached the queue bound. Jobs inside the
    /// bound queue for a concurrency permit instead of being refused.
    #[error("recording queue is full ({0} jobs pending)")]
    CapacityExceeded(usize),

    #[error("unknown job {0}")]
    NotFound(JobId),

    #[error("join did not complete within {}s", .0.as_secs())]
    JoinTimeout(Duration),

    #[error("join authentication required")]
    JoinAuthRequired,

    #[error("waiting room admission timed out")]
    JoinWaitingRoomTimeout,

    #[error("capture failed to start: {0}")]
    CaptureStart(String),

    #[error("capture finalize failed: {0}")]
    CaptureFinalize(String),

    /// A phase overran its hard ceiling and the job was abandoned with its
    /// resources force-released.
    #[error("{0} phase unresponsive past hard ceiling")]
    UnresponsivePhase(&'static str),

    #[error("queued past deadline ({}s) waiting for capacity", .0.as_secs())]
    QueueTimeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("browser driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("store error: {0}")]
    Store(String),
}
