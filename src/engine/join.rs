//! One automated-browser interaction with a meeting: the join flow and the
//! end-of-meeting watch loop.
//!
//! Probing is resilient: transient driver errors read as "not yet", up to a
//! consecutive-error budget. Past the budget the session gives up rather than
//! loop forever.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::EngineError;
use super::job::{JobId, MeetingAddress};
use crate::drivers::{BrowserDriver, ContextId, SignalKind};

/// PasswordRequired observations tolerated before escalating.
const PASSWORD_RETRY_BUDGET: u32 = 2;

/// Consecutive probe errors tolerated before the session reports an error.
const PROBE_ERROR_BUDGET: u32 = 5;

/// Backoff growth cap, as a multiple of the poll interval.
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Classified result of a join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    WaitingRoom,
    PasswordRequired,
    Error(String),
}

/// Why the end watch stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndWatch {
    /// The platform showed its end-of-meeting marker (or the UI vanished).
    Ended,
    /// The max-recording-duration safety ceiling was reached.
    DurationCeiling,
    /// A cancel request arrived at a poll boundary.
    Cancelled,
    /// Too many consecutive probe failures.
    ProbeBudget(String),
}

pub struct JoinSession {
    job_id: JobId,
    driver: Arc<dyn BrowserDriver>,
    ctx: ContextId,
    last_signal: Option<JoinOutcome>,
}

impl JoinSession {
    pub async fn open(
        job_id: JobId,
        driver: Arc<dyn BrowserDriver>,
        display: &str,
    ) -> Result<Self, EngineError> {
        let ctx = driver.open_context(display).await?;
        Ok(Self {
            job_id,
            driver,
            ctx,
            last_signal: None,
        })
    }

    /// Drive the join flow and poll until the outcome is conclusive.
    ///
    /// WaitingRoom keeps polling with backoff until the timeout, which then
    /// reads as a waiting-room timeout rather than a plain join timeout.
    /// PasswordRequired is retried up to its budget, then escalates to an
    /// authentication failure.
    pub async fn join(
        &mut self,
        address: &MeetingAddress,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<JoinOutcome, EngineError> {
        self.driver.navigate(self.ctx, address).await?;
        debug!("job {}: navigated to {}", self.job_id, address.web_client_url());

        let deadline = Instant::now() + timeout;
        let mut password_seen: u32 = 0;
        let mut consecutive_errors: u32 = 0;
        let mut backoff = poll_interval;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            match self.classify_join_probe().await {
                Ok(outcome) => {
                    consecutive_errors = 0;
                    if let Some(outcome) = outcome {
                        self.last_signal = Some(outcome.clone());
                        match outcome {
                            JoinOutcome::Joined => {
                                info!("job {}: joined meeting", self.job_id);
                                return Ok(JoinOutcome::Joined);
                            }
                            JoinOutcome::PasswordRequired => {
                                password_seen += 1;
                                if password_seen > PASSWORD_RETRY_BUDGET {
                                    return Err(EngineError::JoinAuthRequired);
                                }
                                debug!(
                                    "job {}: password prompt ({}/{})",
                                    self.job_id, password_seen, PASSWORD_RETRY_BUDGET
                                );
                            }
                            JoinOutcome::WaitingRoom => {
                                debug!("job {}: in waiting room", self.job_id);
                            }
                            JoinOutcome::Error(_) => unreachable!("classify never yields Error"),
                        }
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors > PROBE_ERROR_BUDGET {
                        return Ok(JoinOutcome::Error(format!(
                            "join probing failed repeatedly: {}",
                            e
                        )));
                    }
                    debug!("job {}: transient join probe error: {}", self.job_id, e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(match self.last_signal {
                    Some(JoinOutcome::WaitingRoom) => EngineError::JoinWaitingRoomTimeout,
                    _ => EngineError::JoinTimeout(timeout),
                });
            }

            let sleep_for = backoff.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(sleep_for) => {}
            }
            backoff = (backoff * 2).min(poll_interval * MAX_BACKOFF_FACTOR);
        }
    }

    /// One probe round over the join-relevant signals, most conclusive first.
    async fn classify_join_probe(&self) -> Result<Option<JoinOutcome>, EngineError> {
        if self.driver.probe(self.ctx, SignalKind::Joined).await? {
            return Ok(Some(JoinOutcome::Joined));
        }
        if self.driver.probe(self.ctx, SignalKind::PasswordPrompt).await? {
            return Ok(Some(JoinOutcome::PasswordRequired));
        }
        if self.driver.probe(self.ctx, SignalKind::WaitingRoom).await? {
            return Ok(Some(JoinOutcome::WaitingRoom));
        }
        Ok(None)
    }

    /// Poll for the end-of-meeting signal until it fires, the duration
    /// ceiling is reached, or a cancel arrives. Transient probe errors are
    /// absorbed up to the consecutive-error budget.
    pub async fn watch_for_end(
        &mut self,
        poll_interval: Duration,
        max_duration: Duration,
        cancel: &CancellationToken,
    ) -> EndWatch {
        let started = Instant::now();
        let mut consecutive_errors: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return EndWatch::Cancelled,
                _ = tokio::time::sleep(poll_interval) => {}
            }

            match self.driver.probe(self.ctx, SignalKind::MeetingEnded).await {
                Ok(true) => {
                    info!("job {}: meeting ended", self.job_id);
                    return EndWatch::Ended;
                }
                Ok(false) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors > PROBE_ERROR_BUDGET {
                        return EndWatch::ProbeBudget(e.to_string());
                    }
                    debug!("job {}: transient end probe error: {}", self.job_id, e);
                }
            }

            if started.elapsed() >= max_duration {
                warn!(
                    "job {}: max recording duration reached ({}s)",
                    self.job_id,
                    max_duration.as_secs()
                );
                return EndWatch::DurationCeiling;
            }
        }
    }

    /// Tear down the browser context. Close failures are logged, not raised;
    /// by this point the job's fate is already decided.
    pub async fn close(self) {
        if let Err(e) = self.driver.close(self.ctx).await {
            warn!("job {}: failed to close browser context: {}", self.job_id, e);
        }
    }
}
