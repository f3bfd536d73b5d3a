//! Admission-controlled recording scheduler.
//!
//! Every submitted job runs in its own tokio task supervised here; the
//! orchestrator itself never blocks on a job. A counting semaphore sized to
//! the concurrency ceiling gates QUEUED→JOINING, and the isolation pool
//! shares that ceiling, so an admitted job always finds a free capture
//! surface. Each transition is persisted through the store before the job
//! proceeds, so a crash resolves to the last recorded state on restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::capture::CaptureSession;
use super::error::EngineError;
use super::isolation::IsolationPool;
use super::job::{Job, JobId, JobState, JobView, MeetingAddress};
use super::join::{EndWatch, JoinOutcome, JoinSession};
use crate::db::{JobFilter, JobStore};
use crate::drivers::{BrowserDriver, CaptureTool};

/// Immutable engine configuration, fixed at orchestrator construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Jobs allowed in JOINING/RECORDING at once. Also the isolation pool
    /// size.
    pub max_concurrent: usize,
    /// Bound on non-terminal jobs; submissions beyond it are refused.
    pub max_queued: usize,
    pub join_timeout: Duration,
    pub poll_interval: Duration,
    /// Safety ceiling against runaway recordings.
    pub max_duration: Duration,
    /// How long a capture process gets to exit after the graceful stop.
    pub stop_grace: Duration,
    /// How long a job may sit QUEUED waiting for capacity. `None` waits
    /// indefinitely.
    pub queue_wait: Option<Duration>,
    pub output_dir: PathBuf,
    /// First virtual display number handed to the isolation pool.
    pub display_base: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_queued: 16,
            join_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(10),
            max_duration: Duration::from_secs(8 * 3600),
            stop_grace: Duration::from_secs(10),
            queue_wait: None,
            output_dir: std::env::temp_dir().join("meetrec"),
            display_base: 100,
        }
    }
}

/// Ceiling past which a phase counts as hung and the job is abandoned.
fn hard_ceiling(phase_timeout: Duration) -> Duration {
    phase_timeout * 2 + Duration::from_secs(5)
}

/// Best-effort bound on context teardown for abandoned sessions.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct JobEntry {
    job: Arc<AsyncMutex<Job>>,
    cancel: CancellationToken,
}

struct Inner {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    browser: Arc<dyn BrowserDriver>,
    capture: Arc<dyn CaptureTool>,
    pool: Arc<IsolationPool>,
    permits: Arc<Semaphore>,
    registry: Mutex<HashMap<JobId, JobEntry>>,
}

pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        browser: Arc<dyn BrowserDriver>,
        capture: Arc<dyn CaptureTool>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(config.max_concurrent >= 1, "max_concurrent must be >= 1");
        anyhow::ensure!(
            config.max_queued >= config.max_concurrent,
            "max_queued must be >= max_concurrent"
        );

        let pool = IsolationPool::new(config.max_concurrent, config.display_base);
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                browser,
                capture,
                pool,
                permits,
                registry: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Accept a new recording request. Returns as soon as the job is
    /// persisted QUEUED and its supervision task is spawned.
    pub async fn submit(&self, address: MeetingAddress) -> Result<JobId, EngineError> {
        let job = Job::new(address);
        let id = job.id;
        let entry = JobEntry {
            job: Arc::new(AsyncMutex::new(job)),
            cancel: CancellationToken::new(),
        };

        // Bound check and insert under one lock so concurrent submits cannot
        // both slip past the queue bound.
        let pending;
        {
            let mut registry = self.inner.registry.lock().expect("registry poisoned");
            pending = registry.len();
            if pending >= self.inner.config.max_queued {
                return Err(EngineError::CapacityExceeded(pending));
            }
            let job = entry.job.try_lock().expect("fresh job lock contended");
            self.inner
                .store
                .save(&job)
                .map_err(|e| EngineError::Store(e.to_string()))?;
            drop(job);
            registry.insert(id, entry.clone());
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_job(inner, id, entry).await;
        });

        info!("job {} submitted ({} live)", id, pending + 1);
        Ok(id)
    }

    /// Request cooperative cancellation. Idempotent on terminal jobs.
    pub async fn cancel(&self, id: JobId) -> Result<(), EngineError> {
        let entry = self
            .inner
            .registry
            .lock()
            .expect("registry poisoned")
            .get(&id)
            .cloned();
        if let Some(entry) = entry {
            info!("job {}: cancel requested", id);
            entry.cancel.cancel();
            return Ok(());
        }

        // Not live: a terminal job is a no-op, anything else is unknown.
        match self
            .inner
            .store
            .load(id)
            .map_err(|e| EngineError::Store(e.to_string()))?
        {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(id)),
        }
    }

    /// Consistent snapshot of one job.
    pub async fn status(&self, id: JobId) -> Result<JobView, EngineError> {
        let entry = self
            .inner
            .registry
            .lock()
            .expect("registry poisoned")
            .get(&id)
            .cloned();
        if let Some(entry) = entry {
            return Ok(entry.job.lock().await.view());
        }
        self.inner
            .store
            .load(id)
            .map_err(|e| EngineError::Store(e.to_string()))?
            .map(|j| j.view())
            .ok_or(EngineError::NotFound(id))
    }

    /// Jobs ordered requested-at descending, filtered by URL substring.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobView>, EngineError> {
        let jobs = self
            .inner
            .store
            .list(filter)
            .map_err(|e| EngineError::Store(e.to_string()))?;
        Ok(jobs.iter().map(|j| j.view()).collect())
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait_for_terminal(
        &self,
        id: JobId,
        timeout: Duration,
    ) -> Result<JobView, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let view = self.status(id).await?;
            if view.state.is_terminal() {
                return Ok(view);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::UnresponsivePhase("wait"));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Number of non-terminal jobs currently tracked.
    pub fn live_jobs(&self) -> usize {
        self.inner.registry.lock().expect("registry poisoned").len()
    }

    pub fn pool_available(&self) -> usize {
        self.inner.pool.available()
    }
}

/// Supervision wrapper: runs the pipeline, then evicts the job from the live
/// registry. The store keeps the terminal record.
async fn run_job(inner: Arc<Inner>, id: JobId, entry: JobEntry) {
    execute(&inner, id, &entry).await;
    inner
        .registry
        .lock()
        .expect("registry poisoned")
        .remove(&id);
}

/// The full job pipeline: admission → isolation → join → capture → end watch
/// → stop → terminal state. Every early return persists a terminal state and
/// releases whatever was held (leases and permits by drop, contexts
/// explicitly).
async fn execute(inner: &Arc<Inner>, id: JobId, entry: &JobEntry) {
    let cancel = entry.cancel.clone();
    let config = &inner.config;

    // Admission: stay QUEUED until a permit frees (queue, don't drop).
    let _permit = match acquire_permit(inner, &cancel).await {
        Ok(permit) => permit,
        Err(EngineError::Cancelled) => return finish_cancelled(inner, id, entry).await,
        Err(e) => return finish_failed(inner, id, entry, e.to_string()).await,
    };

    // Pool and semaphore share one ceiling, so this cannot miss.
    let lease = match inner.pool.try_acquire() {
        Some(lease) => lease,
        None => {
            return finish_failed(
                inner,
                id,
                entry,
                EngineError::Internal("isolation pool exhausted despite permit".into()).to_string(),
            )
            .await;
        }
    };

    if let Err(e) = transition(inner, entry, JobState::Joining).await {
        return finish_failed(inner, id, entry, e.to_string()).await;
    }

    let address = entry.job.lock().await.address.clone();
    let mut session =
        match JoinSession::open(id, Arc::clone(&inner.browser), &lease.unit().display).await {
            Ok(session) => session,
            Err(e) => return finish_failed(inner, id, entry, e.to_string()).await,
        };

    let joined = tokio::time::timeout(
        hard_ceiling(config.join_timeout),
        session.join(&address, config.join_timeout, config.poll_interval, &cancel),
    )
    .await;
    match joined {
        Err(_) => {
            // Hung driver call: abandon the phase, force-release resources.
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await;
            return finish_failed(
                inner,
                id,
                entry,
                EngineError::UnresponsivePhase("join").to_string(),
            )
            .await;
        }
        Ok(Err(EngineError::Cancelled)) => {
            session.close().await;
            return finish_cancelled(inner, id, entry).await;
        }
        Ok(Err(e)) => {
            session.close().await;
            return finish_failed(inner, id, entry, e.to_string()).await;
        }
        Ok(Ok(JoinOutcome::Joined)) => {}
        Ok(Ok(outcome)) => {
            let reason = match outcome {
                JoinOutcome::Error(detail) => detail,
                other => format!("unexpected join outcome: {:?}", other),
            };
            session.close().await;
            return finish_failed(inner, id, entry, reason).await;
        }
    }

    // The output path is persisted as part of the RECORDING transition,
    // before the capture process writes any bytes.
    let output_path = output_path_for(&config.output_dir, &address);
    {
        let mut job = entry.job.lock().await;
        job.output_path = Some(output_path.clone());
    }
    if let Err(e) = transition(inner, entry, JobState::Recording).await {
        session.close().await;
        return finish_failed(inner, id, entry, e.to_string()).await;
    }

    let capture = match CaptureSession::start(
        id,
        Arc::clone(&inner.capture),
        lease.unit(),
        output_path,
    )
    .await
    {
        Ok(capture) => capture,
        Err(e) => {
            session.close().await;
            return finish_failed(inner, id, entry, e.to_string()).await;
        }
    };

    // The watch loop is bounded by max_duration internally, but only between
    // probes; the outer ceiling catches a probe that never returns.
    let watched = tokio::time::timeout(
        hard_ceiling(config.max_duration),
        session.watch_for_end(config.poll_interval, config.max_duration, &cancel),
    )
    .await;
    let end = match watched {
        Ok(end) => end,
        Err(_) => {
            // Hung end probe: stop the capture, abandon the job.
            let _ = tokio::time::timeout(
                hard_ceiling(config.stop_grace),
                capture.stop(config.stop_grace),
            )
            .await;
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await;
            drop(lease);
            return finish_failed(
                inner,
                id,
                entry,
                EngineError::UnresponsivePhase("watch").to_string(),
            )
            .await;
        }
    };

    if let Err(e) = transition(inner, entry, JobState::Stopping).await {
        // Still tear the processes down before surfacing the store failure.
        let _ = tokio::time::timeout(hard_ceiling(config.stop_grace), capture.stop(config.stop_grace))
            .await;
        session.close().await;
        return finish_failed(inner, id, entry, e.to_string()).await;
    }

    let finalize = tokio::time::timeout(
        hard_ceiling(config.stop_grace),
        capture.stop(config.stop_grace),
    )
    .await;
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await;

    // Release the capture surface before the terminal state lands, so an
    // observer of the terminal state never sees the unit still held.
    drop(lease);

    match (end, finalize) {
        (_, Err(_)) => {
            finish_failed(
                inner,
                id,
                entry,
                EngineError::UnresponsivePhase("stop").to_string(),
            )
            .await;
        }
        (EndWatch::Cancelled, _) => {
            // No output guarantee on cancel; whatever finalize produced is
            // kept as-is.
            finish_cancelled(inner, id, entry).await;
        }
        (EndWatch::ProbeBudget(detail), _) => {
            finish_failed(
                inner,
                id,
                entry,
                format!("end-watch probe budget exhausted: {}", detail),
            )
            .await;
        }
        (_, Ok(Err(e))) => {
            finish_failed(inner, id, entry, e.to_string()).await;
        }
        (_, Ok(Ok(result))) => {
            let mut job = entry.job.lock().await;
            job.degraded = result.degraded;
            job.output_path = Some(result.output_path.clone());
            match job.advance(JobState::Completed) {
                Ok(()) => {
                    if let Err(e) = inner.store.save(&job) {
                        error!("job {}: failed to persist completion: {}", id, e);
                    }
                    info!(
                        "job {} completed: {:?} ({} bytes{})",
                        id,
                        result.output_path,
                        result.file_size,
                        if result.degraded { ", degraded" } else { "" }
                    );
                }
                Err(e) => {
                    drop(job);
                    finish_failed(inner, id, entry, e.to_string()).await;
                }
            }
        }
    }
}

/// Wait for a concurrency permit, observing cancel and the optional queue
/// deadline.
async fn acquire_permit(
    inner: &Arc<Inner>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit, EngineError> {
    let acquire = Arc::clone(&inner.permits).acquire_owned();
    match inner.config.queue_wait {
        Some(limit) => tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = tokio::time::timeout(limit, acquire) => match result {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(EngineError::Internal("admission semaphore closed".into())),
                Err(_) => Err(EngineError::QueueTimeout(limit)),
            },
        },
        None => tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = acquire => {
                result.map_err(|_| EngineError::Internal("admission semaphore closed".into()))
            }
        },
    }
}

async fn transition(
    inner: &Arc<Inner>,
    entry: &JobEntry,
    next: JobState,
) -> Result<(), EngineError> {
    let mut job = entry.job.lock().await;
    job.advance(next)?;
    inner
        .store
        .save(&job)
        .map_err(|e| EngineError::Store(e.to_string()))?;
    info!("job {} -> {}", job.id, next);
    Ok(())
}

async fn finish_failed(inner: &Arc<Inner>, id: JobId, entry: &JobEntry, reason: String) {
    let mut job = entry.job.lock().await;
    match job.fail(reason.clone()) {
        Ok(()) => {
            if let Err(e) = inner.store.save(&job) {
                error!("job {}: failed to persist failure: {}", id, e);
            }
            error!("job {} failed: {}", id, reason);
        }
        Err(e) => error!("job {}: could not mark failed: {}", id, e),
    }
}

async fn finish_cancelled(inner: &Arc<Inner>, id: JobId, entry: &JobEntry) {
    let mut job = entry.job.lock().await;
    match job.advance(JobState::Cancelled) {
        Ok(()) => {
            if let Err(e) = inner.store.save(&job) {
                error!("job {}: failed to persist cancellation: {}", id, e);
            }
            info!("job {} cancelled", id);
        }
        Err(e) => error!("job {}: could not mark cancelled: {}", id, e),
    }
}

/// Collision-free output path: `meeting_<id>_<timestamp>.mp4` under the
/// recordings root.
fn output_path_for(output_dir: &Path, address: &MeetingAddress) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let meeting_id = address.meeting_id().unwrap_or_else(|| "unknown".into());
    let path = output_dir.join(format!("meeting_{}_{}.mp4", meeting_id, timestamp));

    if path.exists() {
        for i in 1..100 {
            let alt = output_dir.join(format!("meeting_{}_{}-{}.mp4", meeting_id, timestamp, i));
            if !alt.exists() {
                return alt;
            }
        }
        warn!("could not find collision-free name near {:?}", path);
    }

    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.max_concurrent >= 1);
        assert!(config.max_queued >= config.max_concurrent);
        assert!(config.stop_grace < config.join_timeout);
    }

    #[test]
    fn test_output_path_shape() {
        let dir = tempfile::tempdir().unwrap();
        let address = MeetingAddress::new("https://zoom.us/j/4455");
        let path = output_path_for(dir.path(), &address);
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("meeting_4455_"));
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn test_output_path_collision_avoidance() {
        let dir = tempfile::tempdir().unwrap();
        let address = MeetingAddress::new("https://zoom.us/j/4455");
        let first = output_path_for(dir.path(), &address);
        std::fs::write(&first, b"x").unwrap();
        let second = output_path_for(dir.path(), &address);
        assert_ne!(first, second);
    }
}
