//! One screen/audio recording subprocess, from spawn to finalized file.
//!
//! Stop is two-phase: graceful signal, bounded wait, then force kill. A
//! killed capture still finalizes — the file may be truncated but it is the
//! best artifact available and is never deleted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::error::EngineError;
use super::isolation::IsolationUnit;
use super::job::JobId;
use crate::drivers::{CaptureId, CaptureTool};

/// How long after spawn to watch for an immediate exit before declaring the
/// capture started.
const STARTUP_PROBE: Duration = Duration::from_millis(300);

/// Below this the output file counts as empty and finalize fails.
pub const MIN_OUTPUT_BYTES: u64 = 1024;

/// Outcome of stopping and finalizing a capture.
#[derive(Debug, Clone)]
pub struct FinalizeResult {
    pub output_path: PathBuf,
    pub file_size: u64,
    /// The process had to be force-killed; the file may be truncated.
    pub degraded: bool,
    pub recorded: Duration,
}

pub struct CaptureSession {
    job_id: JobId,
    tool: Arc<dyn CaptureTool>,
    handle: CaptureId,
    output_path: PathBuf,
    started_at: Instant,
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("job_id", &self.job_id)
            .field("handle", &self.handle)
            .field("output_path", &self.output_path)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl CaptureSession {
    /// Launch the capture process against the unit's display and sink.
    pub async fn start(
        job_id: JobId,
        tool: Arc<dyn CaptureTool>,
        unit: &IsolationUnit,
        output_path: PathBuf,
    ) -> Result<Self, EngineError> {
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::CaptureStart(format!("output dir unusable: {}", e)))?;
        }

        let handle = tool
            .spawn(&unit.display, &unit.audio_sink, &output_path)
            .await
            .map_err(|e| EngineError::CaptureStart(e.to_string()))?;

        // A capture process that dies right away (bad display, unwritable
        // path) should fail the start, not surface later as a bad finalize.
        match tool.wait(handle, STARTUP_PROBE).await {
            Ok(Some(exit)) => {
                return Err(EngineError::CaptureStart(format!(
                    "capture process exited immediately (code {:?})",
                    exit.code
                )));
            }
            Ok(None) => {}
            Err(e) => return Err(EngineError::CaptureStart(e.to_string())),
        }

        info!("job {}: capture started -> {:?}", job_id, output_path);
        Ok(Self {
            job_id,
            tool,
            handle,
            output_path,
            started_at: Instant::now(),
        })
    }

    /// Graceful stop, bounded wait, force kill on overrun; then sanity-check
    /// the output file.
    pub async fn stop(self, grace: Duration) -> Result<FinalizeResult, EngineError> {
        let mut degraded = false;

        if let Err(e) = self.tool.signal_stop(self.handle).await {
            warn!("job {}: graceful stop signal failed: {}", self.job_id, e);
            degraded = true;
        }

        match self.tool.wait(self.handle, grace).await {
            Ok(Some(exit)) => {
                if !exit.clean {
                    warn!(
                        "job {}: capture exited uncleanly (code {:?})",
                        self.job_id, exit.code
                    );
                    degraded = true;
                }
            }
            Ok(None) => {
                warn!(
                    "job {}: capture did not exit within {}s grace, killing",
                    self.job_id,
                    grace.as_secs()
                );
                if let Err(e) = self.tool.kill(self.handle).await {
                    warn!("job {}: kill failed: {}", self.job_id, e);
                }
                degraded = true;
            }
            Err(e) => {
                warn!("job {}: wait on capture failed: {}", self.job_id, e);
                degraded = true;
            }
        }

        let recorded = self.started_at.elapsed();
        let file_size = match std::fs::metadata(&self.output_path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Err(EngineError::CaptureFinalize(format!(
                    "output file missing: {:?}",
                    self.output_path
                )));
            }
        };
        if file_size < MIN_OUTPUT_BYTES {
            return Err(EngineError::CaptureFinalize(format!(
                "output file empty or truncated ({} bytes)",
                file_size
            )));
        }

        info!(
            "job {}: capture finalized, {} bytes in {}s{}",
            self.job_id,
            file_size,
            recorded.as_secs(),
            if degraded { " (degraded)" } else { "" }
        );
        Ok(FinalizeResult {
            output_path: self.output_path,
            file_size,
            degraded,
            recorded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ScriptedCapture;
    use crate::engine::isolation::IsolationPool;

    fn unit() -> IsolationUnit {
        let pool = IsolationPool::new(1, 100);
        pool.try_acquire().unwrap().unit().clone()
    }

    #[tokio::test]
    async fn test_start_and_clean_stop() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("rec.mp4");
        let tool = Arc::new(ScriptedCapture::new().payload_bytes(8192));

        let session = CaptureSession::start(JobId::new(), tool, &unit(), output.clone())
            .await
            .unwrap();
        let result = session.stop(Duration::from_millis(100)).await.unwrap();

        assert_eq!(result.output_path, output);
        assert_eq!(result.file_size, 8192);
        assert!(!result.degraded);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_capture_start_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(ScriptedCapture::new().fail_spawn());

        let err = CaptureSession::start(JobId::new(), tool, &unit(), dir.path().join("rec.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CaptureStart(_)));
    }

    #[tokio::test]
    async fn test_stop_overrun_kills_and_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("rec.mp4");
        let tool = Arc::new(ScriptedCapture::new().ignore_stop());

        let session =
            CaptureSession::start(JobId::new(), Arc::clone(&tool) as _, &unit(), output.clone())
                .await
                .unwrap();
        let result = session.stop(Duration::from_millis(50)).await.unwrap();

        assert!(result.degraded);
        assert_eq!(tool.kill_count(), 1);
        // Artifact retained despite the kill.
        assert!(output.exists());
    }

    #[tokio::test]
    async fn test_empty_output_fails_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(ScriptedCapture::new().payload_bytes(10));

        let session = CaptureSession::start(
            JobId::new(),
            tool,
            &unit(),
            dir.path().join("rec.mp4"),
        )
        .await
        .unwrap();
        let err = session.stop(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, EngineError::CaptureFinalize(_)));
    }
}
