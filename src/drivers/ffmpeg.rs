//! CaptureTool implementation over an ffmpeg subprocess.
//!
//! Mirrors the x11grab + pulse invocation the recorder has always used:
//! libx264 ultrafast at CRF 23, aac 128k, yuv420p for player compatibility.
//! Graceful stop is ffmpeg's `q` keypress on stdin, which flushes the
//! container trailer; the engine escalates to kill if that is ignored.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{CaptureId, CaptureTool, DriverError, ExitInfo};

/// Capture geometry and encoder settings.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            framerate: 30,
        }
    }
}

pub struct FfmpegCapture {
    binary: PathBuf,
    settings: CaptureSettings,
    next_id: AtomicU64,
    children: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<Child>>>>,
}

impl FfmpegCapture {
    /// Locate ffmpeg on PATH.
    pub fn new(settings: CaptureSettings) -> anyhow::Result<Self> {
        let binary = which::which("ffmpeg")?;
        Ok(Self::with_binary(binary, settings))
    }

    pub fn with_binary(binary: PathBuf, settings: CaptureSettings) -> Self {
        Self {
            binary,
            settings,
            next_id: AtomicU64::new(1),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn child(&self, id: CaptureId) -> Result<Arc<tokio::sync::Mutex<Child>>, DriverError> {
        self.children
            .lock()
            .expect("ffmpeg child map poisoned")
            .get(&id.0)
            .cloned()
            .ok_or(DriverError::UnknownHandle)
    }

    fn forget(&self, id: CaptureId) {
        self.children
            .lock()
            .expect("ffmpeg child map poisoned")
            .remove(&id.0);
    }
}

#[async_trait]
impl CaptureTool for FfmpegCapture {
    async fn spawn(
        &self,
        display: &str,
        audio_sink: &str,
        output: &Path,
    ) -> Result<CaptureId, DriverError> {
        let size = format!("{}x{}", self.settings.width, self.settings.height);
        let video_input = format!("{}.0", display);
        let audio_input = format!("{}.monitor", audio_sink);
        let child = Command::new(&self.binary)
            .arg("-y")
            .args(["-f", "x11grab"])
            .args(["-video_size", &size])
            .args(["-framerate", &self.settings.framerate.to_string()])
            .args(["-i", &video_input])
            .args(["-f", "pulse"])
            .args(["-i", &audio_input])
            .args(["-c:v", "libx264"])
            .args(["-preset", "ultrafast"])
            .args(["-crf", "23"])
            .args(["-c:a", "aac"])
            .args(["-b:a", "128k"])
            .args(["-pix_fmt", "yuv420p"])
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::Spawn(self.binary.display().to_string(), e))?;

        let id = CaptureId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.children
            .lock()
            .expect("ffmpeg child map poisoned")
            .insert(id.0, Arc::new(tokio::sync::Mutex::new(child)));

        info!(
            "ffmpeg {} capturing {} / {} -> {:?}",
            id, video_input, audio_input, output
        );
        Ok(id)
    }

    async fn signal_stop(&self, id: CaptureId) -> Result<(), DriverError> {
        let child = self.child(id)?;
        let mut child = child.lock().await;
        // ffmpeg treats `q` on stdin as a request to finish the file cleanly.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(b"q").await?;
            stdin.flush().await?;
            debug!("sent graceful stop to ffmpeg {}", id);
        }
        Ok(())
    }

    async fn wait(&self, id: CaptureId, timeout: Duration) -> Result<Option<ExitInfo>, DriverError> {
        let child = self.child(id)?;
        let mut child = child.lock().await;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                drop(child);
                self.forget(id);
                Ok(Some(ExitInfo {
                    code: status.code(),
                    clean: status.success(),
                }))
            }
            Ok(Err(e)) => Err(DriverError::Io(e)),
            Err(_) => Ok(None),
        }
    }

    async fn kill(&self, id: CaptureId) -> Result<(), DriverError> {
        let child = self.child(id)?;
        {
            let mut child = child.lock().await;
            if let Err(e) = child.kill().await {
                warn!("failed to kill ffmpeg {}: {}", id, e);
            }
        }
        self.forget(id);
        Ok(())
    }
}
