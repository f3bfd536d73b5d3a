//! Deterministic in-process capability providers.
//!
//! These stand in for a real browser and capture tool in tests and dry runs:
//! probe responses follow a per-signal script, and "capture" writes a fixed
//! payload to the output path so finalize checks see a real file.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{BrowserDriver, CaptureId, CaptureTool, ContextId, DriverError, ExitInfo, SignalKind};
use crate::engine::job::MeetingAddress;

#[derive(Debug, Default, Clone)]
struct SignalScript {
    /// Probe index (per signal kind) from which the signal reads true.
    true_after: Option<u32>,
    /// Number of leading probes that fail with a transient error.
    err_first: u32,
    seen: u32,
}

/// Browser driver whose probe answers are scripted per signal kind.
#[derive(Default)]
pub struct ScriptedBrowser {
    scripts: Mutex<HashMap<SignalKind, SignalScript>>,
    hangs: Mutex<HashSet<SignalKind>>,
    next_id: AtomicU64,
    open: Mutex<HashMap<u64, String>>,
    navigated: Mutex<Vec<String>>,
}

impl ScriptedBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// `kind` reads true from the `n`-th probe of that kind onward.
    pub fn signal_after(self, kind: SignalKind, n: u32) -> Self {
        {
            let mut scripts = self.scripts.lock().expect("script map poisoned");
            scripts.entry(kind).or_default().true_after = Some(n);
        }
        self
    }

    /// `kind` reads true on every probe.
    pub fn always(self, kind: SignalKind) -> Self {
        self.signal_after(kind, 0)
    }

    /// The first `n` probes of `kind` fail with a transient driver error.
    pub fn fail_probes(self, kind: SignalKind, n: u32) -> Self {
        {
            let mut scripts = self.scripts.lock().expect("script map poisoned");
            scripts.entry(kind).or_default().err_first = n;
        }
        self
    }

    /// Probes of `kind` never return, as if the driver hung mid-call.
    pub fn hang_probes(self, kind: SignalKind) -> Self {
        {
            let mut hangs = self.hangs.lock().expect("hang set poisoned");
            hangs.insert(kind);
        }
        self
    }

    pub fn open_context_count(&self) -> usize {
        self.open.lock().expect("open map poisoned").len()
    }

    pub fn navigated_urls(&self) -> Vec<String> {
        self.navigated.lock().expect("navigated list poisoned").clone()
    }
}

#[async_trait]
impl BrowserDriver for ScriptedBrowser {
    async fn open_context(&self, display: &str) -> Result<ContextId, DriverError> {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.open
            .lock()
            .expect("open map poisoned")
            .insert(id.0, display.to_string());
        Ok(id)
    }

    async fn navigate(&self, ctx: ContextId, address: &MeetingAddress) -> Result<(), DriverError> {
        if !self.open.lock().expect("open map poisoned").contains_key(&ctx.0) {
            return Err(DriverError::UnknownHandle);
        }
        self.navigated
            .lock()
            .expect("navigated list poisoned")
            .push(address.web_client_url());
        Ok(())
    }

    async fn probe(&self, ctx: ContextId, kind: SignalKind) -> Result<bool, DriverError> {
        if !self.open.lock().expect("open map poisoned").contains_key(&ctx.0) {
            return Err(DriverError::UnknownHandle);
        }
        let hung = self.hangs.lock().expect("hang set poisoned").contains(&kind);
        if hung {
            std::future::pending::<()>().await;
        }
        let mut scripts = self.scripts.lock().expect("script map poisoned");
        let script = scripts.entry(kind).or_default();
        let index = script.seen;
        script.seen += 1;

        if index < script.err_first {
            return Err(DriverError::Protocol("scripted probe failure".into()));
        }
        Ok(script.true_after.is_some_and(|n| index >= n))
    }

    async fn close(&self, ctx: ContextId) -> Result<(), DriverError> {
        self.open
            .lock()
            .expect("open map poisoned")
            .remove(&ctx.0)
            .map(|_| ())
            .ok_or(DriverError::UnknownHandle)
    }
}

#[derive(Debug)]
struct ScriptedProc {
    stopped: bool,
    killed: bool,
}

/// Capture tool that writes a fixed payload at spawn and obeys (or, when
/// configured, ignores) the graceful stop signal.
pub struct ScriptedCapture {
    payload_bytes: usize,
    fail_spawn: bool,
    ignore_stop: bool,
    next_id: AtomicU64,
    procs: Mutex<HashMap<u64, ScriptedProc>>,
    kills: AtomicU64,
}

impl Default for ScriptedCapture {
    fn default() -> Self {
        Self {
            payload_bytes: 4096,
            fail_spawn: false,
            ignore_stop: false,
            next_id: AtomicU64::new(1),
            procs: Mutex::new(HashMap::new()),
            kills: AtomicU64::new(0),
        }
    }
}

impl ScriptedCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written to the output file at spawn. Zero simulates a capture
    /// process that never produced output.
    pub fn payload_bytes(mut self, n: usize) -> Self {
        self.payload_bytes = n;
        self
    }

    /// Every spawn fails as if the process exited immediately.
    pub fn fail_spawn(mut self) -> Self {
        self.fail_spawn = true;
        self
    }

    /// The process never honors the graceful stop signal; only kill works.
    pub fn ignore_stop(mut self) -> Self {
        self.ignore_stop = true;
        self
    }

    pub fn kill_count(&self) -> u64 {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn output_len(&self, output: &Path) -> u64 {
        std::fs::metadata(output).map(|m| m.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CaptureTool for ScriptedCapture {
    async fn spawn(
        &self,
        _display: &str,
        _audio_sink: &str,
        output: &Path,
    ) -> Result<CaptureId, DriverError> {
        if self.fail_spawn {
            return Err(DriverError::Spawn(
                "scripted-capture".into(),
                std::io::Error::other("scripted spawn failure"),
            ));
        }
        std::fs::write(output, vec![0u8; self.payload_bytes])?;

        let id = CaptureId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.procs.lock().expect("proc map poisoned").insert(
            id.0,
            ScriptedProc {
                stopped: false,
                killed: false,
            },
        );
        Ok(id)
    }

    async fn signal_stop(&self, id: CaptureId) -> Result<(), DriverError> {
        let mut procs = self.procs.lock().expect("proc map poisoned");
        let proc = procs.get_mut(&id.0).ok_or(DriverError::UnknownHandle)?;
        if !self.ignore_stop {
            proc.stopped = true;
        }
        Ok(())
    }

    async fn wait(&self, id: CaptureId, timeout: Duration) -> Result<Option<ExitInfo>, DriverError> {
        let done = {
            let procs = self.procs.lock().expect("proc map poisoned");
            let proc = procs.get(&id.0).ok_or(DriverError::UnknownHandle)?;
            proc.stopped || proc.killed
        };
        if done {
            let killed = {
                let procs = self.procs.lock().expect("proc map poisoned");
                procs.get(&id.0).map(|p| p.killed).unwrap_or(false)
            };
            return Ok(Some(ExitInfo {
                code: if killed { None } else { Some(0) },
                clean: !killed,
            }));
        }
        tokio::time::sleep(timeout).await;
        // Re-check: a stop may have landed while we slept.
        let procs = self.procs.lock().expect("proc map poisoned");
        let proc = procs.get(&id.0).ok_or(DriverError::UnknownHandle)?;
        if proc.stopped || proc.killed {
            Ok(Some(ExitInfo {
                code: if proc.killed { None } else { Some(0) },
                clean: !proc.killed,
            }))
        } else {
            Ok(None)
        }
    }

    async fn kill(&self, id: CaptureId) -> Result<(), DriverError> {
        let mut procs = self.procs.lock().expect("proc map poisoned");
        let proc = procs.get_mut(&id.0).ok_or(DriverError::UnknownHandle)?;
        proc.killed = true;
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_browser_signal_after() {
        let browser = ScriptedBrowser::new().signal_after(SignalKind::Joined, 2);
        let ctx = browser.open_context(":100").await.unwrap();

        assert!(!browser.probe(ctx, SignalKind::Joined).await.unwrap());
        assert!(!browser.probe(ctx, SignalKind::Joined).await.unwrap());
        assert!(browser.probe(ctx, SignalKind::Joined).await.unwrap());
        assert!(browser.probe(ctx, SignalKind::Joined).await.unwrap());
    }

    #[tokio::test]
    async fn test_scripted_browser_transient_errors() {
        let browser = ScriptedBrowser::new()
            .fail_probes(SignalKind::MeetingEnded, 2)
            .signal_after(SignalKind::MeetingEnded, 2);
        let ctx = browser.open_context(":100").await.unwrap();

        assert!(browser.probe(ctx, SignalKind::MeetingEnded).await.is_err());
        assert!(browser.probe(ctx, SignalKind::MeetingEnded).await.is_err());
        assert!(browser.probe(ctx, SignalKind::MeetingEnded).await.unwrap());
    }

    #[tokio::test]
    async fn test_scripted_browser_hung_probe_never_returns() {
        let browser = ScriptedBrowser::new().hang_probes(SignalKind::MeetingEnded);
        let ctx = browser.open_context(":100").await.unwrap();

        let probe = browser.probe(ctx, SignalKind::MeetingEnded);
        assert!(tokio::time::timeout(Duration::from_millis(50), probe)
            .await
            .is_err());
        // Other signal kinds stay responsive.
        assert!(!browser.probe(ctx, SignalKind::Joined).await.unwrap());
    }

    #[tokio::test]
    async fn test_scripted_capture_stop_and_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let capture = ScriptedCapture::new().payload_bytes(2048);

        let id = capture.spawn(":100", "sink", &output).await.unwrap();
        assert!(capture
            .wait(id, Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());

        capture.signal_stop(id).await.unwrap();
        let exit = capture
            .wait(id, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert!(exit.clean);
        assert_eq!(capture.output_len(&output), 2048);
    }

    #[tokio::test]
    async fn test_scripted_capture_ignores_stop_until_killed() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let capture = ScriptedCapture::new().ignore_stop();

        let id = capture.spawn(":100", "sink", &output).await.unwrap();
        capture.signal_stop(id).await.unwrap();
        assert!(capture
            .wait(id, Duration::from_millis(10))
            .await
            .unwrap()
            .is_none());

        capture.kill(id).await.unwrap();
        let exit = capture
            .wait(id, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert!(!exit.clean);
        assert_eq!(capture.kill_count(), 1);
    }
}
