//! BrowserDriver over an external Playwright runner subprocess.
//!
//! The runner owns the selector heuristics for the meeting platform's join
//! flow (cookie banners, "join from your browser", name field, audio join)
//! and reports what it observes as line-delimited JSON events on stdout:
//!
//! ```text
//! {"signal":"joined"}
//! {"signal":"waiting_room"}
//! {"signal":"password_required"}
//! {"signal":"ended"}
//! ```
//!
//! Commands go the other way as one JSON object per line on stdin. One runner
//! process per context, bound to the context's virtual display, so killing
//! the process is all it takes to leave a meeting.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BrowserDriver, ContextId, DriverError, SignalKind};
use crate::engine::job::MeetingAddress;

#[derive(Debug, Serialize)]
struct JoinCommand<'a> {
    cmd: &'static str,
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    display_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct RunnerEvent {
    signal: String,
    #[serde(default)]
    detail: Option<String>,
}

struct RunnerContext {
    child: Child,
    stdin: Arc<tokio::sync::Mutex<ChildStdin>>,
    signals: Arc<Mutex<HashSet<SignalKind>>>,
    exited: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

pub struct PlaywrightDriver {
    command: String,
    args: Vec<String>,
    default_display_name: String,
    next_id: AtomicU64,
    contexts: Mutex<HashMap<u64, RunnerContext>>,
}

impl PlaywrightDriver {
    pub fn new(command: String, args: Vec<String>, default_display_name: String) -> Self {
        Self {
            command,
            args,
            default_display_name,
            next_id: AtomicU64::new(1),
            contexts: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BrowserDriver for PlaywrightDriver {
    async fn open_context(&self, display: &str) -> Result<ContextId, DriverError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env("DISPLAY", display)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::Spawn(self.command.clone(), e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::Protocol("runner stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::Protocol("runner stdout unavailable".into()))?;

        let signals: Arc<Mutex<HashSet<SignalKind>>> = Arc::new(Mutex::new(HashSet::new()));
        let exited = Arc::new(AtomicBool::new(false));

        let reader = {
            let signals = Arc::clone(&signals);
            let exited = Arc::clone(&exited);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match serde_json::from_str::<RunnerEvent>(&line) {
                        Ok(event) => match SignalKind::parse(&event.signal) {
                            Some(kind) => {
                                debug!("runner signal: {} {:?}", event.signal, event.detail);
                                signals.lock().expect("signal set poisoned").insert(kind);
                            }
                            None => debug!("runner emitted unknown signal: {}", event.signal),
                        },
                        Err(_) => debug!("runner noise: {}", line),
                    }
                }
                // Runner gone means the browser is gone; the meeting is over
                // as far as this context is concerned.
                exited.store(true, Ordering::SeqCst);
            })
        };

        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.contexts
            .lock()
            .expect("context map poisoned")
            .insert(
                id.0,
                RunnerContext {
                    child,
                    stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
                    signals,
                    exited,
                    reader,
                },
            );

        // `display` must not appear as a tracing format arg by that name; the
        // macro expansion shadows it with `tracing::field::display`.
        let disp = display;
        info!("opened browser context {} on display {}", id, disp);
        Ok(id)
    }

    async fn navigate(&self, ctx: ContextId, address: &MeetingAddress) -> Result<(), DriverError> {
        let (stdin, url);
        {
            let contexts = self.contexts.lock().expect("context map poisoned");
            let entry = contexts.get(&ctx.0).ok_or(DriverError::UnknownHandle)?;
            stdin = Arc::clone(&entry.stdin);
            url = address.web_client_url();
        }

        let command = JoinCommand {
            cmd: "join",
            url: &url,
            password: address.password.as_deref(),
            display_name: address
                .display_name
                .as_deref()
                .unwrap_or(&self.default_display_name),
        };
        let mut line = serde_json::to_string(&command)
            .map_err(|e| DriverError::Protocol(e.to_string()))?;
        line.push('\n');

        let mut stdin = stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn probe(&self, ctx: ContextId, kind: SignalKind) -> Result<bool, DriverError> {
        let contexts = self.contexts.lock().expect("context map poisoned");
        let entry = contexts.get(&ctx.0).ok_or(DriverError::UnknownHandle)?;

        if entry.signals.lock().expect("signal set poisoned").contains(&kind) {
            return Ok(true);
        }
        // A dead runner reads as the meeting having ended, not as an error.
        if kind == SignalKind::MeetingEnded && entry.exited.load(Ordering::SeqCst) {
            return Ok(true);
        }
        Ok(false)
    }

    async fn close(&self, ctx: ContextId) -> Result<(), DriverError> {
        let entry = self
            .contexts
            .lock()
            .expect("context map poisoned")
            .remove(&ctx.0)
            .ok_or(DriverError::UnknownHandle)?;

        entry.reader.abort();
        let mut child = entry.child;
        if let Err(e) = child.kill().await {
            warn!("failed to kill runner for {}: {}", ctx, e);
        }
        info!("closed browser context {}", ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercises the full stdin/stdout protocol against a shell stand-in for
    // the runner: it echoes a joined event, then an ended event.
    #[tokio::test]
    async fn test_runner_protocol_round_trip() {
        let driver = PlaywrightDriver::new(
            "sh".to_string(),
            vec![
                "-c".to_string(),
                // Read the join command, then emit two events.
                "read line; echo '{\"signal\":\"joined\"}'; echo '{\"signal\":\"ended\"}'"
                    .to_string(),
            ],
            "MeetRec Bot".to_string(),
        );

        let ctx = driver.open_context(":99").await.unwrap();
        let address = MeetingAddress::new("https://zoom.us/j/123456");
        driver.navigate(ctx, &address).await.unwrap();

        // Give the stand-in a moment to emit.
        let mut joined = false;
        for _ in 0..50 {
            if driver.probe(ctx, SignalKind::Joined).await.unwrap() {
                joined = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(joined, "never observed joined signal");

        let mut ended = false;
        for _ in 0..50 {
            if driver.probe(ctx, SignalKind::MeetingEnded).await.unwrap() {
                ended = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(ended, "never observed ended signal");

        driver.close(ctx).await.unwrap();
        assert!(matches!(
            driver.probe(ctx, SignalKind::Joined).await,
            Err(DriverError::UnknownHandle)
        ));
    }

    #[tokio::test]
    async fn test_open_context_spawn_failure() {
        let driver = PlaywrightDriver::new(
            "/nonexistent/meetrec-runner".to_string(),
            vec![],
            "MeetRec Bot".to_string(),
        );
        assert!(matches!(
            driver.open_context(":99").await,
            Err(DriverError::Spawn(_, _))
        ));
    }
}
