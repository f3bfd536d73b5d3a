//! Capability-provider ports for browser control and screen/audio capture.
//!
//! The engine never talks to a browser or a capture process directly; it goes
//! through these object-safe traits. Handles are opaque id tokens so any
//! automation or capture technology can sit behind them.

pub mod ffmpeg;
pub mod playwright;
pub mod scripted;

pub use ffmpeg::FfmpegCapture;
pub use playwright::PlaywrightDriver;
pub use scripted::{ScriptedBrowser, ScriptedCapture};

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::engine::job::MeetingAddress;

/// Meeting-platform signals the engine knows how to react to. Anything the
/// underlying UI shows that is not one of these is invisible to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Joined,
    WaitingRoom,
    PasswordPrompt,
    MeetingEnded,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Joined => "joined",
            Self::WaitingRoom => "waiting_room",
            Self::PasswordPrompt => "password_required",
            Self::MeetingEnded => "ended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "joined" => Some(Self::Joined),
            "waiting_room" => Some(Self::WaitingRoom),
            "password_required" => Some(Self::PasswordPrompt),
            "ended" => Some(Self::MeetingEnded),
            _ => None,
        }
    }
}

/// Opaque handle to one browser context owned by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Opaque handle to one capture process owned by a capture tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CaptureId(pub u64);

impl fmt::Display for CaptureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap-{}", self.0)
    }
}

/// How a capture process exited.
#[derive(Debug, Clone, Copy)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// True when the process exited on its own accord with a zero status.
    pub clean: bool,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, #[source] std::io::Error),

    #[error("unknown or already-closed handle")]
    UnknownHandle,

    #[error("driver protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Automated browser control. One context per job; `probe` answers whether a
/// given signal is currently observable. Probe failures are transient from
/// the engine's point of view and are absorbed up to a budget.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Open a fresh browser context bound to the given virtual display.
    async fn open_context(&self, display: &str) -> Result<ContextId, DriverError>;

    /// Drive the join flow for `address` in the given context. Returns once
    /// the flow has been initiated; progress is observed through `probe`.
    async fn navigate(&self, ctx: ContextId, address: &MeetingAddress) -> Result<(), DriverError>;

    /// Whether `kind` is currently observable in the context.
    async fn probe(&self, ctx: ContextId, kind: SignalKind) -> Result<bool, DriverError>;

    /// Tear the context down. Idempotent on unknown handles is not required;
    /// callers close exactly once.
    async fn close(&self, ctx: ContextId) -> Result<(), DriverError>;
}

/// Screen/audio capture subprocess control.
#[async_trait]
pub trait CaptureTool: Send + Sync {
    /// Launch a capture process recording `display` + `audio_sink` into
    /// `output`.
    async fn spawn(
        &self,
        display: &str,
        audio_sink: &str,
        output: &Path,
    ) -> Result<CaptureId, DriverError>;

    /// Ask the process to stop gracefully and flush its container.
    async fn signal_stop(&self, id: CaptureId) -> Result<(), DriverError>;

    /// Wait up to `timeout` for exit. `None` means still running.
    async fn wait(&self, id: CaptureId, timeout: Duration) -> Result<Option<ExitInfo>, DriverError>;

    /// Force-terminate the process.
    async fn kill(&self, id: CaptureId) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_kind_round_trip() {
        for kind in [
            SignalKind::Joined,
            SignalKind::WaitingRoom,
            SignalKind::PasswordPrompt,
            SignalKind::MeetingEnded,
        ] {
            assert_eq!(SignalKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SignalKind::parse("cookie_banner"), None);
    }
}
