use crate::drivers::ffmpeg::CaptureSettings;
use crate::engine::EngineConfig;
use crate::global;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineSection,
    pub capture: CaptureSection,
    pub browser: BrowserSection,
    pub storage: StorageSection,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Jobs allowed in JOINING/RECORDING at once.
    pub max_concurrent_recordings: usize,
    /// Bound on queued + running jobs before submissions are refused.
    pub max_queued_jobs: usize,
    pub join_timeout_seconds: u64,
    pub poll_interval_seconds: u64,
    /// Safety ceiling on a single recording (default: 8 hours).
    pub max_duration_seconds: u64,
    pub stop_grace_seconds: u64,
    /// How long a job may wait QUEUED for capacity. 0 = wait indefinitely.
    pub queue_wait_timeout_seconds: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrent_recordings: 2,
            max_queued_jobs: 16,
            join_timeout_seconds: 120,
            poll_interval_seconds: 10,
            max_duration_seconds: 8 * 3600,
            stop_grace_seconds: 10,
            queue_wait_timeout_seconds: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    /// Explicit ffmpeg path; resolved from PATH when unset.
    pub ffmpeg_path: Option<String>,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            framerate: 30,
            ffmpeg_path: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    /// Command that runs the Playwright join-flow runner.
    pub runner_command: String,
    pub runner_args: Vec<String>,
    /// Name shown to other meeting participants when none is given per job.
    pub display_name: String,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            runner_command: "meetrec-runner".to_string(),
            runner_args: Vec::new(),
            display_name: "MeetRec Bot".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Recordings root; defaults to the data dir's recordings folder.
    pub recordings_dir: Option<PathBuf>,
    /// First virtual display number for the isolation pool.
    pub display_base: u32,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            recordings_dir: None,
            display_base: 100,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = global::config_file()?;
        if !config_path.exists() {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content =
            std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;

        info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = global::config_file()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    /// Resolve the engine's immutable configuration value.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let output_dir = match &self.storage.recordings_dir {
            Some(dir) => dir.clone(),
            None => global::recordings_dir()?,
        };
        let queue_wait = match self.engine.queue_wait_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Ok(EngineConfig {
            max_concurrent: self.engine.max_concurrent_recordings,
            max_queued: self.engine.max_queued_jobs,
            join_timeout: Duration::from_secs(self.engine.join_timeout_seconds),
            poll_interval: Duration::from_secs(self.engine.poll_interval_seconds),
            max_duration: Duration::from_secs(self.engine.max_duration_seconds),
            stop_grace: Duration::from_secs(self.engine.stop_grace_seconds),
            queue_wait,
            output_dir,
            display_base: self.storage.display_base,
        })
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            width: self.capture.width,
            height: self.capture.height,
            framerate: self.capture.framerate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_round_trip_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(
            parsed.engine.max_concurrent_recordings,
            config.engine.max_concurrent_recordings
        );
        assert_eq!(parsed.browser.display_name, "MeetRec Bot");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [engine]
            max_concurrent_recordings = 5
            "#,
        )
        .unwrap();
        assert_eq!(parsed.engine.max_concurrent_recordings, 5);
        assert_eq!(parsed.engine.stop_grace_seconds, 10);
        assert_eq!(parsed.capture.framerate, 30);
    }

    #[test]
    fn test_engine_config_queue_wait_zero_means_forever() {
        let mut config = Config::default();
        config.storage.recordings_dir = Some(PathBuf::from("/tmp/meetrec-test"));
        assert!(config.engine_config().unwrap().queue_wait.is_none());

        config.engine.queue_wait_timeout_seconds = 30;
        assert_eq!(
            config.engine_config().unwrap().queue_wait,
            Some(Duration::from_secs(30))
        );
    }
}
