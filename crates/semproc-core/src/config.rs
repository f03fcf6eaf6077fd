//! Configuration — YAML config + env var overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::BusError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Number of worker threads for asynchronous dispatch
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Run every dispatch inline on the publishing thread
    #[serde(default)]
    pub single_threaded: bool,

    /// Echo every payload published outside the Logger membrane into it
    #[serde(default = "default_true")]
    pub echo_to_logger: bool,

    /// Register the `tracing` exception receptor in the Logger membrane
    #[serde(default = "default_true")]
    pub trace_exceptions: bool,

    /// Worker thread name prefix
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

fn default_worker_count() -> usize {
    20
}
fn default_true() -> bool {
    true
}
fn default_thread_name() -> String {
    "semproc-worker".into()
}

impl BusConfig {
    /// Load config from a YAML file with env var overrides.
    pub fn load(config_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config: {}", config_path.display()))?;

        let mut config: BusConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        if let Ok(workers) = std::env::var("SEMPROC_WORKERS") {
            config.worker_count = workers
                .parse()
                .with_context(|| format!("SEMPROC_WORKERS is not a number: {workers}"))?;
        }
        if let Ok(flag) = std::env::var("SEMPROC_SINGLE_THREADED") {
            config.single_threaded = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Load config from the default location (dir/config.yaml)
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load(&dir.join("config.yaml"))
    }

    pub fn validate(&self) -> Result<(), BusError> {
        if self.worker_count == 0 {
            return Err(BusError::InvalidConfig("worker_count must be at least 1".into()));
        }
        if self.thread_name.is_empty() {
            return Err(BusError::InvalidConfig("thread_name must not be empty".into()));
        }
        Ok(())
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            single_threaded: false,
            echo_to_logger: true,
            trace_exceptions: true,
            thread_name: default_thread_name(),
        }
    }
}
