use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::errors::{HyperError, Result};

pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 500;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_SPAWN_RETRIES: u32 = 3;
pub const DEFAULT_MAX_REQUEUES: u32 = 1;

/// How worker processes are launched.
///
/// `program` defaults to the current executable. That binary must call
/// [`crate::bootstrap`] at the top of `main`.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

impl LaunchConfig {
    pub fn program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(p) => Ok(p.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}

/// Pool configuration, shared by the process pool and the thread pool.
///
/// Loaded from TOML with [`PoolConfig::load`] or assembled with
/// [`PoolConfig::builder`]. Durations are in milliseconds; `None` means
/// unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub pool_size: usize,
    pub max_tasks_per_worker: Option<usize>,
    pub task_timeout_ms: Option<u64>,
    pub connection_timeout_ms: Option<u64>,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub spawn_retries: u32,
    pub max_requeues: u32,
    pub launch: LaunchConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            pool_size: num_cpus::get(),
            max_tasks_per_worker: None,
            task_timeout_ms: None,
            connection_timeout_ms: Some(DEFAULT_CONNECTION_TIMEOUT_MS),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            spawn_retries: DEFAULT_SPAWN_RETRIES,
            max_requeues: DEFAULT_MAX_REQUEUES,
            launch: LaunchConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder {
            config: PoolConfig::default(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<PoolConfig> {
        let cfg: PoolConfig = confy::load_path(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(HyperError::Config("pool_size must be at least 1".into()));
        }
        if self.max_tasks_per_worker == Some(0) {
            return Err(HyperError::Config(
                "max_tasks_per_worker must be at least 1 when set".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(HyperError::Config("heartbeat_interval_ms must be positive".into()));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(HyperError::Config(format!(
                "heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout_ms.map(Duration::from_millis)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    pub fn max_tasks_per_worker(mut self, max: usize) -> Self {
        self.config.max_tasks_per_worker = Some(max);
        self
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.config.task_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn connection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connection_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.heartbeat_interval_ms = interval.as_millis() as u64;
        self.config.heartbeat_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn spawn_retries(mut self, retries: u32) -> Self {
        self.config.spawn_retries = retries;
        self
    }

    pub fn max_requeues(mut self, requeues: u32) -> Self {
        self.config.max_requeues = requeues;
        self
    }

    pub fn program<P: Into<PathBuf>>(mut self, program: P) -> Self {
        self.config.launch.program = Some(program.into());
        self
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.config.launch.args = args;
        self
    }

    pub fn build(self) -> Result<PoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Manager process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub connection_timeout_ms: Option<u64>,
    pub launch: LaunchConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            connection_timeout_ms: Some(DEFAULT_CONNECTION_TIMEOUT_MS),
            launch: LaunchConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<ManagerConfig> {
        Ok(confy::load_path(path)?)
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_size_follows_cpu_count() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.pool_size, num_cpus::get());
        assert_eq!(cfg.max_requeues, 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn builder_rejects_empty_pool() {
        let err = PoolConfig::builder().pool_size(0).build().unwrap_err();
        assert!(matches!(err, HyperError::Config(_)));
    }

    #[test]
    fn builder_rejects_heartbeat_timeout_below_interval() {
        let err = PoolConfig::builder()
            .heartbeat(Duration::from_secs(2), Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, HyperError::Config(_)));
    }

    #[test]
    fn load_reads_partial_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pool.toml");
        fs::write(
            &path,
            "pool_size = 3\ntask_timeout_ms = 1500\nmax_tasks_per_worker = 10\n",
        )?;
        let cfg = PoolConfig::load(&path)?;
        assert_eq!(cfg.pool_size, 3);
        assert_eq!(cfg.task_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(cfg.max_tasks_per_worker, Some(10));
        assert_eq!(cfg.heartbeat_interval_ms, DEFAULT_HEARTBEAT_INTERVAL_MS);
        Ok(())
    }
}
