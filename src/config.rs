use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "runner", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Number of independent workers to run in this process
    #[arg(long = "workers", short = 'w', default_value_t = 1)]
    pub workers: u8,

    /// Redis endpoint, overrides the configuration file
    #[arg(long = "redis-url", env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Work queue name, overrides the configuration file
    #[arg(long = "queue", env = "RUNNER_QUEUE")]
    pub queue: Option<String>,

    /// Directory holding per-job workspaces, overrides the configuration file
    #[arg(long = "jobs-dir", env = "RUNNER_JOBS_DIR")]
    pub jobs_dir: Option<PathBuf>,
}

impl CliArgs {
    /// Load the configuration file (if any) and apply command line overrides
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)?
            }
            None => Config::default(),
        };

        if let Some(url) = &self.redis_url {
            config.redis.url = url.clone();
        }
        if let Some(queue) = &self.queue {
            config.queue.name = queue.clone();
        }
        if let Some(dir) = &self.jobs_dir {
            config.workspace.jobs_dir = Some(dir.clone());
        }

        Ok(config)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub queue: QueueConfig,
    pub workspace: WorkspaceConfig,
    pub monitor: MonitorConfig,
    pub compile: CompileConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RedisConfig {
    /// `redis://` or `rediss://` connection url
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    /// Long-poll duration of a single receive
    pub wait_seconds: u64,
    /// Backoff after a failed receive
    pub retry_delay: Millis,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "runner:jobs".to_string(),
            wait_seconds: 20,
            retry_delay: Millis(2000),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub jobs_dir: Option<PathBuf>,
}

impl WorkspaceConfig {
    /// Resolves the jobs directory, falling back to the user cache directory
    pub fn resolve_jobs_dir(&self) -> PathBuf {
        use directories::ProjectDirs;

        if let Some(dir) = &self.jobs_dir {
            return dir.clone();
        }

        match ProjectDirs::from("", "", "runner") {
            Some(proj_dirs) => proj_dirs.cache_dir().join("jobs"),
            None => std::env::temp_dir().join("runner").join("jobs"),
        }
    }
}

/// Resource policy applied to the run stage of every job
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub max_output_lines: u64,
    pub cpu_check_interval: Millis,
    /// Percentage of one core
    pub max_cpu_usage: f64,
    /// How long CPU usage must stay above `max_cpu_usage` before the kill
    pub cpu_check_duration: Millis,
    pub memory_limit: ByteSize,
    pub idle_timeout: Millis,
    pub idle_check_interval: Millis,
    pub enable_resource_monitoring: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_output_lines: 5000,
            cpu_check_interval: Millis(500),
            max_cpu_usage: 85.0,
            cpu_check_duration: Millis(6000),
            memory_limit: ByteSize::from_mib(800),
            idle_timeout: Millis(30_000),
            idle_check_interval: Millis(10_000),
            enable_resource_monitoring: true,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CompileConfig {
    /// Wall-clock limit of the compile stage
    pub timeout: Millis,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            timeout: Millis(30_000),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Millis(pub u64);

impl From<Millis> for Duration {
    fn from(value: Millis) -> Self {
        Duration::from_millis(value.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let file = std::fs::File::open("data/example.json").unwrap();
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader).unwrap();
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379");
        assert_eq!(config.queue.name, "runner:python");
        assert_eq!(config.queue.wait_seconds, 20);
        assert_eq!(config.monitor.max_output_lines, 2000);
        assert_eq!(config.monitor.memory_limit, ByteSize::from_mib(256));
        // Omitted fields keep their defaults
        assert_eq!(config.monitor.cpu_check_interval, Millis(500));
        assert_eq!(config.compile.timeout, Millis(20_000));
    }

    #[test]
    fn test_monitor_defaults() {
        let monitor: MonitorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(monitor, MonitorConfig::default());
        assert_eq!(monitor.memory_limit.0, 800 * 1024 * 1024);
        assert_eq!(monitor.idle_timeout, Millis(30_000));
        assert!(monitor.enable_resource_monitoring);
    }

    #[test]
    fn test_cli_overrides() {
        let cli = CliArgs::parse_from([
            "runner",
            "--redis-url",
            "redis://cache:6380",
            "--queue",
            "runner:cpp",
            "--jobs-dir",
            "/tmp/runner-jobs",
        ]);
        let config = cli.to_config().unwrap();
        assert_eq!(config.redis.url, "redis://cache:6380");
        assert_eq!(config.queue.name, "runner:cpp");
        assert_eq!(
            config.workspace.resolve_jobs_dir(),
            PathBuf::from("/tmp/runner-jobs")
        );
        assert_eq!(cli.workers, 1);
    }
}
