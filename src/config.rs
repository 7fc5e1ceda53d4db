use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::model::Assignment;

#[derive(Parser)]
#[command(name = "autograder", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Number of builds allowed to run at the same time, overrides the configuration file
    #[arg(long = "threads", short = 't')]
    pub threads: Option<usize>,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        let mut config: Config = serde_json::from_reader(reader)?;
        if let Some(threads) = self.threads {
            config.scheduler.pool_size = threads;
        }
        Ok(config)
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
}

#[derive(Deserialize, Debug)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

/// How the external build tool is invoked.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BuildConfig {
    /// Command line; `%DESCRIPTOR%` and `%REPOSITORY%` are substituted before the run.
    pub command: Vec<String>,
    pub maven_home: Option<PathBuf>,
    /// Local artifact repository shared by every build.
    pub repository: PathBuf,
    pub descriptor: String,
    pub rewritten_descriptor: String,
    pub arg_line_placeholder: String,
    pub identity_property: String,
    pub extra_arg_line: Vec<String>,
    pub too_much_output_threshold: usize,
    /// Log every line produced by the build tool at debug level.
    pub show_output: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: [
                "mvn",
                "-B",
                "-f",
                "%DESCRIPTOR%",
                "-Dmaven.repo.local=%REPOSITORY%",
                "clean",
                "compile",
                "test",
            ]
            .map(String::from)
            .to_vec(),
            maven_home: None,
            repository: PathBuf::from("data/m2-repository"),
            descriptor: "pom.xml".to_string(),
            rewritten_descriptor: "pom_updated.xml".to_string(),
            arg_line_placeholder: "${autograder.argLine}".to_string(),
            identity_property: "autograder.currentUserId".to_string(),
            extra_arg_line: Vec::new(),
            too_much_output_threshold: 2500,
            show_output: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub pool_size: usize,
    pub timeout_secs: u64,
    /// Run builds inline in the caller, without pool or timeout.
    pub synchronous: bool,
    pub term_grace_ms: u64,
    pub kill_grace_ms: u64,
    /// How long finished task states stay queryable.
    pub task_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            timeout_secs: 180,
            synchronous: false,
            term_grace_ms: 2000,
            kill_grace_ms: 1000,
            task_ttl_secs: 3600,
        }
    }
}

impl SchedulerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn task_ttl(&self) -> Duration {
        Duration::from_secs(self.task_ttl_secs)
    }
}
