use crate::LockParams;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use thiserror::Error;
use typed_builder::TypedBuilder;

pub const DEFAULT_LOAD_LIMIT: f64 = 0.5;
pub const DEFAULT_MEM_LIMIT: f64 = 2.0;
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;
pub const STORE_FILE_NAME: &str = "queue.json";
pub const DEFAULT_DIR_NAME: &str = ".idleq";

pub fn default_stored_env_variable_names() -> Vec<String> {
    ["PATH", "HOME", "USER", "SHELL", "LANG", "TERM"]
        .iter()
        .map(|name| name.to_string())
        .collect()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not access {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Could not render the configuration as JSON: {0}")]
    Render(#[source] serde_json::Error),
    #[error("Could not determine the home directory, set IDLEQ_DIR or pass --dir")]
    NoHomeDirectory,
    #[error("{name} must be a positive number, got {value}")]
    InvalidLimit { name: &'static str, value: f64 },
}

/// Per-host settings.
///
/// Stored as camelCase JSON in `<dir>/<hostname>.json`. Keys missing from the file
/// take their default value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// jobs are only released while the 1 minute load average is below this value
    #[builder(default = DEFAULT_LOAD_LIMIT)]
    pub load_limit: f64,
    /// jobs are only released while used memory (GB) is below this value
    #[builder(default = DEFAULT_MEM_LIMIT)]
    pub mem_limit: f64,
    /// variables copied from the submitting shell into every new job
    #[builder(default = default_stored_env_variable_names(), setter(into))]
    pub stored_env_variable_names: Vec<String>,
    #[builder(default = DEFAULT_LOCK_TIMEOUT_SECS)]
    pub lock_timeout_secs: u64,
    /// start from an empty queue when the queue file can't be read
    #[builder(default = true)]
    pub recover_corrupt_store: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    /// Reads the config at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());

                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: Config =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;

        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let mut contents = self.render()?;
        contents.push('\n');

        fs::write(path, contents).map_err(io_error)
    }

    /// Pretty printed camelCase JSON, the same text `save` writes.
    pub fn render(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(ConfigError::Render)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [("loadLimit", self.load_limit), ("memLimit", self.mem_limit)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::InvalidLimit { name, value });
            }
        }

        Ok(())
    }

    pub fn lock_params(&self) -> LockParams {
        LockParams::with_timeout(Duration::from_secs(self.lock_timeout_secs))
    }

    /// Copies the configured variables that are set in the current environment.
    pub fn snapshot_environment(&self) -> BTreeMap<String, String> {
        self.stored_env_variable_names
            .iter()
            .filter_map(|name| env::var(name).ok().map(|value| (name.clone(), value)))
            .collect()
    }
}

/// Where the queue file and the per-host config live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Paths {
    pub dir: PathBuf,
    pub host: String,
}

impl Paths {
    /// Uses `dir` when given, `~/.idleq` otherwise.
    pub fn resolve(dir: Option<PathBuf>) -> Result<Self, ConfigError> {
        let dir = match dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .ok_or(ConfigError::NoHomeDirectory)?
                .join(DEFAULT_DIR_NAME),
        };

        let host = System::host_name()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "localhost".to_string());

        Ok(Self { dir, host })
    }

    pub fn store(&self) -> PathBuf {
        self.dir.join(STORE_FILE_NAME)
    }

    pub fn config(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.host))
    }
}
