use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from live-log.toml.
#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct LiveLogConfig {
    pub server: ServerConfig,
    pub process: ProcessConfig,
}

/// Where the process manager lives.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub api_prefix: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessConfig {
    /// Command line handed to the remote service verbatim.
    pub command: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            api_prefix: "/api/v1".to_string(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            command: "./test.sh".to_string(),
        }
    }
}

impl ServerConfig {
    /// Base URL of the processes collection, e.g. `http://localhost:8080/api/v1/processes`.
    pub fn processes_url(&self) -> String {
        let prefix = self.api_prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("http://{}:{}/processes", self.host, self.port)
        } else {
            format!("http://{}:{}/{}/processes", self.host, self.port, prefix)
        }
    }
}

/// Errors from reading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Load config from `path`.
///
/// A missing file is not an error: the built-in defaults (localhost:8080,
/// `/api/v1`, `./test.sh`) are used instead. A file that exists but cannot
/// be read or parsed is reported.
pub fn load_config(path: &Path) -> Result<LiveLogConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(LiveLogConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}
