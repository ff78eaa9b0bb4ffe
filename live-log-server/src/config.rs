use serde::Deserialize;
use std::path::Path;

pub const CONFIG_FILE: &str = "live-log-server.toml";

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub process: ProcessConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ListenConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Lines a live log subscriber may fall behind before it starts skipping.
    #[serde(default = "default_log_channel_capacity")]
    pub log_channel_capacity: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            log_channel_capacity: default_log_channel_capacity(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_log_channel_capacity() -> usize {
    256
}

/// Load config from live-log-server.toml in the given directory, or default.
pub fn load_config(dir: &Path) -> ServerConfig {
    let path = dir.join(CONFIG_FILE);
    let mut config = match std::fs::read_to_string(&path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("failed to parse {}: {e}", path.display());
                ServerConfig::default()
            }
        },
        Err(_) => ServerConfig::default(),
    };
    // broadcast::channel panics on zero capacity
    if config.process.log_channel_capacity == 0 {
        tracing::warn!("log_channel_capacity must be positive, using 1");
        config.process.log_channel_capacity = 1;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path());
        assert_eq!(config.listen.bind, "127.0.0.1");
        assert_eq!(config.listen.port, 8080);
        assert_eq!(config.process.log_channel_capacity, 256);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[listen]\nport = 9999\n").unwrap();
        let config = load_config(dir.path());
        assert_eq!(config.listen.port, 9999);
        assert_eq!(config.listen.bind, "127.0.0.1");
    }

    #[test]
    fn test_unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "listen = [").unwrap();
        assert_eq!(load_config(dir.path()), ServerConfig::default());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[process]\nlog_channel_capacity = 0\n",
        )
        .unwrap();
        assert_eq!(load_config(dir.path()).process.log_channel_capacity, 1);
    }
}
