//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use termrelay_core::{RelayError, RelayResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_sessions: default_max_sessions(),
            idle_timeout: default_idle_timeout(),
            sweep_interval: default_sweep_interval(),
            state_file: default_state_file(),
        }
    }
}

fn default_port() -> u16 {
    1234
}
fn default_max_sessions() -> usize {
    100
}
fn default_idle_timeout() -> u64 {
    1800
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_state_file() -> String {
    "~/.termrelay/sessions.json".to_string()
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_sessions: usize,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub state_file: PathBuf,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_max_sessions: Option<usize>,
        cli_idle_timeout: Option<u64>,
        cli_sweep_interval: Option<u64>,
        cli_state_file: Option<&str>,
    ) -> RelayResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| RelayError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let state_file = cli_state_file
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.state_file);

        Ok(Self {
            port: cli_port.unwrap_or(file_config.server.port),
            max_sessions: cli_max_sessions.unwrap_or(file_config.server.max_sessions),
            idle_timeout_secs: cli_idle_timeout.unwrap_or(file_config.server.idle_timeout),
            sweep_interval_secs: cli_sweep_interval.unwrap_or(file_config.server.sweep_interval),
            state_file: expand_tilde_str(&state_file),
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = ServerConfig::load(None, None, None, None, None, None).expect("load");
        assert_eq!(config.port, 1234);
        assert_eq!(config.idle_timeout(), Duration::from_secs(1800));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn cli_overrides_file_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\nport = 4000\nidle_timeout = 900\nstate_file = \"/var/lib/termrelay/sessions.json\"\n",
        )
        .expect("write config");

        let config = ServerConfig::load(Some(&path), Some(5000), None, None, None, None)
            .expect("load");
        assert_eq!(config.port, 5000);
        assert_eq!(config.idle_timeout_secs, 900);
        assert_eq!(
            config.state_file,
            PathBuf::from("/var/lib/termrelay/sessions.json")
        );
    }
}
