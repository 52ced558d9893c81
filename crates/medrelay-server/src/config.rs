//! Server configuration: TOML file + CLI overrides.

use medrelay_core::{RelayError, RelayResult};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub liveness: LivenessSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            outbound_buffer: default_outbound_buffer(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// `[liveness]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LivenessSection {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Defaults to `interval_secs` when absent.
    pub timeout_secs: Option<u64>,
}

impl Default for LivenessSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            timeout_secs: None,
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    8080
}
fn default_max_connections() -> usize {
    1000
}
fn default_max_frame_size() -> usize {
    64 * 1024
}
fn default_outbound_buffer() -> usize {
    64
}
fn default_shutdown_grace_ms() -> u64 {
    2000
}
fn default_interval_secs() -> u64 {
    30
}

/// Values given on the command line; `None` keeps the file/default value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
    pub heartbeat_interval: Option<u64>,
}

/// Resolved server configuration (file loaded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub max_connections: usize,
    pub max_frame_size: usize,
    pub outbound_buffer: usize,
    pub shutdown_grace: Duration,
    pub liveness_interval: Duration,
    pub liveness_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), ConfigOverrides::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::resolve(file_config, overrides);
        config.validate()?;
        Ok(config)
    }

    fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> Self {
        let interval_secs = overrides
            .heartbeat_interval
            .unwrap_or(file.liveness.interval_secs);
        let timeout_secs = file.liveness.timeout_secs.unwrap_or(interval_secs);

        Self {
            bind: overrides.bind.unwrap_or(file.server.bind),
            port: overrides.port.unwrap_or(file.server.port),
            max_connections: overrides
                .max_connections
                .unwrap_or(file.server.max_connections),
            max_frame_size: file.server.max_frame_size,
            outbound_buffer: file.server.outbound_buffer,
            shutdown_grace: Duration::from_millis(file.server.shutdown_grace_ms),
            liveness_interval: Duration::from_secs(interval_secs),
            liveness_timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn validate(&self) -> RelayResult<()> {
        if self.liveness_interval.is_zero() {
            return Err(RelayError::Config("liveness interval must be non-zero".into()));
        }
        if self.liveness_timeout.is_zero() {
            return Err(RelayError::Config("liveness timeout must be non-zero".into()));
        }
        if self.outbound_buffer == 0 {
            return Err(RelayError::Config("outbound_buffer must be non-zero".into()));
        }
        if self.max_connections == 0 {
            return Err(RelayError::Config("max_connections must be non-zero".into()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
