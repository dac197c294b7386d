use anyhow::{Context, Result};
use memory_portal_network::{HandshakeOptions, DEFAULT_SOCKET_PATH};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default config file name, looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "memory-portal.toml";

/// Graphics backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// POSIX shared memory, no GPU required
    Host,
    /// Vulkan opaque-fd external memory
    Vulkan,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Host => write!(f, "host"),
            BackendKind::Vulkan => write!(f, "vulkan"),
        }
    }
}

/// Portal configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Rendezvous socket path
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Shared region size in bytes
    #[serde(default = "default_region_size")]
    pub region_size: u64,

    /// Graphics backend
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// How long the producer waits for a consumer, 0 waits forever
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,

    /// Bound on each handshake send/receive, 0 waits forever
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Vulkan validation layers
    #[serde(default = "default_validation_layers")]
    pub validation_layers: bool,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_region_size() -> u64 {
    1024
}

fn default_backend() -> BackendKind {
    BackendKind::Host
}

fn default_accept_timeout_ms() -> u64 {
    0
}

fn default_io_timeout_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_validation_layers() -> bool {
    false
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            region_size: default_region_size(),
            backend: default_backend(),
            accept_timeout_ms: default_accept_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            log_level: default_log_level(),
            validation_layers: default_validation_layers(),
        }
    }
}

impl PortalConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Cannot read config file: {:?}", path.as_ref()))?;

        let config: PortalConfig = toml::from_str(&content)
            .with_context(|| format!("Cannot parse config file: {:?}", path.as_ref()))?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| format!("Cannot create directory: {:?}", parent))?;
            }
        }

        let content = toml::to_string_pretty(self).with_context(|| "Cannot serialize config")?;

        std::fs::write(&path, content).with_context(|| format!("Cannot write config file: {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Look for a config file in the working directory
    pub fn find_config_file() -> Option<PathBuf> {
        let current_dir = Path::new(CONFIG_FILE_NAME);
        if current_dir.exists() {
            info!("Using detected config file: {}", current_dir.display());
            return Some(current_dir.to_path_buf());
        }

        None
    }

    /// Load `path` if given, else a detected config file, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            Self::from_file(path)
        } else if let Some(path) = Self::find_config_file() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Handshake timeouts; zero means unbounded
    pub fn handshake_options(&self) -> HandshakeOptions {
        let mut options = HandshakeOptions::default();
        if self.accept_timeout_ms > 0 {
            options = options.with_accept_timeout(Duration::from_millis(self.accept_timeout_ms));
        }
        if self.io_timeout_ms > 0 {
            options = options.with_io_timeout(Duration::from_millis(self.io_timeout_ms));
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PortalConfig::default();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/memory_portal.sock"));
        assert_eq!(config.region_size, 1024);
        assert_eq!(config.backend, BackendKind::Host);

        let options = config.handshake_options();
        assert_eq!(options.accept_timeout, None);
        assert_eq!(options.io_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory-portal.toml");

        let config = PortalConfig {
            region_size: 4096,
            backend: BackendKind::Vulkan,
            accept_timeout_ms: 500,
            ..PortalConfig::default()
        };
        config.save_to_file(&path).unwrap();

        assert_eq!(PortalConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory-portal.toml");
        std::fs::write(&path, "socket_path = \"/tmp/test_socket\"\nbackend = \"host\"\n").unwrap();

        let config = PortalConfig::from_file(&path).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/test_socket"));
        assert_eq!(config.region_size, 1024);
        assert_eq!(config.io_timeout_ms, 30_000);
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory-portal.toml");
        std::fs::write(&path, "backend = \"opengl\"\n").unwrap();

        let err = PortalConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Cannot parse config file"));
    }

    #[test]
    fn test_unbounded_timeouts() {
        let config = PortalConfig {
            io_timeout_ms: 0,
            ..PortalConfig::default()
        };
        let options = config.handshake_options();
        assert!(options.accept_timeout.is_none());
        assert!(options.io_timeout.is_none());
    }
}
