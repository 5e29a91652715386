//! Server configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/dropstream/server.toml`
//! - Windows: `%APPDATA%/dropstream/server.toml`

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::Context;
use dropstream_data_channel::ServerConfig;
use dropstream_transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_WRITE_BUFFER, IngestOptions};
use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// TCP port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory completed uploads are saved to.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// Bytes buffered in front of each destination file.
    ///
    /// The buffer grows as data arrives, so this is the memory ceiling of a
    /// single upload (plus one read chunk), not a per-connection allocation.
    #[serde(default = "default_write_buffer")]
    pub write_buffer_bytes: usize,

    /// Largest accepted upload in bytes; unlimited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_bytes: Option<u64>,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    dropstream_protocol::DEFAULT_PORT
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_write_buffer() -> usize {
    DEFAULT_WRITE_BUFFER
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            upload_dir: default_upload_dir(),
            write_buffer_bytes: default_write_buffer(),
            max_file_bytes: None,
        }
    }
}

impl Config {
    /// Loads configuration from `path` (or the platform path), writing the
    /// defaults out if the file does not exist yet.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Settings for the ingest server.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_address: self.bind_address,
            port: self.port,
            upload_dir: self.upload_dir.clone(),
            ingest: IngestOptions {
                write_buffer_bytes: self.write_buffer_bytes,
                max_file_bytes: self.max_file_bytes,
                chunk_size: DEFAULT_CHUNK_SIZE,
            },
        }
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("dropstream")
            .join("server.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("dropstream").join("server.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/dropstream/server.toml"))
    }
}
