use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiServerConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Socket the daemon listens on. Defaults to S.uiserver inside the
    /// data directory, following the GnuPG socket naming convention.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub checksums: ChecksumConfig,

    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gc_interval_secs: default_gc_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_initial_retry")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_connect_attempts: u32,
    #[serde(default = "default_restart_pause")]
    pub restart_pause_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_retry_delay_ms: default_initial_retry(),
            max_retry_delay_ms: default_max_retry(),
            max_connect_attempts: default_max_attempts(),
            restart_pause_ms: default_restart_pause(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumConfig {
    /// Definition used when creating checksums, by id.
    #[serde(default = "default_checksum_definition")]
    pub default_definition: String,

    /// Extra definitions merged over the built-in table.
    #[serde(default)]
    pub definitions: Vec<ChecksumDefinitionConfig>,
}

impl Default for ChecksumConfig {
    fn default() -> Self {
        Self {
            default_definition: default_checksum_definition(),
            definitions: Vec::new(),
        }
    }
}

/// A user supplied checksum program description, mirroring the shape of
/// the built-in table in `checksum`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumDefinitionConfig {
    pub id: String,
    pub label: String,
    pub algorithm: String,
    pub output_file: String,
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Whether a missing gpg-agent should be launched on demand.
    #[serde(default = "default_true")]
    pub autostart: bool,
    #[serde(default = "default_gpgconf")]
    pub gpgconf: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            gpgconf: default_gpgconf(),
        }
    }
}

// Defaults
fn default_true() -> bool {
    true
}
fn default_gc_interval() -> u64 {
    60
}
fn default_initial_retry() -> u64 {
    125
}
fn default_max_retry() -> u64 {
    1000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_restart_pause() -> u64 {
    1000
}
fn default_checksum_definition() -> String {
    "sha256sum".to_owned()
}
fn default_gpgconf() -> PathBuf {
    PathBuf::from("gpgconf")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".uiserverd"))
        .unwrap_or_else(|| PathBuf::from(".uiserverd"))
}

impl UiServerConfig {
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("uiserverd.json");

        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)?;
            let mut config: UiServerConfig = serde_json::from_str(&raw)?;
            config.data_dir = data_dir.to_path_buf();
            return Ok(config);
        }

        let config = Self::default_with_dir(data_dir);
        config.persist()?;
        Ok(config)
    }

    pub fn default_with_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            socket_path: None,
            sessions: SessionConfig::default(),
            watcher: WatcherConfig::default(),
            checksums: ChecksumConfig::default(),
            agent: AgentConfig::default(),
        }
    }

    /// The socket the daemon binds, explicit or derived from data_dir.
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("S.uiserver"))
    }

    pub fn persist(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        let config_path = self.data_dir.join("uiserverd.json");
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(config_path, raw)?;
        Ok(())
    }
}
