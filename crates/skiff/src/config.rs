//! Server configuration.
//!
//! Loaded with the `config` crate: serde defaults, then the TOML file, then
//! `SKIFF__`-prefixed environment variables (`SKIFF__SERVER__PORT=9000`).
//! Durations are plain integers with a unit suffix in the key name so the
//! file stays readable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::buffer::BufferConfig;
use crate::persistence::PersistenceConfig;
use crate::sandbox::ProcessSpec;
use crate::session::SessionConfig;
use crate::storage::{MountOptions, RsyncStorageConfig};
use crate::sync::SyncConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SKIFF";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub sandbox: SandboxSettings,
    pub storage: StorageSettings,
    pub record_store: RecordStoreSettings,
    pub persistence: PersistenceSettings,
    pub sync: SyncSettings,
    pub buffer: BufferSettings,
    pub session: SessionSettings,
}

impl AppConfig {
    /// Load from `path` (optional) and the environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Settings handed to every session actor.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            agent: self.sandbox.process_spec(),
            sandbox_env: self.sandbox.env.clone(),
            mount: self.storage.mount_options(),
            persistence: self.persistence.to_config(),
            sync: self.sync.to_config(),
            buffer: self.buffer.to_config(),
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level for skiff's own targets; `RUST_LOG` overrides it.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long shutdown waits for final syncs and persistence drains.
    pub shutdown_timeout_secs: u64,
    /// Browser origins allowed by CORS. Empty allows none.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            shutdown_timeout_secs: 30,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<String>,
    pub state_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Root for local sandboxes. Defaults to `{data_dir}/sandboxes`.
    pub base_dir: Option<String>,
    pub agent_command: String,
    pub agent_args: Vec<String>,
    pub ready_timeout_secs: u64,
    /// Extra environment for every sandbox.
    pub env: HashMap<String, String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            base_dir: None,
            agent_command: "skiff-agent".to_string(),
            agent_args: Vec::new(),
            ready_timeout_secs: 30,
            env: HashMap::new(),
        }
    }
}

impl SandboxSettings {
    pub fn process_spec(&self) -> ProcessSpec {
        ProcessSpec {
            command: self.agent_command.clone(),
            args: self.agent_args.clone(),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub bucket: String,
    pub mount_path: String,
    /// Mount helper with `{bucket}` and `{path}` placeholders.
    pub mount_command: Option<String>,
    /// Server environment variables passed to the mount helper.
    pub credentials_env: Vec<String>,
    pub rsync_binary: String,
    pub exec_timeout_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            bucket: "skiff-workspaces".to_string(),
            mount_path: "/mnt/durable".to_string(),
            mount_command: None,
            credentials_env: Vec::new(),
            rsync_binary: "rsync".to_string(),
            exec_timeout_secs: 120,
        }
    }
}

impl StorageSettings {
    pub fn rsync_config(&self) -> RsyncStorageConfig {
        RsyncStorageConfig {
            mount_path: self.mount_path.clone(),
            rsync_bin: self.rsync_binary.clone(),
            mount_command: self.mount_command.clone(),
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
        }
    }

    /// Mount options with credentials read from the server environment.
    /// Unset variables are skipped.
    pub fn mount_options(&self) -> MountOptions {
        let credentials = self
            .credentials_env
            .iter()
            .filter_map(|name| {
                std::env::var(name)
                    .ok()
                    .map(|value| (name.clone(), value))
            })
            .collect();
        MountOptions {
            bucket: self.bucket.clone(),
            mount_path: self.mount_path.clone(),
            credentials,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordStoreSettings {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for RecordStoreSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8788".to_string(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        let defaults = PersistenceConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
        }
    }
}

impl PersistenceSettings {
    pub fn to_config(&self) -> PersistenceConfig {
        PersistenceConfig {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub debounce_ms: u64,
    pub max_debounce_ms: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        let defaults = SyncConfig::default();
        Self {
            debounce_ms: defaults.debounce.as_millis() as u64,
            max_debounce_ms: defaults.max_debounce.as_millis() as u64,
            max_retries: defaults.max_retries,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
        }
    }
}

impl SyncSettings {
    pub fn to_config(&self) -> SyncConfig {
        SyncConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            max_debounce: Duration::from_millis(self.max_debounce_ms.max(self.debounce_ms)),
            max_retries: self.max_retries.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    pub max_size: usize,
    pub max_age_secs: u64,
}

impl Default for BufferSettings {
    fn default() -> Self {
        let defaults = BufferConfig::default();
        Self {
            max_size: defaults.max_size,
            max_age_secs: defaults.max_age.as_secs(),
        }
    }
}

impl BufferSettings {
    pub fn to_config(&self) -> BufferConfig {
        BufferConfig {
            max_size: self.max_size,
            max_age: Duration::from_secs(self.max_age_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub idle_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
        }
    }
}

/// Expand `~` and environment variables in a configured path.
pub fn expand_path(text: &str) -> Result<PathBuf, shellexpand::LookupError<std::env::VarError>> {
    Ok(PathBuf::from(shellexpand::full(text)?.into_owned()))
}
