use crate::deal::PartyId;
use crate::dispatcher::DispatchPolicy;
use crate::machine::Arbiter;
use crate::router::RouterSettings;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_language")]
    pub default_language: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub logs_dir: Option<String>,
    pub admin: AdminConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// The single arbitrating admin. Only one is supported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub id: i64,
    #[serde(default)]
    pub contact: String,
    #[serde(default)]
    pub escrow_account: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub storage_timeout_ms: u64,
    pub max_conflict_retries: u32,
    pub notify_attempts: u32,
    pub notify_backoff_ms: u64,
}

fn default_db_path() -> String {
    "escrow.db".into()
}

fn default_language() -> String {
    "ha".into()
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            storage_timeout_ms: 2_000,
            max_conflict_retries: 8,
            notify_attempts: 3,
            notify_backoff_ms: 200,
        }
    }
}

impl Settings {
    /// Layer `ESCROW__*` environment variables over the optional TOML file,
    /// e.g. `ESCROW__ADMIN__ID=1001`.
    pub fn load(config_path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("ESCROW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().inspect_err(|err| {
            error!("Failed to load configuration: {err}");
        })?;

        cfg.try_deserialize::<Settings>().map_err(|err| {
            error!("Failed to deserialize configuration: {err}");
            SettingsError::Load(err)
        })
    }

    pub fn arbiter(&self) -> Arbiter {
        Arbiter {
            id: PartyId(self.admin.id),
            contact: self.admin.contact.clone(),
            escrow_account: self.admin.escrow_account.clone(),
        }
    }

    pub fn router_settings(&self) -> RouterSettings {
        RouterSettings {
            arbiter: self.arbiter(),
            storage_timeout: Duration::from_millis(self.runtime.storage_timeout_ms),
            max_conflict_retries: self.runtime.max_conflict_retries,
        }
    }

    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            default_language: self.default_language.clone(),
            attempts: self.runtime.notify_attempts,
            backoff: Duration::from_millis(self.runtime.notify_backoff_ms),
            lookup_timeout: Duration::from_millis(self.runtime.storage_timeout_ms),
        }
    }
}
