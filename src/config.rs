use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MailerError, Result};
use crate::token_store::DEFAULT_IDENTITY;

/// Application name used for the per-user config directory
pub const APP_NAME: &str = "mailcast";

/// Upper bound for concurrent sends, from config or `--concurrency`
pub const MAX_CONCURRENT_SENDS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub send: SendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// OAuth2 client secret file; defaults to `credentials.json` in the config dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<PathBuf>,
    /// Token cache; defaults to `token.json` in the config dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
    #[serde(default = "default_identity")]
    pub identity: String,
    #[serde(default = "default_redirect_host")]
    pub redirect_host: String,
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,
    #[serde(default = "default_open_browser")]
    pub open_browser: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_file: None,
            token_file: None,
            identity: default_identity(),
            redirect_host: default_redirect_host(),
            redirect_port: default_redirect_port(),
            callback_timeout_secs: default_callback_timeout_secs(),
            open_browser: default_open_browser(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendConfig {
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,
    #[serde(default = "default_subject")]
    pub default_subject: String,
    #[serde(default = "default_body")]
    pub default_body: String,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sends: default_max_concurrent_sends(),
            default_subject: default_subject(),
            default_body: default_body(),
        }
    }
}

fn default_identity() -> String {
    DEFAULT_IDENTITY.to_string()
}

fn default_redirect_host() -> String {
    "localhost".to_string()
}

fn default_redirect_port() -> u16 {
    8080
}

fn default_callback_timeout_secs() -> u64 {
    300
}

fn default_open_browser() -> bool {
    true
}

fn default_max_concurrent_sends() -> usize {
    5
}

fn default_subject() -> String {
    "No subject".to_string()
}

fn default_body() -> String {
    "No body".to_string()
}

/// Per-user application config directory (`~/.config/mailcast` on Linux)
pub fn app_config_dir() -> Result<PathBuf> {
    ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| {
            MailerError::ConfigError("Unable to find user config directory".to_string())
        })
}

/// Create the app config directory (owner-only on Unix) and return it
pub async fn ensure_app_config_dir() -> Result<PathBuf> {
    let dir = app_config_dir()?;
    tokio::fs::create_dir_all(&dir).await.map_err(|e| {
        MailerError::ConfigError(format!("Unable to create config directory {:?}: {}", dir, e))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o700);
        tokio::fs::set_permissions(&dir, perms).await?;
    }

    Ok(dir)
}

impl AuthConfig {
    /// Configured credentials file, else `./credentials.json` when present,
    /// else `credentials.json` in `config_dir`
    pub fn credentials_path(&self, config_dir: &Path) -> PathBuf {
        if let Some(path) = &self.credentials_file {
            return path.clone();
        }
        let local = PathBuf::from("credentials.json");
        if local.exists() {
            return local;
        }
        config_dir.join("credentials.json")
    }

    pub fn token_path(&self, config_dir: &Path) -> PathBuf {
        self.token_file
            .clone()
            .unwrap_or_else(|| config_dir.join("token.json"))
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MailerError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| MailerError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                MailerError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| MailerError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| MailerError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.send.max_concurrent_sends == 0 {
            return Err(MailerError::ConfigError(
                "send.max_concurrent_sends must be at least 1".to_string(),
            ));
        }
        if self.send.max_concurrent_sends > MAX_CONCURRENT_SENDS {
            return Err(MailerError::ConfigError(format!(
                "send.max_concurrent_sends cannot exceed {}",
                MAX_CONCURRENT_SENDS
            )));
        }

        if self.auth.identity.trim().is_empty() {
            return Err(MailerError::ConfigError(
                "auth.identity cannot be empty".to_string(),
            ));
        }
        if self.auth.redirect_host.trim().is_empty() {
            return Err(MailerError::ConfigError(
                "auth.redirect_host cannot be empty".to_string(),
            ));
        }
        if self.auth.callback_timeout_secs == 0 {
            return Err(MailerError::ConfigError(
                "auth.callback_timeout_secs must be greater than 0".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self::default();
        config.save(path).await
    }
}
