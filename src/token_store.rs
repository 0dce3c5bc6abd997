//! OAuth2 token type and its persistent storage

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{MailerError, Result};

/// Identity used when the caller does not name one
pub const DEFAULT_IDENTITY: &str = "default";

/// Access/refresh credential pair returned by the authorization server.
///
/// The field names match the common `token.json` layout (`expiry` in RFC 3339).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, rename = "expiry", skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Token {
    /// True once the access token is within a minute of its expiry.
    /// Tokens without an expiry are treated as valid.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => Utc::now() >= exp - Duration::seconds(60),
            None => false,
        }
    }
}

/// Mask a token for log output: first 4 chars, then `***`
pub fn mask_token(token: &str) -> String {
    match token.get(..4) {
        Some(prefix) if token.len() > 4 => format!("{}***", prefix),
        _ => "***".to_string(),
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &mask_token(&self.access_token))
            .field("token_type", &self.token_type)
            .field("refresh_token", &self.refresh_token.as_deref().map(mask_token))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Load/save tokens by user identity
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when nothing is stored for `identity`
    async fn load(&self, identity: &str) -> Result<Option<Token>>;

    /// Replace whatever is stored for `identity`
    async fn save(&self, identity: &str, token: &Token) -> Result<()>;
}

/// JSON files under one directory, written with owner-only permissions.
///
/// The default identity maps to `token.json`; other identities to
/// `token-<identity>.json`.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
    default_file: String,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            default_file: "token.json".to_string(),
        }
    }

    /// Store whose default identity lives at exactly `path`
    pub fn at_path(path: &Path) -> Self {
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let default_file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "token.json".to_string());
        Self { dir, default_file }
    }

    pub fn path_for(&self, identity: &str) -> PathBuf {
        if identity == DEFAULT_IDENTITY {
            return self.dir.join(&self.default_file);
        }
        let safe: String = identity
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '@' || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("token-{}.json", safe))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, identity: &str) -> Result<Option<Token>> {
        let path = self.path_for(identity);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let token: Token = serde_json::from_str(&content).map_err(|e| {
            MailerError::AuthError(format!("Failed to parse token file {:?}: {}", path, e))
        })?;

        debug!("Loaded token from {:?} (expires_at={:?})", path, token.expires_at);
        Ok(Some(token))
    }

    async fn save(&self, identity: &str, token: &Token) -> Result<()> {
        let path = self.path_for(identity);
        tokio::fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_string_pretty(token)?;
        let mut file = open_token_file(&path).await?;
        file.write_all(json.as_bytes()).await?;
        file.flush().await?;
        // The creation mode does not apply to a file that already existed
        secure_token_file(&path).await?;

        debug!("Saved token to {:?}", path);
        Ok(())
    }
}

/// Open `path` for writing, truncated; new files are created as 0600 on Unix
pub async fn open_token_file(path: &Path) -> Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    Ok(options.open(path).await?)
}

/// Sets file permissions to 0600 (read/write for owner only)
#[cfg(unix)]
pub async fn secure_token_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(windows)]
pub async fn secure_token_file(_path: &Path) -> Result<()> {
    // Windows uses ACLs; the file keeps the profile directory's defaults
    Ok(())
}
