//! OAuth2 authorization for the Gmail API
//!
//! Tokens come from the credential store when one is cached. Otherwise the
//! authorization-code grant runs against a one-shot local redirect listener:
//! the user approves access in a browser, the listener captures the code,
//! the code is exchanged at the token endpoint, and the new token is stored
//! before it is handed out.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::env;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;
use yup_oauth2::ApplicationSecret;

use crate::config::AuthConfig;
use crate::error::{MailerError, Result};
use crate::redirect::RedirectListener;
use crate::token_store::{CredentialStore, Token, DEFAULT_IDENTITY};

/// Send mail on the user's behalf
pub const SEND_SCOPE: &str = "https://www.googleapis.com/auth/gmail.send";

/// Headers and profile only (used for the "sending as" confirmation)
pub const METADATA_SCOPE: &str = "https://www.googleapis.com/auth/gmail.metadata";

/// Scopes requested during authorization
pub const REQUIRED_SCOPES: &[&str] = &[SEND_SCOPE, METADATA_SCOPE];

/// Fixed anti-forgery state carried through the redirect
pub const STATE_TOKEN: &str = "state-token";

pub const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Read the OAuth2 client credentials (`credentials.json` downloaded from the
/// Google Cloud console)
pub async fn read_client_secret(path: &Path) -> Result<ApplicationSecret> {
    yup_oauth2::read_application_secret(path).await.map_err(|e| {
        MailerError::ConfigError(format!("Unable to read client secret file {:?}: {}", path, e))
    })
}

/// Load OAuth2 client credentials from environment variables
///
/// # Environment Variables
/// - `MAILCAST_CLIENT_ID`: OAuth2 client ID
/// - `MAILCAST_CLIENT_SECRET`: OAuth2 client secret
pub fn load_credentials_from_env() -> Result<ApplicationSecret> {
    let client_id = env::var("MAILCAST_CLIENT_ID")
        .map_err(|_| MailerError::ConfigError("MAILCAST_CLIENT_ID not set".to_string()))?;
    let client_secret = env::var("MAILCAST_CLIENT_SECRET")
        .map_err(|_| MailerError::ConfigError("MAILCAST_CLIENT_SECRET not set".to_string()))?;

    Ok(ApplicationSecret {
        client_id,
        client_secret,
        auth_uri: DEFAULT_AUTH_URI.to_string(),
        token_uri: DEFAULT_TOKEN_URI.to_string(),
        ..Default::default()
    })
}

/// Client credentials from the file when present, else from the environment
pub async fn resolve_client_secret(path: &Path) -> Result<ApplicationSecret> {
    if path.exists() {
        return read_client_secret(path).await;
    }
    load_credentials_from_env().map_err(|e| {
        MailerError::ConfigError(format!(
            "No client secret file at {:?} and no environment credentials ({})",
            path, e
        ))
    })
}

/// Build the URL the user opens to grant access
pub fn authorization_url(
    auth_uri: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
) -> Result<Url> {
    let mut url = Url::parse(auth_uri)
        .map_err(|e| MailerError::ConfigError(format!("Invalid auth_uri {:?}: {}", auth_uri, e)))?;
    url.query_pairs_mut()
        .append_pair("access_type", "offline")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("scope", &scopes.join(" "))
        .append_pair("state", state);
    Ok(url)
}

/// The provider's token endpoint
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthorizationServer: Send + Sync {
    /// Trade an authorization code for a token
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Token>;

    /// Obtain a fresh access token with a refresh token
    async fn refresh(&self, refresh_token: &str) -> Result<Token>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Standard OAuth2 token endpoint reached over HTTPS
#[derive(Debug, Clone)]
pub struct OAuthTokenEndpoint {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_uri: String,
}

impl OAuthTokenEndpoint {
    pub fn new(secret: &ApplicationSecret) -> Self {
        let token_uri = if secret.token_uri.is_empty() {
            DEFAULT_TOKEN_URI.to_string()
        } else {
            secret.token_uri.clone()
        };
        Self {
            http: reqwest::Client::new(),
            client_id: secret.client_id.clone(),
            client_secret: secret.client_secret.clone(),
            token_uri,
        }
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<Token> {
        let response = self
            .http
            .post(&self.token_uri)
            .form(form)
            .send()
            .await
            .map_err(|e| MailerError::AuthError(format!("Token endpoint unreachable: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| MailerError::AuthError(format!("Failed to read token response: {}", e)))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| match e.error_description {
                    Some(desc) => format!("{}: {}", e.error, desc),
                    None => e.error,
                })
                .unwrap_or_else(|_| format!("HTTP {}", status.as_u16()));
            warn!("Token request rejected: {}", detail);
            return Err(MailerError::AuthError(format!("Token request failed: {}", detail)));
        }

        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| MailerError::AuthError(format!("Malformed token response: {}", e)))?;

        Ok(Token {
            access_token: parsed.access_token,
            token_type: parsed.token_type.unwrap_or_else(|| "Bearer".to_string()),
            refresh_token: parsed.refresh_token,
            expires_at: parsed
                .expires_in
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
        })
    }
}

#[async_trait]
impl AuthorizationServer for OAuthTokenEndpoint {
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<Token> {
        debug!("Exchanging authorization code at {}", self.token_uri);
        self.request_token(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Token> {
        debug!("Refreshing access token at {}", self.token_uri);
        self.request_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ])
        .await
    }
}

/// Shows the authorization URL to the user
#[cfg_attr(test, mockall::automock)]
pub trait AuthorizationPrompt: Send + Sync {
    fn present(&self, url: &Url);
}

/// Prints the URL and, when enabled, opens it in the default browser
#[derive(Debug, Clone, Copy)]
pub struct SystemBrowser {
    pub launch: bool,
}

impl AuthorizationPrompt for SystemBrowser {
    fn present(&self, url: &Url) {
        println!(
            "Your browser will open for authorization.\nIf it doesn't, open this link manually:\n{}",
            url
        );
        if self.launch {
            if let Err(e) = open_browser(url.as_str()) {
                warn!("Could not launch a browser: {}", e);
            }
        }
    }
}

fn open_browser(url: &str) -> std::io::Result<()> {
    use std::process::{Command, Stdio};

    #[cfg(target_os = "macos")]
    let mut command = {
        let mut c = Command::new("open");
        c.arg(url);
        c
    };
    #[cfg(windows)]
    let mut command = {
        let mut c = Command::new("rundll32");
        c.arg("url.dll,FileProtocolHandler").arg(url);
        c
    };
    #[cfg(not(any(target_os = "macos", windows)))]
    let mut command = {
        let mut c = Command::new("xdg-open");
        c.arg(url);
        c
    };

    command
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|_| ())
}

/// Parameters of the authorization flow
#[derive(Debug, Clone)]
pub struct AuthOptions {
    pub identity: String,
    pub redirect_host: String,
    pub redirect_port: u16,
    pub state: String,
    pub scopes: Vec<String>,
    /// `None` waits for the redirect indefinitely
    pub callback_timeout: Option<Duration>,
}

impl Default for AuthOptions {
    fn default() -> Self {
        Self {
            identity: DEFAULT_IDENTITY.to_string(),
            redirect_host: "localhost".to_string(),
            redirect_port: 8080,
            state: STATE_TOKEN.to_string(),
            scopes: REQUIRED_SCOPES.iter().map(|s| s.to_string()).collect(),
            callback_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl AuthOptions {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            identity: config.identity.clone(),
            redirect_host: config.redirect_host.clone(),
            redirect_port: config.redirect_port,
            callback_timeout: Some(Duration::from_secs(config.callback_timeout_secs)),
            ..Default::default()
        }
    }
}

/// Hands out tokens: cached when available, interactive otherwise
pub struct TokenManager {
    client_id: String,
    auth_uri: String,
    store: Arc<dyn CredentialStore>,
    server: Arc<dyn AuthorizationServer>,
    prompt: Arc<dyn AuthorizationPrompt>,
    options: AuthOptions,
}

impl TokenManager {
    pub fn new(
        secret: &ApplicationSecret,
        store: Arc<dyn CredentialStore>,
        server: Arc<dyn AuthorizationServer>,
        prompt: Arc<dyn AuthorizationPrompt>,
        options: AuthOptions,
    ) -> Self {
        let auth_uri = if secret.auth_uri.is_empty() {
            DEFAULT_AUTH_URI.to_string()
        } else {
            secret.auth_uri.clone()
        };
        Self {
            client_id: secret.client_id.clone(),
            auth_uri,
            store,
            server,
            prompt,
            options,
        }
    }

    /// Manager wired to the real token endpoint and the system browser
    pub fn for_secret(
        secret: &ApplicationSecret,
        store: Arc<dyn CredentialStore>,
        options: AuthOptions,
        launch_browser: bool,
    ) -> Self {
        Self::new(
            secret,
            store,
            Arc::new(OAuthTokenEndpoint::new(secret)),
            Arc::new(SystemBrowser {
                launch: launch_browser,
            }),
            options,
        )
    }

    pub fn identity(&self) -> &str {
        &self.options.identity
    }

    /// Stored token for this identity, if one loads cleanly
    pub async fn cached(&self) -> Option<Token> {
        match self.store.load(&self.options.identity).await {
            Ok(Some(token)) => {
                debug!("Using cached token for {}", self.options.identity);
                Some(token)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Ignoring unreadable cached token: {}", e);
                None
            }
        }
    }

    /// Cached token, or a new one from the interactive flow
    pub async fn token(&self) -> Result<Token> {
        match self.cached().await {
            Some(token) => Ok(token),
            None => self.authorize().await,
        }
    }

    /// Run the authorization-code flow and persist the result
    pub async fn authorize(&self) -> Result<Token> {
        let listener =
            RedirectListener::bind(&self.options.redirect_host, self.options.redirect_port).await?;
        let redirect_uri = listener.redirect_uri()?;

        let url = authorization_url(
            &self.auth_uri,
            &self.client_id,
            &redirect_uri,
            &self.options.scopes,
            &self.options.state,
        )?;
        self.prompt.present(&url);

        info!("Waiting for the authorization redirect on {}", redirect_uri);
        let code = listener
            .wait_for_code(&self.options.state, self.options.callback_timeout)
            .await?;

        let token = self.server.exchange_code(&code, &redirect_uri).await?;
        self.store.save(&self.options.identity, &token).await.map_err(|e| {
            MailerError::AuthError(format!("Unable to cache OAuth token: {}", e))
        })?;
        info!("Authorization complete; token cached for {}", self.options.identity);
        Ok(token)
    }

    /// Replace `current` with a refreshed token and store it.
    ///
    /// The refresh token is carried over when the server does not rotate it.
    /// A failed save is logged; the fresh token is returned either way.
    pub async fn refresh(&self, current: &Token) -> Result<Token> {
        let refresh_token = current.refresh_token.as_deref().ok_or_else(|| {
            MailerError::AuthError("Access token expired and no refresh token is stored".to_string())
        })?;

        let mut fresh = self.server.refresh(refresh_token).await?;
        if fresh.refresh_token.is_none() {
            fresh.refresh_token = Some(refresh_token.to_string());
        }
        if let Err(e) = self.store.save(&self.options.identity, &fresh).await {
            warn!("Refreshed token could not be cached: {}", e);
        }
        debug!("Refreshed access token for {}", self.options.identity);
        Ok(fresh)
    }
}

type TokenFuture<'a> = Pin<
    Box<
        dyn Future<Output = std::result::Result<Option<String>, Box<dyn std::error::Error + Send + Sync>>>
            + Send
            + 'a,
    >,
>;

/// Bearer token source for the Gmail client; refreshes expired tokens on demand
#[derive(Clone)]
pub struct TokenSource {
    manager: Arc<TokenManager>,
    current: Arc<Mutex<Token>>,
}

impl TokenSource {
    pub fn new(manager: Arc<TokenManager>, token: Token) -> Self {
        Self {
            manager,
            current: Arc::new(Mutex::new(token)),
        }
    }

    pub async fn access_token(&self) -> Result<String> {
        let mut current = self.current.lock().await;
        if current.is_expired() && current.refresh_token.is_some() {
            let fresh = self.manager.refresh(&current).await?;
            *current = fresh;
        }
        Ok(current.access_token.clone())
    }
}

impl google_gmail1::common::GetToken for TokenSource {
    fn get_token<'a>(&'a self, _scopes: &'a [&str]) -> TokenFuture<'a> {
        Box::pin(async move {
            self.access_token()
                .await
                .map(Some)
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_store::FileCredentialStore;
    use serial_test::serial;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn secret_for(token_uri: &str) -> ApplicationSecret {
        ApplicationSecret {
            client_id: "client-123".to_string(),
            client_secret: "shh".to_string(),
            auth_uri: DEFAULT_AUTH_URI.to_string(),
            token_uri: token_uri.to_string(),
            ..Default::default()
        }
    }

    fn token(access: &str) -> Token {
        Token {
            access_token: access.to_string(),
            token_type: "Bearer".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
        }
    }

    #[test]
    fn test_scopes_constants() {
        assert_eq!(REQUIRED_SCOPES.len(), 2);
        assert!(REQUIRED_SCOPES.contains(&"https://www.googleapis.com/auth/gmail.send"));
        assert!(REQUIRED_SCOPES.contains(&"https://www.googleapis.com/auth/gmail.metadata"));
    }

    #[test]
    fn test_authorization_url() {
        let scopes: Vec<String> = REQUIRED_SCOPES.iter().map(|s| s.to_string()).collect();
        let url = authorization_url(
            DEFAULT_AUTH_URI,
            "client-123",
            "http://localhost:8080",
            &scopes,
            STATE_TOKEN,
        )
        .unwrap();

        let pairs: std::collections::HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "client-123");
        assert_eq!(pairs["redirect_uri"], "http://localhost:8080");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["access_type"], "offline");
        assert_eq!(pairs["state"], STATE_TOKEN);
        assert_eq!(pairs["scope"], scopes.join(" "));
        assert!(url.as_str().starts_with(DEFAULT_AUTH_URI));
    }

    #[test]
    fn test_authorization_url_rejects_bad_auth_uri() {
        let err = authorization_url("not a url", "c", "http://localhost", &[], "s").unwrap_err();
        assert!(matches!(err, MailerError::ConfigError(_)));
    }

    #[test]
    #[serial]
    fn test_load_credentials_from_env() {
        env::set_var("MAILCAST_CLIENT_ID", "test-id");
        env::set_var("MAILCAST_CLIENT_SECRET", "test-secret");

        let secret = load_credentials_from_env().unwrap();
        assert_eq!(secret.client_id, "test-id");
        assert_eq!(secret.client_secret, "test-secret");
        assert_eq!(secret.token_uri, DEFAULT_TOKEN_URI);

        env::remove_var("MAILCAST_CLIENT_ID");
        env::remove_var("MAILCAST_CLIENT_SECRET");
    }

    #[test]
    #[serial]
    fn test_load_credentials_from_env_missing() {
        env::remove_var("MAILCAST_CLIENT_ID");
        env::remove_var("MAILCAST_CLIENT_SECRET");
        assert!(load_credentials_from_env().is_err());
    }

    #[tokio::test]
    async fn test_read_client_secret_file() {
        let credentials_json = r#"{
            "installed": {
                "client_id": "test-client-id",
                "project_id": "test-project",
                "auth_uri": "https://accounts.google.com/o/oauth2/auth",
                "token_uri": "https://oauth2.googleapis.com/token",
                "client_secret": "test-secret",
                "redirect_uris": ["http://localhost"]
            }
        }"#;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        tokio::fs::write(&path, credentials_json).await.unwrap();

        let secret = read_client_secret(&path).await.unwrap();
        assert_eq!(secret.client_id, "test-client-id");
        assert_eq!(secret.client_secret, "test-secret");
    }

    #[tokio::test]
    async fn test_read_missing_client_secret_is_config_error() {
        let err = read_client_secret(Path::new("/nonexistent/credentials.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, MailerError::ConfigError(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_exchange_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.new",
                "token_type": "Bearer",
                "refresh_token": "1//r",
                "expires_in": 3599
            })))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = OAuthTokenEndpoint::new(&secret_for(&format!("{}/token", server.uri())));
        let token = endpoint.exchange_code("abc", "http://localhost:8080").await.unwrap();
        assert_eq!(token.access_token, "ya29.new");
        assert_eq!(token.refresh_token.as_deref(), Some("1//r"));
        assert!(!token.is_expired());
    }

    #[tokio::test]
    async fn test_exchange_code_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Bad Request"
            })))
            .mount(&server)
            .await;

        let endpoint = OAuthTokenEndpoint::new(&secret_for(&format!("{}/token", server.uri())));
        let err = endpoint.exchange_code("stale", "http://localhost:8080").await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn test_cached_token_skips_interactive_flow() {
        let mut store = crate::token_store::MockCredentialStore::new();
        store
            .expect_load()
            .returning(|_| Ok(Some(token("cached"))));
        store.expect_save().never();

        let mut server = MockAuthorizationServer::new();
        server.expect_exchange_code().never();

        let mut prompt = MockAuthorizationPrompt::new();
        prompt.expect_present().never();

        let manager = TokenManager::new(
            &secret_for(DEFAULT_TOKEN_URI),
            Arc::new(store),
            Arc::new(server),
            Arc::new(prompt),
            AuthOptions::default(),
        );

        let token = manager.token().await.unwrap();
        assert_eq!(token.access_token, "cached");
    }

    #[tokio::test]
    async fn test_refresh_replaces_stored_token() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileCredentialStore::new(dir.path()));

        let mut server = MockAuthorizationServer::new();
        server.expect_refresh().times(1).returning(|_| {
            Ok(Token {
                access_token: "rotated".to_string(),
                token_type: "Bearer".to_string(),
                refresh_token: None,
                expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
            })
        });

        let manager = Arc::new(TokenManager::new(
            &secret_for(DEFAULT_TOKEN_URI),
            store.clone(),
            Arc::new(server),
            Arc::new(MockAuthorizationPrompt::new()),
            AuthOptions::default(),
        ));

        let mut expired = token("old");
        expired.expires_at = Some(Utc::now() - ChronoDuration::minutes(5));

        let source = TokenSource::new(manager, expired);
        assert_eq!(source.access_token().await.unwrap(), "rotated");
        // second call reuses the fresh token
        assert_eq!(source.access_token().await.unwrap(), "rotated");

        let stored = store.load(DEFAULT_IDENTITY).await.unwrap().unwrap();
        assert_eq!(stored.access_token, "rotated");
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_refreshed_token_used_when_save_fails() {
        let mut store = crate::token_store::MockCredentialStore::new();
        store.expect_save().times(1).returning(|_, _| {
            Err(MailerError::IoError(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )))
        });

        let mut server = MockAuthorizationServer::new();
        server.expect_refresh().times(1).returning(|_| {
            Ok(Token {
                access_token: "rotated".to_string(),
                token_type: "Bearer".to_string(),
                refresh_token: None,
                expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
            })
        });

        let manager = Arc::new(TokenManager::new(
            &secret_for(DEFAULT_TOKEN_URI),
            Arc::new(store),
            Arc::new(server),
            Arc::new(MockAuthorizationPrompt::new()),
            AuthOptions::default(),
        ));

        let mut expired = token("old");
        expired.expires_at = Some(Utc::now() - ChronoDuration::minutes(5));

        let source = TokenSource::new(manager, expired);
        for _ in 0..3 {
            assert_eq!(source.access_token().await.unwrap(), "rotated");
        }
    }

    #[tokio::test]
    async fn test_valid_token_not_refreshed() {
        let mut server = MockAuthorizationServer::new();
        server.expect_refresh().never();

        let manager = Arc::new(TokenManager::new(
            &secret_for(DEFAULT_TOKEN_URI),
            Arc::new(crate::token_store::MockCredentialStore::new()),
            Arc::new(server),
            Arc::new(MockAuthorizationPrompt::new()),
            AuthOptions::default(),
        ));

        let source = TokenSource::new(manager, token("fresh"));
        assert_eq!(source.access_token().await.unwrap(), "fresh");
    }
}
