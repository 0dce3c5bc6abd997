//! mailcast
//!
//! Send email through Gmail from the command line: one recipient or a whole
//! list, with optional file attachments, authorized with an OAuth2
//! authorization-code flow whose token is cached locally.
//!
//! # Overview
//!
//! - **Composition**: MIME messages, plain or `multipart/mixed` with attachments
//! - **Authorization**: local-redirect OAuth2 flow with token caching and refresh
//! - **Dispatch**: fan-out to many recipients under a fixed concurrency ceiling,
//!   with per-recipient outcomes
//!
//! # Example Usage
//!
//! ```no_run
//! use mailcast::cli::{self, Cli, ProgressReporter, SendRequest};
//! use mailcast::config::Config;
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cli = Cli::parse();
//!     let config = Config::load(&cli.config_path()?).await?;
//!     let paths = cli.resolve_paths(&config)?;
//!
//!     // Fails with a setup error when `mailcast setup` has not been run
//!     let provider = cli::connect_provider(&config, &paths).await?;
//!
//!     let request = SendRequest::from_args(
//!         &config,
//!         "recipients.txt".to_string(),
//!         Some("Files".to_string()),
//!         Some("See attached".to_string()),
//!         vec!["report.pdf".into()],
//!         None,
//!     )?;
//!     let report = cli::run_send(provider, &request, &ProgressReporter::new()).await?;
//!     println!("{} sent, {} failed", report.sent(), report.failed());
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`attachment`] - Attachment validation and base64 MIME parts
//! - [`auth`] - OAuth2 authorization-code flow and token refresh
//! - [`cli`] - Command-line interface and command orchestration
//! - [`client`] - Gmail API gateway
//! - [`config`] - Configuration management
//! - [`dispatch`] - Bounded-concurrency fan-out with per-recipient outcomes
//! - [`error`] - Error types and result aliases
//! - [`message`] - Message composition and base64url payloads
//! - [`mime`] - MIME parts, multipart writer, quoted-printable
//! - [`recipients`] - Recipient lists and body sources
//! - [`redirect`] - One-shot OAuth2 redirect listener
//! - [`token_store`] - Token type and credential storage

pub mod attachment;
pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod mime;
pub mod recipients;
pub mod redirect;
pub mod token_store;

// Re-export commonly used types for convenience
pub use error::{MailerError, Result};

pub use attachment::AttachmentSet;
pub use auth::{TokenManager, TokenSource};
pub use client::{GmailProvider, MailProvider};
pub use config::{AuthConfig, Config, SendConfig};
pub use dispatch::{BulkDispatcher, DispatchOutcome, DispatchReport};
pub use message::{ComposedMessage, Composition, PreparedMail};
pub use recipients::{Recipient, Recipients};
pub use token_store::{CredentialStore, FileCredentialStore, Token};

// CLI types (for binary usage)
pub use cli::{Cli, Commands, ProgressReporter, SendRequest};
