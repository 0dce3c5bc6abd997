//! Gmail API gateway used by the dispatcher

use async_trait::async_trait;
use google_gmail1::{api::Message, hyper_rustls, hyper_util, Gmail};
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

use crate::auth::{TokenSource, METADATA_SCOPE, SEND_SCOPE};
use crate::error::{MailerError, Result};
use crate::message::ComposedMessage;

/// Type alias for the Gmail hub with HTTPS connector
pub type GmailHub =
    Gmail<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>>;

/// Mailbox addressed by every call
const MAILBOX: &str = "me";

/// Provider operations the send pipeline depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Submit one prebuilt message from the authenticated mailbox
    async fn send(&self, message: &ComposedMessage) -> Result<()>;

    /// Address of the authenticated account
    async fn profile_address(&self) -> Result<String>;
}

/// Production provider backed by one Gmail hub for the whole process
pub struct GmailProvider {
    hub: GmailHub,
}

impl GmailProvider {
    pub fn new(hub: GmailHub) -> Self {
        Self { hub }
    }

    /// Build an HTTP/1 TLS hub around `tokens`
    pub fn connect(tokens: TokenSource) -> Result<Self> {
        let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build(
                hyper_rustls::HttpsConnectorBuilder::new()
                    .with_native_roots()
                    .map_err(|e| MailerError::ConfigError(format!("Failed to load TLS roots: {}", e)))?
                    .https_or_http()
                    .enable_http1()
                    .build(),
            );

        Ok(Self::new(Gmail::new(client, tokens)))
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    async fn send(&self, message: &ComposedMessage) -> Result<()> {
        let mime_type: ::mime::Mime = "message/rfc822"
            .parse()
            .map_err(|e| MailerError::MessageBuild(format!("Invalid upload type: {}", e)))?;
        let document = message.to_mime()?;

        let (_, sent) = self
            .hub
            .users()
            .messages_send(Message::default(), MAILBOX)
            .add_scope(SEND_SCOPE)
            .upload(Cursor::new(document), mime_type)
            .await?;

        debug!("Message accepted (id={:?})", sent.id);
        Ok(())
    }

    async fn profile_address(&self) -> Result<String> {
        let (_, profile) = self
            .hub
            .users()
            .get_profile(MAILBOX)
            .add_scope(METADATA_SCOPE)
            .doit()
            .await?;

        profile
            .email_address
            .ok_or_else(|| MailerError::ApiError("Profile carried no email address".to_string()))
    }
}

#[async_trait]
impl<T: MailProvider + ?Sized> MailProvider for Arc<T> {
    async fn send(&self, message: &ComposedMessage) -> Result<()> {
        (**self).send(message).await
    }

    async fn profile_address(&self) -> Result<String> {
        (**self).profile_address().await
    }
}
