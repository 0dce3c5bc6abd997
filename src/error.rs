use std::path::PathBuf;

use thiserror::Error;

/// Type alias for Result with MailerError
pub type Result<T> = std::result::Result<T, MailerError>;

/// Error types for composing, authorizing and dispatching mail
#[derive(Error, Debug)]
pub enum MailerError {
    /// Configuration error (missing credentials file, malformed config, ...)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Authentication / authorization failed
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// An attachment could not be read
    #[error("Attachment {path:?} could not be read: {message}")]
    AttachmentError { path: PathBuf, message: String },

    /// Message could not be composed
    #[error("Message construction failed: {0}")]
    MessageBuild(String),

    /// Mail provider returned an error
    #[error("Gmail API error: {0}")]
    ApiError(String),

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Provider rejected the call because of rate limits (429)
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic catch-all error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl MailerError {
    /// Setup and authorization failures end the invocation; everything else
    /// is scoped to one attachment, message or recipient.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MailerError::ConfigError(_) | MailerError::AuthError(_))
    }

    pub fn attachment(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        MailerError::AttachmentError {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

impl From<google_gmail1::Error> for MailerError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            // HTTP response with status code (non-success responses)
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                match status_code {
                    400 => MailerError::BadRequest(message),
                    401 => MailerError::AuthError(message),
                    403 => MailerError::Forbidden(message),
                    429 => MailerError::RateLimitExceeded(message),
                    500..=599 => MailerError::ServerError {
                        status: status_code,
                        message,
                    },
                    _ => MailerError::ApiError(message),
                }
            }
            google_gmail1::Error::BadRequest(ref err) => MailerError::BadRequest(format!("{}", err)),
            google_gmail1::Error::HttpError(ref err) => {
                MailerError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => MailerError::NetworkError(err.to_string()),
            _ => MailerError::ApiError(error.to_string()),
        }
    }
}

impl From<reqwest::Error> for MailerError {
    fn from(error: reqwest::Error) -> Self {
        MailerError::NetworkError(error.to_string())
    }
}
