//! Outbound message composition
//!
//! A [`Composition`] is the caller's request (subject, body, attachments).
//! [`Composition::prepare`] encodes the attachments once; the resulting
//! [`PreparedMail`] then builds one [`ComposedMessage`] per recipient.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::attachment::encode_attachments;
use crate::error::{MailerError, Result};
use crate::mime::{encode_quoted_printable, generate_boundary, write_header_block, MimePart, MultipartWriter};

/// What to send, independent of who receives it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composition {
    pub subject: String,
    pub body: String,
    /// Attachment paths, already validated by the caller
    pub attachments: Vec<PathBuf>,
}

impl Composition {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<PathBuf>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Read and encode every attachment. Any failure aborts the whole preparation.
    pub async fn prepare(&self) -> Result<PreparedMail> {
        let parts = encode_attachments(&self.attachments).await?;
        debug!("Prepared message with {} attachment part(s)", parts.len());
        Ok(PreparedMail {
            subject: self.subject.clone(),
            body: self.body.clone(),
            attachments: parts.into(),
        })
    }
}

/// A composition whose attachments are already encoded
#[derive(Debug, Clone)]
pub struct PreparedMail {
    subject: String,
    body: String,
    attachments: Arc<[MimePart]>,
}

impl PreparedMail {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    /// Build the message addressed to `to`.
    ///
    /// Plain mode without attachments, `multipart/mixed` otherwise.
    pub fn compose_for(&self, to: &str) -> ComposedMessage {
        if self.attachments.is_empty() {
            build_plain(to, &self.subject, &self.body)
        } else {
            build_multipart(to, &self.subject, &self.body, &self.attachments)
        }
    }
}

/// A transport-ready message: the MIME document, base64url-encoded without padding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    raw: String,
}

impl ComposedMessage {
    fn from_mime(mime: &[u8]) -> Self {
        Self {
            raw: URL_SAFE_NO_PAD.encode(mime),
        }
    }

    /// The base64url payload
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The MIME document behind the payload
    pub fn to_mime(&self) -> Result<Vec<u8>> {
        URL_SAFE_NO_PAD
            .decode(&self.raw)
            .map_err(|e| MailerError::MessageBuild(format!("Invalid message encoding: {}", e)))
    }
}

/// Single-part `text/plain` message
pub fn build_plain(to: &str, subject: &str, body: &str) -> ComposedMessage {
    let mut out = Vec::with_capacity(body.len() + 128);
    write_header_block(
        &mut out,
        [
            ("To", to),
            ("Subject", subject),
            ("MIME-Version", "1.0"),
            ("Content-Type", "text/plain; charset=\"utf-8\""),
        ],
    );
    out.extend_from_slice(body.as_bytes());
    ComposedMessage::from_mime(&out)
}

/// `multipart/mixed` message: a quoted-printable text part followed by the attachment parts
pub fn build_multipart(to: &str, subject: &str, body: &str, attachments: &[MimePart]) -> ComposedMessage {
    let boundary = generate_boundary();
    let content_type = format!("multipart/mixed; boundary={}", boundary);

    let mut out = Vec::new();
    write_header_block(
        &mut out,
        [
            ("To", to),
            ("Subject", subject),
            ("MIME-Version", "1.0"),
            ("Content-Type", content_type.as_str()),
        ],
    );

    let text = MimePart::new(encode_quoted_printable(body.as_bytes()))
        .with_header("Content-Type", "text/plain; charset=\"UTF-8\"")
        .with_header("Content-Transfer-Encoding", "quoted-printable");

    let mut writer = MultipartWriter::new(out, boundary);
    writer.append(&text);
    for part in attachments {
        writer.append(part);
    }

    ComposedMessage::from_mime(&writer.finish())
}
