//! Recipient collection and body resolution

use std::fmt;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::error::{MailerError, Result};

/// A single destination address. Only trimmed and checked for emptiness.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Recipient(String);

impl Recipient {
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the recipients came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipients {
    Single(Recipient),
    List(Vec<Recipient>),
}

impl Recipients {
    pub fn as_slice(&self) -> &[Recipient] {
        match self {
            Recipients::Single(r) => std::slice::from_ref(r),
            Recipients::List(list) => list,
        }
    }
}

/// Parse a recipient list: one address per line, blank lines skipped
pub fn parse_recipient_list(text: &str) -> Vec<Recipient> {
    text.lines().filter_map(Recipient::parse).collect()
}

/// Interpret `--to`: an existing file is a recipient list, anything else a single address
pub async fn resolve_recipients(to: &str) -> Result<Recipients> {
    let path = Path::new(to);
    if path.is_file() {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            MailerError::ConfigError(format!("Failed to read recipient list {:?}: {}", path, e))
        })?;
        let list = parse_recipient_list(&text);
        if list.is_empty() {
            return Err(MailerError::ConfigError(format!(
                "Recipient list {:?} contains no addresses",
                path
            )));
        }
        info!("Loaded {} recipients from {:?}", list.len(), path);
        return Ok(Recipients::List(list));
    }

    Recipient::parse(to)
        .map(Recipients::Single)
        .ok_or_else(|| MailerError::ConfigError("Recipient address is empty".to_string()))
}

/// Interpret `--body`: `-` reads stdin, an existing file is read, anything else is literal text
pub async fn resolve_body(body: &str) -> Result<String> {
    if body == "-" {
        let mut text = String::new();
        tokio::io::stdin().read_to_string(&mut text).await?;
        debug!("Read {} bytes of body text from stdin", text.len());
        return Ok(text);
    }

    let path = Path::new(body);
    if path.is_file() {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            MailerError::ConfigError(format!("Failed to read body file {:?}: {}", path, e))
        })?;
        debug!("Read body text from {:?}", path);
        return Ok(text);
    }

    Ok(body.to_string())
}
