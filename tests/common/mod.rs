//! Common test utilities and fixtures
#![allow(dead_code)]

use chrono::{Duration, Utc};
use mailcast::error::Result;
use mailcast::message::ComposedMessage;
use mailcast::token_store::Token;
use mockall::mock;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

mock! {
    pub Provider {}

    #[async_trait::async_trait]
    impl mailcast::client::MailProvider for Provider {
        async fn send(&self, message: &ComposedMessage) -> Result<()>;
        async fn profile_address(&self) -> Result<String>;
    }
}

mock! {
    pub Store {}

    #[async_trait::async_trait]
    impl mailcast::token_store::CredentialStore for Store {
        async fn load(&self, identity: &str) -> Result<Option<Token>>;
        async fn save(&self, identity: &str, token: &Token) -> Result<()>;
    }
}

/// Token valid for another hour
pub fn create_test_token(access: &str) -> Token {
    Token {
        access_token: access.to_string(),
        token_type: "Bearer".to_string(),
        refresh_token: Some("1//refresh".to_string()),
        expires_at: Some(Utc::now() + Duration::hours(1)),
    }
}

/// Write `contents` to `dir/name` and return the path
pub fn write_fixture(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// Recipient list file with the given lines
pub fn write_recipient_list(dir: &TempDir, lines: &[&str]) -> PathBuf {
    write_fixture(dir, "recipients.txt", lines.join("\n").as_bytes())
}

/// Provider `credentials.json` in the "installed application" layout
pub fn write_client_secret(dir: &Path, token_uri: &str) -> PathBuf {
    let json = serde_json::json!({
        "installed": {
            "client_id": "test-client-id.apps.googleusercontent.com",
            "project_id": "mailcast-test",
            "auth_uri": "https://accounts.google.com/o/oauth2/auth",
            "token_uri": token_uri,
            "client_secret": "test-secret",
            "redirect_uris": ["http://localhost"]
        }
    });
    let path = dir.join("credentials.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&json).unwrap()).unwrap();
    path
}

/// Decoded MIME document of a composed message
pub fn decode_message(message: &ComposedMessage) -> String {
    String::from_utf8(message.to_mime().unwrap()).unwrap()
}

/// Value of the first `name:` header line in the top-level header block
pub fn header_value(mime: &str, name: &str) -> Option<String> {
    let prefix = format!("{}: ", name);
    mime.split("\r\n")
        .take_while(|line| !line.is_empty())
        .find_map(|line| line.strip_prefix(&prefix).map(str::to_string))
}

/// Split a `multipart/mixed` document into (headers, body) pairs
pub fn split_multipart(mime: &str) -> Vec<(String, String)> {
    let boundary = header_value(mime, "Content-Type")
        .and_then(|ct| ct.split("boundary=").nth(1).map(str::to_string))
        .expect("no multipart boundary");

    let delimiter = format!("--{}", boundary);
    let closing = format!("--{}--", boundary);
    let body = mime.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or("");
    let body = body.split(&closing).next().unwrap_or("");

    body.split(&delimiter)
        .filter_map(|chunk| {
            let chunk = chunk.strip_prefix("\r\n")?;
            let chunk = chunk.strip_suffix("\r\n").unwrap_or(chunk);
            let (headers, content) = chunk.split_once("\r\n\r\n")?;
            Some((headers.to_string(), content.to_string()))
        })
        .collect()
}

/// Reverse quoted-printable encoding (soft breaks and `=XX` escapes)
pub fn decode_quoted_printable(encoded: &str) -> Vec<u8> {
    let joined = encoded.replace("=\r\n", "");
    let bytes = joined.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap();
            out.push(u8::from_str_radix(hex, 16).unwrap());
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    out
}
