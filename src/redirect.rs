//! One-shot local HTTP listener that receives the OAuth2 redirect
//!
//! The listener accepts exactly one connection, reads the request head,
//! answers with a small HTML page and is dropped. Dropping the
//! [`RedirectListener`] closes the socket on every path, including errors
//! and timeouts.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::{MailerError, Result};

/// Longest request head we are willing to read
const MAX_REQUEST_HEAD: usize = 16 * 1024;

const SUCCESS_PAGE: &str = "<html><body><h3>Authorization complete.</h3>\
<p>You may now close this window.</p></body></html>";

const FAILURE_PAGE: &str = "<html><body><h3>Authorization failed.</h3>\
<p>Return to the terminal for details.</p></body></html>";

/// Query parameters carried by the redirect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl CallbackParams {
    /// Parse the request target of `GET <target> HTTP/1.1`
    pub fn from_request_target(target: &str) -> Result<Self> {
        let url = Url::parse("http://localhost/")
            .and_then(|base| base.join(target))
            .map_err(|e| MailerError::AuthError(format!("Malformed redirect request: {}", e)))?;

        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => params.code = Some(value.into_owned()),
                "state" => params.state = Some(value.into_owned()),
                "error" => params.error = Some(value.into_owned()),
                _ => {}
            }
        }
        Ok(params)
    }

    /// Extract the authorization code, checking the anti-forgery state
    pub fn into_code(self, expected_state: &str) -> Result<String> {
        if let Some(error) = self.error {
            return Err(MailerError::AuthError(format!(
                "Authorization was denied: {}",
                error
            )));
        }
        if self.state.as_deref() != Some(expected_state) {
            return Err(MailerError::AuthError(
                "Redirect state does not match the authorization request".to_string(),
            ));
        }
        self.code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| MailerError::AuthError("Redirect carried no authorization code".to_string()))
    }
}

/// Bound listener waiting for the browser redirect
#[derive(Debug)]
pub struct RedirectListener {
    listener: TcpListener,
    host: String,
}

impl RedirectListener {
    /// Bind `host:port`. Port 0 picks a free port.
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await.map_err(|e| {
            MailerError::AuthError(format!(
                "Unable to start local redirect listener on {}:{}: {}",
                host, port, e
            ))
        })?;
        debug!("Redirect listener bound to {:?}", listener.local_addr().ok());
        Ok(Self {
            listener,
            host: host.to_string(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Redirect URI to register in the authorization request
    pub fn redirect_uri(&self) -> Result<String> {
        Ok(format!("http://{}:{}", self.host, self.local_addr()?.port()))
    }

    /// Accept one connection and return its authorization code.
    ///
    /// `timeout` bounds the whole exchange; `None` waits indefinitely.
    pub async fn wait_for_code(self, expected_state: &str, timeout: Option<Duration>) -> Result<String> {
        let exchange = self.receive_one(expected_state);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, exchange).await.map_err(|_| {
                MailerError::AuthError(format!(
                    "Timed out after {:?} waiting for the authorization redirect",
                    limit
                ))
            })?,
            None => exchange.await,
        }
    }

    async fn receive_one(&self, expected_state: &str) -> Result<String> {
        let (stream, peer) = self.listener.accept().await.map_err(|e| {
            MailerError::AuthError(format!("Failed to accept redirect connection: {}", e))
        })?;
        debug!("Redirect connection from {}", peer);

        let (target, mut stream) = read_request_target(stream).await?;
        let outcome = CallbackParams::from_request_target(&target)
            .and_then(|params| params.into_code(expected_state));

        let page = if outcome.is_ok() { SUCCESS_PAGE } else { FAILURE_PAGE };
        if let Err(e) = write_html(&mut stream, page).await {
            warn!("Failed to answer the redirect request: {}", e);
        }

        outcome
    }
}

/// Read the request line and the rest of the head; returns the request target.
///
/// At most `MAX_REQUEST_HEAD` bytes are read from the connection.
async fn read_request_target(mut stream: TcpStream) -> Result<(String, TcpStream)> {
    let mut reader = BufReader::new((&mut stream).take(MAX_REQUEST_HEAD as u64));
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    if !request_line.ends_with('\n') {
        return Err(MailerError::AuthError(
            "Redirect request line is incomplete or too long".to_string(),
        ));
    }

    // Drain the headers so the browser sees a complete exchange
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    drop(reader);

    let mut parts = request_line.split_whitespace();
    let target = match (parts.next(), parts.next()) {
        (Some("GET"), Some(target)) => target.to_string(),
        _ => {
            return Err(MailerError::AuthError(format!(
                "Unexpected redirect request: {:?}",
                request_line.trim_end()
            )))
        }
    };

    Ok((target, stream))
}

async fn write_html(stream: &mut TcpStream, page: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        page.len(),
        page
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
