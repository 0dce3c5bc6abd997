//! Attachment validation and encoding
//!
//! Attachments are validated with a single filter pass before a message is
//! built, then read and encoded concurrently. Encoded parts come back in
//! completion order; the multipart envelope does not depend on it.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{MailerError, Result};
use crate::mime::{wrap_base64, MimePart};

/// Upper bound on files read at the same time
const MAX_CONCURRENT_READS: usize = 8;

/// Result of validating requested attachment paths
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentSet {
    /// Paths that exist and are regular files, in request order
    pub valid: Vec<PathBuf>,
    /// Paths that were dropped
    pub rejected: Vec<PathBuf>,
}

impl AttachmentSet {
    /// Split `paths` into usable and dropped entries without mutating the input.
    ///
    /// Every entry is checked, no matter how many were rejected before it.
    pub fn validate<P: AsRef<Path>>(paths: &[P]) -> Self {
        let (valid, rejected): (Vec<PathBuf>, Vec<PathBuf>) = paths
            .iter()
            .map(|p| p.as_ref().to_path_buf())
            .partition(|p| p.is_file());

        for path in &rejected {
            warn!("Attachment file not found, skipping: {}", path.display());
        }
        debug!(
            "Validated attachments: {} usable, {} dropped",
            valid.len(),
            rejected.len()
        );

        Self { valid, rejected }
    }

    pub fn is_empty(&self) -> bool {
        self.valid.is_empty()
    }
}

/// Final path component used for the `name`/`filename` parameters
pub fn attachment_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Build the MIME part for one file's contents
pub fn attachment_part(filename: &str, data: &[u8]) -> MimePart {
    MimePart::new(wrap_base64(data))
        .with_header(
            "Content-Type",
            format!("application/octet-stream; name=\"{}\"", filename),
        )
        .with_header(
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", filename),
        )
        .with_header("Content-Transfer-Encoding", "base64")
}

/// Read a file and wrap it as a base64 attachment part
pub async fn encode_attachment(path: &Path) -> Result<MimePart> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| MailerError::attachment(path, e))?;

    let filename = attachment_name(path);
    debug!("Encoding attachment {} ({} bytes)", filename, data.len());

    Ok(attachment_part(&filename, &data))
}

/// Encode all attachments concurrently.
///
/// Fails with the first read error; no parts are returned in that case.
pub async fn encode_attachments(paths: &[PathBuf]) -> Result<Vec<MimePart>> {
    stream::iter(paths)
        .map(|path| encode_attachment(path))
        .buffer_unordered(MAX_CONCURRENT_READS)
        .try_collect()
        .await
}
