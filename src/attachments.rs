//! Attachment storage for messages and replies
//!
//! Uploads arrive base64-encoded inside JSON bodies and are written to
//! `<storage_dir>/attachments/<uuid>-<sanitized name>`. Rows store the path
//! relative to the attachment root.

use std::path::{Component, Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::CivicError;

/// Longest stored file name, in characters, before the uuid prefix
const MAX_NAME_CHARS: usize = 100;

/// Attachment as sent by clients
#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentUpload {
    pub name: String,
    /// Base64 payload, optionally prefixed with a `data:<mime>;base64,` header
    pub data: String,
}

/// Where an upload ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
    /// Path relative to the attachment root
    pub path: String,
    /// Original (sanitized) file name shown to users
    pub name: String,
    pub size: usize,
}

/// File-backed attachment store
pub struct AttachmentStore {
    root: PathBuf,
    max_bytes: usize,
}

impl AttachmentStore {
    pub async fn new<P: AsRef<Path>>(root: P, max_bytes: usize) -> Result<Self, CivicError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        info!(path = ?root, max_bytes, "Attachment store ready");
        Ok(Self { root, max_bytes })
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Decode and size-check an upload without touching the disk
    pub fn decode(&self, upload: &AttachmentUpload) -> Result<Vec<u8>, CivicError> {
        let payload = match upload.data.split_once(";base64,") {
            Some((header, rest)) if header.starts_with("data:") => rest,
            _ => upload.data.as_str(),
        };
        let payload = payload.trim();

        // Reject oversized payloads before allocating the decoded buffer
        if payload.len() / 4 * 3 > self.max_bytes + 2 {
            return Err(too_large(self.max_bytes));
        }

        let bytes = STANDARD
            .decode(payload)
            .map_err(|e| CivicError::InvalidInput(format!("Attachment is not valid base64: {}", e)))?;

        if bytes.is_empty() {
            return Err(CivicError::InvalidInput("Attachment is empty".into()));
        }
        if bytes.len() > self.max_bytes {
            return Err(too_large(self.max_bytes));
        }
        Ok(bytes)
    }

    /// Decode an upload and write it under a fresh name
    pub async fn save(&self, upload: &AttachmentUpload) -> Result<StoredAttachment, CivicError> {
        let bytes = self.decode(upload)?;
        let name = sanitize_file_name(&upload.name);
        let relative = format!("{}-{}", uuid::Uuid::new_v4(), name);

        fs::write(self.root.join(&relative), &bytes).await?;
        debug!(path = %relative, size = bytes.len(), "Stored attachment");

        Ok(StoredAttachment {
            path: relative,
            name,
            size: bytes.len(),
        })
    }

    pub async fn read(&self, relative: &str) -> Result<Vec<u8>, CivicError> {
        let path = self.resolve(relative)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CivicError::NotFound("Attachment file".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort removal, used when the row referencing a file is not written
    pub async fn remove(&self, relative: &str) {
        if let Ok(path) = self.resolve(relative) {
            if let Err(e) = fs::remove_file(&path).await {
                warn!(path = %relative, error = %e, "Failed to remove attachment");
            }
        }
    }

    /// Map a stored relative path into the root, refusing anything that
    /// could escape it
    fn resolve(&self, relative: &str) -> Result<PathBuf, CivicError> {
        let candidate = Path::new(relative);
        let plain = candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if relative.is_empty() || !plain {
            return Err(CivicError::NotFound("Attachment file".into()));
        }
        Ok(self.root.join(candidate))
    }
}

fn too_large(max_bytes: usize) -> CivicError {
    CivicError::InvalidInput(format!("Attachment exceeds {} bytes", max_bytes))
}

/// Keep the last path segment and replace anything outside `[A-Za-z0-9._-]`
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .take(MAX_NAME_CHARS)
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}

/// Content type guessed from the file extension
pub fn content_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "ogg" => "audio/ogg",
        "txt" => "text/plain; charset=utf-8",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
}
