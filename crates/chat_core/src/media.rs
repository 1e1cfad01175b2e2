//! Local file to durable remote object: read, name, upload, public URL.

use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::atomic::{AtomicI64, Ordering},
};

use backend::BackendHandle;
use chrono::Utc;
use shared::domain::{ConversationId, MediaKind, UserId};
use tracing::{debug, error, warn};
use url::Url;

use crate::error::ChatError;

pub const FALLBACK_EXTENSION: &str = "bin";
pub const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// A file the user picked or recorded, waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Plain path or `file://` URI.
    pub uri: String,
    pub kind: MediaKind,
}

impl Attachment {
    pub fn new(uri: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            uri: uri.into(),
            kind,
        }
    }
}

/// File extension for an upload of `kind` declared as `mime_type`. Never
/// fails: unrecognized types get [`FALLBACK_EXTENSION`].
pub fn extension_for(kind: MediaKind, mime_type: &str) -> &'static str {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let extension = match kind {
        MediaKind::Image => match essence.as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some("jpg"),
            "image/png" => Some("png"),
            "image/gif" => Some("gif"),
            "image/webp" => Some("webp"),
            "image/heic" => Some("heic"),
            "image/heif" => Some("heif"),
            _ => None,
        },
        MediaKind::Video => match essence.as_str() {
            "video/mp4" => Some("mp4"),
            "video/quicktime" => Some("mov"),
            "video/webm" => Some("webm"),
            "video/3gpp" => Some("3gp"),
            "video/x-matroska" => Some("mkv"),
            _ => None,
        },
        MediaKind::Audio => match essence.as_str() {
            "audio/mpeg" | "audio/mp3" => Some("mp3"),
            "audio/mp4" | "audio/m4a" | "audio/x-m4a" | "audio/aac" => Some("m4a"),
            "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
            "audio/ogg" => Some("ogg"),
            "audio/webm" => Some("webm"),
            "audio/3gpp" => Some("3gp"),
            _ => None,
        },
    };
    extension.unwrap_or(FALLBACK_EXTENSION)
}

/// Filesystem path for a plain path or a `file://` URI.
pub fn local_path(uri: &str) -> Result<PathBuf, ChatError> {
    if !uri.starts_with("file:") {
        return Ok(PathBuf::from(uri));
    }
    Url::parse(uri)
        .ok()
        .and_then(|url| url.to_file_path().ok())
        .ok_or_else(|| ChatError::UploadFailed(format!("unsupported file uri {uri}")))
}

/// Bytes and guessed MIME type of a local file.
pub async fn read_local(uri: &str, kind: MediaKind) -> Result<(Vec<u8>, String), ChatError> {
    let path = local_path(uri)?;
    let bytes = tokio::fs::read(&path).await.map_err(|err| match err.kind() {
        ErrorKind::PermissionDenied => ChatError::PermissionDenied { kind },
        _ => ChatError::UploadFailed(format!("cannot read {}: {err}", path.display())),
    })?;
    let mime_type = mime_guess::from_path(&path)
        .first()
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| FALLBACK_MIME_TYPE.to_string());
    Ok((bytes, mime_type))
}

pub struct MediaUploader {
    backend: BackendHandle,
    bucket: String,
    last_stamp: AtomicI64,
}

impl MediaUploader {
    pub fn new(backend: BackendHandle, bucket: impl Into<String>) -> Self {
        Self {
            backend,
            bucket: bucket.into(),
            last_stamp: AtomicI64::new(0),
        }
    }

    /// Uploads the file and returns its public URL, or `None` on any failure.
    pub async fn upload(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        local_uri: &str,
        kind: MediaKind,
    ) -> Option<String> {
        match self.try_upload(conversation_id, user_id, local_uri, kind).await {
            Ok(url) => Some(url),
            Err(err) => {
                error!(%conversation_id, %user_id, %kind, error = %err, "media: upload failed");
                None
            }
        }
    }

    pub async fn try_upload(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        local_uri: &str,
        kind: MediaKind,
    ) -> Result<String, ChatError> {
        let (bytes, mime_type) = read_local(local_uri, kind).await?;
        let key = self.object_key(conversation_id, user_id, extension_for(kind, &mime_type));
        let size = bytes.len();
        self.backend
            .objects
            .upload(&self.bucket, &key, bytes, &mime_type, false)
            .await
            .map_err(|err| ChatError::UploadFailed(err.to_string()))?;
        debug!(%conversation_id, %key, size, "media: uploaded");
        Ok(self.backend.objects.public_url(&self.bucket, &key))
    }

    /// `{conversation}/{user}_{millis}.{ext}` with the stamp strictly
    /// increasing across calls on this uploader.
    pub fn object_key(&self, conversation_id: ConversationId, user_id: UserId, extension: &str) -> String {
        format!("{conversation_id}/{user_id}_{}.{extension}", self.next_stamp())
    }

    fn next_stamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }

    /// Deletes an object previously returned by [`Self::upload`]. Best effort.
    pub async fn remove(&self, public_url: &str) -> bool {
        let prefix = self.backend.objects.public_url(&self.bucket, "");
        let Some(key) = public_url.strip_prefix(&prefix).filter(|key| !key.is_empty()) else {
            warn!(%public_url, "media: url is not in the media bucket");
            return false;
        };
        match self
            .backend
            .objects
            .remove(&self.bucket, &[key.to_string()])
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(%public_url, error = %err, "media: failed to remove object");
                false
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/media_tests.rs"]
mod tests;
