//! Materializes base64 QR images embedded in push payloads.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use stream_gateway_core::{AttachmentError, AttachmentStore, StreamResponse};
use uuid::Uuid;

/// Payload field carrying the encoded image.
const ATTACHMENT_FIELD: &str = "qrcode";

/// Writes decoded attachments as files under one directory.
#[derive(Debug, Clone)]
pub struct FileAttachmentStore {
    dir: PathBuf,
}

impl Default for FileAttachmentStore {
    fn default() -> Self {
        Self::new(Self::default_dir())
    }
}

impl FileAttachmentStore {
    /// Create a store writing into `dir` (created on first write).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<cache dir>/stream-gateway`, or the temp dir when no cache dir is known.
    #[must_use]
    pub fn default_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("stream-gateway")
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Extract the encoded attachment from a payload, if any.
fn encoded_attachment(frame: &StreamResponse) -> Option<String> {
    let payload = frame.payload().ok()?;
    payload
        .get(ATTACHMENT_FIELD)?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl AttachmentStore for FileAttachmentStore {
    async fn materialize(
        &self,
        frame: &StreamResponse,
    ) -> Result<Option<PathBuf>, AttachmentError> {
        let Some(encoded) = encoded_attachment(frame) else {
            return Ok(None);
        };
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| AttachmentError::Decode(e.to_string()))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("qrcode-{}.png", Uuid::new_v4()));
        tokio::fs::write(&path, &bytes).await?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Attachment saved");
        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use stream_gateway_core::ResponseType;

    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("stream-gateway-test-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_saves_decoded_qrcode() {
        let dir = scratch_dir();
        let store = FileAttachmentStore::new(&dir);
        let frame = StreamResponse::push(
            ResponseType::LoginQrcode,
            json!({ "qrcode": BASE64.encode(b"png-bytes"), "qrcodeId": 7 }).to_string(),
        );

        let path = store.materialize(&frame).await.unwrap().unwrap();
        assert!(path.starts_with(&dir));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"png-bytes");

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_frames_without_attachment_are_skipped() {
        let store = FileAttachmentStore::new(scratch_dir());
        let plain = StreamResponse::push(ResponseType::StatusNotify, r#"{"uin":1}"#);
        assert!(store.materialize(&plain).await.unwrap().is_none());

        let not_json = StreamResponse::push(ResponseType::StatusNotify, "text");
        assert!(store.materialize(&not_json).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_base64_fails_distinctly() {
        let store = FileAttachmentStore::new(scratch_dir());
        let frame = StreamResponse::push(
            ResponseType::LoginQrcode,
            json!({ "qrcode": "%%% not base64 %%%" }).to_string(),
        );
        assert!(matches!(
            store.materialize(&frame).await,
            Err(AttachmentError::Decode(_))
        ));
    }
}
