//! Upload-target issuing for encrypted attachments.
//!
//! The engine never stores file bytes. A client that wants to attach a file
//! asks for an upload target, PUTs the ciphertext at the returned URL, and
//! then references the opaque `reference` string from its message metadata.

use uuid::Uuid;

use causerie_core::collab::{UploadError, UploadMetadata, UploadTarget, UploadTargetProvider};

/// Issues targets under a fixed base URL (an object store or reverse proxy).
pub struct StaticUploadTargets {
    base_url: String,
    max_size: u64,
}

impl StaticUploadTargets {
    pub fn new(base_url: impl Into<String>, max_size: u64) -> Self {
        Self {
            base_url: base_url.into(),
            max_size,
        }
    }
}

impl UploadTargetProvider for StaticUploadTargets {
    fn request_upload_target(&self, metadata: &UploadMetadata) -> Result<UploadTarget, UploadError> {
        if metadata.file_name.is_empty() {
            return Err(UploadError::Rejected("missing file name".into()));
        }
        if metadata.size_bytes == 0 {
            return Err(UploadError::Rejected("empty upload".into()));
        }
        if metadata.size_bytes > self.max_size {
            return Err(UploadError::Rejected(format!(
                "declared size {} exceeds limit {}",
                metadata.size_bytes, self.max_size
            )));
        }

        let reference = format!("upload/{}", Uuid::new_v4());
        let upload_url = format!("{}/{}", self.base_url.trim_end_matches('/'), reference);
        Ok(UploadTarget {
            reference,
            upload_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(size: u64) -> UploadMetadata {
        UploadMetadata {
            file_name: "photo.jpg.enc".into(),
            size_bytes: size,
            mime_type: "application/octet-stream".into(),
        }
    }

    #[test]
    fn target_is_under_the_base_url() {
        let provider = StaticUploadTargets::new("https://files.example/", 1024);
        let target = provider.request_upload_target(&metadata(512)).unwrap();
        assert!(target.upload_url.starts_with("https://files.example/upload/"));
        assert!(target.upload_url.ends_with(&target.reference));
    }

    #[test]
    fn oversized_and_empty_uploads_are_rejected() {
        let provider = StaticUploadTargets::new("https://files.example", 1024);
        assert!(provider.request_upload_target(&metadata(2048)).is_err());
        assert!(provider.request_upload_target(&metadata(0)).is_err());
    }

    #[test]
    fn references_are_unique() {
        let provider = StaticUploadTargets::new("https://files.example", 1024);
        let a = provider.request_upload_target(&metadata(1)).unwrap();
        let b = provider.request_upload_target(&metadata(1)).unwrap();
        assert_ne!(a.reference, b.reference);
    }
}
