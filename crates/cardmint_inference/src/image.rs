//! Image payload preparation and guardrails.

use cardmint_protocol::defaults;
use cardmint_protocol::error::{ErrorCode, StageError};
use std::path::{Path, PathBuf};

/// Reference to the image handed to an extractor.
///
/// The primary path only accepts `File`; inline bytes are rejected before
/// any network traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum ImagePayload {
    File { path: PathBuf, bytes: u64 },
    Inline(Vec<u8>),
}

impl ImagePayload {
    /// Stat a processed image on disk.
    pub fn from_file(path: &Path) -> std::io::Result<ImagePayload> {
        let bytes = std::fs::metadata(path)?.len();
        Ok(ImagePayload::File {
            path: path.to_path_buf(),
            bytes,
        })
    }

    pub fn byte_len(&self) -> u64 {
        match self {
            ImagePayload::File { bytes, .. } => *bytes,
            ImagePayload::Inline(data) => data.len() as u64,
        }
    }
}

/// Hook for the preprocessing step that downsizes captures to a 1024-px
/// JPEG around quality 82. The re-encode itself lives outside this crate;
/// implementations receive the raw capture and must land the result under
/// the preprocess target.
pub trait ImagePipeline: Send + Sync {
    fn prepare(&self, raw: &Path, out: &Path) -> Result<ImagePayload, StageError>;
}

/// Pipeline for sources that already deliver in-envelope JPEGs. Verifies
/// the size envelope and passes the file through untouched.
pub struct PassthroughPipeline;

impl ImagePipeline for PassthroughPipeline {
    fn prepare(&self, raw: &Path, _out: &Path) -> Result<ImagePayload, StageError> {
        let payload = ImagePayload::from_file(raw).map_err(|e| {
            StageError::new(ErrorCode::InferParse, format!("unreadable capture: {e}"))
        })?;
        if payload.byte_len() > defaults::PREPROCESS_TARGET_BYTES {
            tracing::warn!(
                bytes = payload.byte_len(),
                target = defaults::PREPROCESS_TARGET_BYTES,
                "Capture exceeds preprocess target; upload guardrail will decide"
            );
        }
        Ok(payload)
    }
}

/// Pre-call upload guardrail.
///
/// Exactly the limit passes; one byte over is rejected.
pub fn check_upload_guardrail(payload: &ImagePayload, max_bytes: u64) -> Result<(), StageError> {
    match payload {
        ImagePayload::Inline(_) => Err(StageError::new(
            ErrorCode::Infer4xx,
            "primary path requires a file reference, not inline data",
        )),
        ImagePayload::File { bytes, path } => {
            if *bytes > max_bytes {
                Err(StageError::new(
                    ErrorCode::InferOversize,
                    format!(
                        "image {} is {} bytes, over the {} byte limit",
                        path.display(),
                        bytes,
                        max_bytes
                    ),
                ))
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_payload(bytes: u64) -> ImagePayload {
        ImagePayload::File {
            path: PathBuf::from("/tmp/DSC00001.JPG"),
            bytes,
        }
    }

    #[test]
    fn exactly_at_limit_passes() {
        let limit = defaults::MAX_UPLOAD_BYTES;
        assert!(check_upload_guardrail(&file_payload(limit), limit).is_ok());
    }

    #[test]
    fn one_byte_over_is_oversize() {
        let limit = defaults::MAX_UPLOAD_BYTES;
        let err = check_upload_guardrail(&file_payload(limit + 1), limit).unwrap_err();
        assert_eq!(err.code, ErrorCode::InferOversize);
    }

    #[test]
    fn inline_data_is_rejected() {
        let err =
            check_upload_guardrail(&ImagePayload::Inline(vec![0; 16]), u64::MAX).unwrap_err();
        assert_eq!(err.code, ErrorCode::Infer4xx);
    }

    #[test]
    fn passthrough_stats_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("DSC00001.JPG");
        std::fs::write(&path, vec![0u8; 1024]).unwrap();
        let payload = PassthroughPipeline.prepare(&path, &path).unwrap();
        assert_eq!(payload.byte_len(), 1024);
    }
}
