//! Image transfer adapter: turns caller image references into URLs the try-on
//! provider can fetch. Remote URLs pass through; inline base64 payloads are
//! validated, decoded and uploaded to object storage.

use crate::storage::{ObjectStore, StorageError};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid inline image: {0}")]
    InvalidEncoding(String),
    #[error("unsupported image reference: {0}")]
    UnsupportedReference(String),
    #[error(transparent)]
    Upload(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
    Gif,
}

impl ImageFormat {
    fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type.trim().to_lowercase().as_str() {
            "image/png" => Some(Self::Png),
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/webp" => Some(Self::Webp),
            "image/gif" => Some(Self::Gif),
            _ => None,
        }
    }

    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            Some(Self::Png)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(Self::Webp)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(Self::Gif)
        } else {
            None
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
            Self::Gif => "image/gif",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
            Self::Gif => "gif",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Remote(String),
    Inline { format: ImageFormat, bytes: Vec<u8> },
}

impl ImageRef {
    pub fn parse(raw: &str) -> Result<Self, TransferError> {
        let raw = raw.trim();
        if raw.starts_with("data:") {
            return parse_data_uri(raw);
        }
        match reqwest::Url::parse(raw) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                Ok(Self::Remote(raw.to_string()))
            }
            Ok(url) => Err(TransferError::UnsupportedReference(format!(
                "scheme `{}`",
                url.scheme()
            ))),
            Err(_) => Err(TransferError::UnsupportedReference(
                "expected an http(s) URL or a data URI".into(),
            )),
        }
    }
}

fn parse_data_uri(raw: &str) -> Result<ImageRef, TransferError> {
    let (header, payload) = raw
        .split_once(',')
        .ok_or_else(|| TransferError::InvalidEncoding("missing payload separator".into()))?;
    let header = header.trim_start_matches("data:");
    let Some(media_type) = header.strip_suffix(";base64") else {
        return Err(TransferError::InvalidEncoding(
            "payload is not base64 encoded".into(),
        ));
    };
    let declared = ImageFormat::from_media_type(media_type).ok_or_else(|| {
        TransferError::InvalidEncoding(format!("unsupported media type `{media_type}`"))
    })?;

    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(compact.as_bytes())
        .map_err(|err| TransferError::InvalidEncoding(err.to_string()))?;

    match ImageFormat::sniff(&bytes) {
        Some(actual) if actual == declared => Ok(ImageRef::Inline {
            format: declared,
            bytes,
        }),
        Some(actual) => Err(TransferError::InvalidEncoding(format!(
            "declared {} but payload is {}",
            declared.content_type(),
            actual.content_type()
        ))),
        None => Err(TransferError::InvalidEncoding(
            "payload is not a recognised image".into(),
        )),
    }
}

/// Namespace an upload lands in.
#[derive(Debug, Clone, Copy)]
pub enum ImagePurpose {
    Garment,
    Model,
    Background,
}

impl ImagePurpose {
    fn dir(&self) -> &'static str {
        match self {
            Self::Garment => "garments",
            Self::Model => "models",
            Self::Background => "backgrounds",
        }
    }
}

#[derive(Clone)]
pub struct ImageTransfer {
    store: Arc<dyn ObjectStore>,
}

impl ImageTransfer {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub async fn ensure_fetchable(
        &self,
        raw: &str,
        purpose: ImagePurpose,
    ) -> Result<String, TransferError> {
        match ImageRef::parse(raw)? {
            ImageRef::Remote(url) => Ok(url),
            ImageRef::Inline { format, bytes } => self.upload(purpose, format, bytes).await,
        }
    }

    pub async fn upload(
        &self,
        purpose: ImagePurpose,
        format: ImageFormat,
        bytes: Vec<u8>,
    ) -> Result<String, TransferError> {
        let key = format!(
            "tryon/{}/{}.{}",
            purpose.dir(),
            Uuid::new_v4().simple(),
            format.extension()
        );
        let size = bytes.len();
        let url = self.store.put(&key, bytes, format.content_type()).await?;
        info!(target = "thrift.transfer", key = %key, bytes = size, "inline_image_uploaded");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn png_bytes() -> Vec<u8> {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(b"\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x02\0\0\0");
        bytes
    }

    fn data_uri(media_type: &str, bytes: &[u8]) -> String {
        format!("data:{media_type};base64,{}", BASE64.encode(bytes))
    }

    #[test]
    fn remote_urls_pass_through() {
        let parsed = ImageRef::parse(" https://cdn.example/shirt.jpg ").unwrap();
        assert_eq!(parsed, ImageRef::Remote("https://cdn.example/shirt.jpg".into()));
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        let err = ImageRef::parse("file:///etc/passwd").unwrap_err();
        assert!(matches!(err, TransferError::UnsupportedReference(_)));
        let err = ImageRef::parse("not a url").unwrap_err();
        assert!(matches!(err, TransferError::UnsupportedReference(_)));
    }

    #[test]
    fn unsupported_media_type_is_invalid_encoding() {
        let err = ImageRef::parse(&data_uri("image/tiff", &png_bytes())).unwrap_err();
        assert!(matches!(err, TransferError::InvalidEncoding(_)));
    }

    #[test]
    fn header_must_match_payload() {
        let err = ImageRef::parse(&data_uri("image/jpeg", &png_bytes())).unwrap_err();
        assert!(matches!(err, TransferError::InvalidEncoding(msg) if msg.contains("image/png")));
    }

    #[test]
    fn garbage_base64_is_invalid_encoding() {
        let err = ImageRef::parse("data:image/png;base64,@@@@").unwrap_err();
        assert!(matches!(err, TransferError::InvalidEncoding(_)));
        let err = ImageRef::parse("data:image/png,plain").unwrap_err();
        assert!(matches!(err, TransferError::InvalidEncoding(_)));
    }

    #[tokio::test]
    async fn inline_png_round_trips_through_storage() {
        let store = Arc::new(MemoryStore::new("http://localhost:8000"));
        let transfer = ImageTransfer::new(store.clone());
        let original = png_bytes();

        let url = transfer
            .ensure_fetchable(&data_uri("image/png", &original), ImagePurpose::Garment)
            .await
            .unwrap();
        assert!(url.starts_with("http://localhost:8000/objects/tryon/garments/"));
        assert!(url.ends_with(".png"));

        let fetched = store.fetch_url(&url).await.unwrap();
        assert_eq!(fetched.bytes, original);
        assert_eq!(fetched.content_type, "image/png");
    }

    #[tokio::test]
    async fn remote_reference_does_not_upload() {
        let store = Arc::new(MemoryStore::new("http://localhost:8000"));
        let transfer = ImageTransfer::new(store.clone());
        let url = transfer
            .ensure_fetchable("https://cdn.example/a.jpg", ImagePurpose::Model)
            .await
            .unwrap();
        assert_eq!(url, "https://cdn.example/a.jpg");
        assert_eq!(store.len().await, 0);
    }
}
