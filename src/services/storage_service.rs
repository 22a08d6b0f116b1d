use crate::error::{Error, Result};
use crate::models::proctoring::{Locator, StorageKind};
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

/// Storage configuration, detached from process env so tests can build it
/// directly.
#[derive(Debug, Clone, Default)]
pub struct StorageSettings {
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub bucket: Option<String>,
    pub public_base_url: Option<String>,
    pub media_root: PathBuf,
}

impl StorageSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            endpoint: config.s3_endpoint.clone(),
            access_key_id: config.s3_access_key_id.clone(),
            secret_access_key: config.s3_secret_access_key.clone(),
            bucket: config.s3_bucket.clone(),
            public_base_url: config.s3_public_base_url.clone(),
            media_root: PathBuf::from(&config.media_root),
        }
    }

    /// Pure function of configuration completeness: all four S3 settings
    /// present selects object storage, anything less selects local.
    pub fn selected_backend(&self) -> StorageKind {
        if self.missing_s3_settings().is_empty() {
            StorageKind::S3
        } else {
            StorageKind::Local
        }
    }

    fn missing_s3_settings(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        if !present(&self.endpoint) {
            missing.push("S3_ENDPOINT");
        }
        if !present(&self.access_key_id) {
            missing.push("S3_ACCESS_KEY_ID");
        }
        if !present(&self.secret_access_key) {
            missing.push("S3_SECRET_ACCESS_KEY");
        }
        if !present(&self.bucket) {
            missing.push("S3_BUCKET");
        }
        missing
    }
}

/// Inclusive byte range as requested by a client. `start` of `None` means
/// a suffix range of the final `suffix` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Clamp against the total object size. Returns the inclusive
    /// (start, end) actually served, or `None` when unsatisfiable.
    pub fn resolve(&self, total: u64) -> Option<(u64, u64)> {
        if total == 0 {
            return None;
        }
        match (self.start, self.end) {
            (Some(start), end) => {
                if start >= total {
                    return None;
                }
                let end = end.unwrap_or(total - 1).min(total - 1);
                if end < start {
                    return None;
                }
                Some((start, end))
            }
            // Suffix range: the final `end` bytes.
            (None, Some(suffix)) => {
                if suffix == 0 {
                    return None;
                }
                let start = total.saturating_sub(suffix);
                Some((start, total - 1))
            }
            (None, None) => None,
        }
    }
}

/// Parse a single-range `Range: bytes=...` header value. Multi-range
/// requests are not supported and yield `None` (served as a full read).
pub fn parse_range_header(value: &str) -> Option<ByteRange> {
    let spec = value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start_raw, end_raw) = spec.split_once('-')?;
    let start = if start_raw.is_empty() {
        None
    } else {
        Some(start_raw.parse().ok()?)
    };
    let end = if end_raw.is_empty() {
        None
    } else {
        Some(end_raw.parse().ok()?)
    };
    if start.is_none() && end.is_none() {
        return None;
    }
    Some(ByteRange { start, end })
}

/// One object read, range-resolved, with the body ready for streaming.
pub struct MediaRead {
    pub body: axum::body::Body,
    pub total_size: u64,
    /// Inclusive range actually served, when the read was partial.
    pub range: Option<(u64, u64)>,
    pub content_type: Option<String>,
}

struct S3Backend {
    client: S3Client,
    bucket: String,
    public_base_url: Option<String>,
}

/// Blob storage over either an S3-compatible object store or the local
/// filesystem. The backend is decided once at construction and never
/// re-evaluated, so every blob of one attempt lands on the same target.
pub struct StorageService {
    kind: StorageKind,
    media_root: PathBuf,
    s3: Option<S3Backend>,
}

impl StorageService {
    pub async fn new(settings: StorageSettings) -> Result<Self> {
        let kind = settings.selected_backend();
        let s3 = match kind {
            StorageKind::S3 => {
                let endpoint = settings.endpoint.clone().unwrap_or_default();
                let credentials = Credentials::new(
                    settings.access_key_id.clone().unwrap_or_default(),
                    settings.secret_access_key.clone().unwrap_or_default(),
                    None,
                    None,
                    "proctoring-config",
                );
                let sdk_config = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new("auto"))
                    .credentials_provider(credentials)
                    .endpoint_url(endpoint.clone())
                    .load()
                    .await;
                let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
                    .force_path_style(true)
                    .build();
                let bucket = settings.bucket.clone().unwrap_or_default();
                info!(
                    endpoint = %endpoint,
                    bucket = %bucket,
                    "Object storage configured, using S3 backend"
                );
                Some(S3Backend {
                    client: S3Client::from_conf(s3_config),
                    bucket,
                    public_base_url: settings.public_base_url.clone(),
                })
            }
            StorageKind::Local => {
                info!(
                    media_root = %settings.media_root.display(),
                    missing = ?settings.missing_s3_settings(),
                    "Object storage not fully configured, using local filesystem backend"
                );
                None
            }
        };

        Ok(Self {
            kind,
            media_root: settings.media_root,
            s3,
        })
    }

    pub fn backend(&self) -> StorageKind {
        self.kind
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    pub fn s3_key(attempt_id: Uuid, blob_id: &str) -> String {
        format!("proctoring/{}/{}", attempt_id, blob_id)
    }

    fn local_path(&self, attempt_id: Uuid, blob_id: &str) -> PathBuf {
        self.media_root.join(attempt_id.to_string()).join(blob_id)
    }

    fn s3_locator(s3: &S3Backend, key: String) -> Locator {
        let public_url = s3
            .public_base_url
            .as_deref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), key));
        Locator {
            backend: StorageKind::S3,
            key,
            public_url,
        }
    }

    /// Store one blob under the attempt's scope. A failed object-storage
    /// put is a hard failure; there is no fallback to local.
    pub async fn put(
        &self,
        attempt_id: Uuid,
        blob_id: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<Locator> {
        match &self.s3 {
            Some(s3) => {
                let key = Self::s3_key(attempt_id, blob_id);
                s3.client
                    .put_object()
                    .bucket(&s3.bucket)
                    .key(&key)
                    .content_type(content_type)
                    .body(ByteStream::from(bytes.to_vec()))
                    .send()
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(Self::s3_locator(s3, key))
            }
            None => {
                let path = self.local_path(attempt_id, blob_id);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, bytes).await?;
                Ok(Locator {
                    backend: StorageKind::Local,
                    key: path.to_string_lossy().into_owned(),
                    public_url: None,
                })
            }
        }
    }

    /// Store an existing local file (a merged recording) under the
    /// attempt's scope without loading it fully into memory.
    pub async fn put_named_file(
        &self,
        attempt_id: Uuid,
        file_name: &str,
        local_path: &Path,
        content_type: &str,
    ) -> Result<Locator> {
        match &self.s3 {
            Some(s3) => {
                let key = Self::s3_key(attempt_id, file_name);
                let body = ByteStream::from_path(local_path)
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
                s3.client
                    .put_object()
                    .bucket(&s3.bucket)
                    .key(&key)
                    .content_type(content_type)
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| Error::Storage(e.to_string()))?;
                Ok(Self::s3_locator(s3, key))
            }
            None => {
                let dest = self.local_path(attempt_id, file_name);
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                if dest != local_path {
                    tokio::fs::copy(local_path, &dest).await?;
                }
                Ok(Locator {
                    backend: StorageKind::Local,
                    key: dest.to_string_lossy().into_owned(),
                    public_url: None,
                })
            }
        }
    }

    /// Read back a stored blob, optionally a byte range of it, regardless
    /// of which backend its locator points at.
    pub async fn get(&self, locator: &Locator, range: Option<ByteRange>) -> Result<MediaRead> {
        match locator.backend {
            StorageKind::Local => self.get_local(locator, range).await,
            StorageKind::S3 => self.get_s3(locator, range).await,
        }
    }

    async fn get_local(&self, locator: &Locator, range: Option<ByteRange>) -> Result<MediaRead> {
        let mut file = tokio::fs::File::open(&locator.key)
            .await
            .map_err(|_| Error::NotFound(format!("Media not found: {}", locator.key)))?;
        let total_size = file.metadata().await?.len();

        let resolved = range.and_then(|r| r.resolve(total_size));
        match resolved {
            Some((start, end)) => {
                file.seek(std::io::SeekFrom::Start(start)).await?;
                let reader = file.take(end - start + 1);
                Ok(MediaRead {
                    body: axum::body::Body::from_stream(ReaderStream::new(reader)),
                    total_size,
                    range: Some((start, end)),
                    content_type: None,
                })
            }
            None => {
                if range.is_some() {
                    warn!(path = %locator.key, "Unsatisfiable range request, serving full file");
                }
                Ok(MediaRead {
                    body: axum::body::Body::from_stream(ReaderStream::new(file)),
                    total_size,
                    range: None,
                    content_type: None,
                })
            }
        }
    }

    async fn get_s3(&self, locator: &Locator, range: Option<ByteRange>) -> Result<MediaRead> {
        let s3 = self
            .s3
            .as_ref()
            .ok_or_else(|| Error::Storage("Object storage is not configured".to_string()))?;

        let head = s3
            .client
            .head_object()
            .bucket(&s3.bucket)
            .key(&locator.key)
            .send()
            .await
            .map_err(|_| Error::NotFound(format!("Media not found: {}", locator.key)))?;
        let total_size = head.content_length().unwrap_or(0).max(0) as u64;

        let resolved = range.and_then(|r| r.resolve(total_size));
        let mut request = s3.client.get_object().bucket(&s3.bucket).key(&locator.key);
        if let Some((start, end)) = resolved {
            request = request.range(format!("bytes={}-{}", start, end));
        }
        let output = request
            .send()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;

        Ok(MediaRead {
            body: axum::body::Body::from_stream(ReaderStream::new(
                output.body.into_async_read(),
            )),
            total_size,
            range: resolved,
            content_type: head.content_type().map(|s| s.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_settings() -> StorageSettings {
        StorageSettings {
            endpoint: Some("https://s3.example.test".to_string()),
            access_key_id: Some("key".to_string()),
            secret_access_key: Some("secret".to_string()),
            bucket: Some("proctoring".to_string()),
            public_base_url: None,
            media_root: PathBuf::from("/tmp/media"),
        }
    }

    fn temp_media_root() -> PathBuf {
        std::env::temp_dir().join(format!("proctoring-test-{}", Uuid::new_v4()))
    }

    #[test]
    fn complete_s3_settings_select_object_storage() {
        assert_eq!(full_settings().selected_backend(), StorageKind::S3);
    }

    #[test]
    fn any_missing_s3_setting_selects_local() {
        for strip in 0..4 {
            let mut settings = full_settings();
            match strip {
                0 => settings.endpoint = None,
                1 => settings.access_key_id = Some(String::new()),
                2 => settings.secret_access_key = None,
                3 => settings.bucket = None,
                _ => unreachable!(),
            }
            assert_eq!(settings.selected_backend(), StorageKind::Local);
        }
    }

    #[test]
    fn s3_keys_are_scoped_by_attempt() {
        let attempt = Uuid::new_v4();
        assert_eq!(
            StorageService::s3_key(attempt, "webcam-abc.webm"),
            format!("proctoring/{}/webcam-abc.webm", attempt)
        );
    }

    #[test]
    fn range_header_parsing() {
        assert_eq!(
            parse_range_header("bytes=0-99"),
            Some(ByteRange {
                start: Some(0),
                end: Some(99)
            })
        );
        assert_eq!(
            parse_range_header("bytes=100-"),
            Some(ByteRange {
                start: Some(100),
                end: None
            })
        );
        assert_eq!(
            parse_range_header("bytes=-500"),
            Some(ByteRange {
                start: None,
                end: Some(500)
            })
        );
        assert_eq!(parse_range_header("bytes=0-10,20-30"), None);
        assert_eq!(parse_range_header("items=0-10"), None);
        assert_eq!(parse_range_header("bytes=-"), None);
    }

    #[test]
    fn range_resolution_clamps_and_rejects() {
        let range = ByteRange {
            start: Some(10),
            end: Some(999),
        };
        assert_eq!(range.resolve(100), Some((10, 99)));

        let past_end = ByteRange {
            start: Some(100),
            end: None,
        };
        assert_eq!(past_end.resolve(100), None);

        let suffix = ByteRange {
            start: None,
            end: Some(30),
        };
        assert_eq!(suffix.resolve(100), Some((70, 99)));
        assert_eq!(suffix.resolve(10), Some((0, 9)));
    }

    #[tokio::test]
    async fn local_put_writes_under_media_root_and_tags_backend() {
        let media_root = temp_media_root();
        let storage = StorageService::new(StorageSettings {
            media_root: media_root.clone(),
            ..Default::default()
        })
        .await
        .expect("storage");

        let attempt = Uuid::new_v4();
        let locator = storage
            .put(attempt, "webcam-seg0.webm", b"payload-bytes", "video/webm")
            .await
            .expect("put");

        assert_eq!(locator.backend, StorageKind::Local);
        let expected = media_root.join(attempt.to_string()).join("webcam-seg0.webm");
        assert_eq!(locator.key, expected.to_string_lossy());
        assert_eq!(std::fs::read(&expected).expect("read back"), b"payload-bytes");

        tokio::fs::remove_dir_all(&media_root).await.ok();
    }

    #[tokio::test]
    async fn local_get_serves_partial_content() {
        let media_root = temp_media_root();
        let storage = StorageService::new(StorageSettings {
            media_root: media_root.clone(),
            ..Default::default()
        })
        .await
        .expect("storage");

        let attempt = Uuid::new_v4();
        let locator = storage
            .put(attempt, "screen-seg0.webm", b"0123456789", "video/webm")
            .await
            .expect("put");

        let read = storage
            .get(
                &locator,
                Some(ByteRange {
                    start: Some(2),
                    end: Some(5),
                }),
            )
            .await
            .expect("get");
        assert_eq!(read.total_size, 10);
        assert_eq!(read.range, Some((2, 5)));

        let bytes = axum::body::to_bytes(read.body, usize::MAX).await.expect("body");
        assert_eq!(&bytes[..], b"2345");

        tokio::fs::remove_dir_all(&media_root).await.ok();
    }
}
