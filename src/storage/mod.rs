//! Blob storage abstraction.
//!
//! Provides a unified interface over S3 and the local filesystem, including
//! a streaming multipart writer for the export sink and a streaming download
//! for the import source.

mod key;
mod local;
mod s3;

pub use key::backup_key;
pub use local::LocalConfig;
pub use s3::S3Config;

use bytes::Bytes;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use object_store::path::Path;
use object_store::{
    Attribute, Attributes, MultipartUpload, ObjectStore, PutMultipartOpts, PutOptions, PutPayload,
};
use regex::Regex;
use snafu::prelude::*;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::emit;
use crate::error::{InvalidUrlSnafu, IoSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::BytesUploaded;

/// A reference-counted storage provider.
pub type StorageProviderRef = Arc<StorageProvider>;

/// Storage provider that abstracts over the supported backends.
#[derive(Clone)]
pub struct StorageProvider {
    pub(crate) config: BackendConfig,
    pub(crate) object_store: Arc<dyn ObjectStore>,
    pub(crate) canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

// URL patterns for the supported storage backends
const S3_PATH: &str =
    r"^https://s3\.(?P<region>[\w\-]+)\.amazonaws\.com/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_VIRTUAL: &str =
    r"^https://(?P<bucket>[a-z0-9\-\.]+)\.s3\.(?P<region>[\w\-]+)\.amazonaws\.com(/(?P<key>.+))?$";
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
enum Backend {
    S3,
    Local,
}

fn matchers() -> &'static HashMap<Backend, Vec<Regex>> {
    static MATCHERS: OnceLock<HashMap<Backend, Vec<Regex>>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        let mut m = HashMap::new();

        m.insert(
            Backend::S3,
            vec![
                Regex::new(S3_PATH).unwrap(),
                Regex::new(S3_VIRTUAL).unwrap(),
                Regex::new(S3_ENDPOINT_URL).unwrap(),
                Regex::new(S3_URL).unwrap(),
            ],
        );

        m.insert(
            Backend::Local,
            vec![
                Regex::new(FILE_URI).unwrap(),
                Regex::new(FILE_URL).unwrap(),
                Regex::new(FILE_PATH).unwrap(),
            ],
        );

        m
    })
}

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (k, v) in matchers() {
            if let Some(matches) = v.iter().filter_map(|r| r.captures(url)).next() {
                return match k {
                    Backend::S3 => Self::parse_s3(matches),
                    Backend::Local => Self::parse_local(matches),
                };
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }

    fn parse_s3(matches: regex::Captures) -> Result<Self, StorageError> {
        let bucket = matches
            .name("bucket")
            .expect("bucket should always be available")
            .as_str()
            .to_string();

        let region = std::env::var("AWS_DEFAULT_REGION")
            .ok()
            .or_else(|| matches.name("region").map(|m| m.as_str().to_string()));

        let endpoint = std::env::var("AWS_ENDPOINT").ok().or_else(|| {
            matches.name("endpoint").map(|endpoint| {
                let port = matches
                    .name("port")
                    .and_then(|p| p.as_str().parse::<u16>().ok())
                    .unwrap_or(443);
                let protocol = matches
                    .name("protocol")
                    .map(|p| p.as_str())
                    .unwrap_or("https");
                format!("{}://{}:{}", protocol, endpoint.as_str(), port)
            })
        });

        let key = matches.name("key").map(|m| m.as_str().into());

        Ok(BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key,
        }))
    }

    fn parse_local(matches: regex::Captures) -> Result<Self, StorageError> {
        let path = matches
            .name("path")
            .expect("path regex must contain a path group")
            .as_str();

        let path = if !path.starts_with('/') {
            format!("/{path}")
        } else {
            path.to_string()
        };

        Ok(BackendConfig::Local(LocalConfig { path, key: None }))
    }

    pub(crate) fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Local(local) => local.key.as_ref(),
        }
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL.
    pub async fn for_url(url: &str) -> Result<Self, StorageError> {
        Self::for_url_with_options(url, HashMap::new()).await
    }

    /// Create a storage provider for the given URL with storage options
    /// (region, credentials, etc.).
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let config = BackendConfig::parse_url(url)?;

        match config {
            BackendConfig::S3(config) => Self::construct_s3(config, options).await,
            BackendConfig::Local(config) => Self::construct_local(config).await,
        }
    }

    /// Get the contents of an object.
    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        let bytes = self
            .object_store
            .get(&self.qualify_path(&path))
            .await
            .context(ObjectStoreSnafu)?
            .bytes()
            .await
            .context(ObjectStoreSnafu)?;
        Ok(bytes)
    }

    /// Put bytes to a path.
    pub async fn put(&self, path: impl Into<Path>, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = path.into();
        self.object_store
            .put(&self.qualify_path(&path), PutPayload::from(Bytes::from(bytes)))
            .await
            .context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Create an empty object at `path`.
    ///
    /// Completing a multipart upload with zero parts is rejected by S3, so
    /// a stream that produced no bytes falls back to a plain put.
    pub async fn put_empty(&self, path: &Path) -> Result<(), StorageError> {
        let attributes = Attributes::from_iter([(Attribute::ContentType, "application/json")]);
        let opts = PutOptions {
            attributes,
            ..Default::default()
        };
        self.object_store
            .put_opts(&self.qualify_path(path), PutPayload::default(), opts)
            .await
            .context(ObjectStoreSnafu)?;
        Ok(())
    }

    /// Stream an object into a local file, returning the number of bytes
    /// written. The file is left positioned at the end of the download.
    pub async fn download_to(
        &self,
        path: &Path,
        file: &mut tokio::fs::File,
    ) -> Result<u64, StorageError> {
        let result = self
            .object_store
            .get(&self.qualify_path(path))
            .await
            .context(ObjectStoreSnafu)?;

        let mut stream = result.into_stream();
        let mut bytes_written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context(ObjectStoreSnafu)?;
            bytes_written += chunk.len() as u64;
            file.write_all(&chunk).await.context(IoSnafu)?;
        }
        file.flush().await.context(IoSnafu)?;

        Ok(bytes_written)
    }

    /// Begin a streaming multipart upload to `path`.
    ///
    /// Bytes are buffered until `part_size` is reached, then shipped as a
    /// part; at most `max_concurrent_parts` parts are in flight at once.
    pub async fn start_upload(
        &self,
        path: &Path,
        part_size: usize,
        max_concurrent_parts: usize,
    ) -> Result<StreamUpload, StorageError> {
        let attributes = Attributes::from_iter([(Attribute::ContentType, "application/json")]);
        let opts = PutMultipartOpts {
            attributes,
            ..Default::default()
        };

        let upload = self
            .object_store
            .put_multipart_opts(&self.qualify_path(path), opts)
            .await
            .context(ObjectStoreSnafu)?;

        Ok(StreamUpload {
            upload,
            buffer: Vec::with_capacity(part_size),
            part_size,
            max_concurrent_parts: max_concurrent_parts.max(1),
            in_flight: FuturesUnordered::new(),
            bytes_written: 0,
        })
    }

    /// Qualify a path with the configured key prefix.
    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Get the backend configuration.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }
}

type PartFuture = BoxFuture<'static, Result<(), object_store::Error>>;

/// A sequential byte sink backed by a multipart upload.
///
/// The writer is single-owner; callers serialize access to it. Parts are
/// uploaded as the internal buffer fills, with bounded concurrency, and the
/// object only becomes visible once `finish` completes the upload.
pub struct StreamUpload {
    upload: Box<dyn MultipartUpload>,
    buffer: Vec<u8>,
    part_size: usize,
    max_concurrent_parts: usize,
    in_flight: FuturesUnordered<PartFuture>,
    bytes_written: u64,
}

impl StreamUpload {
    /// Append bytes to the stream, shipping full parts as they accumulate.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        self.buffer.extend_from_slice(bytes);
        self.bytes_written += bytes.len() as u64;

        while self.buffer.len() >= self.part_size {
            let part: Vec<u8> = self.buffer.drain(..self.part_size).collect();
            self.ship_part(part).await?;
        }

        Ok(())
    }

    /// Total bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flush the final partial part and complete the upload.
    pub async fn finish(mut self) -> Result<u64, StorageError> {
        if !self.buffer.is_empty() {
            let part = std::mem::take(&mut self.buffer);
            self.ship_part(part).await?;
        }

        while let Some(result) = self.in_flight.next().await {
            result.context(ObjectStoreSnafu)?;
        }

        self.upload.complete().await.context(ObjectStoreSnafu)?;
        debug!("Completed multipart upload ({} bytes)", self.bytes_written);
        Ok(self.bytes_written)
    }

    /// Abandon the upload, discarding any uploaded parts. The destination
    /// object is never created.
    pub async fn abort(mut self) {
        self.in_flight.clear();
        if let Err(error) = self.upload.abort().await {
            warn!("Failed to abort multipart upload: {error}");
        }
    }

    async fn ship_part(&mut self, part: Vec<u8>) -> Result<(), StorageError> {
        while self.in_flight.len() >= self.max_concurrent_parts {
            if let Some(result) = self.in_flight.next().await {
                result.context(ObjectStoreSnafu)?;
            }
        }

        emit!(BytesUploaded {
            bytes: part.len() as u64
        });
        self.in_flight
            .push(self.upload.put_part(PutPayload::from(part)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_s3_url_parsing() {
        let config = BackendConfig::parse_url("s3://mybucket/path/to/data").unwrap();
        match config {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "mybucket");
                assert_eq!(s3.key, Some(Path::from("path/to/data")));
            }
            _ => panic!("Expected S3 config"),
        }
    }

    #[test]
    fn test_s3_https_url_parsing() {
        let config =
            BackendConfig::parse_url("https://s3.ap-southeast-2.amazonaws.com/mybucket").unwrap();
        match config {
            BackendConfig::S3(s3) => {
                assert_eq!(s3.bucket, "mybucket");
                assert_eq!(s3.region.as_deref(), Some("ap-southeast-2"));
            }
            _ => panic!("Expected S3 config"),
        }
    }

    #[test]
    fn test_local_url_parsing() {
        let config = BackendConfig::parse_url("/local/path/to/data").unwrap();
        match config {
            BackendConfig::Local(local) => {
                assert_eq!(local.path, "/local/path/to/data");
            }
            _ => panic!("Expected Local config"),
        }
    }

    #[test]
    fn test_invalid_url() {
        assert!(BackendConfig::parse_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageProvider::for_url(temp_dir.path().to_str().unwrap())
            .await
            .unwrap();

        storage.put("nested/key.json", b"[1,2,3]".to_vec()).await.unwrap();
        let bytes = storage.get("nested/key.json").await.unwrap();
        assert_eq!(bytes.as_ref(), b"[1,2,3]");
    }

    #[tokio::test]
    async fn test_stream_upload_assembles_parts_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageProvider::for_url(temp_dir.path().to_str().unwrap())
            .await
            .unwrap();

        // Tiny part size forces several parts.
        let path = Path::from("upload.json");
        let mut upload = storage.start_upload(&path, 8, 4).await.unwrap();
        upload.write(b"0123456789").await.unwrap();
        upload.write(b"abcdefghij").await.unwrap();
        let bytes = upload.finish().await.unwrap();
        assert_eq!(bytes, 20);

        let stored = storage.get("upload.json").await.unwrap();
        assert_eq!(stored.as_ref(), b"0123456789abcdefghij");
    }

    #[tokio::test]
    async fn test_put_empty_creates_zero_byte_object() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageProvider::for_url(temp_dir.path().to_str().unwrap())
            .await
            .unwrap();

        storage.put_empty(&Path::from("empty.json")).await.unwrap();
        let bytes = storage.get("empty.json").await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_aborted_upload_leaves_no_object() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageProvider::for_url(temp_dir.path().to_str().unwrap())
            .await
            .unwrap();

        let path = Path::from("aborted.json");
        let mut upload = storage.start_upload(&path, 8, 2).await.unwrap();
        upload.write(b"will never be visible").await.unwrap();
        upload.abort().await;

        assert!(storage.get("aborted.json").await.is_err());
    }

    #[tokio::test]
    async fn test_download_to_writes_whole_object() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageProvider::for_url(temp_dir.path().to_str().unwrap())
            .await
            .unwrap();

        storage.put("data.json", b"payload".to_vec()).await.unwrap();

        let mut file = tokio::fs::File::from_std(tempfile::tempfile().unwrap());
        let bytes = storage
            .download_to(&Path::from("data.json"), &mut file)
            .await
            .unwrap();
        assert_eq!(bytes, 7);
    }
}
