//! `reqwest` implementations of [`AssetSource`] and [`ByteTransport`].
//!
//! Metadata endpoints (relative to `remote.api_url`):
//!
//! - `GET organizations/{org}/projects/{project}/assets/{asset}/versions/{version|latest}`
//! - `GET .../versions/{version}/files`
//! - `GET .../versions/{version}/files/{path}/download`, answering `{"url": ...}`

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::{AssetMetadata, AssetSource, RemoteFile};
use crate::cache::CacheEvictor;
use crate::config::RemoteConfig;
use crate::errors::{SourceError, TransportError};
use crate::models::{AssetIdentifier, SyncMode};
use crate::transfer::{ByteTransport, FetchRequest, TransferHandle};

const CLIENT_AGENT: &str = concat!("assetsync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct DownloadLink {
    url: String,
}

// ---------------------------------------------------------------------------
// Asset source
// ---------------------------------------------------------------------------

/// Remote asset-metadata client with an on-disk metadata cache.
#[derive(Clone)]
pub struct HttpAssetSource {
    http: reqwest::Client,
    api_url: Url,
    token: Option<String>,
    cache_dir: PathBuf,
    evictor: Arc<CacheEvictor>,
}

impl HttpAssetSource {
    pub fn new(
        remote: &RemoteConfig,
        cache_dir: impl Into<PathBuf>,
        evictor: Arc<CacheEvictor>,
    ) -> Result<Self, SourceError> {
        let api_url = Url::parse(&remote.api_url)
            .map_err(|e| SourceError::ParseError(format!("invalid api_url: {}", e)))?;
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_AGENT));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(remote.request_timeout_secs))
            .build()?;
        info!(api_url = %api_url, "created asset source client");
        Ok(Self {
            http,
            api_url,
            token: remote.token.clone(),
            cache_dir: cache_dir.into(),
            evictor,
        })
    }

    fn endpoint(&self, asset: &AssetIdentifier, version: &str, tail: &[&str]) -> Result<Url, SourceError> {
        let mut url = self.api_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SourceError::ParseError("api_url cannot be a base URL".into()))?;
            segments.pop_if_empty().extend([
                "organizations",
                asset.organization_id.as_str(),
                "projects",
                asset.project_id.as_str(),
                "assets",
                asset.source_asset_id.as_str(),
                "versions",
                version,
            ]);
            segments.extend(tail);
        }
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        what: &str,
    ) -> Result<T, SourceError> {
        let mut req = self.http.get(url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| SourceError::ParseError(format!("{}: {}", what, e)))
    }

    /// Location of the cached metadata document for one asset version.
    pub fn metadata_cache_path(&self, asset: &AssetIdentifier) -> PathBuf {
        self.cache_dir
            .join("metadata")
            .join(&asset.organization_id)
            .join(&asset.project_id)
            .join(&asset.source_asset_id)
            .join(format!("{}.json", asset.version))
    }

    fn write_cache(&self, metadata: &AssetMetadata) -> Result<(), SourceError> {
        let path = self.metadata_cache_path(&metadata.asset);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(metadata)
            .map_err(|e| SourceError::ParseError(e.to_string()))?;
        std::fs::write(&path, text)?;

        if let Err(e) = self.evictor.check_and_evict(Some(&path)) {
            warn!(error = %e, "cache eviction failed");
        }
        Ok(())
    }

    fn read_cache(&self, asset: &AssetIdentifier) -> Option<AssetMetadata> {
        let text = std::fs::read_to_string(self.metadata_cache_path(asset)).ok()?;
        serde_json::from_str(&text).ok()
    }
}

#[async_trait]
impl AssetSource for HttpAssetSource {
    #[instrument(skip(self, asset), fields(asset = %asset))]
    async fn sync(&self, asset: &AssetIdentifier, mode: SyncMode) -> Result<AssetMetadata, SourceError> {
        let version = match mode {
            SyncMode::Pinned => asset.version.as_str(),
            SyncMode::Latest => "latest",
        };
        let url = self.endpoint(asset, version, &[])?;
        match self.get_json::<AssetMetadata>(url, &asset.to_string()).await {
            Ok(metadata) => {
                debug!(resolved = %metadata.asset, deps = metadata.dependencies.len(), "synced asset metadata");
                self.write_cache(&metadata)?;
                Ok(metadata)
            }
            Err(SourceError::HttpError(e)) if mode == SyncMode::Pinned => match self.read_cache(asset) {
                Some(cached) => {
                    warn!(error = %e, "asset source unreachable, using cached metadata");
                    Ok(cached)
                }
                None => Err(SourceError::HttpError(e)),
            },
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, asset), fields(asset = %asset))]
    async fn list_files(&self, asset: &AssetIdentifier) -> Result<Vec<RemoteFile>, SourceError> {
        let url = self.endpoint(asset, &asset.version, &["files"])?;
        let files: Vec<RemoteFile> = self.get_json(url, &format!("{} files", asset)).await?;
        debug!(count = files.len(), "listed asset files");
        Ok(files)
    }

    async fn download_url(&self, asset: &AssetIdentifier, file: &RemoteFile) -> Result<String, SourceError> {
        let mut tail: Vec<&str> = vec!["files"];
        tail.extend(file.path.split('/').filter(|s| !s.is_empty()));
        tail.push("download");
        let url = self.endpoint(asset, &asset.version, &tail)?;
        let link: DownloadLink = self.get_json(url, &file.path).await?;
        Ok(link.url)
    }
}

// ---------------------------------------------------------------------------
// Byte transport
// ---------------------------------------------------------------------------

/// Streaming GET into a file, resuming with a `Range` header.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .user_agent(CLIENT_AGENT)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { http })
    }
}

async fn open_destination(dest: &Path, append: bool) -> Result<tokio::fs::File, TransportError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = if append {
        tokio::fs::OpenOptions::new().append(true).open(dest).await?
    } else {
        tokio::fs::File::create(dest).await?
    };
    Ok(file)
}

#[async_trait]
impl ByteTransport for HttpTransport {
    async fn fetch(&self, request: FetchRequest, handle: Arc<TransferHandle>) -> Result<(), TransportError> {
        let mut req = self.http.get(&request.url);
        if request.offset > 0 {
            req = req.header(RANGE, format!("bytes={}-", request.offset));
        }
        let mut resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Protocol {
                status: status.as_u16(),
                detail: status.canonical_reason().unwrap_or("unexpected status").to_string(),
            });
        }

        let resumed = request.offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        if request.offset > 0 && !resumed {
            debug!(url = %request.url, "server ignored range request, restarting from zero");
        }
        let mut written = if resumed { request.offset } else { 0 };
        if let Some(len) = resp.content_length() {
            handle.set_total(written + len);
        }
        handle.set_received(written);

        let mut file = open_destination(&request.dest, resumed).await?;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            handle.set_received(written);
        }
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve one HTTP response and hand back the raw request head.
    async fn serve_once(status_line: &'static str, body: &'static [u8]) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let _ = tx.send(String::from_utf8_lossy(&head).to_string());
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status_line,
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.flush().await.unwrap();
        });
        (format!("http://{}/file.bin", addr), rx)
    }

    #[tokio::test]
    async fn test_partial_content_appends_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("file.bin");
        std::fs::write(&dest, b"abcd").unwrap();
        let (url, head) = serve_once("206 Partial Content", b"efgh").await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let handle = Arc::new(TransferHandle::new(4, 8));
        transport
            .fetch(FetchRequest { url, dest: dest.clone(), offset: 4 }, handle.clone())
            .await
            .unwrap();

        assert!(head.await.unwrap().to_lowercase().contains("range: bytes=4-"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdefgh");
        assert_eq!(handle.received(), 8);
        assert_eq!(handle.total(), 8);
    }

    #[tokio::test]
    async fn test_full_reply_to_range_restarts_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("file.bin");
        std::fs::write(&dest, b"stale").unwrap();
        let (url, _head) = serve_once("200 OK", b"fresh-body").await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let handle = Arc::new(TransferHandle::new(5, 0));
        transport
            .fetch(FetchRequest { url, dest: dest.clone(), offset: 5 }, handle.clone())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"fresh-body");
        assert_eq!(handle.received(), 10);
    }

    #[tokio::test]
    async fn test_error_status_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let (url, _head) = serve_once("404 Not Found", b"").await;
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let err = transport
            .fetch(
                FetchRequest { url, dest: dir.path().join("x"), offset: 0 },
                Arc::new(TransferHandle::default()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol { status: 404, .. }));
    }

    #[test]
    fn test_endpoint_and_cache_paths() {
        let dir = tempfile::tempdir().unwrap();
        let evictor = Arc::new(CacheEvictor::new(
            dir.path(),
            CacheSettings::from(&crate::config::CacheConfig::default()),
        ));
        let remote = RemoteConfig {
            api_url: "https://assets.example.com/api/v1/".into(),
            ..RemoteConfig::default()
        };
        let source = HttpAssetSource::new(&remote, dir.path(), evictor).unwrap();
        let asset = AssetIdentifier::new("acme", "props", "chair", "3");

        let url = source.endpoint(&asset, "latest", &["files"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://assets.example.com/api/v1/organizations/acme/projects/props/assets/chair/versions/latest/files"
        );
        assert!(source
            .metadata_cache_path(&asset)
            .ends_with("metadata/acme/props/chair/3.json"));
    }

    #[test]
    fn test_cached_metadata_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let evictor = Arc::new(CacheEvictor::new(
            dir.path(),
            CacheSettings::from(&crate::config::CacheConfig::default()),
        ));
        let remote = RemoteConfig {
            api_url: "https://assets.example.com".into(),
            ..RemoteConfig::default()
        };
        let source = HttpAssetSource::new(&remote, dir.path(), evictor.clone()).unwrap();
        let metadata = AssetMetadata {
            asset: AssetIdentifier::new("acme", "props", "chair", "3"),
            name: "Chair".into(),
            dependencies: vec![],
            fingerprint: Some("etag-1".into()),
        };
        source.write_cache(&metadata).unwrap();
        assert_eq!(source.read_cache(&metadata.asset), Some(metadata));
        assert!(evictor.aggregate().unwrap() > 0);
    }
}
