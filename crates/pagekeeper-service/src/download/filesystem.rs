//! Support to download from the local filesystem.
//!
//! Handles `file://` URLs, mostly useful for documents that were already downloaded by
//! other means and for tests.

use std::io;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use super::{DownloadEngine, DownloadRequest, EventSender, EventStream, FetchError, FetchEvent, FetchStage};

const CHUNK_SIZE: usize = 64 * 1024;

/// Engine that copies documents from the local filesystem.
#[derive(Debug)]
pub struct FilesystemEngine {
    large_file_threshold: u64,
}

impl FilesystemEngine {
    pub fn new(large_file_threshold: u64) -> Self {
        Self {
            large_file_threshold,
        }
    }
}

impl DownloadEngine for FilesystemEngine {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn supports(&self, url: &Url) -> bool {
        url.scheme() == "file"
    }

    fn download(&self, request: &DownloadRequest) -> BoxStream<'static, FetchEvent> {
        let request = request.clone();
        let threshold = self.large_file_threshold;
        EventStream::new(move |events| async move {
            let result = copy_file(&request, threshold, &events).await;
            if result.is_err() {
                tokio::fs::remove_file(&request.destination).await.ok();
            }
            events.send(match result {
                Ok(()) => FetchEvent::Success(request.destination),
                Err(error) => FetchEvent::Failure(error),
            });
        })
        .boxed()
    }
}

async fn copy_file(
    request: &DownloadRequest,
    large_file_threshold: u64,
    events: &EventSender,
) -> Result<(), FetchError> {
    let source: PathBuf = request
        .url
        .to_file_path()
        .map_err(|_| FetchError::NoEngine(request.url.to_string()))?;
    tracing::debug!("Fetching document from {:?}", source);

    let mut file = File::open(&source).await?;
    let total = file.metadata().await?.len();
    check_size(total, large_file_threshold, request.allow_large_file)?;
    if total == 0 {
        return Err(FetchError::Corrupted("empty file".into()));
    }

    let mut destination = create_destination(&request.destination).await?;
    let mut buf = vec![0; CHUNK_SIZE];
    let mut copied = 0u64;
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        destination.write_all(&buf[..read]).await?;
        copied += read as u64;
        let fraction = (copied as f64 / total as f64).min(1.0) as f32;
        events.send(FetchEvent::progress(FetchStage::Downloading, Some(fraction)));
    }
    destination.flush().await?;

    Ok(())
}

/// Rejects documents above `threshold` unless large files were explicitly allowed.
pub(super) fn check_size(size: u64, threshold: u64, allow_large_file: bool) -> Result<(), FetchError> {
    if !allow_large_file && size > threshold {
        return Err(FetchError::Unsafe(format!(
            "document of {size} bytes exceeds the limit of {threshold} bytes"
        )));
    }
    Ok(())
}

/// Creates (or truncates) `path`, including missing parent directories.
pub(super) async fn create_destination(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    File::create(path).await
}
