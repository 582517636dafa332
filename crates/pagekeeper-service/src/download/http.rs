//! Support to download from HTTP origins.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Response, StatusCode, header, redirect};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::config::DownloadConfig;

use super::filesystem::{check_size, create_destination};
use super::{DownloadEngine, DownloadRequest, EventSender, EventStream, FetchError, FetchEvent, FetchStage};

/// The user agent sent along with every request.
pub const USER_AGENT: &str = concat!("pagekeeper/", env!("CARGO_PKG_VERSION"));

/// Engine that downloads documents from HTTP and HTTPS origins.
///
/// Documents are written to a `.part` file next to the destination and only moved into place
/// once complete. An interrupted download is resumed with a conditional `Range` request if the
/// origin identified the document with an `ETag` or `Last-Modified` header.
#[derive(Debug, Clone)]
pub struct HttpEngine {
    client: Client,
    large_file_threshold: u64,
}

impl HttpEngine {
    pub fn new(config: &DownloadConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .gzip(true)
            .connect_timeout(config.connect_timeout)
            .redirect(redirect::Policy::custom(|attempt| {
                // A temporary redirect on a document URL usually lands on a login page. Stop
                // here so the response is classified instead of downloaded.
                if attempt.status() == StatusCode::FOUND {
                    return attempt.stop();
                }
                redirect::Policy::default().redirect(attempt)
            }))
            .build()
            .map_err(|err| FetchError::Internal(format!("failed to create HTTP client: {err}")))?;

        Ok(Self {
            client,
            large_file_threshold: config.large_file_threshold,
        })
    }
}

impl DownloadEngine for HttpEngine {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    fn download(&self, request: &DownloadRequest) -> BoxStream<'static, FetchEvent> {
        let engine = self.clone();
        let request = request.clone();
        EventStream::new(move |events| async move {
            let partial = PartialDownload::new(&request.destination);
            let result = engine.fetch(&request, &partial, &events).await;
            if let Err(FetchError::Corrupted(_) | FetchError::Unsafe(_)) = &result {
                partial.discard().await;
            }
            events.send(match result {
                Ok(()) => FetchEvent::Success(request.destination),
                Err(error) => FetchEvent::Failure(error),
            });
        })
        .boxed()
    }
}

impl HttpEngine {
    async fn fetch(
        &self,
        request: &DownloadRequest,
        partial: &PartialDownload,
        events: &EventSender,
    ) -> Result<(), FetchError> {
        let resume = partial.resumable(&request.url).await;
        let resume_from = resume.as_ref().map_or(0, |resume| resume.offset);
        tracing::debug!(url = %request.url, resume_from, "Fetching document");

        let mut builder = self
            .client
            .get(request.url.clone())
            .header(header::USER_AGENT, USER_AGENT);
        if let Some(resume) = &resume {
            builder = builder
                .header(header::RANGE, format!("bytes={}-", resume.offset))
                .header(header::IF_RANGE, resume.validator.as_str());
        }
        let response = builder.send().await?;

        let status = response.status();
        let validator = validator(&response);
        let (mut file, offset) = match (status, &resume) {
            (StatusCode::PARTIAL_CONTENT, Some(resume)) => {
                // Origins that ignore `If-Range` may send the tail of a different document.
                if validator.as_deref() != Some(resume.validator.as_str()) {
                    partial.discard().await;
                    return Err(FetchError::Network(
                        "document changed since the download started".into(),
                    ));
                }
                let file = OpenOptions::new().append(true).open(&partial.data).await?;
                (file, resume.offset)
            }
            (StatusCode::PARTIAL_CONTENT, None) => {
                return Err(FetchError::Network(format!("unexpected status: {status}")));
            }
            (status, _) if status.is_success() => {
                let file = create_destination(&partial.data).await?;
                partial.remember(&request.url, validator.as_deref()).await;
                (file, 0)
            }
            (StatusCode::RANGE_NOT_SATISFIABLE, _) => {
                // The partial file does not match the remote document anymore, start over.
                partial.discard().await;
                return Err(FetchError::Network(format!(
                    "cannot resume download: {status}"
                )));
            }
            (status, _) => return Err(status_error(&request.url, status)),
        };

        let total = response.content_length().map(|len| len + offset);
        if let Some(total) = total {
            check_size(total, self.large_file_threshold, request.allow_large_file)?;
        }

        let written = write_body(response, &mut file, offset, total, events).await?;
        check_size(written, self.large_file_threshold, request.allow_large_file)?;
        if written == 0 {
            return Err(FetchError::Corrupted("empty response".into()));
        }
        drop(file);

        tokio::fs::rename(&partial.data, &request.destination).await?;
        partial.forget().await;
        Ok(())
    }
}

/// An unfinished download, kept next to its destination.
///
/// The validator file holds the URL and the `ETag` or `Last-Modified` value the data was
/// downloaded with. Data without a matching validator is never resumed.
#[derive(Debug)]
struct PartialDownload {
    data: PathBuf,
    validator: PathBuf,
}

#[derive(Debug)]
struct Resume {
    offset: u64,
    validator: String,
}

impl PartialDownload {
    fn new(destination: &Path) -> Self {
        Self {
            data: sidecar(destination, ".part"),
            validator: sidecar(destination, ".part.validator"),
        }
    }

    async fn resumable(&self, url: &Url) -> Option<Resume> {
        let offset = match tokio::fs::metadata(&self.data).await {
            Ok(metadata) if metadata.is_file() && metadata.len() > 0 => metadata.len(),
            _ => return None,
        };
        let contents = tokio::fs::read_to_string(&self.validator).await.ok()?;
        let (stored_url, validator) = contents.split_once('\n')?;
        if stored_url != url.as_str() || validator.is_empty() {
            return None;
        }
        Some(Resume {
            offset,
            validator: validator.to_owned(),
        })
    }

    /// Stores what identifies the document currently being written.
    async fn remember(&self, url: &Url, validator: Option<&str>) {
        let result = match validator {
            Some(validator) => tokio::fs::write(&self.validator, format!("{url}\n{validator}")).await,
            None => remove_if_exists(&self.validator).await,
        };
        if let Err(error) = result {
            tracing::debug!(path = ?self.validator, %error, "Failed to store download validator");
        }
    }

    /// Removes the validator, leaving the data in place.
    async fn forget(&self) {
        remove_if_exists(&self.validator).await.ok();
    }

    async fn discard(&self) {
        remove_if_exists(&self.data).await.ok();
        self.forget().await;
    }
}

fn sidecar(destination: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(destination.as_os_str());
    path.push(suffix);
    path.into()
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

/// The value identifying this version of the document, if the origin sent a usable one.
///
/// Weak entity tags cannot be used with `If-Range`.
fn validator(response: &Response) -> Option<String> {
    let headers = response.headers();
    let etag = headers
        .get(header::ETAG)
        .and_then(|value| value.to_str().ok())
        .filter(|etag| !etag.starts_with("W/"));
    etag.or_else(|| {
        headers
            .get(header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
    })
    .map(str::to_owned)
}

/// Streams the response body into `destination`, returning the size of the complete document.
async fn write_body(
    response: Response,
    destination: &mut File,
    offset: u64,
    total: Option<u64>,
    events: &EventSender,
) -> Result<u64, FetchError> {
    let mut written = offset;
    let mut stream = response.bytes_stream().map_err(FetchError::from);
    while let Some(chunk) = stream.next().await.transpose()? {
        destination.write_all(&chunk).await?;
        written += chunk.len() as u64;

        let fraction = total
            .filter(|total| *total > 0)
            .map(|total| (written as f64 / total as f64).min(1.0) as f32);
        events.send(FetchEvent::progress(FetchStage::Downloading, fraction));
    }
    destination.flush().await?;

    Ok(written)
}

/// Classifies an unsuccessful response.
fn status_error(url: &Url, status: StatusCode) -> FetchError {
    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to download `{url}`: {status}");
        FetchError::PermissionDenied(status.to_string())
    } else if status.is_client_error() {
        tracing::debug!("Unexpected client error status code from `{url}`: {status}");
        FetchError::NotFound
    } else if status == StatusCode::FOUND {
        tracing::debug!("Potential login page detected when downloading `{url}`: {status}");
        FetchError::Unsafe("potential login page detected".into())
    } else {
        tracing::debug!("Unexpected status code from `{url}`: {status}");
        FetchError::Network(status.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pagekeeper_test as test;

    use crate::config::DownloadConfig;

    use super::*;

    fn engine(large_file_threshold: u64) -> HttpEngine {
        let config = DownloadConfig {
            large_file_threshold,
            connect_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        HttpEngine::new(&config).unwrap()
    }

    async fn download(engine: &HttpEngine, url: Url, destination: &Path) -> FetchEvent {
        let request = DownloadRequest {
            url,
            destination: destination.to_owned(),
            allow_large_file: false,
        };
        let events: Vec<_> = engine.download(&request).collect().await;
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        events.into_iter().last().unwrap()
    }

    #[tokio::test]
    async fn downloads_document() {
        test::setup();
        let files = test::tempdir();
        std::fs::write(files.path().join("hello.pdf"), b"%PDF-1.7 hello world").unwrap();
        let server = test::HitCounter::new(files.path());
        let out = test::tempdir();
        let destination = out.path().join("hello.pdf");

        let event = download(&engine(1024), server.url("files/hello.pdf"), &destination).await;

        assert_eq!(event, FetchEvent::Success(destination.clone()));
        assert_eq!(std::fs::read(&destination).unwrap(), b"%PDF-1.7 hello world");
    }

    async fn last_modified(url: &Url) -> String {
        let response = reqwest::get(url.clone()).await.unwrap();
        response.headers()[header::LAST_MODIFIED]
            .to_str()
            .unwrap()
            .to_owned()
    }

    #[tokio::test]
    async fn resumes_partial_download() {
        test::setup();
        let files = test::tempdir();
        std::fs::write(files.path().join("hello.pdf"), b"%PDF-1.7 hello world").unwrap();
        let server = test::HitCounter::new(files.path());
        let out = test::tempdir();
        let destination = out.path().join("hello.pdf");
        let url = server.url("files/hello.pdf");

        let partial = PartialDownload::new(&destination);
        std::fs::write(&partial.data, b"%PDF-1.7").unwrap();
        let validator = format!("{url}\n{}", last_modified(&url).await);
        std::fs::write(&partial.validator, validator).unwrap();

        let event = download(&engine(1024), url, &destination).await;

        assert_eq!(event, FetchEvent::Success(destination.clone()));
        assert_eq!(std::fs::read(&destination).unwrap(), b"%PDF-1.7 hello world");
        assert!(!partial.data.exists());
        assert!(!partial.validator.exists());
    }

    #[tokio::test]
    async fn never_appends_to_unrelated_files() {
        test::setup();
        let files = test::tempdir();
        std::fs::write(files.path().join("new.pdf"), b"%PDF-1.7 NEW DOCUMENT BODY").unwrap();
        let server = test::HitCounter::new(files.path());
        let out = test::tempdir();
        let destination = out.path().join("new.pdf");
        std::fs::write(&destination, b"OLD-STALE").unwrap();
        // leftover data without a validator
        let partial = PartialDownload::new(&destination);
        std::fs::write(&partial.data, b"OLD-PART").unwrap();

        let event = download(&engine(1024), server.url("files/new.pdf"), &destination).await;

        assert_eq!(event, FetchEvent::Success(destination.clone()));
        assert_eq!(std::fs::read(&destination).unwrap(), b"%PDF-1.7 NEW DOCUMENT BODY");
        assert!(!partial.data.exists());
    }

    #[tokio::test]
    async fn restarts_when_the_document_changed() {
        test::setup();
        let files = test::tempdir();
        std::fs::write(files.path().join("hello.pdf"), b"%PDF-1.7 hello world").unwrap();
        let server = test::HitCounter::new(files.path());
        let out = test::tempdir();
        let destination = out.path().join("hello.pdf");
        let url = server.url("files/hello.pdf");

        let partial = PartialDownload::new(&destination);
        std::fs::write(&partial.data, b"%PDF-1.4").unwrap();
        let stale = format!("{url}\nThu, 01 Jan 1970 00:00:00 GMT");
        std::fs::write(&partial.validator, stale).unwrap();

        let engine = engine(1024);
        let event = download(&engine, url.clone(), &destination).await;
        assert!(
            matches!(event, FetchEvent::Failure(FetchError::Network(_))),
            "{event:?}"
        );
        assert!(!partial.data.exists());
        assert!(!destination.exists());

        let event = download(&engine, url, &destination).await;
        assert_eq!(event, FetchEvent::Success(destination.clone()));
        assert_eq!(std::fs::read(&destination).unwrap(), b"%PDF-1.7 hello world");
    }

    #[tokio::test]
    async fn classifies_status_codes() {
        test::setup();
        let files = test::tempdir();
        let server = test::HitCounter::new(files.path());
        let out = test::tempdir();
        let destination = out.path().join("document.pdf");
        let engine = engine(1024);

        let cases = [
            ("files/missing.pdf", FetchError::NotFound),
            (
                "respond_statuscode/403/document.pdf",
                FetchError::PermissionDenied("403 Forbidden".into()),
            ),
            (
                "redirect/files/document.pdf",
                FetchError::Unsafe("potential login page detected".into()),
            ),
            (
                "fail/document.pdf",
                FetchError::Network("500 Internal Server Error".into()),
            ),
        ];
        for (path, expected) in cases {
            let event = download(&engine, server.url(path), &destination).await;
            assert_eq!(event, FetchEvent::Failure(expected), "{path}");
        }
    }

    #[tokio::test]
    async fn rejects_empty_and_large_documents() {
        test::setup();
        let files = test::tempdir();
        std::fs::write(files.path().join("large.pdf"), vec![b'x'; 2048]).unwrap();
        let server = test::HitCounter::new(files.path());
        let out = test::tempdir();
        let destination = out.path().join("document.pdf");
        let engine = engine(1024);

        let event = download(&engine, server.url("empty/document.pdf"), &destination).await;
        assert!(matches!(event, FetchEvent::Failure(FetchError::Corrupted(_))));
        assert!(!destination.exists());

        let event = download(&engine, server.url("files/large.pdf"), &destination).await;
        assert!(matches!(event, FetchEvent::Failure(FetchError::Unsafe(_))));
        assert!(!destination.exists());
    }
}
