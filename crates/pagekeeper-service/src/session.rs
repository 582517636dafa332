//! Lifecycle of the currently opened document.
//!
//! A [`SessionManager`] keeps at most one [`DocumentSession`] open. Opening a document always
//! tears down the previous session first, even when the new document fails to open. A session
//! that was closed or superseded rejects renders right away.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use futures::FutureExt;
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::caching::CacheKey;
use crate::render::{RenderError, Renderer};
use crate::telemetry::SharedTelemetry;
use crate::types::{Bitmap, ErrorCategory};
use crate::utils::sync::lock;

/// The ways opening a document can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpenError {
    #[error("document not found")]
    NotFound,
    #[error("failed to read document: {0}")]
    Io(String),
    #[error("unsupported document: {0}")]
    Unsupported(String),
    #[error("corrupted document: {0}")]
    Corrupted(String),
}

impl OpenError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound => ErrorCategory::NotFound,
            Self::Unsupported(_) | Self::Corrupted(_) => ErrorCategory::CorruptedDocument,
            Self::Io(_) => ErrorCategory::Internal,
        }
    }
}

impl From<io::Error> for OpenError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            _ => Self::Io(error.to_string()),
        }
    }
}

/// Opens documents, producing the renderer for a single document.
///
/// Dropping the returned renderer releases the underlying document.
pub trait DocumentLoader: Send + Sync + 'static {
    fn load<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Arc<dyn Renderer>, OpenError>>;
}

const OPEN: u8 = 0;
const CLOSED: u8 = 1;
const SUPERSEDED: u8 = 2;

/// An opened document.
///
/// Renders of a single session never run concurrently.
pub struct DocumentSession {
    id: u64,
    path: PathBuf,
    fingerprint: String,
    state: AtomicU8,
    renderer: Mutex<Option<Arc<dyn Renderer>>>,
    render_gate: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("fingerprint", &self.fingerprint)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

impl DocumentSession {
    fn new(id: u64, path: PathBuf, fingerprint: String, renderer: Arc<dyn Renderer>) -> Self {
        Self {
            id,
            path,
            fingerprint,
            state: AtomicU8::new(OPEN),
            renderer: Mutex::new(Some(renderer)),
            render_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identifies the document contents, stable across sessions of the same unchanged file.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    /// Closes the session and releases the document.
    ///
    /// Closing an already closed or superseded session does nothing.
    pub fn close(&self) {
        self.release(CLOSED);
    }

    fn supersede(&self) -> bool {
        self.release(SUPERSEDED)
    }

    fn release(&self, state: u8) -> bool {
        if self
            .state
            .compare_exchange(OPEN, state, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // A render that is still running keeps its own handle until it finishes, see `drain`.
        lock(&self.renderer).take();
        tracing::debug!(session = self.id, "Released document session");
        true
    }

    /// Waits until no render of this session is running anymore.
    ///
    /// Once the session is released, this means the document handle is gone.
    async fn drain(&self) {
        let _gate = self.render_gate.lock().await;
    }

    fn check_open(&self) -> Result<(), RenderError> {
        match self.state.load(Ordering::Acquire) {
            OPEN => Ok(()),
            SUPERSEDED => Err(RenderError::SessionSuperseded),
            _ => Err(RenderError::SessionClosed),
        }
    }

    async fn render_bitmap(&self, key: &CacheKey) -> Result<Bitmap, RenderError> {
        self.check_open()?;
        let _guard = self.render_gate.lock().await;
        self.check_open()?;

        let renderer = lock(&self.renderer).clone();
        match renderer {
            Some(renderer) => renderer.render(key).await,
            None => self.check_open().and(Err(RenderError::SessionClosed)),
        }
    }
}

impl Renderer for DocumentSession {
    fn render<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<Bitmap, RenderError>> {
        self.render_bitmap(key).boxed()
    }
}

/// Keeps track of the current [`DocumentSession`].
pub struct SessionManager {
    loader: Arc<dyn DocumentLoader>,
    current: tokio::sync::Mutex<Option<Arc<DocumentSession>>>,
    next_id: AtomicU64,
    telemetry: SharedTelemetry,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl SessionManager {
    pub fn new(loader: Arc<dyn DocumentLoader>, telemetry: SharedTelemetry) -> Self {
        Self {
            loader,
            current: tokio::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
            telemetry,
        }
    }

    /// Opens the document at `path` as the new current session.
    ///
    /// The previous session is superseded and its running renders are drained before the new
    /// document is touched, so its document is gone even if opening fails.
    pub async fn open(&self, path: impl AsRef<Path>) -> Result<Arc<DocumentSession>, OpenError> {
        let path = path.as_ref();
        let mut current = self.current.lock().await;

        if let Some(previous) = current.take() {
            if previous.supersede() {
                self.telemetry
                    .breadcrumb("session", format!("session:superseded:{}", previous.id()));
            }
            previous.drain().await;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fingerprint = fingerprint(path).await?;
        let renderer = self.loader.load(path).await.inspect_err(|error| {
            tracing::debug!(session = id, ?path, %error, "Failed to open document");
        })?;

        let session = Arc::new(DocumentSession::new(
            id,
            path.to_owned(),
            fingerprint,
            renderer,
        ));
        tracing::debug!(session = id, ?path, "Opened document session");
        *current = Some(session.clone());

        Ok(session)
    }

    /// The current session, if a document is open.
    pub async fn current(&self) -> Option<Arc<DocumentSession>> {
        self.current.lock().await.clone()
    }

    /// Closes the current session, if any, and waits for its running renders.
    pub async fn close(&self) {
        if let Some(session) = self.current.lock().await.take() {
            session.close();
            session.drain().await;
        }
    }
}

/// Hashes the location, size and modification time of a document.
async fn fingerprint(path: &Path) -> Result<String, OpenError> {
    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(OpenError::Unsupported("not a regular file".into()));
    }
    let modified = metadata
        .modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(SystemTime::UNIX_EPOCH).ok())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(path.as_os_str().as_encoded_bytes());
    hasher.update(metadata.len().to_le_bytes());
    hasher.update(modified.as_nanos().to_le_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}
