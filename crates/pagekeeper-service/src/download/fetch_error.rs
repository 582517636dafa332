use std::error::Error;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::types::ErrorCategory;

/// An error that happened while fetching a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The transfer failed, retrying might help.
    #[error("download failed: {0}")]
    Network(String),
    /// A single attempt took too long.
    #[error("download timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    /// The document does not exist at the origin.
    #[error("not found")]
    NotFound,
    /// The origin refused to hand out the document.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The origin sent something that is not a usable document.
    #[error("corrupted content: {0}")]
    Corrupted(String),
    /// The content must not be downloaded, e.g. it is too large or a login page.
    #[error("unsafe content: {0}")]
    Unsafe(String),
    /// Every attempt failed with a retryable error.
    #[error("giving up after {attempts} attempts, last error: {last}")]
    NetworkRetryExhausted {
        attempts: u32,
        last: Box<FetchError>,
    },
    /// The circuit breaker is open, no engine was tried.
    #[error("downloads are suspended: {reason}")]
    CircuitOpen { reason: String },
    /// None of the engines supports the requested URL.
    #[error("unsupported location: {0}")]
    NoEngine(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl FetchError {
    /// Whether another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    /// Whether the failure was caused by attempts timing out.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::NetworkRetryExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    /// A short, stable name for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::NotFound => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::Corrupted(_) => "corrupted",
            Self::Unsafe(_) => "unsafe",
            Self::NetworkRetryExhausted { .. } => "retriesexhausted",
            Self::CircuitOpen { .. } => "circuitopen",
            Self::NoEngine(_) => "noengine",
            Self::Internal(_) => "internal",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound | Self::NoEngine(_) => ErrorCategory::NotFound,
            Self::Corrupted(_) | Self::Unsafe(_) => ErrorCategory::CorruptedDocument,
            Self::Network(_)
            | Self::Timeout(_)
            | Self::PermissionDenied(_)
            | Self::NetworkRetryExhausted { .. }
            | Self::CircuitOpen { .. } => ErrorCategory::Unavailable,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Reduces `error` to the message of its root cause.
    fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::Network(error_string)
    }
}

impl From<io::Error> for FetchError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(error.to_string()),
            _ => Self::download_error(&error),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}
