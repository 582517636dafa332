//! Value types shared between the render, cache and download services.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A decoded page or tile bitmap.
///
/// The pixel encoding is opaque to Pagekeeper, only the byte size matters for budgeting.
/// Pixels are stored in an immutable, reference counted buffer: clones handed out by the caches
/// share the allocation, and no caller can mutate the cached instance through them.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Bytes,
}

impl Bitmap {
    pub fn new(width: u32, height: u32, pixels: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            pixels: pixels.into(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    /// The number of bytes this bitmap occupies, used for cache budgeting.
    pub fn byte_size(&self) -> u64 {
        self.pixels.len() as u64
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// The position of a tile within a page, in tile units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub page: u32,
    pub column: u32,
    pub row: u32,
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}x{}", self.page, self.column, self.row)
    }
}

/// The category a failure is presented as to the user.
///
/// Several distinct errors collapse into the same category, their diagnostics stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The device ran out of memory while rendering.
    OutOfMemory,
    /// The document is damaged or not a document at all.
    CorruptedDocument,
    /// The document does not exist at the given location.
    NotFound,
    /// The document is temporarily unavailable, the user should try again later.
    Unavailable,
    /// Something went wrong on our side.
    Internal,
}

impl ErrorCategory {
    /// A short, human readable message for this category.
    pub fn message(self) -> &'static str {
        match self {
            Self::OutOfMemory => "Not enough memory to display this page.",
            Self::CorruptedDocument => "This document is damaged and cannot be opened.",
            Self::NotFound => "The document could not be found.",
            Self::Unavailable => "The document is unavailable right now. Please try again later.",
            Self::Internal => "Something went wrong.",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}
