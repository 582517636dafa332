use std::fmt::{self, Write};

use sha2::{Digest, Sha256};

use crate::types::TileCoord;

/// What part of a document a render covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderTarget {
    /// A whole page, by index.
    Page(u32),
    /// A single tile of a page.
    Tile(TileCoord),
}

impl RenderTarget {
    /// The page this target belongs to.
    pub fn page_index(&self) -> u32 {
        match self {
            Self::Page(index) => *index,
            Self::Tile(tile) => tile.page,
        }
    }

    pub fn is_tile(&self) -> bool {
        matches!(self, Self::Tile(_))
    }
}

/// The key under which a rendered bitmap is cached.
///
/// Two requests for the same target at the same size and scale always produce equal keys.
/// The scale factor is compared by its normalized bit pattern, so `-0.0` and `0.0` as well as
/// all `NaN`s are the same scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    target: RenderTarget,
    width: u32,
    height: u32,
    scale_bits: u32,
}

impl CacheKey {
    pub fn new(target: RenderTarget, width: u32, height: u32, scale: f32) -> Self {
        let scale = if scale == 0.0 {
            0.0
        } else if scale.is_nan() {
            f32::NAN
        } else {
            scale
        };

        Self {
            target,
            width,
            height,
            scale_bits: scale.to_bits(),
        }
    }

    /// Creates a key for a whole page.
    pub fn page(index: u32, width: u32, height: u32, scale: f32) -> Self {
        Self::new(RenderTarget::Page(index), width, height, scale)
    }

    /// Creates a key for a single tile.
    pub fn tile(tile: TileCoord, width: u32, height: u32, scale: f32) -> Self {
        Self::new(RenderTarget::Tile(tile), width, height, scale)
    }

    pub fn target(&self) -> RenderTarget {
        self.target
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn scale(&self) -> f32 {
        f32::from_bits(self.scale_bits)
    }

    /// Returns the human-readable metadata that forms the basis of [`Self::disk_path`].
    ///
    /// **NOTE**: This has to stay stable, otherwise mirrored bitmaps on disk are never found again.
    pub fn metadata(&self) -> String {
        let mut metadata = String::new();
        match self.target {
            RenderTarget::Page(index) => writeln!(metadata, "page: {index}"),
            RenderTarget::Tile(tile) => writeln!(metadata, "tile: {tile}"),
        }
        .and_then(|_| writeln!(metadata, "size: {}x{}", self.width, self.height))
        .and_then(|_| writeln!(metadata, "scale: {}", self.scale()))
        .ok();
        metadata
    }

    /// Returns the relative path of this key in a disk mirror.
    ///
    /// The relative path is a sha-256 hash of the [`metadata`](Self::metadata), hex-formatted
    /// like so: `aa/bbccdd...`.
    pub fn disk_path(&self) -> String {
        let hash = Sha256::digest(self.metadata().as_bytes());
        let mut path = format!("{:02x}/", hash[0]);
        for b in &hash[1..] {
            write!(path, "{b:02x}").ok();
        }
        path
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            RenderTarget::Page(index) => write!(f, "page {index}")?,
            RenderTarget::Tile(tile) => write!(f, "tile {tile}")?,
        }
        write!(f, " @ {}x{} x{}", self.width, self.height, self.scale())
    }
}
