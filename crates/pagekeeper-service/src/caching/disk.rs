use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use filetime::FileTime;
use tempfile::NamedTempFile;

use crate::types::Bitmap;
use crate::utils::fs::catch_not_found;

use super::CacheKey;

/// Magic bytes at the start of every mirrored bitmap.
const MAGIC: &[u8; 4] = b"PKBM";
const HEADER_LEN: usize = 4 + 4 + 4;

/// A directory of bitmaps kept on disk while the in-memory caches are shrunk.
///
/// Files are written to a temporary directory first and atomically moved into place, so readers
/// never observe a partially written bitmap. Every read touches the file's modification time,
/// which makes the purger's "least recently modified" order an approximation of LRU.
#[derive(Debug, Clone)]
pub struct DiskMirror {
    dir: PathBuf,
    tmp_dir: PathBuf,
}

impl DiskMirror {
    /// Creates the mirror, making sure both directories exist and are writable.
    pub fn open(dir: PathBuf, tmp_dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(&tmp_dir)?;
        // probe
        tempfile::Builder::new().prefix("tmp").tempfile_in(&tmp_dir)?;
        Ok(Self { dir, tmp_dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The path at which the bitmap for `key` is stored.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.disk_path())
    }

    /// Writes `bitmap` for `key`, replacing any previous file.
    pub async fn store(&self, key: &CacheKey, bitmap: &Bitmap) -> io::Result<()> {
        let path = self.path_for(key);
        let tmp_dir = self.tmp_dir.clone();
        let bitmap = bitmap.clone();
        run_blocking(move || {
            let mut temp_file = tempfile::Builder::new().prefix("tmp").tempfile_in(&tmp_dir)?;
            write_bitmap(temp_file.as_file_mut(), &bitmap)?;
            persist_tempfile(temp_file, &path)
        })
        .await
    }

    /// Reads the bitmap stored for `key`, if any.
    pub async fn load(&self, key: &CacheKey) -> io::Result<Option<Bitmap>> {
        let path = self.path_for(key);
        run_blocking(move || {
            let Some(data) = catch_not_found(|| fs::read(&path))? else {
                return Ok(None);
            };
            let bitmap = read_bitmap(Bytes::from(data))?;
            // the purger may have removed the file in the meantime, which is fine
            catch_not_found(|| filetime::set_file_mtime(&path, FileTime::now()))?;
            Ok(Some(bitmap))
        })
        .await
    }

    /// Removes the file stored for `key`.
    pub async fn remove(&self, key: &CacheKey) -> io::Result<()> {
        let path = self.path_for(key);
        run_blocking(move || catch_not_found(|| fs::remove_file(&path)).map(|_| ())).await
    }
}

async fn run_blocking<F, R>(f: F) -> io::Result<R>
where
    F: FnOnce() -> io::Result<R> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

fn persist_tempfile(temp_file: NamedTempFile, path: &Path) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;
    fs::create_dir_all(parent)?;
    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn write_bitmap(writer: &mut impl Write, bitmap: &Bitmap) -> io::Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&bitmap.width().to_le_bytes())?;
    writer.write_all(&bitmap.height().to_le_bytes())?;
    writer.write_all(bitmap.pixels())?;
    writer.flush()
}

fn read_bitmap(data: Bytes) -> io::Result<Bitmap> {
    if data.len() < HEADER_LEN || &data[..4] != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "not a mirrored bitmap",
        ));
    }
    let width = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    let height = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    Ok(Bitmap::new(width, height, data.slice(HEADER_LEN..)))
}
