//! File-based blob storage with zstd compression

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::blob::{BlobKey, BlobStore};

/// File-based blob storage with zstd compression
///
/// Directory structure:
/// ```text
/// blobs/
///   7/                          # company id
///     67/                       # last two chars of the message id
///       3001234567.bundle.zst
/// ```
pub struct FileBlobStore {
    root: PathBuf,
    compression_level: i32,
}

impl FileBlobStore {
    /// Create a new file blob store at the given path
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).context("Failed to create blob storage directory")?;
        Ok(Self {
            root,
            compression_level: 3, // Good balance of speed vs compression
        })
    }

    /// Get the file path for a blob key
    fn blob_path(&self, key: &BlobKey) -> Result<PathBuf> {
        let segments = key
            .segments()
            .with_context(|| format!("Refusing unsafe blob key {:?}", key.as_str()))?;

        let mut path = self.root.clone();
        for segment in segments {
            path.push(segment);
        }
        let mut file_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        file_name.push(".zst");
        path.set_file_name(file_name);
        Ok(path)
    }
}

impl BlobStore for FileBlobStore {
    fn put(&self, key: &BlobKey, data: &[u8]) -> Result<()> {
        let path = self.blob_path(key)?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let compressed =
            zstd::encode_all(data, self.compression_level).context("Failed to compress blob")?;

        // Write atomically (write to temp, sync, then rename)
        let temp_path = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&temp_path)
                .with_context(|| format!("Failed to create {}", temp_path.display()))?;
            file.write_all(&compressed)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &path)
            .with_context(|| format!("Failed to move blob into place at {}", path.display()))?;

        Ok(())
    }

    fn get(&self, key: &BlobKey) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(key)?;

        if !path.exists() {
            return Ok(None);
        }

        let compressed = fs::read(&path)?;
        let mut decoder = zstd::Decoder::new(compressed.as_slice())?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .context("Failed to decompress blob")?;

        Ok(Some(decompressed))
    }

    fn exists(&self, key: &BlobKey) -> Result<bool> {
        Ok(self.blob_path(key)?.exists())
    }

    fn delete(&self, key: &BlobKey) -> Result<()> {
        let path = self.blob_path(key)?;
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}
