//! Output file writer
//!
//! Owns the single output file and writes verified pieces at their
//! final offsets. Writes are flushed before the piece is announced to
//! anyone else.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::{ClientError, Result};

/// The single output file of a download
pub struct PieceFile {
    file: File,
    piece_length: u64,
    path: PathBuf,
}

impl PieceFile {
    /// Open or create the output file at `path`
    pub async fn create(path: impl Into<PathBuf>, piece_length: u64) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ClientError::storage(&path, e.to_string()))?;
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| ClientError::storage(&path, e.to_string()))?;

        Ok(Self {
            file,
            piece_length,
            path,
        })
    }

    /// Write one piece at offset `index * piece_length` and flush
    pub async fn write_piece(&mut self, index: u32, data: &[u8]) -> Result<()> {
        let offset = index as u64 * self.piece_length;
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| ClientError::storage(&self.path, e.to_string()))?;
        self.file
            .write_all(data)
            .await
            .map_err(|e| ClientError::storage(&self.path, e.to_string()))?;
        self.file
            .flush()
            .await
            .map_err(|e| ClientError::storage(&self.path, e.to_string()))?;
        Ok(())
    }

    /// Path of the output file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
