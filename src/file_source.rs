// src/file_source.rs
//
// Source-file handle for upload tasks: identity (size + mtime feed the
// resume fingerprint) plus byte-range reads for part slicing.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// A file queued for upload. Size and modification time are captured at
/// enqueue time; the resume fingerprint is derived from them, so a file that
/// changes on disk between sessions no longer matches its old record.
#[derive(Debug, Clone)]
pub struct FileSource {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified_ms: u64,
    pub content_type: Option<String>,
}

impl FileSource {
    /// Build a source from a path on disk, capturing size and mtime.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = std::fs::metadata(&path)
            .with_context(|| format!("stat failed: {}", path.display()))?;
        if !meta.is_file() {
            bail!("not a regular file: {}", path.display());
        }
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();
        Ok(Self {
            path,
            name,
            size: meta.len(),
            modified_ms,
            content_type: None,
        })
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Read the byte range `[start, end)` into an owned buffer.
    pub async fn read_range(&self, start: u64, end: u64) -> Result<Bytes> {
        if end < start || end > self.size {
            bail!("invalid range {}..{} for {} byte file", start, end, self.size);
        }
        let mut file = File::open(&self.path)
            .await
            .with_context(|| format!("open failed: {}", self.path.display()))?;
        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)
            .await
            .with_context(|| format!("short read at {}..{}: {}", start, end, self.path.display()))?;
        Ok(Bytes::from(buf))
    }
}
