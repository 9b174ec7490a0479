// src/task.rs
//
// Per-file upload task state: status machine, progress fields and the
// resume fingerprint that survives process restarts.

use crate::file_source::FileSource;
use std::collections::BTreeMap;
use std::time::Instant;
use uuid::Uuid;

/// Opaque task identity, unique per enqueue. Ephemeral: a reloaded session
/// gets fresh ids, which is why resume records are keyed by fingerprint
/// instead.
pub type TaskId = Uuid;

/// Task lifecycle.
///
/// `Queued → Uploading → {Done | Error | Paused | Canceled}`, with
/// `Paused → Queued` on resume and `Error → Queued` on retry. `Done` and
/// `Canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Queued,
    Uploading,
    Paused,
    Done,
    Error,
    Canceled,
}

impl UploadStatus {
    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Done | UploadStatus::Canceled)
    }

    /// States a "clear finished" sweep keeps.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            UploadStatus::Queued | UploadStatus::Uploading | UploadStatus::Paused
        )
    }
}

/// Multipart bookkeeping carried by a task while it is (or can be) resumed.
#[derive(Debug, Clone)]
pub struct MultipartState {
    pub upload_id: String,
    pub part_size: u64,
    /// part number -> ETag of every confirmed part.
    pub parts: BTreeMap<u32, String>,
}

/// One user-queued file transfer. Mutated exclusively by the engine; the
/// embedder observes clones.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: TaskId,
    pub bucket: String,
    /// Destination object key, may contain "/" path segments.
    pub key: String,
    pub source: FileSource,
    /// Fingerprint identifying a resumable record independent of task id.
    pub resume_key: String,
    /// Present only on the multipart path.
    pub multipart: Option<MultipartState>,
    pub started_at: Option<Instant>,
    /// Bytes confirmed transferred (confirmed parts + in-flight progress).
    pub loaded: u64,
    /// Windowed transfer speed, zeroed when not uploading.
    pub speed_bps: f64,
    pub status: UploadStatus,
    /// Last failure message, cleared on retry.
    pub error: Option<String>,
}

impl UploadTask {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, source: FileSource) -> Self {
        let bucket = bucket.into();
        let key = key.into();
        let resume_key = resume_key(&bucket, &key, source.size, source.modified_ms);
        Self {
            id: Uuid::new_v4(),
            bucket,
            key,
            source,
            resume_key,
            multipart: None,
            started_at: None,
            loaded: 0,
            speed_bps: 0.0,
            status: UploadStatus::Queued,
            error: None,
        }
    }

    /// Completed fraction in `0.0..=1.0`, for display.
    pub fn fraction(&self) -> f64 {
        if self.source.size == 0 {
            return if self.status == UploadStatus::Done { 1.0 } else { 0.0 };
        }
        (self.loaded as f64 / self.source.size as f64).clamp(0.0, 1.0)
    }
}

/// Fingerprint of "the same upload": destination plus the file's size and
/// modification time. Size/mtime are a cheap proxy for content identity; a
/// stored record is only honored when both still match exactly.
pub fn resume_key(bucket: &str, key: &str, size: u64, modified_ms: u64) -> String {
    format!("{}|{}|{}|{}", bucket, key, size, modified_ms)
}
