// src/resume_store.rs
//
// Durable resume records for in-flight multipart uploads.
//
// The store is one JSON document mapping resume fingerprints to records,
// loaded in full and rewritten in full on each mutation. Records are small
// and writes are rare next to part-transfer volume, so a partial-write
// protocol is not worth carrying: the worst crash case loses the most
// recent part's bookkeeping, which self-heals by re-uploading that part.
//
// Under the engine's one-task-at-a-time scheduling there is at most one
// in-flight writer per key. If tasks ever drain in parallel, this store
// needs per-key locking before that change ships.

use crate::file_source::FileSource;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Locally persisted metadata allowing an interrupted multipart upload to
/// continue without re-sending already-confirmed parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartResumeRecord {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    /// Source file mtime in ms since the Unix epoch.
    pub last_modified: u64,
    pub name: String,
    pub upload_id: String,
    pub part_size: u64,
    /// part number -> ETag of every confirmed part.
    pub parts: BTreeMap<u32, String>,
}

impl MultipartResumeRecord {
    /// A record is valid to resume only if the candidate file still has
    /// exactly the size and mtime it was written with.
    pub fn matches(&self, source: &FileSource) -> bool {
        self.size == source.size && self.last_modified == source.modified_ms
    }
}

/// Whole-map key/value persistence, keyed by resume fingerprint.
#[derive(Debug, Clone)]
pub struct ResumeStore {
    path: PathBuf,
}

impl ResumeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the full map. A missing file or undecodable content is an empty
    /// store, never an error.
    pub fn load(&self) -> HashMap<String, MultipartResumeRecord> {
        match std::fs::read(&self.path) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "resume store undecodable, starting empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    /// Rewrite the full map. Persistence is best-effort bookkeeping: a
    /// failed write must not fail the upload it was recording, so errors
    /// are logged and swallowed.
    pub fn save(&self, map: &HashMap<String, MultipartResumeRecord>) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let encoded = match serde_json::to_vec(map) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "resume store encode failed");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, encoded) {
            warn!(path = %self.path.display(), error = %e, "resume store write failed");
        }
    }

    pub fn get(&self, resume_key: &str) -> Option<MultipartResumeRecord> {
        self.load().remove(resume_key)
    }

    pub fn upsert(&self, resume_key: &str, record: &MultipartResumeRecord) {
        let mut map = self.load();
        map.insert(resume_key.to_string(), record.clone());
        self.save(&map);
    }

    pub fn delete(&self, resume_key: &str) {
        let mut map = self.load();
        if map.remove(resume_key).is_some() {
            debug!(resume_key, "resume record deleted");
            self.save(&map);
        }
    }
}
