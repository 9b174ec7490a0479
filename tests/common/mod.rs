// tests/common/mod.rs
//
// Mock protocol and transport for driving the upload engine without a
// network, plus small fixtures shared by the integration tests.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use r2up::FileSource;
use r2up::progress::ProgressFn;
use r2up::protocol::{CompletedPart, MultipartProtocol};
use r2up::transfer::{ChunkTransport, TransferError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything the mock service observed, for assertions.
#[derive(Debug, Default)]
pub struct ServiceLog {
    pub creates: usize,
    pub signed_parts: Vec<u32>,
    pub completions: Vec<Vec<CompletedPart>>,
    /// Upload ids passed to abort.
    pub aborts: Vec<String>,
    pub single_signs: usize,
}

/// In-memory multipart protocol. Sign URLs encode the part number so the
/// mock transport can attribute uploads.
#[derive(Default)]
pub struct MockProtocol {
    pub log: Mutex<ServiceLog>,
    pub fail_create: Mutex<bool>,
    pub fail_single_sign: Mutex<bool>,
    next_upload: Mutex<u32>,
}

impl MockProtocol {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn creates(&self) -> usize {
        self.log.lock().unwrap().creates
    }

    pub fn completions(&self) -> Vec<Vec<CompletedPart>> {
        self.log.lock().unwrap().completions.clone()
    }

    pub fn aborts(&self) -> Vec<String> {
        self.log.lock().unwrap().aborts.clone()
    }
}

#[async_trait]
impl MultipartProtocol for MockProtocol {
    async fn create_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        _content_type: Option<&str>,
    ) -> Result<String> {
        if *self.fail_create.lock().unwrap() {
            bail!("create multipart failed (/api/multipart 500)");
        }
        let mut log = self.log.lock().unwrap();
        log.creates += 1;
        let mut next = self.next_upload.lock().unwrap();
        *next += 1;
        Ok(format!("upload-{}", *next))
    }

    async fn sign_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> Result<String> {
        self.log.lock().unwrap().signed_parts.push(part_number);
        Ok(format!("mock://{}/{}/{}/{}", bucket, key, upload_id, part_number))
    }

    async fn complete_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        _upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        self.log.lock().unwrap().completions.push(parts.to_vec());
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<()> {
        self.log.lock().unwrap().aborts.push(upload_id.to_string());
        Ok(())
    }

    async fn sign_single_upload(
        &self,
        bucket: &str,
        key: &str,
        _content_type: Option<&str>,
    ) -> Result<String> {
        if *self.fail_single_sign.lock().unwrap() {
            bail!("sign failed (/api/files 500)");
        }
        self.log.lock().unwrap().single_signs += 1;
        Ok(format!("mock://{}/{}/single", bucket, key))
    }
}

/// Part number of a mock sign URL; the single-PUT path maps to 0.
fn part_of_url(url: &str) -> u32 {
    url.rsplit('/')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Chunk transport recording uploads in memory. Failures and stalls are
/// scriptable per part number (0 = the single-PUT path).
#[derive(Default)]
pub struct MockTransport {
    pub started: Mutex<Vec<u32>>,
    pub completed: Mutex<Vec<u32>>,
    pub payload_sizes: Mutex<HashMap<u32, usize>>,
    fail_scripts: Mutex<HashMap<u32, VecDeque<TransferError>>>,
    blocked: Mutex<HashSet<u32>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `times` attempts of part `pn` fail with a network
    /// error.
    pub fn fail_next(&self, pn: u32, times: usize) {
        let mut scripts = self.fail_scripts.lock().unwrap();
        let queue = scripts.entry(pn).or_default();
        for _ in 0..times {
            queue.push_back(TransferError::Network("connection reset".to_string()));
        }
    }

    /// Make the next attempt of part `pn` fail with a given error.
    pub fn fail_next_with(&self, pn: u32, err: TransferError) {
        self.fail_scripts
            .lock()
            .unwrap()
            .entry(pn)
            .or_default()
            .push_back(err);
    }

    /// Stall part `pn` until unblocked or the transfer is canceled.
    pub fn block(&self, pn: u32) {
        self.blocked.lock().unwrap().insert(pn);
    }

    pub fn unblock(&self, pn: u32) {
        self.blocked.lock().unwrap().remove(&pn);
    }

    pub fn started(&self) -> Vec<u32> {
        self.started.lock().unwrap().clone()
    }

    pub fn completed(&self) -> Vec<u32> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChunkTransport for MockTransport {
    async fn put_chunk(
        &self,
        url: &str,
        body: Bytes,
        _content_type: Option<&str>,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<String, TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Aborted);
        }
        let pn = part_of_url(url);
        self.started.lock().unwrap().push(pn);

        loop {
            if !self.blocked.lock().unwrap().contains(&pn) {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Aborted),
                _ = tokio::time::sleep(Duration::from_millis(5)) => {}
            }
        }

        let scripted = self
            .fail_scripts
            .lock()
            .unwrap()
            .get_mut(&pn)
            .and_then(|q| q.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }

        let total = body.len() as u64;
        progress(total / 2, total);
        progress(total, total);
        self.payload_sizes.lock().unwrap().insert(pn, body.len());
        self.completed.lock().unwrap().push(pn);
        Ok(format!("\"etag-{}-{}\"", pn, total))
    }
}

/// Create a sparse file of `size` bytes and wrap it as a FileSource.
pub fn make_source(dir: &Path, name: &str, size: u64) -> FileSource {
    let path = dir.join(name);
    let file = std::fs::File::create(&path).expect("create fixture file");
    file.set_len(size).expect("size fixture file");
    FileSource::from_path(&path).expect("stat fixture file")
}

/// Poll `cond` until it holds, panicking after a few seconds.
pub async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timeout waiting for {}", what);
}
