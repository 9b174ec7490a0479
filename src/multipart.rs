// src/multipart.rs
//
// Multipart upload orchestration for one task.
//
// Resume lookup, session creation, the bounded part-worker pool and
// completion all live here. Workers claim part numbers from a shared
// counter (no gaps, no duplicates); parts already confirmed by a resume
// record are never re-sent; every part success is persisted to both the
// in-memory task and the resume store before the next part is claimed, so
// a crash after N parts resumes at part N+1.

use crate::engine::EngineInner;
use crate::file_source::FileSource;
use crate::planner::{part_count, part_len, part_range, pick_part_size};
use crate::progress::{LoadedSink, ProgressFn};
use crate::protocol::CompletedPart;
use crate::resume_store::MultipartResumeRecord;
use crate::task::{MultipartState, TaskId, UploadStatus};
use crate::transfer::TransferError;
use anyhow::{Context, Result};
use futures::future::try_join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct PartContext<'a> {
    inner: &'a Arc<EngineInner>,
    id: TaskId,
    bucket: String,
    key: String,
    upload_id: String,
    resume_key: String,
    source: FileSource,
    part_size: u64,
    total_parts: u32,
    /// Confirmed parts: part number -> ETag. Shared with the task and the
    /// resume store, which are updated on every insertion.
    parts: Mutex<BTreeMap<u32, String>>,
    /// In-flight progress per part number.
    part_loaded: Arc<Mutex<HashMap<u32, u64>>>,
    next_part: AtomicU32,
    token: &'a CancellationToken,
    report: LoadedSink,
}

impl PartContext<'_> {
    fn resume_record(&self, parts: BTreeMap<u32, String>) -> MultipartResumeRecord {
        MultipartResumeRecord {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            size: self.source.size,
            last_modified: self.source.modified_ms,
            name: self.source.name.clone(),
            upload_id: self.upload_id.clone(),
            part_size: self.part_size,
            parts,
        }
    }
}

/// Drive one multipart task to completion. On failure the resume record is
/// kept for pause/retry, except on user cancel where the remote session is
/// aborted and the record dropped.
pub(crate) async fn run_multipart(
    inner: &Arc<EngineInner>,
    id: TaskId,
    token: &CancellationToken,
    report: LoadedSink,
) -> Result<()> {
    let task = inner
        .task_snapshot(id)
        .context("task disappeared before start")?;
    let source = task.source.clone();
    let bucket = task.bucket.clone();
    let key = task.key.clone();
    let resume_key = task.resume_key.clone();

    // Prefer in-memory state (an in-session retry), then the durable record
    // (a reload); fall back to a fresh plan.
    let existing = task.multipart.clone();
    let mut persisted = inner.store.get(&resume_key);
    if let Some(rec) = &persisted {
        if !rec.matches(&source) {
            // The file changed since the record was written; the old remote
            // session is abandoned to the store's own lifecycle rules.
            debug!(%resume_key, "resume record stale, discarding");
            inner.store.delete(&resume_key);
            persisted = None;
        } else {
            debug!(%resume_key, parts = rec.parts.len(), "resume record found");
        }
    }

    let resumed_id = existing
        .as_ref()
        .map(|m| m.upload_id.clone())
        .or_else(|| persisted.as_ref().map(|r| r.upload_id.clone()));
    let mut part_size = existing
        .as_ref()
        .map(|m| m.part_size)
        .or_else(|| persisted.as_ref().map(|r| r.part_size))
        .unwrap_or_else(|| pick_part_size(source.size));
    let mut parts: BTreeMap<u32, String> = existing
        .map(|m| m.parts)
        .or_else(|| persisted.map(|r| r.parts))
        .unwrap_or_default();

    let upload_id = match resumed_id {
        Some(id) => id,
        None => {
            let created = inner
                .protocol
                .create_multipart_upload(&bucket, &key, source.content_type.as_deref())
                .await?;
            info!(%bucket, %key, upload_id = %created, "multipart upload created");
            parts.clear();
            part_size = pick_part_size(source.size);
            created
        }
    };

    let ctx = PartContext {
        inner,
        id,
        bucket,
        key,
        upload_id,
        resume_key: resume_key.clone(),
        source,
        part_size,
        total_parts: part_count(task.source.size, part_size),
        parts: Mutex::new(parts.clone()),
        part_loaded: Arc::new(Mutex::new(HashMap::new())),
        next_part: AtomicU32::new(1),
        token,
        report,
    };

    // Persist the session immediately so a reload mid-transfer can recover.
    inner.with_task(id, |t| {
        t.multipart = Some(MultipartState {
            upload_id: ctx.upload_id.clone(),
            part_size,
            parts: parts.clone(),
        });
    });
    inner.store.upsert(&resume_key, &ctx.resume_record(parts));

    match upload_parts_and_complete(&ctx).await {
        Ok(()) => {
            inner.store.delete(&resume_key);
            Ok(())
        }
        Err(err) => {
            let aborted = token.is_cancelled();
            match (aborted, inner.task_status(id)) {
                (true, Some(UploadStatus::Paused)) => {
                    // Keep upload id and confirmed parts for resume.
                }
                (true, Some(UploadStatus::Canceled)) => {
                    if let Err(abort_err) = inner
                        .protocol
                        .abort_multipart_upload(&ctx.bucket, &ctx.key, &ctx.upload_id)
                        .await
                    {
                        debug!(error = %format!("{:#}", abort_err), "remote abort failed");
                    }
                    inner.store.delete(&resume_key);
                }
                _ => {
                    // Transient failure: keep the record so retry skips the
                    // confirmed parts.
                }
            }
            Err(err)
        }
    }
}

async fn upload_parts_and_complete(ctx: &PartContext<'_>) -> Result<()> {
    let remaining = {
        let confirmed = ctx.parts.lock().unwrap();
        (1..=ctx.total_parts)
            .filter(|pn| !confirmed.contains_key(pn))
            .count()
    };

    if remaining > 0 {
        let workers = ctx.inner.cfg.part_concurrency.min(remaining);
        try_join_all((0..workers).map(|_| part_worker(ctx))).await?;
    }

    let mut completed: Vec<CompletedPart> = ctx
        .parts
        .lock()
        .unwrap()
        .iter()
        .map(|(pn, etag)| CompletedPart {
            part_number: *pn,
            etag: etag.clone(),
        })
        .collect();
    // Workers finish out of order; the remote side requires ascending part
    // numbers.
    completed.sort_by_key(|p| p.part_number);

    ctx.inner
        .protocol
        .complete_multipart_upload(&ctx.bucket, &ctx.key, &ctx.upload_id, &completed)
        .await?;
    Ok(())
}

/// One slot of the bounded pool: pull the next unclaimed part number until
/// the counter runs past the end, skipping parts a resume record already
/// confirmed.
async fn part_worker(ctx: &PartContext<'_>) -> Result<()> {
    loop {
        if ctx.token.is_cancelled() {
            return Err(TransferError::Aborted.into());
        }
        let pn = ctx.next_part.fetch_add(1, Ordering::SeqCst);
        if pn > ctx.total_parts {
            return Ok(());
        }
        if ctx.parts.lock().unwrap().contains_key(&pn) {
            continue;
        }
        upload_one_part(ctx, pn).await?;
    }
}

async fn upload_one_part(ctx: &PartContext<'_>, pn: u32) -> Result<()> {
    let url = ctx
        .inner
        .protocol
        .sign_part(&ctx.bucket, &ctx.key, &ctx.upload_id, pn)
        .await?;

    let (start, end) = part_range(ctx.source.size, ctx.part_size, pn);
    let body = ctx.source.read_range(start, end).await?;

    // Aggregate task progress: full length of every confirmed part plus the
    // live byte counts of parts still in flight, capped at the file size.
    let progress: ProgressFn = {
        let part_loaded = ctx.part_loaded.clone();
        let report = ctx.report.clone();
        // Parts confirmed before this one started; later finishers stay in
        // the live map at their full length, so nothing is counted twice.
        let done: HashMap<u32, u64> = {
            let confirmed = ctx.parts.lock().unwrap();
            confirmed
                .keys()
                .map(|n| (*n, part_len(ctx.source.size, ctx.part_size, *n)))
                .collect()
        };
        let file_size = ctx.source.size;
        Arc::new(move |loaded, _total| {
            let mut live = part_loaded.lock().unwrap();
            live.insert(pn, loaded);
            let confirmed_bytes: u64 = done.values().sum();
            let inflight: u64 = live
                .iter()
                .filter(|(n, _)| !done.contains_key(n))
                .map(|(_, v)| *v)
                .sum();
            report(file_size.min(confirmed_bytes + inflight));
        })
    };

    let etag = ctx
        .inner
        .transport
        .put_chunk(
            &url,
            body,
            ctx.source.content_type.as_deref(),
            progress,
            ctx.token,
        )
        .await?;

    // Record the ETag everywhere before claiming the next part: in-memory
    // for completion, task state for display, resume store for crash
    // recovery.
    let snapshot = {
        let mut confirmed = ctx.parts.lock().unwrap();
        confirmed.insert(pn, etag.clone());
        confirmed.clone()
    };
    ctx.inner.with_task(ctx.id, |t| {
        if let Some(mp) = t.multipart.as_mut() {
            mp.parts.insert(pn, etag.clone());
        }
    });
    ctx.inner
        .store
        .upsert(&ctx.resume_key, &ctx.resume_record(snapshot));
    debug!(part = pn, bytes = end - start, "part confirmed");
    Ok(())
}
