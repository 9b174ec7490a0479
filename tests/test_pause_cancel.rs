// tests/test_pause_cancel.rs
//
// Pause/resume round-trips and cancel cleanup for multipart tasks, plus the
// global queue-pause behavior.

mod common;

use common::{MockProtocol, MockTransport, make_source, wait_for};
use r2up::constants::MIB;
use r2up::resume_store::ResumeStore;
use r2up::{EngineConfig, UploadEngine, UploadStatus};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn engine_with(
    dir: &TempDir,
    protocol: Arc<MockProtocol>,
    transport: Arc<MockTransport>,
    part_concurrency: usize,
) -> (UploadEngine, ResumeStore) {
    let store_path = dir.path().join("resume.json");
    let cfg = EngineConfig::new()
        .with_resume_store_path(&store_path)
        .with_part_concurrency(part_concurrency);
    (
        UploadEngine::new(cfg, protocol, transport),
        ResumeStore::new(store_path),
    )
}

#[tokio::test]
async fn pause_preserves_progress_and_resume_finishes() {
    let dir = TempDir::new().unwrap();
    let protocol = MockProtocol::new();
    let transport = MockTransport::new();
    // One part at a time so the pause point is deterministic.
    let (engine, store) = engine_with(&dir, protocol.clone(), transport.clone(), 1);

    let source = make_source(dir.path(), "pausable.bin", 100 * MIB);
    transport.block(4);

    let id = engine.enqueue("media", "pausable.bin", source);
    wait_for("part 4 in flight", || transport.started().contains(&4)).await;

    engine.pause(id);
    wait_for("task paused", || {
        engine.task(id).map(|t| t.status) == Some(UploadStatus::Paused)
    })
    .await;
    assert!(engine.is_queue_paused());

    // Confirmed work survives the pause: three 17 MiB parts.
    let task = engine.task(id).unwrap();
    assert_eq!(task.loaded, 3 * 17 * MIB);
    assert_eq!(task.speed_bps, 0.0);
    let mp = task.multipart.as_ref().expect("multipart state kept");
    assert_eq!(mp.parts.len(), 3);
    let record = store.get(&task.resume_key).expect("resume record kept");
    assert_eq!(record.parts.len(), 3);
    assert_eq!(record.upload_id, mp.upload_id);

    // Resume completes using only the remaining parts.
    transport.unblock(4);
    engine.resume(id);
    wait_for("task done", || {
        engine.task(id).map(|t| t.status) == Some(UploadStatus::Done)
    })
    .await;

    assert_eq!(protocol.creates(), 1);
    // Parts 1..3 were attempted exactly once in total.
    let started = transport.started();
    for pn in 1..=3u32 {
        assert_eq!(started.iter().filter(|&&p| p == pn).count(), 1);
    }
    let completions = protocol.completions();
    assert_eq!(completions.len(), 1);
    let numbers: Vec<u32> = completions[0].iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);
    assert!(store.get(&engine.task(id).unwrap().resume_key).is_none());
}

#[tokio::test]
async fn cancel_aborts_remote_session_and_drops_record() {
    let dir = TempDir::new().unwrap();
    let protocol = MockProtocol::new();
    let transport = MockTransport::new();
    let (engine, store) = engine_with(&dir, protocol.clone(), transport.clone(), 1);

    let source = make_source(dir.path(), "doomed.bin", 100 * MIB);
    transport.block(2);

    let id = engine.enqueue("media", "doomed.bin", source);
    wait_for("part 2 in flight", || transport.started().contains(&2)).await;

    engine.cancel(id);
    wait_for("task canceled", || {
        engine.task(id).map(|t| t.status) == Some(UploadStatus::Canceled)
    })
    .await;
    wait_for("remote abort", || !protocol.aborts().is_empty()).await;

    let resume_key = engine.task(id).unwrap().resume_key;
    wait_for("record removed", || store.get(&resume_key).is_none()).await;
    assert!(protocol.aborts().contains(&"upload-1".to_string()));
    assert!(protocol.completions().is_empty());
}

#[tokio::test]
async fn cancel_of_paused_task_still_cleans_up() {
    let dir = TempDir::new().unwrap();
    let protocol = MockProtocol::new();
    let transport = MockTransport::new();
    let (engine, store) = engine_with(&dir, protocol.clone(), transport.clone(), 1);

    let source = make_source(dir.path(), "parked.bin", 100 * MIB);
    transport.block(2);

    let id = engine.enqueue("media", "parked.bin", source);
    wait_for("part 2 in flight", || transport.started().contains(&2)).await;
    engine.pause(id);
    wait_for("task paused", || {
        engine.task(id).map(|t| t.status) == Some(UploadStatus::Paused)
    })
    .await;

    // Nothing in flight anymore; cancel must still abort and clean up.
    let resume_key = engine.task(id).unwrap().resume_key;
    assert!(store.get(&resume_key).is_some());
    engine.cancel(id);
    wait_for("remote abort", || !protocol.aborts().is_empty()).await;
    wait_for("record removed", || store.get(&resume_key).is_none()).await;
    assert_eq!(
        engine.task(id).map(|t| t.status),
        Some(UploadStatus::Canceled)
    );
}

#[tokio::test]
async fn pausing_one_task_parks_the_whole_queue() {
    let dir = TempDir::new().unwrap();
    let protocol = MockProtocol::new();
    let transport = MockTransport::new();
    let (engine, _store) = engine_with(&dir, protocol.clone(), transport.clone(), 1);

    let first = make_source(dir.path(), "first.bin", 100 * MIB);
    let second = make_source(dir.path(), "second.bin", 100 * MIB);
    transport.block(1);

    let first_id = engine.enqueue("media", "first.bin", first);
    wait_for("first in flight", || transport.started().contains(&1)).await;
    let second_id = engine.enqueue("media", "second.bin", second);

    engine.pause(first_id);
    wait_for("first paused", || {
        engine.task(first_id).map(|t| t.status) == Some(UploadStatus::Paused)
    })
    .await;

    // The queue is parked: the second task stays queued.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        engine.task(second_id).map(|t| t.status),
        Some(UploadStatus::Queued)
    );
    assert_eq!(protocol.creates(), 1);

    transport.unblock(1);
    engine.resume_all();
    wait_for("both done", || {
        engine.task(first_id).map(|t| t.status) == Some(UploadStatus::Done)
            && engine.task(second_id).map(|t| t.status) == Some(UploadStatus::Done)
    })
    .await;
    // One task drained at a time: two sessions, two completions.
    assert_eq!(protocol.creates(), 2);
    assert_eq!(protocol.completions().len(), 2);
}
