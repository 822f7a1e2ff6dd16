//! End-to-end transfers through the engine and executor

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use md5::Digest;
use nb_core::{
    EngineConfig, ErrorKind, JobDefinition, JobEngine, JobEvent, JobStatus, LocalStore,
    ObjectStore, ProviderRegistry, ResourceUri, RetryConfig, Scheme, Strategy, TransferExecutor,
    checksum::hash_file,
};
use support::{GIB, MIB, MemoryStore, payload};

fn uri(s: &str) -> ResourceUri {
    ResourceUri::parse(s).unwrap()
}

fn config() -> EngineConfig {
    EngineConfig {
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        ..Default::default()
    }
}

fn engine(stores: Vec<Arc<dyn ObjectStore>>) -> JobEngine {
    let registry = ProviderRegistry::new();
    registry.register(Arc::new(LocalStore::new()));
    for store in stores {
        registry.register(store);
    }
    let executor = TransferExecutor::new(registry, config(), None);
    JobEngine::with_state_store(Arc::new(executor), 4, None)
}

#[tokio::test]
async fn test_upload_survives_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("video.bin");
    let data = payload(10 * MIB as usize);
    tokio::fs::write(&local, &data).await.unwrap();

    let gcs = MemoryStore::new(Scheme::Gcs);
    gcs.disconnect_at(4 * MIB);
    let engine = engine(vec![Arc::new(gcs.clone())]);

    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = progress.clone();
    let _subscription = engine
        .subscribe(move |event| {
            if let JobEvent::Progress { progress, .. } = event {
                seen.lock().unwrap().push(progress.bytes_transferred);
            }
        })
        .await
        .unwrap();

    let dest = uri("gs://media/video.bin");
    let job = engine
        .create_job(JobDefinition::upload(
            ResourceUri::from_local_path(&local).unwrap(),
            dest.clone(),
        ))
        .await
        .unwrap();
    let job = engine.wait_for(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert!(matches!(
        job.plan.as_ref().unwrap().strategy,
        Strategy::StreamThroughClient {
            resumable: true,
            ..
        }
    ));
    let stored = gcs.contents(&dest).unwrap();
    assert_eq!(stored.len() as u64, 10 * MIB);
    assert_eq!(
        hash_file(&local, nb_core::ChecksumAlgorithm::Md5).await.unwrap().value,
        hex::encode(md5::Md5::digest(&stored[..]))
    );
    assert_eq!(gcs.calls("query_committed"), 1);
    assert_eq!(gcs.calls("begin_upload"), 1);

    let progress = progress.lock().unwrap();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
}

#[tokio::test]
async fn test_paused_upload_resumes_from_committed_offset() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("archive.tar");
    let data = payload(10 * MIB as usize);
    tokio::fs::write(&local, &data).await.unwrap();

    let gcs = MemoryStore::new(Scheme::Gcs);
    gcs.hold_at(4 * MIB);
    let engine = engine(vec![Arc::new(gcs.clone())]);

    let dest = uri("gs://media/archive.tar");
    let job = engine
        .create_job(JobDefinition::upload(
            ResourceUri::from_local_path(&local).unwrap(),
            dest.clone(),
        ))
        .await
        .unwrap();

    gcs.reached().await;
    engine.pause_job(job.id).await.unwrap();
    assert_eq!(engine.get_job_status(job.id).await.unwrap(), JobStatus::Paused);
    gcs.release();

    // Resume is deferred until the first executor has exited
    engine.resume_job(job.id).await.unwrap();
    let job = engine.wait_for(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(gcs.contents(&dest).unwrap().as_ref(), &data[..]);
    assert_eq!(gcs.bytes_received(), 10 * MIB);
    assert_eq!(gcs.calls("resume_upload"), 1);
    assert_eq!(gcs.open_sessions(), 0);
}

#[tokio::test]
async fn test_large_s3_copy_uses_multipart() {
    let s3 = MemoryStore::new(Scheme::S3);
    let src = uri("s3://bucket/big.iso");
    let dest = uri("s3://bucket/copy/big.iso");
    s3.insert_sized(&src, 6 * GIB);
    let engine = engine(vec![Arc::new(s3.clone())]);

    let job = engine
        .create_job(JobDefinition::copy(src.clone(), dest.clone()))
        .await
        .unwrap();
    let job = engine.wait_for(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(s3.calls("copy"), 0);
    assert_eq!(s3.calls("create_multipart"), 1);
    assert_eq!(s3.calls("copy_part"), 12);
    assert_eq!(s3.calls("complete_multipart"), 1);
    assert_eq!(s3.size_of(&dest), Some(6 * GIB));
    assert_eq!(job.progress.bytes_transferred, 6 * GIB);
}

#[tokio::test]
async fn test_small_s3_copy_is_one_call() {
    let s3 = MemoryStore::new(Scheme::S3);
    let src = uri("s3://bucket/exact-limit.bin");
    let dest = uri("s3://other/exact-limit.bin");
    s3.insert_sized(&src, 5 * GIB);
    let engine = engine(vec![Arc::new(s3.clone())]);

    let job = engine
        .create_job(JobDefinition::copy(src, dest.clone()))
        .await
        .unwrap();
    let job = engine.wait_for(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(s3.calls("copy"), 1);
    assert_eq!(s3.calls("create_multipart"), 0);
    assert_eq!(s3.calls("copy_part"), 0);
    assert_eq!(s3.size_of(&dest), Some(5 * GIB));
}

#[tokio::test]
async fn test_gcs_copy_loops_rewrite() {
    let gcs = MemoryStore::new(Scheme::Gcs);
    let src = uri("gs://bucket/dump.bin");
    let dest = uri("gs://bucket/dump-copy.bin");
    gcs.insert_sized(&src, 3 * GIB + 1);
    let engine = engine(vec![Arc::new(gcs.clone())]);

    let job = engine
        .create_job(JobDefinition::copy(src, dest.clone()))
        .await
        .unwrap();
    let job = engine.wait_for(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(gcs.calls("rewrite"), 4);
    assert_eq!(gcs.size_of(&dest), Some(3 * GIB + 1));
}

#[tokio::test]
async fn test_azure_to_local_move() {
    let dir = tempfile::tempdir().unwrap();
    let azure = MemoryStore::new(Scheme::Azure);
    let src = uri("az://container/report.pdf");
    let data = payload(3 * MIB as usize + 17);
    azure.insert(&src, data.clone());
    let engine = engine(vec![Arc::new(azure.clone())]);

    let local = dir.path().join("report.pdf");
    let job = engine
        .create_job(JobDefinition::move_to(
            src.clone(),
            ResourceUri::from_local_path(&local).unwrap(),
        ))
        .await
        .unwrap();
    let job = engine.wait_for(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(tokio::fs::read(&local).await.unwrap(), data);
    assert!(azure.contents(&src).is_none());
    assert!(!dir.path().join(".report.pdf.nbpart").exists());
}

#[tokio::test]
async fn test_azure_copy_polls_until_done() {
    let azure = MemoryStore::new(Scheme::Azure);
    let src = uri("az://container/a.txt");
    let dest = uri("az://container/b.txt");
    azure.insert(&src, &b"hello azure"[..]);
    let engine = engine(vec![Arc::new(azure.clone())]);

    let job = engine
        .create_job(JobDefinition::copy(src, dest.clone()))
        .await
        .unwrap();
    let job = engine.wait_for(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(azure.calls("start_copy"), 1);
    assert_eq!(azure.calls("copy_status"), 2);
    assert_eq!(azure.contents(&dest).unwrap().as_ref(), b"hello azure");
}

#[tokio::test]
async fn test_asset_copy_is_not_supported() {
    let assets = MemoryStore::new(Scheme::Asset);
    let src = uri("asset://library/a.png");
    assets.insert(&src, &b"png"[..]);
    let engine = engine(vec![Arc::new(assets.clone())]);

    let job = engine
        .create_job(JobDefinition::copy(src, uri("asset://library/b.png")))
        .await
        .unwrap();
    let job = engine.wait_for(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().kind, ErrorKind::NotSupported);
    assert_eq!(assets.calls("copy"), 0);
}

#[tokio::test]
async fn test_existing_destination_without_overwrite_fails() {
    let s3 = MemoryStore::new(Scheme::S3);
    let src = uri("s3://bucket/a");
    let dest = uri("s3://bucket/b");
    s3.insert(&src, &b"new"[..]);
    s3.insert(&dest, &b"old"[..]);
    let engine = engine(vec![Arc::new(s3.clone())]);

    let definition = JobDefinition::copy(src, dest.clone()).with_options(nb_core::JobOptions {
        overwrite: false,
        ..Default::default()
    });
    let job = engine.create_job(definition).await.unwrap();
    let job = engine.wait_for(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(s3.contents(&dest).unwrap().as_ref(), b"old");
}

#[tokio::test]
async fn test_cancel_running_upload_aborts_session() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("big.bin");
    tokio::fs::write(&local, payload(8 * MIB as usize))
        .await
        .unwrap();

    let s3 = MemoryStore::new(Scheme::S3);
    s3.hold_at(2 * MIB);
    let engine = engine(vec![Arc::new(s3.clone())]);

    let job = engine
        .create_job(JobDefinition::upload(
            ResourceUri::from_local_path(&local).unwrap(),
            uri("s3://bucket/big.bin"),
        ))
        .await
        .unwrap();
    s3.reached().await;
    engine.cancel_job(job.id).await.unwrap();
    engine.cancel_job(job.id).await.unwrap();
    s3.release();

    let job = engine.wait_for(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Canceled);

    // The executor aborts its session after the in-flight chunk returns
    tokio::time::timeout(Duration::from_secs(5), async {
        while s3.calls("abort_upload") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(s3.open_sessions(), 0);
    assert!(s3.contents(&uri("s3://bucket/big.bin")).is_none());
}

async fn eventually(what: &str, mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// A 6 GiB S3 copy paused once its first part has landed
async fn paused_multipart_copy(s3: &MemoryStore, engine: &JobEngine) -> nb_core::JobId {
    s3.insert_sized(&uri("s3://bucket/big.iso"), 6 * GIB);
    s3.part_delay(Duration::from_millis(100));
    let job = engine
        .create_job(JobDefinition::copy(
            uri("s3://bucket/big.iso"),
            uri("s3://bucket/copy/big.iso"),
        ))
        .await
        .unwrap();
    eventually("first part", || s3.calls("copy_part") >= 1).await;
    engine.pause_job(job.id).await.unwrap();
    // Let the parts already in flight finish
    tokio::time::sleep(Duration::from_millis(400)).await;
    job.id
}

#[tokio::test]
async fn test_paused_multipart_copy_keeps_parts_in_flight() {
    let s3 = MemoryStore::new(Scheme::S3);
    let engine = engine(vec![Arc::new(s3.clone())]);
    let id = paused_multipart_copy(&s3, &engine).await;

    assert_eq!(s3.calls("copy_part_started"), s3.calls("copy_part"));
    assert!(s3.calls("copy_part") < 12);
    assert_eq!(s3.open_multiparts(), 1);

    engine.resume_job(id).await.unwrap();
    let job = engine.wait_for(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(s3.calls("copy_part_started"), 12);
    assert_eq!(s3.calls("copy_part"), 12);
    assert_eq!(s3.calls("create_multipart"), 1);
    assert_eq!(s3.calls("complete_multipart"), 1);
    assert_eq!(s3.size_of(&uri("s3://bucket/copy/big.iso")), Some(6 * GIB));
}

#[tokio::test]
async fn test_resume_finds_multipart_copy_already_completed() {
    let s3 = MemoryStore::new(Scheme::S3);
    let engine = engine(vec![Arc::new(s3.clone())]);
    let id = paused_multipart_copy(&s3, &engine).await;
    let parts_before = s3.calls("copy_part");
    s3.end_multiparts(&uri("s3://bucket/copy/big.iso"), Some(6 * GIB));

    engine.resume_job(id).await.unwrap();
    let job = engine.wait_for(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(s3.calls("create_multipart"), 1);
    assert_eq!(s3.calls("complete_multipart"), 0);
    assert_eq!(s3.calls("copy_part"), parts_before);
    assert_eq!(job.progress.bytes_transferred, 6 * GIB);
}

#[tokio::test]
async fn test_resume_restarts_expired_multipart_copy() {
    let s3 = MemoryStore::new(Scheme::S3);
    let engine = engine(vec![Arc::new(s3.clone())]);
    let id = paused_multipart_copy(&s3, &engine).await;
    s3.end_multiparts(&uri("s3://bucket/copy/big.iso"), None);

    engine.resume_job(id).await.unwrap();
    let job = engine.wait_for(id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(s3.calls("create_multipart"), 2);
    assert_eq!(s3.calls("complete_multipart"), 1);
    assert_eq!(s3.open_multiparts(), 0);
    assert_eq!(s3.size_of(&uri("s3://bucket/copy/big.iso")), Some(6 * GIB));
}

#[tokio::test]
async fn test_cancel_running_multipart_copy_aborts_upload() {
    let s3 = MemoryStore::new(Scheme::S3);
    let src = uri("s3://bucket/big.iso");
    let dest = uri("s3://bucket/copy/big.iso");
    s3.insert_sized(&src, 6 * GIB);
    s3.part_delay(Duration::from_millis(100));
    let engine = engine(vec![Arc::new(s3.clone())]);

    let job = engine
        .create_job(JobDefinition::copy(src, dest.clone()))
        .await
        .unwrap();
    eventually("first part", || s3.calls("copy_part") >= 1).await;
    engine.cancel_job(job.id).await.unwrap();

    let job = engine.wait_for(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Canceled);
    eventually("abort", || s3.calls("abort_multipart") == 1).await;
    assert_eq!(s3.open_multiparts(), 0);
    assert!(s3.calls("copy_part_started") < 12);
    assert_eq!(s3.calls("complete_multipart"), 0);
    assert_eq!(s3.size_of(&dest), None);
}

#[tokio::test]
async fn test_corrupted_upload_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("ledger.db");
    tokio::fs::write(&local, payload(2 * MIB as usize))
        .await
        .unwrap();

    let gcs = MemoryStore::new(Scheme::Gcs);
    gcs.corrupt_uploads();
    let engine = engine(vec![Arc::new(gcs.clone())]);

    let dest = uri("gs://media/ledger.db");
    let job = engine
        .create_job(JobDefinition::upload(
            ResourceUri::from_local_path(&local).unwrap(),
            dest.clone(),
        ))
        .await
        .unwrap();
    let job = engine.wait_for(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().kind, ErrorKind::IntegrityMismatch);
    assert_eq!(gcs.calls("delete"), 1);
    assert_eq!(gcs.size_of(&dest), None);
}

#[tokio::test]
async fn test_azure_source_changed_during_copy() {
    let azure = MemoryStore::new(Scheme::Azure);
    let src = uri("az://container/live.log");
    let dest = uri("az://container/live-copy.log");
    azure.insert(&src, &b"first line"[..]);
    azure.touch_source_on_poll();
    let engine = engine(vec![Arc::new(azure.clone())]);

    let job = engine
        .create_job(JobDefinition::copy(src, dest.clone()))
        .await
        .unwrap();
    let job = engine.wait_for(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().kind, ErrorKind::IntegrityMismatch);
    assert_eq!(azure.calls("copy_status"), 1);
    assert_eq!(azure.calls("abort_copy"), 1);
    assert_eq!(azure.size_of(&dest), None);
}

#[tokio::test]
async fn test_azure_source_changed_after_copy() {
    let azure = MemoryStore::new(Scheme::Azure);
    let src = uri("az://container/live.log");
    let dest = uri("az://container/live-copy.log");
    azure.insert(&src, &b"first line"[..]);
    azure.touch_source_after_copy();
    let engine = engine(vec![Arc::new(azure.clone())]);

    let job = engine
        .create_job(JobDefinition::copy(src.clone(), dest.clone()))
        .await
        .unwrap();
    let job = engine.wait_for(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().kind, ErrorKind::IntegrityMismatch);
    assert_eq!(azure.calls("delete"), 1);
    assert_eq!(azure.size_of(&dest), None);
    assert!(azure.contents(&src).is_some());
}
