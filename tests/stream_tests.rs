//! Integration tests for incremental stream flushes and the safe margin

mod common;

use common::{MemoryTarget, TestBed, at};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tradevault::engine::Phase;
use tradevault::{BackupKind, RestoredArtifact, TickOutcome};

#[tokio::test]
async fn test_delta_inside_safe_margin_waits() {
    // every_minute cadence, 7s margin, delta committed at t=59s.
    let bed = TestBed::new();
    let service = bed.service().await;
    bed.source.commit_delta("orderbook", at(59), b"{\"bid\":1}".to_vec()).unwrap();

    assert_eq!(
        service.stream().flush_now("orderbook", at(60)).await.unwrap(),
        TickOutcome::NothingToFlush
    );
    assert_eq!(
        service.stream().flush_now("orderbook", at(66)).await.unwrap(),
        TickOutcome::NothingToFlush
    );

    let TickOutcome::Completed(record) = service.stream().flush_now("orderbook", at(67)).await.unwrap()
    else {
        panic!("delta older than the margin should be flushed at t=67s");
    };
    assert_eq!(record.kind, BackupKind::Incremental);
    assert_eq!(record.watermark, Some(1));

    let RestoredArtifact::Deltas(deltas) = service.restore().restore(&record).await.unwrap() else {
        panic!("incremental record should restore to deltas");
    };
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].committed_at, at(59));
    assert_eq!(deltas[0].payload, b"{\"bid\":1}".to_vec());
}

#[tokio::test]
async fn test_flush_excludes_everything_at_or_after_cutoff() {
    let bed = TestBed::new();
    let service = bed.service().await;
    for secs in [10, 40, 52, 53, 58] {
        bed.source.commit_delta("orderbook", at(secs), format!("{{\"t\":{}}}", secs)).unwrap();
    }

    // Cutoff is 60 - 7 = 53: deltas at 10, 40 and 52 qualify; 53 does not.
    let record = service
        .stream()
        .flush_now("orderbook", at(60))
        .await
        .unwrap()
        .record()
        .cloned()
        .unwrap();
    assert_eq!(record.watermark, Some(3));
    assert!(record.backend_location.key.ends_with("_min_1-3.incremental.zst"));

    let RestoredArtifact::Deltas(deltas) = service.restore().restore(&record).await.unwrap() else {
        panic!("expected deltas");
    };
    assert!(deltas.iter().all(|d| d.committed_at < at(53)));
    assert_eq!(deltas.iter().map(|d| d.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_flushed_deltas_never_flushed_again() {
    let bed = TestBed::new();
    let service = bed.service().await;
    bed.source.commit_delta("orderbook", at(1), b"a".to_vec()).unwrap();
    bed.source.commit_delta("orderbook", at(2), b"b".to_vec()).unwrap();

    assert!(matches!(
        service.stream().flush_now("orderbook", at(60)).await.unwrap(),
        TickOutcome::Completed(_)
    ));
    assert_eq!(
        service.stream().flush_now("orderbook", at(120)).await.unwrap(),
        TickOutcome::NothingToFlush
    );

    bed.source.commit_delta("orderbook", at(100), b"c".to_vec()).unwrap();
    let record = service
        .stream()
        .flush_now("orderbook", at(180))
        .await
        .unwrap()
        .record()
        .cloned()
        .unwrap();
    assert_eq!(record.dedup_key, "orderbook:incremental:3-3");
    assert_eq!(service.stream().watermark("orderbook").await.unwrap(), Some(3));
}

#[tokio::test]
async fn test_watermark_rebuilt_from_ledger_after_restart() {
    let bed = TestBed::new();
    bed.source.commit_delta("orderbook", at(1), b"a".to_vec()).unwrap();
    {
        let service = bed.service().await;
        service.stream().flush_now("orderbook", at(60)).await.unwrap();
    }

    let service = bed.service().await;
    assert_eq!(service.stream().watermark("orderbook").await.unwrap(), Some(1));
    assert_eq!(
        service.stream().flush_now("orderbook", at(120)).await.unwrap(),
        TickOutcome::NothingToFlush
    );
    assert_eq!(service.ledger().list("orderbook").await.len(), 1);
}

#[tokio::test]
async fn test_stream_tick_follows_cadence() {
    let bed = TestBed::new();
    let service = bed.service().await;
    bed.source.commit_delta("orderbook", at(1), b"a".to_vec()).unwrap();

    assert!(matches!(
        service.stream().tick("orderbook", at(30)).await.unwrap(),
        TickOutcome::Completed(_)
    ));
    assert_eq!(
        service.stream().tick("orderbook", at(45)).await.unwrap(),
        TickOutcome::NotDue { next_due: at(60) }
    );
    // An empty flush still counts as a completed run.
    assert_eq!(
        service.stream().tick("orderbook", at(60)).await.unwrap(),
        TickOutcome::NothingToFlush
    );
    assert_eq!(
        service.stream().status("orderbook").unwrap().next_due,
        Some(at(120))
    );
}

#[tokio::test]
async fn test_unknown_collection_rejected() {
    let bed = TestBed::new();
    let service = bed.service().await;
    assert!(service.stream().flush_now("trades", at(0)).await.is_err());
}

#[tokio::test]
async fn test_tick_while_flush_in_flight_is_dropped() {
    let bed = TestBed::new();
    let gate = Arc::new(Semaphore::new(0));
    let target = Arc::new(MemoryTarget::gated(gate.clone()));
    let service = Arc::new(bed.service_with(target.clone()).await);
    bed.source.commit_delta("orderbook", at(0), b"a".to_vec()).unwrap();

    let running = {
        let service = service.clone();
        tokio::spawn(async move { service.stream().flush_now("orderbook", at(60)).await })
    };
    target.entered.notified().await;
    assert_eq!(service.stream().status("orderbook").unwrap().phase, Phase::Uploading);

    assert_eq!(
        service.stream().tick("orderbook", at(120)).await.unwrap(),
        TickOutcome::Skipped
    );
    assert_eq!(
        service.stream().flush_now("orderbook", at(121)).await.unwrap(),
        TickOutcome::Skipped
    );

    gate.add_permits(1);
    assert!(matches!(running.await.unwrap().unwrap(), TickOutcome::Completed(_)));
    assert_eq!(target.put_count(), 1);
    assert_eq!(service.ledger().list("orderbook").await.len(), 1);
}
