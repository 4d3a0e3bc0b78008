// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use crate::gateway::wire::RequestEnvelope;
use crate::gateway::Gateway;
use crate::machine::usage::{CheckoutReason, UsageRecord};

use super::*;

fn record(n: u32) -> UsageRecord {
    let mut r = UsageRecord::open(&format!("s-{n}"), "lathe");
    r.close(CheckoutReason::User);
    r
}

fn config(dir: &tempfile::TempDir) -> UploaderConfig {
    UploaderConfig {
        spool_path: dir.path().join("spool.jsonl"),
        batch_size: 4,
        flush_interval: Duration::from_secs(30),
    }
}

/// Answer the next uploadUsage frame with the given high-water count.
fn respond_ack(gateway: Arc<Gateway>, mut rx: tokio::sync::mpsc::UnboundedReceiver<String>, ack: usize) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let req: RequestEnvelope = serde_json::from_str(&frame).unwrap();
            assert_eq!(req.method, "uploadUsage");
            let resp = serde_json::json!({"id": req.id, "result": {"acknowledged": ack}});
            gateway.handle_frame(&resp.to_string());
        }
    });
}

#[tokio::test]
async fn records_persist_across_restart() {
    let dir = tempdir().unwrap();
    let gateway = Arc::new(Gateway::new());

    let (_tx, mut uploader) = UsageUploader::new(config(&dir), Arc::clone(&gateway));
    uploader.enqueue(record(1));
    uploader.enqueue(record(2));
    drop(uploader);

    let (_tx, reloaded) = UsageUploader::new(config(&dir), gateway);
    assert_eq!(reloaded.pending(), 2);
}

#[tokio::test]
async fn acknowledged_records_are_compacted_out() {
    let dir = tempdir().unwrap();
    let gateway = Arc::new(Gateway::new());
    gateway.set_link_up(true);
    let rx = gateway.take_outbound().unwrap();
    respond_ack(Arc::clone(&gateway), rx, 4);

    let (_tx, mut uploader) = UsageUploader::new(config(&dir), Arc::clone(&gateway));
    for n in 0..6 {
        uploader.enqueue(record(n));
    }
    assert!(uploader.try_upload().await);
    assert_eq!(uploader.pending(), 2);

    // The spool shrank with the queue.
    let (_tx, reloaded) = UsageUploader::new(config(&dir), gateway);
    assert_eq!(reloaded.pending(), 2);
}

#[tokio::test]
async fn partial_acknowledgement_keeps_the_tail() {
    let dir = tempdir().unwrap();
    let gateway = Arc::new(Gateway::new());
    gateway.set_link_up(true);
    let rx = gateway.take_outbound().unwrap();
    respond_ack(Arc::clone(&gateway), rx, 2);

    let (_tx, mut uploader) = UsageUploader::new(config(&dir), Arc::clone(&gateway));
    for n in 0..4 {
        uploader.enqueue(record(n));
    }
    uploader.try_upload().await;
    assert_eq!(uploader.pending(), 2);
}

#[tokio::test]
async fn failed_upload_backs_off_and_keeps_records() {
    let dir = tempdir().unwrap();
    // Link down: the call fails immediately with ChannelClosed.
    let gateway = Arc::new(Gateway::new());

    let (_tx, mut uploader) = UsageUploader::new(config(&dir), gateway);
    uploader.enqueue(record(1));

    assert!(!uploader.try_upload().await);
    assert_eq!(uploader.pending(), 1);

    // Inside the backoff window nothing is attempted.
    assert!(!uploader.try_upload().await);
    assert_eq!(uploader.pending(), 1);
}

#[tokio::test]
async fn corrupt_spool_lines_are_skipped() {
    let dir = tempdir().unwrap();
    let cfg = config(&dir);
    let good = serde_json::to_string(&record(1)).unwrap();
    std::fs::write(&cfg.spool_path, format!("{good}\nnot-json\n\n")).unwrap();

    let (_tx, uploader) = UsageUploader::new(cfg, Arc::new(Gateway::new()));
    assert_eq!(uploader.pending(), 1);
}
