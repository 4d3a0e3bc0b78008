// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable usage upload.
//!
//! Closed usage records land in a JSONL spool file before anything else
//! happens to them; the in-memory FIFO is rebuilt from the spool at
//! bring-up, so a power cut loses nothing. Batches upload when full, when
//! the idle flush interval fires with work pending, and at shutdown. The
//! gateway's acknowledgement is a high-water mark; acknowledged records are
//! compacted out of the spool. Failures back off exponentially and never
//! drop records.

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::rpc::{method, UploadUsageRequest, UploadUsageResponse};
use crate::gateway::Gateway;

use super::usage::UsageRecord;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub spool_path: PathBuf,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            spool_path: PathBuf::from("usage-spool.jsonl"),
            batch_size: 16,
            flush_interval: Duration::from_secs(30),
        }
    }
}

pub struct UsageUploader {
    config: UploaderConfig,
    gateway: Arc<Gateway>,
    rx: mpsc::UnboundedReceiver<UsageRecord>,
    queue: VecDeque<UsageRecord>,
    backoff: Duration,
    next_attempt: Instant,
}

impl UsageUploader {
    /// Build the uploader, replaying any spooled records from a previous
    /// run. Returns the sender the machine controller feeds.
    pub fn new(
        config: UploaderConfig,
        gateway: Arc<Gateway>,
    ) -> (mpsc::UnboundedSender<UsageRecord>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = load_spool(&config.spool_path);
        if !queue.is_empty() {
            info!(pending = queue.len(), "usage spool replayed");
        }
        let uploader = Self {
            config,
            gateway,
            rx,
            queue,
            backoff: BACKOFF_BASE,
            next_attempt: Instant::now(),
        };
        (tx, uploader)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut flush = tokio::time::interval(self.config.flush_interval);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                record = self.rx.recv() => {
                    match record {
                        Some(record) => {
                            self.enqueue(record);
                            if self.queue.len() >= self.config.batch_size {
                                self.try_upload().await;
                            }
                        }
                        None => break,
                    }
                }
                _ = flush.tick() => {
                    if !self.queue.is_empty() {
                        self.try_upload().await;
                    }
                }
            }
        }

        // Clean shutdown: capture stragglers, one last upload attempt.
        while let Ok(record) = self.rx.try_recv() {
            self.enqueue(record);
        }
        if !self.queue.is_empty() {
            self.next_attempt = Instant::now();
            self.try_upload().await;
        }
        info!(pending = self.queue.len(), "usage uploader stopped");
    }

    pub(crate) fn enqueue(&mut self, record: UsageRecord) {
        if let Err(e) = append_spool(&self.config.spool_path, &record) {
            // The record stays queued in memory; only durability degraded.
            warn!(error = %e, "usage spool append failed");
        }
        self.queue.push_back(record);
    }

    /// Upload one batch if the backoff window allows. Returns whether the
    /// gateway acknowledged anything.
    pub(crate) async fn try_upload(&mut self) -> bool {
        if self.queue.is_empty() || Instant::now() < self.next_attempt {
            return false;
        }
        let batch: Vec<UsageRecord> =
            self.queue.iter().take(self.config.batch_size).cloned().collect();
        let request = UploadUsageRequest { records: batch.clone() };

        match self
            .gateway
            .call::<_, UploadUsageResponse>(method::UPLOAD_USAGE, &request, UPLOAD_TIMEOUT)
            .await
        {
            Ok(response) => {
                let acked = response.acknowledged.min(batch.len());
                for _ in 0..acked {
                    self.queue.pop_front();
                }
                if let Err(e) = rewrite_spool(&self.config.spool_path, &self.queue) {
                    warn!(error = %e, "usage spool compaction failed");
                }
                debug!(acked, pending = self.queue.len(), "usage batch acknowledged");
                self.backoff = BACKOFF_BASE;
                self.next_attempt = Instant::now();
                acked > 0
            }
            Err(e) => {
                warn!(error = %e, pending = self.queue.len(), "usage upload failed");
                self.next_attempt = Instant::now() + self.backoff;
                self.backoff = (self.backoff * 2).min(BACKOFF_CAP);
                false
            }
        }
    }
}

fn load_spool(path: &PathBuf) -> VecDeque<UsageRecord> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return VecDeque::new();
    };
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<UsageRecord>(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "undecodable spool line skipped");
                None
            }
        })
        .collect()
}

fn append_spool(path: &PathBuf, record: &UsageRecord) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(record)?;
    writeln!(file, "{line}")?;
    file.sync_data()?;
    Ok(())
}

fn rewrite_spool(path: &PathBuf, queue: &VecDeque<UsageRecord>) -> anyhow::Result<()> {
    let mut out = String::new();
    for record in queue {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
#[path = "uploader_tests.rs"]
mod tests;
