// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Burst-protecting ingestion buffer
//!
//! Records are written one by one while traffic is light. Once `threshold`
//! records arrive inside one burst window, later records in that window are
//! held back and written by a single deferred bulk upsert that fires one
//! window length after the threshold was reached. Until that flush runs,
//! every new record joins the pending batch so writes keep arrival order.
//!
//! With the defaults (50 ms window, threshold 50) a burst of 120 records in
//! one window produces 49 individual upserts and one bulk upsert of 71.

use crate::config::BufferConfig;
use opscope_core::OperationRecord;
use opscope_storage::{OperationSink, Result as StoreResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, warn};

/// Buffer counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStats {
    pub individual_writes: u64,
    pub bulk_writes: u64,
    /// Records written through bulk writes
    pub bulk_records: u64,
    /// Records lost to failed bulk writes
    pub dropped_records: u64,
    pub failed_individual_writes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    individual_writes: AtomicU64,
    bulk_writes: AtomicU64,
    bulk_records: AtomicU64,
    dropped_records: AtomicU64,
    failed_individual_writes: AtomicU64,
}

#[derive(Debug, Default)]
struct Window {
    start: Option<Instant>,
    count: usize,
    pending: Vec<OperationRecord>,
    flush_scheduled: bool,
    closed: bool,
}

struct Inner {
    sink: Arc<dyn OperationSink>,
    config: BufferConfig,
    window: Mutex<Window>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

/// Decides per record between an immediate upsert and the pending batch.
#[derive(Clone)]
pub struct IngestionBuffer {
    inner: Arc<Inner>,
}

impl IngestionBuffer {
    pub fn new(sink: Arc<dyn OperationSink>, config: BufferConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                config,
                window: Mutex::new(Window::default()),
                flush_task: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    pub fn sink(&self) -> &Arc<dyn OperationSink> {
        &self.inner.sink
    }

    /// Route one record. Must be called from within a Tokio runtime.
    ///
    /// Errors only come from individual writes; bulk write failures are
    /// handled by the retry-then-drop policy and show up in [`BufferStats`].
    pub fn push(&self, record: OperationRecord) -> StoreResult<()> {
        let window_len = self.inner.config.window();
        let threshold = self.inner.config.threshold.max(1);
        let now = Instant::now();

        let mut window = self.inner.window.lock();
        let expired = window
            .start
            .map(|start| now.duration_since(start) > window_len)
            .unwrap_or(true);
        if expired {
            window.start = Some(now);
            window.count = 0;
        }
        window.count += 1;

        // Records arriving while a batch is pending join it so that they
        // land after the older records they may overwrite.
        let batch_pending = window.flush_scheduled && !window.pending.is_empty();
        if window.count < threshold && !batch_pending {
            drop(window);
            return self.inner.write_one(record);
        }

        window.pending.push(record);

        if window.closed {
            let batch = std::mem::take(&mut window.pending);
            drop(window);
            self.inner.write_bulk(batch);
            return Ok(());
        }

        if window.count == threshold && !window.flush_scheduled {
            window.flush_scheduled = true;
            drop(window);
            debug!(threshold, "Burst threshold reached, deferring writes");

            let inner = self.inner.clone();
            let handle = tokio::spawn(async move {
                sleep(window_len).await;
                inner.flush();
            });
            *self.inner.flush_task.lock() = Some(handle);
        }
        Ok(())
    }

    /// Write the pending batch now.
    pub fn flush_now(&self) {
        self.inner.flush();
    }

    /// Wait for the scheduled deferred flush, if any, to finish.
    pub async fn wait_for_flush(&self) {
        let handle = self.inner.flush_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Deferred flush task failed");
            }
        }
    }

    /// Stop scheduling deferred flushes. A flush already scheduled still
    /// runs; later batch-bound records are bulk-written immediately.
    pub fn close(&self) {
        self.inner.window.lock().closed = true;
    }

    /// Resume deferring batch-bound records after [`close`](Self::close).
    pub fn reopen(&self) {
        self.inner.window.lock().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.window.lock().closed
    }

    pub fn pending_len(&self) -> usize {
        self.inner.window.lock().pending.len()
    }

    pub fn stats(&self) -> BufferStats {
        let c = &self.inner.counters;
        BufferStats {
            individual_writes: c.individual_writes.load(Ordering::Relaxed),
            bulk_writes: c.bulk_writes.load(Ordering::Relaxed),
            bulk_records: c.bulk_records.load(Ordering::Relaxed),
            dropped_records: c.dropped_records.load(Ordering::Relaxed),
            failed_individual_writes: c.failed_individual_writes.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn write_one(&self, record: OperationRecord) -> StoreResult<()> {
        match self.sink.upsert(record) {
            Ok(()) => {
                self.counters.individual_writes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters
                    .failed_individual_writes
                    .fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Take the pending batch, reset the window and write the batch.
    fn flush(&self) {
        let batch = {
            let mut window = self.window.lock();
            window.flush_scheduled = false;
            window.start = None;
            window.count = 0;
            std::mem::take(&mut window.pending)
        };
        self.write_bulk(batch);
    }

    /// One immediate retry, then the batch is dropped and counted.
    fn write_bulk(&self, batch: Vec<OperationRecord>) {
        if batch.is_empty() {
            return;
        }

        let result = self.sink.bulk_upsert(&batch).or_else(|e| {
            warn!(error = %e, records = batch.len(), "Bulk write failed, retrying once");
            self.sink.bulk_upsert(&batch)
        });

        match result {
            Ok(()) => {
                self.counters.bulk_writes.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bulk_records
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                debug!(records = batch.len(), "Flushed pending batch");
            }
            Err(e) => {
                self.counters
                    .dropped_records
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                error!(error = %e, dropped = batch.len(), "Bulk write failed twice, dropping batch");
            }
        }
    }
}
