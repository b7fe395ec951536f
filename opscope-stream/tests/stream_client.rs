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

//! Integration tests for the stream client and ingestion buffer

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use opscope_core::{ConfigStore, MemoryConfigStore, OperationRecord};
use opscope_storage::OperationStore;
use opscope_stream::{
    BufferConfig, ByteStream, ConnectionState, EventTransport, IngestionBuffer, Registrar,
    Registration, Result, StaticRegistrar, StreamClient, StreamConfig, StreamError,
    FULL_RESYNC_CURSOR, LAST_OPERATION_ID_KEY,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

const STREAM_URL: &str = "http://backend.test/events";

/// What one `open` call does.
enum Script {
    Refuse,
    /// Serve these chunks, then stay open
    Serve(Vec<String>),
    /// Serve these chunks, then end the stream
    ServeAndEnd(Vec<String>),
}

#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    opens: Mutex<Vec<(Instant, String)>>,
}

impl ScriptedTransport {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            opens: Mutex::new(Vec::new()),
        })
    }

    fn open_count(&self) -> usize {
        self.opens.lock().len()
    }

    fn urls(&self) -> Vec<String> {
        self.opens.lock().iter().map(|(_, url)| url.clone()).collect()
    }
}

#[async_trait]
impl EventTransport for ScriptedTransport {
    async fn open(&self, url: &Url, _token: Option<&str>) -> Result<ByteStream> {
        self.opens.lock().push((Instant::now(), url.to_string()));
        let script = self.scripts.lock().pop_front().unwrap_or(Script::Refuse);
        let to_chunks = |chunks: Vec<String>| {
            futures::stream::iter(
                chunks
                    .into_iter()
                    .map(|c| Ok(Bytes::from(c)))
                    .collect::<Vec<_>>(),
            )
        };
        match script {
            Script::Refuse => Err(StreamError::Transport("connection refused".into())),
            Script::Serve(chunks) => Ok(Box::pin(
                to_chunks(chunks).chain(futures::stream::pending()),
            )),
            Script::ServeAndEnd(chunks) => Ok(Box::pin(to_chunks(chunks))),
        }
    }
}

/// Registrar counting handshakes.
struct CountingRegistrar {
    inner: StaticRegistrar,
    calls: AtomicUsize,
}

#[async_trait]
impl Registrar for CountingRegistrar {
    async fn register(&self) -> Result<Registration> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.register().await
    }
}

fn operation_frame(id: &str) -> String {
    format!(
        "id: {id}\nevent: message\ndata: {{\"operation_id\":\"{id}\",\"data\":{{\"request\":{{\"method\":\"GET\",\"url\":\"https://api.test/items?page=1\"}},\"response\":{{\"status\":200}},\"timing\":{{\"duration\":12.5}},\"meta\":{{\"tags\":[\"env:prod\"]}}}}}}\n\n"
    )
}

struct Harness {
    client: StreamClient,
    transport: Arc<ScriptedTransport>,
    registrar: Arc<CountingRegistrar>,
    store: Arc<OperationStore>,
    config_store: Arc<MemoryConfigStore>,
}

fn harness(scripts: Vec<Script>) -> Harness {
    let store = Arc::new(OperationStore::in_memory());
    let config_store = Arc::new(MemoryConfigStore::new());
    let transport = ScriptedTransport::new(scripts);
    let registrar = Arc::new(CountingRegistrar {
        inner: StaticRegistrar::new(STREAM_URL, Some("token".into())),
        calls: AtomicUsize::new(0),
    });
    let client = StreamClient::new(
        registrar.clone(),
        transport.clone(),
        config_store.clone(),
        IngestionBuffer::new(store.clone(), BufferConfig::default()),
        StreamConfig::default(),
    );
    Harness {
        client,
        transport,
        registrar,
        store,
        config_store,
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Test that a burst of 120 events in one window gives 49 single writes and
/// one deferred bulk write of 71
#[tokio::test(start_paused = true)]
async fn test_burst_through_client() {
    let payload: String = (0..120).map(|i| operation_frame(&format!("op-{:03}", i))).collect();
    let h = harness(vec![Script::Serve(vec![payload])]);

    h.client.connect(None);
    settle().await;

    let stats = h.client.buffer().stats();
    assert_eq!(stats.individual_writes, 49);
    assert_eq!(stats.bulk_writes, 0);
    assert_eq!(h.store.len(), 49);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let stats = h.client.buffer().stats();
    assert_eq!(stats.bulk_writes, 1);
    assert_eq!(stats.bulk_records, 71);
    assert_eq!(h.store.len(), 120);

    let record = h.store.get("op-007").unwrap();
    assert_eq!(record.status_code, Some(200));
    assert_eq!(record.path, "/items");
    assert_eq!(record.tag_tokens, vec!["env:prod".to_string()]);
    h.client.close();
}

/// Test 7 opens 5 s apart, then disconnected until an explicit reconnect
#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion() {
    let h = harness(vec![]);
    let start = Instant::now();
    let mut state = h.client.watch_state();

    h.client.connect(None);
    state
        .wait_for(|s| *s == ConnectionState::Reconnecting)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert_eq!(h.transport.open_count(), 7);
    assert_eq!(h.registrar.calls.load(Ordering::SeqCst), 7);

    let gaps: Vec<Duration> = h
        .transport
        .opens
        .lock()
        .windows(2)
        .map(|w| w[1].0 - w[0].0)
        .collect();
    assert!(gaps.iter().all(|g| *g == Duration::from_secs(5)));
    assert_eq!(h.transport.opens.lock()[0].0, start);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.transport.open_count(), 7);

    h.client.reconnect();
    settle().await;
    assert_eq!(h.transport.open_count(), 8);
    h.client.close();
}

/// Test that a successful open resets the retry count
#[tokio::test(start_paused = true)]
async fn test_successful_open_resets_retries() {
    let h = harness(vec![
        Script::Refuse,
        Script::Refuse,
        Script::ServeAndEnd(vec![operation_frame("a")]),
        Script::Serve(vec![operation_frame("b")]),
    ]);

    h.client.connect(None);
    tokio::time::sleep(Duration::from_secs(16)).await;

    assert_eq!(h.transport.open_count(), 4);
    assert_eq!(h.client.state(), ConnectionState::Connected);
    assert_eq!(h.client.retry_count(), 0);
    assert_eq!(h.store.len(), 2);
    h.client.close();
}

/// Test that the last operation id is persisted and sent on reconnect
#[tokio::test(start_paused = true)]
async fn test_resume_cursor() {
    let h = harness(vec![
        Script::ServeAndEnd(vec![operation_frame("10"), operation_frame("11")]),
        Script::Serve(vec![]),
    ]);
    h.config_store.set(LAST_OPERATION_ID_KEY, "9").unwrap();

    h.client.connect(None);
    settle().await;
    assert_eq!(h.client.last_cursor().as_deref(), Some("11"));

    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(
        h.transport.urls(),
        vec![
            format!("{}?last_id=9", STREAM_URL),
            format!("{}?last_id=11", STREAM_URL),
        ]
    );
    h.client.close();
}

/// Test that a frame split across chunks and malformed frames are handled
#[tokio::test(start_paused = true)]
async fn test_split_and_malformed_frames() {
    let frame = operation_frame("split");
    let (head, tail) = frame.split_at(17);
    let h = harness(vec![Script::Serve(vec![
        ": heartbeat\n\n".into(),
        "data: {not json\n\n".into(),
        head.to_string(),
        tail.to_string(),
        "event: unknown\ndata: {}\n\n".into(),
    ])]);

    h.client.connect(None);
    settle().await;

    assert_eq!(h.store.len(), 1);
    assert!(h.store.get("split").is_some());
    let stats = h.client.stats();
    assert_eq!(stats.malformed_frames, 1);
    assert_eq!(stats.operations_received, 1);
    assert_eq!(h.client.state(), ConnectionState::Connected);
    h.client.close();
}

/// Test that a full resync stamps, prunes and moves the cursor
#[tokio::test(start_paused = true)]
async fn test_full_resync_prunes_stale_records() {
    let h = harness(vec![Script::Serve(vec![
        operation_frame("keep-1"),
        operation_frame("keep-2"),
        "event: resync-complete\ndata: {}\n\n".into(),
    ])]);
    h.store
        .bulk_upsert(&[
            OperationRecord::new("keep-1", chrono::Utc::now()),
            OperationRecord::new("gone", chrono::Utc::now()),
        ])
        .unwrap();
    h.config_store.set(LAST_OPERATION_ID_KEY, "old").unwrap();
    let mut resync = h.client.watch_resync();

    h.client.resync();
    resync.changed().await.unwrap();
    let summary = resync.borrow().clone().unwrap();

    assert_eq!(
        h.transport.urls(),
        vec![format!("{}?last_id={}", STREAM_URL, FULL_RESYNC_CURSOR)]
    );
    assert_eq!(summary.received, 2);
    assert_eq!(summary.removed, 1);
    assert!(h.store.get("gone").is_none());
    assert_eq!(
        h.store.get("keep-1").unwrap().last_synced_at.as_deref(),
        Some(summary.run_id.as_str())
    );
    assert_eq!(h.client.last_cursor().as_deref(), Some("keep-2"));
    h.client.close();
}

/// Test that a resync interrupted before completion is requested again
#[tokio::test(start_paused = true)]
async fn test_interrupted_resync_restarts() {
    let h = harness(vec![
        Script::ServeAndEnd(vec![operation_frame("a")]),
        Script::Serve(vec![]),
    ]);
    h.config_store.set(LAST_OPERATION_ID_KEY, "old").unwrap();

    h.client.resync();
    tokio::time::sleep(Duration::from_secs(6)).await;

    let expected = format!("{}?last_id={}", STREAM_URL, FULL_RESYNC_CURSOR);
    assert_eq!(h.transport.urls(), vec![expected.clone(), expected]);
    // Cursor untouched during the pass
    assert_eq!(h.client.last_cursor().as_deref(), Some("old"));
    h.client.close();
}

/// Test that close stops retries but a scheduled flush still lands
#[tokio::test(start_paused = true)]
async fn test_close_lets_flush_land() {
    let payload: String = (0..60).map(|i| operation_frame(&format!("c-{:02}", i))).collect();
    let h = harness(vec![Script::ServeAndEnd(vec![payload])]);

    h.client.connect(None);
    settle().await;
    assert_eq!(h.store.len(), 49);

    h.client.close();
    assert_eq!(h.client.state(), ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.store.len(), 60);
    assert_eq!(h.transport.open_count(), 1);
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
}

/// Test that connect replaces a live connection
#[tokio::test(start_paused = true)]
async fn test_connect_replaces_existing_connection() {
    let h = harness(vec![Script::Serve(vec![]), Script::Serve(vec![])]);

    h.client.connect(None);
    settle().await;
    h.client.connect(Some("override".into()));
    settle().await;

    assert_eq!(
        h.transport.urls(),
        vec![STREAM_URL.to_string(), format!("{}?last_id=override", STREAM_URL)]
    );
    assert_eq!(h.client.state(), ConnectionState::Connected);
    h.client.close();
}

/// Test that a connection opened after close still defers burst writes
#[tokio::test(start_paused = true)]
async fn test_reconnect_after_close_keeps_burst_batching() {
    let payload: String = (0..120).map(|i| operation_frame(&format!("r-{:03}", i))).collect();
    let h = harness(vec![Script::Serve(vec![]), Script::Serve(vec![payload])]);

    h.client.connect(None);
    settle().await;
    h.client.close();
    assert!(h.client.buffer().is_closed());

    h.client.reconnect();
    settle().await;
    assert!(!h.client.buffer().is_closed());
    assert_eq!(h.client.buffer().stats().individual_writes, 49);
    assert_eq!(h.client.buffer().stats().bulk_writes, 0);

    tokio::time::sleep(Duration::from_millis(60)).await;
    let stats = h.client.buffer().stats();
    assert_eq!(stats.bulk_writes, 1);
    assert_eq!(stats.bulk_records, 71);
    assert_eq!(h.store.len(), 120);
    h.client.close();
}
