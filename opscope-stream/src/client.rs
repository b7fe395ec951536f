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

//! Stream client
//!
//! Owns the connection lifecycle against the backend event stream:
//!
//! 1. Ask the [`Registrar`] for the stream URL and bearer token.
//! 2. Open the byte stream with the resume cursor attached as `last_id`.
//! 3. Parse frames, transform events into records and hand them to the
//!    [`IngestionBuffer`].
//! 4. On any transport error (including a stream that simply ends) wait the
//!    retry delay and start over from step 1, until the retry budget is
//!    spent.
//!
//! A full resync is requested with the [`FULL_RESYNC_CURSOR`] sentinel. Every
//! record received during the pass is stamped with a fresh run id; the
//! `resync-complete` event flushes pending writes and prunes every record
//! that was not stamped.

use crate::buffer::IngestionBuffer;
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::state::{ConnectionState, RetryPolicy};
use crate::transport::{EventTransport, Registrar};
use chrono::Utc;
use futures::StreamExt;
use opscope_core::{parse_event, to_record, ConfigStore, FrameParser, StreamFrame};
use opscope_storage::OperationSink;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// Resume cursor value asking the server to replay everything.
pub const FULL_RESYNC_CURSOR: &str = "FULL_RESYNC_CURSOR";

/// Config store key holding the last persisted operation id.
pub const LAST_OPERATION_ID_KEY: &str = "opscope.last_operation_id";

/// Query parameter carrying the resume cursor.
pub const RESUME_PARAM: &str = "last_id";

/// Event name closing a full resync pass.
pub const RESYNC_COMPLETE_EVENT: &str = "resync-complete";

/// Outcome of a completed full resync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncSummary {
    pub run_id: String,
    /// Operations received during the pass
    pub received: usize,
    /// Local records pruned because the server no longer has them
    pub removed: usize,
}

/// Client counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStats {
    pub connection_attempts: u64,
    pub frames_received: u64,
    pub operations_received: u64,
    pub malformed_frames: u64,
}

#[derive(Debug, Default)]
struct Counters {
    connection_attempts: AtomicU64,
    frames_received: AtomicU64,
    operations_received: AtomicU64,
    malformed_frames: AtomicU64,
}

/// In-progress full resync pass.
#[derive(Debug)]
struct ResyncPass {
    run_id: String,
    received: usize,
    latest_id: Option<String>,
}

impl ResyncPass {
    fn start() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            received: 0,
            latest_id: None,
        }
    }
}

enum SessionEnd {
    Cancelled,
    Failed {
        error: StreamError,
        resync_pending: bool,
    },
}

struct ClientInner {
    registrar: Arc<dyn Registrar>,
    transport: Arc<dyn EventTransport>,
    config_store: Arc<dyn ConfigStore>,
    buffer: IngestionBuffer,
    policy: RetryPolicy,
    state_tx: watch::Sender<ConnectionState>,
    resync_tx: watch::Sender<Option<ResyncSummary>>,
    retries: AtomicU32,
    control: Mutex<Option<CancellationToken>>,
    counters: Counters,
}

/// Event stream client.
///
/// Cheap to clone; all clones drive the same connection. Dropping the last
/// clone cancels the connection task.
#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<ClientInner>,
    _guard: Arc<CancelOnDrop>,
}

/// Held only by client handles, never by the connection task.
struct CancelOnDrop(Arc<ClientInner>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.0.control.lock().take() {
            token.cancel();
        }
    }
}

impl StreamClient {
    pub fn new(
        registrar: Arc<dyn Registrar>,
        transport: Arc<dyn EventTransport>,
        config_store: Arc<dyn ConfigStore>,
        buffer: IngestionBuffer,
        config: StreamConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (resync_tx, _) = watch::channel(None);
        let inner = Arc::new(ClientInner {
            registrar,
            transport,
            config_store,
            buffer,
            policy: config.retry_policy(),
            state_tx,
            resync_tx,
            retries: AtomicU32::new(0),
            control: Mutex::new(None),
            counters: Counters::default(),
        });
        Self {
            _guard: Arc::new(CancelOnDrop(inner.clone())),
            inner,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Receiver updated after every completed full resync pass.
    pub fn watch_resync(&self) -> watch::Receiver<Option<ResyncSummary>> {
        self.inner.resync_tx.subscribe()
    }

    pub fn buffer(&self) -> &IngestionBuffer {
        &self.inner.buffer
    }

    /// Last persisted resume cursor.
    pub fn last_cursor(&self) -> Option<String> {
        self.inner.config_store.get(LAST_OPERATION_ID_KEY)
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.retries.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ClientStats {
        let c = &self.inner.counters;
        ClientStats {
            connection_attempts: c.connection_attempts.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            operations_received: c.operations_received.load(Ordering::Relaxed),
            malformed_frames: c.malformed_frames.load(Ordering::Relaxed),
        }
    }

    /// Close any existing connection and open a new one.
    ///
    /// Without an override the stream resumes from the persisted cursor.
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self, resume_override: Option<String>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.control.lock().replace(token.clone()) {
            previous.cancel();
        }
        self.inner.buffer.reopen();

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run(resume_override, token).await;
        });
    }

    /// Reconnect requesting a full replay from the server.
    pub fn resync(&self) {
        info!("Starting full resync");
        self.connect(Some(FULL_RESYNC_CURSOR.to_string()));
    }

    /// Clear retry counters and connect again.
    pub fn reconnect(&self) {
        self.reset();
        self.connect(None);
    }

    pub fn reset(&self) {
        self.inner.retries.store(0, Ordering::SeqCst);
    }

    /// Stop the connection and any pending retry timer.
    ///
    /// A deferred flush that is already scheduled still lands.
    pub fn close(&self) {
        if let Some(token) = self.inner.control.lock().take() {
            token.cancel();
        }
        self.inner.buffer.close();
        self.inner.state_tx.send_replace(ConnectionState::Disconnected);
        debug!("Stream client closed");
    }
}

impl ClientInner {
    async fn run(self: Arc<Self>, resume_override: Option<String>, token: CancellationToken) {
        let mut resume = resume_override.or_else(|| self.config_store.get(LAST_OPERATION_ID_KEY));

        loop {
            self.set_state(&token, ConnectionState::Connecting);

            let (error, resync_pending) = match self.session(resume.as_deref(), &token).await {
                SessionEnd::Cancelled => return,
                SessionEnd::Failed {
                    error,
                    resync_pending,
                } => (error, resync_pending),
            };

            let retries = self.retries.load(Ordering::SeqCst);
            if !self.policy.allows(retries) {
                error!(error = %error, retries, "Giving up on event stream");
                self.set_state(&token, ConnectionState::Disconnected);
                return;
            }
            self.retries.store(retries + 1, Ordering::SeqCst);
            warn!(
                error = %error,
                attempt = retries + 1,
                max = self.policy.max_retries,
                delay_ms = self.policy.delay.as_millis() as u64,
                "Event stream failed, scheduling reconnect"
            );
            self.set_state(&token, ConnectionState::Reconnecting);

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.policy.delay) => {}
            }

            resume = if resync_pending {
                Some(FULL_RESYNC_CURSOR.to_string())
            } else {
                self.config_store.get(LAST_OPERATION_ID_KEY)
            };
        }
    }

    /// One registration plus stream lifetime.
    async fn session(&self, resume: Option<&str>, token: &CancellationToken) -> SessionEnd {
        let mut pass = (resume == Some(FULL_RESYNC_CURSOR)).then(ResyncPass::start);
        let failed = |error: StreamError, pass: &Option<ResyncPass>| SessionEnd::Failed {
            error,
            resync_pending: pass.is_some(),
        };

        self.counters.connection_attempts.fetch_add(1, Ordering::Relaxed);

        let opened = tokio::select! {
            _ = token.cancelled() => return SessionEnd::Cancelled,
            opened = self.open(resume) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return failed(e, &pass),
        };

        self.retries.store(0, Ordering::SeqCst);
        self.set_state(token, ConnectionState::Connected);
        info!(resume = resume.unwrap_or("<none>"), "Event stream connected");

        let mut parser = FrameParser::new();
        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => return SessionEnd::Cancelled,
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for frame in parser.push(&bytes) {
                        self.handle_frame(frame, &mut pass);
                    }
                }
                Some(Err(e)) => return failed(e, &pass),
                None => {
                    for frame in parser.finish() {
                        self.handle_frame(frame, &mut pass);
                    }
                    return failed(StreamError::Transport("stream ended".into()), &pass);
                }
            }
        }
    }

    async fn open(&self, resume: Option<&str>) -> Result<crate::transport::ByteStream> {
        let registration = self.registrar.register().await?;
        let mut url = Url::parse(&registration.url)?;
        if let Some(cursor) = resume {
            url.query_pairs_mut().append_pair(RESUME_PARAM, cursor);
        }
        debug!(url = %url, "Opening event stream");
        self.transport
            .open(&url, registration.token.as_deref())
            .await
    }

    fn handle_frame(&self, frame: StreamFrame, pass: &mut Option<ResyncPass>) {
        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
        let event = frame.event_name().to_owned();
        match event.as_str() {
            "message" | "operation" => self.handle_operation(frame, pass),
            RESYNC_COMPLETE_EVENT => match pass.take() {
                Some(finished) => self.finish_resync(finished),
                None => debug!("Ignoring resync-complete outside a resync pass"),
            },
            other => debug!(event = other, "Skipping unhandled event"),
        }
    }

    fn handle_operation(&self, frame: StreamFrame, pass: &mut Option<ResyncPass>) {
        let mut event = match parse_event(&frame.data) {
            Ok(event) => event,
            Err(e) => {
                self.counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, frame_id = ?frame.id, "Skipping malformed event");
                return;
            }
        };
        if event.id.is_none() {
            event.id = frame.id;
        }

        let mut record = to_record(&event, Utc::now());
        self.counters.operations_received.fetch_add(1, Ordering::Relaxed);

        match pass {
            Some(pass) => {
                record.last_synced_at = Some(pass.run_id.clone());
                pass.received += 1;
                if let Some(id) = &record.operation_id {
                    pass.latest_id = Some(id.clone());
                }
            }
            None => {
                if let Some(id) = &record.operation_id {
                    if let Err(e) = self.config_store.set(LAST_OPERATION_ID_KEY, id) {
                        warn!(error = %e, "Failed to persist resume cursor");
                    }
                }
            }
        }

        let id = record.id.clone();
        if let Err(e) = self.buffer.push(record) {
            warn!(error = %e, id = %id, "Failed to store operation");
        }
    }

    fn finish_resync(&self, pass: ResyncPass) {
        self.buffer.flush_now();

        let removed = match self.buffer.sink().prune_not_stamped(&pass.run_id) {
            Ok(removed) => removed,
            Err(e) => {
                error!(error = %e, run_id = %pass.run_id, "Resync prune failed");
                0
            }
        };

        let cursor = match &pass.latest_id {
            Some(id) => self.config_store.set(LAST_OPERATION_ID_KEY, id),
            None => self.config_store.remove(LAST_OPERATION_ID_KEY),
        };
        if let Err(e) = cursor {
            warn!(error = %e, "Failed to persist resume cursor after resync");
        }

        info!(
            run_id = %pass.run_id,
            received = pass.received,
            removed,
            "Full resync complete"
        );
        self.resync_tx.send_replace(Some(ResyncSummary {
            run_id: pass.run_id,
            received: pass.received,
            removed,
        }));
    }

    /// Publish a state change unless this connection was superseded.
    fn set_state(&self, token: &CancellationToken, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if token.is_cancelled() || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}
