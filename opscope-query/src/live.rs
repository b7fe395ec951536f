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

//! Live queries
//!
//! A [`LiveQuery`] keeps the last request and re-runs it every time the
//! store reports a change. Notifications that pile up while a consumer is
//! busy are coalesced into a single re-run.

use crate::engine::{QueryEngine, QueryRequest, QueryResponse};
use crate::error::Result;
use opscope_storage::StoreChange;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::debug;

pub struct LiveQuery {
    engine: QueryEngine,
    request: QueryRequest,
    changes: broadcast::Receiver<StoreChange>,
}

impl LiveQuery {
    /// Subscribe to the engine's store and hold `request`.
    pub fn new(engine: QueryEngine, request: QueryRequest) -> Self {
        let changes = engine.store().subscribe();
        Self {
            engine,
            request,
            changes,
        }
    }

    pub fn request(&self) -> &QueryRequest {
        &self.request
    }

    /// Replace the held request; the next result uses it.
    pub fn set_request(&mut self, request: QueryRequest) {
        self.request = request;
    }

    /// Run the held request now.
    pub fn current(&self) -> Result<QueryResponse> {
        self.engine.execute(&self.request)
    }

    /// Wait for the next store change and re-run the request.
    ///
    /// The live query holds its store, so the change feed stays open for as
    /// long as `self` exists; `None` is only returned if the feed closes.
    pub async fn next(&mut self) -> Option<Result<QueryResponse>> {
        match self.changes.recv().await {
            Ok(change) => debug!(version = change.version, "Store changed, re-running query"),
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Live query lagged behind store changes")
            }
            Err(RecvError::Closed) => return None,
        }

        // Coalesce anything else already queued
        loop {
            match self.changes.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => break,
            }
        }

        Some(self.current())
    }
}
