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

//! Opscope Stream
//!
//! Live ingestion of captured operations from a backend event stream.
//!
//! - [`StreamClient`] owns the connection lifecycle: registration, resume by
//!   last seen id, fixed-delay reconnects and forced full resyncs.
//! - [`IngestionBuffer`] shields the store from write storms by switching
//!   from individual upserts to one deferred bulk upsert per burst window.
//! - [`SyncedDeletes`] keeps server-side and local deletes in step.

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod remote;
pub mod state;
pub mod transport;

pub use buffer::{BufferStats, IngestionBuffer};
pub use client::{
    ClientStats, ResyncSummary, StreamClient, FULL_RESYNC_CURSOR, LAST_OPERATION_ID_KEY,
    RESUME_PARAM, RESYNC_COMPLETE_EVENT,
};
pub use config::{BufferConfig, StreamConfig};
pub use error::{Result, StreamError};
pub use remote::{HttpOperationsApi, OperationsApi, SyncedDeletes};
pub use state::{ConnectionState, RetryPolicy};
pub use transport::{
    ByteStream, EventTransport, HttpEventTransport, HttpRegistrar, Registrar, Registration,
    StaticRegistrar,
};
