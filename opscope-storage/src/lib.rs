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

//! Opscope Storage Layer
//!
//! Embedded, indexed table of operation records.
//!
//! ## Architecture
//!
//! - **Primary table**: records keyed by `id` in a `BTreeMap`
//! - **Secondary indexes**: ordered `(value, id)` sets, one per indexed field,
//!   covering every record (missing values sort first as null)
//! - **Operation log**: append-only, CRC-framed JSON entries replayed on open
//! - **Schema migrations**: additive steps applied in order when an older
//!   database is opened
//! - **Change notification**: store-wide broadcast after every mutation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use opscope_storage::{OperationStore, StoreConfig};
//!
//! let store = OperationStore::open("./data", StoreConfig::default())?;
//! store.upsert(record)?;
//! let mut changes = store.subscribe();
//! ```

pub mod error;
pub mod index;
mod log;
pub mod schema;
pub mod store;

pub use error::{Result, StoreError};
pub use index::{IndexField, IndexValue, ScanOrder};
pub use schema::{Migration, CURRENT_SCHEMA_VERSION, MIGRATIONS};
pub use store::{
    ChangeKind, OperationSink, OperationStore, StoreChange, StoreConfig, StoreStats, TableView,
    LOG_FILE_NAME,
};
