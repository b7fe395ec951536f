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

//! Opscope Query Engine
//!
//! Paginated, filtered and sorted reads over an [`OperationStore`] snapshot.
//!
//! Unfiltered requests take the fast path: the sort field's index is walked
//! directly and the total comes from the index count in the same read view.
//! Filtered requests evaluate a compiled predicate chain over the table and
//! sort the matches, using the index order where one exists.
//!
//! [`OperationStore`]: opscope_storage::OperationStore

pub mod engine;
pub mod error;
pub mod filter;
pub mod live;
pub mod sort;

pub use engine::{QueryEngine, QueryRequest, QueryResponse, DEFAULT_PAGE_SIZE};
pub use error::{QueryError, Result};
pub use filter::{OperationFilters, TimeFilter, TimePreset};
pub use live::LiveQuery;
pub use sort::{SortField, SortOrder, SortSpec, UnindexedField};
