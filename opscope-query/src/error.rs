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

//! Error types for query execution

use thiserror::Error;

/// Result type for queries
pub type Result<T> = std::result::Result<T, QueryError>;

/// Query errors
#[derive(Debug, Error)]
pub enum QueryError {
    /// Pages are numbered from 1
    #[error("Invalid page: {0} (pages start at 1)")]
    InvalidPage(usize),

    #[error("Invalid page size: {0} (must be at least 1)")]
    InvalidPageSize(usize),

    /// Time preset text could not be parsed
    #[error("Invalid time preset: {0}")]
    InvalidPreset(String),
}
