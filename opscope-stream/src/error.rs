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

//! Error types for streaming and remote calls

use thiserror::Error;

/// Result type for stream operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Stream client errors
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status from the backend
    #[error("API error ({status}): {message}")]
    Status { status: u16, message: String },

    /// Connection dropped or the stream ended
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Storage error: {0}")]
    Store(#[from] opscope_storage::StoreError),

    #[error("Config store error: {0}")]
    Config(#[from] opscope_core::CoreError),
}
