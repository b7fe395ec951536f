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

//! Opscope Core
//!
//! Data model and pure building blocks for captured HTTP/MCP operations:
//! tag normalization, event-stream frame parsing, raw event to record
//! transformation and the key-value `ConfigStore` capability.

pub mod config_store;
pub mod error;
pub mod frame;
pub mod operation;
pub mod tag;
pub mod transform;

pub use config_store::{ConfigStore, FileConfigStore, MemoryConfigStore};
pub use error::{CoreError, Result};
pub use frame::{parse_payload, FrameParser, StreamFrame};
pub use operation::{
    McpDimension, OperationRecord, QueryParam, RawMcp, RawMeta, RawOperationData,
    RawOperationEvent, RawQueryParam, RawRequest, RawResponse, RawTimestamp, RawTiming,
};
pub use tag::{normalize_tag, normalize_tags, NormalizedTags, Tag, TagKind};
pub use transform::{parse_event, to_record};
