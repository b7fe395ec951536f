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

//! Secondary indexes
//!
//! Each index is an ordered set of `(value, id)` pairs. Including the id in
//! the key makes entries unique and gives every index a deterministic
//! tie-break: equal values are ordered by id.

use opscope_core::OperationRecord;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Indexed record fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexField {
    Time,
    OperationId,
    Method,
    StatusCode,
    Path,
    Duration,
    Server,
    McpTool,
    McpResource,
    McpPrompt,
    McpCategory,
    McpMethod,
}

impl IndexField {
    pub const ALL: [IndexField; 12] = [
        IndexField::Time,
        IndexField::OperationId,
        IndexField::Method,
        IndexField::StatusCode,
        IndexField::Path,
        IndexField::Duration,
        IndexField::Server,
        IndexField::McpTool,
        IndexField::McpResource,
        IndexField::McpPrompt,
        IndexField::McpCategory,
        IndexField::McpMethod,
    ];

    /// Record field name this index covers.
    pub fn name(&self) -> &'static str {
        match self {
            IndexField::Time => "time",
            IndexField::OperationId => "operation_id",
            IndexField::Method => "method",
            IndexField::StatusCode => "status_code",
            IndexField::Path => "path",
            IndexField::Duration => "duration",
            IndexField::Server => "server",
            IndexField::McpTool => "mcp_tool",
            IndexField::McpResource => "mcp_resource",
            IndexField::McpPrompt => "mcp_prompt",
            IndexField::McpCategory => "mcp_category",
            IndexField::McpMethod => "mcp_method",
        }
    }

    /// Look up an index by record field name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }

    /// Index key for `record`.
    pub fn extract(&self, record: &OperationRecord) -> IndexValue {
        match self {
            IndexField::Time => IndexValue::Int(record.time.timestamp_micros()),
            IndexField::OperationId => IndexValue::text(record.operation_id.as_deref()),
            IndexField::Method => IndexValue::text(Some(&record.method)),
            IndexField::StatusCode => record
                .status_code
                .map(|s| IndexValue::Int(i64::from(s)))
                .unwrap_or(IndexValue::Null),
            IndexField::Path => IndexValue::text(Some(&record.path)),
            IndexField::Duration => IndexValue::Float(record.duration),
            IndexField::Server => IndexValue::text(Some(&record.server)),
            IndexField::McpTool => IndexValue::text(record.mcp_tool.as_deref()),
            IndexField::McpResource => IndexValue::text(record.mcp_resource.as_deref()),
            IndexField::McpPrompt => IndexValue::text(record.mcp_prompt.as_deref()),
            IndexField::McpCategory => IndexValue::text(record.mcp_category.as_deref()),
            IndexField::McpMethod => IndexValue::text(record.mcp_method.as_deref()),
        }
    }
}

/// Ordered index key.
///
/// `Null` sorts before every other value so that records lacking a field
/// still appear in that field's index.
#[derive(Debug, Clone)]
pub enum IndexValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl IndexValue {
    /// Text key; absent or empty strings index as null.
    fn text(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() => IndexValue::Text(v.to_string()),
            _ => IndexValue::Null,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            IndexValue::Null => 0,
            IndexValue::Int(_) | IndexValue::Float(_) => 1,
            IndexValue::Text(_) => 2,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, IndexValue::Null)
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexValue::Int(a), IndexValue::Int(b)) => a.cmp(b),
            (IndexValue::Float(a), IndexValue::Float(b)) => a.total_cmp(b),
            (IndexValue::Int(a), IndexValue::Float(b)) => (*a as f64).total_cmp(b),
            (IndexValue::Float(a), IndexValue::Int(b)) => a.total_cmp(&(*b as f64)),
            (IndexValue::Text(a), IndexValue::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexValue {}

/// Index walk direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanOrder {
    Asc,
    #[default]
    Desc,
}

/// One secondary index.
#[derive(Debug, Default)]
pub(crate) struct SecondaryIndex {
    entries: BTreeSet<(IndexValue, String)>,
}

impl SecondaryIndex {
    pub(crate) fn insert(&mut self, value: IndexValue, id: &str) {
        self.entries.insert((value, id.to_string()));
    }

    pub(crate) fn remove(&mut self, value: IndexValue, id: &str) {
        self.entries.remove(&(value, id.to_string()));
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Record ids in index order.
    pub(crate) fn ids(&self, order: ScanOrder) -> Box<dyn Iterator<Item = &str> + '_> {
        let ids = self.entries.iter().map(|(_, id)| id.as_str());
        match order {
            ScanOrder::Asc => Box::new(ids),
            ScanOrder::Desc => Box::new(ids.rev()),
        }
    }
}
