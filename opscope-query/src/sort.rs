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

//! Sort specification

use opscope_core::OperationRecord;
use opscope_storage::{IndexField, ScanOrder};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn scan(&self) -> ScanOrder {
        match self {
            SortOrder::Asc => ScanOrder::Asc,
            SortOrder::Desc => ScanOrder::Desc,
        }
    }
}

/// Requested sort: a record field name and a direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self {
            field: "time".to_string(),
            order: SortOrder::Desc,
        }
    }
}

impl SortSpec {
    pub fn new(field: impl Into<String>, order: SortOrder) -> Self {
        Self {
            field: field.into(),
            order,
        }
    }
}

/// Sortable fields without a secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnindexedField {
    Url,
    ClientIp,
}

/// Resolved sort field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    /// Primary key order
    Id,
    Indexed(IndexField),
    /// Sorted in memory
    Unindexed(UnindexedField),
}

impl SortField {
    /// Resolve a field name. Unknown names sort by time.
    pub fn parse(name: &str) -> Self {
        let name = name.trim();
        if name == "id" {
            return SortField::Id;
        }
        if let Some(field) = IndexField::from_name(name) {
            return SortField::Indexed(field);
        }
        match name {
            "url" => SortField::Unindexed(UnindexedField::Url),
            "client_ip" => SortField::Unindexed(UnindexedField::ClientIp),
            other => {
                debug!(field = other, "Unknown sort field, sorting by time");
                SortField::Indexed(IndexField::Time)
            }
        }
    }

    /// Ascending comparison with `id` as tie-break.
    ///
    /// Indexed fields compare by index key, so in-memory sorting agrees
    /// with an index walk.
    pub fn compare(&self, a: &OperationRecord, b: &OperationRecord) -> Ordering {
        let primary = match self {
            SortField::Id => Ordering::Equal,
            SortField::Indexed(field) => field.extract(a).cmp(&field.extract(b)),
            SortField::Unindexed(UnindexedField::Url) => a.url.cmp(&b.url),
            SortField::Unindexed(UnindexedField::ClientIp) => a.client_ip.cmp(&b.client_ip),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }

    /// Sort `records` in place in the requested direction.
    pub fn sort(&self, records: &mut [&OperationRecord], order: SortOrder) {
        match order {
            SortOrder::Asc => records.sort_by(|a, b| self.compare(a, b)),
            SortOrder::Desc => records.sort_by(|a, b| self.compare(b, a)),
        }
    }
}
