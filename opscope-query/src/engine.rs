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

//! Query execution

use crate::error::{QueryError, Result};
use crate::filter::{CompiledFilter, OperationFilters};
use crate::sort::{SortField, SortSpec};
use chrono::{DateTime, Utc};
use opscope_core::OperationRecord;
use opscope_storage::{OperationStore, ScanOrder, TableView};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Page size used when a request does not specify one.
pub const DEFAULT_PAGE_SIZE: usize = 50;

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// Filter, sort and page selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub filters: OperationFilters,
    #[serde(default)]
    pub sort: SortSpec,
    /// 1-based page number
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            filters: OperationFilters::default(),
            sort: SortSpec::default(),
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

impl QueryRequest {
    pub fn with_filters(mut self, filters: OperationFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.page == 0 {
            return Err(QueryError::InvalidPage(self.page));
        }
        if self.page_size == 0 {
            return Err(QueryError::InvalidPageSize(self.page_size));
        }
        Ok(())
    }

    fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

/// One page of results plus the total number of matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<OperationRecord>,
    pub total_count: usize,
}

/// Query engine over a shared store.
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<OperationStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<OperationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<OperationStore> {
        &self.store
    }

    /// Execute against the current time.
    pub fn execute(&self, request: &QueryRequest) -> Result<QueryResponse> {
        self.execute_at(request, Utc::now())
    }

    /// Execute with relative time presets evaluated against `now`.
    pub fn execute_at(&self, request: &QueryRequest, now: DateTime<Utc>) -> Result<QueryResponse> {
        request.validate()?;
        let view = self.store.read();
        let sort = SortField::parse(&request.sort.field);

        let response = if request.filters.is_active() {
            let filter = CompiledFilter::compile(&request.filters, now);
            filtered_page(&view, &filter, sort, request)
        } else {
            fast_page(&view, sort, request)
        };

        debug!(
            filtered = request.filters.is_active(),
            sort = ?sort,
            page = request.page,
            total = response.total_count,
            returned = response.results.len(),
            version = view.version(),
            "Executed operations query"
        );
        Ok(response)
    }
}

/// Unfiltered: walk the sort order directly and count from the same view.
fn fast_page(view: &TableView<'_>, sort: SortField, request: &QueryRequest) -> QueryResponse {
    let order = request.sort.order;
    let offset = request.offset();

    let (results, total_count) = match sort {
        SortField::Id => (
            page_of(view.scan_by_id(order.scan()), offset, request.page_size),
            view.len(),
        ),
        SortField::Indexed(field) => match (
            view.index_scan(field, order.scan()),
            view.index_count(field),
        ) {
            (Some(scan), Some(count)) => (page_of(scan, offset, request.page_size), count),
            _ => in_memory_page(view.records().collect(), sort, request),
        },
        SortField::Unindexed(_) => in_memory_page(view.records().collect(), sort, request),
    };

    QueryResponse {
        results,
        total_count,
    }
}

/// Filtered: evaluate predicates, then order the matches.
fn filtered_page(
    view: &TableView<'_>,
    filter: &CompiledFilter,
    sort: SortField,
    request: &QueryRequest,
) -> QueryResponse {
    let matched: Vec<&OperationRecord> = view.records().filter(|r| filter.matches(r)).collect();
    let total_count = matched.len();
    let offset = request.offset();
    let order = request.sort.order;

    let results = match sort {
        SortField::Id => {
            // Table scan already yields primary key order
            match order.scan() {
                ScanOrder::Asc => page_of(matched.into_iter(), offset, request.page_size),
                ScanOrder::Desc => page_of(matched.into_iter().rev(), offset, request.page_size),
            }
        }
        SortField::Indexed(field) => match view.index_scan(field, order.scan()) {
            Some(scan) => {
                let ids: HashSet<&str> = matched.iter().map(|r| r.id.as_str()).collect();
                page_of(
                    scan.filter(|r| ids.contains(r.id.as_str())),
                    offset,
                    request.page_size,
                )
            }
            None => in_memory_page(matched, sort, request).0,
        },
        SortField::Unindexed(_) => in_memory_page(matched, sort, request).0,
    };

    QueryResponse {
        results,
        total_count,
    }
}

fn in_memory_page(
    mut records: Vec<&OperationRecord>,
    sort: SortField,
    request: &QueryRequest,
) -> (Vec<OperationRecord>, usize) {
    let total = records.len();
    sort.sort(&mut records, request.sort.order);
    (
        page_of(records.into_iter(), request.offset(), request.page_size),
        total,
    )
}

fn page_of<'a, I>(records: I, offset: usize, limit: usize) -> Vec<OperationRecord>
where
    I: Iterator<Item = &'a OperationRecord>,
{
    records.skip(offset).take(limit).cloned().collect()
}
