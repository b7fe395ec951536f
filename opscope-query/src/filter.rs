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

//! Operation filters
//!
//! Filters are compiled once per request into a chain of independent
//! predicates; a record matches when every active predicate accepts it.

use crate::error::QueryError;
use chrono::{DateTime, Duration, Months, Utc};
use opscope_core::{normalize_tags, McpDimension, OperationRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Relative time window ending now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimePreset {
    LastMinutes(u32),
    LastHours(u32),
    LastDays(u32),
    Week,
    Month,
}

impl TimePreset {
    /// Earliest included time for this preset.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimePreset::LastMinutes(n) => now - Duration::minutes(i64::from(*n)),
            TimePreset::LastHours(n) => now - Duration::hours(i64::from(*n)),
            TimePreset::LastDays(n) => now - Duration::days(i64::from(*n)),
            TimePreset::Week => now - Duration::weeks(1),
            TimePreset::Month => now
                .checked_sub_months(Months::new(1))
                .unwrap_or(now - Duration::days(30)),
        }
    }
}

impl FromStr for TimePreset {
    type Err = QueryError;

    /// Accepts `week`, `month` or a count with a unit suffix: `15m`, `1h`, `7d`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        match s.as_str() {
            "week" => return Ok(TimePreset::Week),
            "month" => return Ok(TimePreset::Month),
            _ => {}
        }

        let invalid = || QueryError::InvalidPreset(s.clone());
        let unit = s.chars().last().ok_or_else(invalid)?;
        let count: u32 = s[..s.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| invalid())?;
        if count == 0 {
            return Err(invalid());
        }
        match unit {
            'm' => Ok(TimePreset::LastMinutes(count)),
            'h' => Ok(TimePreset::LastHours(count)),
            'd' => Ok(TimePreset::LastDays(count)),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for TimePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimePreset::LastMinutes(n) => write!(f, "{}m", n),
            TimePreset::LastHours(n) => write!(f, "{}h", n),
            TimePreset::LastDays(n) => write!(f, "{}d", n),
            TimePreset::Week => write!(f, "week"),
            TimePreset::Month => write!(f, "month"),
        }
    }
}

/// Time restriction: a relative preset or an explicit inclusive range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimeFilter {
    Preset { preset: TimePreset },
    Range {
        #[serde(default)]
        start: Option<DateTime<Utc>>,
        #[serde(default)]
        end: Option<DateTime<Utc>>,
    },
}

impl TimeFilter {
    fn is_active(&self) -> bool {
        match self {
            TimeFilter::Preset { .. } => true,
            TimeFilter::Range { start, end } => start.is_some() || end.is_some(),
        }
    }
}

/// Filter set for an operations query. Empty fields are inactive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationFilters {
    pub time: Option<TimeFilter>,
    /// Status code set; records without a status never match
    pub status_codes: Vec<u16>,
    /// Method set, case-insensitive
    pub methods: Vec<String>,
    /// Path substring, case-sensitive
    pub path: Option<String>,
    pub min_duration: Option<f64>,
    pub max_duration: Option<f64>,
    /// Server substring, case-insensitive
    pub host: Option<String>,
    /// Every tag must be present (raw tags, normalized before matching)
    pub tags: Vec<String>,
    pub mcp_tools: Vec<String>,
    pub mcp_resources: Vec<String>,
    pub mcp_prompts: Vec<String>,
    pub mcp_categories: Vec<String>,
    pub mcp_methods: Vec<String>,
}

impl OperationFilters {
    /// Selected values for one MCP dimension.
    pub fn mcp_values(&self, dim: McpDimension) -> &[String] {
        match dim {
            McpDimension::Tool => &self.mcp_tools,
            McpDimension::Resource => &self.mcp_resources,
            McpDimension::Prompt => &self.mcp_prompts,
            McpDimension::Category => &self.mcp_categories,
            McpDimension::Method => &self.mcp_methods,
        }
    }

    /// True if any filter narrows the result set.
    pub fn is_active(&self) -> bool {
        self.time.as_ref().map(TimeFilter::is_active).unwrap_or(false)
            || !self.status_codes.is_empty()
            || !self.methods.is_empty()
            || self.path.as_deref().map(|p| !p.is_empty()).unwrap_or(false)
            || self.min_duration.is_some()
            || self.max_duration.is_some()
            || self.host.as_deref().map(|h| !h.trim().is_empty()).unwrap_or(false)
            || !normalize_tags(&self.tags).parsed.is_empty()
            || McpDimension::ALL
                .iter()
                .any(|dim| !self.mcp_values(*dim).is_empty())
    }
}

type Predicate = Box<dyn Fn(&OperationRecord) -> bool + Send + Sync>;

/// Predicate chain built from [`OperationFilters`] for one evaluation time.
pub(crate) struct CompiledFilter {
    predicates: Vec<Predicate>,
}

impl CompiledFilter {
    pub(crate) fn compile(filters: &OperationFilters, now: DateTime<Utc>) -> Self {
        let mut predicates: Vec<Predicate> = Vec::new();

        match &filters.time {
            Some(TimeFilter::Preset { preset }) => {
                let cutoff = preset.cutoff(now);
                predicates.push(Box::new(move |r: &OperationRecord| r.time >= cutoff));
            }
            Some(TimeFilter::Range { start, end }) => {
                if let Some(start) = *start {
                    predicates.push(Box::new(move |r: &OperationRecord| r.time >= start));
                }
                if let Some(end) = *end {
                    predicates.push(Box::new(move |r: &OperationRecord| r.time <= end));
                }
            }
            None => {}
        }

        if !filters.status_codes.is_empty() {
            let codes: HashSet<u16> = filters.status_codes.iter().copied().collect();
            predicates.push(Box::new(move |r: &OperationRecord| {
                r.status_code.map(|s| codes.contains(&s)).unwrap_or(false)
            }));
        }

        if !filters.methods.is_empty() {
            let methods: HashSet<String> =
                filters.methods.iter().map(|m| m.to_lowercase()).collect();
            predicates.push(Box::new(move |r: &OperationRecord| {
                methods.contains(&r.method.to_lowercase())
            }));
        }

        if let Some(path) = filters.path.clone().filter(|p| !p.is_empty()) {
            predicates.push(Box::new(move |r: &OperationRecord| {
                r.path.contains(path.as_str())
            }));
        }

        if let Some(min) = filters.min_duration {
            predicates.push(Box::new(move |r: &OperationRecord| r.duration >= min));
        }
        if let Some(max) = filters.max_duration {
            predicates.push(Box::new(move |r: &OperationRecord| r.duration <= max));
        }

        if let Some(host) = filters.host.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
            let host = host.to_lowercase();
            predicates.push(Box::new(move |r: &OperationRecord| {
                r.server.to_lowercase().contains(&host)
            }));
        }

        let tags = normalize_tags(&filters.tags).tokens();
        if !tags.is_empty() {
            predicates.push(Box::new(move |r: &OperationRecord| r.has_all_tags(&tags)));
        }

        for dim in McpDimension::ALL {
            let selected = filters.mcp_values(dim);
            if selected.is_empty() {
                continue;
            }
            let selected: HashSet<String> = selected.iter().map(|v| v.to_lowercase()).collect();
            predicates.push(Box::new(move |r: &OperationRecord| {
                r.mcp(dim)
                    .map(|v| selected.contains(&v.to_lowercase()))
                    .unwrap_or(false)
            }));
        }

        Self { predicates }
    }

    pub(crate) fn matches(&self, record: &OperationRecord) -> bool {
        self.predicates.iter().all(|p| p(record))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.predicates.len()
    }
}
