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

//! Operation records and the raw wire shapes they are built from

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One name/value pair from the request query string, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParam {
    pub name: String,
    pub value: String,
}

/// A captured request/response exchange, flattened for indexing.
///
/// Records are replaced wholesale on re-ingestion of the same `id`; every
/// derived field (`tag_tokens`, `mcp_*`, `server`/`path` fallbacks) is
/// recomputed from the raw event rather than patched in place.
///
/// Fields introduced by later schema versions carry `#[serde(default)]` so
/// entries persisted by older versions still decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Primary key
    pub id: String,
    /// Request receipt time
    pub time: DateTime<Utc>,
    /// Server correlation id, drives the resume cursor
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub query_params: Vec<QueryParam>,
    /// Duration in milliseconds
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub status_code: Option<u16>,

    #[serde(default)]
    pub mcp_tool: Option<String>,
    #[serde(default)]
    pub mcp_resource: Option<String>,
    #[serde(default)]
    pub mcp_prompt: Option<String>,
    #[serde(default)]
    pub mcp_category: Option<String>,
    #[serde(default)]
    pub mcp_method: Option<String>,

    /// Lowercase tag tokens, index-aligned with `tags`
    #[serde(default)]
    pub tag_tokens: Vec<String>,
    /// Display tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Run id of the full resync pass that last delivered this record
    #[serde(default)]
    pub last_synced_at: Option<String>,
}

impl OperationRecord {
    /// Minimal record with only the primary key and time set.
    pub fn new(id: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            time,
            operation_id: None,
            method: String::new(),
            url: String::new(),
            server: String::new(),
            path: String::new(),
            client_ip: String::new(),
            query_params: Vec::new(),
            duration: 0.0,
            status_code: None,
            mcp_tool: None,
            mcp_resource: None,
            mcp_prompt: None,
            mcp_category: None,
            mcp_method: None,
            tag_tokens: Vec::new(),
            tags: Vec::new(),
            last_synced_at: None,
        }
    }

    /// Value of one MCP dimension.
    pub fn mcp(&self, dim: McpDimension) -> Option<&str> {
        match dim {
            McpDimension::Tool => self.mcp_tool.as_deref(),
            McpDimension::Resource => self.mcp_resource.as_deref(),
            McpDimension::Prompt => self.mcp_prompt.as_deref(),
            McpDimension::Category => self.mcp_category.as_deref(),
            McpDimension::Method => self.mcp_method.as_deref(),
        }
    }

    /// True if every token in `tokens` is present on this record.
    pub fn has_all_tags<S: AsRef<str>>(&self, tokens: &[S]) -> bool {
        tokens
            .iter()
            .all(|t| self.tag_tokens.iter().any(|own| own == t.as_ref()))
    }
}

/// The five MCP metadata dimensions carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpDimension {
    Tool,
    Resource,
    Prompt,
    Category,
    Method,
}

impl McpDimension {
    pub const ALL: [McpDimension; 5] = [
        McpDimension::Tool,
        McpDimension::Resource,
        McpDimension::Prompt,
        McpDimension::Category,
        McpDimension::Method,
    ];

    /// Tag keys (lowercase) that carry this dimension when `meta.mcp` is absent.
    pub fn tag_keys(&self) -> &'static [&'static str] {
        match self {
            McpDimension::Tool => &["mcp_tool", "mcp.tool"],
            McpDimension::Resource => &["mcp_resource", "mcp.resource"],
            McpDimension::Prompt => &["mcp_prompt", "mcp.prompt"],
            McpDimension::Category => &["mcp_category", "mcp.category"],
            McpDimension::Method => &["mcp_method", "mcp.method"],
        }
    }
}

// ============================================================================
// Wire format
// ============================================================================

/// One inbound stream event, as sent in an SSE `data:` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawOperationEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub data: RawOperationData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawOperationData {
    #[serde(default)]
    pub request: RawRequest,
    #[serde(default)]
    pub response: Option<RawResponse>,
    #[serde(default)]
    pub timing: Option<RawTiming>,
    #[serde(default)]
    pub meta: Option<RawMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRequest {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub query_params: Option<Vec<RawQueryParam>>,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub timestamp: Option<RawTimestamp>,
}

/// Query parameter as either `{name, value}` or `[name, value]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawQueryParam {
    Named {
        name: String,
        #[serde(default)]
        value: serde_json::Value,
    },
    Pair(String, serde_json::Value),
}

impl RawQueryParam {
    /// Flatten into a string pair. Non-string values keep their JSON text.
    pub fn to_param(&self) -> QueryParam {
        let (name, value) = match self {
            RawQueryParam::Named { name, value } => (name, value),
            RawQueryParam::Pair(name, value) => (name, value),
        };
        let value = match value {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        QueryParam {
            name: name.clone(),
            value,
        }
    }
}

/// Request timestamp as RFC 3339 text or epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Text(String),
    EpochMillis(f64),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResponse {
    #[serde(default)]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTiming {
    #[serde(default)]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMeta {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub mcp: Option<RawMcp>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMcp {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub resource_name: Option<String>,
    #[serde(default)]
    pub prompt_name: Option<String>,
}

impl RawMcp {
    pub fn get(&self, dim: McpDimension) -> Option<&str> {
        match dim {
            McpDimension::Tool => self.tool_name.as_deref(),
            McpDimension::Resource => self.resource_name.as_deref(),
            McpDimension::Prompt => self.prompt_name.as_deref(),
            McpDimension::Category => self.category.as_deref(),
            McpDimension::Method => self.method.as_deref(),
        }
    }
}
