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

//! Raw event to record transformation
//!
//! Every derived field is computed here from the raw event alone, so repeat
//! ingestion of the same event always yields an identical record (apart from
//! a synthesized id when the event carries none).

use crate::error::{CoreError, Result};
use crate::operation::{
    McpDimension, OperationRecord, QueryParam, RawOperationEvent, RawQueryParam, RawTimestamp,
};
use crate::tag::normalize_tags;
use chrono::{DateTime, TimeZone, Utc};
use url::Url;
use uuid::Uuid;

/// Decode one frame payload into a raw event.
pub fn parse_event(data: &str) -> Result<RawOperationEvent> {
    serde_json::from_str(data).map_err(|e| CoreError::MalformedEvent(e.to_string()))
}

/// Build an indexable record from a raw event.
///
/// `received_at` stands in for the request time when the event carries no
/// usable timestamp.
pub fn to_record(event: &RawOperationEvent, received_at: DateTime<Utc>) -> OperationRecord {
    let request = &event.data.request;
    let id = non_empty(event.operation_id.as_deref())
        .or_else(|| non_empty(event.id.as_deref()))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let time = request
        .timestamp
        .as_ref()
        .and_then(parse_timestamp)
        .unwrap_or(received_at);

    let mut record = OperationRecord::new(id, time);
    record.operation_id = non_empty(event.operation_id.as_deref()).map(str::to_string);
    record.method = request.method.clone().unwrap_or_default();
    record.url = request.url.clone().unwrap_or_default();
    record.server = request.server.clone().unwrap_or_default();
    record.path = request.path.clone().unwrap_or_default();
    record.client_ip = request.client_ip.clone().unwrap_or_default();
    record.query_params = request
        .query_params
        .as_ref()
        .map(|params| params.iter().map(RawQueryParam::to_param).collect())
        .unwrap_or_default();

    fill_from_url(&mut record, request.query_params.is_none());

    record.duration = event
        .data
        .timing
        .as_ref()
        .and_then(|t| t.duration)
        .filter(|d| d.is_finite())
        .unwrap_or(0.0);
    record.status_code = event.data.response.as_ref().and_then(|r| r.status);

    let meta = event.data.meta.as_ref();
    let tags = normalize_tags(meta.map(|m| m.tags.as_slice()).unwrap_or_default());
    let mcp = meta.and_then(|m| m.mcp.as_ref());

    let resolve = |dim: McpDimension| -> Option<String> {
        mcp.and_then(|m| non_empty(m.get(dim)))
            .or_else(|| tags.value_for_keys(dim.tag_keys()))
            .map(str::to_string)
    };
    record.mcp_tool = resolve(McpDimension::Tool);
    record.mcp_resource = resolve(McpDimension::Resource);
    record.mcp_prompt = resolve(McpDimension::Prompt);
    record.mcp_category = resolve(McpDimension::Category);
    record.mcp_method = resolve(McpDimension::Method);

    record.tags = tags.displays();
    record.tag_tokens = tags.tokens();
    record
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_timestamp(ts: &RawTimestamp) -> Option<DateTime<Utc>> {
    match ts {
        RawTimestamp::Text(text) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text.trim()) {
                return Some(parsed.with_timezone(&Utc));
            }
            // Some agents send epoch millis as a string
            text.trim().parse::<f64>().ok().and_then(from_millis)
        }
        RawTimestamp::EpochMillis(ms) => from_millis(*ms),
    }
}

fn from_millis(ms: f64) -> Option<DateTime<Utc>> {
    if !ms.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt(ms as i64).single()
}

/// Fill `server`, `path` and (when the event sent none) `query_params` from
/// the absolute request URL.
fn fill_from_url(record: &mut OperationRecord, params_missing: bool) {
    if !record.server.is_empty() && !record.path.is_empty() && !params_missing {
        return;
    }
    let Ok(url) = Url::parse(&record.url) else {
        return;
    };

    if record.server.is_empty() {
        if let Some(host) = url.host_str() {
            record.server = match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
        }
    }
    if record.path.is_empty() {
        record.path = url.path().to_string();
    }
    if params_missing {
        record.query_params = url
            .query_pairs()
            .map(|(name, value)| QueryParam {
                name: name.into_owned(),
                value: value.into_owned(),
            })
            .collect();
    }
}
