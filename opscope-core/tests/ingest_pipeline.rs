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

//! Integration tests for frame parsing and record transformation

use chrono::{TimeZone, Utc};
use opscope_core::{normalize_tag, parse_event, to_record, FrameParser, TagKind};

const STREAM: &str = "\
: connected\n\
id: 1\n\
data: {\"operation_id\":\"op-1\",\"data\":{\"request\":{\"method\":\"GET\",\"url\":\"https://a.example/x\"},\"response\":{\"status\":200},\"timing\":{\"duration\":3}}}\n\
\n\
event: heartbeat\n\
data: {}\n\
\n\
id: 2\n\
data: {broken\n\
\n\
id: 3\n\
data: {\"operation_id\":\"op-3\",\n\
data:  \"data\":{\"request\":{\"method\":\"DELETE\"},\"meta\":{\"tags\":[\"env=prod\"]}}}\n\
\n";

/// Test that a chunked stream yields the same records as a single payload
#[test]
fn test_chunked_stream_to_records() {
    let received = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    for chunk_size in [1, 3, 7, 64, STREAM.len()] {
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for chunk in STREAM.as_bytes().chunks(chunk_size) {
            frames.extend(parser.push(chunk));
        }
        frames.extend(parser.finish());
        assert_eq!(frames.len(), 4, "chunk size {}", chunk_size);

        let records: Vec<_> = frames
            .iter()
            .filter(|f| f.event_name() == "message")
            .filter_map(|f| parse_event(&f.data).ok())
            .map(|e| to_record(&e, received))
            .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "op-1");
        assert_eq!(records[0].server, "a.example");
        assert_eq!(records[0].status_code, Some(200));
        assert_eq!(records[1].id, "op-3");
        assert_eq!(records[1].method, "DELETE");
        assert_eq!(records[1].tags, vec!["env:prod"]);
    }
}

/// Test the documented normalization examples
#[test]
fn test_tag_normalization_examples() {
    let kv = normalize_tag("priority:high").unwrap();
    assert_eq!(kv.kind, TagKind::Kv);
    assert_eq!(kv.key.as_deref(), Some("priority"));
    assert_eq!(kv.value.as_deref(), Some("high"));
    assert_eq!(kv.display, "priority:high");
    assert_eq!(kv.token, "priority:high");

    let simple = normalize_tag("fraud-review").unwrap();
    assert_eq!(simple.kind, TagKind::Simple);
    assert_eq!(simple.display, "fraud-review");
    assert_eq!(simple.token, "fraud-review");

    assert_eq!(normalize_tag(":broken").unwrap().kind, TagKind::Simple);
}

/// Test that re-transforming an event yields an identical record
#[test]
fn test_transform_is_pure() {
    let received = Utc::now();
    let event = parse_event(
        r#"{"operation_id":"op-7","data":{"request":{"timestamp":"2024-02-02T02:02:02Z"},"meta":{"tags":["B","a","b"],"mcp":{"method":"tools/call"}}}}"#,
    )
    .unwrap();
    let first = to_record(&event, received);
    let second = to_record(&event, received);
    assert_eq!(first, second);
    assert_eq!(first.tag_tokens, vec!["b", "a"]);
    assert_eq!(first.mcp_method.as_deref(), Some("tools/call"));
}
