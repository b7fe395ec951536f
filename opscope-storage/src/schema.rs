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

//! Schema versions
//!
//! Schema growth is additive only. Each migration names the indexes it
//! introduces; opening a database written at an older version replays its
//! log, builds the indexes of every pending step in order and rewrites the
//! log under the current header. Fields added by a step decode as absent on
//! older entries.

use crate::index::IndexField;

/// One additive schema step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub adds_indexes: &'static [IndexField],
}

/// All schema steps, oldest first.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "base request indexes",
        adds_indexes: &[
            IndexField::Time,
            IndexField::Method,
            IndexField::StatusCode,
            IndexField::Path,
            IndexField::Duration,
            IndexField::Server,
        ],
    },
    Migration {
        version: 2,
        description: "server correlation id",
        adds_indexes: &[IndexField::OperationId],
    },
    Migration {
        version: 3,
        description: "MCP dimensions",
        adds_indexes: &[
            IndexField::McpTool,
            IndexField::McpResource,
            IndexField::McpPrompt,
            IndexField::McpCategory,
            IndexField::McpMethod,
        ],
    },
    Migration {
        version: 4,
        description: "full resync stamping (last_synced_at)",
        adds_indexes: &[],
    },
];

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 4;

/// Indexes present in a database at `version`.
pub fn indexes_for(version: u32) -> Vec<IndexField> {
    MIGRATIONS
        .iter()
        .filter(|m| m.version <= version)
        .flat_map(|m| m.adds_indexes.iter().copied())
        .collect()
}

/// Steps to apply to a database at `from`, in order.
pub fn pending(from: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.version > from)
}
