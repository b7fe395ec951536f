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

//! Opscope CLI
//!
//! Command-line interface for capturing and inspecting API operations.

mod config;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::AppConfig;
use opscope_core::FileConfigStore;
use opscope_query::{
    LiveQuery, OperationFilters, QueryEngine, QueryRequest, SortOrder, SortSpec, TimeFilter,
    TimePreset, DEFAULT_PAGE_SIZE,
};
use opscope_storage::OperationStore;
use opscope_stream::{
    ConnectionState, EventTransport, HttpEventTransport, HttpOperationsApi, HttpRegistrar,
    IngestionBuffer, Registrar, StaticRegistrar, StreamClient, SyncedDeletes,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

#[derive(Parser)]
#[command(name = "opscope")]
#[command(about = "Opscope - live API operation inspector", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "OPSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides config and OPSCOPE_DATA_DIR)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Output as JSON (machine-readable)
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the event stream and ingest operations until Ctrl-C
    Watch {
        /// Start with a full resync instead of resuming
        #[arg(long)]
        resync: bool,

        /// Stream URL (overrides config)
        #[arg(long)]
        url: Option<String>,
    },

    /// Run one full resync pass and exit
    Resync {
        /// Stream URL (overrides config)
        #[arg(long)]
        url: Option<String>,
    },

    /// Query stored operations
    Query(QueryArgs),

    /// Delete one operation
    Delete {
        /// Operation ID
        id: String,

        /// Only delete the local copy
        #[arg(long)]
        local_only: bool,
    },

    /// Delete all operations
    Clear {
        /// Only clear the local store
        #[arg(long)]
        local_only: bool,

        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Rewrite the operation log with live records only
    Compact,

    /// Show store statistics
    Stats,
}

#[derive(Args)]
struct QueryArgs {
    /// Relative time window: 15m, 1h, 24h, 7d, week, month
    #[arg(long)]
    since: Option<String>,

    /// Status code (repeatable)
    #[arg(long = "status")]
    status_codes: Vec<u16>,

    /// HTTP method (repeatable)
    #[arg(long = "method")]
    methods: Vec<String>,

    /// Path substring
    #[arg(long)]
    path: Option<String>,

    /// Server substring
    #[arg(long)]
    host: Option<String>,

    /// Minimum duration (ms)
    #[arg(long)]
    min_duration: Option<f64>,

    /// Maximum duration (ms)
    #[arg(long)]
    max_duration: Option<f64>,

    /// Tag that must be present (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// MCP tool name (repeatable)
    #[arg(long = "mcp-tool")]
    mcp_tools: Vec<String>,

    /// MCP resource name (repeatable)
    #[arg(long = "mcp-resource")]
    mcp_resources: Vec<String>,

    /// MCP prompt name (repeatable)
    #[arg(long = "mcp-prompt")]
    mcp_prompts: Vec<String>,

    /// MCP category (repeatable)
    #[arg(long = "mcp-category")]
    mcp_categories: Vec<String>,

    /// MCP method (repeatable)
    #[arg(long = "mcp-method")]
    mcp_methods: Vec<String>,

    /// Sort field
    #[arg(long, default_value = "time")]
    sort: String,

    /// Sort ascending
    #[arg(long)]
    asc: bool,

    /// Page number (1-based)
    #[arg(long, default_value = "1")]
    page: usize,

    /// Page size
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Keep printing the page whenever the store changes
    #[arg(long)]
    follow: bool,
}

impl QueryArgs {
    fn to_request(&self) -> Result<QueryRequest> {
        let time = self
            .since
            .as_deref()
            .map(|s| s.parse::<TimePreset>())
            .transpose()?
            .map(|preset| TimeFilter::Preset { preset });

        let filters = OperationFilters {
            time,
            status_codes: self.status_codes.clone(),
            methods: self.methods.clone(),
            path: self.path.clone(),
            min_duration: self.min_duration,
            max_duration: self.max_duration,
            host: self.host.clone(),
            tags: self.tags.clone(),
            mcp_tools: self.mcp_tools.clone(),
            mcp_resources: self.mcp_resources.clone(),
            mcp_prompts: self.mcp_prompts.clone(),
            mcp_categories: self.mcp_categories.clone(),
            mcp_methods: self.mcp_methods.clone(),
        };
        let order = if self.asc {
            SortOrder::Asc
        } else {
            SortOrder::Desc
        };

        Ok(QueryRequest::default()
            .with_filters(filters)
            .with_sort(SortSpec::new(self.sort.clone(), order))
            .with_page(self.page, self.page_size))
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "opscope=info,opscope_stream=info,opscope_storage=info".into()
        }))
        .with(fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    match &cli.command {
        Commands::Watch { url: Some(url), .. } | Commands::Resync { url: Some(url) } => {
            config.stream.url = Some(url.clone());
        }
        _ => {}
    }
    config.validate()?;

    let store = Arc::new(
        OperationStore::open(&config.storage.data_dir, config.storage.store.clone())
            .context("Failed to open operation store")?,
    );

    match cli.command {
        Commands::Watch { resync, .. } => watch(&config, store, resync).await,
        Commands::Resync { .. } => resync_once(&config, store, cli.json).await,
        Commands::Query(args) => query(store, &args, cli.json).await,
        Commands::Delete { id, local_only } => {
            let removed = if local_only {
                store.delete(&id)?
            } else {
                synced_deletes(&config, store)?.delete(&id).await?
            };
            if removed {
                println!("✓ Deleted operation {}", id);
            } else {
                println!("✗ Operation {} not found locally", id);
            }
            Ok(())
        }
        Commands::Clear { local_only, yes } => {
            if !yes {
                bail!("Refusing to delete all operations without --yes");
            }
            let count = store.len();
            if local_only {
                store.clear()?;
            } else {
                synced_deletes(&config, store)?.delete_all().await?;
            }
            println!("✓ Deleted {} operations", count);
            Ok(())
        }
        Commands::Compact => {
            let before = store.stats().log_bytes;
            store.compact()?;
            let after = store.stats().log_bytes;
            println!("✓ Compacted log: {} -> {} bytes", before, after);
            Ok(())
        }
        Commands::Stats => {
            let stats = store.stats();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Opscope Statistics");
                println!("==================");
                println!("  Data dir:       {}", config.storage.data_dir.display());
                println!("  Operations:     {}", stats.record_count);
                println!("  Schema version: {}", stats.schema_version);
                println!("  Log size:       {} bytes", stats.log_bytes);
                println!("  Store version:  {}", stats.version);
            }
            Ok(())
        }
    }
}

fn build_client(config: &AppConfig, store: Arc<OperationStore>) -> Result<StreamClient> {
    let connection = &config.stream.connection;
    let registrar: Arc<dyn Registrar> = match (&config.stream.url, &config.stream.register_url) {
        (Some(url), _) => Arc::new(StaticRegistrar::new(url.clone(), config.stream.token.clone())),
        (None, Some(register_url)) => Arc::new(HttpRegistrar::new(
            Url::parse(register_url)?,
            config.stream.token.clone(),
            connection.connect_timeout(),
        )?),
        (None, None) => bail!("No stream configured: set stream.url or stream.register_url"),
    };
    let transport: Arc<dyn EventTransport> =
        Arc::new(HttpEventTransport::new(connection.connect_timeout())?);
    let settings = Arc::new(
        FileConfigStore::open(config.settings_path()).context("Failed to open settings")?,
    );
    let buffer = IngestionBuffer::new(store, config.buffer.clone());

    Ok(StreamClient::new(
        registrar,
        transport,
        settings,
        buffer,
        connection.clone(),
    ))
}

fn synced_deletes(config: &AppConfig, store: Arc<OperationStore>) -> Result<SyncedDeletes> {
    let Some(api_url) = config.api_url()? else {
        bail!("No api_url configured; use --local-only to delete locally");
    };
    let api = HttpOperationsApi::new(
        api_url,
        config.stream.token.clone(),
        config.stream.connection.connect_timeout(),
    )?;
    Ok(SyncedDeletes::new(Arc::new(api), store))
}

/// Drain pending writes after the client stopped.
async fn shutdown(client: &StreamClient) {
    client.close();
    client.buffer().wait_for_flush().await;
    client.buffer().flush_now();
}

async fn watch(config: &AppConfig, store: Arc<OperationStore>, resync: bool) -> Result<()> {
    let client = build_client(config, store.clone())?;
    let mut state = client.watch_state();
    let mut changes = store.subscribe();

    if resync {
        client.resync();
    } else {
        client.connect(None);
    }
    info!(data_dir = %config.storage.data_dir.display(), "Watching event stream");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                println!("● {}", current);
                if current == ConnectionState::Disconnected {
                    warn!("Stream disconnected; retries exhausted");
                    break;
                }
            }
            change = changes.recv() => {
                if let Ok(change) = change {
                    tracing::debug!(version = change.version, kind = ?change.kind, "Store changed");
                }
            }
        }
    }

    shutdown(&client).await;
    let stats = client.stats();
    println!(
        "✓ Received {} operations ({} malformed frames), {} stored",
        stats.operations_received,
        stats.malformed_frames,
        store.len()
    );
    Ok(())
}

async fn resync_once(config: &AppConfig, store: Arc<OperationStore>, json: bool) -> Result<()> {
    let client = build_client(config, store)?;
    let mut summary = client.watch_resync();
    let mut state = client.watch_state();
    client.resync();

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break None,
            changed = summary.changed() => {
                if changed.is_err() {
                    break None;
                }
                break summary.borrow_and_update().clone();
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow_and_update() == ConnectionState::Disconnected {
                    break None;
                }
            }
        }
    };
    shutdown(&client).await;

    let Some(summary) = result else {
        bail!("Resync did not complete");
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "✓ Resync {} complete: {} received, {} pruned",
            summary.run_id, summary.received, summary.removed
        );
    }
    Ok(())
}

async fn query(store: Arc<OperationStore>, args: &QueryArgs, json: bool) -> Result<()> {
    let request = args.to_request()?;
    let engine = QueryEngine::new(store);

    if !args.follow {
        let response = engine.execute(&request)?;
        print_page(&response, &request, json)?;
        return Ok(());
    }

    let mut live = LiveQuery::new(engine, request);
    print_page(&live.current()?, live.request(), json)?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = live.next() => match next {
                Some(response) => print_page(&response?, live.request(), json)?,
                None => break,
            },
        }
    }
    Ok(())
}

fn print_page(
    response: &opscope_query::QueryResponse,
    request: &QueryRequest,
    json: bool,
) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    let pages = response.total_count.div_ceil(request.page_size).max(1);
    println!(
        "Found {} operations (page {}/{}):",
        response.total_count, request.page, pages
    );
    println!("{:-<100}", "");
    for r in &response.results {
        println!(
            "{}  {:<7} {:>3}  {:>8.1}ms  {}{}",
            r.time.format("%Y-%m-%d %H:%M:%S"),
            r.method,
            r.status_code
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into()),
            r.duration,
            r.server,
            r.path
        );
        if !r.tags.is_empty() {
            println!("    tags: {}", r.tags.join(", "));
        }
    }
    Ok(())
}
