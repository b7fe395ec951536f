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

//! Opscope configuration
//!
//! Loaded from a TOML file, then overridden by `OPSCOPE_*` environment
//! variables, then by command-line flags.
//!
//! ```toml
//! [stream]
//! url = "http://localhost:7777/operations/stream"
//! retry_delay_ms = 5000
//! max_retries = 6
//!
//! [buffer]
//! window_ms = 50
//! threshold = 50
//!
//! [storage]
//! data_dir = "/var/lib/opscope"
//! sync_writes = false
//! ```

use anyhow::{bail, Context, Result};
use opscope_storage::StoreConfig;
use opscope_stream::{BufferConfig, StreamConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StreamSection {
    /// Fixed event stream URL (skips the registration handshake)
    #[serde(default)]
    pub url: Option<String>,

    /// Registration endpoint handing out `{url, token}`
    #[serde(default)]
    pub register_url: Option<String>,

    /// Base URL of the operations REST API, used for server-side deletes
    #[serde(default)]
    pub api_url: Option<String>,

    /// Bearer token / API key
    #[serde(default)]
    pub token: Option<String>,

    #[serde(flatten)]
    pub connection: StreamConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(flatten)]
    pub store: StoreConfig,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            store: StoreConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("opscope"))
        .unwrap_or_else(|| PathBuf::from("./opscope-data"))
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Supported environment variables:
    /// - OPSCOPE_STREAM_URL: fixed event stream URL
    /// - OPSCOPE_REGISTER_URL: registration endpoint
    /// - OPSCOPE_API_URL: operations API base URL
    /// - OPSCOPE_TOKEN: bearer token
    /// - OPSCOPE_DATA_DIR: data directory (default: platform data dir)
    /// - OPSCOPE_MAX_RETRIES: reconnect attempts (default: 6)
    /// - OPSCOPE_RETRY_DELAY_MS: delay between attempts (default: 5000)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.merge_with_env();
        config
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = match config_file {
            Some(path) if path.exists() => {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(path)?
            }
            Some(path) => {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };

        config.merge_with_env();
        Ok(config)
    }

    /// Override with every `OPSCOPE_*` variable that is set (env takes priority)
    pub fn merge_with_env(&mut self) {
        if let Ok(url) = std::env::var("OPSCOPE_STREAM_URL") {
            self.stream.url = Some(url);
        }
        if let Ok(url) = std::env::var("OPSCOPE_REGISTER_URL") {
            self.stream.register_url = Some(url);
        }
        if let Ok(url) = std::env::var("OPSCOPE_API_URL") {
            self.stream.api_url = Some(url);
        }
        if let Ok(token) = std::env::var("OPSCOPE_TOKEN") {
            self.stream.token = Some(token);
        }
        if let Ok(dir) = std::env::var("OPSCOPE_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(retries) = std::env::var("OPSCOPE_MAX_RETRIES") {
            if let Ok(val) = retries.parse() {
                self.stream.connection.max_retries = val;
            }
        }
        if let Ok(delay) = std::env::var("OPSCOPE_RETRY_DELAY_MS") {
            if let Ok(val) = delay.parse() {
                self.stream.connection.retry_delay_ms = val;
            }
        }
    }

    /// Path of the key-value settings file holding the resume cursor.
    pub fn settings_path(&self) -> PathBuf {
        self.storage.data_dir.join("settings.json")
    }

    pub fn api_url(&self) -> Result<Option<Url>> {
        self.stream
            .api_url
            .as_deref()
            .map(|url| Url::parse(url).with_context(|| format!("Invalid api_url: {}", url)))
            .transpose()
    }

    /// Validate configuration and create the data directory.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("stream.url", &self.stream.url),
            ("stream.register_url", &self.stream.register_url),
            ("stream.api_url", &self.stream.api_url),
        ] {
            if let Some(value) = value {
                Url::parse(value).with_context(|| format!("Invalid {}: {}", name, value))?;
            }
        }

        if self.buffer.threshold == 0 {
            bail!("buffer.threshold must be at least 1");
        }
        if self.buffer.window_ms == 0 {
            bail!("buffer.window_ms must be at least 1");
        }

        if !self.storage.data_dir.exists() {
            std::fs::create_dir_all(&self.storage.data_dir).with_context(|| {
                format!(
                    "Failed to create data directory {}",
                    self.storage.data_dir.display()
                )
            })?;
        }
        Ok(())
    }
}
