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

//! Server-side deletes
//!
//! Deleting an operation locally only is undone by the next full resync, so
//! deletes go to the backend first and touch the local store only once the
//! server has accepted them.

use crate::error::{Result, StreamError};
use async_trait::async_trait;
use opscope_storage::OperationStore;
use reqwest::Client as HttpClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Backend operations API.
#[async_trait]
pub trait OperationsApi: Send + Sync {
    async fn delete_operation(&self, id: &str) -> Result<()>;
    async fn delete_all(&self) -> Result<()>;
}

/// `DELETE {base}/operations/{id}` and `DELETE {base}/operations`.
#[derive(Debug, Clone)]
pub struct HttpOperationsApi {
    client: HttpClient,
    base: Url,
    token: Option<String>,
}

impl HttpOperationsApi {
    pub fn new(base: Url, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = HttpClient::builder()
            .connect_timeout(timeout)
            .timeout(timeout * 3)
            .build()?;
        Ok(Self {
            client,
            base,
            token,
        })
    }

    fn operations_url(&self, id: Option<&str>) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StreamError::Transport(format!("cannot-be-a-base URL: {}", self.base)))?;
            segments.pop_if_empty().push("operations");
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    async fn send_delete(&self, url: Url) -> Result<()> {
        let mut request = self.client.delete(url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StreamError::Status {
                status: status.as_u16(),
                message,
            });
        }
        debug!(url = %url, "Remote delete accepted");
        Ok(())
    }
}

#[async_trait]
impl OperationsApi for HttpOperationsApi {
    async fn delete_operation(&self, id: &str) -> Result<()> {
        let url = self.operations_url(Some(id))?;
        self.send_delete(url).await
    }

    async fn delete_all(&self) -> Result<()> {
        let url = self.operations_url(None)?;
        self.send_delete(url).await
    }
}

/// Deletes applied on the server, then locally.
#[derive(Clone)]
pub struct SyncedDeletes {
    api: Arc<dyn OperationsApi>,
    store: Arc<OperationStore>,
}

impl SyncedDeletes {
    pub fn new(api: Arc<dyn OperationsApi>, store: Arc<OperationStore>) -> Self {
        Self { api, store }
    }

    /// Delete one operation. Returns whether a local record was removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.api.delete_operation(id).await?;
        let removed = self.store.delete(id)?;
        info!(id, removed, "Deleted operation");
        Ok(removed)
    }

    /// Delete every operation on the server and clear the local store.
    pub async fn delete_all(&self) -> Result<()> {
        self.api.delete_all().await?;
        self.store.clear()?;
        info!("Deleted all operations");
        Ok(())
    }
}
