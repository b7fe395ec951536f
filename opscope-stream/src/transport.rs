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

//! Registration and byte-stream collaborators
//!
//! Each connection attempt first asks a [`Registrar`] for the stream URL and
//! bearer token, then opens the byte stream through an [`EventTransport`].

use crate::error::{Result, StreamError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Raw event-stream bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Stream endpoint handed out by the registration handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self) -> Result<Registration>;
}

#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Open an event stream at `url` (resume parameters already attached).
    async fn open(&self, url: &Url, token: Option<&str>) -> Result<ByteStream>;
}

/// Registrar returning a fixed endpoint.
#[derive(Debug, Clone)]
pub struct StaticRegistrar {
    registration: Registration,
}

impl StaticRegistrar {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            registration: Registration {
                url: url.into(),
                token,
            },
        }
    }
}

#[async_trait]
impl Registrar for StaticRegistrar {
    async fn register(&self) -> Result<Registration> {
        Ok(self.registration.clone())
    }
}

/// Registrar that POSTs to a registration endpoint and reads `{url, token}`.
#[derive(Debug, Clone)]
pub struct HttpRegistrar {
    client: HttpClient,
    register_url: Url,
    api_key: Option<String>,
}

impl HttpRegistrar {
    pub fn new(register_url: Url, api_key: Option<String>, connect_timeout: Duration) -> Result<Self> {
        let client = HttpClient::builder()
            .connect_timeout(connect_timeout)
            .timeout(connect_timeout * 3)
            .build()?;
        Ok(Self {
            client,
            register_url,
            api_key,
        })
    }
}

#[async_trait]
impl Registrar for HttpRegistrar {
    async fn register(&self) -> Result<Registration> {
        let mut request = self
            .client
            .post(self.register_url.clone())
            .json(&serde_json::json!({}));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
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

        let registration: Registration = response
            .json()
            .await
            .map_err(|e| StreamError::Registration(e.to_string()))?;
        if registration.url.trim().is_empty() {
            return Err(StreamError::Registration("empty stream url".into()));
        }
        debug!(url = %registration.url, "Registered stream endpoint");
        Ok(registration)
    }
}

/// Streaming GET with `Accept: text/event-stream`.
#[derive(Debug, Clone)]
pub struct HttpEventTransport {
    client: HttpClient,
}

impl HttpEventTransport {
    /// Only the connect phase is bounded; the stream itself is long-lived.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = HttpClient::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EventTransport for HttpEventTransport {
    async fn open(&self, url: &Url, token: Option<&str>) -> Result<ByteStream> {
        let mut request = self
            .client
            .get(url.clone())
            .header(ACCEPT, "text/event-stream");
        if let Some(token) = token {
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

        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(StreamError::from)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_registrar() {
        let registrar = StaticRegistrar::new("http://localhost:7777/stream", Some("t".into()));
        let registration = registrar.register().await.unwrap();
        assert_eq!(registration.url, "http://localhost:7777/stream");
        assert_eq!(registration.token.as_deref(), Some("t"));
    }

    #[test]
    fn test_registration_shape() {
        let registration: Registration =
            serde_json::from_str(r#"{"url":"http://h/s"}"#).unwrap();
        assert!(registration.token.is_none());
    }
}
