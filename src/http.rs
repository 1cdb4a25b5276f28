//! Remote map archive download.
//!
//! Fetches `tiles.zip` bundles from the backend. Features:
//! - Optional `Authorization` header (Basic API key or a raw value)
//! - Retry with exponential backoff on 429, 5xx and transport errors
//! - Request timeout from [`HttpConfig`]

use std::time::Duration;

use base64::Engine;
use log::{debug, warn};
use reqwest::{Client, StatusCode};

use crate::config::HttpConfig;
use crate::error::{Result, TileCacheError};
use crate::importer::ArchiveSource;

/// Delay before retry number `attempt` (1-based): 500ms, 1s, 2s, 4s, 8s cap.
fn backoff_for(attempt: u32) -> Duration {
    Duration::from_millis(500 * (1 << attempt.saturating_sub(1).min(4)))
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// [`ArchiveSource`] backed by the map server.
pub struct HttpArchiveSource {
    client: Client,
    config: HttpConfig,
    auth_header: Option<String>,
}

impl HttpArchiveSource {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TileCacheError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            config,
            auth_header: None,
        })
    }

    /// Authenticate with `Basic base64("API_KEY:<key>")`.
    pub fn with_api_key(self, api_key: &str) -> Self {
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("API_KEY:{}", api_key));
        self.with_auth_header(format!("Basic {}", auth))
    }

    /// Send `value` verbatim as the `Authorization` header.
    pub fn with_auth_header(mut self, value: impl Into<String>) -> Self {
        self.auth_header = Some(value.into());
        self
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    async fn fetch(&self, map_id: &str) -> Result<Vec<u8>> {
        let url = self.config.archive_url(map_id);
        let mut attempt = 0;

        loop {
            let mut request = self.client.get(&url);
            if let Some(auth) = &self.auth_header {
                request = request.header("Authorization", auth);
            }

            let failure = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let bytes = resp
                        .bytes()
                        .await
                        .map_err(|e| TileCacheError::archive(map_id, e))?;
                    debug!(
                        "[HttpArchiveSource] Downloaded {} KB from {}",
                        bytes.len() / 1024,
                        url
                    );
                    return Ok(bytes.to_vec());
                }
                Ok(resp) if is_retryable(resp.status()) => format!("HTTP {}", resp.status()),
                Ok(resp) => {
                    return Err(TileCacheError::archive(
                        map_id,
                        format!("HTTP {}", resp.status()),
                    ));
                }
                Err(e) => format!("Request error: {}", e),
            };

            attempt += 1;
            if attempt > self.config.max_retries {
                return Err(TileCacheError::archive(
                    map_id,
                    format!("{} (after {} retries)", failure, self.config.max_retries),
                ));
            }

            let backoff = backoff_for(attempt);
            warn!(
                "[HttpArchiveSource] {} for map {}, retry {} after {:?}",
                failure, map_id, attempt, backoff
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

impl ArchiveSource for HttpArchiveSource {
    async fn fetch_archive(&self, map_id: &str) -> Result<Vec<u8>> {
        self.fetch(map_id).await
    }
}
