//! Remote routing-configuration source.
//!
//! Fetches the pool/queue configuration from a central service, retrying on
//! failure, and detects changes by hashing the parsed document so an
//! unchanged configuration costs nothing to re-apply.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use courier_core::{PoolConfig, QueueConfig, RoutingConfig};

use crate::error::RouterError;

#[derive(Debug, Clone)]
pub struct ConfigSourceConfig {
    pub config_url: String,
    pub sync_interval: Duration,
    pub fetch_attempts: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for ConfigSourceConfig {
    fn default() -> Self {
        Self {
            config_url: String::new(),
            sync_interval: Duration::from_secs(300),
            fetch_attempts: 12,
            retry_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Wire shape served by the configuration service.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteConfig {
    processing_pools: Vec<RemotePool>,
    #[serde(default)]
    queues: Vec<RemoteQueue>,
    #[serde(default)]
    connections: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemotePool {
    code: String,
    concurrency: u32,
    #[serde(default)]
    rate_limit_per_minute: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteQueue {
    #[serde(default)]
    queue_uri: Option<String>,
    #[serde(default)]
    queue_name: Option<String>,
    #[serde(default)]
    connections: Option<u32>,
}

impl RemoteConfig {
    fn into_routing_config(self) -> RoutingConfig {
        let default_connections = self.connections;
        RoutingConfig {
            processing_pools: self
                .processing_pools
                .into_iter()
                .map(|p| PoolConfig {
                    code: p.code,
                    concurrency: p.concurrency,
                    rate_limit_per_minute: p.rate_limit_per_minute,
                })
                .collect(),
            queues: self
                .queues
                .into_iter()
                .map(|q| QueueConfig {
                    queue_uri: q.queue_uri,
                    queue_name: q.queue_name,
                    connections: q.connections.or(default_connections),
                })
                .collect(),
        }
    }
}

pub struct ConfigSource {
    config: ConfigSourceConfig,
    client: reqwest::Client,
    last_hash: parking_lot::Mutex<Option<u64>>,
}

impl ConfigSource {
    pub fn new(config: ConfigSourceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("reqwest client construction cannot fail");

        Self {
            config,
            client,
            last_hash: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.config.config_url.is_empty()
    }

    pub fn sync_interval(&self) -> Duration {
        self.config.sync_interval
    }

    async fn fetch_once(&self) -> Result<RoutingConfig, RouterError> {
        let response = self
            .client
            .get(&self.config.config_url)
            .send()
            .await
            .map_err(|e| RouterError::ConfigFetch(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(RouterError::ConfigFetch(format!(
                "config service returned {}",
                response.status()
            )));
        }

        let remote: RemoteConfig = response
            .json()
            .await
            .map_err(|e| RouterError::ConfigFetch(format!("invalid config body: {e}")))?;

        Ok(remote.into_routing_config())
    }

    /// Fetch with the configured retry budget.
    pub async fn fetch(&self) -> Result<RoutingConfig, RouterError> {
        let mut last_error = None;

        for attempt in 1..=self.config.fetch_attempts.max(1) {
            debug!(
                attempt,
                url = %self.config.config_url,
                "Fetching routing configuration"
            );
            match self.fetch_once().await {
                Ok(config) => {
                    if attempt > 1 {
                        info!(attempt, "Configuration fetched after retries");
                    }
                    return Ok(config);
                }
                Err(e) => {
                    if attempt < self.config.fetch_attempts {
                        warn!(
                            attempt,
                            error = %e,
                            retry_delay_secs = self.config.retry_delay.as_secs(),
                            "Config fetch failed, retrying"
                        );
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let err = last_error
            .unwrap_or_else(|| RouterError::ConfigFetch("no attempts made".to_string()));
        error!(attempts = self.config.fetch_attempts, error = %err, "Config fetch exhausted retries");
        Err(err)
    }

    /// Fetch and report whether the configuration differs from the last one
    /// seen. `None` means unchanged.
    pub async fn fetch_if_changed(&self) -> Result<Option<RoutingConfig>, RouterError> {
        let config = self.fetch().await?;
        let hash = hash_config(&config);

        let mut last = self.last_hash.lock();
        if *last == Some(hash) {
            debug!("Routing configuration unchanged");
            return Ok(None);
        }
        *last = Some(hash);
        Ok(Some(config))
    }

    /// Forget the last-seen hash so the next fetch always applies.
    pub fn invalidate(&self) {
        *self.last_hash.lock() = None;
    }
}

fn hash_config(config: &RoutingConfig) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    for pool in &config.processing_pools {
        pool.code.hash(&mut hasher);
        pool.concurrency.hash(&mut hasher);
        pool.rate_limit_per_minute.hash(&mut hasher);
    }
    for queue in &config.queues {
        queue.queue_uri.hash(&mut hasher);
        queue.queue_name.hash(&mut hasher);
        queue.connections.hash(&mut hasher);
    }
    hasher.finish()
}
