//! Lifecycle coordinator: start/stop, traffic transitions, config sync,
//! and the janitor loop.
//!
//! Owns the consumer set and drives the router's pool set from the routing
//! configuration, whether that comes from the remote config source or from
//! the built-in defaults. Apply is single-flight: concurrent syncs queue on
//! one lock and see each other's results.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use courier_broker::{BatchHandler, BrokerConsumer};
use courier_core::{
    ConsumerHealth, PoolConfig, QueueConfig, QueueMetrics, RoutingConfig, WarningCategory,
    WarningSeverity,
};

use crate::config_sync::ConfigSource;
use crate::error::RouterError;
use crate::router::MessageRouter;
use crate::traffic::{TrafficManager, TrafficMode};
use crate::warning::WarningService;
use crate::Result;

/// Builds broker consumers for queue config entries. The binary wires one
/// per deployment; tests substitute mocks.
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    async fn create(
        &self,
        config: &QueueConfig,
        handler: Arc<dyn BatchHandler>,
    ) -> Result<Arc<dyn BrokerConsumer>>;
}

#[derive(Clone)]
pub struct CoordinatorConfig {
    pub max_pools: usize,
    /// Warn when the pool count crosses this share of `max_pools`.
    pub pool_warning_ratio: f64,
    pub drain_timeout: Duration,
    pub janitor_interval: Duration,
    pub visibility_extend_interval: Duration,
    pub visibility_extend_threshold_seconds: u64,
    pub visibility_extension_seconds: u32,
    /// Applied when no remote config source is available (or its initial
    /// fetch fails outright).
    pub default_config: RoutingConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_pools: 2000,
            pool_warning_ratio: 0.5,
            drain_timeout: Duration::from_secs(30),
            janitor_interval: Duration::from_secs(10),
            visibility_extend_interval: Duration::from_secs(30),
            visibility_extend_threshold_seconds: 50,
            visibility_extension_seconds: 120,
            default_config: default_routing_config(),
        }
    }
}

/// Three pools covering the priority spectrum; the embedded default pool
/// code must exist here.
pub fn default_routing_config() -> RoutingConfig {
    RoutingConfig {
        processing_pools: vec![
            PoolConfig {
                code: "POOL-HIGH".to_string(),
                concurrency: 10,
                rate_limit_per_minute: None,
            },
            PoolConfig {
                code: "POOL-MEDIUM".to_string(),
                concurrency: 10,
                rate_limit_per_minute: None,
            },
            PoolConfig {
                code: "POOL-LOW".to_string(),
                concurrency: 10,
                rate_limit_per_minute: None,
            },
        ],
        queues: vec![],
    }
}

pub struct LifecycleCoordinator {
    config: CoordinatorConfig,
    router: Arc<MessageRouter>,
    traffic: Arc<TrafficManager>,
    warnings: Arc<WarningService>,
    factory: Arc<dyn ConsumerFactory>,
    config_source: Option<Arc<ConfigSource>>,

    consumers: tokio::sync::RwLock<HashMap<String, Arc<dyn BrokerConsumer>>>,
    draining_consumers: tokio::sync::RwLock<HashMap<String, Arc<dyn BrokerConsumer>>>,
    pool_configs: tokio::sync::RwLock<HashMap<String, PoolConfig>>,
    queue_configs: tokio::sync::RwLock<HashMap<String, QueueConfig>>,

    apply_lock: tokio::sync::Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
}

impl LifecycleCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        router: Arc<MessageRouter>,
        traffic: Arc<TrafficManager>,
        warnings: Arc<WarningService>,
        factory: Arc<dyn ConsumerFactory>,
        config_source: Option<Arc<ConfigSource>>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            router,
            traffic,
            warnings,
            factory,
            config_source,
            consumers: tokio::sync::RwLock::new(HashMap::new()),
            draining_consumers: tokio::sync::RwLock::new(HashMap::new()),
            pool_configs: tokio::sync::RwLock::new(HashMap::new()),
            queue_configs: tokio::sync::RwLock::new(HashMap::new()),
            apply_lock: tokio::sync::Mutex::new(()),
            shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn traffic(&self) -> &Arc<TrafficManager> {
        &self.traffic
    }

    pub fn warnings(&self) -> &Arc<WarningService> {
        &self.warnings
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(instance_id = %self.traffic.instance_id(), "Lifecycle coordinator starting");

        self.spawn_mode_watcher();

        // Initial configuration: remote source when available, built-in
        // defaults otherwise. An exhausted initial fetch degrades to the
        // defaults instead of killing the process.
        let initial = match &self.config_source {
            Some(source) if source.is_enabled() => match source.fetch_if_changed().await {
                Ok(Some(config)) => config,
                Ok(None) => self.config.default_config.clone(),
                Err(e) => {
                    error!(error = %e, "Initial config fetch failed, degrading to defaults");
                    self.warnings.add_warning(
                        WarningCategory::Configuration,
                        WarningSeverity::Critical,
                        format!("Initial config fetch failed: {e}; running with default pools"),
                        "LifecycleCoordinator",
                    );
                    self.config.default_config.clone()
                }
            },
            _ => self.config.default_config.clone(),
        };
        self.apply_config(initial).await?;

        self.spawn_janitor();
        self.spawn_visibility_extender();
        self.spawn_config_sync();

        if self.traffic.is_primary() {
            self.start_consumers().await;
        } else {
            info!("Starting in standby mode - consumers remain stopped");
        }

        Ok(())
    }

    /// Apply a routing configuration: diff pools and queues against what is
    /// currently running.
    pub async fn apply_config(&self, config: RoutingConfig) -> Result<()> {
        let _single_flight = self.apply_lock.lock().await;

        if !self.running.load(Ordering::SeqCst) {
            return Err(RouterError::ShutdownInProgress);
        }

        let new_pools: HashMap<String, PoolConfig> = config
            .processing_pools
            .iter()
            .map(|p| (p.code.clone(), p.clone()))
            .collect();

        let mut pool_configs = self.pool_configs.write().await;
        let mut updated = 0usize;
        let mut created = 0usize;
        let mut removed = 0usize;

        for code in self.router.pool_codes() {
            match new_pools.get(&code) {
                Some(new_config) => {
                    let changed = pool_configs
                        .get(&code)
                        .map(|old| old != new_config)
                        .unwrap_or(true);
                    if changed {
                        self.router.update_pool(new_config);
                        updated += 1;
                    }
                    pool_configs.insert(code, new_config.clone());
                }
                None => {
                    self.router.drain_pool(&code);
                    pool_configs.remove(&code);
                    removed += 1;
                }
            }
        }

        let warning_threshold =
            (self.config.max_pools as f64 * self.config.pool_warning_ratio) as usize;
        for (code, pool_config) in &new_pools {
            if self.router.pool(code).is_some() {
                continue;
            }

            let current = self.router.pool_count();
            if current >= self.config.max_pools {
                error!(
                    pool_code = %code,
                    current,
                    max_pools = self.config.max_pools,
                    "Pool limit reached, refusing to create pool"
                );
                self.warnings.add_warning(
                    WarningCategory::PoolHealth,
                    WarningSeverity::Critical,
                    format!(
                        "Pool limit reached ({current}/{}), cannot create [{code}]",
                        self.config.max_pools
                    ),
                    "LifecycleCoordinator",
                );
                continue;
            }
            if current >= warning_threshold {
                warn!(
                    pool_code = %code,
                    current,
                    max_pools = self.config.max_pools,
                    "Pool count approaching limit"
                );
                self.warnings.add_warning(
                    WarningCategory::PoolHealth,
                    WarningSeverity::Warn,
                    format!(
                        "Pool count {current} at or past warning threshold {warning_threshold} (max {})",
                        self.config.max_pools
                    ),
                    "LifecycleCoordinator",
                );
            }

            self.router.insert_pool(pool_config.clone());
            pool_configs.insert(code.clone(), pool_config.clone());
            created += 1;
        }
        drop(pool_configs);

        let (queues_created, queues_removed) = self.sync_queues(&config.queues).await;

        info!(
            pools_updated = updated,
            pools_created = created,
            pools_removed = removed,
            queues_created,
            queues_removed,
            active_pools = self.router.pool_count(),
            "Configuration applied"
        );
        Ok(())
    }

    async fn sync_queues(&self, queues: &[QueueConfig]) -> (usize, usize) {
        let mut new_queues: HashMap<String, QueueConfig> = HashMap::new();
        for queue in queues {
            match queue.identifier() {
                Some(id) => {
                    new_queues.insert(id, queue.clone());
                }
                None => {
                    warn!("Queue config entry has neither queueUri nor queueName, skipping");
                    self.warnings.add_warning(
                        WarningCategory::Configuration,
                        WarningSeverity::Warn,
                        "Queue config entry missing both queueUri and queueName",
                        "LifecycleCoordinator",
                    );
                }
            }
        }

        let mut consumers = self.consumers.write().await;
        let mut draining = self.draining_consumers.write().await;
        let mut queue_configs = self.queue_configs.write().await;
        let mut created = 0usize;
        let mut removed = 0usize;

        let existing: Vec<String> = consumers.keys().cloned().collect();
        for queue_id in existing {
            if !new_queues.contains_key(&queue_id) {
                if let Some(consumer) = consumers.remove(&queue_id) {
                    info!(queue_id = %queue_id, "Queue removed from config, stopping consumer");
                    consumer.stop().await;
                    draining.insert(queue_id.clone(), consumer);
                    queue_configs.remove(&queue_id);
                    removed += 1;
                }
            }
        }

        for (queue_id, queue_config) in &new_queues {
            if consumers.contains_key(queue_id) {
                continue;
            }

            let handler: Arc<dyn BatchHandler> = self.router.clone();
            match self.factory.create(queue_config, handler).await {
                Ok(consumer) => {
                    info!(queue_id = %queue_id, "Consumer created");
                    if self.traffic.is_primary() && self.running.load(Ordering::SeqCst) {
                        consumer.clone().start().await;
                    }
                    consumers.insert(queue_id.clone(), consumer);
                    queue_configs.insert(queue_id.clone(), queue_config.clone());
                    created += 1;
                }
                Err(e) => {
                    error!(queue_id = %queue_id, error = %e, "Failed to create consumer");
                    self.warnings.add_warning(
                        WarningCategory::ConsumerHealth,
                        WarningSeverity::Critical,
                        format!("Failed to create consumer for [{queue_id}]: {e}"),
                        "LifecycleCoordinator",
                    );
                }
            }
        }

        (created, removed)
    }

    async fn start_consumers(&self) {
        let consumers = self.consumers.read().await;
        info!(count = consumers.len(), "Starting consumers");
        for consumer in consumers.values() {
            consumer.clone().start().await;
        }
    }

    async fn stop_consumers(&self) {
        let consumers = self.consumers.read().await;
        info!(count = consumers.len(), "Stopping consumers");
        for consumer in consumers.values() {
            consumer.stop().await;
        }
    }

    fn spawn_mode_watcher(self: &Arc<Self>) {
        let coordinator = self.clone();
        let mut mode_rx = self.traffic.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = mode_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let mode = *mode_rx.borrow();
                        match mode {
                            TrafficMode::Standby => {
                                info!("Standby: pausing consumers, pools drain naturally");
                                coordinator.stop_consumers().await;
                            }
                            TrafficMode::Primary => {
                                info!("Primary: resuming consumers");
                                coordinator.start_consumers().await;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Periodic reaper for drained pools and stopped consumers.
    fn spawn_janitor(self: &Arc<Self>) {
        let coordinator = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.janitor_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        coordinator.router.cleanup_draining_pools();

                        let mut draining = coordinator.draining_consumers.write().await;
                        draining.retain(|queue_id, consumer| {
                            let still_running = consumer.health().is_running;
                            if !still_running {
                                debug!(queue_id = %queue_id, "Stopped consumer reaped");
                            }
                            still_running
                        });
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_visibility_extender(self: &Arc<Self>) {
        let coordinator = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.visibility_extend_interval;
        let threshold = self.config.visibility_extend_threshold_seconds;
        let extension = self.config.visibility_extension_seconds;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        coordinator.router.extend_long_running(threshold, extension).await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    fn spawn_config_sync(self: &Arc<Self>) {
        let Some(source) = self.config_source.clone() else {
            return;
        };
        if !source.is_enabled() {
            return;
        }

        let coordinator = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = source.sync_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Initial sync already ran in start().
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match source.fetch_if_changed().await {
                            Ok(Some(config)) => {
                                info!("Routing configuration changed, applying");
                                if let Err(e) = coordinator.apply_config(config).await {
                                    error!(error = %e, "Failed to apply synced configuration");
                                    source.invalidate();
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(error = %e, "Scheduled config sync failed, keeping current config");
                                coordinator.warnings.add_warning(
                                    WarningCategory::Configuration,
                                    WarningSeverity::Error,
                                    format!("Config sync failed: {e}"),
                                    "LifecycleCoordinator",
                                );
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Graceful stop: consumers first, then drain pools with a deadline,
    /// then nack whatever never reached a verdict.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Lifecycle coordinator stopping");

        let _ = self.shutdown_tx.send(());

        self.stop_consumers().await;
        {
            let draining = self.draining_consumers.read().await;
            for consumer in draining.values() {
                consumer.stop().await;
            }
        }

        self.router.drain_all_pools();
        let deadline = Instant::now() + self.config.drain_timeout;
        while !self.router.all_pools_drained() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if !self.router.all_pools_drained() {
            warn!(
                timeout_secs = self.config.drain_timeout.as_secs(),
                "Pools did not drain before the deadline"
            );
        }

        self.router.shutdown_pools();
        self.router.nack_all_in_flight().await;

        info!("Lifecycle coordinator stopped");
    }

    pub async fn consumer_health(&self) -> Vec<ConsumerHealth> {
        let consumers = self.consumers.read().await;
        consumers.values().map(|c| c.health()).collect()
    }

    pub async fn queue_metrics(&self) -> Vec<QueueMetrics> {
        let consumers = self.consumers.read().await;
        let mut metrics = Vec::with_capacity(consumers.len());
        for consumer in consumers.values() {
            metrics.push(consumer.queue_metrics().await);
        }
        metrics
    }

    pub async fn consumer_ids(&self) -> Vec<String> {
        self.consumers.read().await.keys().cloned().collect()
    }
}
