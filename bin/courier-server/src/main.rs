//! Courier router process: wires the configured broker to the routing
//! engine and runs until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use courier_broker::activemq::{ActiveMqConsumer, ActiveMqConsumerConfig};
use courier_broker::embedded::{EmbeddedConsumer, EmbeddedQueueConfig, SqliteQueueStore};
use courier_broker::nats::{NatsConsumer, NatsConsumerConfig};
use courier_broker::sqs::{SqsConsumer, SqsConsumerConfig};
use courier_broker::{BatchHandler, BrokerConsumer, BrokerError};
use courier_config::{AppConfig, ConfigLoader, QueueType};
use courier_core::QueueConfig;
use courier_router::{
    BreakerConfig, BreakerRegistry, ConfigSource, ConfigSourceConfig, ConsumerFactory,
    CoordinatorConfig, HttpMediator, HttpMediatorConfig, LifecycleCoordinator, MessageRouter,
    RouterError, TrafficManager, TrafficMode, WarningService,
};

struct BrokerConsumerFactory {
    app: AppConfig,
}

impl BrokerConsumerFactory {
    fn queue_name<'a>(&self, queue: &'a QueueConfig, fallback: &'a str) -> &'a str {
        queue.queue_name.as_deref().unwrap_or(fallback)
    }
}

#[async_trait]
impl ConsumerFactory for BrokerConsumerFactory {
    async fn create(
        &self,
        queue: &QueueConfig,
        handler: Arc<dyn BatchHandler>,
    ) -> courier_router::Result<Arc<dyn BrokerConsumer>> {
        let connections = queue.connections.unwrap_or(1);

        match self.app.queue_type {
            QueueType::Embedded => {
                let db_path = PathBuf::from(&self.app.data_dir).join("queue.db");
                std::fs::create_dir_all(&self.app.data_dir)
                    .map_err(|e| RouterError::Consumer(format!("data dir: {e}")))?;

                let options = sqlx::sqlite::SqliteConnectOptions::new()
                    .filename(&db_path)
                    .create_if_missing(true);
                let pool = sqlx::sqlite::SqlitePoolOptions::new()
                    .connect_with(options)
                    .await
                    .map_err(|e| BrokerError::Database(e.to_string()))?;

                let store = Arc::new(SqliteQueueStore::new(
                    pool,
                    EmbeddedQueueConfig {
                        queue_name: self
                            .queue_name(queue, &self.app.embedded.queue_name)
                            .to_string(),
                        visibility_timeout_seconds: self.app.embedded.visibility_timeout_seconds,
                        dedup_window_seconds: self.app.embedded.dedup_window_seconds,
                        connections,
                        max_messages: 10,
                    },
                ));
                store.init_schema().await?;

                Ok(Arc::new(EmbeddedConsumer::new(store, handler)))
            }

            QueueType::Sqs => {
                let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(aws_config::Region::new(self.app.sqs.region.clone()))
                    .load()
                    .await;
                let client = aws_sdk_sqs::Client::new(&shared);

                let queue_url = queue
                    .queue_uri
                    .clone()
                    .filter(|uri| !uri.is_empty())
                    .unwrap_or_else(|| self.app.sqs.queue_url.clone());
                if queue_url.is_empty() {
                    return Err(RouterError::Config(
                        "SQS queue URL is not configured".to_string(),
                    ));
                }

                Ok(Arc::new(SqsConsumer::new(
                    client,
                    SqsConsumerConfig {
                        queue_url,
                        queue_id: queue.queue_name.clone().unwrap_or_default(),
                        connections,
                        max_messages: self.app.sqs.max_messages,
                        wait_time_seconds: self.app.sqs.wait_time_seconds,
                        visibility_timeout_seconds: self.app.sqs.visibility_timeout_seconds,
                    },
                    handler,
                )))
            }

            QueueType::ActiveMq => {
                let consumer = ActiveMqConsumer::connect(
                    ActiveMqConsumerConfig {
                        uri: queue
                            .queue_uri
                            .clone()
                            .filter(|uri| !uri.is_empty())
                            .unwrap_or_else(|| self.app.activemq.uri.clone()),
                        queue_name: self
                            .queue_name(queue, &self.app.activemq.queue_name)
                            .to_string(),
                        connections,
                        prefetch_count: self.app.activemq.prefetch_count,
                        ..Default::default()
                    },
                    handler,
                )
                .await?;
                Ok(Arc::new(consumer))
            }

            QueueType::Nats => {
                let client = async_nats::connect(&self.app.nats.url)
                    .await
                    .map_err(|e| RouterError::Consumer(format!("NATS connect: {e}")))?;
                let jetstream = async_nats::jetstream::new(client);

                Ok(Arc::new(NatsConsumer::new(
                    jetstream,
                    NatsConsumerConfig {
                        stream_name: self.app.nats.stream.clone(),
                        subject: self.app.nats.subject.clone(),
                        durable_name: self.app.nats.durable_name.clone(),
                        queue_id: self
                            .queue_name(queue, &self.app.nats.stream)
                            .to_string(),
                        connections,
                        ..Default::default()
                    },
                    handler,
                )))
            }
        }
    }
}

fn default_queue_entry(app: &AppConfig) -> QueueConfig {
    let (name, uri) = match app.queue_type {
        QueueType::Embedded => (app.embedded.queue_name.clone(), None),
        QueueType::Sqs => (
            app.sqs
                .queue_url
                .rsplit('/')
                .next()
                .unwrap_or("sqs")
                .to_string(),
            Some(app.sqs.queue_url.clone()),
        ),
        QueueType::ActiveMq => (app.activemq.queue_name.clone(), Some(app.activemq.uri.clone())),
        QueueType::Nats => (app.nats.stream.clone(), Some(app.nats.url.clone())),
    };
    QueueConfig {
        queue_uri: uri,
        queue_name: Some(name),
        connections: Some(1),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_core::logging::init_logging();

    let app = ConfigLoader::new().load().context("loading configuration")?;
    info!(
        instance_id = %app.instance_id,
        queue_type = ?app.queue_type,
        "Starting courier router"
    );

    let warnings = Arc::new(WarningService::default());

    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
        failure_threshold: app.breaker.failure_threshold,
        half_open_probe_count: app.breaker.half_open_probe_count,
        open_duration: Duration::from_millis(app.breaker.open_duration_ms),
    }));

    let mediator = Arc::new(
        HttpMediator::new(
            HttpMediatorConfig {
                connect_timeout: Duration::from_millis(app.mediation.connect_timeout_ms),
                headers_timeout: Duration::from_millis(app.mediation.headers_timeout_ms),
                body_timeout: Duration::from_millis(app.mediation.body_timeout_ms),
                retries: app.mediation.retries,
                retry_delay: Duration::from_millis(app.mediation.retry_delay_ms),
                http2: app.mediation.http2,
            },
            breakers,
        )
        .with_warning_service(warnings.clone()),
    );

    let router = Arc::new(MessageRouter::new(mediator, warnings.clone()));

    let initial_mode = if app.start_standby {
        TrafficMode::Standby
    } else {
        TrafficMode::Primary
    };
    let traffic = Arc::new(TrafficManager::new(app.instance_id.clone(), initial_mode));

    let config_source = if app.sync.config_url.is_empty() {
        None
    } else {
        Some(Arc::new(ConfigSource::new(ConfigSourceConfig {
            config_url: app.sync.config_url.clone(),
            sync_interval: Duration::from_millis(app.sync.sync_interval_ms),
            fetch_attempts: app.sync.fetch_attempts,
            retry_delay: Duration::from_millis(app.sync.retry_delay_ms),
            ..Default::default()
        })))
    };

    let mut coordinator_config = CoordinatorConfig {
        max_pools: app.router.max_pools,
        ..Default::default()
    };
    coordinator_config
        .default_config
        .queues
        .push(default_queue_entry(&app));

    let factory = Arc::new(BrokerConsumerFactory { app });

    let coordinator = Arc::new(LifecycleCoordinator::new(
        coordinator_config,
        router,
        traffic,
        warnings,
        factory,
        config_source,
    ));

    coordinator.start().await.context("starting coordinator")?;
    info!("Courier router running; Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    coordinator.stop().await;
    Ok(())
}
