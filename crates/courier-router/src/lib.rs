//! Courier message routing engine.
//!
//! - [`MessageRouter`]: pipeline tracking, dedup, and pool dispatch
//! - [`ProcessPool`]: per-group FIFO workers with concurrency and rate limits
//! - [`HttpMediator`]: downstream HTTP delivery with retries and breakers
//! - [`BreakerRegistry`]: per-target circuit breakers
//! - [`TrafficManager`]: primary/standby transitions
//! - [`LifecycleCoordinator`]: start/stop, config sync, janitor tasks

pub mod breaker;
pub mod config_sync;
pub mod coordinator;
pub mod error;
pub mod limiter;
pub mod mediator;
pub mod pool;
pub mod router;
pub mod stats;
pub mod traffic;
pub mod warning;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, BreakerStats};
pub use config_sync::{ConfigSource, ConfigSourceConfig};
pub use coordinator::{
    default_routing_config, ConsumerFactory, CoordinatorConfig, LifecycleCoordinator,
};
pub use error::RouterError;
pub use limiter::{DynamicSemaphore, LeakyBucket, RateLimitError, SemaphorePermit};
pub use mediator::{HttpMediator, HttpMediatorConfig, Mediator};
pub use pool::{BatchGroupKey, OutcomePolicy, ProcessPool};
pub use router::{MessageRouter, PipelineEntry};
pub use stats::{Disposition, PoolStatsCollector};
pub use traffic::{TrafficManager, TrafficMode};
pub use warning::{WarningService, WarningServiceConfig};

pub type Result<T> = std::result::Result<T, RouterError>;
