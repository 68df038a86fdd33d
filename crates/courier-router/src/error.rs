use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Pool not found: {0}")]
    PoolNotFound(String),

    #[error("Pool limit reached ({0} pools)")]
    PoolLimitReached(usize),

    #[error("Consumer error: {0}")]
    Consumer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config fetch failed: {0}")]
    ConfigFetch(String),

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Broker error: {0}")]
    Broker(#[from] courier_broker::BrokerError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
