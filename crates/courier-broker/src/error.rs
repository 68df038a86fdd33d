use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("SQS error: {0}")]
    Sqs(String),

    #[error("AMQP error: {0}")]
    Amqp(String),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Batch handler error: {0}")]
    Handler(String),

    #[error("Consumer is stopped")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(feature = "embedded")]
impl From<sqlx::Error> for BrokerError {
    fn from(e: sqlx::Error) -> Self {
        BrokerError::Database(e.to_string())
    }
}
