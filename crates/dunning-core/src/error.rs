use thiserror::Error;

/// Errors raised by a [`crate::gateway::PersistenceGateway`] implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Persistence backend unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Stored record is malformed: {0}")]
    Malformed(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Topic closed")]
    TopicClosed,

    #[error("Subscriber lagged: {0} events missed")]
    Lagged(u64),
}
