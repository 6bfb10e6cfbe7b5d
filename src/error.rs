use thiserror::Error;

/// A subscriber could not accept a message. The connection is treated as dead.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    #[error("subscriber connection is closed")]
    Closed,
    #[error("subscriber is not reading, its queue is full")]
    Lagging,
}

#[derive(Error, Debug)]
pub enum CaseEventsError {
    #[error("failed to serialize event payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("event payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("event name must not contain line breaks: {0:?}")]
    InvalidEventName(String),
    #[error("case {case_id} already has {limit} live subscribers")]
    CaseFull { case_id: String, limit: usize },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}
