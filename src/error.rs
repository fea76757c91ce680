// Copyright 2020 Joyent, Inc.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a `KeyValueStore` backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached or dropped the connection.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A key holds a different kind of value than the operation expects.
    #[error("key '{key}' holds a value of the wrong type")]
    WrongType { key: String },

    /// The store answered with something the client could not understand.
    #[error("store protocol error: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum QueueError {
    /// A store operation kept failing until its retry budget ran out.
    #[error(
        "shared store unavailable during {operation} after {attempts} attempt(s): {source}"
    )]
    TransportUnavailable {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("operation cancelled")]
    Cancelled,

    /// The data loss sentinel saw the store drop its state while the
    /// operation was in flight.
    #[error("the shared store lost its data; the request was abandoned")]
    DataLossDetected,

    #[error("data loss sentinel was not monitoring within {0:?}")]
    SentinelNotReady(Duration),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("request queue has been shut down")]
    ShutDown,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl QueueError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueueError::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error(
        "heartbeat timeout ({timeout:?}) must be longer than the heartbeat interval ({interval:?})"
    )]
    HeartbeatWindow {
        interval: Duration,
        timeout: Duration,
    },

    #[error("poll backoff cap ({max:?}) is below its initial delay ({initial:?})")]
    PollBackoff { initial: Duration, max: Duration },

    #[error("namespace must not be empty")]
    EmptyNamespace,
}
