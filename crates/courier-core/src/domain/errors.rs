//! Errors - エラー型と分類

use std::fmt;

use super::envelope::EnvelopeError;
use crate::ports::BrokerError;

/// Operational classification of failures.
///
/// - Connection: dial/channel/declare failure, retried in the background
/// - Protocol: malformed envelope, dropped without requeue
/// - Handler: handler returned an error, requeued
/// - Configuration: no handler for the routing key, dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Protocol,
    Handler,
    Configuration,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Handler => "handler",
            ErrorKind::Configuration => "configuration",
        };
        f.write_str(s)
    }
}

/// Errors surfaced synchronously by the public API.
///
/// Connectivity loss is never reported here once a component is running;
/// it is absorbed by the reconnect loop and visible through logs and
/// `ConnectionManager::is_connected`.
#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    #[error("connection failed: {0}")]
    Connection(#[source] BrokerError),

    #[error(transparent)]
    Encode(#[from] EnvelopeError),

    #[error("failed to bind queue '{queue}' to '{pattern}': {source}")]
    Bind {
        queue: String,
        pattern: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to consume from queue '{queue}': {source}")]
    Consume {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("connection manager is closed")]
    Closed,

    #[error("no broker configured; messaging is disabled")]
    Disabled,
}

impl CourierError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CourierError::Encode(_) => ErrorKind::Protocol,
            CourierError::Bind { .. } | CourierError::Consume { .. } => ErrorKind::Configuration,
            CourierError::Connection(_) | CourierError::Closed | CourierError::Disabled => {
                ErrorKind::Connection
            }
        }
    }
}
