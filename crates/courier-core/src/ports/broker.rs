//! Broker port - the transport seam.
//!
//! `Broker` dials; each successful dial yields a fresh `BrokerChannel`
//! (one AMQP connection + one channel). A channel is never reused after
//! its connection closes.
//!
//! # 実装
//! - `impls::AmqpBroker`: lapin (RabbitMQ)
//! - `impls::InMemoryBroker`: テスト・デモ用

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::domain::{DeliveryContext, Headers};

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// The connection or channel went away; retrying on a new one may work.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::ChannelClosed)
    }
}

/// A durable-or-not topic exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// Durable, non-auto-deleted topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    /// Declared as the `x-dead-letter-exchange` queue argument.
    pub dead_letter_exchange: Option<String>,
}

/// Basic QoS settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefetch {
    /// Max unacknowledged deliveries; 0 means unlimited.
    pub count: u16,
    pub global: bool,
}

/// A message ready to hand to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub message_id: String,
    pub content_type: String,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub persistent: bool,
    pub priority: Option<u8>,
    pub headers: Headers,
    pub mandatory: bool,
    pub immediate: bool,
}

/// Acknowledges one delivery. Exactly one of `ack`/`nack` is called.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// One message pulled off a queue.
pub struct InboundDelivery {
    pub context: DeliveryContext,
    pub body: Vec<u8>,
    pub acker: Box<dyn Acker>,
}

/// Deliveries of one `consume` call. Ends when the channel closes.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = InboundDelivery> + Send>>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Dial a new connection and open a channel on it.
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Human-readable target for logs (credentials stripped).
    fn describe(&self) -> String;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str)
    -> Result<(), BrokerError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError>;

    async fn set_prefetch(&self, prefetch: Prefetch) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
    -> Result<DeliveryStream, BrokerError>;

    fn is_open(&self) -> bool;

    /// Resolves with a reason once the underlying connection is gone
    /// (immediately if it already is).
    async fn closed(&self) -> String;

    /// Close the channel and its connection. Idempotent.
    async fn close(&self) -> Result<(), BrokerError>;
}
