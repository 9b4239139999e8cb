//! CourierBuilder - 構築とワイヤリング
//!
//! Wires `ConnectionManager`, `Publisher` and `Consumer` from a
//! `CourierConfig`, validating the configuration up front.

use std::sync::Arc;

use super::config::CourierConfig;
use super::connection::ConnectionManager;
use super::consumer::Consumer;
use super::handler::EventHandler;
use super::publisher::Publisher;
use crate::domain::CourierError;
use crate::impls::AmqpBroker;
use crate::ports::Broker;

/// Builds a [`Courier`].
///
/// # 使用例
/// ```ignore
/// let courier = CourierBuilder::new(config)
///     .subscribe("region.*", Arc::new(RegionHandler))
///     .expect_keys(&["region.*"])
///     .build()
///     .await?;
/// courier.start().await;
/// ```
///
/// # Fail-fast
/// - the exchange (and, with subscriptions, the queue) must be named
/// - every key passed to `expect_keys` must have a handler
pub struct CourierBuilder {
    config: CourierConfig,
    broker: Option<Arc<dyn Broker>>,
    subscriptions: Vec<(String, Arc<dyn EventHandler>)>,
    expected_keys: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing subscriptions: {0:?}. These routing keys were expected but have no handler.")]
    MissingSubscriptions(Vec<String>),

    #[error("failed to register subscription: {0}")]
    Subscribe(#[source] CourierError),
}

impl CourierBuilder {
    pub fn new(config: CourierConfig) -> Self {
        Self {
            config,
            broker: None,
            subscriptions: Vec::new(),
            expected_keys: None,
        }
    }

    /// Use this broker instead of dialing `config.amqp_url`.
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn subscribe(mut self, routing_key: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.subscriptions.push((routing_key.into(), handler));
        self
    }

    pub fn expect_keys(mut self, keys: &[&str]) -> Self {
        self.expected_keys = Some(keys.iter().map(|k| k.to_string()).collect());
        self
    }

    pub async fn build(self) -> Result<Courier, BuildError> {
        if self.config.exchange.trim().is_empty() {
            return Err(BuildError::InvalidConfig("exchange name is empty".into()));
        }
        if !self.subscriptions.is_empty() && self.config.consumer.queue.trim().is_empty() {
            return Err(BuildError::InvalidConfig(
                "queue name is empty but subscriptions were registered".into(),
            ));
        }
        if let Some(expected) = &self.expected_keys {
            let missing: Vec<String> = expected
                .iter()
                .filter(|k| !self.subscriptions.iter().any(|(key, _)| key == *k))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingSubscriptions(missing));
            }
        }

        let broker = self.broker.or_else(|| {
            self.config
                .amqp_url
                .as_deref()
                .filter(|url| !url.trim().is_empty())
                .map(|url| Arc::new(AmqpBroker::new(url)) as Arc<dyn Broker>)
        });
        let connection = match broker {
            Some(broker) => {
                ConnectionManager::new(broker, self.config.exchange.as_str(), self.config.reconnect)
            }
            None => ConnectionManager::disabled(self.config.exchange.as_str()),
        };

        let publisher = Publisher::new(connection.clone(), self.config.service_name.as_str());
        let consumer = Consumer::new(connection.clone(), self.config.consumer.clone());
        for (key, handler) in self.subscriptions {
            consumer
                .subscribe(&key, handler)
                .await
                .map_err(BuildError::Subscribe)?;
        }

        Ok(Courier {
            connection,
            publisher,
            consumer,
        })
    }
}

/// A publisher and a consumer sharing one connection.
#[derive(Clone)]
pub struct Courier {
    pub connection: ConnectionManager,
    pub publisher: Publisher,
    pub consumer: Consumer,
}

impl Courier {
    /// Dial once. An unreachable broker is logged and retried in the
    /// background, never returned.
    pub async fn start(&self) {
        self.connection.start().await;
    }

    /// Drain the consumer, then close the connection.
    pub async fn close(&self) {
        self.connection.close().await;
    }
}
