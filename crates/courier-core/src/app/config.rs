//! Config - 設定値
//!
//! Plain serde structs with defaults. Loading them (env, files) is left to
//! the binary; the library only consumes them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::backoff::BackoffPolicy;
use crate::domain::Headers;

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// `amqp://` URL. `None` disables messaging entirely.
    pub amqp_url: Option<String>,
    /// Topic exchange declared on every (re)connect.
    pub exchange: String,
    /// Stamped into every published envelope as `service_name`.
    pub service_name: String,
    pub reconnect: BackoffPolicy,
    pub consumer: ConsumerOptions,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            amqp_url: None,
            exchange: "events".to_string(),
            service_name: "courier".to_string(),
            reconnect: BackoffPolicy::default(),
            consumer: ConsumerOptions::default(),
        }
    }
}

/// Queue, QoS, and dispatch settings of a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    pub queue: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,

    /// 0 = unlimited.
    pub prefetch_count: u16,
    pub prefetch_global: bool,

    /// Deadline handed to each handler invocation.
    #[serde(with = "duration_ms", rename = "handler_timeout_ms")]
    pub handler_timeout: Duration,

    /// Failed attempts of one message id before it is rejected without
    /// requeue. `None` requeues forever.
    pub max_redeliveries: Option<u32>,

    /// Declared as the queue's `x-dead-letter-exchange` argument.
    pub dead_letter_exchange: Option<String>,

    /// Remember this many acknowledged message ids and ack redeliveries of
    /// them without calling the handler. `None` disables.
    pub dedupe_window: Option<usize>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            queue: "courier.events".to_string(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            prefetch_count: 1,
            prefetch_global: false,
            handler_timeout: Duration::from_secs(30),
            max_redeliveries: None,
            dead_letter_exchange: None,
            dedupe_window: None,
        }
    }
}

impl ConsumerOptions {
    pub fn with_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Self::default()
        }
    }
}

/// Per-message publish flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishOptions {
    pub mandatory: bool,
    pub immediate: bool,
    /// 0-9.
    pub priority: Option<u8>,
    pub headers: Headers,
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = CourierConfig::default();
        assert_eq!(config.amqp_url, None);
        assert_eq!(config.reconnect.base, Duration::from_secs(1));
        assert_eq!(config.reconnect.max, Duration::from_secs(30));
        assert_eq!(config.consumer.prefetch_count, 1);
        assert_eq!(config.consumer.handler_timeout, Duration::from_secs(30));
        assert_eq!(config.consumer.max_redeliveries, None);
        assert_eq!(config.consumer.dedupe_window, None);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: CourierConfig = serde_json::from_value(json!({
            "amqp_url": "amqp://localhost",
            "consumer": { "queue": "location.events", "handler_timeout_ms": 1500 }
        }))
        .unwrap();

        assert_eq!(config.amqp_url.as_deref(), Some("amqp://localhost"));
        assert_eq!(config.exchange, "events");
        assert_eq!(config.consumer.queue, "location.events");
        assert_eq!(config.consumer.handler_timeout, Duration::from_millis(1500));
        assert!(config.consumer.durable);
    }
}
