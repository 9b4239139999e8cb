//! Publisher - イベントの発行
//!
//! Encodes events into envelopes and hands them to the live channel.
//! Broker unavailability is never an error for callers: without a channel
//! the event is logged and dropped, and a failed publish on a live channel
//! is logged as well.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::config::PublishOptions;
use super::connection::ConnectionManager;
use super::context::RequestContext;
use crate::domain::{CONTENT_TYPE_JSON, CourierError, EventEnvelope};
use crate::ports::{Clock, IdGenerator, OutboundMessage, SystemClock, UlidGenerator};

#[derive(Clone)]
pub struct Publisher {
    connection: ConnectionManager,
    service_name: String,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl Publisher {
    pub fn new(connection: ConnectionManager, service_name: impl Into<String>) -> Self {
        Self {
            connection,
            service_name: service_name.into(),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    /// Replace the time and id sources (tests pin them).
    pub fn with_ports(mut self, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        self.clock = clock;
        self.ids = ids;
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Publish `payload` under `routing_key`.
    ///
    /// The only error is a payload that cannot be serialized; it is reported
    /// whether or not the broker is reachable.
    pub async fn publish_event<T: Serialize + ?Sized>(
        &self,
        ctx: &RequestContext,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), CourierError> {
        self.publish_event_with(ctx, routing_key, payload, &PublishOptions::default())
            .await
    }

    pub async fn publish_event_with<T: Serialize + ?Sized>(
        &self,
        ctx: &RequestContext,
        routing_key: &str,
        payload: &T,
        options: &PublishOptions,
    ) -> Result<(), CourierError> {
        let now = self.clock.now();
        let envelope = EventEnvelope::wrap(routing_key, now, self.service_name.as_str(), payload)?;
        let body = envelope.encode()?;

        let Some(live) = self.connection.current_channel() else {
            debug!(
                routing_key,
                request_id = ctx.request_id(),
                payload = %envelope.payload,
                "broker not connected, event not published"
            );
            return Ok(());
        };

        let mut headers = options.headers.clone();
        ctx.attach(&mut headers);

        let message_id = self.ids.message_id().to_string();
        let message = OutboundMessage {
            body,
            message_id: message_id.clone(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            timestamp: u64::try_from(now.timestamp()).unwrap_or(0),
            persistent: true,
            priority: options.priority.filter(|p| *p > 0),
            headers,
            mandatory: options.mandatory,
            immediate: options.immediate,
        };

        match live
            .channel
            .publish(self.connection.exchange(), routing_key, message)
            .await
        {
            Ok(()) => debug!(routing_key, message_id = %message_id, "published event"),
            Err(e) => warn!(
                routing_key,
                message_id = %message_id,
                generation = live.generation,
                error = %e,
                "failed to publish event"
            ),
        }
        Ok(())
    }
}
