//! Context - request id の伝搬と handler へ渡すコンテキスト

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use ulid::Ulid;

use crate::domain::{DeliveryContext, EventEnvelope, Headers, REQUEST_ID_HEADER};

/// Request id carried from a caller through published messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestContext {
    request_id: String,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }

    /// Fresh context with a random ULID request id.
    pub fn generate() -> Self {
        Self::new(Ulid::new().to_string())
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Pull the request id out of message headers, if one is present.
    pub fn extract(headers: &Headers) -> Option<Self> {
        headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .map(Self::new)
    }

    /// Write the request id into outgoing headers (overwrites).
    pub fn attach(&self, headers: &mut Headers) {
        headers.insert(REQUEST_ID_HEADER.to_string(), self.request_id.clone().into());
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::generate()
    }
}

/// Context of one handler invocation.
///
/// The deadline is advisory: the dispatcher never cancels a handler that
/// runs past it, handlers are expected to check `is_expired` or race
/// `expired()` themselves.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub request: RequestContext,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub service_name: String,
    deadline: Instant,
}

impl HandlerContext {
    pub(crate) fn for_delivery(
        delivery: &DeliveryContext,
        envelope: &EventEnvelope,
        timeout: Duration,
    ) -> Self {
        // ヘッダが無ければ message id で代用
        let request = RequestContext::extract(&delivery.headers)
            .unwrap_or_else(|| RequestContext::new(delivery.message_id.clone()));
        Self {
            request,
            event_type: envelope.event_type.clone(),
            occurred_at: envelope.occurred_at,
            service_name: envelope.service_name.clone(),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn request_id(&self) -> &str {
        self.request.request_id()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Resolves once the deadline has passed.
    pub async fn expired(&self) {
        tokio::time::sleep_until(self.deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HeaderValue;
    use chrono::TimeZone;

    fn delivery(headers: Headers) -> DeliveryContext {
        DeliveryContext {
            message_id: "msg-1".into(),
            routing_key: "region.created".into(),
            redelivered: false,
            delivery_tag: 1,
            headers,
        }
    }

    fn envelope() -> EventEnvelope {
        EventEnvelope {
            event_type: "region.created".into(),
            occurred_at: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            service_name: "location".into(),
            payload: serde_json::json!({ "id": 1 }),
        }
    }

    #[test]
    fn attach_then_extract() {
        let ctx = RequestContext::new("req-42");
        let mut headers = Headers::new();
        ctx.attach(&mut headers);
        assert_eq!(RequestContext::extract(&headers), Some(ctx));
    }

    #[test]
    fn extract_ignores_non_string_and_empty_values() {
        let mut headers = Headers::new();
        headers.insert(REQUEST_ID_HEADER.into(), HeaderValue::Int(7));
        assert_eq!(RequestContext::extract(&headers), None);

        headers.insert(REQUEST_ID_HEADER.into(), HeaderValue::from(""));
        assert_eq!(RequestContext::extract(&headers), None);
    }

    #[tokio::test]
    async fn request_id_falls_back_to_message_id() {
        let ctx = HandlerContext::for_delivery(
            &delivery(Headers::new()),
            &envelope(),
            Duration::from_secs(30),
        );
        assert_eq!(ctx.request_id(), "msg-1");
        assert_eq!(ctx.event_type, "region.created");
        assert_eq!(ctx.service_name, "location");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_after_timeout() {
        let ctx = HandlerContext::for_delivery(
            &delivery(Headers::new()),
            &envelope(),
            Duration::from_secs(30),
        );
        assert!(!ctx.is_expired());
        assert_eq!(ctx.remaining(), Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(ctx.remaining(), Duration::from_secs(20));

        ctx.expired().await;
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }
}
