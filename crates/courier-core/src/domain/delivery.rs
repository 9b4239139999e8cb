//! Per-message metadata handed to handlers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Header carrying the request id across services.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// A header value that maps onto an AMQP field-table entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// Metadata of one delivery, valid for a single handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryContext {
    /// Publisher-assigned message id (empty when the publisher set none).
    pub message_id: String,
    pub routing_key: String,
    /// Set by the broker when this message was delivered before and requeued.
    pub redelivered: bool,
    pub delivery_tag: u64,
    pub headers: Headers,
}

impl DeliveryContext {
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }
}
