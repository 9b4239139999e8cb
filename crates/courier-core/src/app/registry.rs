//! SubscriptionRegistry - routing key pattern → handler の対応表
//!
//! Lives for the whole lifetime of a consumer, independent of any channel,
//! and is replayed onto every new connection.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::handler::EventHandler;
use crate::domain::TopicPattern;

/// Handler resolved for one routing key.
#[derive(Clone)]
pub struct Resolved {
    /// The registered pattern that won.
    pub pattern: String,
    pub handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `pattern`. Last registration wins.
    ///
    /// Returns `true` when the pattern was not registered before.
    pub fn insert(&self, pattern: impl Into<String>, handler: Arc<dyn EventHandler>) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.insert(pattern.into(), handler).is_none()
    }

    /// Returns `true` when the pattern was registered.
    pub fn remove(&self, pattern: &str) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers.remove(pattern).is_some()
    }

    pub fn contains(&self, pattern: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.contains_key(pattern)
    }

    /// Find the handler for a concrete routing key.
    ///
    /// An exact registration wins. Otherwise the most specific matching
    /// pattern: fewest wildcards, then fewest `#`, then longest, then
    /// lexicographic order.
    pub fn resolve(&self, routing_key: &str) -> Option<Resolved> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(handler) = handlers.get(routing_key) {
            return Some(Resolved {
                pattern: routing_key.to_string(),
                handler: Arc::clone(handler),
            });
        }

        handlers
            .iter()
            .map(|(pattern, handler)| (TopicPattern::new(pattern.as_str()), handler))
            .filter(|(pattern, _)| !pattern.is_exact() && pattern.matches(routing_key))
            .min_by_key(|(pattern, _)| {
                (
                    pattern.wildcard_count(),
                    pattern.as_str().split('.').filter(|w| *w == "#").count(),
                    Reverse(pattern.as_str().len()),
                    pattern.as_str().to_string(),
                )
            })
            .map(|(pattern, handler)| Resolved {
                pattern: pattern.as_str().to_string(),
                handler: Arc::clone(handler),
            })
    }

    /// Registered patterns, sorted.
    pub fn keys(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
