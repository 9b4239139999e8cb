//! Dispatcher - 配信ループ
//!
//! One loop per connection generation. For each delivery:
//! decode → resolve handler → invoke → ack / nack.
//!
//! The handler is awaited inline, so a loop processes one message at a time
//! and settles it strictly after the handler returns.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use super::context::HandlerContext;
use super::registry::SubscriptionRegistry;
use crate::domain::{DeliveryContext, ErrorKind, EventEnvelope};
use crate::ports::{Acker, DeliveryStream, InboundDelivery};

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// nack, requeue
    Requeue,
    /// nack, no requeue (dropped or dead-lettered by the broker)
    Reject,
}

/// Upper bound on message ids with a pending failure count.
pub(crate) const TRACKED_FAILURES: usize = 10_000;

/// Per-consumer memory of message ids, shared by every dispatch loop so it
/// survives reconnects.
///
/// - failure counts feed `max_redeliveries` (only recorded when it is set)
/// - a bounded window of acknowledged ids feeds dedupe
///
/// Both are bounded: a requeued message may be finished by another consumer
/// on the same queue, so an entry is not guaranteed to be settled here.
#[derive(Default)]
pub(crate) struct DeliveryTracker {
    failures: Mutex<FailureCounts>,
    acked: Mutex<AckedWindow>,
}

#[derive(Default)]
struct AckedWindow {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl AckedWindow {
    fn insert(&mut self, id: &str) {
        if self.capacity == 0 || !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// Failure count per id, evicting the id first seen longest ago.
#[derive(Default)]
struct FailureCounts {
    capacity: usize,
    /// id → (failures, stamp of its entry in `order`)
    counts: HashMap<String, (u32, u64)>,
    order: VecDeque<(u64, String)>,
    next_stamp: u64,
}

impl FailureCounts {
    fn record(&mut self, id: &str) -> u32 {
        if let Some((count, _)) = self.counts.get_mut(id) {
            *count += 1;
            return *count;
        }
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.counts.insert(id.to_string(), (1, stamp));
        self.order.push_back((stamp, id.to_string()));

        while self.counts.len() > self.capacity {
            let Some((stamp, oldest)) = self.order.pop_front() else {
                break;
            };
            if self.counts.get(&oldest).is_some_and(|(_, s)| *s == stamp) {
                self.counts.remove(&oldest);
            }
        }
        // forget 済みの古い stamp が溜まったら詰める
        if self.order.len() > self.capacity.saturating_mul(2) {
            let counts = &self.counts;
            self.order
                .retain(|(stamp, id)| counts.get(id).is_some_and(|(_, s)| s == stamp));
        }
        1
    }

    fn forget(&mut self, id: &str) {
        self.counts.remove(id);
    }
}

impl DeliveryTracker {
    pub(crate) fn new(dedupe_window: Option<usize>, failure_capacity: usize) -> Self {
        Self {
            failures: Mutex::new(FailureCounts {
                capacity: failure_capacity.max(1),
                ..FailureCounts::default()
            }),
            acked: Mutex::new(AckedWindow {
                capacity: dedupe_window.unwrap_or(0),
                ..AckedWindow::default()
            }),
        }
    }

    fn already_acked(&self, message_id: &str) -> bool {
        self.acked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .contains(message_id)
    }

    /// Returns the failure count including this one.
    fn record_failure(&self, message_id: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(message_id)
    }

    fn record_acked(&self, message_id: &str) {
        self.forget(message_id);
        self.acked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_id);
    }

    fn forget(&self, message_id: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .forget(message_id);
    }

    #[cfg(test)]
    fn failure_entries(&self) -> usize {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .counts
            .len()
    }
}

pub(crate) struct Dispatcher {
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) tracker: Arc<DeliveryTracker>,
    pub(crate) handler_timeout: Duration,
    pub(crate) max_redeliveries: Option<u32>,
    pub(crate) generation: u64,
}

impl Dispatcher {
    /// Consume until the stream ends (channel gone) or shutdown is signalled.
    /// A delivery already taken off the stream is always settled first.
    pub(crate) async fn run(self, mut deliveries: DeliveryStream, mut shutdown: watch::Receiver<bool>) {
        debug!(generation = self.generation, "dispatch loop started");
        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                next = deliveries.next() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            self.dispatch(delivery).await;
        }
        debug!(generation = self.generation, "dispatch loop stopped");
    }

    pub(crate) async fn dispatch(&self, delivery: InboundDelivery) -> Disposition {
        let InboundDelivery {
            context,
            body,
            acker,
        } = delivery;
        let disposition = self.decide(&context, body).await;
        settle(acker.as_ref(), &context, disposition).await;
        disposition
    }

    async fn decide(&self, context: &DeliveryContext, body: Vec<u8>) -> Disposition {
        let envelope = match EventEnvelope::decode(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    kind = %ErrorKind::Protocol,
                    routing_key = %context.routing_key,
                    message_id = %context.message_id,
                    error = %e,
                    "dropping malformed message"
                );
                return Disposition::Reject;
            }
        };

        let tracked = !context.message_id.is_empty();
        if tracked && self.tracker.already_acked(&context.message_id) {
            debug!(message_id = %context.message_id, "duplicate delivery, acknowledging without dispatch");
            return Disposition::Ack;
        }

        let Some(resolved) = self.registry.resolve(&context.routing_key) else {
            warn!(
                kind = %ErrorKind::Configuration,
                routing_key = %context.routing_key,
                message_id = %context.message_id,
                "no handler registered for routing key"
            );
            return Disposition::Reject;
        };

        let payload = match envelope.payload_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind = %ErrorKind::Protocol, error = %e, "payload could not be re-encoded");
                return Disposition::Reject;
            }
        };

        let ctx = HandlerContext::for_delivery(context, &envelope, self.handler_timeout);
        let request_id = ctx.request_id().to_string();
        match resolved.handler.handle(ctx, context.clone(), payload).await {
            Ok(()) => {
                if tracked {
                    self.tracker.record_acked(&context.message_id);
                }
                debug!(
                    routing_key = %context.routing_key,
                    pattern = %resolved.pattern,
                    message_id = %context.message_id,
                    request_id = %request_id,
                    "event handled"
                );
                Disposition::Ack
            }
            Err(e) if !e.is_retryable() => {
                if tracked {
                    self.tracker.forget(&context.message_id);
                }
                warn!(
                    kind = %ErrorKind::Handler,
                    routing_key = %context.routing_key,
                    message_id = %context.message_id,
                    request_id = %request_id,
                    error = %e,
                    "handler rejected event permanently"
                );
                Disposition::Reject
            }
            Err(e) => {
                if let Some(max) = self.max_redeliveries
                    && tracked
                {
                    let failures = self.tracker.record_failure(&context.message_id);
                    if failures > max {
                        self.tracker.forget(&context.message_id);
                        warn!(
                            kind = %ErrorKind::Handler,
                            routing_key = %context.routing_key,
                            message_id = %context.message_id,
                            failures,
                            error = %e,
                            "redelivery limit reached, rejecting event"
                        );
                        return Disposition::Reject;
                    }
                }
                warn!(
                    kind = %ErrorKind::Handler,
                    routing_key = %context.routing_key,
                    message_id = %context.message_id,
                    request_id = %request_id,
                    redelivered = context.redelivered,
                    error = %e,
                    "handler failed, requeueing event"
                );
                Disposition::Requeue
            }
        }
    }
}

async fn settle(acker: &dyn Acker, context: &DeliveryContext, disposition: Disposition) {
    let result = match disposition {
        Disposition::Ack => acker.ack().await,
        Disposition::Requeue => acker.nack(true).await,
        Disposition::Reject => acker.nack(false).await,
    };
    // チャネルが落ちていれば broker 側で再キューされる
    if let Err(e) = result {
        warn!(
            delivery_tag = context.delivery_tag,
            message_id = %context.message_id,
            ?disposition,
            error = %e,
            "failed to settle delivery"
        );
    }
}
