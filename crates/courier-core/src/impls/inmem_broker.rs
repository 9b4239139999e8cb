//! InMemoryBroker - in-process topic broker for tests and the demo mode.
//!
//! Models the parts of AMQP 0-9-1 the client relies on:
//! - topic exchanges, durable / exclusive queues, bindings (`*` / `#`)
//! - per-consumer prefetch and round-robin dispatch
//! - ack / nack, the redelivered flag, dead-letter exchanges
//! - unacked messages go back to their queue when a connection drops
//!
//! Fault injection: `set_online`, `sever_connections`, `restart`.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::domain::{DeliveryContext, Headers, TopicPattern};
use crate::ports::{
    Acker, Broker, BrokerChannel, BrokerError, DeliveryStream, ExchangeSpec, InboundDelivery,
    OutboundMessage, Prefetch, QueueSpec,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    message_id: String,
    headers: Headers,
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    connection: u64,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<InboundDelivery>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct Unacked {
    message: StoredMessage,
    consumer_tag: String,
    connection: u64,
}

struct QueueState {
    spec: QueueSpec,
    /// Connection owning an exclusive queue.
    owner: Option<u64>,
    /// (exchange, pattern)
    bindings: BTreeSet<(String, String)>,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

impl QueueState {
    fn new(spec: QueueSpec, owner: Option<u64>) -> Self {
        Self {
            spec,
            owner,
            bindings: BTreeSet::new(),
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    fn release_slot(&mut self, consumer_tag: &str) {
        if let Some(slot) = self.consumers.iter_mut().find(|c| c.tag == consumer_tag) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
    }
}

#[derive(Default)]
struct BrokerState {
    online: bool,
    next_connection: u64,
    next_tag: u64,
    connections: HashMap<u64, watch::Sender<Option<String>>>,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    dial_attempts: Vec<Instant>,
    published: usize,
    unroutable: usize,
    dropped: usize,
    dead_lettered: usize,
}

struct Shared {
    me: Weak<Shared>,
    state: Mutex<BrokerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BrokerState {
    fn is_alive(&self, connection: u64) -> bool {
        self.connections.contains_key(&connection)
    }

    /// Copy a message into every queue bound to `exchange` with a matching
    /// pattern. Each queue receives at most one copy. Returns touched queues.
    fn route(&mut self, exchange: &str, message: &StoredMessage) -> Vec<String> {
        let mut touched = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let matched = queue.bindings.iter().any(|(ex, pattern)| {
                ex == exchange && TopicPattern::new(pattern.as_str()).matches(&message.routing_key)
            });
            if matched {
                queue.ready.push_back(message.clone());
                touched.push(name.clone());
            }
        }
        touched
    }

    /// Hand ready messages to consumers that have prefetch capacity.
    fn pump(&mut self, queue_name: &str, shared: &Weak<Shared>) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() && !queue.consumers.is_empty() {
            let n = queue.consumers.len();
            let Some(idx) = (0..n)
                .map(|i| (queue.cursor + i) % n)
                .find(|&idx| queue.consumers[idx].has_capacity())
            else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let slot = &mut queue.consumers[idx];
            let delivery = InboundDelivery {
                context: DeliveryContext {
                    message_id: message.message_id.clone(),
                    routing_key: message.routing_key.clone(),
                    redelivered: message.redelivered,
                    delivery_tag: tag,
                    headers: message.headers.clone(),
                },
                body: message.body.clone(),
                acker: Box::new(MemoryAcker {
                    shared: shared.clone(),
                    queue: queue_name.to_string(),
                    tag,
                    connection: slot.connection,
                }),
            };

            if slot.sender.send(delivery).is_err() {
                // 受信側が drop 済み: consumer を外して戻す
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                continue;
            }

            slot.in_flight += 1;
            let unacked = Unacked {
                message,
                consumer_tag: slot.tag.clone(),
                connection: slot.connection,
            };
            queue.unacked.insert(tag, unacked);
            queue.cursor = (idx + 1) % n;
        }
    }

    /// Drop a connection: notify watchers, cancel its consumers, requeue
    /// its unacked messages, delete its exclusive queues.
    fn sever(&mut self, connection: u64, reason: &str, shared: &Weak<Shared>) {
        let Some(closed) = self.connections.remove(&connection) else {
            return;
        };
        let _ = closed.send(Some(reason.to_string()));

        self.queues
            .retain(|_, q| !(q.spec.exclusive && q.owner == Some(connection)));

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in &names {
            let Some(queue) = self.queues.get_mut(name) else {
                continue;
            };
            queue.consumers.retain(|c| c.connection != connection);

            let mut orphaned: Vec<(u64, StoredMessage)> = Vec::new();
            queue.unacked.retain(|tag, u| {
                if u.connection == connection {
                    orphaned.push((*tag, u.message.clone()));
                    false
                } else {
                    true
                }
            });
            // 古い tag が先頭に来るように戻す
            orphaned.sort_by_key(|(tag, _)| *tag);
            for (_, mut message) in orphaned.into_iter().rev() {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
        for name in &names {
            self.pump(name, shared);
        }
    }

    fn settle(
        &mut self,
        queue_name: &str,
        tag: u64,
        connection: u64,
        requeue: Option<bool>,
        shared: &Weak<Shared>,
    ) -> Result<(), BrokerError> {
        if !self.is_alive(connection) {
            return Err(BrokerError::ChannelClosed);
        }
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue_name}'")))?;
        let Some(entry) = queue.unacked.remove(&tag) else {
            return Err(BrokerError::Protocol(format!("unknown delivery tag {tag}")));
        };
        queue.release_slot(&entry.consumer_tag);

        let mut touched = vec![queue_name.to_string()];
        match requeue {
            None => {}
            Some(true) => {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            Some(false) => match queue.spec.dead_letter_exchange.clone() {
                Some(dlx) => {
                    let mut message = entry.message;
                    message.redelivered = false;
                    self.dead_lettered += 1;
                    touched.extend(self.route(&dlx, &message));
                }
                None => self.dropped += 1,
            },
        }
        for name in touched {
            self.pump(&name, shared);
        }
        Ok(())
    }
}

/// In-process broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            state: Mutex::new(BrokerState {
                online: true,
                ..BrokerState::default()
            }),
        });
        Self { shared }
    }

    /// While offline every dial fails with a connection error.
    pub fn set_online(&self, online: bool) {
        self.shared.lock().online = online;
    }

    pub fn is_online(&self) -> bool {
        self.shared.lock().online
    }

    /// Drop every open connection, as if the network went away.
    pub fn sever_connections(&self) {
        let mut state = self.shared.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.sever(id, "connection reset by broker", &self.shared.me);
        }
    }

    /// Sever all connections and forget every exchange, every binding, and
    /// every non-durable queue. Durable queues keep their messages.
    pub fn restart(&self) {
        let mut state = self.shared.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.sever(id, "broker restarted", &self.shared.me);
        }
        state.exchanges.clear();
        state.queues.retain(|_, q| q.spec.durable);
        for queue in state.queues.values_mut() {
            queue.bindings.clear();
        }
    }

    /// Inject a raw message as if some other publisher sent it.
    pub fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        message_id: &str,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
        }
        let message = StoredMessage {
            routing_key: routing_key.to_string(),
            message_id: message_id.to_string(),
            headers: Headers::new(),
            body,
            redelivered: false,
        };
        state.published += 1;
        let touched = state.route(exchange, &message);
        if touched.is_empty() {
            state.unroutable += 1;
        }
        for name in touched {
            state.pump(&name, &self.shared.me);
        }
        Ok(())
    }

    pub fn dial_attempts(&self) -> Vec<Instant> {
        self.shared.lock().dial_attempts.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.shared.lock().connections.len()
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.shared.lock().exchanges.contains_key(name)
    }

    /// Patterns bound to `queue`, sorted.
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.bindings.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Messages waiting for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    pub fn published(&self) -> usize {
        self.shared.lock().published
    }

    pub fn unroutable(&self) -> usize {
        self.shared.lock().unroutable
    }

    /// Messages rejected without requeue on a queue that has no DLX.
    pub fn dropped(&self) -> usize {
        self.shared.lock().dropped
    }

    /// Messages rejected without requeue and rerouted to a DLX.
    pub fn dead_lettered(&self) -> usize {
        self.shared.lock().dead_lettered
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = self.shared.lock();
        state.dial_attempts.push(Instant::now());
        if !state.online {
            return Err(BrokerError::Connection("connection refused".into()));
        }

        state.next_connection += 1;
        let id = state.next_connection;
        let (closed_tx, closed_rx) = watch::channel(None);
        state.connections.insert(id, closed_tx);

        Ok(Arc::new(InMemoryChannel {
            shared: Arc::clone(&self.shared),
            connection: id,
            closed_rx,
            prefetch: Mutex::new(Prefetch {
                count: 0,
                global: false,
            }),
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct InMemoryChannel {
    shared: Arc<Shared>,
    connection: u64,
    closed_rx: watch::Receiver<Option<String>>,
    prefetch: Mutex<Prefetch>,
}

impl InMemoryChannel {
    fn live_state(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let state = self.shared.lock();
        if state.is_alive(self.connection) {
            Ok(state)
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let mut state = self.live_state()?;
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(BrokerError::Protocol(format!(
                "PRECONDITION_FAILED - inequivalent arguments for exchange '{}'",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let mut state = self.live_state()?;
        if let Some(existing) = state.queues.get(&spec.name) {
            if existing.spec.exclusive && existing.owner != Some(self.connection) {
                return Err(BrokerError::Protocol(format!(
                    "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                    spec.name
                )));
            }
            return Ok(());
        }
        let owner = spec.exclusive.then_some(self.connection);
        state
            .queues
            .insert(spec.name.clone(), QueueState::new(spec.clone(), owner));
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.live_state()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
        }
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?;
        q.bindings
            .insert((exchange.to_string(), pattern.to_string()));
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.live_state()?;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?;
        q.bindings
            .remove(&(exchange.to_string(), pattern.to_string()));
        Ok(())
    }

    async fn set_prefetch(&self, prefetch: Prefetch) -> Result<(), BrokerError> {
        let _state = self.live_state()?;
        *self.prefetch.lock().unwrap_or_else(PoisonError::into_inner) = prefetch;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        let mut state = self.live_state()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
        }
        let stored = StoredMessage {
            routing_key: routing_key.to_string(),
            message_id: message.message_id,
            headers: message.headers,
            body: message.body,
            redelivered: false,
        };
        state.published += 1;
        let touched = state.route(exchange, &stored);
        if touched.is_empty() {
            state.unroutable += 1;
        }
        for name in touched {
            state.pump(&name, &self.shared.me);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let prefetch = self
            .prefetch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .count;
        let mut state = self.live_state()?;
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?;
        if q.consumers.iter().any(|c| c.tag == consumer_tag) {
            return Err(BrokerError::Protocol(format!(
                "NOT_ALLOWED - duplicate consumer tag '{consumer_tag}'"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        q.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_string(),
            connection: self.connection,
            prefetch,
            in_flight: 0,
            sender: tx,
        });
        state.pump(queue, &self.shared.me);

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    fn is_open(&self) -> bool {
        self.shared.lock().is_alive(self.connection)
    }

    async fn closed(&self) -> String {
        let mut rx = self.closed_rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "broker dropped".to_string();
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        state.sever(self.connection, "closed by client", &self.shared.me);
        Ok(())
    }
}

struct MemoryAcker {
    shared: Weak<Shared>,
    queue: String,
    tag: u64,
    connection: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        let shared = self.shared.upgrade().ok_or(BrokerError::ChannelClosed)?;
        let mut state = shared.lock();
        state.settle(&self.queue, self.tag, self.connection, requeue, &shared.me)
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(Some(requeue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn durable(name: &str) -> QueueSpec {
        QueueSpec {
            name: name.to_string(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            dead_letter_exchange: None,
        }
    }

    fn message(body: &[u8]) -> OutboundMessage {
        OutboundMessage {
            body: body.to_vec(),
            message_id: "m-1".into(),
            content_type: "application/json".into(),
            timestamp: 0,
            persistent: true,
            priority: None,
            headers: Headers::new(),
            mandatory: false,
            immediate: false,
        }
    }

    async fn setup(broker: &InMemoryBroker) -> Arc<dyn BrokerChannel> {
        let ch = broker.connect().await.unwrap();
        ch.declare_exchange(&ExchangeSpec::topic("events")).await.unwrap();
        ch.declare_queue(&durable("q")).await.unwrap();
        ch
    }

    #[tokio::test]
    async fn routes_by_pattern_once_per_queue() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker).await;
        ch.bind_queue("q", "events", "region.*").await.unwrap();
        ch.bind_queue("q", "events", "region.created").await.unwrap();
        ch.bind_queue("q", "events", "region.*").await.unwrap();

        ch.publish("events", "region.created", message(b"{}")).await.unwrap();
        ch.publish("events", "city.created", message(b"{}")).await.unwrap();

        assert_eq!(broker.bindings("q"), vec!["region.*", "region.created"]);
        assert_eq!(broker.queue_depth("q"), 1);
        assert_eq!(broker.unroutable(), 1);
    }

    #[tokio::test]
    async fn nack_requeue_sets_redelivered() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker).await;
        ch.bind_queue("q", "events", "#").await.unwrap();
        ch.set_prefetch(Prefetch { count: 1, global: false }).await.unwrap();
        ch.publish("events", "a", message(b"1")).await.unwrap();

        let mut stream = ch.consume("q", "c1").await.unwrap();
        let first = stream.next().await.unwrap();
        assert!(!first.context.redelivered);
        first.acker.nack(true).await.unwrap();

        let second = stream.next().await.unwrap();
        assert!(second.context.redelivered);
        assert_eq!(second.context.message_id, "m-1");
        second.acker.ack().await.unwrap();
        assert_eq!(broker.unacked_count("q"), 0);
    }

    #[tokio::test]
    async fn prefetch_limits_in_flight() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker).await;
        ch.bind_queue("q", "events", "#").await.unwrap();
        ch.set_prefetch(Prefetch { count: 1, global: false }).await.unwrap();
        for _ in 0..3 {
            ch.publish("events", "a", message(b"x")).await.unwrap();
        }

        let _stream = ch.consume("q", "c1").await.unwrap();
        assert_eq!(broker.unacked_count("q"), 1);
        assert_eq!(broker.queue_depth("q"), 2);
    }

    #[tokio::test]
    async fn sever_requeues_unacked_and_ends_streams() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker).await;
        ch.bind_queue("q", "events", "#").await.unwrap();
        ch.publish("events", "a", message(b"x")).await.unwrap();

        let mut stream = ch.consume("q", "c1").await.unwrap();
        let delivery = stream.next().await.unwrap();

        broker.sever_connections();
        assert!(!ch.is_open());
        assert_eq!(ch.closed().await, "connection reset by broker");
        assert!(stream.next().await.is_none());
        assert_eq!(delivery.acker.ack().await, Err(BrokerError::ChannelClosed));
        assert_eq!(broker.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn nack_without_requeue_goes_to_dlx() {
        let broker = InMemoryBroker::new();
        let ch = broker.connect().await.unwrap();
        ch.declare_exchange(&ExchangeSpec::topic("events")).await.unwrap();
        ch.declare_exchange(&ExchangeSpec::topic("events.dlx")).await.unwrap();
        let mut spec = durable("q");
        spec.dead_letter_exchange = Some("events.dlx".into());
        ch.declare_queue(&spec).await.unwrap();
        ch.declare_queue(&durable("parking")).await.unwrap();
        ch.bind_queue("q", "events", "#").await.unwrap();
        ch.bind_queue("parking", "events.dlx", "#").await.unwrap();

        ch.publish("events", "a.b", message(b"x")).await.unwrap();
        let mut stream = ch.consume("q", "c1").await.unwrap();
        stream.next().await.unwrap().acker.nack(false).await.unwrap();

        assert_eq!(broker.dead_lettered(), 1);
        assert_eq!(broker.queue_depth("parking"), 1);
    }

    #[tokio::test]
    async fn offline_broker_refuses_dials() {
        let broker = InMemoryBroker::new();
        broker.set_online(false);
        assert!(matches!(broker.connect().await, Err(BrokerError::Connection(_))));
        assert_eq!(broker.dial_attempts().len(), 1);
    }

    #[tokio::test]
    async fn restart_forgets_exchanges_and_bindings() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker).await;
        ch.bind_queue("q", "events", "#").await.unwrap();

        broker.restart();
        assert!(!broker.exchange_exists("events"));
        assert!(broker.bindings("q").is_empty());
        assert_eq!(broker.open_connections(), 0);
    }
}
