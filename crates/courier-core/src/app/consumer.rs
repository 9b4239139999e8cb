//! Consumer - 購読の管理
//!
//! Holds the subscription registry and keeps the broker side (queue,
//! bindings, dispatch loop) in sync with it across reconnects:
//!
//! - every (re)connect runs the consumer's `ConnectHook`: QoS, queue
//!   declaration, the full registry bound, a fresh dispatch loop
//! - `subscribe` while connected binds the one new pattern right away
//! - `subscribe` while disconnected only records the handler
//!
//! A single async mutex (`Session`) serializes subscribe/unsubscribe with
//! the hook, so a pattern is never bound twice on one channel and only one
//! dispatch loop runs per connection generation.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::config::ConsumerOptions;
use super::connection::{ConnectHook, ConnectionManager, LiveChannel};
use super::dispatcher::{DeliveryTracker, Dispatcher, TRACKED_FAILURES};
use super::handler::{EventHandler, Handler, TypedHandler};
use super::registry::SubscriptionRegistry;
use crate::domain::CourierError;
use crate::ports::{BrokerError, IdGenerator, Prefetch, QueueSpec, SystemClock, UlidGenerator};

#[derive(Default)]
struct Session {
    /// Generation whose channel has the queue declared and the registry bound.
    ready_generation: Option<u64>,
    /// Generation the current dispatch loop consumes from.
    consuming: Option<u64>,
    /// Patterns this consumer has bound on the queue. Kept across
    /// reconnects: a durable queue keeps its bindings, so `prepare` unbinds
    /// the ones the registry no longer has.
    bound: BTreeSet<String>,
    loops: Vec<JoinHandle<()>>,
}

struct Inner {
    connection: ConnectionManager,
    options: ConsumerOptions,
    registry: Arc<SubscriptionRegistry>,
    tracker: Arc<DeliveryTracker>,
    ids: Arc<dyn IdGenerator>,
    session: Mutex<Session>,
    shutdown_tx: watch::Sender<bool>,
}

/// Cheap to clone; clones share the registry and the dispatch loop.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<Inner>,
}

impl Consumer {
    /// Create a consumer and attach it to `connection`'s reconnect cycle.
    ///
    /// Call before `ConnectionManager::connect`/`start` so the first
    /// connect already declares the queue.
    pub fn new(connection: ConnectionManager, options: ConsumerOptions) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            connection: connection.clone(),
            tracker: Arc::new(DeliveryTracker::new(options.dedupe_window, TRACKED_FAILURES)),
            options,
            registry: Arc::new(SubscriptionRegistry::new()),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            session: Mutex::new(Session::default()),
            shutdown_tx,
        });
        connection.add_hook(Arc::new(ConsumerHook {
            inner: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    pub fn queue(&self) -> &str {
        &self.inner.options.queue
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.inner.options
    }

    /// Register `handler` for `routing_key` (a topic pattern).
    ///
    /// Registering the same key again replaces the handler without adding
    /// a second binding. While disconnected the handler is only recorded
    /// and bound on the next connect.
    pub async fn subscribe(
        &self,
        routing_key: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), CourierError> {
        let inner = &self.inner;
        if inner.is_shut_down() {
            return Err(CourierError::Closed);
        }

        let mut session = inner.session.lock().await;
        let is_new = inner.registry.insert(routing_key, handler);
        info!(routing_key, queue = %inner.options.queue, replaced = !is_new, "subscribed");

        let Some(live) = inner.connection.current_channel() else {
            debug!(routing_key, "not connected, binding deferred until connect");
            return Ok(());
        };
        if session.ready_generation != Some(live.generation) {
            // 接続フックがこれから全体を bind する
            return Ok(());
        }

        if !session.bound.contains(routing_key) {
            if let Err(source) = live
                .channel
                .bind_queue(&inner.options.queue, inner.connection.exchange(), routing_key)
                .await
            {
                return inner.defer_if_lost(&mut session, routing_key, source, |source| {
                    CourierError::Bind {
                        queue: inner.options.queue.clone(),
                        pattern: routing_key.to_string(),
                        source,
                    }
                });
            }
            session.bound.insert(routing_key.to_string());
        }

        if let Err(source) = inner.start_consuming(&mut session, &live).await {
            return inner.defer_if_lost(&mut session, routing_key, source, |source| {
                CourierError::Consume {
                    queue: inner.options.queue.clone(),
                    source,
                }
            });
        }
        Ok(())
    }

    /// Subscribe a handler receiving the payload decoded into `E`.
    pub async fn subscribe_typed<E, H>(&self, routing_key: &str, handler: H) -> Result<(), CourierError>
    where
        E: DeserializeOwned + Send + 'static,
        H: Handler<E> + 'static,
    {
        self.subscribe(routing_key, Arc::new(TypedHandler::<E, H>::new(handler)))
            .await
    }

    /// Remove the handler for `routing_key` and unbind it from the live
    /// channel. Returns whether it was registered.
    ///
    /// While disconnected the binding is removed by the next connect.
    pub async fn unsubscribe(&self, routing_key: &str) -> Result<bool, CourierError> {
        let inner = &self.inner;
        let mut session = inner.session.lock().await;

        // 未接続なら bound に残し、次の接続で prepare が unbind する
        if session.bound.contains(routing_key)
            && let Some(live) = inner.connection.current_channel()
            && session.ready_generation == Some(live.generation)
        {
            match live
                .channel
                .unbind_queue(&inner.options.queue, inner.connection.exchange(), routing_key)
                .await
            {
                Ok(()) => {
                    session.bound.remove(routing_key);
                }
                Err(source) => {
                    inner.defer_if_lost(&mut session, routing_key, source, |source| {
                        CourierError::Bind {
                            queue: inner.options.queue.clone(),
                            pattern: routing_key.to_string(),
                            source,
                        }
                    })?;
                }
            }
        }

        let removed = inner.registry.remove(routing_key);
        if removed {
            info!(routing_key, queue = %inner.options.queue, "unsubscribed");
        }
        Ok(removed)
    }

    /// Registered patterns, sorted.
    pub fn registered_keys(&self) -> Vec<String> {
        self.inner.registry.keys()
    }

    /// Stop dispatching. In-flight handlers finish and their deliveries are
    /// settled before this returns. The connection itself stays open.
    ///
    /// `ConnectionManager::close` calls this for every attached consumer.
    pub async fn close(&self) {
        self.inner.drain().await;
    }
}

impl Inner {
    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn queue_spec(&self) -> QueueSpec {
        QueueSpec {
            name: self.options.queue.clone(),
            durable: self.options.durable,
            auto_delete: self.options.auto_delete,
            exclusive: self.options.exclusive,
            dead_letter_exchange: self.options.dead_letter_exchange.clone(),
        }
    }

    /// Bring a fresh channel up to date with the registry.
    async fn prepare(&self, session: &mut Session, live: &LiveChannel) -> Result<(), BrokerError> {
        if self.is_shut_down() {
            return Ok(());
        }
        let channel = &live.channel;
        let queue = &self.options.queue;

        session.ready_generation = None;

        channel
            .set_prefetch(Prefetch {
                count: self.options.prefetch_count,
                global: self.options.prefetch_global,
            })
            .await?;
        channel.declare_queue(&self.queue_spec()).await?;

        let stale: Vec<String> = session
            .bound
            .iter()
            .filter(|pattern| !self.registry.contains(pattern))
            .cloned()
            .collect();
        for pattern in stale {
            channel
                .unbind_queue(queue, self.connection.exchange(), &pattern)
                .await?;
            debug!(pattern = %pattern, queue = %queue, "removed stale binding");
            session.bound.remove(&pattern);
        }

        for pattern in self.registry.keys() {
            channel
                .bind_queue(queue, self.connection.exchange(), &pattern)
                .await?;
            session.bound.insert(pattern);
        }
        session.ready_generation = Some(live.generation);

        if !self.registry.is_empty() {
            self.start_consuming(session, live).await?;
        }
        info!(
            generation = live.generation,
            queue = %queue,
            bindings = session.bound.len(),
            "consumer ready"
        );
        Ok(())
    }

    /// Start the dispatch loop for `live` unless one already runs on it.
    async fn start_consuming(&self, session: &mut Session, live: &LiveChannel) -> Result<(), BrokerError> {
        if session.consuming == Some(live.generation) || self.is_shut_down() {
            return Ok(());
        }

        let tag = self.ids.consumer_tag().to_string();
        let deliveries = live.channel.consume(&self.options.queue, &tag).await?;
        let dispatcher = Dispatcher {
            registry: Arc::clone(&self.registry),
            tracker: Arc::clone(&self.tracker),
            handler_timeout: self.options.handler_timeout,
            max_redeliveries: self.options.max_redeliveries,
            generation: live.generation,
        };
        let handle = tokio::spawn(dispatcher.run(deliveries, self.shutdown_tx.subscribe()));

        session.loops.retain(|l| !l.is_finished());
        session.loops.push(handle);
        session.consuming = Some(live.generation);
        info!(
            generation = live.generation,
            queue = %self.options.queue,
            consumer_tag = %tag,
            "started consuming"
        );
        Ok(())
    }

    /// A broker call on a channel that just died is retried by the next
    /// connect's `prepare`; anything else is returned to the caller.
    fn defer_if_lost(
        &self,
        session: &mut Session,
        routing_key: &str,
        source: BrokerError,
        to_error: impl FnOnce(BrokerError) -> CourierError,
    ) -> Result<(), CourierError> {
        if !source.is_connectivity() {
            return Err(to_error(source));
        }
        session.ready_generation = None;
        debug!(
            routing_key,
            queue = %self.options.queue,
            error = %source,
            "channel lost, deferring until reconnect"
        );
        Ok(())
    }

    async fn drain(&self) {
        self.shutdown_tx.send_replace(true);
        let loops = {
            let mut session = self.session.lock().await;
            session.consuming = None;
            std::mem::take(&mut session.loops)
        };
        for handle in loops {
            let _ = handle.await;
        }
        debug!(queue = %self.options.queue, "consumer drained");
    }
}

/// Registered on the connection manager. Weak so a dropped consumer does
/// not stay alive through the manager's hook list.
struct ConsumerHook {
    inner: Weak<Inner>,
}

#[async_trait]
impl ConnectHook for ConsumerHook {
    async fn on_connect(&self, live: &LiveChannel) -> Result<(), BrokerError> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        let mut session = inner.session.lock().await;
        inner.prepare(&mut session, live).await
    }

    async fn on_close(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.drain().await;
        }
    }
}
