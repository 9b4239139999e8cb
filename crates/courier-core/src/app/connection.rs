//! ConnectionManager - 接続ライフサイクルの管理
//!
//! Owns the single logical connection + channel shared by a publisher and a
//! consumer.
//!
//! # 状態遷移
//! ```text
//! Disconnected -> Connecting -> Connected
//!      ^                            |
//!      +---- (unexpected close) ----+
//! any -> Closing -> Closed          (close() only)
//! ```
//!
//! # Background tasks
//! - reconnect loop: at most one at a time (guarded by `reconnecting`)
//! - close watcher: one per connection generation
//!
//! Both observe the shutdown watch channel; `close()` joins them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backoff::{Backoff, BackoffPolicy};
use crate::domain::{ConnectionState, CourierError};
use crate::ports::{Broker, BrokerChannel, BrokerError, ExchangeSpec};

/// The channel of one successful (re)connect.
#[derive(Clone)]
pub struct LiveChannel {
    /// Increases by one on every successful (re)connect.
    pub generation: u64,
    pub channel: Arc<dyn BrokerChannel>,
}

/// Work re-run after every (re)connect, once the exchange is declared.
///
/// An error from `on_connect` drops the new connection and sends the
/// manager back into the reconnect loop.
#[async_trait]
pub trait ConnectHook: Send + Sync {
    async fn on_connect(&self, live: &LiveChannel) -> Result<(), BrokerError>;

    /// Called by `close()` after shutdown is signalled and before the
    /// channel is torn down.
    async fn on_close(&self) {}
}

struct Inner {
    broker: Option<Arc<dyn Broker>>,
    exchange: ExchangeSpec,
    policy: BackoffPolicy,
    live: RwLock<Option<LiveChannel>>,
    generation: AtomicU64,
    reconnecting: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    hooks: RwLock<Vec<Arc<dyn ConnectHook>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes dial attempts (`connect()` vs. the reconnect loop).
    dial_lock: tokio::sync::Mutex<()>,
}

/// Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, exchange: impl Into<String>, policy: BackoffPolicy) -> Self {
        Self::build(Some(broker), exchange.into(), policy)
    }

    /// A manager that never dials. Publishing through it is a no-op and
    /// subscribing only records handlers.
    pub fn disabled(exchange: impl Into<String>) -> Self {
        Self::build(None, exchange.into(), BackoffPolicy::default())
    }

    fn build(broker: Option<Arc<dyn Broker>>, exchange: String, policy: BackoffPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                broker,
                exchange: ExchangeSpec::topic(exchange),
                policy,
                live: RwLock::new(None),
                generation: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
                state_tx,
                shutdown_tx,
                hooks: RwLock::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                dial_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.broker.is_some()
    }

    pub fn exchange(&self) -> &str {
        &self.inner.exchange.name
    }

    /// Register work to run after every (re)connect. If the manager is
    /// already connected the hook first runs on the next reconnect; callers
    /// needing it now apply it to `current_channel()` themselves.
    pub fn add_hook(&self, hook: Arc<dyn ConnectHook>) {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
    }

    /// Dial once. No-op when already connected.
    ///
    /// On failure the error is returned and a background reconnect loop
    /// keeps trying.
    pub async fn connect(&self) -> Result<(), CourierError> {
        if self.inner.is_shut_down() {
            return Err(CourierError::Closed);
        }
        if !self.is_enabled() {
            return Err(CourierError::Disabled);
        }
        if self.is_connected() {
            return Ok(());
        }

        match self.inner.establish().await {
            Ok(_) => Ok(()),
            Err(CourierError::Closed) => Err(CourierError::Closed),
            Err(e) => {
                error!(error = %e, "failed to connect to broker");
                self.inner.spawn_reconnect();
                Err(e)
            }
        }
    }

    /// Like `connect`, but failures are only logged. Used at startup so an
    /// unavailable broker never prevents the service from coming up.
    pub async fn start(&self) {
        if !self.is_enabled() {
            warn!(
                exchange = %self.exchange(),
                "no broker URL configured, events will not be published or consumed"
            );
            return;
        }
        let _ = self.connect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Generation of the most recent successful connect (0 = never).
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Snapshot of the live channel. The lock is released before returning.
    pub fn current_channel(&self) -> Option<LiveChannel> {
        self.inner.current()
    }

    /// Terminal shutdown.
    ///
    /// Stops reconnecting, lets hooks drain (`on_close`), closes the
    /// channel, and returns after every background task has stopped.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.state_tx.borrow().is_terminal() {
            return;
        }
        inner.state_tx.send_replace(ConnectionState::Closing);
        inner.shutdown_tx.send_replace(true);

        for hook in inner.hooks_snapshot() {
            hook.on_close().await;
        }

        // 実行中の dial が終わるのを待ってからチャネルを外す
        let live = {
            let _dial = inner.dial_lock.lock().await;
            inner.live.write().unwrap_or_else(PoisonError::into_inner).take()
        };
        if let Some(live) = live
            && let Err(e) = live.channel.close().await
        {
            debug!(generation = live.generation, error = %e, "error while closing channel");
        }

        let tasks = std::mem::take(&mut *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            let _ = task.await;
        }

        inner.state_tx.send_replace(ConnectionState::Closed);
        info!(exchange = %inner.exchange.name, "broker connection closed");
    }
}

impl Inner {
    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn current(&self) -> Option<LiveChannel> {
        self.live.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn hooks_snapshot(&self) -> Vec<Arc<dyn ConnectHook>> {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Terminal states are never left.
    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Take the live channel if it still belongs to `generation`.
    fn take_live(&self, generation: u64) -> Option<LiveChannel> {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        match live.as_ref() {
            Some(current) if current.generation == generation => live.take(),
            _ => None,
        }
    }

    /// Dial, declare the exchange, swap in the new channel, run hooks.
    async fn establish(self: &Arc<Self>) -> Result<u64, CourierError> {
        let Some(broker) = self.broker.as_ref() else {
            return Err(CourierError::Disabled);
        };

        let _dial = self.dial_lock.lock().await;
        if self.is_shut_down() {
            return Err(CourierError::Closed);
        }
        if let Some(live) = self.current()
            && self.state_tx.borrow().is_connected()
        {
            return Ok(live.generation);
        }

        self.set_state(ConnectionState::Connecting);
        let mut shutdown = self.shutdown_tx.subscribe();
        let dialed = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => return Err(CourierError::Closed),
            result = broker.connect() => result,
        };
        let channel = match dialed {
            Ok(channel) => channel,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(CourierError::Connection(e));
            }
        };

        if let Err(e) = channel.declare_exchange(&self.exchange).await {
            let _ = channel.close().await;
            self.set_state(ConnectionState::Disconnected);
            return Err(CourierError::Connection(e));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let live = LiveChannel {
            generation,
            channel,
        };
        *self.live.write().unwrap_or_else(PoisonError::into_inner) = Some(live.clone());
        self.spawn_watcher(live.clone());

        for hook in self.hooks_snapshot() {
            if let Err(e) = hook.on_connect(&live).await {
                warn!(generation, error = %e, "connect hook failed, dropping connection");
                if let Some(lost) = self.take_live(generation) {
                    let _ = lost.channel.close().await;
                }
                self.set_state(ConnectionState::Disconnected);
                return Err(CourierError::Connection(e));
            }
        }

        // hook 実行中に切断されていたら watcher が live を外している
        {
            let current = self.live.read().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref().map(|l| l.generation) != Some(generation) {
                drop(current);
                warn!(generation, "connection lost while running connect hooks");
                return Err(CourierError::Connection(BrokerError::ChannelClosed));
            }
            self.set_state(ConnectionState::Connected);
        }
        info!(
            generation,
            broker = %broker.describe(),
            exchange = %self.exchange.name,
            "connected to broker"
        );
        Ok(generation)
    }

    fn spawn_watcher(self: &Arc<Self>, live: LiveChannel) {
        let inner = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                reason = live.channel.closed() => inner.handle_lost(live.generation, &reason).await,
                _ = wait_for_shutdown(&mut shutdown) => {}
            }
        });
        self.track(handle);
    }

    /// Idempotent per generation: a stale or repeated notification is ignored.
    async fn handle_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        if self.is_shut_down() {
            return;
        }
        let Some(lost) = self.take_live(generation) else {
            return;
        };
        warn!(generation, reason, "broker connection lost");
        self.set_state(ConnectionState::Disconnected);
        let _ = lost.channel.close().await;
        self.spawn_reconnect();
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.is_shut_down() || self.broker.is_none() {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("reconnect loop already running");
            return;
        }
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.reconnect_loop().await });
        self.track(handle);
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            let mut backoff = Backoff::new(self.policy);
            loop {
                if self.is_shut_down() {
                    break;
                }
                let delay = backoff.next_delay();
                info!(delay_ms = delay.as_millis() as u64, "reconnecting to broker");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_for_shutdown(&mut shutdown) => break,
                }

                match self.establish().await {
                    Ok(generation) => {
                        info!(generation, "reconnected to broker");
                        break;
                    }
                    Err(CourierError::Closed) => break,
                    Err(e) => warn!(error = %e, "reconnect attempt failed"),
                }
            }

            self.reconnecting.store(false, Ordering::SeqCst);

            // 成功直後に切断された場合、watcher はこのループを起動できていない
            let lost_meanwhile = !self.is_shut_down() && self.current().is_none();
            if lost_meanwhile && !self.reconnecting.swap(true, Ordering::SeqCst) {
                continue;
            }
            return;
        }
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    // sender は Inner が保持しているので Err にはならない
    let _ = rx.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryBroker;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn manager(broker: &InMemoryBroker) -> ConnectionManager {
        ConnectionManager::new(Arc::new(broker.clone()), "events", BackoffPolicy::default())
    }

    async fn wait_connected(manager: &ConnectionManager, generation: u64) {
        let mut rx = manager.subscribe_state();
        loop {
            if manager.is_connected() && manager.generation() >= generation {
                return;
            }
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert!(manager.is_connected());
        assert_eq!(manager.generation(), 1);
        assert_eq!(broker.dial_attempts().len(), 1);
        assert!(broker.exchange_exists("events"));
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_connection_loss() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await.unwrap();

        broker.restart();
        wait_connected(&manager, 2).await;

        assert_eq!(manager.current_channel().unwrap().generation, 2);
        assert!(broker.exchange_exists("events"));
        assert_eq!(broker.open_connections(), 1);
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_keeps_retrying_in_background() {
        let broker = InMemoryBroker::new();
        broker.set_online(false);
        let manager = manager(&broker);

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, CourierError::Connection(_)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(broker.dial_attempts().len(), 3);

        broker.set_online(true);
        wait_connected(&manager, 1).await;
        assert_eq!(broker.open_connections(), 1);
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_reconnecting() {
        let broker = InMemoryBroker::new();
        broker.set_online(false);
        let manager = manager(&broker);
        let _ = manager.connect().await;

        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Closed);

        let dials = broker.dial_attempts().len();
        broker.set_online(true);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(broker.dial_attempts().len(), dials);
        assert!(matches!(manager.connect().await, Err(CourierError::Closed)));
    }

    #[tokio::test]
    async fn close_tears_down_the_channel() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await.unwrap();

        manager.close().await;
        manager.close().await;

        assert!(manager.current_channel().is_none());
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn disabled_manager_never_dials() {
        let manager = ConnectionManager::disabled("events");
        manager.start().await;

        assert!(!manager.is_enabled());
        assert!(matches!(manager.connect().await, Err(CourierError::Disabled)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    struct FlakyHook {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConnectHook for FlakyHook {
        async fn on_connect(&self, _live: &LiveChannel) -> Result<(), BrokerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(BrokerError::Protocol("queue declare failed".into()));
            }
            Ok(())
        }
    }

    /// Severs every connection the first time it runs.
    struct SeveringHook {
        broker: InMemoryBroker,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConnectHook for SeveringHook {
        async fn on_connect(&self, _live: &LiveChannel) -> Result<(), BrokerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.broker.sever_connections();
                // watcher に切断を処理させる
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                }
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connection_lost_during_hooks_is_not_reported_connected() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager.add_hook(Arc::new(SeveringHook {
            broker: broker.clone(),
            calls: AtomicUsize::new(0),
        }));

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, CourierError::Connection(BrokerError::ChannelClosed)));
        assert!(!manager.is_connected());
        assert!(manager.current_channel().is_none());

        wait_connected(&manager, 2).await;
        assert_eq!(manager.current_channel().unwrap().generation, 2);
        assert_eq!(broker.open_connections(), 1);
        manager.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failing_hook_sends_manager_back_to_reconnect() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        let hook = Arc::new(FlakyHook {
            calls: AtomicUsize::new(0),
        });
        manager.add_hook(hook.clone());

        assert!(manager.connect().await.is_err());
        wait_connected(&manager, 2).await;

        assert_eq!(hook.calls.load(Ordering::SeqCst), 2);
        assert_eq!(broker.open_connections(), 1);
        manager.close().await;
    }
}
