//! End-to-end publish/subscribe against the in-memory broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use courier_core::app::{
    BackoffPolicy, ConnectionManager, Consumer, ConsumerOptions, EventHandler, HandlerContext,
    HandlerError, Publisher, RequestContext, handler_fn,
};
use courier_core::domain::{ConnectionState, DeliveryContext};
use courier_core::impls::InMemoryBroker;
use courier_core::ports::{Broker, ExchangeSpec, QueueSpec};
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;

const QUEUE: &str = "location.events";

struct Received {
    ctx: HandlerContext,
    delivery: DeliveryContext,
    payload: Value,
}

struct Stack {
    broker: InMemoryBroker,
    connection: ConnectionManager,
    publisher: Publisher,
    consumer: Consumer,
}

fn stack_with(options: ConsumerOptions) -> Stack {
    let broker = InMemoryBroker::new();
    let connection =
        ConnectionManager::new(Arc::new(broker.clone()), "events", BackoffPolicy::default());
    let publisher = Publisher::new(connection.clone(), "location-service");
    let consumer = Consumer::new(connection.clone(), options);
    Stack {
        broker,
        connection,
        publisher,
        consumer,
    }
}

fn stack() -> Stack {
    stack_with(ConsumerOptions::with_queue(QUEUE))
}

/// Forwards every delivery to a channel; fails the first `failures` calls.
fn collector(failures: usize) -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<Received>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = handler_fn(move |ctx, delivery, payload| {
        let tx = tx.clone();
        let calls = calls.clone();
        async move {
            let payload: Value = serde_json::from_slice(&payload)
                .map_err(|e| HandlerError::permanent("payload is not JSON").with_source(e))?;
            let _ = tx.send(Received {
                ctx,
                delivery,
                payload,
            });
            if calls.fetch_add(1, Ordering::SeqCst) < failures {
                return Err(HandlerError::new("transient failure"));
            }
            Ok(())
        }
    });
    (Arc::new(handler), rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Received>) -> Received {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("handler dropped")
}

async fn wait_for_generation(connection: &ConnectionManager, generation: u64) {
    let mut state = connection.subscribe_state();
    timeout(Duration::from_secs(120), async {
        while !(connection.is_connected() && connection.generation() >= generation) {
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("never reconnected");
}

async fn settle_idle(broker: &InMemoryBroker, queue: &str) {
    timeout(Duration::from_secs(5), async {
        while broker.unacked_count(queue) > 0 || broker.queue_depth(queue) > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue never drained");
}

#[tokio::test]
async fn region_created_round_trip() {
    let s = stack();
    let (handler, mut rx) = collector(0);
    s.consumer.subscribe("region.*", handler).await.unwrap();
    s.connection.connect().await.unwrap();

    let payload = json!({"id": 1, "name": "North"});
    s.publisher
        .publish_event(&RequestContext::new("req-7"), "region.created", &payload)
        .await
        .unwrap();

    let got = next(&mut rx).await;
    assert_eq!(got.ctx.event_type, "region.created");
    assert_eq!(got.ctx.service_name, "location-service");
    assert_eq!(got.ctx.request_id(), "req-7");
    assert_eq!(got.delivery.routing_key, "region.created");
    assert!(!got.delivery.redelivered);
    assert_eq!(got.payload, payload);
    assert_eq!(got.payload["id"], 1);

    settle_idle(&s.broker, QUEUE).await;
    s.connection.close().await;
}

#[tokio::test]
async fn handler_deadline_defaults_to_thirty_seconds() {
    let s = stack();
    let (handler, mut rx) = collector(0);
    s.consumer.subscribe("#", handler).await.unwrap();
    s.connection.connect().await.unwrap();

    s.publisher
        .publish_event(&RequestContext::generate(), "audit.login", &json!({}))
        .await
        .unwrap();

    let got = next(&mut rx).await;
    assert!(got.ctx.remaining() <= Duration::from_secs(30));
    assert!(got.ctx.remaining() > Duration::from_secs(25));
    s.connection.close().await;
}

#[tokio::test]
async fn subscribing_twice_binds_and_delivers_once() {
    let s = stack();
    s.connection.connect().await.unwrap();

    let (first, mut first_rx) = collector(0);
    let (second, mut second_rx) = collector(0);
    s.consumer.subscribe("region.*", first).await.unwrap();
    s.consumer.subscribe("region.*", second).await.unwrap();

    assert_eq!(s.broker.bindings(QUEUE), vec!["region.*"]);
    assert_eq!(s.broker.consumer_count(QUEUE), 1);

    s.publisher
        .publish_event(&RequestContext::generate(), "region.created", &json!({"id": 1}))
        .await
        .unwrap();

    next(&mut second_rx).await;
    settle_idle(&s.broker, QUEUE).await;
    assert!(first_rx.try_recv().is_err());
    assert!(second_rx.try_recv().is_err());
    s.connection.close().await;
}

#[tokio::test(start_paused = true)]
async fn rebinds_and_resumes_after_broker_restart() {
    let s = stack();
    let (handler, mut rx) = collector(0);
    s.consumer.subscribe("region.*", handler.clone()).await.unwrap();
    s.consumer.subscribe("city.#", handler).await.unwrap();
    s.connection.connect().await.unwrap();

    s.broker.restart();
    assert!(s.broker.bindings(QUEUE).is_empty());
    wait_for_generation(&s.connection, 2).await;

    assert_eq!(s.broker.bindings(QUEUE), vec!["city.#", "region.*"]);
    assert_eq!(s.broker.consumer_count(QUEUE), 1);
    assert!(s.broker.exchange_exists("events"));

    s.publisher
        .publish_event(&RequestContext::generate(), "city.created.v2", &json!({"id": 9}))
        .await
        .unwrap();
    let got = next(&mut rx).await;
    assert_eq!(got.payload["id"], 9);
    s.connection.close().await;
}

#[tokio::test(start_paused = true)]
async fn subscription_made_during_outage_is_bound_on_reconnect() {
    let s = stack();
    s.connection.connect().await.unwrap();

    s.broker.set_online(false);
    s.broker.sever_connections();
    let (handler, mut rx) = collector(0);
    s.consumer.subscribe("region.*", handler).await.unwrap();

    s.broker.set_online(true);
    wait_for_generation(&s.connection, 2).await;
    assert_eq!(s.broker.bindings(QUEUE), vec!["region.*"]);

    s.publisher
        .publish_event(&RequestContext::generate(), "region.renamed", &json!({"id": 3}))
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await.payload["id"], 3);
    s.connection.close().await;
}

#[tokio::test]
async fn failed_handler_gets_exactly_one_redelivery() {
    let s = stack();
    let (handler, mut rx) = collector(1);
    s.consumer.subscribe("region.*", handler).await.unwrap();
    s.connection.connect().await.unwrap();

    s.publisher
        .publish_event(&RequestContext::generate(), "region.created", &json!({"id": 1}))
        .await
        .unwrap();

    let first = next(&mut rx).await;
    let second = next(&mut rx).await;
    assert_eq!(first.delivery.message_id, second.delivery.message_id);
    assert!(!first.delivery.redelivered);
    assert!(second.delivery.redelivered);

    settle_idle(&s.broker, QUEUE).await;
    assert!(rx.try_recv().is_err());
    s.connection.close().await;
}

#[tokio::test]
async fn poison_message_is_dropped_and_later_ones_flow() {
    let s = stack();
    let (handler, mut rx) = collector(0);
    s.consumer.subscribe("region.*", handler).await.unwrap();
    s.connection.connect().await.unwrap();

    s.broker
        .publish_raw("events", "region.created", "poison-1", b"{not json".to_vec())
        .unwrap();
    s.publisher
        .publish_event(&RequestContext::generate(), "region.created", &json!({"id": 2}))
        .await
        .unwrap();

    let got = next(&mut rx).await;
    assert_eq!(got.payload["id"], 2);
    settle_idle(&s.broker, QUEUE).await;
    assert_eq!(s.broker.dropped(), 1);
    assert!(rx.try_recv().is_err());
    s.connection.close().await;
}

#[tokio::test]
async fn redelivery_limit_dead_letters_the_message() {
    let options = ConsumerOptions {
        max_redeliveries: Some(2),
        dead_letter_exchange: Some("events.dlx".into()),
        ..ConsumerOptions::with_queue(QUEUE)
    };
    let s = stack_with(options);
    let (handler, mut rx) = collector(usize::MAX);
    s.consumer.subscribe("region.*", handler).await.unwrap();
    s.connection.connect().await.unwrap();

    // DLX 側の受け皿
    let side = s.broker.connect().await.unwrap();
    side.declare_exchange(&ExchangeSpec::topic("events.dlx"))
        .await
        .unwrap();
    side.declare_queue(&QueueSpec {
        name: "parking".into(),
        durable: true,
        auto_delete: false,
        exclusive: false,
        dead_letter_exchange: None,
    })
    .await
    .unwrap();
    side.bind_queue("parking", "events.dlx", "#").await.unwrap();

    s.publisher
        .publish_event(&RequestContext::generate(), "region.created", &json!({"id": 1}))
        .await
        .unwrap();

    for _ in 0..3 {
        next(&mut rx).await;
    }
    settle_idle(&s.broker, QUEUE).await;
    assert_eq!(s.broker.dead_lettered(), 1);
    assert_eq!(s.broker.queue_depth("parking"), 1);
    assert!(rx.try_recv().is_err());
    s.connection.close().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_delays_double_up_to_thirty_seconds() {
    let s = stack();
    s.broker.set_online(false);

    assert!(s.connection.connect().await.is_err());
    tokio::time::sleep(Duration::from_secs(1 + 2 + 4 + 8 + 16 + 30 + 30) + Duration::from_millis(500))
        .await;

    let attempts = s.broker.dial_attempts();
    let gaps: Vec<u128> = attempts
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis().div_ceil(1000))
        .collect();
    assert_eq!(gaps, vec![1, 2, 4, 8, 16, 30, 30]);
    assert_eq!(s.connection.state(), ConnectionState::Disconnected);
    s.connection.close().await;
}

#[tokio::test(start_paused = true)]
async fn publishing_while_broker_is_down_never_fails() {
    let s = stack();
    let (handler, mut rx) = collector(0);
    s.consumer.subscribe("region.*", handler).await.unwrap();
    s.broker.set_online(false);
    s.connection.start().await;

    for i in 0..10 {
        s.publisher
            .publish_event(&RequestContext::generate(), "region.created", &json!({ "id": i }))
            .await
            .unwrap();
    }
    assert_eq!(s.broker.published(), 0);

    s.broker.set_online(true);
    wait_for_generation(&s.connection, 1).await;
    s.publisher
        .publish_event(&RequestContext::generate(), "region.created", &json!({"id": 10}))
        .await
        .unwrap();
    assert_eq!(next(&mut rx).await.payload["id"], 10);
    s.connection.close().await;
}

#[tokio::test]
async fn close_waits_for_in_flight_handler_and_acks_it() {
    let s = stack();
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let handled = Arc::new(AtomicUsize::new(0));
    {
        let (started, release, handled) = (started.clone(), release.clone(), handled.clone());
        let handler = handler_fn(move |_ctx, _delivery, _payload| {
            let (started, release, handled) = (started.clone(), release.clone(), handled.clone());
            async move {
                started.notify_one();
                release.notified().await;
                handled.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        });
        s.consumer.subscribe("region.*", Arc::new(handler)).await.unwrap();
    }
    s.connection.connect().await.unwrap();

    s.publisher
        .publish_event(&RequestContext::generate(), "region.created", &json!({"id": 1}))
        .await
        .unwrap();
    started.notified().await;

    let closing = {
        let connection = s.connection.clone();
        tokio::spawn(async move { connection.close().await })
    };
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!closing.is_finished());
    assert_eq!(s.connection.state(), ConnectionState::Closing);

    release.notify_one();
    closing.await.unwrap();

    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(s.connection.state(), ConnectionState::Closed);
    // ack 済みなので切断後もキューに戻っていない
    assert_eq!(s.broker.queue_depth(QUEUE), 0);
    assert_eq!(s.broker.open_connections(), 0);
}
