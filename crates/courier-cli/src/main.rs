use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier_core::app::{Handler, TypedHandler};
use courier_core::impls::InMemoryBroker;
use courier_core::{
    ConsumerOptions, Courier, CourierBuilder, CourierConfig, DeliveryContext, HandlerContext,
    HandlerError, RequestContext, handler_fn,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Parser)]
#[command(name = "courier", version, about = "Publish and consume events on a topic exchange")]
struct Cli {
    #[command(flatten)]
    broker: BrokerArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct BrokerArgs {
    /// AMQP URL. Falls back to RABBITMQ_URL.
    #[arg(long, env = "COURIER_AMQP_URL", global = true)]
    amqp_url: Option<String>,

    #[arg(long, env = "COURIER_EXCHANGE", default_value = "events", global = true)]
    exchange: String,

    #[arg(long, env = "COURIER_SERVICE", default_value = "courier-cli", global = true)]
    service: String,

    #[arg(long, env = "COURIER_QUEUE", default_value = "courier.events", global = true)]
    queue: String,

    #[arg(long, env = "COURIER_PREFETCH", default_value_t = 1, global = true)]
    prefetch: u16,

    /// Use an in-process broker instead of RabbitMQ.
    #[arg(long, global = true)]
    in_memory: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Publish one event.
    Publish {
        routing_key: String,
        /// JSON payload
        payload: String,
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Log every event matching the patterns until Ctrl-C.
    Consume {
        #[arg(required = true)]
        patterns: Vec<String>,
    },
    /// In-memory round trip with a simulated broker restart.
    Demo,
}

impl BrokerArgs {
    fn config(&self) -> CourierConfig {
        let amqp_url = self
            .amqp_url
            .clone()
            .or_else(|| std::env::var("RABBITMQ_URL").ok())
            .filter(|url| !url.trim().is_empty());
        CourierConfig {
            amqp_url,
            exchange: self.exchange.clone(),
            service_name: self.service.clone(),
            consumer: ConsumerOptions {
                prefetch_count: self.prefetch,
                ..ConsumerOptions::with_queue(self.queue.as_str())
            },
            ..CourierConfig::default()
        }
    }

    fn builder(&self) -> CourierBuilder {
        let builder = CourierBuilder::new(self.config());
        if self.in_memory {
            builder.broker(Arc::new(InMemoryBroker::new()))
        } else {
            builder
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Publish {
            routing_key,
            payload,
            request_id,
        } => publish(&cli.broker, &routing_key, &payload, request_id).await,
        Command::Consume { patterns } => consume(&cli.broker, patterns).await,
        Command::Demo => demo(&cli.broker).await,
    }
}

async fn publish(
    args: &BrokerArgs,
    routing_key: &str,
    payload: &str,
    request_id: Option<String>,
) -> Result<(), BoxError> {
    let payload: serde_json::Value = serde_json::from_str(payload)?;
    let courier = args.builder().build().await?;
    if !courier.connection.is_enabled() {
        return Err("no broker configured: set COURIER_AMQP_URL or pass --in-memory".into());
    }
    // publish は未接続だと黙って捨てるので、ここで接続を確認する
    courier.connection.connect().await?;

    let ctx = request_id.map_or_else(RequestContext::generate, RequestContext::new);
    courier
        .publisher
        .publish_event(&ctx, routing_key, &payload)
        .await?;
    info!(routing_key, request_id = ctx.request_id(), "published");

    courier.close().await;
    Ok(())
}

async fn consume(args: &BrokerArgs, patterns: Vec<String>) -> Result<(), BoxError> {
    let printer = Arc::new(handler_fn(|ctx, delivery, payload| async move {
        info!(
            routing_key = %delivery.routing_key,
            message_id = %delivery.message_id,
            request_id = ctx.request_id(),
            redelivered = delivery.redelivered,
            payload = %String::from_utf8_lossy(&payload),
            "event"
        );
        Ok::<(), HandlerError>(())
    }));

    let mut builder = args.builder();
    for pattern in &patterns {
        builder = builder.subscribe(pattern.as_str(), printer.clone());
    }
    let courier = builder.build().await?;
    courier.start().await;
    info!(?patterns, queue = %args.queue, "consuming, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    courier.close().await;
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct RegionCreated {
    id: u64,
    name: String,
}

/// Fails the first `failures` deliveries to show redelivery.
struct RegionHandler {
    failures: AtomicU32,
}

#[async_trait]
impl Handler<RegionCreated> for RegionHandler {
    async fn handle(
        &self,
        ctx: HandlerContext,
        delivery: DeliveryContext,
        event: RegionCreated,
    ) -> Result<(), HandlerError> {
        let left = self.failures.load(Ordering::Relaxed);
        if left > 0 && !delivery.redelivered {
            self.failures.fetch_sub(1, Ordering::Relaxed);
            return Err(HandlerError::new(format!("intentional failure (left={left})")));
        }
        println!(
            "region {} '{}' from {} (request {}, redelivered={})",
            event.id,
            event.name,
            ctx.service_name,
            ctx.request_id(),
            delivery.redelivered
        );
        Ok(())
    }
}

async fn demo(args: &BrokerArgs) -> Result<(), BoxError> {
    let broker = InMemoryBroker::new();
    let handler = RegionHandler {
        failures: AtomicU32::new(1),
    };
    let courier = CourierBuilder::new(args.config())
        .broker(Arc::new(broker.clone()))
        .subscribe("region.*", Arc::new(TypedHandler::<RegionCreated, _>::new(handler)))
        .expect_keys(&["region.*"])
        .build()
        .await?;
    courier.start().await;

    // (A) 通常の publish。1 回目は失敗して再配送される
    send(&courier, 1, "North").await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // (B) broker 再起動 → 再接続で exchange / binding を復元
    let before = courier.connection.generation();
    broker.restart();
    println!("broker restarted, bindings: {:?}", broker.bindings(&args.queue));
    // 切断中の publish はエラーにならない
    send(&courier, 2, "lost while down").await?;

    let mut state = courier.connection.subscribe_state();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !(courier.connection.is_connected() && courier.connection.generation() > before) {
            if state.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .map_err(|_| "broker did not come back")?;
    println!(
        "reconnected (generation {}), bindings: {:?}",
        courier.connection.generation(),
        broker.bindings(&args.queue)
    );

    // (C) 復旧後の publish
    send(&courier, 3, "South").await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    courier.close().await;
    if broker.open_connections() != 0 {
        warn!(open = broker.open_connections(), "connections left open");
    }
    println!("published={} dropped={}", broker.published(), broker.dropped());
    Ok(())
}

async fn send(courier: &Courier, id: u64, name: &str) -> Result<(), BoxError> {
    let event = RegionCreated {
        id,
        name: name.to_string(),
    };
    courier
        .publisher
        .publish_event(&RequestContext::generate(), "region.created", &event)
        .await?;
    Ok(())
}
