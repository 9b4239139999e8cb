//! courier-core
//!
//! Resilient publish/subscribe over a topic exchange (AMQP 0-9-1).
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（envelope, ids, delivery, routing, state, errors）
//! - **ports**: 抽象化レイヤー（Broker / BrokerChannel / Acker, Clock, IdGenerator）
//! - **impls**: 実装（AmqpBroker = lapin, InMemoryBroker = テスト・デモ用）
//! - **app**: アプリケーションロジック（ConnectionManager, Publisher, Consumer, Dispatcher）
//!
//! ```ignore
//! let courier = CourierBuilder::new(config)
//!     .subscribe("region.*", Arc::new(handler_fn(|ctx, delivery, payload| async move {
//!         tracing::info!(request_id = ctx.request_id(), key = %delivery.routing_key, "got event");
//!         Ok(())
//!     })))
//!     .build()
//!     .await?;
//! courier.start().await;
//! courier
//!     .publisher
//!     .publish_event(&RequestContext::generate(), "region.created", &json!({"id": 1}))
//!     .await?;
//! courier.close().await;
//! ```

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{
    Consumer, ConsumerOptions, Courier, CourierBuilder, CourierConfig, ConnectionManager,
    EventHandler, HandlerContext, HandlerError, PublishOptions, Publisher, RequestContext,
    handler_fn,
};
pub use domain::{ConnectionState, CourierError, DeliveryContext, EventEnvelope};
