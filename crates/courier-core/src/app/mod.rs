//! App - アプリケーション層
//!
//! ports を組み合わせて publish / subscribe を実装します。
//!
//! # 主要コンポーネント
//! - **ConnectionManager**: 接続・再接続（backoff）・exchange 再宣言
//! - **Publisher**: envelope を作って publish（未接続なら no-op）
//! - **Consumer**: 購読の登録と、再接続ごとの queue / binding 再構築
//! - **Dispatcher**: decode → handler → ack / nack の配信ループ
//! - **CourierBuilder**: 設定からのワイヤリング

pub mod backoff;
pub mod builder;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod context;
pub mod dispatcher;
pub mod handler;
pub mod publisher;
pub mod registry;

// 主要な型を再エクスポート
pub use self::backoff::{Backoff, BackoffPolicy};
pub use self::builder::{BuildError, Courier, CourierBuilder};
pub use self::config::{ConsumerOptions, CourierConfig, PublishOptions};
pub use self::connection::{ConnectHook, ConnectionManager, LiveChannel};
pub use self::consumer::Consumer;
pub use self::context::{HandlerContext, RequestContext};
pub use self::dispatcher::Disposition;
pub use self::handler::{EventHandler, FnHandler, Handler, HandlerError, TypedHandler, handler_fn};
pub use self::publisher::Publisher;
pub use self::registry::SubscriptionRegistry;
