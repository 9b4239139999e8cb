//! Handler - 受信したイベントを処理する Handler の定義
//!
//! - `EventHandler`: object-safe, raw payload bytes. Stored in the registry.
//! - `Handler<E>`: typed, payload already decoded into `E`.
//! - `TypedHandler<E, H>`: adapts a `Handler<E>` into an `EventHandler`.
//! - `handler_fn`: adapts an async closure into an `EventHandler`.

use std::error::Error as StdError;
use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::context::HandlerContext;
use crate::domain::DeliveryContext;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Failure returned by a handler.
///
/// Retryable errors (the default) nack with requeue; permanent ones nack
/// without requeue so the broker drops or dead-letters the message.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<BoxError>,
    retryable: bool,
}

impl HandlerError {
    /// Retryable failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            retryable: true,
        }
    }

    /// Failure that redelivery cannot fix (bad payload, rejected input).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(message)
        }
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Handles every delivery whose routing key resolves to it.
///
/// # 使用例
/// ```ignore
/// struct AuditHandler;
///
/// #[async_trait]
/// impl EventHandler for AuditHandler {
///     async fn handle(
///         &self,
///         ctx: HandlerContext,
///         delivery: DeliveryContext,
///         payload: Vec<u8>,
///     ) -> Result<(), HandlerError> {
///         tracing::info!(request_id = ctx.request_id(), key = %delivery.routing_key, "audit");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: HandlerContext,
        delivery: DeliveryContext,
        payload: Vec<u8>,
    ) -> Result<(), HandlerError>;
}

/// A handler receiving the payload decoded into `E`.
#[async_trait]
pub trait Handler<E: Send + 'static>: Send + Sync {
    async fn handle(
        &self,
        ctx: HandlerContext,
        delivery: DeliveryContext,
        event: E,
    ) -> Result<(), HandlerError>;
}

/// Type erasure: `Handler<E>` → `EventHandler`.
///
/// A payload that does not decode into `E` is a permanent failure.
pub struct TypedHandler<E, H> {
    handler: H,
    _marker: PhantomData<fn() -> E>,
}

impl<E, H> TypedHandler<E, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<E, H> EventHandler for TypedHandler<E, H>
where
    E: DeserializeOwned + Send + 'static,
    H: Handler<E>,
{
    async fn handle(
        &self,
        ctx: HandlerContext,
        delivery: DeliveryContext,
        payload: Vec<u8>,
    ) -> Result<(), HandlerError> {
        let event: E = serde_json::from_slice(&payload).map_err(|e| {
            HandlerError::permanent(format!("payload does not match {}", std::any::type_name::<E>()))
                .with_source(e)
        })?;
        self.handler.handle(ctx, delivery, event).await
    }
}

/// `EventHandler` backed by an async closure. Built with [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as an `EventHandler`.
///
/// ```ignore
/// consumer.subscribe("region.*", handler_fn(|ctx, delivery, payload| async move {
///     println!("{} {}", delivery.routing_key, String::from_utf8_lossy(&payload));
///     Ok(())
/// })).await?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(HandlerContext, DeliveryContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(HandlerContext, DeliveryContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: HandlerContext,
        delivery: DeliveryContext,
        payload: Vec<u8>,
    ) -> Result<(), HandlerError> {
        (self.f)(ctx, delivery, payload).await
    }
}
