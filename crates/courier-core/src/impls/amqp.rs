//! AmqpBroker - RabbitMQ transport on top of lapin.
//!
//! One `connect()` = one AMQP connection with one channel. Connection loss is
//! reported through lapin's `on_error` callback into a watch channel so the
//! connection manager can await it.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::domain::{DeliveryContext, HeaderValue, Headers};
use crate::ports::{
    Acker, Broker, BrokerChannel, BrokerError, DeliveryStream, ExchangeSpec, InboundDelivery,
    OutboundMessage, Prefetch, QueueSpec,
};

const REPLY_SUCCESS: u16 = 200;

fn map_err(err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            BrokerError::ChannelClosed
        }
        lapin::Error::IOError(e) => BrokerError::Connection(e.to_string()),
        other => BrokerError::Protocol(other.to_string()),
    }
}

/// Dials `amqp://` / `amqps://` URIs.
pub struct AmqpBroker {
    uri: String,
}

impl AmqpBroker {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "channel open failed").await;
                return Err(BrokerError::Connection(format!(
                    "failed to create channel: {e}"
                )));
            }
        };

        let (closed_tx, closed_rx) = watch::channel(None);
        connection.on_error(move |err| {
            let _ = closed_tx.send(Some(err.to_string()));
        });

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            closed_rx,
        }))
    }

    fn describe(&self) -> String {
        redact(&self.uri)
    }
}

/// Strip `user:password@` from a URI for logging.
fn redact(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://{}", &uri[..scheme_end], &uri[at + 1..])
        }
        _ => uri.to_string(),
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    closed_rx: watch::Receiver<Option<String>>,
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
            HeaderValue::Int(i) => AMQPValue::LongLongInt(*i),
            HeaderValue::Float(f) => AMQPValue::Double(*f),
            HeaderValue::String(s) => AMQPValue::LongString(LongString::from(s.as_str())),
        };
        table.insert(ShortString::from(key.as_str()), value);
    }
    table
}

fn from_field_table(table: Option<&FieldTable>) -> Headers {
    let mut headers = Headers::new();
    let Some(table) = table else {
        return headers;
    };
    for (key, value) in table.inner() {
        let value = match value {
            AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
            AMQPValue::ShortShortInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::ShortInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::LongInt(i) => HeaderValue::Int(i64::from(*i)),
            AMQPValue::LongLongInt(i) => HeaderValue::Int(*i),
            AMQPValue::Float(f) => HeaderValue::Float(f64::from(*f)),
            AMQPValue::Double(f) => HeaderValue::Float(*f),
            AMQPValue::ShortString(s) => HeaderValue::String(s.as_str().to_string()),
            AMQPValue::LongString(s) => {
                HeaderValue::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
            }
            // 他の型はヘッダとして扱わない
            _ => continue,
        };
        headers.insert(key.as_str().to_string(), value);
    }
    headers
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(&spec.name, ExchangeKind::Topic, options, FieldTable::default())
            .await
            .map_err(map_err)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            exclusive: spec.exclusive,
            ..QueueDeclareOptions::default()
        };
        let mut args = FieldTable::default();
        if let Some(dlx) = &spec.dead_letter_exchange {
            args.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(LongString::from(dlx.as_str())),
            );
        }
        self.channel
            .queue_declare(&spec.name, options, args)
            .await
            .map(|_| ())
            .map_err(map_err)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_err)
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_unbind(queue, exchange, pattern, FieldTable::default())
            .await
            .map_err(map_err)
    }

    async fn set_prefetch(&self, prefetch: Prefetch) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(
                prefetch.count,
                BasicQosOptions {
                    global: prefetch.global,
                },
            )
            .await
            .map_err(map_err)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type.as_str()))
            .with_message_id(ShortString::from(message.message_id.as_str()))
            .with_timestamp(message.timestamp)
            .with_delivery_mode(if message.persistent { 2 } else { 1 });
        if let Some(priority) = message.priority {
            properties = properties.with_priority(priority);
        }
        if !message.headers.is_empty() {
            properties = properties.with_headers(to_field_table(&message.headers));
        }

        let options = BasicPublishOptions {
            mandatory: message.mandatory,
            immediate: message.immediate,
        };
        // publisher confirms は使わない: 送信できた時点で成功とみなす
        self.channel
            .basic_publish(exchange, routing_key, options, &message.body, properties)
            .await
            .map(|_confirm| ())
            .map_err(map_err)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_err)?;

        let stream = consumer.filter_map(|item| match item {
            Ok(delivery) => {
                let context = DeliveryContext {
                    message_id: delivery
                        .properties
                        .message_id()
                        .as_ref()
                        .map(|id| id.as_str().to_string())
                        .unwrap_or_default(),
                    routing_key: delivery.routing_key.as_str().to_string(),
                    redelivered: delivery.redelivered,
                    delivery_tag: delivery.delivery_tag,
                    headers: from_field_table(delivery.properties.headers().as_ref()),
                };
                Some(InboundDelivery {
                    context,
                    body: delivery.data,
                    acker: Box::new(AmqpAcker {
                        acker: delivery.acker,
                    }),
                })
            }
            Err(e) => {
                warn!(error = %e, "consumer stream error");
                None
            }
        });
        Ok(Box::pin(stream))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn closed(&self) -> String {
        let mut rx = self.closed_rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if !self.connection.status().connected() {
                return "connection closed".to_string();
            }
            if rx.changed().await.is_err() {
                return "connection dropped".to_string();
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            let _ = self.channel.close(REPLY_SUCCESS, "bye").await;
        }
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "bye")
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(map_err)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(map_err)
    }
}
