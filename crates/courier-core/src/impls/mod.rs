//! Impls - ports の実装
//!
//! - **AmqpBroker**: RabbitMQ (lapin)
//! - **InMemoryBroker**: in-process topic broker for tests and the CLI demo

pub mod amqp;
pub mod inmem_broker;

pub use self::amqp::AmqpBroker;
pub use self::inmem_broker::InMemoryBroker;
