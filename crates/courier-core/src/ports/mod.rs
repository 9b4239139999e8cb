//! Ports - 抽象化レイヤー
//!
//! Each trait is a seam to something outside the process (the broker, the
//! wall clock, id entropy) so the app layer can be driven by in-memory
//! implementations in tests.

pub mod broker;
pub mod clock;
pub mod id_generator;

pub use self::broker::{
    Acker, Broker, BrokerChannel, BrokerError, DeliveryStream, ExchangeSpec, InboundDelivery,
    OutboundMessage, Prefetch, QueueSpec,
};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
