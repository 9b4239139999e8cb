//! Domain model (envelope, ids, delivery metadata, routing, state, errors).

pub mod delivery;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod routing;
pub mod state;

pub use delivery::{DeliveryContext, HeaderValue, Headers, REQUEST_ID_HEADER};
pub use envelope::{CONTENT_TYPE_JSON, EnvelopeError, EventEnvelope};
pub use errors::{CourierError, ErrorKind};
pub use ids::{ConsumerTag, MessageId};
pub use routing::TopicPattern;
pub use state::ConnectionState;
