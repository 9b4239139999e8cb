//! Strongly-typed identifiers.
//!
//! ULID ベースの ID を Phantom type で区別します。
//! AMQP 上では `msg-01H...` / `ctag-01H...` という文字列として流れるので、
//! serde も文字列表現で往復します。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// Prefix that tags the string form of an id kind.
pub trait IdKind: Send + Sync + 'static {
    const PREFIX: &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("expected prefix '{expected}' in '{input}'")]
    Prefix { expected: &'static str, input: String },

    #[error("invalid ulid in '{input}': {source}")]
    Ulid {
        input: String,
        #[source]
        source: ulid::DecodeError,
    },
}

pub struct Id<K: IdKind> {
    ulid: Ulid,
    _kind: PhantomData<fn() -> K>,
}

impl<K: IdKind> Id<K> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _kind: PhantomData,
        }
    }

    pub fn ulid(&self) -> Ulid {
        self.ulid
    }

    /// Milliseconds since the epoch at which the id was minted.
    pub fn timestamp_ms(&self) -> u64 {
        self.ulid.timestamp_ms()
    }
}

// derive だと K にも境界が付くので手で書く
impl<K: IdKind> Clone for Id<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: IdKind> Copy for Id<K> {}

impl<K: IdKind> PartialEq for Id<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ulid == other.ulid
    }
}

impl<K: IdKind> Eq for Id<K> {}

impl<K: IdKind> PartialOrd for Id<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: IdKind> Ord for Id<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ulid.cmp(&other.ulid)
    }
}

impl<K: IdKind> std::hash::Hash for Id<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ulid.hash(state);
    }
}

impl<K: IdKind> fmt::Debug for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

impl<K: IdKind> fmt::Display for Id<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", K::PREFIX, self.ulid)
    }
}

impl<K: IdKind> From<Ulid> for Id<K> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<K: IdKind> FromStr for Id<K> {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix(K::PREFIX).ok_or_else(|| IdParseError::Prefix {
            expected: K::PREFIX,
            input: s.to_string(),
        })?;
        let ulid = Ulid::from_string(rest).map_err(|source| IdParseError::Ulid {
            input: s.to_string(),
            source,
        })?;
        Ok(Self::from_ulid(ulid))
    }
}

impl<K: IdKind> Serialize for Id<K> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, K: IdKind> Deserialize<'de> for Id<K> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

pub enum Message {}

impl IdKind for Message {
    const PREFIX: &'static str = "msg-";
}

pub enum Consumer {}

impl IdKind for Consumer {
    const PREFIX: &'static str = "ctag-";
}

/// Stamped on every published message as the AMQP `message-id`.
pub type MessageId = Id<Message>;

/// Tag of one `basic.consume` registration.
pub type ConsumerTag = Id<Consumer>;
