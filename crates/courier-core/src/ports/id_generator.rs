//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（Clock の時刻 + ランダム部）

use crate::domain::{ConsumerTag, MessageId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn message_id(&self) -> MessageId;

    fn consumer_tag(&self) -> ConsumerTag;
}

/// ULID generator whose timestamp part comes from a `Clock`.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn message_id(&self) -> MessageId {
        MessageId::from(self.next_ulid())
    }

    fn consumer_tag(&self) -> ConsumerTag {
        ConsumerTag::from(self.next_ulid())
    }
}
