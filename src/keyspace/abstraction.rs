use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

pub mod memory;
pub mod redis;

/// One message received over a pub/sub channel.
#[derive(Clone, Debug)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// A single command inside an atomic pipeline.
#[derive(Clone, Debug)]
pub enum Op {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    ZAdd {
        key: String,
        member: String,
        score: u64,
    },
    ZRem {
        key: String,
        member: String,
    },
    ZRemRangeByScore {
        key: String,
        min: u64,
        max: u64,
    },
    ZScore {
        key: String,
        member: String,
    },
    ZCard {
        key: String,
    },
}

/// What a pipeline slot evaluated to.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Ok,
    Int(i64),
    Text(String),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Text(t) => t.parse().ok(),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }
}

/// The keyspace service every instance shares: strings with TTL, hashes,
/// sets, sorted sets, pub/sub and atomic pipelines. Scores are unix
/// timestamps in milliseconds throughout.
#[async_trait]
pub trait KeyspaceEngine: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn del(&self, key: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>>;

    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;
    async fn scard(&self, key: &str) -> Result<u64>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    async fn zadd(&self, key: &str, member: &str, score: u64) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<u64>>;
    async fn zcard(&self, key: &str) -> Result<u64>;
    /// Ascending by score, then member. `max` of `None` means unbounded.
    async fn zrangebyscore(
        &self,
        key: &str,
        min: u64,
        max: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<String>>;
    async fn zremrangebyscore(&self, key: &str, min: u64, max: u64) -> Result<u64>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Opens a long-lived subscription on `channels`. The engine owns the
    /// underlying connection and reconnects on loss; events in the gap are
    /// lost. Dropping the receiver ends the subscription.
    fn subscribe(&self, channels: Vec<String>) -> mpsc::UnboundedReceiver<ChannelMessage>;

    /// Runs all commands atomically in order and returns one value per
    /// command.
    async fn pipeline(&self, ops: Vec<Op>) -> Result<Vec<Value>>;
}
