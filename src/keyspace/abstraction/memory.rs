use std::{
    collections::{HashMap, HashSet},
    sync::Mutex as StdMutex,
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{ChannelMessage, KeyspaceEngine, Op, Value};
use crate::{utils, Result};

/// In-process engine with real TTL expiry and pub/sub. Backs tests and
/// single-node dev runs; the semantics mirror the redis engine closely
/// enough that the services cannot tell them apart.
pub struct Engine {
    store: StdMutex<Store>,
    publish_tx: broadcast::Sender<ChannelMessage>,
}

#[derive(Default)]
struct Store {
    entries: HashMap<String, Entry>,
}

struct Entry {
    kind: Kind,
    expires_at: Option<u64>,
}

enum Kind {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    // member -> score
    ZSet(HashMap<String, u64>),
}

impl Entry {
    fn expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl Store {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = utils::millis_since_unix_epoch();
        if self.entries.get(key).is_some_and(|e| e.expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn get(&mut self, key: &str) -> Option<String> {
        match self.live(key) {
            Some(Entry {
                kind: Kind::Str(value),
                ..
            }) => Some(value.clone()),
            _ => None,
        }
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_owned(),
            Entry {
                kind: Kind::Str(value.to_owned()),
                expires_at: ttl.map(|ttl| utils::millis_since_unix_epoch() + ttl.as_millis() as u64),
            },
        );
    }

    fn del(&mut self, key: &str) -> bool {
        let now = utils::millis_since_unix_epoch();
        match self.entries.remove(key) {
            Some(entry) => !entry.expired(now),
            None => false,
        }
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        let deadline = utils::millis_since_unix_epoch() + ttl.as_millis() as u64;
        match self.live(key) {
            Some(entry) => {
                entry.expires_at = Some(deadline);
                true
            }
            None => false,
        }
    }

    fn hash_mut(&mut self, key: &str) -> &mut HashMap<String, String> {
        self.ensure_kind(key, || Kind::Hash(HashMap::new()));
        match &mut self.entries.get_mut(key).expect("just inserted").kind {
            Kind::Hash(hash) => hash,
            _ => unreachable!("ensure_kind replaced non-hash entry"),
        }
    }

    fn set_mut(&mut self, key: &str) -> &mut HashSet<String> {
        self.ensure_kind(key, || Kind::Set(HashSet::new()));
        match &mut self.entries.get_mut(key).expect("just inserted").kind {
            Kind::Set(set) => set,
            _ => unreachable!("ensure_kind replaced non-set entry"),
        }
    }

    fn zset_mut(&mut self, key: &str) -> &mut HashMap<String, u64> {
        self.ensure_kind(key, || Kind::ZSet(HashMap::new()));
        match &mut self.entries.get_mut(key).expect("just inserted").kind {
            Kind::ZSet(zset) => zset,
            _ => unreachable!("ensure_kind replaced non-zset entry"),
        }
    }

    /// Drops an expired or differently-typed entry, then inserts a fresh
    /// one if the key is vacant. Redis would error on a type mismatch;
    /// overwriting keeps this engine forgiving for tests.
    fn ensure_kind(&mut self, key: &str, make: impl FnOnce() -> Kind) {
        let now = utils::millis_since_unix_epoch();
        let fresh = make();
        let replace = match self.entries.get(key) {
            Some(entry) => {
                entry.expired(now)
                    || std::mem::discriminant(&entry.kind) != std::mem::discriminant(&fresh)
            }
            None => true,
        };
        if replace {
            self.entries.insert(
                key.to_owned(),
                Entry {
                    kind: fresh,
                    expires_at: None,
                },
            );
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key) {
            Some(Entry {
                kind: Kind::Set(set),
                ..
            }) => set.is_empty(),
            Some(Entry {
                kind: Kind::ZSet(zset),
                ..
            }) => zset.is_empty(),
            Some(Entry {
                kind: Kind::Hash(hash),
                ..
            }) => hash.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn zrangebyscore(
        &mut self,
        key: &str,
        min: u64,
        max: Option<u64>,
        limit: Option<usize>,
    ) -> Vec<String> {
        let members = match self.live(key) {
            Some(Entry {
                kind: Kind::ZSet(zset),
                ..
            }) => zset,
            _ => return Vec::new(),
        };

        let mut matching: Vec<(u64, String)> = members
            .iter()
            .filter(|(_, score)| **score >= min && max.map_or(true, |max| **score <= max))
            .map(|(member, score)| (*score, member.clone()))
            .collect();
        matching.sort();

        let take = limit.unwrap_or(matching.len());
        matching
            .into_iter()
            .take(take)
            .map(|(_, member)| member)
            .collect()
    }

    fn apply(&mut self, op: &Op) -> Value {
        match op {
            Op::Get { key } => match self.get(key) {
                Some(value) => Value::Text(value),
                None => Value::Nil,
            },
            Op::Set { key, value, ttl } => {
                self.set(key, value, *ttl);
                Value::Ok
            }
            Op::Del { key } => Value::Int(i64::from(self.del(key))),
            Op::Expire { key, ttl } => Value::Int(i64::from(self.expire(key, *ttl))),
            Op::SAdd { key, member } => {
                let added = self.set_mut(key).insert(member.clone());
                Value::Int(i64::from(added))
            }
            Op::SRem { key, member } => {
                let removed = match self.live(key) {
                    Some(Entry {
                        kind: Kind::Set(set),
                        ..
                    }) => set.remove(member),
                    _ => false,
                };
                self.drop_if_empty(key);
                Value::Int(i64::from(removed))
            }
            Op::ZAdd { key, member, score } => {
                self.zset_mut(key).insert(member.clone(), *score);
                Value::Int(1)
            }
            Op::ZRem { key, member } => {
                let removed = match self.live(key) {
                    Some(Entry {
                        kind: Kind::ZSet(zset),
                        ..
                    }) => zset.remove(member).is_some(),
                    _ => false,
                };
                self.drop_if_empty(key);
                Value::Int(i64::from(removed))
            }
            Op::ZRemRangeByScore { key, min, max } => {
                let removed = match self.live(key) {
                    Some(Entry {
                        kind: Kind::ZSet(zset),
                        ..
                    }) => {
                        let before = zset.len();
                        zset.retain(|_, score| *score < *min || *score > *max);
                        before - zset.len()
                    }
                    _ => 0,
                };
                self.drop_if_empty(key);
                Value::Int(removed as i64)
            }
            Op::ZScore { key, member } => match self.live(key) {
                Some(Entry {
                    kind: Kind::ZSet(zset),
                    ..
                }) => match zset.get(member) {
                    Some(score) => Value::Int(*score as i64),
                    None => Value::Nil,
                },
                _ => Value::Nil,
            },
            Op::ZCard { key } => match self.live(key) {
                Some(Entry {
                    kind: Kind::ZSet(zset),
                    ..
                }) => Value::Int(zset.len() as i64),
                _ => Value::Int(0),
            },
        }
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            store: StdMutex::new(Store::default()),
            publish_tx: broadcast::channel(256).0,
        }
    }

    fn store(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().expect("memory keyspace poisoned")
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyspaceEngine for Engine {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.store().get(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.store().set(key, value, ttl);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        Ok(self.store().del(key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.store().live(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.store().expire(key, ttl))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut store = self.store();
        Ok(match store.live(key) {
            Some(Entry {
                kind: Kind::Hash(hash),
                ..
            }) => hash.get(field).cloned(),
            _ => None,
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.store()
            .hash_mut(key)
            .insert(field.to_owned(), value.to_owned());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut store = self.store();
        let removed = match store.live(key) {
            Some(Entry {
                kind: Kind::Hash(hash),
                ..
            }) => hash.remove(field).is_some(),
            _ => false,
        };
        store.drop_if_empty(key);
        Ok(removed)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let mut store = self.store();
        Ok(match store.live(key) {
            Some(Entry {
                kind: Kind::Hash(hash),
                ..
            }) => hash
                .iter()
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect(),
            _ => Vec::new(),
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.store().set_mut(key).insert(member.to_owned()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut store = self.store();
        let removed = match store.live(key) {
            Some(Entry {
                kind: Kind::Set(set),
                ..
            }) => set.remove(member),
            _ => false,
        };
        store.drop_if_empty(key);
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut store = self.store();
        Ok(match store.live(key) {
            Some(Entry {
                kind: Kind::Set(set),
                ..
            }) => set.iter().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let mut store = self.store();
        Ok(match store.live(key) {
            Some(Entry {
                kind: Kind::Set(set),
                ..
            }) => set.len() as u64,
            _ => 0,
        })
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut store = self.store();
        Ok(match store.live(key) {
            Some(Entry {
                kind: Kind::Set(set),
                ..
            }) => set.contains(member),
            _ => false,
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: u64) -> Result<()> {
        self.store().zset_mut(key).insert(member.to_owned(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut store = self.store();
        let removed = match store.live(key) {
            Some(Entry {
                kind: Kind::ZSet(zset),
                ..
            }) => zset.remove(member).is_some(),
            _ => false,
        };
        store.drop_if_empty(key);
        Ok(removed)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<u64>> {
        let mut store = self.store();
        Ok(match store.live(key) {
            Some(Entry {
                kind: Kind::ZSet(zset),
                ..
            }) => zset.get(member).copied(),
            _ => None,
        })
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut store = self.store();
        Ok(match store.live(key) {
            Some(Entry {
                kind: Kind::ZSet(zset),
                ..
            }) => zset.len() as u64,
            _ => 0,
        })
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: u64,
        max: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        Ok(self.store().zrangebyscore(key, min, max, limit))
    }

    async fn zremrangebyscore(&self, key: &str, min: u64, max: u64) -> Result<u64> {
        match self.store().apply(&Op::ZRemRangeByScore {
            key: key.to_owned(),
            min,
            max,
        }) {
            Value::Int(removed) => Ok(removed as u64),
            _ => Ok(0),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // No receivers is fine; publishes are fire-and-forget
        let _ = self.publish_tx.send(ChannelMessage {
            channel: channel.to_owned(),
            payload: payload.to_owned(),
        });
        Ok(())
    }

    fn subscribe(&self, channels: Vec<String>) -> mpsc::UnboundedReceiver<ChannelMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut source = self.publish_tx.subscribe();

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if !channels.contains(&message.channel) {
                            continue;
                        }
                        if tx.send(message).is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        rx
    }

    async fn pipeline(&self, ops: Vec<Op>) -> Result<Vec<Value>> {
        let mut store = self.store();
        Ok(ops.iter().map(|op| store.apply(op)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_ttl_expires() {
        let engine = Engine::new();
        engine
            .set("k", "v", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(engine.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.get("k").await.unwrap(), None);
        assert!(!engine.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn expire_applies_to_sets() {
        let engine = Engine::new();
        engine.sadd("s", "a").await.unwrap();
        assert!(engine.expire("s", Duration::from_millis(30)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.smembers("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hash_round_trip() {
        let engine = Engine::new();
        engine.hset("h", "f", "1").await.unwrap();
        assert_eq!(engine.hget("h", "f").await.unwrap().as_deref(), Some("1"));
        assert!(engine.hdel("h", "f").await.unwrap());
        assert!(engine.hgetall("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zrangebyscore_orders_and_limits() {
        let engine = Engine::new();
        engine.zadd("z", "c", 30).await.unwrap();
        engine.zadd("z", "a", 10).await.unwrap();
        engine.zadd("z", "b", 20).await.unwrap();

        let all = engine.zrangebyscore("z", 15, None, None).await.unwrap();
        assert_eq!(all, vec!["b", "c"]);

        let limited = engine.zrangebyscore("z", 0, None, Some(2)).await.unwrap();
        assert_eq!(limited, vec!["a", "b"]);

        assert_eq!(engine.zremrangebyscore("z", 0, 20).await.unwrap(), 2);
        assert_eq!(engine.zcard("z").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pipeline_is_applied_in_order() {
        let engine = Engine::new();
        let results = engine
            .pipeline(vec![
                Op::ZAdd {
                    key: "w".to_owned(),
                    member: "m1".to_owned(),
                    score: 5,
                },
                Op::ZRemRangeByScore {
                    key: "w".to_owned(),
                    min: 0,
                    max: 4,
                },
                Op::ZCard {
                    key: "w".to_owned(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(results[1], Value::Int(0));
        assert_eq!(results[2], Value::Int(1));
    }

    #[tokio::test]
    async fn pubsub_filters_by_channel() {
        let engine = Engine::new();
        let mut rx = engine.subscribe(vec!["wanted".to_owned()]);
        // Allow the bridge task to attach before publishing
        tokio::task::yield_now().await;

        engine.publish("ignored", "nope").await.unwrap();
        engine.publish("wanted", "yes").await.unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.channel, "wanted");
        assert_eq!(message.payload, "yes");
    }
}
