use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands};
use tokio::{sync::mpsc, time::sleep};
use tracing::warn;

use super::{ChannelMessage, KeyspaceEngine, Op, Value};
use crate::{Config, Error, Result};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct Engine {
    client: redis::Client,
    conn: ConnectionManager,
}

impl Engine {
    pub async fn open(config: &Config) -> Result<Self> {
        let client = redis::Client::open(config.keyspace_url.as_str())
            .map_err(|_| Error::BadConfig("Keyspace URL is invalid."))?;
        let conn = ConnectionManager::new(client.clone()).await?;

        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KeyspaceEngine for Engine {
    async fn ping(&self) -> Result<()> {
        redis::cmd("PING")
            .query_async::<_, ()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        match ttl {
            Some(ttl) => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async::<_, ()>(&mut self.conn())
                    .await?;
            }
            None => self.conn().set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let removed: i64 = self.conn().del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.conn().exists(key).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let set: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut self.conn())
            .await?;
        Ok(set > 0)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.conn().hget(key, field).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.conn().hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let removed: i64 = self.conn().hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>> {
        let map: std::collections::HashMap<String, String> = self.conn().hgetall(key).await?;
        Ok(map.into_iter().collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let added: i64 = self.conn().sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = self.conn().srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.conn().smembers(key).await?)
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        Ok(self.conn().scard(key).await?)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.conn().sismember(key, member).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: u64) -> Result<()> {
        self.conn().zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let removed: i64 = self.conn().zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<u64>> {
        let score: Option<f64> = self.conn().zscore(key, member).await?;
        Ok(score.map(|s| s as u64))
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        Ok(self.conn().zcard(key).await?)
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: u64,
        max: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(min);
        match max {
            Some(max) => cmd.arg(max),
            None => cmd.arg("+inf"),
        };
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        Ok(cmd.query_async(&mut self.conn()).await?)
    }

    async fn zremrangebyscore(&self, key: &str, min: u64, max: u64) -> Result<u64> {
        Ok(redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut self.conn())
            .await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.conn().publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    fn subscribe(&self, channels: Vec<String>) -> mpsc::UnboundedReceiver<ChannelMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();

        tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    return;
                }

                let conn = match client.get_async_connection().await {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "Could not open keyspace subscriber connection");
                        sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };

                let mut pubsub = conn.into_pubsub();
                let mut subscribed = true;
                for channel in &channels {
                    if let Err(error) = pubsub.subscribe(channel).await {
                        warn!(%error, channel, "Could not subscribe to keyspace channel");
                        subscribed = false;
                        break;
                    }
                }
                if !subscribed {
                    sleep(RECONNECT_DELAY).await;
                    continue;
                }

                let mut stream = pubsub.on_message();
                while let Some(message) = stream.next().await {
                    let channel = message.get_channel_name().to_owned();
                    let payload: String = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(error) => {
                            warn!(%error, channel, "Dropping undecodable pub/sub payload");
                            continue;
                        }
                    };

                    if tx.send(ChannelMessage { channel, payload }).is_err() {
                        return;
                    }
                }

                // Events published during the gap are lost; the periodic
                // sweep reconciles stale state afterwards.
                warn!("Keyspace subscription lost, reconnecting");
                sleep(RECONNECT_DELAY).await;
            }
        });

        rx
    }

    async fn pipeline(&self, ops: Vec<Op>) -> Result<Vec<Value>> {
        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in &ops {
            match op {
                Op::Get { key } => {
                    pipe.get(key);
                }
                Op::Set { key, value, ttl } => match ttl {
                    Some(ttl) => {
                        pipe.cmd("SET")
                            .arg(key)
                            .arg(value)
                            .arg("PX")
                            .arg(ttl.as_millis() as u64);
                    }
                    None => {
                        pipe.set(key, value);
                    }
                },
                Op::Del { key } => {
                    pipe.del(key);
                }
                Op::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(ttl.as_millis() as u64);
                }
                Op::SAdd { key, member } => {
                    pipe.sadd(key, member);
                }
                Op::SRem { key, member } => {
                    pipe.srem(key, member);
                }
                Op::ZAdd { key, member, score } => {
                    pipe.zadd(key, member, *score);
                }
                Op::ZRem { key, member } => {
                    pipe.zrem(key, member);
                }
                Op::ZRemRangeByScore { key, min, max } => {
                    pipe.cmd("ZREMRANGEBYSCORE").arg(key).arg(*min).arg(*max);
                }
                Op::ZScore { key, member } => {
                    pipe.zscore(key, member);
                }
                Op::ZCard { key } => {
                    pipe.zcard(key);
                }
            }
        }

        let raw: Vec<redis::Value> = pipe.query_async(&mut self.conn()).await?;
        Ok(raw.into_iter().map(convert_value).collect())
    }
}

fn convert_value(value: redis::Value) -> Value {
    match value {
        redis::Value::Nil => Value::Nil,
        redis::Value::Okay => Value::Ok,
        redis::Value::Int(i) => Value::Int(i),
        redis::Value::Data(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Value::Text(text),
            Err(_) => Value::Nil,
        },
        redis::Value::Status(status) => Value::Text(status),
        // Nested replies don't occur for the commands we pipeline
        redis::Value::Bulk(_) => Value::Nil,
    }
}
