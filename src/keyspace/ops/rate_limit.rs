use std::time::Duration;

use async_trait::async_trait;

use super::rate_limit_key;
use crate::{
    keyspace::{abstraction::Op, KeyspaceAdapter},
    Error, Result,
};

#[async_trait]
impl crate::service::rate_limit::Data for KeyspaceAdapter {
    async fn sliding_window_count(
        &self,
        scope: &str,
        now_ms: u64,
        window: Duration,
        member: &str,
    ) -> Result<u64> {
        let key = rate_limit_key(scope);
        let window_ms = window.as_millis() as u64;

        let results = self
            .engine()
            .pipeline(vec![
                Op::ZRemRangeByScore {
                    key: key.clone(),
                    min: 0,
                    max: now_ms.saturating_sub(window_ms),
                },
                Op::ZAdd {
                    key: key.clone(),
                    member: member.to_owned(),
                    score: now_ms,
                },
                Op::ZCard { key: key.clone() },
                Op::Expire { key, ttl: window },
            ])
            .await?;

        results
            .get(2)
            .and_then(|value| value.as_int())
            .map(|count| count as u64)
            .ok_or_else(|| Error::bad_keyspace("Sliding window pipeline returned no cardinality"))
    }

    async fn oldest_sample(&self, scope: &str, min_score: u64) -> Result<Option<u64>> {
        let members = self
            .engine()
            .zrangebyscore(&rate_limit_key(scope), min_score, None, Some(1))
            .await?;

        // Members are "{timestamp}-{nonce}"
        Ok(members
            .first()
            .and_then(|member| member.split('-').next())
            .and_then(|ts| ts.parse().ok()))
    }

    async fn ping(&self) -> Result<()> {
        self.engine().ping().await
    }
}
