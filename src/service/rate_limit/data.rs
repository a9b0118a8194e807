use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

#[async_trait]
pub trait Data: Send + Sync {
    /// One atomic sliding-window step on `rate_limit:{scope}`: drop
    /// samples older than the window, insert `member` at `now_ms`, set
    /// the key's expiry to the window, and return the cardinality after
    /// the insert.
    async fn sliding_window_count(
        &self,
        scope: &str,
        now_ms: u64,
        window: Duration,
        member: &str,
    ) -> Result<u64>;

    /// Score of the oldest sample still inside the window, used to
    /// compute the retry-after hint.
    async fn oldest_sample(&self, scope: &str, min_score: u64) -> Result<Option<u64>>;

    /// Connectivity probe for fail-closed callers.
    async fn ping(&self) -> Result<()>;
}
