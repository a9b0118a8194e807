mod data;

use std::time::Duration;

pub use data::Data;
use serde::Deserialize;
use tracing::warn;

pub use crate::config::rate_limiting::FailPolicy;
use crate::{services, utils, Error, Result};

/// Frame kinds with an attached limit. The snake_case names double as the
/// config keys and the `rate_limit:{scope}` key prefix.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Restriction {
    MessageSend,
    /// The per-room companion limit of `message:send`.
    MessageSendRoom,
    MessageRead,
    ReadReceiptsGet,
    PresenceStatus,
    PresenceRoom,
    Heartbeat,
}

impl Restriction {
    fn scope_name(self) -> &'static str {
        match self {
            Self::MessageSend => "message_send",
            Self::MessageSendRoom => "message_send_room",
            Self::MessageRead => "message_read",
            Self::ReadReceiptsGet => "read_receipts_get",
            Self::PresenceStatus => "presence_status",
            Self::PresenceRoom => "presence_room",
            Self::Heartbeat => "heartbeat",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Outcome {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at_ms: u64,
}

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    /// Checks the configured limit for `restriction`, keyed by `key`
    /// (a user id, or a room id for per-room limits). Rejections come
    /// back as [`Error::RateLimited`] with a retry-after hint.
    pub async fn check(&self, restriction: Restriction, key: &str) -> Result<()> {
        let limitation = services()
            .globals
            .config
            .rate_limiting
            .get(restriction);

        let scope = format!("{}:{}", restriction.scope_name(), key);
        let outcome = self
            .check_scope(
                &scope,
                limitation.limit.get(),
                Duration::from_secs(limitation.window_s.get()),
                limitation.policy,
            )
            .await?;

        if outcome.allowed {
            Ok(())
        } else {
            Err(Error::RateLimited {
                retry_after_secs: utils::secs_until(
                    outcome.reset_at_ms,
                    utils::millis_since_unix_epoch(),
                ),
            })
        }
    }

    /// The raw sliding-window check. Callers that require fail-closed get
    /// their connectivity verified before and after the pipeline, so an
    /// ambiguous outage can never over-admit.
    pub async fn check_scope(
        &self,
        scope: &str,
        limit: u64,
        window: Duration,
        policy: FailPolicy,
    ) -> Result<Outcome> {
        if policy == FailPolicy::Closed {
            self.db
                .ping()
                .await
                .map_err(|_| Error::NotAvailable("Rate limiter is unavailable"))?;
        }

        let now = utils::millis_since_unix_epoch();
        let member = format!("{}-{}", now, utils::random_string(8));

        let count = match self.db.sliding_window_count(scope, now, window, &member).await {
            Ok(count) => count,
            Err(error) if policy == FailPolicy::Open => {
                warn!(%error, scope, "Rate limit check failed open");
                return Ok(Outcome {
                    allowed: true,
                    remaining: limit,
                    reset_at_ms: now + window.as_millis() as u64,
                });
            }
            Err(_) => return Err(Error::NotAvailable("Rate limiter is unavailable")),
        };

        if policy == FailPolicy::Closed {
            self.db
                .ping()
                .await
                .map_err(|_| Error::NotAvailable("Rate limiter is unavailable"))?;
        }

        let window_ms = window.as_millis() as u64;
        if count <= limit {
            return Ok(Outcome {
                allowed: true,
                remaining: limit - count,
                reset_at_ms: now + window_ms,
            });
        }

        let oldest = self
            .db
            .oldest_sample(scope, now.saturating_sub(window_ms))
            .await
            .unwrap_or(None);

        Ok(Outcome {
            allowed: false,
            remaining: 0,
            reset_at_ms: oldest.map_or(now + window_ms, |oldest| oldest + window_ms),
        })
    }
}
