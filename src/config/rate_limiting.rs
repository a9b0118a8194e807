use std::{collections::HashMap, num::NonZeroU64};

use serde::Deserialize;

use crate::service::rate_limit::Restriction;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Overrides for individual frame kinds. Anything not listed here
    /// falls back to the built-in limits.
    #[serde(default)]
    pub map: HashMap<Restriction, RequestLimitation>,
}

impl Config {
    pub fn get(&self, restriction: Restriction) -> RequestLimitation {
        self.map
            .get(&restriction)
            .copied()
            .unwrap_or_else(|| builtin(restriction))
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct RequestLimitation {
    pub limit: NonZeroU64,
    pub window_s: NonZeroU64,
    #[serde(default)]
    pub policy: FailPolicy,
}

/// What to do when the keyspace cannot answer a rate-limit check.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Allow the request. The default for chat-grade endpoints.
    #[default]
    Open,
    /// Reject the request. Required for endpoints where over-admission
    /// is worse than an outage (OTP-style flows).
    Closed,
}

fn builtin(restriction: Restriction) -> RequestLimitation {
    let (limit, window_s) = match restriction {
        Restriction::MessageSend => (60, 60),
        Restriction::MessageSendRoom => (1000, 60),
        Restriction::MessageRead => (30, 10),
        Restriction::ReadReceiptsGet => (20, 10),
        Restriction::PresenceStatus => (30, 60),
        Restriction::PresenceRoom => (60, 60),
        Restriction::Heartbeat => (120, 60),
    };

    RequestLimitation {
        limit: NonZeroU64::new(limit).expect("builtin limits are non-zero"),
        window_s: NonZeroU64::new(window_s).expect("builtin windows are non-zero"),
        policy: FailPolicy::Open,
    }
}
