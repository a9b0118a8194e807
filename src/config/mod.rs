use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr},
};

use serde::{de::IgnoredAny, Deserialize};
use tracing::warn;
use url::Url;

pub mod rate_limiting;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_address")]
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    pub tls: Option<TlsConfig>,

    #[serde(default = "default_keyspace_backend")]
    pub keyspace_backend: String,
    #[serde(default = "default_keyspace_url")]
    pub keyspace_url: String,

    /// The persistence service this instance delegates token refresh,
    /// user validation, room access and message storage to. When unset,
    /// the in-process connector is used (dev and test runs only).
    pub persistence: Option<PersistenceConfig>,

    pub jwt_secret: Option<String>,

    #[serde(default = "default_presence_idle_timeout_s")]
    pub presence_idle_timeout_s: u64,
    #[serde(default = "default_presence_offline_timeout_s")]
    pub presence_offline_timeout_s: u64,
    #[serde(default = "default_presence_ttl_s")]
    pub presence_ttl_s: u64,
    #[serde(default = "default_typing_ttl_s")]
    pub typing_ttl_s: u64,
    #[serde(default = "default_reconnect_grace_ms")]
    pub reconnect_grace_ms: u64,
    #[serde(default = "default_user_validation_cache_s")]
    pub user_validation_cache_s: u64,

    #[serde(default = "default_cleanup_second_interval")]
    pub cleanup_second_interval: u32,
    #[serde(default = "default_handler_budget_s")]
    pub handler_budget_s: u64,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,
    #[serde(default = "default_room_presence_limit")]
    pub room_presence_limit: usize,

    #[serde(default)]
    pub rate_limiting: rate_limiting::Config,

    #[serde(default = "false_fn")]
    pub tracing_flame: bool,
    #[serde(default = "default_log")]
    pub log: String,

    #[serde(flatten)]
    pub catchall: BTreeMap<String, IgnoredAny>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TlsConfig {
    pub certs: String,
    pub key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PersistenceConfig {
    pub base_url: Url,
    pub service_token: String,
}

const DEPRECATED_KEYS: &[&str] = &["typing_ttl", "presence_ttl"];

impl Config {
    pub fn warn_deprecated(&self) {
        let mut was_deprecated = false;
        for key in self
            .catchall
            .keys()
            .filter(|key| DEPRECATED_KEYS.iter().any(|s| s == key))
        {
            warn!("Config parameter {} is deprecated", key);
            was_deprecated = true;
        }

        if was_deprecated {
            warn!("Check your configuration; deprecated parameters are ignored and their _s / _ms successors apply");
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Prepare a list of config values to show
        let lines = [
            ("Address", self.address.to_string()),
            ("Port", self.port.to_string()),
            ("TLS", option_set(self.tls.as_ref())),
            ("Keyspace backend", self.keyspace_backend.clone()),
            ("Keyspace URL", self.keyspace_url.clone()),
            (
                "Persistence service",
                match &self.persistence {
                    Some(p) => p.base_url.to_string(),
                    None => "in-process (dev)".to_owned(),
                },
            ),
            ("JWT secret", option_set(self.jwt_secret.as_ref())),
            (
                "Presence idle timeout (s)",
                self.presence_idle_timeout_s.to_string(),
            ),
            (
                "Presence offline timeout (s)",
                self.presence_offline_timeout_s.to_string(),
            ),
            ("Presence TTL (s)", self.presence_ttl_s.to_string()),
            ("Typing TTL (s)", self.typing_ttl_s.to_string()),
            (
                "Reconnect grace (ms)",
                self.reconnect_grace_ms.to_string(),
            ),
            (
                "User validation cache (s)",
                self.user_validation_cache_s.to_string(),
            ),
            (
                "Cleanup interval in seconds",
                self.cleanup_second_interval.to_string(),
            ),
            ("Handler budget (s)", self.handler_budget_s.to_string()),
            ("Maximum frame size", self.max_frame_size.to_string()),
            (
                "Room presence read limit",
                self.room_presence_limit.to_string(),
            ),
        ];

        let mut msg: String = "Active config values:\n\n".to_owned();

        for (name, value) in lines {
            msg += &format!("{name}: {value}\n");
        }

        write!(f, "{msg}")
    }
}

fn option_set<T>(value: Option<&T>) -> String {
    match value {
        Some(_) => "set".to_owned(),
        None => "not set".to_owned(),
    }
}

fn false_fn() -> bool {
    false
}

fn default_address() -> IpAddr {
    Ipv4Addr::LOCALHOST.into()
}

fn default_port() -> u16 {
    7600
}

fn default_keyspace_backend() -> String {
    "redis".to_owned()
}

fn default_keyspace_url() -> String {
    "redis://127.0.0.1/".to_owned()
}

fn default_presence_idle_timeout_s() -> u64 {
    5 * 60
}

fn default_presence_offline_timeout_s() -> u64 {
    15 * 60
}

fn default_presence_ttl_s() -> u64 {
    15 * 60
}

fn default_typing_ttl_s() -> u64 {
    5
}

fn default_reconnect_grace_ms() -> u64 {
    30 * 1000
}

fn default_user_validation_cache_s() -> u64 {
    60
}

fn default_cleanup_second_interval() -> u32 {
    60 // every minute
}

fn default_handler_budget_s() -> u64 {
    10
}

fn default_max_frame_size() -> u32 {
    64 * 1024
}

fn default_room_presence_limit() -> usize {
    500
}

fn default_log() -> String {
    "warn".to_owned()
}
