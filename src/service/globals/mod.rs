use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use tokio::sync::broadcast;
use tracing::info;

use crate::{utils, Config, Error, Result};

pub struct Service {
    pub config: Config,
    instance_id: String,
    jwt_decoding_key: Option<jsonwebtoken::DecodingKey>,

    pub shutdown: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Service {
    pub fn load(config: Config) -> Result<Self> {
        if config.presence_idle_timeout_s >= config.presence_offline_timeout_s {
            return Err(Error::bad_config(
                "presence_idle_timeout_s must be below presence_offline_timeout_s",
            ));
        }

        let jwt_decoding_key = config
            .jwt_secret
            .as_ref()
            .map(|secret| jsonwebtoken::DecodingKey::from_secret(secret.as_bytes()));

        Ok(Self {
            config,
            // Distinguishes this process in logs; sessions never migrate
            // between instances, so uniqueness per boot is enough
            instance_id: utils::random_string(8),
            jwt_decoding_key,
            shutdown: AtomicBool::new(false),
            shutdown_tx: broadcast::channel(1).0,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn jwt_decoding_key(&self) -> Option<&jsonwebtoken::DecodingKey> {
        self.jwt_decoding_key.as_ref()
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.config.presence_ttl_s)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_secs(self.config.typing_ttl_s)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.config.reconnect_grace_ms)
    }

    pub fn presence_idle_timeout_ms(&self) -> u64 {
        self.config.presence_idle_timeout_s * 1000
    }

    pub fn presence_offline_timeout_ms(&self) -> u64 {
        self.config.presence_offline_timeout_s * 1000
    }

    pub fn handler_budget(&self) -> Duration {
        Duration::from_secs(self.config.handler_budget_s)
    }

    pub fn user_validation_cache(&self) -> Duration {
        Duration::from_secs(self.config.user_validation_cache_s)
    }

    pub fn room_presence_limit(&self) -> usize {
        self.config.room_presence_limit
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        info!("Disconnecting local sockets");
        let _ = self.shutdown_tx.send(());
    }
}
