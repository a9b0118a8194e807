pub mod abstraction;
mod ops;

use std::{sync::Arc, time::Duration};

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use self::abstraction::KeyspaceEngine;
use crate::{services, Config, Error, Result, Services, SERVICES};

/// Thin typed wrapper over the keyspace service. All cross-instance state
/// lives behind this; the in-memory maps elsewhere are hints.
pub struct KeyspaceAdapter {
    engine: Arc<dyn KeyspaceEngine>,
}

impl KeyspaceAdapter {
    /// Connects the configured engine, builds the services and starts
    /// the background tasks. Call once at boot.
    pub async fn load_or_create(config: Config) -> Result<()> {
        let engine: Arc<dyn KeyspaceEngine> = match &*config.keyspace_backend {
            "redis" => Arc::new(abstraction::redis::Engine::open(&config).await?),
            "memory" => Arc::new(abstraction::memory::Engine::new()),
            _ => {
                return Err(Error::BadConfig("Keyspace backend not found."));
            }
        };

        let adapter = Box::leak(Box::new(Self { engine }));

        let services_raw = Box::new(Services::build(adapter, config)?);

        // This is the first and only time we initialize the SERVICES static
        *SERVICES.write().unwrap() = Some(Box::leak(services_raw));

        services().bus.start();
        services().presence.start_sweep_task();
        services().sessions.start_zombie_sweep_task();

        info!(
            instance_id = services().globals.instance_id(),
            "Keyspace connected and services started"
        );

        Ok(())
    }

    pub(crate) fn engine(&self) -> &dyn KeyspaceEngine {
        &*self.engine
    }

    /// Reads a JSON value. A row that fails to parse counts as missing;
    /// the writer side owns the schema and stale shapes age out by TTL.
    pub(crate) async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.engine.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(error) => {
                debug!(%error, key, "Treating undecodable keyspace value as missing");
                Ok(None)
            }
        }
    }

    pub(crate) async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let raw = serde_json::to_string(value)
            .map_err(|error| Error::KeyspaceEncoding(error.to_string()))?;
        self.engine.set(key, &raw, ttl).await
    }

    pub(crate) async fn publish_json<T: Serialize>(&self, channel: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)
            .map_err(|error| Error::KeyspaceEncoding(error.to_string()))?;
        self.engine.publish(channel, &raw).await
    }

    pub(crate) fn encode_json<T: Serialize>(value: &T) -> Result<String> {
        serde_json::to_string(value).map_err(|error| Error::KeyspaceEncoding(error.to_string()))
    }
}
