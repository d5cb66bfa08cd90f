//! Per-environment runtime: the handle exposed to request handlers and the
//! supervisor that brings an environment up.

use crate::config::{EnvConfig, MainConfig, RedisConfig};
use crate::errors::{RelayError, StoreError};
use crate::evaluate;
use crate::relay_store::RelayFeatureStore;
use crate::sse::EventPublisher;
use crate::store::{DataKind, FeatureStore, InMemoryFeatureStore, RedisFeatureStore};
use crate::stream::StreamingClient;
use launchdarkly_server_sdk_evaluation::Context;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Bounded wait for the first upstream snapshot during startup.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to a running environment. The supervisor owns the upstream client
/// exclusively; this handle only reaches the (wrapped) store.
pub struct Environment {
    name: String,
    api_key: String,
    store: Arc<RelayFeatureStore>,
}

impl Environment {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The SSE channel identifier, which is the server credential.
    pub fn channel(&self) -> &str {
        &self.api_key
    }

    pub async fn initialized(&self) -> bool {
        self.store.initialized().await
    }

    /// Evaluates every flag for the given context.
    pub async fn all_flags(
        &self,
        context: &Context,
    ) -> Result<HashMap<String, serde_json::Value>, StoreError> {
        let flags = self.store.all(DataKind::Features).await?;
        let segments = self.store.all(DataKind::Segments).await?;
        Ok(evaluate::all_flag_values(&flags, &segments, context))
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &Arc<RelayFeatureStore> {
        &self.store
    }
}

/// Builds an environment over a fresh in-memory store, bypassing the
/// upstream client. Tests drive the store directly.
#[cfg(test)]
pub(crate) fn test_environment(
    name: &str,
    api_key: &str,
    publisher: &Arc<EventPublisher>,
) -> Arc<Environment> {
    let store = RelayFeatureStore::new(
        Arc::new(InMemoryFeatureStore::new()),
        publisher.clone(),
        api_key,
    );
    Arc::new(Environment {
        name: name.to_string(),
        api_key: api_key.to_string(),
        store,
    })
}

/// Brings one environment up: store, relay adapter, channel registration,
/// upstream stream, bounded readiness wait.
///
/// A failed or timed-out initialisation is an error unless
/// `ignoreConnectionErrors` is set, in which case the environment is returned
/// anyway and converges once the upstream becomes reachable.
pub async fn start_environment(
    name: &str,
    env: &EnvConfig,
    main: &MainConfig,
    redis: Option<&RedisConfig>,
    publisher: &Arc<EventPublisher>,
    startup_timeout: Duration,
) -> Result<Arc<Environment>, RelayError> {
    let base: Arc<dyn FeatureStore> = match redis {
        Some(cfg) => {
            tracing::info!(
                environment = name,
                host = %cfg.host,
                port = cfg.port,
                prefix = env.prefix.as_deref().unwrap_or_default(),
                "using shared feature store"
            );
            Arc::new(
                RedisFeatureStore::new(&cfg.host, cfg.port, env.prefix.as_deref(), cfg.local_ttl())
                    .await
                    .map_err(|e| RelayError::EnvironmentStartup {
                        name: name.to_string(),
                        reason: e.to_string(),
                    })?,
            )
        }
        None => Arc::new(InMemoryFeatureStore::new()),
    };

    let store = RelayFeatureStore::new(base, publisher.clone(), &env.api_key);

    let (client, mut ready) = StreamingClient::new(
        name,
        &env.api_key,
        &main.stream_uri,
        store.clone() as Arc<dyn FeatureStore>,
    )?;
    client.spawn();

    let environment = Arc::new(Environment {
        name: name.to_string(),
        api_key: env.api_key.clone(),
        store,
    });

    let result = tokio::time::timeout(startup_timeout, ready.wait_for(|ready| *ready)).await;
    match result {
        Ok(Ok(_)) => {
            tracing::info!(environment = name, "environment initialized");
            Ok(environment)
        }
        Ok(Err(_)) | Err(_) => {
            if main.ignore_connection_errors {
                tracing::warn!(
                    environment = name,
                    "ignoring stream initialization error; will converge when upstream is reachable"
                );
                Ok(environment)
            } else {
                Err(RelayError::EnvironmentStartup {
                    name: name.to_string(),
                    reason: "timed out waiting for initial flag data".to_string(),
                })
            }
        }
    }
}
