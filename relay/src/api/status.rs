use super::utils::{json_response, HandlerBody};
use crate::registry::Registry;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Serialize)]
struct StatusEntry {
    status: &'static str,
}

#[derive(Serialize)]
struct StatusResponse {
    environments: HashMap<String, StatusEntry>,
    status: &'static str,
}

/// Reports per-environment connectivity. An environment is connected iff its
/// handle exists and its store has seen initial data; the relay is healthy
/// iff every environment is connected.
pub async fn get_status(registry: &Registry) -> Response<HandlerBody> {
    let mut environments = HashMap::new();
    let mut healthy = true;

    for (key, environment) in registry.server_entries() {
        let connected = match environment {
            Some(env) => env.initialized().await,
            None => false,
        };
        if !connected {
            healthy = false;
        }
        environments.insert(
            key.clone(),
            StatusEntry {
                status: if connected { "connected" } else { "disconnected" },
            },
        );
    }

    json_response(
        StatusCode::OK,
        &StatusResponse {
            environments,
            status: if healthy { "healthy" } else { "degraded" },
        },
    )
}
