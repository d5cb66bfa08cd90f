//! Multi-tenant fan-out relay for a feature-flag service.
//!
//! One upstream streaming subscription per environment, a per-environment
//! feature store, and an SSE broadcaster that replays the current snapshot to
//! new subscribers and fans deltas out to all of them. Synchronous evaluation
//! endpoints and optional analytics-event forwarding ride on the same
//! credential registry.

pub mod api;
pub mod config;
pub mod environment;
pub mod errors;
pub mod evaluate;
pub mod registry;
pub mod relay_store;
pub mod router;
pub mod sse;
pub mod store;
pub mod stream;

#[cfg(test)]
mod testutils;

pub use crate::config::Config;

use crate::api::eval::UserSource;
use crate::api::events::EventsForwarder;
use crate::api::goals::GoalsProxy;
use crate::api::utils::{empty_response, text_response, with_cors, HandlerBody};
use crate::environment::{start_environment, Environment, STARTUP_TIMEOUT};
use crate::errors::RelayError;
use crate::registry::{fetch_auth_token, Registry};
use crate::router::{AuthKind, Endpoint};
use crate::sse::EventPublisher;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use shared::http::make_boxed_error_response;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Starts every configured environment, then serves the relay endpoints
/// until the listener fails or the process exits.
pub async fn run(config: Config) -> Result<(), RelayError> {
    let service = build_relay(&config).await?;

    let listener = match shared::http::bind("0.0.0.0", config.main.port).await {
        Ok(listener) => listener,
        Err(err) => {
            if config.main.exit_on_error {
                return Err(err.into());
            }
            tracing::error!(port = config.main.port, error = %err, "failed to start http listener");
            return Ok(());
        }
    };

    tracing::info!(port = config.main.port, "listening");

    match shared::http::serve(listener, service).await {
        Ok(()) => Ok(()),
        Err(err) if config.main.exit_on_error => Err(err),
        Err(err) => {
            tracing::error!(error = %err, "http listener failed");
            Ok(())
        }
    }
}

/// Builds the relay service: SSE publisher, concurrent environment startup,
/// credential registry assembly.
pub async fn build_relay(config: &Config) -> Result<RelayService, RelayError> {
    build_relay_with_timeout(config, STARTUP_TIMEOUT).await
}

async fn build_relay_with_timeout(
    config: &Config,
    startup_timeout: Duration,
) -> Result<RelayService, RelayError> {
    let publisher = Arc::new(EventPublisher::new(config.main.heartbeat()));
    let goals = GoalsProxy::new(&config.main.base_uri)?;

    let mut registry = Registry::default();
    for env in config.environments.values() {
        registry.seed_server_key(&env.api_key);
    }

    // Environments start concurrently; there is no ordering between them.
    let startups = config.environments.iter().map(|(name, env)| {
        let publisher = publisher.clone();
        async move {
            let result = start_environment(
                name,
                env,
                &config.main,
                config.redis.as_ref(),
                &publisher,
                startup_timeout,
            )
            .await;
            (name, env, result)
        }
    });

    for (name, env, result) in futures::future::join_all(startups).await {
        match result {
            Ok(environment) => {
                registry.register(environment, env.mobile_key.as_deref(), env.env_id.as_deref());
                if config.events.send_events {
                    tracing::info!(environment = name.as_str(), "proxying events");
                    let forwarder =
                        EventsForwarder::new(&config.events.events_uri, &env.api_key)?;
                    registry.register_events_forwarder(&env.api_key, Arc::new(forwarder));
                }
            }
            Err(err) => {
                tracing::error!(
                    environment = name.as_str(),
                    error = %err,
                    "failed to initialize environment"
                );
                if config.main.exit_on_error {
                    return Err(err);
                }
            }
        }
    }

    Ok(RelayService {
        state: Arc::new(RelayState {
            registry,
            publisher,
            goals,
        }),
    })
}

struct RelayState {
    registry: Registry,
    publisher: Arc<EventPublisher>,
    goals: GoalsProxy,
}

#[derive(Clone)]
pub struct RelayService {
    state: Arc<RelayState>,
}

impl<B> Service<Request<B>> for RelayService
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = Response<HandlerBody>;
    type Error = RelayError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let state = self.state.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => return Ok(make_boxed_error_response(StatusCode::BAD_REQUEST)),
            };
            Ok(handle_request(&state, parts, body).await)
        })
    }
}

async fn handle_request(
    state: &RelayState,
    parts: http::request::Parts,
    body: Bytes,
) -> Response<HandlerBody> {
    let Some(endpoint) = router::resolve(&parts.method, parts.uri.path()) else {
        return make_boxed_error_response(StatusCode::NOT_FOUND);
    };

    match endpoint {
        Endpoint::Status => api::status::get_status(&state.registry).await,

        Endpoint::Stream => match authorize(state, AuthKind::Server, &parts.headers) {
            Ok(environment) => api::stream::subscribe(&state.publisher, &environment).await,
            Err(response) => response,
        },

        Endpoint::BulkEvents => {
            let Some(token) = fetch_auth_token(&parts.headers) else {
                return empty_response(StatusCode::UNAUTHORIZED);
            };
            match state.registry.events_forwarder(&token).cloned() {
                Some(forwarder) => forwarder.forward(&parts.headers, parts.version, body).await,
                None => unknown_key_response(),
            }
        }

        Endpoint::EvalUserPath { kind, user } => match authorize(state, kind, &parts.headers) {
            Ok(environment) => {
                api::eval::evaluate_all_flags(&environment, UserSource::Path(&user)).await
            }
            Err(response) => response,
        },

        Endpoint::EvalUserBody { kind } => match authorize(state, kind, &parts.headers) {
            Ok(environment) => {
                api::eval::evaluate_all_flags(
                    &environment,
                    UserSource::Body {
                        content_type: content_type(&parts),
                        body: &body,
                    },
                )
                .await
            }
            Err(response) => response,
        },

        Endpoint::BrowserEvalUserPath { env_id, user } => {
            match browser_environment(state, &env_id) {
                Ok(environment) => with_cors(
                    api::eval::evaluate_all_flags(&environment, UserSource::Path(&user)).await,
                ),
                Err(response) => response,
            }
        }

        Endpoint::BrowserEvalUserBody { env_id } => match browser_environment(state, &env_id) {
            Ok(environment) => with_cors(
                api::eval::evaluate_all_flags(
                    &environment,
                    UserSource::Body {
                        content_type: content_type(&parts),
                        body: &body,
                    },
                )
                .await,
            ),
            Err(response) => response,
        },

        Endpoint::Goals { env_id } => match browser_environment(state, &env_id) {
            Ok(_) => {
                state
                    .goals
                    .get_goals(&env_id, parts.headers.get(AUTHORIZATION))
                    .await
            }
            Err(response) => response,
        },
    }
}

fn content_type(parts: &http::request::Parts) -> Option<&str> {
    parts.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
}

fn unknown_key_response() -> Response<HandlerBody> {
    text_response(
        StatusCode::UNAUTHORIZED,
        "flagrelay is not configured for the provided key",
    )
}

/// Header-credential authorization for server and mobile endpoints. An
/// unparseable token is a bare 401; a well-formed but unknown credential
/// gets the explanatory body.
fn authorize(
    state: &RelayState,
    kind: AuthKind,
    headers: &hyper::header::HeaderMap,
) -> Result<Arc<Environment>, Response<HandlerBody>> {
    let Some(token) = fetch_auth_token(headers) else {
        return Err(empty_response(StatusCode::UNAUTHORIZED));
    };

    let environment = match kind {
        AuthKind::Server => state.registry.server_environment(&token),
        AuthKind::Mobile => state.registry.mobile_environment(&token),
    };
    environment.cloned().ok_or_else(unknown_key_response)
}

/// Path-credential authorization for browser endpoints: unknown environment
/// ids are 404, and every response carries the permissive CORS header.
fn browser_environment(
    state: &RelayState,
    env_id: &str,
) -> Result<Arc<Environment>, Response<HandlerBody>> {
    state.registry.browser_environment(env_id).cloned().ok_or_else(|| {
        with_cors(text_response(
            StatusCode::NOT_FOUND,
            &format!("flagrelay is not configured for environment id {env_id}"),
        ))
    })
}
