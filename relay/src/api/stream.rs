use super::utils::{empty_response, with_cors, HandlerBody};
use crate::environment::Environment;
use crate::sse::EventPublisher;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// Attaches the caller to the environment's SSE channel: the current
/// snapshot is replayed first, live events follow. The response streams
/// until the client disconnects; no compression is applied.
pub async fn subscribe(
    publisher: &EventPublisher,
    environment: &Environment,
) -> Response<HandlerBody> {
    let Some(body) = publisher.subscribe(environment.channel()).await else {
        // Registered environments always have a channel.
        tracing::error!(
            environment = environment.name(),
            "missing SSE channel for registered environment"
        );
        return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
    };

    let mut response = Response::new(body);
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    with_cors(response)
}
