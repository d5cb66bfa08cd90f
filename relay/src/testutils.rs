//! Helpers shared by the crate's tests.

use bytes::Bytes;
use futures::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

/// A server-key credential in the shape the auth pattern accepts.
pub fn sdk_key(tag: &str) -> String {
    let filler = match tag {
        "a" => "aaaaaaaa",
        "b" => "bbbbbbbb",
        _ => "cccccccc",
    };
    format!("sdk-{filler}-0000-4000-8000-000000000001")
}

/// A mobile-key credential.
pub fn mobile_key(tag: &str) -> String {
    sdk_key(tag).replacen("sdk-", "mob-", 1)
}

/// A browser environment id.
pub fn env_id(tag: &str) -> String {
    sdk_key(tag).replacen("sdk-", "", 1)
}

pub fn flag_json(key: &str, version: u64, on: bool) -> serde_json::Value {
    serde_json::json!({
        "key": key,
        "version": version,
        "on": on,
        "targets": [],
        "rules": [],
        "prerequisites": [],
        "fallthrough": {"variation": 1},
        "offVariation": 0,
        "variations": [false, true],
        "clientSide": true,
        "salt": "salty"
    })
}

/// Frames broadcast to live upstream connections; a Some target restricts
/// delivery to the connection that presented that credential.
pub type UpstreamFeed = broadcast::Sender<(Option<String>, String)>;

/// Spawns a mock upstream stream endpoint: a request (carrying the allowed
/// credential, when one is set) gets an SSE response with `initial`, then
/// whatever the returned feed broadcasts, and the connection is held open.
/// Returns the base URI to configure as `streamUri` and the feed sender.
async fn sse_server(initial: Vec<String>, allowed_key: Option<String>) -> (String, UpstreamFeed) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock upstream");
    let port = listener.local_addr().unwrap().port();
    let initial = Arc::new(initial);
    let allowed_key = Arc::new(allowed_key);
    let (feed, _) = broadcast::channel::<(Option<String>, String)>(64);
    let connection_feed = feed.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let io = TokioIo::new(stream);
            let initial = initial.clone();
            let allowed_key = allowed_key.clone();
            let feed = connection_feed.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let initial = initial.clone();
                    let allowed_key = allowed_key.clone();
                    let mut live = feed.subscribe();
                    async move {
                        let presented = req
                            .headers()
                            .get(hyper::header::AUTHORIZATION)
                            .and_then(|v| v.to_str().ok())
                            .map(String::from);

                        if let Some(key) = allowed_key.as_ref() {
                            if presented.as_deref() != Some(key.as_str()) {
                                return Ok::<_, Infallible>(
                                    Response::builder()
                                        .status(401)
                                        .body(
                                            http_body_util::Full::new(Bytes::new())
                                                .map_err(|e| match e {})
                                                .boxed(),
                                        )
                                        .unwrap(),
                                );
                            }
                        }
                        let (tx, rx) = mpsc::channel::<Bytes>(16);
                        tokio::spawn(async move {
                            for frame in initial.iter() {
                                if tx.send(Bytes::from(frame.clone())).await.is_err() {
                                    return;
                                }
                            }
                            loop {
                                match live.recv().await {
                                    Ok((target, frame)) => {
                                        let for_this_connection = target
                                            .as_deref()
                                            .map_or(true, |t| presented.as_deref() == Some(t));
                                        if for_this_connection
                                            && tx.send(Bytes::from(frame)).await.is_err()
                                        {
                                            return;
                                        }
                                    }
                                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                    Err(broadcast::error::RecvError::Closed) => {
                                        // Feed gone; hold the stream open like
                                        // a quiet upstream.
                                        tokio::time::sleep(Duration::from_secs(3600)).await;
                                        return;
                                    }
                                }
                            }
                        });

                        let body = http_body_util::BodyExt::boxed(StreamBody::new(
                            ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(Frame::data(chunk))),
                        ));
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(200)
                                .header(CONTENT_TYPE, "text/event-stream")
                                .body(body)
                                .unwrap(),
                        )
                    }
                });

                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    (format!("http://127.0.0.1:{port}"), feed)
}

/// Mock upstream accepting any credential.
pub async fn spawn_sse_server_with_feed(initial: Vec<String>) -> (String, UpstreamFeed) {
    sse_server(initial, None).await
}

/// [`spawn_sse_server_with_feed`] without the live feed.
pub async fn spawn_sse_server(frames: Vec<String>) -> String {
    sse_server(frames, None).await.0
}

/// Mock upstream that rejects every credential except `allowed_key`,
/// so one relay can host both healthy and failing environments.
pub async fn spawn_gated_sse_server(allowed_key: &str, frames: Vec<String>) -> String {
    sse_server(frames, Some(allowed_key.to_string())).await.0
}

/// Spawns a plain HTTP server whose responses come from `handler`, which
/// receives the request head and collected body. Returns the base URI.
pub async fn spawn_http_server<F>(handler: F) -> String
where
    F: Fn(http::request::Parts, Bytes) -> Response<BoxBody<Bytes, Infallible>>
        + Clone
        + Send
        + Sync
        + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock upstream");
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let io = TokioIo::new(stream);
            let handler = handler.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let handler = handler.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let bytes = body
                            .collect()
                            .await
                            .map(|collected| collected.to_bytes())
                            .unwrap_or_else(|_| Bytes::new());
                        Ok::<_, Infallible>(handler(parts, bytes))
                    }
                });

                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    format!("http://127.0.0.1:{port}")
}

/// Collects a full response body and parses it as JSON.
pub async fn read_json_body(
    response: Response<BoxBody<Bytes, Infallible>>,
) -> (hyper::StatusCode, serde_json::Value) {
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.expect("body collect failed").to_bytes();
    let value = serde_json::from_slice(&bytes).expect("body was not JSON");
    (parts.status, value)
}

/// Reads the next SSE event from a streaming response body, with a timeout.
/// Returns the event name and its parsed JSON data.
pub async fn next_sse_event(
    body: &mut BoxBody<Bytes, Infallible>,
) -> (String, serde_json::Value) {
    let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
        .await
        .expect("timed out waiting for SSE event")
        .expect("stream ended")
        .expect("frame error");
    let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();

    let name = text
        .lines()
        .find_map(|l| l.strip_prefix("event: "))
        .unwrap_or("message")
        .to_string();
    let data: String = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .collect();
    (name, serde_json::from_str(&data).expect("event data was not JSON"))
}
