use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE, VIA,
};
use http::Version;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Binds a listener for [`serve`]. Split out so callers (and tests) can bind
/// port 0 and read back the assigned address.
pub async fn bind(host: &str, port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(format!("{host}:{port}")).await
}

/// Accept loop: hands every connection to hyper with h1/h2 auto-detection.
/// Runs until the listener fails.
pub async fn serve<S, B, E>(listener: TcpListener, service: S) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<B>, Error = E> + Send + Sync + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: std::error::Error + Send + Sync,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let service = Arc::new(service);

    loop {
        let (stream, peer): (_, SocketAddr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service.clone();

        tokio::spawn(async move {
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await
            {
                tracing::debug!(%peer, error = %err, "connection ended with error");
            }
        });
    }
}

/// Creates an error response with the status message as body.
pub fn make_error_response(status_code: StatusCode) -> Response<Bytes> {
    let message = status_code
        .canonical_reason()
        .unwrap_or("an error occurred");

    let mut response = Response::new(Bytes::from(message));
    *response.status_mut() = status_code;
    response
}

/// Boxed variant for services whose bodies may also be streaming.
pub fn make_boxed_error_response(
    status_code: StatusCode,
) -> Response<BoxBody<Bytes, std::convert::Infallible>> {
    make_error_response(status_code)
        .map(Full::new)
        .map(|body| body.map_err(|e| match e {}).boxed())
}

static HOP_BY_HOP_NAMES: &[HeaderName] = &[
    CONNECTION,
    TRANSFER_ENCODING,
    TE,
    TRAILER,
    UPGRADE,
    PROXY_AUTHORIZATION,
    PROXY_AUTHENTICATE,
];

fn is_http1(v: Version) -> bool {
    matches!(v, Version::HTTP_09 | Version::HTTP_10 | Version::HTTP_11)
}

fn version_token(v: Version) -> Option<&'static str> {
    match v {
        Version::HTTP_09 => Some("0.9"),
        Version::HTTP_10 => Some("1.0"),
        Version::HTTP_11 => Some("1.1"),
        Version::HTTP_2 => Some("2"),
        Version::HTTP_3 => Some("3"),
        _ => None,
    }
}

/// Appends a Via entry naming this relay, preserving any existing chain.
/// Applied to proxied requests in both directions.
pub fn add_via_header(headers: &mut HeaderMap, version: Version) {
    let Some(token) = version_token(version) else {
        tracing::warn!(?version, "unknown HTTP version, skipping Via header");
        return;
    };

    let entry = format!("{token} flagrelay");
    let value = match headers.get(VIA).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {entry}"),
        None => entry,
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(VIA, value);
    }
}

/// Strips hop-by-hop headers before forwarding: the standard set, anything
/// named in the Connection header, and keep-alive on pre-1.1 versions.
/// HTTP/2 and HTTP/3 carry no hop-by-hop headers, so they pass untouched.
pub fn filter_hop_by_hop(headers: &mut HeaderMap, version: Version) -> &mut HeaderMap {
    if !is_http1(version) {
        return headers;
    }

    let connection_drops: Vec<HeaderName> = headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|s| {
            s.split(',')
                .filter_map(|t| HeaderName::from_bytes(t.trim().as_bytes()).ok())
                .collect()
        })
        .unwrap_or_default();

    for name in HOP_BY_HOP_NAMES.iter().chain(connection_drops.iter()) {
        headers.remove(name);
    }

    if matches!(version, Version::HTTP_09 | Version::HTTP_10) {
        headers.remove(HeaderName::from_static("keep-alive"));
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;

    #[test]
    fn filters_standard_and_connection_listed_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-custom"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-custom", HeaderValue::from_static("drop-me"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));

        let filtered = filter_hop_by_hop(&mut headers, Version::HTTP_11);

        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key(CONTENT_TYPE));
        assert!(!filtered.contains_key(CONNECTION));
        assert!(!filtered.contains_key("x-custom"));
        assert!(!filtered.contains_key("keep-alive"));
    }

    #[test]
    fn http2_headers_pass_through() {
        let mut headers = HeaderMap::new();
        headers.insert("te", HeaderValue::from_static("trailers"));

        let filtered = filter_hop_by_hop(&mut headers, Version::HTTP_2);
        assert!(filtered.contains_key("te"));
    }

    #[test]
    fn via_appends_to_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert(VIA, HeaderValue::from_static("1.0 edge"));

        add_via_header(&mut headers, Version::HTTP_11);
        assert_eq!(headers.get(VIA).unwrap(), "1.0 edge, 1.1 flagrelay");
    }

    #[test]
    fn error_response_uses_canonical_reason() {
        let response = make_error_response(StatusCode::UNAUTHORIZED);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.body().as_ref(), b"Unauthorized");
    }
}
