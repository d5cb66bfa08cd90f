use http::Version;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_LENGTH, CONTENT_TYPE, HOST,
};
use hyper::{Response, StatusCode};
use serde::Serialize;
use shared::http::{add_via_header, filter_hop_by_hop};
use std::convert::Infallible;

/// Body type shared by every handler; full responses and SSE streams both
/// box into it.
pub type HandlerBody = BoxBody<Bytes, Infallible>;

pub fn full_body(bytes: Bytes) -> HandlerBody {
    Full::new(bytes).map_err(|e| match e {}).boxed()
}

pub fn empty_response(status: StatusCode) -> Response<HandlerBody> {
    let mut response = Response::new(full_body(Bytes::new()));
    *response.status_mut() = status;
    response
}

pub fn text_response(status: StatusCode, text: &str) -> Response<HandlerBody> {
    let mut response = Response::new(full_body(Bytes::from(text.to_string())));
    *response.status_mut() = status;
    response
}

/// Serializes a value as an `application/json` response.
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<HandlerBody> {
    let bytes = match serde_json::to_vec(value) {
        Ok(bytes) => Bytes::from(bytes),
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize response");
            return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let mut response = Response::new(full_body(bytes));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

#[derive(Serialize)]
struct ErrorMessage<'a> {
    message: &'a str,
}

/// The `{"message": …}` error body used by the evaluation endpoints.
pub fn error_json_response(status: StatusCode, message: &str) -> Response<HandlerBody> {
    json_response(status, &ErrorMessage { message })
}

pub fn with_cors(mut response: Response<HandlerBody>) -> Response<HandlerBody> {
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// Prepares inbound headers for forwarding upstream: hop-by-hop and
/// connection-scoped headers go, a Via entry is added. Host and
/// Content-Length are recomputed by the outbound client.
pub fn normalize_proxied_headers(headers: &mut HeaderMap, version: Version) {
    filter_hop_by_hop(headers, version);
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    add_via_header(headers, version);
}
