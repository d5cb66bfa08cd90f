use super::utils::{empty_response, full_body, normalize_proxied_headers, HandlerBody};
use crate::errors::RelayError;
use bytes::Bytes;
use http::Version;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use std::time::Duration;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Relays analytics event payloads to the upstream events endpoint on behalf
/// of one environment. Events are never buffered or persisted here.
pub struct EventsForwarder {
    bulk_uri: String,
    api_key: HeaderValue,
    http: reqwest::Client,
}

impl EventsForwarder {
    pub fn new(events_uri: &str, api_key: &str) -> Result<Self, RelayError> {
        let api_key = HeaderValue::from_str(api_key)
            .map_err(|e| RelayError::Config(format!("api key is not a valid header value: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(FORWARD_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        Ok(EventsForwarder {
            bulk_uri: format!("{}/bulk", events_uri.trim_end_matches('/')),
            api_key,
            http,
        })
    }

    /// Forwards the request body upstream with this environment's server key
    /// as the credential; the upstream response is passed back as-is.
    pub async fn forward(
        &self,
        headers: &HeaderMap,
        version: Version,
        body: Bytes,
    ) -> Response<HandlerBody> {
        let mut outbound = headers.clone();
        normalize_proxied_headers(&mut outbound, version);
        outbound.insert(AUTHORIZATION, self.api_key.clone());
        outbound.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let upstream = match self
            .http
            .post(&self.bulk_uri)
            .headers(outbound)
            .body(body)
            .send()
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => {
                tracing::warn!(error = %err, "failed to forward events upstream");
                return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let status = upstream.status();
        match upstream.bytes().await {
            Ok(bytes) => {
                let mut response = Response::new(full_body(bytes));
                *response.status_mut() = status;
                response
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to read upstream events response");
                empty_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
}
