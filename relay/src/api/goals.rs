use super::utils::{empty_response, full_body, with_cors, HandlerBody};
use crate::errors::RelayError;
use bytes::Bytes;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use moka::sync::Cache;
use reqwest::header::{CACHE_CONTROL, ETAG, IF_NONE_MATCH};
use std::time::{Duration, Instant};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const CACHE_CAPACITY: u64 = 100;

#[derive(Clone)]
struct CachedGoals {
    status: StatusCode,
    content_type: Option<HeaderValue>,
    body: Bytes,
    etag: Option<String>,
    stored_at: Instant,
    max_age: Option<Duration>,
}

impl CachedGoals {
    fn is_fresh(&self) -> bool {
        self.max_age
            .map(|age| self.stored_at.elapsed() < age)
            .unwrap_or(false)
    }
}

/// `max-age` from a Cache-Control header; `no-store`/`no-cache` win.
fn parse_max_age(cache_control: Option<&str>) -> Option<Duration> {
    let mut max_age = None;
    for directive in cache_control?.split(',') {
        let directive = directive.trim().to_ascii_lowercase();
        if directive == "no-store" || directive == "no-cache" {
            return None;
        }
        if let Some(secs) = directive.strip_prefix("max-age=") {
            if let Ok(secs) = secs.parse() {
                max_age = Some(Duration::from_secs(secs));
            }
        }
    }
    max_age
}

/// Passthrough to the upstream goals endpoint with an in-process response
/// cache honouring the upstream's Cache-Control and ETag headers.
pub struct GoalsProxy {
    base_uri: String,
    http: reqwest::Client,
    cache: Cache<String, CachedGoals>,
}

impl GoalsProxy {
    pub fn new(base_uri: &str) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Internal(e.to_string()))?;

        Ok(GoalsProxy {
            base_uri: base_uri.trim_end_matches('/').to_string(),
            http,
            cache: Cache::new(CACHE_CAPACITY),
        })
    }

    /// Serves `GET /sdk/goals/{envId}`, forwarding the caller's
    /// Authorization header on upstream fetches.
    pub async fn get_goals(
        &self,
        env_id: &str,
        authorization: Option<&HeaderValue>,
    ) -> Response<HandlerBody> {
        let url = format!("{}/sdk/goals/{env_id}", self.base_uri);

        if let Some(cached) = self.cache.get(&url) {
            if cached.is_fresh() {
                return respond(&cached);
            }
            if let Some(etag) = cached.etag.clone() {
                return self.revalidate(&url, cached, &etag, authorization).await;
            }
        }

        match self.fetch(&url, authorization, None).await {
            Ok(entry) => {
                self.store(&url, &entry);
                respond(&entry)
            }
            Err(err) => {
                tracing::warn!(error = %err, "goals fetch failed");
                empty_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    async fn revalidate(
        &self,
        url: &str,
        mut cached: CachedGoals,
        etag: &str,
        authorization: Option<&HeaderValue>,
    ) -> Response<HandlerBody> {
        match self.fetch(url, authorization, Some(etag)).await {
            Ok(entry) if entry.status == StatusCode::NOT_MODIFIED => {
                cached.stored_at = Instant::now();
                if entry.max_age.is_some() {
                    cached.max_age = entry.max_age;
                }
                self.cache.insert(url.to_string(), cached.clone());
                respond(&cached)
            }
            Ok(entry) => {
                self.store(url, &entry);
                respond(&entry)
            }
            Err(err) => {
                tracing::warn!(error = %err, "goals revalidation failed");
                empty_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    async fn fetch(
        &self,
        url: &str,
        authorization: Option<&HeaderValue>,
        if_none_match: Option<&str>,
    ) -> Result<CachedGoals, reqwest::Error> {
        let mut request = self.http.get(url);
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization.clone());
        }
        if let Some(etag) = if_none_match {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let upstream = request.send().await?;
        let status = upstream.status();
        let content_type = upstream.headers().get(CONTENT_TYPE).cloned();
        let etag = upstream
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let max_age = parse_max_age(
            upstream
                .headers()
                .get(CACHE_CONTROL)
                .and_then(|v| v.to_str().ok()),
        );
        let body = upstream.bytes().await?;

        Ok(CachedGoals {
            status,
            content_type,
            body,
            etag,
            stored_at: Instant::now(),
            max_age,
        })
    }

    fn store(&self, url: &str, entry: &CachedGoals) {
        // Only successful responses that can be refreshed or revalidated are
        // worth keeping.
        if entry.status == StatusCode::OK && (entry.max_age.is_some() || entry.etag.is_some()) {
            self.cache.insert(url.to_string(), entry.clone());
        }
    }
}

fn respond(entry: &CachedGoals) -> Response<HandlerBody> {
    let mut response = Response::new(full_body(entry.body.clone()));
    *response.status_mut() = entry.status;
    if let Some(content_type) = &entry.content_type {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, content_type.clone());
    }
    with_cors(response)
}
