//! Credential lookup: three keyed maps (server, mobile, browser) from
//! credential to environment handle, plus the per-environment event
//! forwarders. Populated during startup and read-only afterwards.

use crate::api::events::EventsForwarder;
use crate::environment::Environment;
use hyper::header::{HeaderMap, AUTHORIZATION};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

lazy_static! {
    // Credentials are UUID-shaped with an optional 3-letter prefix; the
    // `api_key` scheme tag is optional. Anything else is unauthorized.
    static ref AUTH_TOKEN_PATTERN: Regex = Regex::new(
        r"^(?:api_key )?((?:[a-z]{3}-)?[a-f0-9]{8}-[a-f0-9]{4}-4[a-f0-9]{3}-[89aAbB][a-f0-9]{3}-[a-f0-9]{12})$"
    )
    .expect("invalid auth token pattern");
}

/// Extracts the credential from the Authorization header. None means the
/// header is absent or does not match the expected token shape.
pub fn fetch_auth_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
    AUTH_TOKEN_PATTERN
        .captures(header)
        .map(|captures| captures[1].to_string())
}

#[derive(Default)]
pub struct Registry {
    // Server keys are pre-seeded with None so /status can report configured
    // environments that never came up.
    server: HashMap<String, Option<Arc<Environment>>>,
    mobile: HashMap<String, Arc<Environment>>,
    browser: HashMap<String, Arc<Environment>>,
    events: HashMap<String, Arc<EventsForwarder>>,
}

impl Registry {
    pub fn seed_server_key(&mut self, api_key: &str) {
        self.server.entry(api_key.to_string()).or_insert(None);
    }

    /// Registers a started environment under its server key and, when
    /// present, its mobile key and browser environment id.
    pub fn register(
        &mut self,
        environment: Arc<Environment>,
        mobile_key: Option<&str>,
        env_id: Option<&str>,
    ) {
        self.server
            .insert(environment.channel().to_string(), Some(environment.clone()));
        if let Some(key) = mobile_key {
            self.mobile.insert(key.to_string(), environment.clone());
        }
        if let Some(id) = env_id {
            self.browser.insert(id.to_string(), environment);
        }
    }

    pub fn register_events_forwarder(&mut self, api_key: &str, forwarder: Arc<EventsForwarder>) {
        self.events.insert(api_key.to_string(), forwarder);
    }

    pub fn server_environment(&self, credential: &str) -> Option<&Arc<Environment>> {
        self.server.get(credential).and_then(|e| e.as_ref())
    }

    pub fn mobile_environment(&self, credential: &str) -> Option<&Arc<Environment>> {
        self.mobile.get(credential)
    }

    pub fn browser_environment(&self, env_id: &str) -> Option<&Arc<Environment>> {
        self.browser.get(env_id)
    }

    pub fn events_forwarder(&self, credential: &str) -> Option<&Arc<EventsForwarder>> {
        self.events.get(credential)
    }

    /// Every configured server key with its environment, if it came up.
    pub fn server_entries(&self) -> impl Iterator<Item = (&String, Option<&Arc<Environment>>)> {
        self.server.iter().map(|(key, env)| (key, env.as_ref()))
    }
}
