//! Typed configuration: an INI file plus environment-variable overrides for
//! container deployments.

use ini::{Ini, Properties};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8030;
pub const DEFAULT_REDIS_LOCAL_TTL_MS: u64 = 30_000;
const DEFAULT_STREAM_URI: &str = "https://stream.launchdarkly.com";
const DEFAULT_BASE_URI: &str = "https://app.launchdarkly.com";
const DEFAULT_EVENTS_URI: &str = "https://events.launchdarkly.com";
const DEFAULT_REDIS_HOST: &str = "localhost";
const DEFAULT_REDIS_PORT: u16 = 6379;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub main: MainConfig,
    pub events: EventsConfig,
    pub redis: Option<RedisConfig>,
    pub environments: HashMap<String, EnvConfig>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MainConfig {
    pub stream_uri: String,
    pub base_uri: String,
    pub exit_on_error: bool,
    pub ignore_connection_errors: bool,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
}

impl Default for MainConfig {
    fn default() -> Self {
        MainConfig {
            stream_uri: DEFAULT_STREAM_URI.to_string(),
            base_uri: DEFAULT_BASE_URI.to_string(),
            exit_on_error: false,
            ignore_connection_errors: false,
            port: DEFAULT_PORT,
            heartbeat_interval_secs: 0,
        }
    }
}

impl MainConfig {
    /// Heartbeat interval for SSE channels; zero disables heartbeats.
    pub fn heartbeat(&self) -> Option<Duration> {
        match self.heartbeat_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EventsConfig {
    pub events_uri: String,
    pub send_events: bool,
    pub flush_interval_secs: u64,
    pub sampling_interval: i32,
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        EventsConfig {
            events_uri: DEFAULT_EVENTS_URI.to_string(),
            send_events: false,
            flush_interval_secs: 5,
            sampling_interval: 0,
            capacity: 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub local_ttl_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: DEFAULT_REDIS_HOST.to_string(),
            port: DEFAULT_REDIS_PORT,
            local_ttl_ms: DEFAULT_REDIS_LOCAL_TTL_MS,
        }
    }
}

impl RedisConfig {
    pub fn local_ttl(&self) -> Duration {
        Duration::from_millis(self.local_ttl_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct EnvConfig {
    pub api_key: String,
    pub mobile_key: Option<String>,
    pub env_id: Option<String>,
    pub prefix: Option<String>,
}

/// Key names in the file are case-insensitive.
fn prop<'a>(props: &'a Properties, name: &str) -> Option<&'a str> {
    props
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

fn bool_prop(props: &Properties, name: &str) -> Result<bool, ConfigError> {
    match prop(props, name) {
        None => Ok(false),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(ConfigError::Invalid(format!(
                "{name} must be a boolean, got '{other}'"
            ))),
        },
    }
}

fn int_prop<T: std::str::FromStr>(props: &Properties, name: &str) -> Result<Option<T>, ConfigError> {
    prop(props, name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{name} must be a number, got '{raw}'")))
        })
        .transpose()
}

fn optional_string(props: &Properties, name: &str) -> Option<String> {
    prop(props, name)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// `[environment "Production"]` → `Production`. The keyword is matched
/// case-insensitively; the name keeps its case. Unquoted names are accepted.
fn environment_section_name(section: &str) -> Option<&str> {
    let keyword_len = "environment".len();
    let keyword = section.get(..keyword_len)?;
    if !keyword.eq_ignore_ascii_case("environment") {
        return None;
    }
    let rest = section[keyword_len..].trim();
    if rest.is_empty() {
        return None;
    }
    Some(rest.trim_matches('"'))
}

/// Container-link values come as `tcp://host:port`; plain values pass through.
fn linked_host(value: &str) -> &str {
    let stripped = value.strip_prefix("tcp://").unwrap_or(value);
    stripped.split(':').next().unwrap_or(stripped)
}

fn linked_port(value: &str) -> Option<u16> {
    let stripped = value.strip_prefix("tcp://").unwrap_or(value);
    stripped.rsplit(':').next()?.parse().ok()
}

impl Config {
    /// Loads the file, applies process-environment overrides, validates.
    pub fn load(
        path: &Path,
        vars: impl Iterator<Item = (String, String)>,
    ) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Config::parse(&text)?;
        config.apply_env_overrides(vars);
        config.validate()?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut config = Config {
            main: MainConfig::default(),
            events: EventsConfig::default(),
            redis: None,
            environments: HashMap::new(),
        };

        for (section, props) in ini.iter() {
            let Some(section) = section else { continue };
            match section.to_ascii_lowercase().as_str() {
                "main" => {
                    if let Some(uri) = optional_string(props, "streamUri") {
                        config.main.stream_uri = uri;
                    }
                    if let Some(uri) = optional_string(props, "baseUri") {
                        config.main.base_uri = uri;
                    }
                    config.main.exit_on_error = bool_prop(props, "exitOnError")?;
                    config.main.ignore_connection_errors =
                        bool_prop(props, "ignoreConnectionErrors")?;
                    if let Some(port) = int_prop(props, "port")? {
                        config.main.port = port;
                    }
                    if let Some(secs) = int_prop(props, "heartbeatIntervalSecs")? {
                        config.main.heartbeat_interval_secs = secs;
                    }
                }
                "events" => {
                    if let Some(uri) = optional_string(props, "eventsUri") {
                        config.events.events_uri = uri;
                    }
                    config.events.send_events = bool_prop(props, "sendEvents")?;
                    if let Some(secs) = int_prop(props, "flushIntervalSecs")? {
                        config.events.flush_interval_secs = secs;
                    }
                    if let Some(interval) = int_prop(props, "samplingInterval")? {
                        config.events.sampling_interval = interval;
                    }
                    if let Some(capacity) = int_prop(props, "capacity")? {
                        config.events.capacity = capacity;
                    }
                }
                "redis" => {
                    let host = optional_string(props, "host");
                    let port: Option<u16> = int_prop(props, "port")?;
                    if let (Some(host), Some(port)) = (host, port) {
                        let mut redis = RedisConfig {
                            host,
                            port,
                            ..RedisConfig::default()
                        };
                        if let Some(ttl) = int_prop(props, "localTtl")? {
                            redis.local_ttl_ms = ttl;
                        }
                        config.redis = Some(redis);
                    }
                }
                _ => {
                    if let Some(name) = environment_section_name(section) {
                        let env = EnvConfig {
                            api_key: optional_string(props, "apiKey").unwrap_or_default(),
                            mobile_key: optional_string(props, "mobileKey"),
                            env_id: optional_string(props, "envId"),
                            prefix: optional_string(props, "prefix"),
                        };
                        config.environments.insert(name.to_string(), env);
                    } else {
                        tracing::warn!(section, "ignoring unknown config section");
                    }
                }
            }
        }

        Ok(config)
    }

    /// Applies `LD_ENV_*` / `LD_PREFIX_*` / `USE_REDIS` / `REDIS_*` overrides.
    pub fn apply_env_overrides(&mut self, vars: impl Iterator<Item = (String, String)>) {
        let vars: HashMap<String, String> = vars.collect();

        for (name, value) in &vars {
            if let Some(env_name) = name.strip_prefix("LD_ENV_") {
                self.environments
                    .entry(env_name.to_string())
                    .or_default()
                    .api_key = value.clone();
            }
        }
        for (name, value) in &vars {
            if let Some(env_name) = name.strip_prefix("LD_PREFIX_") {
                self.environments
                    .entry(env_name.to_string())
                    .or_default()
                    .prefix = Some(value.clone());
            }
        }

        if let Some(use_redis) = vars.get("USE_REDIS") {
            if matches!(use_redis.trim(), "1" | "true" | "TRUE") && self.redis.is_none() {
                self.redis = Some(RedisConfig::default());
            }
        }
        if let Some(redis) = self.redis.as_mut() {
            if let Some(host) = vars.get("REDIS_HOST") {
                redis.host = linked_host(host).to_string();
            }
            if let Some(port) = vars.get("REDIS_PORT").and_then(|v| linked_port(v)) {
                redis.port = port;
            }
            if let Some(ttl) = vars.get("REDIS_TTL").and_then(|v| v.trim().parse().ok()) {
                redis.local_ttl_ms = ttl;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environments.is_empty() {
            return Err(ConfigError::Invalid(
                "you must specify at least one environment".to_string(),
            ));
        }

        let mut server = HashMap::new();
        let mut mobile = HashMap::new();
        let mut browser = HashMap::new();
        for (name, env) in &self.environments {
            if env.api_key.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "environment '{name}' is missing apiKey"
                )));
            }
            for (map, credential) in [
                (&mut server, Some(&env.api_key)),
                (&mut mobile, env.mobile_key.as_ref()),
                (&mut browser, env.env_id.as_ref()),
            ] {
                let Some(credential) = credential else { continue };
                if let Some(other) = map.insert(credential.clone(), name) {
                    return Err(ConfigError::Invalid(format!(
                        "environments '{other}' and '{name}' share a credential"
                    )));
                }
            }
        }
        Ok(())
    }
}
