//! Server configuration.

use crate::store::RedisStore;
use crate::ServerError;

/// Where the shared group state lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local; only meaningful for a single server process.
    Memory,
    Redis { url: String },
}

/// How live group membership is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceSource {
    /// From the transport's multicast table
    Transport,
    /// From member sets in the shared store
    Store,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub store: StoreBackend,
    pub presence: PresenceSource,
    /// Serialize capacity check and join per group name within this process
    pub strict_admission: bool,
    /// Drop directory entries whose live member count reaches zero
    pub prune_empty_groups: bool,
    /// Frames buffered per connection before drops
    pub outbound_capacity: usize,
    /// Raise the default log filter to debug
    pub verbose_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3030".to_string(),
            store: StoreBackend::Memory,
            presence: PresenceSource::Transport,
            strict_admission: true,
            prune_empty_groups: true,
            outbound_capacity: 256,
            verbose_logging: false,
        }
    }
}

impl ServerConfig {
    /// Read the configuration from process environment variables.
    ///
    /// | variable          | default     |
    /// |-------------------|-------------|
    /// | `APP_HOST`        | `0.0.0.0`   |
    /// | `APP_PORT`        | `3030`      |
    /// | `REDIS_HOST`      | `localhost` |
    /// | `REDIS_PORT`      | `7379`      |
    /// | `HUDDLE_STORE`    | `redis`     |
    /// | `HUDDLE_PRESENCE` | `transport` |
    /// | `HUDDLE_STRICT_ADMISSION` | `on` |
    /// | `HUDDLE_LOGGING`  | `off`       |
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServerError> {
        let host = lookup("APP_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = parse_var(&lookup, "APP_PORT", 3030)?;
        let redis_host = lookup("REDIS_HOST").unwrap_or_else(|| "localhost".to_string());
        let redis_port: u16 = parse_var(&lookup, "REDIS_PORT", 7379)?;

        let store = match lookup("HUDDLE_STORE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("redis") => StoreBackend::Redis {
                url: RedisStore::url_for(&redis_host, redis_port),
            },
            Some("memory") => StoreBackend::Memory,
            Some(other) => {
                return Err(ServerError::Config(format!("unknown HUDDLE_STORE: {other}")))
            }
        };

        let presence = match lookup("HUDDLE_PRESENCE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("transport") => PresenceSource::Transport,
            Some("store") => PresenceSource::Store,
            Some(other) => {
                return Err(ServerError::Config(format!("unknown HUDDLE_PRESENCE: {other}")))
            }
        };

        let defaults = Self::default();
        Ok(Self {
            bind_addr: format!("{host}:{port}"),
            store,
            presence,
            strict_admission: is_on(lookup("HUDDLE_STRICT_ADMISSION"), defaults.strict_admission),
            prune_empty_groups: defaults.prune_empty_groups,
            outbound_capacity: defaults.outbound_capacity,
            verbose_logging: is_on(lookup("HUDDLE_LOGGING"), false),
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ServerError> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ServerError::Config(format!("invalid {name}: {raw}"))),
        None => Ok(default),
    }
}

fn is_on(value: Option<String>, default: bool) -> bool {
    match value {
        Some(value) => value.eq_ignore_ascii_case("on"),
        None => default,
    }
}
