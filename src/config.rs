use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::api::ApiSettings;
use crate::probe::DEFAULT_CANARY;
use crate::session::SessionSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required but was not set")]
    Missing(&'static str),
    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Clone)]
pub struct Config {
    pub bot_token: String,
    pub fetch_timeout: Duration,
    pub probe_timeout: Duration,
    pub max_connections: usize,
    pub max_connections_per_host: usize,
    pub shutdown_poll: Duration,
    pub cache_ttl: Duration,
    /// Backend names in preference order; empty keeps the built-in order.
    pub backends: Vec<String>,
    pub canary: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bot_token", &"<redacted>")
            .field("fetch_timeout", &self.fetch_timeout)
            .field("probe_timeout", &self.probe_timeout)
            .field("max_connections", &self.max_connections)
            .field("max_connections_per_host", &self.max_connections_per_host)
            .field("shutdown_poll", &self.shutdown_poll)
            .field("cache_ttl", &self.cache_ttl)
            .field("backends", &self.backends)
            .field("canary", &self.canary)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bot_token =
            get("TELEGRAM_BOT_TOKEN").ok_or(ConfigError::Missing("TELEGRAM_BOT_TOKEN"))?;

        let backends = get("ANIME_BACKENDS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bot_token,
            fetch_timeout: Duration::from_secs(positive(
                "ANIME_FETCH_TIMEOUT_SECS",
                get("ANIME_FETCH_TIMEOUT_SECS"),
                30,
            )?),
            probe_timeout: Duration::from_secs(positive(
                "ANIME_PROBE_TIMEOUT_SECS",
                get("ANIME_PROBE_TIMEOUT_SECS"),
                8,
            )?),
            max_connections: positive(
                "ANIME_MAX_CONNECTIONS",
                get("ANIME_MAX_CONNECTIONS"),
                10,
            )?,
            max_connections_per_host: positive(
                "ANIME_MAX_CONNECTIONS_PER_HOST",
                get("ANIME_MAX_CONNECTIONS_PER_HOST"),
                5,
            )?,
            shutdown_poll: Duration::from_millis(positive(
                "ANIME_SHUTDOWN_POLL_MS",
                get("ANIME_SHUTDOWN_POLL_MS"),
                1000,
            )?),
            cache_ttl: Duration::from_secs(number(
                "ANIME_CACHE_TTL_SECS",
                get("ANIME_CACHE_TTL_SECS"),
                600,
            )?),
            backends,
            canary: get("ANIME_CANARY_QUERY").unwrap_or_else(|| DEFAULT_CANARY.to_string()),
        })
    }

    pub fn api_settings(&self) -> ApiSettings {
        ApiSettings {
            session: SessionSettings {
                timeout: self.fetch_timeout,
                max_connections: self.max_connections,
                max_connections_per_host: self.max_connections_per_host,
            },
            probe_timeout: self.probe_timeout,
            canary: self.canary.clone(),
            cache_ttl: self.cache_ttl,
        }
    }
}

fn number<T: FromStr>(
    name: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
            reason: "expected a non-negative integer",
        }),
    }
}

fn positive<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    let parsed = number(name, raw, default)?;
    if parsed == T::default() {
        return Err(ConfigError::Invalid {
            name,
            value: "0".to_string(),
            reason: "must be greater than zero",
        });
    }
    Ok(parsed)
}
