// src/config.rs
use std::{env, fmt::Display, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::{info, warn};

use crate::feed::DEFAULT_MAX_CHANNELS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// `None` runs the service on the in-memory store.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// How often a live session re-reads the snapshot while its feed is down.
    pub feed_poll_interval: Duration,
    pub feed_reconnect_delay: Duration,
    /// Upper bound on open change feed channels (two per live session).
    pub feed_max_channels: usize,
    pub cors_allow_origin: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3030,
            database_url: None,
            db_max_connections: 5,
            feed_poll_interval: Duration::from_millis(2000),
            feed_reconnect_delay: Duration::from_millis(5000),
            feed_max_channels: DEFAULT_MAX_CHANNELS,
            cors_allow_origin: None,
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment, loading a
    /// `.env` file first when one is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();
        let database_url = optional("DATABASE_URL");
        if database_url.is_none() {
            warn!("DATABASE_URL not set, votes will be kept in memory only");
        }

        Ok(Self {
            host: optional("HOST").unwrap_or(defaults.host),
            port: parse_or("PORT", defaults.port)?,
            database_url,
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            feed_poll_interval: Duration::from_millis(parse_or("FEED_POLL_INTERVAL_MS", 2000u64)?),
            feed_reconnect_delay: Duration::from_millis(parse_or(
                "FEED_RECONNECT_DELAY_MS",
                5000u64,
            )?),
            feed_max_channels: parse_or("FEED_MAX_CHANNELS", defaults.feed_max_channels)?,
            cors_allow_origin: optional("CORS_ALLOW_ORIGIN"),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + Display,
    T::Err: Display,
{
    match optional(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: e.to_string(),
        }),
        None => {
            info!("{key} not set, using default: {default}");
            Ok(default)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_or_falls_back_to_default() {
        let value: u16 = parse_or("LIVE_POLL_TEST_UNSET_PORT", 4242).unwrap();
        assert_eq!(value, 4242);
    }

    #[test]
    fn parse_or_rejects_garbage() {
        env::set_var("LIVE_POLL_TEST_BAD_PORT", "not-a-port");
        let err = parse_or::<u16>("LIVE_POLL_TEST_BAD_PORT", 1).unwrap_err();
        assert!(err.to_string().contains("LIVE_POLL_TEST_BAD_PORT"));
    }

    #[test]
    fn bind_address_joins_host_and_port() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
    }
}
