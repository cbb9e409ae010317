//! Configuration from the environment

use fleetlink::GatewayOptions;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Address served when `LISTEN_ADDR` is unset
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Invalid or missing settings
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is unset or empty
    #[error("{0} must be set")]
    Missing(&'static str),

    /// A variable could not be parsed
    #[error("Invalid value for {name}: {value:?}")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// Rejected value
        value: String,
    },
}

/// Gateway process settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to listen on
    pub listen_addr: SocketAddr,
    /// HS256 secret for request tokens
    pub jwt_key: Vec<u8>,
    /// Required `aud` claim, if any
    pub jwt_audience: Option<String>,
    /// Pool, session and read limits
    pub options: GatewayOptions,
}

impl GatewayConfig {
    /// Read settings from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let listen_addr = match parse(&lookup, "LISTEN_ADDR")? {
            Some(addr) => addr,
            None => DEFAULT_LISTEN_ADDR
                .parse()
                .map_err(|_| ConfigError::Invalid {
                    name: "LISTEN_ADDR",
                    value: DEFAULT_LISTEN_ADDR.to_string(),
                })?,
        };
        let jwt_key = lookup("JWT_KEY")
            .ok_or(ConfigError::Missing("JWT_KEY"))?
            .into_bytes();
        let jwt_audience = lookup("JWT_AUDIENCE");

        let mut options = GatewayOptions::default();
        if let Some(secs) = parse::<u64>(&lookup, "EVICTION_THRESHOLD_SECS")? {
            options.pool.eviction_threshold = Duration::from_secs(secs);
        }
        if let Some(timeout) = positive_secs(&lookup, "COMMAND_TIMEOUT_SECS")? {
            options.session.command_timeout = timeout;
        }
        if let Some(timeout) = positive_secs(&lookup, "CONNECT_TIMEOUT_SECS")? {
            options.session.connect_timeout = timeout;
        }
        if let Some(max) = parse::<u64>(&lookup, "FILE_READ_MAX_BYTES")? {
            options.read_limit = max;
        }

        Ok(Self {
            listen_addr,
            jwt_key,
            jwt_audience,
            options,
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

fn positive_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    match parse::<u64>(lookup, name)? {
        Some(0) => Err(ConfigError::Invalid {
            name,
            value: "0".to_string(),
        }),
        secs => Ok(secs.map(Duration::from_secs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<GatewayConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        GatewayConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("JWT_KEY", "secret")]).unwrap();

        assert_eq!(config.listen_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.jwt_key, b"secret");
        assert!(config.jwt_audience.is_none());
        assert_eq!(config.options.pool.eviction_threshold, Duration::from_secs(600));
        assert_eq!(config.options.session.command_timeout, Duration::from_secs(30));
        assert_eq!(config.options.session.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.options.read_limit, 10_000_000);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("LISTEN_ADDR", "127.0.0.1:9000"),
            ("JWT_KEY", "secret"),
            ("JWT_AUDIENCE", "proxy"),
            ("EVICTION_THRESHOLD_SECS", "60"),
            ("COMMAND_TIMEOUT_SECS", "5"),
            ("CONNECT_TIMEOUT_SECS", "10"),
            ("FILE_READ_MAX_BYTES", "1024"),
        ])
        .unwrap();

        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.jwt_audience.as_deref(), Some("proxy"));
        assert_eq!(config.options.pool.eviction_threshold, Duration::from_secs(60));
        assert_eq!(config.options.session.command_timeout, Duration::from_secs(5));
        assert_eq!(config.options.session.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.options.read_limit, 1024);
    }

    #[test]
    fn test_key_required() {
        assert_eq!(config(&[]).err(), Some(ConfigError::Missing("JWT_KEY")));
        assert_eq!(
            config(&[("JWT_KEY", "  ")]).err(),
            Some(ConfigError::Missing("JWT_KEY"))
        );
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(
            config(&[("JWT_KEY", "secret"), ("FILE_READ_MAX_BYTES", "ten")]).err(),
            Some(ConfigError::Invalid {
                name: "FILE_READ_MAX_BYTES",
                value: "ten".to_string(),
            })
        );
        assert!(config(&[("JWT_KEY", "secret"), ("COMMAND_TIMEOUT_SECS", "0")]).is_err());
        assert!(config(&[("JWT_KEY", "secret"), ("LISTEN_ADDR", "localhost")]).is_err());
    }
}
