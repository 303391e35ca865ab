//! Environment Configuration
//!
//! Every component owns its config struct with a `Default` and a
//! `from_env()` constructor; [`AppConfig`] gathers them for the binary.

use std::str::FromStr;

use crate::network::auth::AuthConfig;
use crate::network::matchmaking::MatchmakingConfig;
use crate::network::server::ServerConfig;
use crate::network::session::SessionConfig;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but can't be parsed.
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: &'static str,
        /// Raw value.
        value: String,
        /// Parser message.
        reason: String,
    },
}

/// Read `key`, returning `None` when unset or empty.
pub fn env_opt<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value,
                reason: e.to_string(),
            }),
        _ => Ok(None),
    }
}

/// Read `key`, falling back to `default` when unset.
pub fn env_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(env_opt(key)?.unwrap_or(default))
}

/// Complete server configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Listener settings.
    pub server: ServerConfig,
    /// Game rules and timings.
    pub session: SessionConfig,
    /// Matchmaking settings.
    pub matchmaking: MatchmakingConfig,
    /// Token validation for connection identities.
    pub auth: AuthConfig,
}

impl AppConfig {
    /// Load every section from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::from_env()?,
            session: SessionConfig::from_env()?,
            matchmaking: MatchmakingConfig::from_env()?,
            auth: AuthConfig::from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parsing() {
        std::env::set_var("PONG_TEST_CONFIG_NUMBER", " 7 ");
        std::env::set_var("PONG_TEST_CONFIG_BAD", "seven");
        std::env::set_var("PONG_TEST_CONFIG_EMPTY", "");

        assert_eq!(env_or::<u32>("PONG_TEST_CONFIG_NUMBER", 1).unwrap(), 7);
        assert_eq!(env_or::<u32>("PONG_TEST_CONFIG_UNSET", 1).unwrap(), 1);
        assert_eq!(env_opt::<u32>("PONG_TEST_CONFIG_EMPTY").unwrap(), None);

        let err = env_or::<u32>("PONG_TEST_CONFIG_BAD", 1).unwrap_err();
        assert!(err.to_string().contains("PONG_TEST_CONFIG_BAD"));
    }
}
