//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub openai_api_key: Option<String>,
    pub analysis_model: String,
    pub vision_model: String,
    pub allowed_origin: String,
    pub session_ttl_days: i64,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key/value lookup.
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        // --- Server and Database Settings ---
        let bind_address_str = var_or("BIND_ADDRESS", "0.0.0.0:3000");
        let bind_address = bind_address_str.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string())
        })?;

        let database_url = lookup("DATABASE_URL")
            .ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = var_or("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- AI Settings ---
        let openai_api_key = lookup("OPENAI_API_KEY");
        let analysis_model = var_or("ANALYSIS_MODEL", "gpt-4o");
        let vision_model = var_or("VISION_MODEL", "gpt-4o");

        // --- Web Settings ---
        let allowed_origin = var_or("ALLOWED_ORIGIN", "http://localhost:3000");
        let ttl_str = var_or("SESSION_TTL_DAYS", "30");
        let session_ttl_days = match ttl_str.parse::<i64>() {
            Ok(days) if days > 0 => days,
            _ => {
                return Err(ConfigError::InvalidValue(
                    "SESSION_TTL_DAYS".to_string(),
                    format!("'{}' is not a positive number of days", ttl_str),
                ))
            }
        };

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            openai_api_key,
            analysis_model,
            vision_model,
            allowed_origin,
            session_ttl_days,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_source(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/verses")]).unwrap();
        assert_eq!(config.bind_address.port(), 3000);
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.analysis_model, "gpt-4o");
        assert_eq!(config.allowed_origin, "http://localhost:3000");
        assert_eq!(config.session_ttl_days, 30);
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn test_database_url_is_required() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingVar(var)) if var == "DATABASE_URL"));
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let bad_ttl = load(&[("DATABASE_URL", "x"), ("SESSION_TTL_DAYS", "0")]);
        assert!(matches!(bad_ttl, Err(ConfigError::InvalidValue(var, _)) if var == "SESSION_TTL_DAYS"));

        let bad_level = load(&[("DATABASE_URL", "x"), ("RUST_LOG", "loud")]);
        assert!(matches!(bad_level, Err(ConfigError::InvalidValue(var, _)) if var == "RUST_LOG"));

        let bad_addr = load(&[("DATABASE_URL", "x"), ("BIND_ADDRESS", "nowhere")]);
        assert!(matches!(bad_addr, Err(ConfigError::InvalidValue(var, _)) if var == "BIND_ADDRESS"));
    }
}
