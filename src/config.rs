//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use std::collections::HashMap;
use std::env;
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// Absent when running with `SKIP_EXTERNALS=true`
    pub database: Option<DatabaseConfig>,
    pub cache: Option<CacheConfig>,
    pub logging: LoggingConfig,
    pub payment: PaymentConfig,
    pub publisher: PublisherConfig,
    pub idempotency: IdempotencyConfig,
    pub catalog_path: Option<String>,
    pub skip_externals: bool,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Which payment provider integration to build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Mock,
    Hosted,
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "mock" => Ok(ProviderKind::Mock),
            "hosted" => Ok(ProviderKind::Hosted),
            _ => Err(ConfigError::InvalidValue(format!(
                "PAYMENT_PROVIDER must be mock or hosted, got '{}'",
                value
            ))),
        }
    }
}

/// Payment gateway settings
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub provider: ProviderKind,
    /// Shared secret used to verify webhook signatures
    pub webhook_secret: String,
    pub signature_header: String,
    pub session_ttl_secs: u64,
    pub timeout_secs: u64,
    /// Base URL for the links issued by the mock provider
    pub checkout_base_url: String,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Mock,
            webhook_secret: String::new(),
            signature_header: "x-signature".to_string(),
            session_ttl_secs: 900,
            timeout_secs: 10,
            checkout_base_url: "http://localhost:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherMode {
    Sandbox,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherEndpoint {
    pub base_url: String,
    pub api_key: String,
}

/// Game publisher credit API settings, keyed by lowercase publisher name
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub mode: PublisherMode,
    pub endpoints: HashMap<String, PublisherEndpoint>,
    pub timeout_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            mode: PublisherMode::Sandbox,
            endpoints: HashMap::new(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub ttl_secs: u64,
    pub wait_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 86_400,
            wait_ms: 3_000,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        let skip_externals = parse_var("SKIP_EXTERNALS", false)?;
        let (database, cache) = if skip_externals {
            (None, None)
        } else {
            (
                Some(DatabaseConfig::from_env()?),
                Some(CacheConfig::from_env()?),
            )
        };

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            database,
            cache,
            logging: LoggingConfig::from_env()?,
            payment: PaymentConfig::from_env()?,
            publisher: PublisherConfig::from_env()?,
            idempotency: IdempotencyConfig::from_env()?,
            catalog_path: env::var("CATALOG_PATH").ok().filter(|p| !p.trim().is_empty()),
            skip_externals,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        if let Some(cache) = &self.cache {
            cache.validate()?;
        }
        self.logging.validate()?;
        self.payment.validate()?;
        self.publisher.validate()?;

        if !self.skip_externals && self.database.is_none() {
            return Err(ConfigError::ValidationFailed(
                "DATABASE_URL is required unless SKIP_EXTERNALS=true".to_string(),
            ));
        }

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: parse_var("SERVER_PORT", 8000)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            min_connections: parse_var("DB_MIN_CONNECTIONS", 5)?,
            connection_timeout: parse_var("DB_CONNECTION_TIMEOUT", 30)?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(CacheConfig {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            max_connections: parse_var("REDIS_MAX_CONNECTIONS", 10)?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::InvalidValue("REDIS_URL".to_string()));
        }

        // Basic validation of Redis URL format
        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(ConfigError::InvalidValue(
                "REDIS_URL must start with redis:// or rediss://".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "json".to_string())
                .to_lowercase()
                .as_str()
            {
                "plain" => LogFormat::Plain,
                _ => LogFormat::Json,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl PaymentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(PaymentConfig {
            provider: env::var("PAYMENT_PROVIDER")
                .unwrap_or_else(|_| "mock".to_string())
                .parse()?,
            webhook_secret: env::var("PAYMENT_WEBHOOK_SECRET")
                .map_err(|_| ConfigError::MissingVariable("PAYMENT_WEBHOOK_SECRET".to_string()))?,
            signature_header: env::var("PAYMENT_SIGNATURE_HEADER")
                .map(|h| h.trim().to_lowercase())
                .unwrap_or(defaults.signature_header),
            session_ttl_secs: parse_var("PAYMENT_SESSION_TTL_SECS", defaults.session_ttl_secs)?,
            timeout_secs: parse_var("PAYMENT_TIMEOUT_SECS", defaults.timeout_secs)?,
            checkout_base_url: env::var("PAYMENT_CHECKOUT_BASE_URL")
                .unwrap_or(defaults.checkout_base_url),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.webhook_secret.len() < 16 {
            return Err(ConfigError::ValidationFailed(
                "PAYMENT_WEBHOOK_SECRET must be at least 16 characters".to_string(),
            ));
        }

        if self.signature_header.is_empty() {
            return Err(ConfigError::InvalidValue(
                "PAYMENT_SIGNATURE_HEADER".to_string(),
            ));
        }

        if self.session_ttl_secs == 0 || self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "PAYMENT_SESSION_TTL_SECS and PAYMENT_TIMEOUT_SECS must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

impl PublisherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mode = match env::var("PUBLISHER_MODE")
            .unwrap_or_else(|_| "sandbox".to_string())
            .to_lowercase()
            .as_str()
        {
            "sandbox" => PublisherMode::Sandbox,
            "http" => PublisherMode::Http,
            other => {
                return Err(ConfigError::InvalidValue(format!(
                    "PUBLISHER_MODE must be sandbox or http, got '{}'",
                    other
                )))
            }
        };

        Ok(PublisherConfig {
            mode,
            endpoints: Self::endpoints_from_vars(env::vars())?,
            timeout_secs: parse_var("PUBLISHER_TIMEOUT_SECS", 10)?,
        })
    }

    /// Collects `PUBLISHER_<NAME>_BASE_URL` / `PUBLISHER_<NAME>_API_KEY` pairs.
    fn endpoints_from_vars(
        vars: impl Iterator<Item = (String, String)>,
    ) -> Result<HashMap<String, PublisherEndpoint>, ConfigError> {
        let vars: HashMap<String, String> = vars.collect();
        let mut endpoints = HashMap::new();

        for (key, base_url) in &vars {
            let Some(name) = key
                .strip_prefix("PUBLISHER_")
                .and_then(|rest| rest.strip_suffix("_BASE_URL"))
            else {
                continue;
            };

            let key_var = format!("PUBLISHER_{}_API_KEY", name);
            let api_key = vars
                .get(&key_var)
                .cloned()
                .ok_or(ConfigError::MissingVariable(key_var))?;

            endpoints.insert(
                name.to_lowercase(),
                PublisherEndpoint {
                    base_url: base_url.trim_end_matches('/').to_string(),
                    api_key,
                },
            );
        }

        Ok(endpoints)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == PublisherMode::Http && self.endpoints.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "PUBLISHER_MODE=http needs at least one PUBLISHER_<NAME>_BASE_URL".to_string(),
            ));
        }

        for (name, endpoint) in &self.endpoints {
            if !endpoint.base_url.starts_with("http://")
                && !endpoint.base_url.starts_with("https://")
            {
                return Err(ConfigError::InvalidValue(format!(
                    "base URL for publisher '{}' must be a valid URL",
                    name
                )));
            }
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "PUBLISHER_TIMEOUT_SECS".to_string(),
            ));
        }

        Ok(())
    }
}

impl IdempotencyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(IdempotencyConfig {
            ttl_secs: parse_var("IDEMPOTENCY_TTL_SECS", defaults.ttl_secs)?,
            wait_ms: parse_var("IDEMPOTENCY_WAIT_MS", defaults.wait_ms)?,
        })
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
        };

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_validation() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_webhook_secret_is_rejected() {
        let config = PaymentConfig {
            webhook_secret: "short".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PaymentConfig {
            webhook_secret: "a-long-enough-shared-secret".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("Mock".parse::<ProviderKind>().unwrap(), ProviderKind::Mock);
        assert_eq!("hosted".parse::<ProviderKind>().unwrap(), ProviderKind::Hosted);
        assert!("stripe".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_publisher_endpoints_are_collected_by_name() {
        let vars = vec![
            (
                "PUBLISHER_MOONTON_BASE_URL".to_string(),
                "https://moonton.example/".to_string(),
            ),
            ("PUBLISHER_MOONTON_API_KEY".to_string(), "k1".to_string()),
            ("PUBLISHER_TIMEOUT_SECS".to_string(), "5".to_string()),
        ];

        let endpoints = PublisherConfig::endpoints_from_vars(vars.into_iter()).unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(
            endpoints.get("moonton"),
            Some(&PublisherEndpoint {
                base_url: "https://moonton.example".to_string(),
                api_key: "k1".to_string(),
            })
        );
    }

    #[test]
    fn test_publisher_endpoint_without_key_is_an_error() {
        let vars = vec![(
            "PUBLISHER_GARENA_BASE_URL".to_string(),
            "https://garena.example".to_string(),
        )];
        assert!(matches!(
            PublisherConfig::endpoints_from_vars(vars.into_iter()),
            Err(ConfigError::MissingVariable(_))
        ));
    }

    #[test]
    fn test_http_mode_requires_endpoints() {
        let config = PublisherConfig {
            mode: PublisherMode::Http,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
