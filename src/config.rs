use std::env;

use serde::Deserialize;

/// Development-only cipher secret. Never accepted when `APP_ENV=production`.
pub const DEV_ENCRYPTION_KEY: &str = "dev-only-calendar-key-do-not-use-in-production";
pub const DEFAULT_ENCRYPTION_SALT: &str = "calendar-sync/credential-cipher/v1";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub environment: Environment,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub encryption: EncryptionConfig,
    pub caldav: CalDavConfig,
    pub sync: SyncConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "development" | "dev" | "local" | "test" => Some(Environment::Development),
            "production" | "prod" => Some(Environment::Production),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    /// Shared secret used to verify bearer tokens issued by the platform.
    pub secret: String,
}

#[derive(Clone, Deserialize)]
pub struct EncryptionConfig {
    /// Secret the credential cipher key is derived from (`CALENDAR_ENCRYPTION_KEY`).
    pub secret: String,
    /// Salt for key derivation (`CALENDAR_ENCRYPTION_SALT`), at least 8 bytes.
    pub salt: String,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("secret", &"[REDACTED]")
            .field("salt", &self.salt)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalDavConfig {
    /// Provider endpoint used for discovery (`CALDAV_SERVER_URL`).
    pub server_url: String,
    /// Per-request timeout; a timeout is treated as a transient failure.
    pub timeout_seconds: u64,
    /// Maximum redirect hops followed per request (iCloud redirects to per-user shards).
    pub max_redirects: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Whether the periodic sync worker runs.
    pub worker_enabled: bool,
    /// How often (seconds) the worker looks for connections that are due.
    pub poll_interval_seconds: u64,
    /// Sync interval assigned to new connections.
    pub default_interval_seconds: i64,
    /// Lower bound accepted when users change a connection's interval.
    pub min_interval_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for the calendar API
    pub calendar_per_second: u64,
    /// Burst size for the calendar API
    pub calendar_burst: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_source(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_source<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let declared_env = var("APP_ENV")
            .map(|v| {
                Environment::from_str(&v)
                    .ok_or_else(|| ConfigError::InvalidValue("APP_ENV".to_string()))
            })
            .transpose()?;
        let environment = declared_env.unwrap_or(Environment::Development);

        // The development key is only used when APP_ENV says so explicitly.
        let encryption_secret = match var("CALENDAR_ENCRYPTION_KEY").filter(|v| !v.is_empty()) {
            Some(secret) => secret,
            None if declared_env != Some(Environment::Development) => {
                return Err(ConfigError::MissingEnv(
                    "CALENDAR_ENCRYPTION_KEY".to_string(),
                ))
            }
            None => {
                tracing::warn!(
                    "CALENDAR_ENCRYPTION_KEY is not set; using the development-only key"
                );
                DEV_ENCRYPTION_KEY.to_string()
            }
        };

        let encryption_salt = var("CALENDAR_ENCRYPTION_SALT")
            .unwrap_or_else(|| DEFAULT_ENCRYPTION_SALT.to_string());
        if encryption_salt.len() < 8 {
            return Err(ConfigError::InvalidValue(
                "CALENDAR_ENCRYPTION_SALT".to_string(),
            ));
        }

        Ok(Config {
            environment,
            server: ServerConfig {
                host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: var("PORT")
                    .unwrap_or_else(|| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: var("FRONTEND_URL")
                    .unwrap_or_else(|| "http://localhost:3000".to_string()),
            },
            database: DatabaseConfig {
                url: var("DATABASE_URL").unwrap_or_else(|| "sqlite://data/app.db".to_string()),
                max_connections: var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            jwt: JwtConfig {
                secret: var("JWT_SECRET")
                    .ok_or_else(|| ConfigError::MissingEnv("JWT_SECRET".to_string()))?,
            },
            encryption: EncryptionConfig {
                secret: encryption_secret,
                salt: encryption_salt,
            },
            caldav: CalDavConfig {
                server_url: var("CALDAV_SERVER_URL")
                    .unwrap_or_else(|| "https://caldav.icloud.com".to_string()),
                timeout_seconds: var("CALDAV_TIMEOUT_SECONDS")
                    .unwrap_or_else(|| "30".to_string())
                    .parse()
                    .unwrap_or(30u64),
                max_redirects: var("CALDAV_MAX_REDIRECTS")
                    .unwrap_or_else(|| "5".to_string())
                    .parse()
                    .unwrap_or(5usize),
            },
            sync: SyncConfig {
                worker_enabled: match var("SYNC_WORKER_ENABLED") {
                    Some(v) => match v.to_lowercase().as_str() {
                        "1" | "true" | "yes" => true,
                        "0" | "false" | "no" => false,
                        _ => true,
                    },
                    None => true,
                },
                poll_interval_seconds: var("SYNC_POLL_INTERVAL_SECONDS")
                    .unwrap_or_else(|| "60".to_string())
                    .parse()
                    .unwrap_or(60u64),
                default_interval_seconds: var("SYNC_DEFAULT_INTERVAL_SECONDS")
                    .unwrap_or_else(|| "300".to_string()) // 5 minutes
                    .parse()
                    .unwrap_or(300i64),
                min_interval_seconds: var("SYNC_MIN_INTERVAL_SECONDS")
                    .unwrap_or_else(|| "60".to_string())
                    .parse()
                    .unwrap_or(60i64),
            },
            rate_limit: RateLimitConfig {
                calendar_per_second: var("RATE_LIMIT_CALENDAR_PER_SECOND")
                    .unwrap_or_else(|| "2".to_string())
                    .parse()
                    .unwrap_or(2),
                calendar_burst: var("RATE_LIMIT_CALENDAR_BURST")
                    .unwrap_or_else(|| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            environment: Environment::Development,
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/app.db".to_string(),
                max_connections: 5,
            },
            jwt: JwtConfig {
                secret: String::new(),
            },
            encryption: EncryptionConfig {
                secret: DEV_ENCRYPTION_KEY.to_string(),
                salt: DEFAULT_ENCRYPTION_SALT.to_string(),
            },
            caldav: CalDavConfig {
                server_url: "https://caldav.icloud.com".to_string(),
                timeout_seconds: 30,
                max_redirects: 5,
            },
            sync: SyncConfig {
                worker_enabled: true,
                poll_interval_seconds: 60,
                default_interval_seconds: 300,
                min_interval_seconds: 60,
            },
            rate_limit: RateLimitConfig {
                calendar_per_second: 2,
                calendar_burst: 10,
            },
        }
    }
}
