//! Environment configuration.
//!
//! Mirrors the `.env` + `std::env::var` convention used across the
//! workspace this crate was built from (every member leans on `dotenvy` for
//! local development and reads `DATABASE_URL` straight from the process
//! environment in tests).

use async_trait::async_trait;

use crate::error::ConfigError;

/// Recognized environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub database_url: String,
    /// HTTP health port. The core never binds it; exposure is an external
    /// collaborator, but the value is still part of the recognized config
    /// surface so a host process can read it from the same place.
    pub port: u16,
}

impl Config {
    /// Load configuration from the process environment, falling back to a
    /// `.env` file if present. Returns [`ConfigError::MissingVar`] for
    /// required variables that are absent.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let database_url = required("DATABASE_URL")?;
        let redis_host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let redis_port = optional_parsed("REDIS_PORT", 6379)?;
        let redis_password = std::env::var("REDIS_PASSWORD").ok();
        let port = optional_parsed("PORT", 8080)?;

        Ok(Self {
            redis_host,
            redis_port,
            redis_password,
            database_url,
            port,
        })
    }

    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{password}@{host}:{port}",
                password = password,
                host = self.redis_host,
                port = self.redis_port
            ),
            None => format!("redis://{host}:{port}", host = self.redis_host, port = self.redis_port),
        }
    }
}

/// Install a `tracing_subscriber::fmt` layer filtered by `RUST_LOG`
/// (default `workflow_engine=info`), the way a host binary wires up
/// logging before starting a [`crate::worker::WorkerService`]. The
/// library itself never calls this on its own initiative.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workflow_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

fn optional_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidVar {
            name: name.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

/// A named secret, fetched from an external secret store. The store itself
/// is out of scope; this trait is the seam a host process
/// plugs a real implementation into, e.g. to resolve `redis_password`
/// instead of reading `REDIS_PASSWORD` from plain environment.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<String>, ConfigError>;
}

/// Default secret store used when no external one is wired in: every
/// lookup resolves to "not present", pushing callers back to plain
/// environment variables.
#[derive(Debug, Default)]
pub struct NullSecretStore;

#[async_trait]
impl SecretStore for NullSecretStore {
    async fn get(&self, _name: &str) -> Result<Option<String>, ConfigError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_var_is_an_error() {
        // SAFETY: test-local; no other test in this process reads this var.
        std::env::remove_var("DATABASE_URL_TEST_PROBE");
        let result = required("DATABASE_URL_TEST_PROBE");
        assert!(matches!(result, Err(ConfigError::MissingVar(_))));
    }

    #[test]
    fn optional_parsed_falls_back_to_default() {
        std::env::remove_var("PORT_TEST_PROBE");
        let value: u16 = optional_parsed("PORT_TEST_PROBE", 9999).unwrap();
        assert_eq!(value, 9999);
    }

    #[tokio::test]
    async fn null_secret_store_returns_none() {
        let store = NullSecretStore;
        assert_eq!(store.get("anything").await.unwrap(), None);
    }
}
