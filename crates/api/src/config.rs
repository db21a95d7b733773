//! API server configuration

use std::net::SocketAddr;

use thiserror::Error;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct connection for migrations when the main URL goes through a pooler
    pub database_direct_url: Option<String>,
    pub bind_address: SocketAddr,
    pub run_migrations: bool,
    /// Bearer token for `/admin/*`; admin routes refuse every request when unset
    pub admin_api_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        let raw_bind =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());
        let bind_address = raw_bind.parse().map_err(|_| ConfigError::Invalid {
            name: "BIND_ADDRESS",
            value: raw_bind.clone(),
        })?;

        let run_migrations = std::env::var("RUN_MIGRATIONS")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Ok(Self {
            database_url,
            database_direct_url: std::env::var("DATABASE_DIRECT_URL").ok(),
            bind_address,
            run_migrations,
            admin_api_token: std::env::var("ADMIN_API_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
        })
    }

    /// URL used for migrations
    pub fn migration_url(&self) -> &str {
        self.database_direct_url
            .as_deref()
            .unwrap_or(&self.database_url)
    }
}
