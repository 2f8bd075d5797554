use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, bail};

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
}

impl Config {
    /// Read `AGORA_*` variables from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let jwt_secret = lookup("AGORA_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("AGORA_JWT_SECRET is unset or still a placeholder; set it in your .env file");
        }

        let db_path = lookup("AGORA_DB_PATH").unwrap_or_else(|| "agora.db".into()).into();
        let host = lookup("AGORA_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = match lookup("AGORA_PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("AGORA_PORT is not a valid port: '{}'", raw))?,
            None => 3000,
        };

        Ok(Self {
            jwt_secret,
            db_path,
            host,
            port,
        })
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}
