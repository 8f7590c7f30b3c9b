use std::env;
use std::time::Duration;

/// Deployment environment, selected by `API_ENV`.
///
/// The environment decides which metric catalog is served, which base URL the
/// service advertises, and whether unreleased metrics are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Sandbox,
    Production,
}

impl Environment {
    pub fn from_name(name: &str) -> Self {
        match name {
            "DEVELOPMENT" => Self::Development,
            "STAGING" => Self::Staging,
            "SANDBOX" => Self::Sandbox,
            _ => Self::Production,
        }
    }

    pub fn is_development(self) -> bool {
        self == Self::Development
    }

    /// Origin advertised in absolute self-references. Empty in development.
    pub fn base_url(self) -> &'static str {
        match self {
            Self::Development => "",
            Self::Staging => "https://api.coronavirus-staging.data.gov.uk",
            Self::Sandbox | Self::Production => "https://api.coronavirus.data.gov.uk",
        }
    }
}

/// Runtime settings, loaded once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: Environment,
    pub connection_string: String,
    pub server_location: String,
    pub port: u16,
    pub pool_max_connections: u32,
    pub pool_acquire_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let environment = Environment::from_name(
            &env::var("API_ENV").unwrap_or_else(|_| "PRODUCTION".to_string()),
        );

        let connection_string = env::var("POSTGRES_CONNECTION_STRING")
            .map_err(|_| anyhow::anyhow!("POSTGRES_CONNECTION_STRING is not set"))?;

        let server_location = env::var("SERVER_LOCATION").unwrap_or_else(|_| "N/A".to_string());

        let port = env::var("API_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let pool_max_connections = env::var("POSTGRES_POOL_SIZE")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(10);

        let pool_acquire_timeout = Duration::from_secs(
            env::var("POSTGRES_ACQUIRE_TIMEOUT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(30),
        );

        Ok(Self {
            environment,
            connection_string,
            server_location,
            port,
            pool_max_connections,
            pool_acquire_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_from_name() {
        assert_eq!(Environment::from_name("DEVELOPMENT"), Environment::Development);
        assert_eq!(Environment::from_name("STAGING"), Environment::Staging);
        assert_eq!(Environment::from_name("SANDBOX"), Environment::Sandbox);
        assert_eq!(Environment::from_name("PRODUCTION"), Environment::Production);
        // Unknown values fall back to production (the restrictive default).
        assert_eq!(Environment::from_name("qa"), Environment::Production);
    }

    #[test]
    fn test_base_url_per_environment() {
        assert_eq!(Environment::Development.base_url(), "");
        assert!(Environment::Staging.base_url().contains("staging"));
        assert_eq!(
            Environment::Production.base_url(),
            "https://api.coronavirus.data.gov.uk"
        );
    }
}
