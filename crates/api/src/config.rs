//! Server configuration

use billsync_billing::{BillingError, EmailConfig, StripeConfig, DEFAULT_PLAN_NAME};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error(transparent)]
    Billing(#[from] BillingError),
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    pub bind_address: String,
    pub stripe: StripeConfig,
    /// `None` disables billing mail
    pub email: Option<EmailConfig>,
    /// Plan tenants fall back to without a live subscription
    pub default_plan_name: String,
    /// Bearer token for `/api/v1/admin`. Admin routes reject everything when unset.
    pub admin_api_token: Option<String>,
    pub run_migrations: bool,
    /// Comma-separated allowed origins
    pub cors_origins: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let run_migrations = match std::env::var("RUN_MIGRATIONS") {
            Ok(v) => parse_bool(&v).ok_or_else(|| ConfigError::Invalid {
                name: "RUN_MIGRATIONS",
                reason: format!("expected true or false, got '{v}'"),
            })?,
            Err(_) => true,
        };

        Ok(Self {
            database_url,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            stripe: StripeConfig::from_env()?,
            email: EmailConfig::from_env(),
            default_plan_name: std::env::var("DEFAULT_PLAN_NAME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PLAN_NAME.to_string()),
            admin_api_token: std::env::var("ADMIN_API_TOKEN")
                .ok()
                .filter(|v| !v.is_empty()),
            run_migrations,
            cors_origins: std::env::var("CORS_ORIGIN")
                .map(|v| parse_origins(&v))
                .unwrap_or_default(),
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booleans_accept_common_spellings() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool(" off "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn origins_are_trimmed_and_blank_entries_dropped() {
        assert_eq!(
            parse_origins("https://app.example.test, ,http://localhost:3000"),
            vec!["https://app.example.test", "http://localhost:3000"]
        );
    }
}
