//! S3 Butler configuration — environment resolution and validation.
//!
//! Everything is read once at startup into an immutable [`ButlerConfig`]
//! value that is passed explicitly into each façade constructor. Required
//! variables missing at startup fail fast with the variable named; optional
//! sections (analytics, tunnel) absent simply disable the dependent tools.

use std::collections::HashMap;

use crate::error::{ButlerError, Result};

/// Default endpoint for the S3 API (local cloudserver).
const DEFAULT_S3_ENDPOINT: &str = "http://127.0.0.1:8000";
/// Default endpoint for the IAM API (local vault).
const DEFAULT_IAM_ENDPOINT: &str = "http://127.0.0.1:8600";

/// Top-level configuration, resolved from the process environment.
#[derive(Debug, Clone)]
pub struct ButlerConfig {
    pub listen: ListenConfig,
    /// Team/organization name reported by the `get_team_name` tool.
    pub team_name: String,
    pub storage: StorageConfig,
    /// Present only when `CLICKHOUSE_HOST` is set; absence disables the
    /// ranking tools entirely.
    pub analytics: Option<AnalyticsConfig>,
    /// Auth token for an external tunnel service, recorded for operators.
    /// The tunnel itself is not managed by this process.
    pub tunnel_auth_token: Option<String>,
}

/// MCP transport listener settings.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// S3 + IAM endpoint and credential settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub s3_endpoint: String,
    pub iam_endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

/// ClickHouse connection settings for the analytics façade.
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
    pub secure: bool,
    pub verify: bool,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl AnalyticsConfig {
    /// Base URL of the ClickHouse HTTP interface.
    pub fn base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl ButlerConfig {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_map(&std::env::vars().collect())
    }

    /// Resolve configuration from a key/value snapshot.
    ///
    /// Split out from [`from_env`](Self::from_env) so tests can exercise
    /// resolution without mutating process-global environment state.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| vars.get(key).filter(|v| !v.is_empty()).cloned();

        let listen = ListenConfig {
            host: get("MCP_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_u16(vars, "MCP_PORT", 8000)?,
            path: get("MCP_PATH").unwrap_or_else(|| "/mcp".to_string()),
        };

        let storage = StorageConfig {
            s3_endpoint: get("S3_ENDPOINT").unwrap_or_else(|| DEFAULT_S3_ENDPOINT.to_string()),
            iam_endpoint: get("IAM_ENDPOINT").unwrap_or_else(|| DEFAULT_IAM_ENDPOINT.to_string()),
            access_key: get("S3_ACCESS_KEY").ok_or_else(|| ButlerError::missing_var("S3_ACCESS_KEY"))?,
            secret_key: get("S3_SECRET_KEY").ok_or_else(|| ButlerError::missing_var("S3_SECRET_KEY"))?,
        };

        // Analytics is opt-in: no host, no ranking tools.
        let analytics = match get("CLICKHOUSE_HOST") {
            None => None,
            Some(host) => Some(AnalyticsConfig {
                host,
                port: parse_u16(vars, "CLICKHOUSE_PORT", 8123)?,
                user: get("CLICKHOUSE_USER"),
                password: get("CLICKHOUSE_PASSWORD"),
                database: get("CLICKHOUSE_DATABASE").unwrap_or_else(|| "logs".to_string()),
                secure: parse_bool(vars, "CLICKHOUSE_SECURE", false)?,
                verify: parse_bool(vars, "CLICKHOUSE_VERIFY", true)?,
                connect_timeout_secs: parse_u64(vars, "CLICKHOUSE_CONNECT_TIMEOUT", 30)?,
                request_timeout_secs: parse_u64(vars, "CLICKHOUSE_SEND_RECEIVE_TIMEOUT", 300)?,
            }),
        };

        Ok(ButlerConfig {
            listen,
            team_name: get("TEAM_NAME").unwrap_or_else(|| "team1".to_string()),
            storage,
            analytics,
            tunnel_auth_token: get("NGROK_AUTH_TOKEN"),
        })
    }

    /// Whether the analytics backend (and its ranking tools) is configured.
    pub fn analytics_enabled(&self) -> bool {
        self.analytics.is_some()
    }
}

fn parse_u16(vars: &HashMap<String, String>, var: &str, default: u16) -> Result<u16> {
    match vars.get(var).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ButlerError::Config {
            var: var.to_string(),
            reason: format!("expected a port number, got '{}'", raw),
        }),
    }
}

fn parse_u64(vars: &HashMap<String, String>, var: &str, default: u64) -> Result<u64> {
    match vars.get(var).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ButlerError::Config {
            var: var.to_string(),
            reason: format!("expected an integer, got '{}'", raw),
        }),
    }
}

fn parse_bool(vars: &HashMap<String, String>, var: &str, default: bool) -> Result<bool> {
    match vars.get(var).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ButlerError::Config {
                var: var.to_string(),
                reason: format!("expected true/false, got '{}'", raw),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("S3_ACCESS_KEY".to_string(), "AKIA_TEST".to_string());
        vars.insert("S3_SECRET_KEY".to_string(), "secret".to_string());
        vars
    }

    #[test]
    fn test_defaults_applied() {
        let config = ButlerConfig::from_map(&base_vars()).unwrap();
        assert_eq!(config.listen.host, "0.0.0.0");
        assert_eq!(config.listen.port, 8000);
        assert_eq!(config.listen.path, "/mcp");
        assert_eq!(config.team_name, "team1");
        assert_eq!(config.storage.s3_endpoint, "http://127.0.0.1:8000");
        assert_eq!(config.storage.iam_endpoint, "http://127.0.0.1:8600");
        assert!(config.analytics.is_none());
        assert!(config.tunnel_auth_token.is_none());
    }

    #[test]
    fn test_missing_access_key_fails_fast() {
        let mut vars = base_vars();
        vars.remove("S3_ACCESS_KEY");
        let result = ButlerConfig::from_map(&vars);
        assert!(
            matches!(result, Err(ButlerError::Config { var, .. }) if var == "S3_ACCESS_KEY"),
            "missing S3_ACCESS_KEY should name the variable"
        );
    }

    #[test]
    fn test_missing_secret_key_fails_fast() {
        let mut vars = base_vars();
        vars.remove("S3_SECRET_KEY");
        let result = ButlerConfig::from_map(&vars);
        assert!(matches!(result, Err(ButlerError::Config { var, .. }) if var == "S3_SECRET_KEY"));
    }

    #[test]
    fn test_empty_value_treated_as_unset() {
        let mut vars = base_vars();
        vars.insert("S3_ACCESS_KEY".to_string(), "".to_string());
        assert!(ButlerConfig::from_map(&vars).is_err());
    }

    #[test]
    fn test_invalid_port_names_variable() {
        let mut vars = base_vars();
        vars.insert("MCP_PORT".to_string(), "not-a-port".to_string());
        let result = ButlerConfig::from_map(&vars);
        assert!(
            matches!(result, Err(ButlerError::Config { var, reason }) if var == "MCP_PORT" && reason.contains("not-a-port"))
        );
    }

    #[test]
    fn test_analytics_absent_without_host() {
        // User/password alone do not enable analytics — host is the switch
        let mut vars = base_vars();
        vars.insert("CLICKHOUSE_USER".to_string(), "default".to_string());
        let config = ButlerConfig::from_map(&vars).unwrap();
        assert!(!config.analytics_enabled());
    }

    #[test]
    fn test_analytics_defaults() {
        let mut vars = base_vars();
        vars.insert("CLICKHOUSE_HOST".to_string(), "ch.internal".to_string());
        let config = ButlerConfig::from_map(&vars).unwrap();
        let analytics = config.analytics.expect("analytics should be enabled");
        assert_eq!(analytics.port, 8123);
        assert_eq!(analytics.database, "logs");
        assert!(!analytics.secure);
        assert!(analytics.verify);
        assert_eq!(analytics.connect_timeout_secs, 30);
        assert_eq!(analytics.request_timeout_secs, 300);
        assert_eq!(analytics.base_url(), "http://ch.internal:8123");
    }

    #[test]
    fn test_analytics_secure_base_url() {
        let mut vars = base_vars();
        vars.insert("CLICKHOUSE_HOST".to_string(), "ch.internal".to_string());
        vars.insert("CLICKHOUSE_SECURE".to_string(), "true".to_string());
        vars.insert("CLICKHOUSE_PORT".to_string(), "8443".to_string());
        let config = ButlerConfig::from_map(&vars).unwrap();
        assert_eq!(
            config.analytics.unwrap().base_url(),
            "https://ch.internal:8443"
        );
    }

    #[test]
    fn test_analytics_invalid_bool_rejected() {
        let mut vars = base_vars();
        vars.insert("CLICKHOUSE_HOST".to_string(), "ch.internal".to_string());
        vars.insert("CLICKHOUSE_SECURE".to_string(), "maybe".to_string());
        let result = ButlerConfig::from_map(&vars);
        assert!(
            matches!(result, Err(ButlerError::Config { var, .. }) if var == "CLICKHOUSE_SECURE")
        );
    }

    #[test]
    fn test_overrides_respected() {
        let mut vars = base_vars();
        vars.insert("MCP_HOST".to_string(), "127.0.0.1".to_string());
        vars.insert("MCP_PORT".to_string(), "9000".to_string());
        vars.insert("MCP_PATH".to_string(), "/tools".to_string());
        vars.insert("TEAM_NAME".to_string(), "storage-platform".to_string());
        vars.insert("NGROK_AUTH_TOKEN".to_string(), "tok_123".to_string());
        let config = ButlerConfig::from_map(&vars).unwrap();
        assert_eq!(config.listen.host, "127.0.0.1");
        assert_eq!(config.listen.port, 9000);
        assert_eq!(config.listen.path, "/tools");
        assert_eq!(config.team_name, "storage-platform");
        assert_eq!(config.tunnel_auth_token.as_deref(), Some("tok_123"));
    }
}
