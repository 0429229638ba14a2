//! Stream worker configuration.
//!
//! Configuration is loaded from environment variables. Every value has a
//! default; a value that is present but cannot be parsed is an error.

use crate::lifecycle::LifecycleSettings;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default inbound HTTP bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:1935";

/// Default control plane base URL.
pub const DEFAULT_CONTROL_PLANE_URL: &str = "http://localhost:8080";

/// Default instance lifetime in seconds (6 hours).
pub const DEFAULT_LIFETIME_SECONDS: u64 = 21_600;

/// Default inactivity timeout in seconds (15 minutes).
pub const DEFAULT_INACTIVITY_TIMEOUT_SECONDS: u64 = 900;

/// Default transport shutdown grace period in seconds.
pub const DEFAULT_SHUTDOWN_GRACE_SECONDS: u64 = 5;

/// Default bound on dialing a session target, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 10;

/// Default per-request bound on control plane calls, in seconds.
pub const DEFAULT_NOTIFY_TIMEOUT_SECONDS: u64 = 10;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "sw";

/// Stream worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Inbound HTTP bind address (default: "0.0.0.0:1935").
    pub bind_address: String,

    /// Base URL of the control plane.
    pub control_plane_url: String,

    /// Unique identifier for this instance.
    pub instance_id: String,

    pub lifetime_seconds: u64,

    pub inactivity_timeout_seconds: u64,

    /// Time allowed for the HTTP server to stop once sessions have drained.
    pub shutdown_grace_seconds: u64,

    pub connect_timeout_seconds: u64,

    pub notify_timeout_seconds: u64,

    /// Optional cap on one session's processing. Unset means unbounded.
    pub max_session_seconds: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional integer variable.
fn parse_u64(vars: &HashMap<String, String>, name: &str) -> Result<Option<u64>, ConfigError> {
    vars.get(name)
        .map(|value| {
            value.trim().parse::<u64>().map_err(|e| {
                ConfigError::InvalidValue(format!(
                    "{name} must be a valid non-negative integer, got '{value}': {e}"
                ))
            })
        })
        .transpose()
}

/// Parse an optional integer variable that must be greater than zero.
fn parse_positive(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    match parse_u64(vars, name)? {
        Some(0) => Err(ConfigError::InvalidValue(format!(
            "{name} must be greater than zero"
        ))),
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but invalid.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("SW_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let control_plane_url = vars
            .get("CONTROL_PLANE_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONTROL_PLANE_URL.to_string());

        match reqwest::Url::parse(&control_plane_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(ConfigError::InvalidValue(format!(
                    "CONTROL_PLANE_URL must use http or https, got '{}'",
                    url.scheme()
                )));
            }
            Err(e) => {
                return Err(ConfigError::InvalidValue(format!(
                    "CONTROL_PLANE_URL must be a valid URL, got '{control_plane_url}': {e}"
                )));
            }
        }

        let lifetime_seconds =
            parse_positive(vars, "SW_LIFETIME_SECONDS", DEFAULT_LIFETIME_SECONDS)?;
        let inactivity_timeout_seconds = parse_positive(
            vars,
            "SW_INACTIVITY_TIMEOUT_SECONDS",
            DEFAULT_INACTIVITY_TIMEOUT_SECONDS,
        )?;
        let shutdown_grace_seconds = parse_u64(vars, "SW_SHUTDOWN_GRACE_SECONDS")?
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECONDS);
        let connect_timeout_seconds = parse_positive(
            vars,
            "SW_CONNECT_TIMEOUT_SECONDS",
            DEFAULT_CONNECT_TIMEOUT_SECONDS,
        )?;
        let notify_timeout_seconds = parse_positive(
            vars,
            "SW_NOTIFY_TIMEOUT_SECONDS",
            DEFAULT_NOTIFY_TIMEOUT_SECONDS,
        )?;
        let max_session_seconds = match parse_u64(vars, "SW_MAX_SESSION_SECONDS")? {
            Some(0) => {
                return Err(ConfigError::InvalidValue(
                    "SW_MAX_SESSION_SECONDS must be greater than zero when set".to_string(),
                ));
            }
            other => other,
        };

        // Generate instance ID
        let instance_id = vars.get("SW_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = vars
                .get("HOSTNAME")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().simple().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            control_plane_url,
            instance_id,
            lifetime_seconds,
            inactivity_timeout_seconds,
            shutdown_grace_seconds,
            connect_timeout_seconds,
            notify_timeout_seconds,
            max_session_seconds,
        })
    }

    /// Timing parameters for the shutdown coordinator.
    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            lifetime: Duration::from_secs(self.lifetime_seconds),
            inactivity_timeout: Duration::from_secs(self.inactivity_timeout_seconds),
            grace_period: Duration::from_secs(self.shutdown_grace_seconds),
            max_session_duration: self.max_session_seconds.map(Duration::from_secs),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_seconds)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.control_plane_url, DEFAULT_CONTROL_PLANE_URL);
        assert_eq!(config.lifetime_seconds, 21_600);
        assert_eq!(config.inactivity_timeout_seconds, 900);
        assert_eq!(config.shutdown_grace_seconds, 5);
        assert_eq!(config.connect_timeout_seconds, 10);
        assert_eq!(config.notify_timeout_seconds, 10);
        assert_eq!(config.max_session_seconds, None);
        // Instance ID should be auto-generated
        assert!(config.instance_id.starts_with("sw-unknown-"));
        assert_eq!(config.instance_id.len(), "sw-unknown-".len() + 8);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let config = Config::from_vars(&vars(&[
            ("SW_BIND_ADDRESS", "127.0.0.1:8935"),
            ("CONTROL_PLANE_URL", "https://control.internal/api"),
            ("SW_INSTANCE_ID", "sw-custom-001"),
            ("SW_LIFETIME_SECONDS", "3600"),
            ("SW_INACTIVITY_TIMEOUT_SECONDS", "60"),
            ("SW_SHUTDOWN_GRACE_SECONDS", "0"),
            ("SW_CONNECT_TIMEOUT_SECONDS", "3"),
            ("SW_NOTIFY_TIMEOUT_SECONDS", "2"),
            ("SW_MAX_SESSION_SECONDS", "600"),
        ]))
        .expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:8935");
        assert_eq!(config.control_plane_url, "https://control.internal/api");
        assert_eq!(config.instance_id, "sw-custom-001");
        assert_eq!(config.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.notify_timeout(), Duration::from_secs(2));

        let settings = config.lifecycle_settings();
        assert_eq!(settings.lifetime, Duration::from_secs(3600));
        assert_eq!(settings.inactivity_timeout, Duration::from_secs(60));
        assert_eq!(settings.grace_period, Duration::ZERO);
        assert_eq!(settings.max_session_duration, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_instance_id_uses_hostname() {
        let config = Config::from_vars(&vars(&[("HOSTNAME", "worker-7")])).unwrap();
        assert!(config.instance_id.starts_with("sw-worker-7-"));
    }

    #[test]
    fn test_default_lifecycle_settings_match_defaults() {
        let config = Config::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.lifecycle_settings(), LifecycleSettings::default());
    }

    #[test]
    fn test_unparseable_value_is_rejected() {
        let result = Config::from_vars(&vars(&[("SW_LIFETIME_SECONDS", "six hours")]));

        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("SW_LIFETIME_SECONDS"))
        );
    }

    #[test]
    fn test_negative_value_is_rejected() {
        let result = Config::from_vars(&vars(&[("SW_SHUTDOWN_GRACE_SECONDS", "-1")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_zero_timers_are_rejected() {
        for name in ["SW_LIFETIME_SECONDS", "SW_INACTIVITY_TIMEOUT_SECONDS"] {
            let result = Config::from_vars(&vars(&[(name, "0")]));
            assert!(
                matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("greater than zero")),
                "{name}=0 should be rejected"
            );
        }
    }

    #[test]
    fn test_zero_max_session_is_rejected() {
        let result = Config::from_vars(&vars(&[("SW_MAX_SESSION_SECONDS", "0")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_invalid_control_plane_url_is_rejected() {
        let result = Config::from_vars(&vars(&[("CONTROL_PLANE_URL", "not a url")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));

        let result = Config::from_vars(&vars(&[("CONTROL_PLANE_URL", "ftp://control/")]));
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("http or https"))
        );
    }
}
