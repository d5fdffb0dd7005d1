//! Control-plane configuration.
//!
//! TOML-deserializable configuration with security validation: base URLs
//! must be HTTPS and must not point at loopback hosts, and credentials are
//! referenced by environment-variable name rather than stored inline.
//!
//! ```toml
//! [gateway]
//! base_url = "https://provision.internal.example.com"
//! ssl_base_url = "https://ssl.internal.example.com"
//! username = "control-plane"
//! password_env = "FLOWHOST_GATEWAY_PASSWORD"
//!
//! [billing]
//! pro_price_threshold = 50
//!
//! [trial]
//! duration_minutes = 20160
//! reconcile_interval_secs = 3600
//! ```

use std::path::Path;

use rust_decimal::Decimal;
use serde::Deserialize;
use url::Url;

use crate::error::{ControlError, Result};

/// Root configuration for the control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Provisioning gateway endpoints and credentials.
    pub gateway: GatewayConfig,
    /// Billing policy knobs.
    #[serde(default)]
    pub billing: BillingConfig,
    /// Trial policy and reconciliation cadence.
    #[serde(default)]
    pub trial: TrialConfig,
}

impl ControlConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Config`] if the file is unreadable, fails to
    /// parse, or fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ControlError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| ControlError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the full configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Config`] describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        self.gateway.validate()?;
        self.billing.validate()?;
        self.trial.validate()?;
        Ok(())
    }
}

/// Provisioning gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Base URL of the provisioning API.
    pub base_url: String,
    /// Base URL of the SSL status endpoint.
    pub ssl_base_url: String,
    /// Basic-auth username.
    pub username: String,
    /// Name of the environment variable holding the basic-auth password.
    #[serde(default = "default_password_env")]
    pub password_env: String,
    /// Timeout for provisioning operations, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Timeout for SSL probes, in seconds.
    #[serde(default = "default_ssl_timeout_secs")]
    pub ssl_timeout_secs: u64,
}

impl GatewayConfig {
    /// Validates URLs and credential references.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Config`] if a URL is not HTTPS, points at a
    /// loopback host, or the credential configuration is malformed.
    pub fn validate(&self) -> Result<()> {
        validate_base_url("gateway.base_url", &self.base_url)?;
        validate_base_url("gateway.ssl_base_url", &self.ssl_base_url)?;
        if self.username.is_empty() {
            return Err(ControlError::Config("gateway.username cannot be empty".into()));
        }
        if self.password_env.is_empty()
            || !self
                .password_env
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ControlError::Config(format!(
                "gateway.password_env '{}' must be a valid environment variable name",
                self.password_env
            )));
        }
        if self.timeout_secs == 0 || self.ssl_timeout_secs == 0 {
            return Err(ControlError::Config("gateway timeouts must be positive".into()));
        }
        Ok(())
    }

    /// Reads the basic-auth password from the configured environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Config`] if the variable is unset or empty.
    pub fn resolve_password(&self) -> Result<String> {
        match std::env::var(&self.password_env) {
            Ok(password) if !password.is_empty() => Ok(password),
            _ => Err(ControlError::Config(format!(
                "environment variable {} is not set",
                self.password_env
            ))),
        }
    }
}

/// Billing policy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    /// Payment amounts at or above this map to the pro plan.
    #[serde(default = "default_pro_threshold")]
    pub pro_price_threshold: Decimal,
    /// Days between renewals; the next billing date is `now + this`.
    #[serde(default = "default_billing_period_days")]
    pub billing_period_days: i64,
}

impl BillingConfig {
    fn validate(&self) -> Result<()> {
        if self.pro_price_threshold <= Decimal::ZERO {
            return Err(ControlError::Config(
                "billing.pro_price_threshold must be positive".into(),
            ));
        }
        if self.billing_period_days <= 0 {
            return Err(ControlError::Config("billing.billing_period_days must be positive".into()));
        }
        Ok(())
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            pro_price_threshold: default_pro_threshold(),
            billing_period_days: default_billing_period_days(),
        }
    }
}

/// Trial policy and reconciliation cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct TrialConfig {
    /// Trial length in minutes.
    #[serde(default = "default_trial_minutes")]
    pub duration_minutes: i64,
    /// Seconds between trial-expiry reconciliation ticks.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

impl TrialConfig {
    fn validate(&self) -> Result<()> {
        if self.duration_minutes <= 0 {
            return Err(ControlError::Config("trial.duration_minutes must be positive".into()));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(ControlError::Config(
                "trial.reconcile_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Trial length as a chrono duration.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.duration_minutes)
    }
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            duration_minutes: default_trial_minutes(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
        }
    }
}

fn validate_base_url(field: &str, raw: &str) -> Result<()> {
    let url = Url::parse(raw)
        .map_err(|e| ControlError::Config(format!("invalid {field} '{raw}': {e}")))?;
    if url.scheme() != "https" {
        return Err(ControlError::Config(format!(
            "{field} must use HTTPS, got: {}",
            url.scheme()
        )));
    }
    if let Some(host) = url.host_str()
        && (host == "localhost" || host == "127.0.0.1" || host == "::1" || host == "[::1]")
    {
        return Err(ControlError::Config(format!("{field} must not point at loopback")));
    }
    Ok(())
}

fn default_password_env() -> String {
    "FLOWHOST_GATEWAY_PASSWORD".to_owned()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_ssl_timeout_secs() -> u64 {
    10
}

fn default_pro_threshold() -> Decimal {
    Decimal::from(50)
}

fn default_billing_period_days() -> i64 {
    30
}

fn default_trial_minutes() -> i64 {
    // 14 days
    20_160
}

fn default_reconcile_interval_secs() -> u64 {
    3_600
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> ControlConfig {
        toml::from_str(toml).unwrap()
    }

    const MINIMAL: &str = r#"
        [gateway]
        base_url = "https://provision.example.com"
        ssl_base_url = "https://ssl.example.com"
        username = "control-plane"
    "#;

    #[test]
    fn test_minimal_config_valid_with_defaults() {
        let config = parse(MINIMAL);
        assert!(config.validate().is_ok());
        assert_eq!(config.gateway.timeout_secs, 30);
        assert_eq!(config.gateway.ssl_timeout_secs, 10);
        assert_eq!(config.billing.pro_price_threshold, Decimal::from(50));
        assert_eq!(config.billing.billing_period_days, 30);
        assert_eq!(config.trial.reconcile_interval_secs, 3_600);
    }

    #[test]
    fn test_http_url_rejected() {
        let config = parse(
            r#"
            [gateway]
            base_url = "http://provision.example.com"
            ssl_base_url = "https://ssl.example.com"
            username = "control-plane"
        "#,
        );
        assert!(matches!(config.validate().unwrap_err(), ControlError::Config(_)));
    }

    #[test]
    fn test_loopback_rejected() {
        let config = parse(
            r#"
            [gateway]
            base_url = "https://127.0.0.1:8443"
            ssl_base_url = "https://ssl.example.com"
            username = "control-plane"
        "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_password_env_rejected() {
        let config = parse(
            r#"
            [gateway]
            base_url = "https://provision.example.com"
            ssl_base_url = "https://ssl.example.com"
            username = "control-plane"
            password_env = "NOT-A-VAR"
        "#,
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trial_duration_accessor() {
        let trial = TrialConfig { duration_minutes: 60, reconcile_interval_secs: 10 };
        assert_eq!(trial.duration(), chrono::Duration::minutes(60));
    }
}
