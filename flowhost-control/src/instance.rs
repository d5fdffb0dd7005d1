//! Provisioned workflow-automation instances.
//!
//! An instance belongs to exactly one user. It is created in `deploying`
//! state pending provider confirmation, transitions to `running` on success
//! or `error` on failure, and is soft-deleted (status `deleting`,
//! `deleted_at` set) rather than hard-removed so audit history survives.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::account::UserId;
use crate::error::{ControlError, Result};

/// SSL status stored when a certificate probe fails.
///
/// The probe endpoint reports provider-defined status strings on success;
/// failures are downgraded to this value rather than propagated.
pub const SSL_STATUS_FAILED: &str = "FAILED";

/// Validated instance name, unique per user among live instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceName(String);

impl InstanceName {
    /// Creates a new instance name after validation.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidInstanceName`] if the name is empty,
    /// exceeds 64 characters, or contains characters outside `[A-Za-z0-9_-]`.
    pub fn new<S: Into<String>>(name: S) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(ControlError::InvalidInstanceName("name cannot be empty".into()));
        }
        if name.len() > 64 {
            return Err(ControlError::InvalidInstanceName(
                "name must be 64 characters or less".into(),
            ));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ControlError::InvalidInstanceName(
                "name can only contain alphanumeric characters, hyphens, and underscores".into(),
            ));
        }
        Ok(Self(name))
    }

    /// Returns the inner string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Instance lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created, waiting for provider confirmation.
    Deploying,
    /// Confirmed and serving.
    Running,
    /// Stopped by the user; still entitled.
    Stopped,
    /// Disabled by reconciliation (trial expiry); re-enabled on payment.
    Disabled,
    /// A foreground gateway call failed; surfaced on the record.
    Error,
    /// Soft-deleted.
    Deleting,
}

impl InstanceStatus {
    /// Terminal statuses are excluded from the quota count.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Deleting | Self::Error)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deploying => f.write_str("deploying"),
            Self::Running => f.write_str("running"),
            Self::Stopped => f.write_str("stopped"),
            Self::Disabled => f.write_str("disabled"),
            Self::Error => f.write_str("error"),
            Self::Deleting => f.write_str("deleting"),
        }
    }
}

/// SSL certificate sub-state for a custom domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslInfo {
    /// Provider-reported status, or [`SSL_STATUS_FAILED`] after a probe fault.
    pub status: String,
    /// Whether this domain is the primary domain for the instance.
    pub is_primary: bool,
    /// Provider-supplied detail or the probe failure message.
    pub message: Option<String>,
    /// When the status was last probed.
    pub last_checked: DateTime<Utc>,
}

impl SslInfo {
    /// Builds the downgraded record stored when an SSL probe fails.
    #[must_use]
    pub fn failed(message: String, now: DateTime<Utc>) -> Self {
        Self {
            status: SSL_STATUS_FAILED.to_owned(),
            is_primary: false,
            message: Some(message),
            last_checked: now,
        }
    }
}

/// Custom domain attached to an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomDomain {
    /// Fully qualified domain name.
    pub domain: String,
    /// Whether the domain is active at the provider.
    pub is_active: bool,
    /// Last known SSL state; `None` until the first probe.
    pub ssl: Option<SslInfo>,
}

/// Compute shape requested for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Provider region.
    pub region: String,
    /// Memory allocation in MiB.
    pub memory_mb: u32,
    /// CPU allocation in millicores.
    pub cpu_millis: u32,
}

impl Default for DeploymentSpec {
    fn default() -> Self {
        Self { region: "us-east".to_owned(), memory_mb: 512, cpu_millis: 500 }
    }
}

/// Operational metadata and audit fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceMetadata {
    /// Opaque provider response captured at deploy time.
    pub provider_response: Option<serde_json::Value>,
    /// Last known health detail.
    pub health: Option<String>,
    /// When reconciliation disabled the instance.
    pub disabled_at: Option<DateTime<Utc>>,
    /// Why the instance was disabled.
    pub disabled_reason: Option<String>,
    /// When payment reconciliation re-enabled the instance.
    pub enabled_at: Option<DateTime<Utc>>,
}

/// A provisioned instance document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Registry id.
    pub id: Uuid,
    /// Owning user.
    pub user_id: UserId,
    /// Name, unique per user among live instances.
    pub name: InstanceName,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Public URL assigned by the provider (`unique-url` in the deploy response).
    pub url: Option<String>,
    /// Custom domain sub-state.
    pub custom_domain: Option<CustomDomain>,
    /// Requested compute shape.
    pub deployment: DeploymentSpec,
    /// Operational metadata and audit fields.
    pub metadata: InstanceMetadata,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Soft-delete marker; `None` means live.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Instance {
    /// Creates a new instance in `deploying` state.
    #[must_use]
    pub fn new(user_id: UserId, name: InstanceName, spec: DeploymentSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            name,
            status: InstanceStatus::Deploying,
            url: None,
            custom_domain: None,
            deployment: spec,
            metadata: InstanceMetadata::default(),
            created_at: now,
            deleted_at: None,
        }
    }

    /// True if the instance has not been soft-deleted.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// The exact quota filter: live and not in a terminal status.
    ///
    /// Disabled instances count toward the quota; only `deleting` and
    /// `error` are excluded.
    #[must_use]
    pub fn counts_toward_quota(&self) -> bool {
        self.is_live() && !self.status.is_terminal()
    }

    /// True if trial reconciliation should disable this instance:
    /// live, not terminal, not already disabled.
    #[must_use]
    pub fn is_disable_candidate(&self) -> bool {
        self.counts_toward_quota() && self.status != InstanceStatus::Disabled
    }
}
