//! Deployment gateway: abstraction over the external provisioning API.
//!
//! Every operation returns a normalized [`GatewayResult`] — network faults,
//! timeouts, and remote rejections are all captured as `success: false` with
//! a synthetic error payload, never raised to callers. No retry happens at
//! this layer; callers decide whether a failure is terminal (foreground
//! operations mark the instance `error`) or transient (background
//! reconciliation leaves the instance for the next pass).

mod fake;
mod http;

pub use fake::{GatewayCall, GatewayOp, StaticGateway};
pub use http::{HttpDeploymentGateway, UNIQUE_URL_FIELD};

use async_trait::async_trait;

use crate::account::UserId;

/// Normalized outcome of a provisioning call.
#[derive(Debug, Clone)]
pub struct GatewayResult {
    /// Whether the remote operation succeeded.
    pub success: bool,
    /// HTTP status, when a response was received.
    pub status: Option<u16>,
    /// Parsed response body on success.
    pub data: Option<serde_json::Value>,
    /// Failure detail; synthetic for transport faults.
    pub error: Option<String>,
}

impl GatewayResult {
    /// Successful result with a parsed response body.
    #[must_use]
    pub fn ok(status: u16, data: serde_json::Value) -> Self {
        Self { success: true, status: Some(status), data: Some(data), error: None }
    }

    /// Failed result; `status` is absent for transport-level faults.
    #[must_use]
    pub fn failure(status: Option<u16>, error: impl Into<String>) -> Self {
        Self { success: false, status, data: None, error: Some(error.into()) }
    }

    /// Extracts the `unique-url` field a successful deploy response carries.
    #[must_use]
    pub fn unique_url(&self) -> Option<String> {
        self.data
            .as_ref()
            .and_then(|d| d.get(UNIQUE_URL_FIELD))
            .and_then(|v| v.as_str())
            .map(str::to_owned)
    }

    /// Failure detail, with a fallback for results lacking one.
    #[must_use]
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("unknown gateway error")
    }
}

/// External provisioning API, keyed by user id.
///
/// Injected into the orchestrator and the reconciliation loops so both can
/// be exercised against [`StaticGateway`] in tests.
#[async_trait]
pub trait DeploymentGateway: Send + Sync {
    /// Provisions the user's deployment.
    async fn deploy_instance(&self, user_id: &UserId) -> GatewayResult;

    /// Destroys the user's deployment.
    async fn delete_instance(&self, user_id: &UserId) -> GatewayResult;

    /// Suspends the user's deployment without destroying it.
    async fn disable_instance(&self, user_id: &UserId) -> GatewayResult;

    /// Resumes a previously disabled deployment.
    async fn enable_instance(&self, user_id: &UserId) -> GatewayResult;

    /// Attaches a custom domain to the user's deployment.
    async fn add_domain(&self, user_id: &UserId, domain: &str) -> GatewayResult;

    /// Probes certificate status for a custom domain.
    async fn check_ssl(&self, user_id: &UserId, domain: &str) -> GatewayResult;
}
