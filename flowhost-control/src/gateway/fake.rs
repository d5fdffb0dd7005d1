//! Scripted in-memory gateway for tests and local wiring.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{DeploymentGateway, GatewayResult};
use crate::account::UserId;

/// Provisioning operation, for scripting and call assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    /// `deploy_instance`
    Deploy,
    /// `delete_instance`
    Delete,
    /// `disable_instance`
    Disable,
    /// `enable_instance`
    Enable,
    /// `add_domain`
    AddDomain,
    /// `check_ssl`
    CheckSsl,
}

/// One recorded gateway invocation.
#[derive(Debug, Clone)]
pub struct GatewayCall {
    /// Which operation was invoked.
    pub op: GatewayOp,
    /// Target user.
    pub user_id: UserId,
    /// Domain argument, for domain/SSL operations.
    pub domain: Option<String>,
}

/// In-memory [`DeploymentGateway`] with scripted outcomes.
///
/// Unscripted calls succeed with a plausible response (deploys include a
/// `unique-url`). Scripted results are consumed in FIFO order per operation,
/// after which the default applies again, so a single scripted failure models
/// a transient fault that clears on retry.
#[derive(Debug, Default)]
pub struct StaticGateway {
    calls: Mutex<Vec<GatewayCall>>,
    scripted: Mutex<HashMap<GatewayOp, VecDeque<GatewayResult>>>,
}

impl StaticGateway {
    /// Creates a gateway where every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a result for the next invocation of `op`.
    pub async fn script(&self, op: GatewayOp, result: GatewayResult) {
        let mut scripted = self.scripted.lock().await;
        scripted.entry(op).or_default().push_back(result);
    }

    /// All calls made so far, in order.
    pub async fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().await.clone()
    }

    /// Number of calls made to `op`.
    pub async fn call_count(&self, op: GatewayOp) -> usize {
        self.calls.lock().await.iter().filter(|c| c.op == op).count()
    }

    async fn respond(&self, op: GatewayOp, user_id: &UserId, domain: Option<&str>) -> GatewayResult {
        self.calls.lock().await.push(GatewayCall {
            op,
            user_id: user_id.clone(),
            domain: domain.map(str::to_owned),
        });

        let mut scripted = self.scripted.lock().await;
        if let Some(queue) = scripted.get_mut(&op)
            && let Some(result) = queue.pop_front()
        {
            return result;
        }

        match op {
            GatewayOp::Deploy => GatewayResult::ok(
                200,
                serde_json::json!({ "unique-url": format!("https://{user_id}.flowhost.app") }),
            ),
            GatewayOp::CheckSsl => GatewayResult::ok(
                200,
                serde_json::json!({
                    "SSL_STATUS": "ACTIVE",
                    "Primary_domain": domain.unwrap_or_default(),
                    "Message": "certificate issued",
                }),
            ),
            _ => GatewayResult::ok(200, serde_json::json!({ "ok": true })),
        }
    }
}

#[async_trait]
impl DeploymentGateway for StaticGateway {
    async fn deploy_instance(&self, user_id: &UserId) -> GatewayResult {
        self.respond(GatewayOp::Deploy, user_id, None).await
    }

    async fn delete_instance(&self, user_id: &UserId) -> GatewayResult {
        self.respond(GatewayOp::Delete, user_id, None).await
    }

    async fn disable_instance(&self, user_id: &UserId) -> GatewayResult {
        self.respond(GatewayOp::Disable, user_id, None).await
    }

    async fn enable_instance(&self, user_id: &UserId) -> GatewayResult {
        self.respond(GatewayOp::Enable, user_id, None).await
    }

    async fn add_domain(&self, user_id: &UserId, domain: &str) -> GatewayResult {
        self.respond(GatewayOp::AddDomain, user_id, Some(domain)).await
    }

    async fn check_ssl(&self, user_id: &UserId, domain: &str) -> GatewayResult {
        self.respond(GatewayOp::CheckSsl, user_id, Some(domain)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_deploy_carries_unique_url() {
        let gateway = StaticGateway::new();
        let user = UserId::new("u1").unwrap();

        let result = gateway.deploy_instance(&user).await;
        assert!(result.success);
        assert_eq!(result.unique_url().as_deref(), Some("https://u1.flowhost.app"));
    }

    #[tokio::test]
    async fn test_scripted_failure_then_default() {
        let gateway = StaticGateway::new();
        let user = UserId::new("u1").unwrap();
        gateway
            .script(GatewayOp::Disable, GatewayResult::failure(None, "timeout"))
            .await;

        assert!(!gateway.disable_instance(&user).await.success);
        assert!(gateway.disable_instance(&user).await.success);
        assert_eq!(gateway.call_count(GatewayOp::Disable).await, 2);
    }
}
