//! HTTP implementation of the deployment gateway.
//!
//! Talks to the provisioning service over basic-auth JSON POSTs with a
//! bounded timeout (30 s for provisioning operations, 10 s for SSL probes)
//! and IPv4-only resolution. Every transport fault is folded into a
//! [`GatewayResult`] failure; this module never returns an `Err` to callers
//! once constructed.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::instrument;

use super::{DeploymentGateway, GatewayResult};
use crate::account::UserId;
use crate::config::GatewayConfig;
use crate::error::{ControlError, Result};

/// Field of a successful deploy response holding the instance's public URL.
pub const UNIQUE_URL_FIELD: &str = "unique-url";

/// Gateway over the external provisioning HTTP API.
pub struct HttpDeploymentGateway {
    client: Client,
    ssl_client: Client,
    base_url: String,
    ssl_base_url: String,
    username: String,
    password: String,
}

impl std::fmt::Debug for HttpDeploymentGateway {
    // credentials stay out of debug output
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDeploymentGateway")
            .field("base_url", &self.base_url)
            .field("ssl_base_url", &self.ssl_base_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl HttpDeploymentGateway {
    /// Builds the gateway from validated configuration, resolving the
    /// password from the configured environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Config`] if the password variable is unset or
    /// an HTTP client cannot be constructed.
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let password = config.resolve_password()?;
        let client = build_client(Duration::from_secs(config.timeout_secs))?;
        let ssl_client = build_client(Duration::from_secs(config.ssl_timeout_secs))?;
        Ok(Self {
            client,
            ssl_client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            ssl_base_url: config.ssl_base_url.trim_end_matches('/').to_owned(),
            username: config.username.clone(),
            password,
        })
    }

    /// Issues one basic-auth JSON POST and normalizes the outcome.
    #[instrument(skip(self, client, body))]
    async fn post(
        &self,
        client: &Client,
        base: &str,
        path: &str,
        body: serde_json::Value,
    ) -> GatewayResult {
        let url = format!("{base}/{path}");
        let response = client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                if !response.status().is_success() {
                    return GatewayResult::failure(
                        Some(status),
                        format!("provisioner returned status {status}"),
                    );
                }
                match response.json::<serde_json::Value>().await {
                    Ok(data) => GatewayResult::ok(status, data),
                    Err(e) => GatewayResult::failure(
                        Some(status),
                        format!("invalid provisioner response: {e}"),
                    ),
                }
            }
            // timeouts, DNS failures, and refused connections all land here;
            // callers see them as ordinary gateway failures
            Err(e) => GatewayResult::failure(
                e.status().map(|s| s.as_u16()),
                format!("request to {url} failed: {e}"),
            ),
        }
    }

    async fn provision(&self, path: &str, user_id: &UserId) -> GatewayResult {
        let body = serde_json::json!({ "userId": user_id.as_str() });
        self.post(&self.client, &self.base_url, path, body).await
    }
}

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(10)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        // the provisioning service resolves over IPv4 only
        .local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        .build()
        .map_err(|e| ControlError::Config(format!("failed to build HTTP client: {e}")))
}

#[async_trait]
impl DeploymentGateway for HttpDeploymentGateway {
    async fn deploy_instance(&self, user_id: &UserId) -> GatewayResult {
        self.provision("deploy", user_id).await
    }

    async fn delete_instance(&self, user_id: &UserId) -> GatewayResult {
        self.provision("delete", user_id).await
    }

    async fn disable_instance(&self, user_id: &UserId) -> GatewayResult {
        self.provision("disable", user_id).await
    }

    async fn enable_instance(&self, user_id: &UserId) -> GatewayResult {
        self.provision("enable", user_id).await
    }

    async fn add_domain(&self, user_id: &UserId, domain: &str) -> GatewayResult {
        let body = serde_json::json!({ "userId": user_id.as_str(), "domain": domain });
        self.post(&self.client, &self.base_url, "domain", body).await
    }

    async fn check_ssl(&self, user_id: &UserId, domain: &str) -> GatewayResult {
        let body = serde_json::json!({ "range": domain, "USRID": user_id.as_str() });
        self.post(&self.ssl_client, &self.ssl_base_url, "ssl", body).await
    }
}
