//! Instance orchestration API.
//!
//! The request-driven surface: creation, deletion, domain management, and
//! subscription transitions. Every mutating operation consults the
//! entitlement evaluator before touching the registry or the gateway.
//!
//! Foreground failure policy: when a gateway call fails here, the instance
//! is marked `error` so the fault is visible on the user's record, and a
//! [`ControlError::Gateway`] is surfaced. (Background reconciliation takes
//! the opposite choice and leaves state untouched for retry.)

use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::account::{
    AccountDirectory, Plan, SubscriptionStatus, UNLIMITED_INSTANCES, UserAccount, UserId,
};
use crate::clock::Clock;
use crate::entitlement::{self, EntitlementSummary};
use crate::error::{ControlError, Result};
use crate::gateway::DeploymentGateway;
use crate::instance::{DeploymentSpec, Instance, InstanceName, InstanceStatus, SslInfo};
use crate::registry::Registry;

/// Request to create an instance.
#[derive(Debug, Clone)]
pub struct CreateInstanceParams {
    /// Desired instance name; must be unique among the user's live instances.
    pub name: String,
    /// Requested compute shape.
    pub deployment: DeploymentSpec,
}

/// The orchestration surface over registry, gateway, and evaluator.
pub struct Orchestrator {
    directory: Arc<AccountDirectory>,
    registry: Arc<Registry>,
    gateway: Arc<dyn DeploymentGateway>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Wires the orchestrator to its collaborators.
    #[must_use]
    pub fn new(
        directory: Arc<AccountDirectory>,
        registry: Arc<Registry>,
        gateway: Arc<dyn DeploymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { directory, registry, gateway, clock }
    }

    // ------------------------------------------------------------------
    // Subscription transitions
    // ------------------------------------------------------------------

    /// Registers a new account starting in trial.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::DuplicateAccount`] if the account already
    /// exists.
    pub async fn register_trial(
        &self,
        user_id: UserId,
        referrer: Option<UserId>,
        plan: Plan,
        trial_duration: chrono::Duration,
    ) -> Result<UserAccount> {
        if self.directory.get(&user_id).await.is_some() {
            return Err(ControlError::DuplicateAccount(user_id.as_str().to_owned()));
        }
        let account =
            UserAccount::with_trial(user_id, referrer, plan, self.clock.now(), trial_duration);
        self.directory.replace(account.clone()).await;
        info!(user = %account.id, %plan, "trial started");
        Ok(account)
    }

    /// Converts a subscription to paid without a payment event (admin path).
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for unknown accounts.
    pub async fn convert_to_paid(
        &self,
        user_id: &UserId,
        plan: Plan,
        billing_period: chrono::Duration,
    ) -> Result<UserAccount> {
        let now = self.clock.now();
        self.directory
            .update(user_id, move |account| {
                let sub = &mut account.subscription;
                sub.status = SubscriptionStatus::Active;
                sub.plan = plan;
                sub.max_instances = Some(plan.default_quota());
                sub.next_billing_date = Some(now + billing_period);
                sub.expired_at = None;
                account.clone()
            })
            .await
    }

    /// Upgrades any subscription to active pro with unlimited instances.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for unknown accounts.
    pub async fn upgrade_to_pro(&self, user_id: &UserId) -> Result<UserAccount> {
        let account = self
            .directory
            .update(user_id, |account| {
                let sub = &mut account.subscription;
                sub.status = SubscriptionStatus::Active;
                sub.plan = Plan::Pro;
                sub.max_instances = Some(UNLIMITED_INSTANCES);
                sub.expired_at = None;
                account.clone()
            })
            .await?;
        info!(user = %user_id, "upgraded to pro");
        Ok(account)
    }

    // ------------------------------------------------------------------
    // Read surface
    // ------------------------------------------------------------------

    /// Evaluates the entitlement read model for a user.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for unknown accounts.
    pub async fn entitlement(&self, user_id: &UserId) -> Result<EntitlementSummary> {
        let account = self.account(user_id).await?;
        let live = self.registry.live_count(user_id).await;
        Ok(EntitlementSummary::evaluate(&account, live, self.clock.now()))
    }

    /// All of a user's instances, soft-deleted included.
    pub async fn instances(&self, user_id: &UserId) -> Vec<Instance> {
        self.registry.instances_for(user_id).await
    }

    // ------------------------------------------------------------------
    // Instance operations
    // ------------------------------------------------------------------

    /// Creates and deploys an instance.
    ///
    /// # Errors
    ///
    /// Returns an entitlement error when the subscription is inactive or the
    /// quota is reached, [`ControlError::DuplicateName`] on a live-name
    /// collision, and [`ControlError::Gateway`] when deployment fails (the
    /// instance record is then left in `error`).
    #[instrument(skip(self, params), fields(user = %user_id))]
    pub async fn create_instance(
        &self,
        user_id: &UserId,
        params: CreateInstanceParams,
    ) -> Result<Instance> {
        let name = InstanceName::new(params.name)?;
        let account = self.account(user_id).await?;
        let now = self.clock.now();

        let sub = &account.subscription;
        if !entitlement::is_subscription_active(sub, now) {
            return Err(ControlError::SubscriptionInactive(sub.status.to_string()));
        }
        let live = self.registry.live_count(user_id).await;
        if !entitlement::can_create_instance(sub, now, live) {
            return Err(ControlError::QuotaExceeded {
                current: live,
                max: entitlement::max_instances(sub, now),
            });
        }

        let instance = self.registry.create(user_id, name, params.deployment, now).await?;

        let result = self.gateway.deploy_instance(user_id).await;
        if !result.success {
            self.fail_instance(instance.id, result.error_message()).await;
            return Err(ControlError::Gateway(result.error_message().to_owned()));
        }
        let Some(url) = result.unique_url() else {
            self.fail_instance(instance.id, "deploy response missing unique-url").await;
            return Err(ControlError::Gateway("deploy response missing unique-url".into()));
        };

        let instance = self.registry.mark_running(instance.id, url, result.data).await?;
        info!(instance = %instance.id, "instance deployed");
        Ok(instance)
    }

    /// Deletes an instance: remote teardown, then soft delete.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] if the user has no such live
    /// instance and [`ControlError::Gateway`] when teardown fails (the
    /// record is marked `error` and kept).
    #[instrument(skip(self), fields(user = %user_id, instance = %instance_id))]
    pub async fn delete_instance(&self, user_id: &UserId, instance_id: Uuid) -> Result<Instance> {
        let instance = self.registry.owned_live(user_id, instance_id).await?;

        let result = self.gateway.delete_instance(user_id).await;
        if !result.success {
            self.fail_instance(instance.id, result.error_message()).await;
            return Err(ControlError::Gateway(result.error_message().to_owned()));
        }

        let deleted = self.registry.soft_delete(instance.id, self.clock.now()).await?;
        info!(instance = %instance_id, "instance deleted");
        Ok(deleted)
    }

    /// Attaches a custom domain to an instance.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidDomain`] for malformed domains,
    /// [`ControlError::DuplicateDomain`] if another live instance of the
    /// user already carries it, and [`ControlError::Gateway`] when the
    /// provider rejects it (the record is marked `error`).
    pub async fn set_custom_domain(
        &self,
        user_id: &UserId,
        instance_id: Uuid,
        domain: &str,
    ) -> Result<Instance> {
        validate_domain(domain)?;
        let instance = self.registry.owned_live(user_id, instance_id).await?;

        let taken = self.registry.instances_for(user_id).await.into_iter().any(|i| {
            i.id != instance.id
                && i.is_live()
                && i.custom_domain.as_ref().is_some_and(|d| d.domain == domain)
        });
        if taken {
            return Err(ControlError::DuplicateDomain(domain.to_owned()));
        }

        let result = self.gateway.add_domain(user_id, domain).await;
        if !result.success {
            self.fail_instance(instance.id, result.error_message()).await;
            return Err(ControlError::Gateway(result.error_message().to_owned()));
        }

        self.registry.set_custom_domain(instance.id, Some(domain.to_owned())).await
    }

    /// Detaches the custom domain. Registry-only; the provider keeps serving
    /// the canonical URL.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] if the user has no such live
    /// instance.
    pub async fn remove_custom_domain(
        &self,
        user_id: &UserId,
        instance_id: Uuid,
    ) -> Result<Instance> {
        self.registry.owned_live(user_id, instance_id).await?;
        self.registry.set_custom_domain(instance_id, None).await
    }

    /// Probes and stores SSL status for an instance's custom domain.
    ///
    /// A probe failure is downgraded to a stored `FAILED` record rather than
    /// surfaced as an error.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] if the instance is missing or has
    /// no custom domain.
    pub async fn refresh_ssl(&self, user_id: &UserId, instance_id: Uuid) -> Result<SslInfo> {
        let instance = self.registry.owned_live(user_id, instance_id).await?;
        let domain = instance
            .custom_domain
            .as_ref()
            .map(|d| d.domain.clone())
            .ok_or_else(|| {
                ControlError::NotFound(format!("instance {instance_id} has no custom domain"))
            })?;

        let now = self.clock.now();
        let result = self.gateway.check_ssl(user_id, &domain).await;
        let ssl = if result.success {
            let data = result.data.unwrap_or_default();
            SslInfo {
                status: data
                    .get("SSL_STATUS")
                    .and_then(|v| v.as_str())
                    .unwrap_or("UNKNOWN")
                    .to_owned(),
                is_primary: data
                    .get("Primary_domain")
                    .and_then(|v| v.as_str())
                    .is_some_and(|primary| primary == domain),
                message: data.get("Message").and_then(|v| v.as_str()).map(str::to_owned),
                last_checked: now,
            }
        } else {
            warn!(
                instance = %instance_id,
                error = result.error_message(),
                "ssl probe failed; storing FAILED status"
            );
            SslInfo::failed(result.error_message().to_owned(), now)
        };

        self.registry.set_ssl_info(instance_id, ssl.clone()).await?;
        Ok(ssl)
    }

    // ------------------------------------------------------------------

    async fn account(&self, user_id: &UserId) -> Result<UserAccount> {
        self.directory
            .get(user_id)
            .await
            .ok_or_else(|| ControlError::NotFound(format!("account {user_id}")))
    }

    /// Foreground failure policy: surface the fault on the instance record.
    async fn fail_instance(&self, instance_id: Uuid, detail: &str) {
        let result = self
            .registry
            .update(instance_id, |i| {
                i.status = InstanceStatus::Error;
                i.metadata.health = Some(detail.to_owned());
            })
            .await;
        if let Err(e) = result {
            warn!(instance = %instance_id, error = %e, "could not record instance error");
        }
    }
}

fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() || domain.len() > 253 {
        return Err(ControlError::InvalidDomain("domain length out of range".into()));
    }
    let valid_label = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    };
    if !domain.contains('.') || !domain.split('.').all(valid_label) {
        return Err(ControlError::InvalidDomain(format!("'{domain}' is not a valid hostname")));
    }
    Ok(())
}
