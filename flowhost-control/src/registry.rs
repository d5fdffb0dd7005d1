//! Instance registry: the per-user catalog of provisioned instances.
//!
//! The registry is the single place instance documents are created, mutated,
//! and queried. Like [`crate::account::AccountDirectory`] it stands in for
//! the backing document store: per-document updates are atomic under the
//! write lock, there is no cross-document transaction, and concurrent
//! writers against the same document are last-writer-wins.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::account::UserId;
use crate::error::{ControlError, Result};
use crate::instance::{
    CustomDomain, DeploymentSpec, Instance, InstanceName, InstanceStatus, SslInfo,
};

/// Catalog of provisioned instances.
#[derive(Debug, Default)]
pub struct Registry {
    instances: RwLock<HashMap<Uuid, Instance>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an instance in `deploying` state.
    ///
    /// Enforces the live-name invariant: at most one non-deleted instance per
    /// `(user, name)` pair. Soft-deleted instances never block reuse.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::DuplicateName`] if the user already has a live
    /// instance with this name.
    pub async fn create(
        &self,
        user_id: &UserId,
        name: InstanceName,
        spec: DeploymentSpec,
        now: DateTime<Utc>,
    ) -> Result<Instance> {
        let mut instances = self.instances.write().await;
        let duplicate = instances
            .values()
            .any(|i| i.user_id == *user_id && i.is_live() && i.name == name);
        if duplicate {
            return Err(ControlError::DuplicateName(name.as_str().to_owned()));
        }
        let instance = Instance::new(user_id.clone(), name, spec, now);
        instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    /// Returns a snapshot of the instance, if present.
    pub async fn get(&self, id: Uuid) -> Option<Instance> {
        let instances = self.instances.read().await;
        instances.get(&id).cloned()
    }

    /// Applies `f` to the instance document under the write lock and returns
    /// the updated snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] if the instance does not exist.
    pub async fn update(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Instance),
    ) -> Result<Instance> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&id)
            .ok_or_else(|| ControlError::NotFound(format!("instance {id}")))?;
        f(instance);
        Ok(instance.clone())
    }

    /// Soft-deletes the instance: sets `deleted_at` and forces `deleting`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] if the instance does not exist.
    pub async fn soft_delete(&self, id: Uuid, now: DateTime<Utc>) -> Result<Instance> {
        self.update(id, |i| {
            i.status = InstanceStatus::Deleting;
            i.deleted_at = Some(now);
        })
        .await
    }

    /// Sets the lifecycle status.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] if the instance does not exist.
    pub async fn update_status(&self, id: Uuid, status: InstanceStatus) -> Result<Instance> {
        self.update(id, |i| i.status = status).await
    }

    /// Records a confirmed deployment: status `running`, public URL, and the
    /// opaque provider response.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] if the instance does not exist.
    pub async fn mark_running(
        &self,
        id: Uuid,
        url: String,
        provider_response: Option<serde_json::Value>,
    ) -> Result<Instance> {
        self.update(id, |i| {
            i.status = InstanceStatus::Running;
            i.url = Some(url);
            i.metadata.provider_response = provider_response;
        })
        .await
    }

    /// Marks the instance `disabled` with an audit timestamp and reason.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] if the instance does not exist.
    pub async fn mark_disabled(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<Instance> {
        self.update(id, |i| {
            i.status = InstanceStatus::Disabled;
            i.metadata.disabled_at = Some(now);
            i.metadata.disabled_reason = Some(reason.to_owned());
        })
        .await
    }

    /// Re-enables a disabled instance: status `running` with an enable audit
    /// timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] if the instance does not exist.
    pub async fn mark_enabled(&self, id: Uuid, now: DateTime<Utc>) -> Result<Instance> {
        self.update(id, |i| {
            i.status = InstanceStatus::Running;
            i.metadata.enabled_at = Some(now);
        })
        .await
    }

    /// Attaches or clears the custom domain. A fresh attachment starts active
    /// with no SSL state until the first probe.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] if the instance does not exist.
    pub async fn set_custom_domain(&self, id: Uuid, domain: Option<String>) -> Result<Instance> {
        self.update(id, |i| {
            i.custom_domain =
                domain.map(|domain| CustomDomain { domain, is_active: true, ssl: None });
        })
        .await
    }

    /// Stores the latest SSL probe result on the instance's custom domain.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] if the instance does not exist or
    /// has no custom domain attached.
    pub async fn set_ssl_info(&self, id: Uuid, ssl: SslInfo) -> Result<Instance> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&id)
            .ok_or_else(|| ControlError::NotFound(format!("instance {id}")))?;
        let domain = instance
            .custom_domain
            .as_mut()
            .ok_or_else(|| ControlError::NotFound(format!("instance {id} has no custom domain")))?;
        domain.ssl = Some(ssl);
        Ok(instance.clone())
    }

    /// Live instances counted against the quota: `deleted_at == None` and
    /// status not in `{deleting, error}`. Disabled instances are included.
    ///
    /// This filter is load-bearing for limit enforcement; the evaluator
    /// documents it and callers must not substitute their own.
    pub async fn live_count(&self, user_id: &UserId) -> usize {
        let instances = self.instances.read().await;
        instances
            .values()
            .filter(|i| i.user_id == *user_id && i.counts_toward_quota())
            .count()
    }

    /// All of a user's instances, soft-deleted included.
    pub async fn instances_for(&self, user_id: &UserId) -> Vec<Instance> {
        let instances = self.instances.read().await;
        instances.values().filter(|i| i.user_id == *user_id).cloned().collect()
    }

    /// Instances trial reconciliation should disable: live, non-terminal,
    /// not already disabled.
    pub async fn disable_candidates(&self, user_id: &UserId) -> Vec<Instance> {
        let instances = self.instances.read().await;
        instances
            .values()
            .filter(|i| i.user_id == *user_id && i.is_disable_candidate())
            .cloned()
            .collect()
    }

    /// Live instances currently `disabled`, eligible for re-enable on payment.
    pub async fn disabled_instances(&self, user_id: &UserId) -> Vec<Instance> {
        let instances = self.instances.read().await;
        instances
            .values()
            .filter(|i| {
                i.user_id == *user_id && i.is_live() && i.status == InstanceStatus::Disabled
            })
            .cloned()
            .collect()
    }

    /// Looks up an instance by owner and id, treating other users' instances
    /// and soft-deleted instances as absent.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] if no live instance matches.
    pub async fn owned_live(&self, user_id: &UserId, id: Uuid) -> Result<Instance> {
        let instances = self.instances.read().await;
        instances
            .get(&id)
            .filter(|i| i.user_id == *user_id && i.is_live())
            .cloned()
            .ok_or_else(|| ControlError::NotFound(format!("instance {id}")))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn name(n: &str) -> InstanceName {
        InstanceName::new(n).unwrap()
    }

    async fn create(registry: &Registry, user_id: &str, instance_name: &str) -> Instance {
        registry
            .create(&user(user_id), name(instance_name), DeploymentSpec::default(), t0())
            .await
            .unwrap()
    }

    // ========================================================================
    // Name uniqueness
    // ========================================================================

    #[tokio::test]
    async fn test_duplicate_live_name_rejected() {
        let registry = Registry::new();
        create(&registry, "u1", "wf").await;

        let result = registry
            .create(&user("u1"), name("wf"), DeploymentSpec::default(), t0())
            .await;
        assert!(matches!(result.unwrap_err(), ControlError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn test_same_name_allowed_across_users() {
        let registry = Registry::new();
        create(&registry, "u1", "wf").await;
        assert!(
            registry
                .create(&user("u2"), name("wf"), DeploymentSpec::default(), t0())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_soft_deleted_name_is_reusable() {
        let registry = Registry::new();
        let first = create(&registry, "u1", "wf").await;
        registry.soft_delete(first.id, t0()).await.unwrap();

        let second = registry
            .create(&user("u1"), name("wf"), DeploymentSpec::default(), t0())
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    // ========================================================================
    // Soft delete and status
    // ========================================================================

    #[tokio::test]
    async fn test_soft_delete_sets_marker_and_status() {
        let registry = Registry::new();
        let instance = create(&registry, "u1", "wf").await;

        let deleted = registry.soft_delete(instance.id, t0()).await.unwrap();
        assert_eq!(deleted.status, InstanceStatus::Deleting);
        assert_eq!(deleted.deleted_at, Some(t0()));
        // record survives for audit history
        assert!(registry.get(instance.id).await.is_some());
    }

    #[tokio::test]
    async fn test_disable_audit_fields() {
        let registry = Registry::new();
        let instance = create(&registry, "u1", "wf").await;

        let disabled = registry.mark_disabled(instance.id, t0(), "trial expired").await.unwrap();
        assert_eq!(disabled.status, InstanceStatus::Disabled);
        assert_eq!(disabled.metadata.disabled_at, Some(t0()));
        assert_eq!(disabled.metadata.disabled_reason.as_deref(), Some("trial expired"));

        let enabled = registry.mark_enabled(instance.id, t0()).await.unwrap();
        assert_eq!(enabled.status, InstanceStatus::Running);
        assert_eq!(enabled.metadata.enabled_at, Some(t0()));
    }

    // ========================================================================
    // Queries
    // ========================================================================

    #[tokio::test]
    async fn test_live_count_filter() {
        let registry = Registry::new();
        let running = create(&registry, "u1", "a").await;
        registry.update_status(running.id, InstanceStatus::Running).await.unwrap();

        let disabled = create(&registry, "u1", "b").await;
        registry.mark_disabled(disabled.id, t0(), "trial expired").await.unwrap();

        let errored = create(&registry, "u1", "c").await;
        registry.update_status(errored.id, InstanceStatus::Error).await.unwrap();

        let gone = create(&registry, "u1", "d").await;
        registry.soft_delete(gone.id, t0()).await.unwrap();

        // disabled counts toward the quota, deleting/error do not
        assert_eq!(registry.live_count(&user("u1")).await, 2);
        assert_eq!(registry.live_count(&user("u2")).await, 0);
    }

    #[tokio::test]
    async fn test_disable_candidates_and_disabled_queries() {
        let registry = Registry::new();
        let running = create(&registry, "u1", "a").await;
        registry.update_status(running.id, InstanceStatus::Running).await.unwrap();

        let disabled = create(&registry, "u1", "b").await;
        registry.mark_disabled(disabled.id, t0(), "trial expired").await.unwrap();

        let candidates = registry.disable_candidates(&user("u1")).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, running.id);

        let disabled_list = registry.disabled_instances(&user("u1")).await;
        assert_eq!(disabled_list.len(), 1);
        assert_eq!(disabled_list[0].id, disabled.id);
    }

    #[tokio::test]
    async fn test_owned_live_enforces_ownership() {
        let registry = Registry::new();
        let instance = create(&registry, "u1", "wf").await;

        assert!(registry.owned_live(&user("u1"), instance.id).await.is_ok());
        assert!(matches!(
            registry.owned_live(&user("u2"), instance.id).await.unwrap_err(),
            ControlError::NotFound(_)
        ));

        registry.soft_delete(instance.id, t0()).await.unwrap();
        assert!(registry.owned_live(&user("u1"), instance.id).await.is_err());
    }

    #[tokio::test]
    async fn test_ssl_info_requires_domain() {
        let registry = Registry::new();
        let instance = create(&registry, "u1", "wf").await;

        let ssl = SslInfo::failed("no probe yet".into(), t0());
        assert!(registry.set_ssl_info(instance.id, ssl.clone()).await.is_err());

        registry.set_custom_domain(instance.id, Some("flows.example.com".into())).await.unwrap();
        let updated = registry.set_ssl_info(instance.id, ssl).await.unwrap();
        assert!(updated.custom_domain.unwrap().ssl.is_some());
    }
}
