//! Trial expiry reconciliation.
//!
//! A repeating scan (default period one hour, immediate first run) that
//! finds accounts whose trial window has lapsed, disables their instances
//! through the deployment gateway, and expires the subscription.
//!
//! Failure policy: a failed disable is logged and the instance left
//! untouched, to be retried by a later tick (at-least-once via periodic
//! re-scan, not an explicit queue). The subscription transitions to
//! `expired` even when some disables failed; because that removes the
//! account from the trial scan, each tick also sweeps already-expired
//! accounts that still have enabled instances, which is what keeps the
//! retry promise alive.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::account::{AccountDirectory, SubscriptionStatus, UserId};
use crate::clock::Clock;
use crate::error::Result;
use crate::gateway::DeploymentGateway;
use crate::registry::Registry;

/// Default period between reconciliation ticks.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3_600);

/// Audit reason recorded on instances disabled by this loop.
const DISABLE_REASON: &str = "trial expired";

/// Outcome counters for one reconciliation tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    /// Subscriptions transitioned to `expired` this tick.
    pub users_expired: usize,
    /// Users whose processing failed entirely (logged and skipped).
    pub user_failures: usize,
    /// Instances successfully disabled.
    pub instances_disabled: usize,
    /// Disable attempts that failed and were left for a later tick.
    pub disable_failures: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct DisablePass {
    disabled: usize,
    failed: usize,
}

/// The trial reconciliation loop.
pub struct TrialReconciler {
    directory: Arc<AccountDirectory>,
    registry: Arc<Registry>,
    gateway: Arc<dyn DeploymentGateway>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl std::fmt::Debug for TrialReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrialReconciler")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl TrialReconciler {
    /// Creates a reconciler with the default one-hour period.
    #[must_use]
    pub fn new(
        directory: Arc<AccountDirectory>,
        registry: Arc<Registry>,
        gateway: Arc<dyn DeploymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { directory, registry, gateway, clock, interval: DEFAULT_INTERVAL }
    }

    /// Overrides the tick period.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs the loop forever. The first tick fires immediately.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let summary = self.tick().await;
            info!(
                users_expired = summary.users_expired,
                user_failures = summary.user_failures,
                instances_disabled = summary.instances_disabled,
                disable_failures = summary.disable_failures,
                "trial reconciliation tick complete"
            );
        }
    }

    /// Executes one reconciliation pass at the injected clock's current time.
    pub async fn tick(&self) -> TickSummary {
        let now = self.clock.now();
        let mut summary = TickSummary::default();

        // snapshot both scans before mutating, so accounts expired during
        // this tick are not re-processed by the sweep below
        let lapsed = self.directory.expired_trials(now).await;
        let stale = self.directory.with_status(SubscriptionStatus::Expired).await;

        // sweep: disable retries for accounts expired on an earlier tick
        // whose gateway disables failed back then
        for user_id in stale {
            let pass = self.disable_instances(&user_id, now).await;
            summary.instances_disabled += pass.disabled;
            summary.disable_failures += pass.failed;
        }

        for user_id in lapsed {
            match self.expire_user(&user_id, now).await {
                Ok(pass) => {
                    summary.users_expired += 1;
                    summary.instances_disabled += pass.disabled;
                    summary.disable_failures += pass.failed;
                }
                Err(e) => {
                    // isolate per-user errors; the rest of the batch continues
                    error!(user = %user_id, error = %e, "trial expiry failed for user");
                    summary.user_failures += 1;
                }
            }
        }

        summary
    }

    async fn expire_user(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<DisablePass> {
        let pass = self.disable_instances(user_id, now).await;
        if pass.failed > 0 {
            warn!(
                user = %user_id,
                failed = pass.failed,
                "expiring subscription with instances still enabled; disables retry next tick"
            );
        }

        // expiry is not gated on disable success (see module docs)
        self.directory
            .update(user_id, |account| {
                account.subscription.status = SubscriptionStatus::Expired;
                account.subscription.expired_at = Some(now);
            })
            .await?;
        info!(user = %user_id, "trial expired");
        Ok(pass)
    }

    /// Disables the user's candidate instances, strictly sequentially.
    async fn disable_instances(&self, user_id: &UserId, now: DateTime<Utc>) -> DisablePass {
        let mut pass = DisablePass::default();
        for instance in self.registry.disable_candidates(user_id).await {
            let result = self.gateway.disable_instance(user_id).await;
            if result.success {
                match self.registry.mark_disabled(instance.id, now, DISABLE_REASON).await {
                    Ok(_) => pass.disabled += 1,
                    Err(e) => {
                        error!(instance = %instance.id, error = %e, "disable not recorded");
                        pass.failed += 1;
                    }
                }
            } else {
                // left untouched; the instance stays a candidate for the
                // next tick
                warn!(
                    user = %user_id,
                    instance = %instance.id,
                    error = result.error_message(),
                    "gateway disable failed"
                );
                pass.failed += 1;
            }
        }
        pass
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::account::{Plan, UserAccount};
    use crate::clock::ManualClock;
    use crate::gateway::{GatewayOp, GatewayResult, StaticGateway};
    use crate::instance::{DeploymentSpec, InstanceName, InstanceStatus};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    struct Fixture {
        directory: Arc<AccountDirectory>,
        registry: Arc<Registry>,
        gateway: Arc<StaticGateway>,
        clock: Arc<ManualClock>,
        reconciler: TrialReconciler,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(AccountDirectory::new());
        let registry = Arc::new(Registry::new());
        let gateway = Arc::new(StaticGateway::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let reconciler = TrialReconciler::new(
            Arc::clone(&directory),
            Arc::clone(&registry),
            Arc::clone(&gateway) as Arc<dyn DeploymentGateway>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        Fixture { directory, registry, gateway, clock, reconciler }
    }

    async fn seed_trial_user(f: &Fixture, id: &str, trial_mins: i64, instances: &[&str]) -> UserId {
        let user = UserId::new(id).unwrap();
        f.directory
            .replace(UserAccount::with_trial(
                user.clone(),
                None,
                Plan::Pro,
                t0(),
                chrono::Duration::minutes(trial_mins),
            ))
            .await;
        for name in instances {
            let instance = f
                .registry
                .create(&user, InstanceName::new(*name).unwrap(), DeploymentSpec::default(), t0())
                .await
                .unwrap();
            f.registry.update_status(instance.id, InstanceStatus::Running).await.unwrap();
        }
        user
    }

    #[tokio::test]
    async fn test_lapsed_trial_is_disabled_and_expired() {
        let f = fixture();
        let user = seed_trial_user(&f, "u1", 60, &["wf"]).await;

        f.clock.advance(chrono::Duration::minutes(61));
        let summary = f.reconciler.tick().await;

        assert_eq!(summary.users_expired, 1);
        assert_eq!(summary.instances_disabled, 1);
        assert_eq!(summary.disable_failures, 0);

        let account = f.directory.get(&user).await.unwrap();
        assert_eq!(account.subscription.status, SubscriptionStatus::Expired);
        assert_eq!(account.subscription.expired_at, Some(f.clock.now()));

        let instances = f.registry.instances_for(&user).await;
        assert_eq!(instances[0].status, InstanceStatus::Disabled);
        assert_eq!(instances[0].metadata.disabled_reason.as_deref(), Some("trial expired"));
    }

    #[tokio::test]
    async fn test_unexpired_trial_untouched() {
        let f = fixture();
        let user = seed_trial_user(&f, "u1", 600, &["wf"]).await;

        f.clock.advance(chrono::Duration::minutes(61));
        let summary = f.reconciler.tick().await;

        assert_eq!(summary.users_expired, 0);
        let account = f.directory.get(&user).await.unwrap();
        assert_eq!(account.subscription.status, SubscriptionStatus::Trial);
        assert_eq!(f.gateway.call_count(GatewayOp::Disable).await, 0);
    }

    #[tokio::test]
    async fn test_tick_is_idempotent() {
        let f = fixture();
        seed_trial_user(&f, "u1", 60, &["wf"]).await;

        f.clock.advance(chrono::Duration::minutes(61));
        f.reconciler.tick().await;
        let second = f.reconciler.tick().await;

        // no clock advance: nothing new to expire, nothing disabled twice
        assert_eq!(second, TickSummary::default());
        assert_eq!(f.gateway.call_count(GatewayOp::Disable).await, 1);
    }

    #[tokio::test]
    async fn test_disable_failure_leaves_instance_and_still_expires() {
        let f = fixture();
        let user = seed_trial_user(&f, "u1", 60, &["a", "b"]).await;
        f.gateway
            .script(GatewayOp::Disable, GatewayResult::failure(None, "timeout"))
            .await;

        f.clock.advance(chrono::Duration::minutes(61));
        let summary = f.reconciler.tick().await;

        assert_eq!(summary.users_expired, 1);
        assert_eq!(summary.instances_disabled, 1);
        assert_eq!(summary.disable_failures, 1);

        // expiry is committed even though one disable failed
        let account = f.directory.get(&user).await.unwrap();
        assert_eq!(account.subscription.status, SubscriptionStatus::Expired);

        let mut statuses: Vec<InstanceStatus> =
            f.registry.instances_for(&user).await.iter().map(|i| i.status).collect();
        statuses.sort_by_key(|s| format!("{s}"));
        assert!(statuses.contains(&InstanceStatus::Running));
        assert!(statuses.contains(&InstanceStatus::Disabled));
    }

    #[tokio::test]
    async fn test_failed_disable_retried_after_expiry() {
        let f = fixture();
        let user = seed_trial_user(&f, "u1", 60, &["wf"]).await;
        f.gateway
            .script(GatewayOp::Disable, GatewayResult::failure(None, "timeout"))
            .await;

        f.clock.advance(chrono::Duration::minutes(61));
        f.reconciler.tick().await;
        assert_eq!(
            f.registry.instances_for(&user).await[0].status,
            InstanceStatus::Running
        );

        // next tick sweeps the already-expired account and retries
        let summary = f.reconciler.tick().await;
        assert_eq!(summary.instances_disabled, 1);
        assert_eq!(
            f.registry.instances_for(&user).await[0].status,
            InstanceStatus::Disabled
        );
    }

    #[tokio::test]
    async fn test_one_user_failure_does_not_abort_batch() {
        let f = fixture();
        let u1 = seed_trial_user(&f, "u1", 60, &["a"]).await;
        let u2 = seed_trial_user(&f, "u2", 60, &["b"]).await;
        f.gateway
            .script(GatewayOp::Disable, GatewayResult::failure(None, "boom"))
            .await;

        f.clock.advance(chrono::Duration::minutes(61));
        let summary = f.reconciler.tick().await;

        // both users expire; exactly one instance disable failed
        assert_eq!(summary.users_expired, 2);
        assert_eq!(summary.instances_disabled, 1);
        assert_eq!(summary.disable_failures, 1);
        for user in [&u1, &u2] {
            assert_eq!(
                f.directory.get(user).await.unwrap().subscription.status,
                SubscriptionStatus::Expired
            );
        }
    }
}
