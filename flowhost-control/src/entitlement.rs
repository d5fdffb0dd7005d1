//! Subscription entitlement evaluator.
//!
//! Pure functions over a [`Subscription`] value and an explicit reference
//! time. Nothing here reads the system clock or touches storage; callers
//! supply `now` and the current live-instance count, which keeps every rule
//! deterministic and directly testable.
//!
//! The live-instance count used for quota checks must be computed with the
//! exact filter implemented by [`crate::registry::Registry::live_count`]:
//! `deleted_at == None` and status not in `{deleting, error}`. Disabled
//! instances count toward the quota.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::account::{Plan, Subscription, SubscriptionStatus, UNLIMITED_INSTANCES, UserAccount};

/// Returns true if the subscription is in trial and the trial window is open.
///
/// The boundary is exclusive: at `now == trial_ends_at` the trial is over.
#[must_use]
pub fn is_trial_active(sub: &Subscription, now: DateTime<Utc>) -> bool {
    sub.status == SubscriptionStatus::Trial
        && sub.trial_ends_at.is_some_and(|ends| now < ends)
}

/// Returns true if the subscription grants access right now.
#[must_use]
pub fn is_subscription_active(sub: &Subscription, now: DateTime<Utc>) -> bool {
    sub.status == SubscriptionStatus::Active || is_trial_active(sub, now)
}

/// Effective instance quota for the subscription at `now`.
///
/// Returns 0 when the subscription is inactive, the stored override when one
/// is set, and the plan default otherwise. [`UNLIMITED_INSTANCES`] is a
/// sentinel, not a ceiling.
#[must_use]
pub fn max_instances(sub: &Subscription, now: DateTime<Utc>) -> i32 {
    if !is_subscription_active(sub, now) {
        return 0;
    }
    sub.max_instances.unwrap_or_else(|| sub.plan.default_quota())
}

/// Decides whether one more instance may be created.
///
/// `current_live_count` is the caller-computed count of the user's instances
/// with `deleted_at == None` and status outside `{deleting, error}`.
#[must_use]
pub fn can_create_instance(
    sub: &Subscription,
    now: DateTime<Utc>,
    current_live_count: usize,
) -> bool {
    if !is_subscription_active(sub, now) {
        return false;
    }
    let max = max_instances(sub, now);
    if max == UNLIMITED_INSTANCES {
        return true;
    }
    (current_live_count as i64) < i64::from(max)
}

/// Read model of a user's entitlement, for the orchestration API and clients.
#[derive(Debug, Clone, Serialize)]
pub struct EntitlementSummary {
    /// Whether one more instance may be created right now.
    pub can_create: bool,
    /// Live instances counted against the quota.
    pub current_instances: usize,
    /// Effective quota; [`UNLIMITED_INSTANCES`] means unlimited.
    pub max_instances: i32,
    /// Plan tier.
    pub plan: Plan,
    /// Subscription status.
    pub status: SubscriptionStatus,
    /// Whether a trial is currently running.
    pub is_trial_active: bool,
    /// Trial end, if the subscription ever had one.
    pub trial_ends_at: Option<DateTime<Utc>>,
}

impl EntitlementSummary {
    /// Evaluates the read model for an account at `now`.
    #[must_use]
    pub fn evaluate(account: &UserAccount, current_live_count: usize, now: DateTime<Utc>) -> Self {
        let sub = &account.subscription;
        Self {
            can_create: can_create_instance(sub, now, current_live_count),
            current_instances: current_live_count,
            max_instances: max_instances(sub, now),
            plan: sub.plan,
            status: sub.status,
            is_trial_active: is_trial_active(sub, now),
            trial_ends_at: sub.trial_ends_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn trial_sub(plan: Plan, minutes: i64) -> Subscription {
        Subscription::trial(plan, t0(), chrono::Duration::minutes(minutes))
    }

    fn active_sub(plan: Plan, max: Option<i32>) -> Subscription {
        let mut sub = trial_sub(plan, 60);
        sub.status = SubscriptionStatus::Active;
        sub.max_instances = max;
        sub
    }

    // ========================================================================
    // Trial window
    // ========================================================================

    #[test]
    fn test_trial_active_before_end() {
        let sub = trial_sub(Plan::Starter, 60);
        assert!(is_trial_active(&sub, t0() + chrono::Duration::minutes(59)));
    }

    #[test]
    fn test_trial_inactive_at_and_after_end() {
        let sub = trial_sub(Plan::Starter, 60);
        assert!(!is_trial_active(&sub, t0() + chrono::Duration::minutes(60)));
        assert!(!is_trial_active(&sub, t0() + chrono::Duration::minutes(61)));
    }

    #[test]
    fn test_expired_status_never_trial_active() {
        let mut sub = trial_sub(Plan::Starter, 60);
        sub.status = SubscriptionStatus::Expired;
        assert!(!is_trial_active(&sub, t0()));
        assert!(!is_subscription_active(&sub, t0()));
    }

    #[test]
    fn test_cancelled_is_inactive() {
        let mut sub = active_sub(Plan::Pro, None);
        sub.status = SubscriptionStatus::Cancelled;
        assert!(!is_subscription_active(&sub, t0()));
        assert_eq!(max_instances(&sub, t0()), 0);
    }

    // ========================================================================
    // Quota computation
    // ========================================================================

    #[test]
    fn test_max_instances_zero_when_inactive() {
        let sub = trial_sub(Plan::Pro, 60);
        assert_eq!(max_instances(&sub, t0() + chrono::Duration::hours(2)), 0);
    }

    #[test]
    fn test_max_instances_stored_override_wins() {
        let sub = active_sub(Plan::Starter, Some(5));
        assert_eq!(max_instances(&sub, t0()), 5);
    }

    #[test]
    fn test_max_instances_plan_default_fallback() {
        assert_eq!(max_instances(&active_sub(Plan::Starter, None), t0()), 1);
        assert_eq!(max_instances(&active_sub(Plan::Pro, None), t0()), UNLIMITED_INSTANCES);
    }

    #[test]
    fn test_pro_upgrade_is_always_unlimited() {
        // upgrade path stores the sentinel explicitly; stored count fields
        // from an earlier plan must not shadow it
        let sub = active_sub(Plan::Pro, Some(UNLIMITED_INSTANCES));
        assert_eq!(max_instances(&sub, t0()), UNLIMITED_INSTANCES);
        assert!(can_create_instance(&sub, t0(), 10_000));
    }

    // ========================================================================
    // Creation checks
    // ========================================================================

    #[test]
    fn test_can_create_under_limit() {
        let sub = active_sub(Plan::Starter, None);
        assert!(can_create_instance(&sub, t0(), 0));
        assert!(!can_create_instance(&sub, t0(), 1));
        assert!(!can_create_instance(&sub, t0(), 2));
    }

    #[test]
    fn test_cannot_create_when_inactive() {
        let sub = trial_sub(Plan::Pro, 60);
        assert!(!can_create_instance(&sub, t0() + chrono::Duration::hours(2), 0));
    }

    #[test]
    fn test_entitlement_summary_reflects_quota() {
        let mut account = UserAccount::with_trial(
            crate::account::UserId::new("u1").unwrap(),
            None,
            Plan::Starter,
            t0(),
            chrono::Duration::minutes(60),
        );
        account.subscription.status = SubscriptionStatus::Active;

        let summary = EntitlementSummary::evaluate(&account, 1, t0());
        assert!(!summary.can_create);
        assert_eq!(summary.current_instances, 1);
        assert_eq!(summary.max_instances, 1);
        assert_eq!(summary.status, SubscriptionStatus::Active);
    }

    // ========================================================================
    // Properties
    // ========================================================================

    proptest! {
        #[test]
        fn prop_can_create_monotonically_false(max in 0i32..100, count in 0usize..200) {
            let sub = active_sub(Plan::Starter, Some(max));
            if !can_create_instance(&sub, t0(), count) {
                // once denied, more instances never re-permit creation
                prop_assert!(!can_create_instance(&sub, t0(), count + 1));
            }
        }

        #[test]
        fn prop_unlimited_always_permits(count in 0usize..10_000) {
            let sub = active_sub(Plan::Pro, Some(UNLIMITED_INSTANCES));
            prop_assert!(can_create_instance(&sub, t0(), count));
        }

        #[test]
        fn prop_trial_activity_matches_window(offset_mins in -120i64..240) {
            let sub = trial_sub(Plan::Starter, 60);
            let now = t0() + chrono::Duration::minutes(offset_mins);
            prop_assert_eq!(is_trial_active(&sub, now), offset_mins < 60);
        }
    }
}
