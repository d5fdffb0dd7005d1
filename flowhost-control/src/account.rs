//! User accounts, subscriptions, and the account directory.
//!
//! A user owns exactly one [`Subscription`] sub-record for the lifetime of
//! the account; subscription records are mutated by transition operations
//! (start trial, convert to paid, upgrade, process payment, expire) and never
//! deleted. The [`AccountDirectory`] stands in for the backing document
//! store: individual document updates are atomic, cross-document updates are
//! not, and concurrent writers are last-writer-wins.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{ControlError, Result};

/// Sentinel quota value meaning "unlimited instances".
///
/// Never compare this as a numeric ceiling; check for it explicitly.
pub const UNLIMITED_INSTANCES: i32 = -1;

/// Unique identifier for a subscriber.
///
/// Wraps the externally provided user id with validation: non-empty,
/// at most 64 characters, alphanumeric plus hyphens and underscores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a new user id after validation.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidUserId`] if the id is empty, exceeds
    /// 64 characters, or contains characters outside `[A-Za-z0-9_-]`.
    pub fn new<S: Into<String>>(id: S) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(ControlError::InvalidUserId("user id cannot be empty".into()));
        }
        if id.len() > 64 {
            return Err(ControlError::InvalidUserId(
                "user id must be 64 characters or less".into(),
            ));
        }
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ControlError::InvalidUserId(
                "user id can only contain alphanumeric characters, hyphens, and underscores"
                    .into(),
            ));
        }
        Ok(Self(id))
    }

    /// Returns the inner string reference.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Subscription plan tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    /// Entry plan: one instance.
    Starter,
    /// Pro plan: unlimited instances.
    Pro,
}

impl Plan {
    /// Default instance quota for the plan when the subscription record does
    /// not carry an explicit override.
    ///
    /// This is the single plan-default lookup; every `max_instances`
    /// computation goes through it.
    #[must_use]
    pub fn default_quota(self) -> i32 {
        match self {
            Self::Starter => 1,
            Self::Pro => UNLIMITED_INSTANCES,
        }
    }

    /// Infers the plan from a payment amount.
    ///
    /// The payment confirmation source carries no plan identity, so amounts
    /// at or above `pro_threshold` map to [`Plan::Pro`] and everything else
    /// to [`Plan::Starter`].
    #[must_use]
    pub fn from_amount(amount: Decimal, pro_threshold: Decimal) -> Self {
        if amount >= pro_threshold { Self::Pro } else { Self::Starter }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starter => f.write_str("starter"),
            Self::Pro => f.write_str("pro"),
        }
    }
}

/// Subscription lifecycle status.
///
/// Transitions: `Trial → Active` (payment confirmed), `Trial → Expired`
/// (time-driven reconciliation), `Active → Active` (renewal, idempotent),
/// `* → Active` (pro upgrade). Nothing in this crate produces or clears
/// `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Trial period; entitlement depends on `trial_ends_at`.
    Trial,
    /// Paid and in good standing.
    Active,
    /// Trial lapsed without payment.
    Expired,
    /// Terminated by the user; inactive for entitlement purposes.
    Cancelled,
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trial => f.write_str("trial"),
            Self::Active => f.write_str("active"),
            Self::Expired => f.write_str("expired"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Subscription sub-record owned by a user account.
///
/// Invariant: `status == Trial` implies `trial_ends_at` is set.
/// `max_instances` of `None` means "use the plan default";
/// `Some(UNLIMITED_INSTANCES)` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Plan tier.
    pub plan: Plan,
    /// Lifecycle status.
    pub status: SubscriptionStatus,
    /// Explicit instance-quota override; `None` falls back to the plan default.
    pub max_instances: Option<i32>,
    /// Last confirmed payment amount; zero during trial.
    pub price: Decimal,
    /// When the trial started.
    pub trial_started_at: Option<DateTime<Utc>>,
    /// When the trial ends; set whenever `status == Trial`.
    pub trial_ends_at: Option<DateTime<Utc>>,
    /// Next renewal date; set by payment reconciliation.
    pub next_billing_date: Option<DateTime<Utc>>,
    /// When the trial was expired by reconciliation.
    pub expired_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Starts a trial subscription at `now` with the given duration.
    #[must_use]
    pub fn trial(plan: Plan, now: DateTime<Utc>, duration: chrono::Duration) -> Self {
        Self {
            plan,
            status: SubscriptionStatus::Trial,
            max_instances: None,
            price: Decimal::ZERO,
            trial_started_at: Some(now),
            trial_ends_at: Some(now + duration),
            next_billing_date: None,
            expired_at: None,
        }
    }
}

/// Append-only record of a confirmed payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// External transaction id; payment processing is idempotent per id.
    pub transaction_id: String,
    /// Confirmed amount.
    pub amount: Decimal,
    /// Plan inferred from the amount at processing time.
    pub plan: Plan,
    /// When the payment was applied.
    pub recorded_at: DateTime<Utc>,
}

/// A subscriber account document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    /// Account id.
    pub id: UserId,
    /// Referring affiliate, if the account was acquired through one.
    pub referrer: Option<UserId>,
    /// The account's single subscription sub-record.
    pub subscription: Subscription,
    /// Append-only payment history; doubles as the payment idempotency record.
    pub payments: Vec<PaymentRecord>,
    /// Account creation time.
    pub created_at: DateTime<Utc>,
}

impl UserAccount {
    /// Creates an account starting in trial.
    #[must_use]
    pub fn with_trial(
        id: UserId,
        referrer: Option<UserId>,
        plan: Plan,
        now: DateTime<Utc>,
        trial_duration: chrono::Duration,
    ) -> Self {
        Self {
            id,
            referrer,
            subscription: Subscription::trial(plan, now, trial_duration),
            payments: Vec::new(),
            created_at: now,
        }
    }

    /// Returns true if a payment with this transaction id was already applied.
    #[must_use]
    pub fn has_payment(&self, transaction_id: &str) -> bool {
        self.payments.iter().any(|p| p.transaction_id == transaction_id)
    }
}

/// In-memory account directory standing in for the backing document store.
///
/// Provides the per-document atomic update semantics the control loop relies
/// on ([`AccountDirectory::update`] runs its closure under the write lock).
/// There is no multi-document transaction; callers needing all-or-nothing
/// behavior stage a copy and [`AccountDirectory::replace`] it on success.
#[derive(Debug, Default)]
pub struct AccountDirectory {
    accounts: RwLock<HashMap<UserId, UserAccount>>,
}

impl AccountDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites an account document (last-writer-wins).
    pub async fn replace(&self, account: UserAccount) {
        let mut accounts = self.accounts.write().await;
        accounts.insert(account.id.clone(), account);
    }

    /// Returns a snapshot of the account, if present.
    pub async fn get(&self, id: &UserId) -> Option<UserAccount> {
        let accounts = self.accounts.read().await;
        accounts.get(id).cloned()
    }

    /// Applies `f` to the account document under the write lock.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] if the account does not exist.
    pub async fn update<T>(
        &self,
        id: &UserId,
        f: impl FnOnce(&mut UserAccount) -> T,
    ) -> Result<T> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| ControlError::NotFound(format!("account {id}")))?;
        Ok(f(account))
    }

    /// Ids of accounts whose trial has lapsed: `status == Trial` and
    /// `trial_ends_at < now`.
    pub async fn expired_trials(&self, now: DateTime<Utc>) -> Vec<UserId> {
        let accounts = self.accounts.read().await;
        accounts
            .values()
            .filter(|a| {
                a.subscription.status == SubscriptionStatus::Trial
                    && a.subscription.trial_ends_at.is_some_and(|ends| ends < now)
            })
            .map(|a| a.id.clone())
            .collect()
    }

    /// Ids of accounts currently in the given status.
    pub async fn with_status(&self, status: SubscriptionStatus) -> Vec<UserId> {
        let accounts = self.accounts.read().await;
        accounts
            .values()
            .filter(|a| a.subscription.status == status)
            .map(|a| a.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    // ========================================================================
    // UserId Tests
    // ========================================================================

    #[test]
    fn test_user_id_valid() {
        let id = UserId::new("user-123").unwrap();
        assert_eq!(id.as_str(), "user-123");
    }

    #[test]
    fn test_user_id_empty_rejected() {
        let result = UserId::new("");
        assert!(matches!(result.unwrap_err(), ControlError::InvalidUserId(_)));
    }

    #[test]
    fn test_user_id_too_long_rejected() {
        let result = UserId::new("u".repeat(65));
        assert!(matches!(result.unwrap_err(), ControlError::InvalidUserId(_)));
    }

    #[test]
    fn test_user_id_rejects_special_chars() {
        assert!(UserId::new("user@example.com").is_err());
        assert!(UserId::new("../etc/passwd").is_err());
    }

    // ========================================================================
    // Plan Tests
    // ========================================================================

    #[test]
    fn test_plan_defaults() {
        assert_eq!(Plan::Starter.default_quota(), 1);
        assert_eq!(Plan::Pro.default_quota(), UNLIMITED_INSTANCES);
    }

    #[test]
    fn test_plan_from_amount_threshold() {
        let threshold = Decimal::from(50);
        assert_eq!(Plan::from_amount(Decimal::from(15), threshold), Plan::Starter);
        assert_eq!(Plan::from_amount(Decimal::from(50), threshold), Plan::Pro);
        assert_eq!(Plan::from_amount(Decimal::from(99), threshold), Plan::Pro);
    }

    // ========================================================================
    // Subscription Tests
    // ========================================================================

    #[test]
    fn test_trial_subscription_sets_window() {
        let sub = Subscription::trial(Plan::Starter, t0(), chrono::Duration::minutes(60));
        assert_eq!(sub.status, SubscriptionStatus::Trial);
        assert_eq!(sub.trial_started_at, Some(t0()));
        assert_eq!(sub.trial_ends_at, Some(t0() + chrono::Duration::minutes(60)));
        assert!(sub.max_instances.is_none());
    }

    // ========================================================================
    // AccountDirectory Tests
    // ========================================================================

    fn trial_account(id: &str, duration_mins: i64) -> UserAccount {
        UserAccount::with_trial(
            UserId::new(id).unwrap(),
            None,
            Plan::Starter,
            t0(),
            chrono::Duration::minutes(duration_mins),
        )
    }

    #[tokio::test]
    async fn test_expired_trials_scan() {
        let directory = AccountDirectory::new();
        directory.replace(trial_account("lapsed", 60)).await;
        directory.replace(trial_account("fresh", 600)).await;

        let now = t0() + chrono::Duration::minutes(61);
        let expired = directory.expired_trials(now).await;
        assert_eq!(expired, vec![UserId::new("lapsed").unwrap()]);
    }

    #[tokio::test]
    async fn test_expired_trials_excludes_boundary() {
        let directory = AccountDirectory::new();
        directory.replace(trial_account("edge", 60)).await;

        // trial_ends_at == now is not yet lapsed
        let now = t0() + chrono::Duration::minutes(60);
        assert!(directory.expired_trials(now).await.is_empty());
    }

    #[tokio::test]
    async fn test_update_is_applied_in_place() {
        let directory = AccountDirectory::new();
        directory.replace(trial_account("u1", 60)).await;

        let id = UserId::new("u1").unwrap();
        directory
            .update(&id, |a| {
                a.subscription.status = SubscriptionStatus::Expired;
            })
            .await
            .unwrap();

        let account = directory.get(&id).await.unwrap();
        assert_eq!(account.subscription.status, SubscriptionStatus::Expired);
    }

    #[tokio::test]
    async fn test_update_missing_account() {
        let directory = AccountDirectory::new();
        let result = directory.update(&UserId::new("ghost").unwrap(), |_| ()).await;
        assert!(matches!(result.unwrap_err(), ControlError::NotFound(_)));
    }
}
