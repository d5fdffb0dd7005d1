//! Payment reconciliation.
//!
//! Consumes external payment-confirmation events and transitions the
//! subscription to `active`, undoing trial-expiry effects. Processing is
//! idempotent per transaction id: the append-only payment history doubles as
//! the idempotency record, so a replayed confirmation neither double-counts
//! commission nor pushes the billing date again.
//!
//! Payment and commission form one atomic unit: the commission ledger is
//! invoked before the staged subscription document is committed, and a
//! ledger failure aborts the whole operation with prior state unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::account::{AccountDirectory, PaymentRecord, Plan, SubscriptionStatus, UserId};
use crate::clock::Clock;
use crate::config::BillingConfig;
use crate::error::{ControlError, Result};
use crate::gateway::DeploymentGateway;
use crate::registry::Registry;

/// External payment-confirmation event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    /// Paying user.
    pub user_id: UserId,
    /// Processor transaction id; processing is idempotent per id.
    pub transaction_id: String,
    /// Confirmed amount; determines the plan.
    pub amount: Decimal,
}

/// Affiliate commission collaborator.
///
/// Implementations must be idempotent per transaction id; the reconciler
/// additionally guards against replays through the payment history, so under
/// normal operation each transaction reaches the ledger at most once.
#[async_trait]
pub trait CommissionLedger: Send + Sync {
    /// Records a commission for `referrer` on `transaction_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Commission`] if the ledger rejects the
    /// transaction; the caller aborts the payment without committing.
    async fn record_commission(
        &self,
        referrer: &UserId,
        amount: Decimal,
        transaction_id: &str,
    ) -> Result<()>;
}

/// One recorded commission entry.
#[derive(Debug, Clone)]
struct CommissionEntry {
    referrer: UserId,
    amount: Decimal,
    transaction_id: String,
}

/// In-memory, per-transaction idempotent [`CommissionLedger`].
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<CommissionEntry>>,
}

impl MemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commissions recorded.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// True if no commission has been recorded.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Total commission recorded for a referrer.
    pub async fn total_for(&self, referrer: &UserId) -> Decimal {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|e| e.referrer == *referrer)
            .map(|e| e.amount)
            .sum()
    }
}

#[async_trait]
impl CommissionLedger for MemoryLedger {
    async fn record_commission(
        &self,
        referrer: &UserId,
        amount: Decimal,
        transaction_id: &str,
    ) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.transaction_id == transaction_id) {
            info!(transaction = transaction_id, "commission already recorded; skipping");
            return Ok(());
        }
        entries.push(CommissionEntry {
            referrer: referrer.clone(),
            amount,
            transaction_id: transaction_id.to_owned(),
        });
        Ok(())
    }
}

/// Outcome of processing one payment confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// The payment was applied.
    Applied {
        /// Plan inferred from the amount.
        plan: Plan,
        /// Instances re-enabled by the follow-up pass.
        enabled: usize,
        /// Enable attempts that failed and were left `disabled`.
        enable_failures: usize,
    },
    /// The transaction id was seen before; nothing changed.
    Duplicate,
}

/// Applies payment confirmations to accounts and instances.
pub struct PaymentReconciler {
    directory: Arc<AccountDirectory>,
    registry: Arc<Registry>,
    gateway: Arc<dyn DeploymentGateway>,
    ledger: Arc<dyn CommissionLedger>,
    clock: Arc<dyn Clock>,
    billing: BillingConfig,
}

impl std::fmt::Debug for PaymentReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentReconciler")
            .field("billing", &self.billing)
            .finish_non_exhaustive()
    }
}

impl PaymentReconciler {
    /// Creates a reconciler with the given billing policy.
    #[must_use]
    pub fn new(
        directory: Arc<AccountDirectory>,
        registry: Arc<Registry>,
        gateway: Arc<dyn DeploymentGateway>,
        ledger: Arc<dyn CommissionLedger>,
        clock: Arc<dyn Clock>,
        billing: BillingConfig,
    ) -> Self {
        Self { directory, registry, gateway, ledger, clock, billing }
    }

    /// Processes one payment-confirmation event.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for unknown accounts and
    /// [`ControlError::Commission`] when the ledger rejects the transaction;
    /// in the latter case the account document is left unchanged.
    pub async fn process(&self, event: &PaymentEvent) -> Result<PaymentOutcome> {
        let account = self
            .directory
            .get(&event.user_id)
            .await
            .ok_or_else(|| ControlError::NotFound(format!("account {}", event.user_id)))?;

        if account.has_payment(&event.transaction_id) {
            info!(
                user = %event.user_id,
                transaction = %event.transaction_id,
                "payment confirmation replayed; ignoring"
            );
            return Ok(PaymentOutcome::Duplicate);
        }

        let now = self.clock.now();
        let plan = Plan::from_amount(event.amount, self.billing.pro_price_threshold);

        // stage the full document, commit only after the commission succeeds
        let mut staged = account;
        {
            let sub = &mut staged.subscription;
            sub.status = SubscriptionStatus::Active;
            sub.plan = plan;
            sub.max_instances = Some(plan.default_quota());
            sub.price = event.amount;
            sub.next_billing_date = Some(now + chrono::Duration::days(self.billing.billing_period_days));
            sub.expired_at = None;
        }
        staged.payments.push(PaymentRecord {
            transaction_id: event.transaction_id.clone(),
            amount: event.amount,
            plan,
            recorded_at: now,
        });

        if let Some(referrer) = staged.referrer.clone() {
            self.ledger
                .record_commission(&referrer, event.amount, &event.transaction_id)
                .await?;
        }

        self.directory.replace(staged).await;
        info!(user = %event.user_id, %plan, transaction = %event.transaction_id, "payment applied");

        let (enabled, enable_failures) = self.enable_disabled_instances(&event.user_id, now).await;
        Ok(PaymentOutcome::Applied { plan, enabled, enable_failures })
    }

    /// Re-enables the user's disabled instances, strictly sequentially.
    ///
    /// Failures are logged and the instance left `disabled`; there is no
    /// automatic re-drive, only manual retry.
    async fn enable_disabled_instances(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> (usize, usize) {
        let mut enabled = 0;
        let mut failed = 0;
        for instance in self.registry.disabled_instances(user_id).await {
            let result = self.gateway.enable_instance(user_id).await;
            if result.success {
                match self.registry.mark_enabled(instance.id, now).await {
                    Ok(_) => enabled += 1,
                    Err(e) => {
                        warn!(instance = %instance.id, error = %e, "enable not recorded");
                        failed += 1;
                    }
                }
            } else {
                warn!(
                    user = %user_id,
                    instance = %instance.id,
                    error = result.error_message(),
                    "gateway enable failed; instance left disabled"
                );
                failed += 1;
            }
        }
        (enabled, failed)
    }
}
