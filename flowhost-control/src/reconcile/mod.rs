//! Background reconciliation.
//!
//! Two processes keep registry and subscription state consistent with
//! time-based rules and the remote provider:
//!
//! - [`trial::TrialReconciler`] — a repeating scan that disables instances of
//!   lapsed trials and expires their subscriptions.
//! - [`payment::PaymentReconciler`] — driven by payment-confirmation events;
//!   activates the subscription and undoes trial-expiry effects.
//!
//! Both operate strictly sequentially per user and per instance to bound
//! load on the provisioning API, and both isolate per-item failures so one
//! bad user or instance never blocks the rest of a batch.

pub mod payment;
pub mod trial;

pub use payment::{CommissionLedger, MemoryLedger, PaymentEvent, PaymentOutcome, PaymentReconciler};
pub use trial::{TickSummary, TrialReconciler};
