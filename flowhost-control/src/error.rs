//! Error types for the flowhost control plane.
//!
//! All errors implement the standard [`std::error::Error`] trait via
//! [`thiserror::Error`].
//!
//! # Error Categories
//!
//! - **Validation** ([`ControlError::InvalidUserId`], [`ControlError::InvalidInstanceName`],
//!   [`ControlError::InvalidDomain`]): malformed input, rejected before any state is touched
//! - **Entitlement** ([`ControlError::SubscriptionInactive`], [`ControlError::QuotaExceeded`]):
//!   the subscription does not permit the operation; no state is mutated
//! - **Conflict** ([`ControlError::DuplicateName`], [`ControlError::DuplicateDomain`]):
//!   the operation collides with an existing live record
//! - **Gateway** ([`ControlError::Gateway`]): the external provisioning API failed;
//!   foreground callers mark the affected instance `error`, background callers retry
//!   on the next reconciliation pass
//! - **Persistence** ([`ControlError::Persistence`], [`ControlError::NotFound`]):
//!   fatal for the current operation, propagated to the caller

use thiserror::Error;

/// Result type alias for control-plane operations.
///
/// All fallible functions in this crate return this type.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur in the flowhost control plane.
///
/// Variants carry enough context for the caller to produce an actionable
/// user-facing message without consulting other state.
#[must_use = "errors should be handled, propagated, or explicitly panicked"]
#[derive(Debug, Error)]
pub enum ControlError {
    /// A user id failed validation.
    ///
    /// User ids must be non-empty, at most 64 characters, and contain only
    /// alphanumeric characters, hyphens, and underscores.
    #[error("invalid user id: {0}")]
    InvalidUserId(String),

    /// An instance name failed validation.
    ///
    /// Instance names follow the same character rules as user ids.
    #[error("invalid instance name: {0}")]
    InvalidInstanceName(String),

    /// A custom domain failed validation.
    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    /// The subscription does not permit the operation because it is not
    /// in `trial` (unexpired) or `active` status.
    #[error("subscription is not active: {0}")]
    SubscriptionInactive(String),

    /// The user has reached their instance quota.
    ///
    /// `current` is the live-instance count at the time of the check
    /// (soft-deleted, `deleting`, and `error` instances excluded;
    /// `disabled` instances included). `max` is the effective limit.
    #[error("instance limit reached: {current} of {max} instances in use")]
    QuotaExceeded {
        /// Live instances counted against the quota.
        current: usize,
        /// Effective instance limit for the subscription.
        max: i32,
    },

    /// An account with this user id is already registered.
    #[error("account '{0}' already exists")]
    DuplicateAccount(String),

    /// An instance with this name already exists (live) for the user.
    ///
    /// Soft-deleted instances never trigger this; their names are reusable.
    #[error("an instance named '{0}' already exists")]
    DuplicateName(String),

    /// The domain is already attached to another live instance of the user.
    #[error("domain '{0}' is already attached to another instance")]
    DuplicateDomain(String),

    /// A deployment-gateway call failed.
    ///
    /// Covers remote rejections, timeouts, and transport faults alike; the
    /// gateway layer normalizes them before they reach callers.
    #[error("deployment gateway call failed: {0}")]
    Gateway(String),

    /// The referenced account or instance does not exist (or is soft-deleted).
    #[error("not found: {0}")]
    NotFound(String),

    /// The backing store rejected or lost an update.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// The commission ledger rejected a transaction.
    ///
    /// Raised from payment reconciliation before the subscription document is
    /// committed, so a failed commission leaves the account unchanged.
    #[error("commission ledger rejected transaction {transaction_id}: {message}")]
    Commission {
        /// Transaction id of the payment confirmation being processed.
        transaction_id: String,
        /// Ledger-provided failure detail.
        message: String,
    },

    /// Configuration is missing, unreadable, or fails validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ControlError {
    /// Returns true for errors that reject the request without mutating state.
    ///
    /// Useful for mapping to 4xx-style responses at an outer surface.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidUserId(_)
                | Self::InvalidInstanceName(_)
                | Self::InvalidDomain(_)
                | Self::SubscriptionInactive(_)
                | Self::QuotaExceeded { .. }
                | Self::DuplicateAccount(_)
                | Self::DuplicateName(_)
                | Self::DuplicateDomain(_)
        )
    }
}
