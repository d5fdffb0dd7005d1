//! Flowhost control plane: provisioning and lifecycle management for hosted
//! workflow-automation instances.
//!
//! This crate is the single-writer control plane between subscribing users,
//! a billing/affiliate model, and the external provisioning API that
//! actually creates and destroys compute.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 Orchestration API                    │  create / delete /
//! │  (entitlement-gated, request-driven)                 │  domains / SSL
//! └───────┬──────────────┬──────────────────┬────────────┘
//!         │              │                  │
//! ┌───────▼──────┐ ┌─────▼────────┐ ┌───────▼───────────┐
//! │ Entitlement  │ │   Instance   │ │    Deployment     │
//! │  Evaluator   │ │   Registry   │ │     Gateway       │──► provisioning API
//! │ (pure logic) │ │ (documents)  │ │ (normalized HTTP) │    (basic auth)
//! └───────▲──────┘ └─────▲────────┘ └───────▲───────────┘
//!         │              │                  │
//! ┌───────┴──────────────┴──────────────────┴────────────┐
//! │               Reconciliation                          │
//! │  trial expiry loop (hourly)  ·  payment confirmation  │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! The evaluator is pure: subscription state plus an explicit clock decide
//! whether a user may create, run, or keep instances. The registry holds
//! instance documents with soft deletes and per-user live-name uniqueness.
//! The gateway normalizes every provisioning call into a success/failure
//! result so partial failure is data, not an exception. Reconciliation runs
//! on a timer (trial expiry) and on external events (payment confirmation),
//! sharing the same registry and gateway as the request-driven surface.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use flowhost_control::{
//!     account::{AccountDirectory, Plan, UserId},
//!     clock::SystemClock,
//!     gateway::StaticGateway,
//!     instance::DeploymentSpec,
//!     orchestrator::{CreateInstanceParams, Orchestrator},
//!     registry::Registry,
//! };
//!
//! # async fn example() -> flowhost_control::Result<()> {
//! let orchestrator = Orchestrator::new(
//!     Arc::new(AccountDirectory::new()),
//!     Arc::new(Registry::new()),
//!     Arc::new(StaticGateway::new()),
//!     Arc::new(SystemClock),
//! );
//!
//! let user = UserId::new("user-123")?;
//! orchestrator
//!     .register_trial(user.clone(), None, Plan::Starter, chrono::Duration::days(14))
//!     .await?;
//!
//! let instance = orchestrator
//!     .create_instance(
//!         &user,
//!         CreateInstanceParams {
//!             name: "my-flows".to_owned(),
//!             deployment: DeploymentSpec::default(),
//!         },
//!     )
//!     .await?;
//!
//! println!("deployed at {}", instance.url.unwrap_or_default());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod account;
pub mod clock;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod gateway;
pub mod instance;
pub mod orchestrator;
pub mod reconcile;
pub mod registry;

pub use error::{ControlError, Result};
