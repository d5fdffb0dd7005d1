//! Flowhost daemon: wires the control plane and runs its background work.
//!
//! Responsibilities:
//! - load and validate configuration (first CLI argument, default
//!   `flowhost.toml`)
//! - run the trial reconciliation loop on its configured interval
//! - consume payment confirmations as newline-delimited JSON on stdin,
//!   standing in for the external payment-confirmation source
//! - shut down cleanly on ctrl-c

mod observability;

use std::sync::Arc;

use flowhost_control::{
    account::AccountDirectory,
    clock::SystemClock,
    config::ControlConfig,
    gateway::HttpDeploymentGateway,
    reconcile::{MemoryLedger, PaymentEvent, PaymentReconciler, TrialReconciler},
    registry::Registry,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use crate::observability::{LogFormat, init_observability};

#[tokio::main]
async fn main() -> flowhost_control::Result<()> {
    init_observability(LogFormat::from_env());

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "flowhost.toml".to_owned());
    let config = ControlConfig::load(&config_path)?;
    info!(config = %config_path, "configuration loaded");

    let directory = Arc::new(AccountDirectory::new());
    let registry = Arc::new(Registry::new());
    let gateway = Arc::new(HttpDeploymentGateway::new(&config.gateway)?);
    let clock = Arc::new(SystemClock);
    let ledger = Arc::new(MemoryLedger::new());

    let trial = Arc::new(
        TrialReconciler::new(
            Arc::clone(&directory),
            Arc::clone(&registry),
            gateway.clone() as _,
            clock.clone() as _,
        )
        .with_interval(std::time::Duration::from_secs(config.trial.reconcile_interval_secs)),
    );
    let payment = Arc::new(PaymentReconciler::new(
        directory,
        registry,
        gateway as _,
        ledger as _,
        clock as _,
        config.billing.clone(),
    ));

    let trial_loop = tokio::spawn({
        let trial = Arc::clone(&trial);
        async move { trial.run().await }
    });
    let payment_feed = tokio::spawn(payment_feed(payment));

    info!("flowhost daemon running");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| flowhost_control::ControlError::Config(format!("signal handler: {e}")))?;
    info!("shutting down");

    trial_loop.abort();
    payment_feed.abort();
    Ok(())
}

/// Reads newline-delimited JSON payment confirmations from stdin and feeds
/// them to payment reconciliation. Malformed lines are logged and skipped.
async fn payment_feed(reconciler: Arc<PaymentReconciler>) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<PaymentEvent>(line) {
                    Ok(event) => {
                        if let Err(e) = reconciler.process(&event).await {
                            error!(
                                transaction = %event.transaction_id,
                                error = %e,
                                "payment confirmation failed"
                            );
                        }
                    }
                    Err(e) => warn!(error = %e, "unparseable payment confirmation; skipping"),
                }
            }
            Ok(None) => {
                info!("payment feed closed");
                return;
            }
            Err(e) => {
                error!(error = %e, "payment feed read error");
                return;
            }
        }
    }
}
