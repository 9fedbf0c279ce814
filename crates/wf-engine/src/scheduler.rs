//! Escalation Scheduler - background SLA sweeps
//!
//! Runs [`EscalationService::escalate`] for each configured target on a fixed
//! interval. Sweeps run inline in the ticker loop, so they never overlap; a slow
//! sweep skips the ticks it missed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use wf_config::{EscalationConfig, EscalationTarget};

use crate::domain::{Actor, EscalationResult};
use crate::service::EscalationService;

#[derive(Debug, Clone)]
pub struct EscalationSchedulerConfig {
    pub interval: Duration,
    pub targets: Vec<EscalationTarget>,
    /// Identity escalation transitions are recorded under
    pub actor: Actor,
}

impl EscalationSchedulerConfig {
    pub fn from_config(config: &EscalationConfig) -> Self {
        Self {
            interval: config.interval(),
            targets: config.targets.clone(),
            actor: Actor::new(&config.actor_id).with_roles(config.actor_roles.iter().cloned()),
        }
    }
}

pub struct EscalationScheduler {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl EscalationScheduler {
    /// Spawn the sweep loop. The first sweep runs immediately.
    pub fn start(service: Arc<EscalationService>, config: EscalationSchedulerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        info!(
            interval_secs = config.interval.as_secs(),
            targets = config.targets.len(),
            "Starting escalation scheduler"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("Running escalation sweep");
                        sweep(&service, &config).await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Escalation scheduler shutting down");
                        break;
                    }
                }
            }
        });

        Self { shutdown_tx, handle }
    }

    /// Stop the loop and wait for an in-flight sweep to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            error!(error = %e, "Escalation scheduler task failed");
        }
    }
}

/// One pass over every target
pub async fn sweep(service: &EscalationService, config: &EscalationSchedulerConfig) -> EscalationResult {
    let mut total = EscalationResult::default();
    for target in &config.targets {
        match service
            .escalate(&target.tenant_id, &target.process_code, &config.actor)
            .await
        {
            Ok(result) => total.merge(result),
            Err(e) => {
                error!(
                    tenant_id = %target.tenant_id,
                    process = %target.process_code,
                    error = %e,
                    "Escalation sweep failed"
                );
                total
                    .errors
                    .push(format!("{}/{}: {}", target.tenant_id, target.process_code, e));
            }
        }
    }
    total
}
