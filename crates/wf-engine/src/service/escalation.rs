//! Escalation Service
//!
//! Sweeps a process for instances past their SLA and pushes each one through the
//! escalation action of its rule. Failures are collected per instance.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::domain::{Actor, EscalationResult, ProcessInstance, ProcessRef};
use crate::error::Result;
use crate::service::definition::DefinitionStore;
use crate::service::tracker::InstanceTracker;
use crate::service::transition::{TransitionEngine, TransitionRequest};

pub struct EscalationService {
    definitions: Arc<DefinitionStore>,
    tracker: Arc<InstanceTracker>,
    engine: Arc<TransitionEngine>,
}

impl EscalationService {
    pub fn new(
        definitions: Arc<DefinitionStore>,
        tracker: Arc<InstanceTracker>,
        engine: Arc<TransitionEngine>,
    ) -> Self {
        Self {
            definitions,
            tracker,
            engine,
        }
    }

    /// Escalate every breached instance of the latest version of `process_code`
    pub async fn escalate(&self, tenant_id: &str, process_code: &str, actor: &Actor) -> Result<EscalationResult> {
        let graph = self.definitions.get_latest(tenant_id, process_code).await?;
        let process = graph.process();
        let now = Utc::now();
        let mut result = EscalationResult::default();

        for rule in &process.escalations {
            let state = match process.state_by_code(&rule.state) {
                Some(state) => state,
                None => {
                    result
                        .errors
                        .push(format!("escalation rule references unknown state {}", rule.state));
                    continue;
                }
            };

            let rule = process.effective_rule(rule);
            let breached: Vec<ProcessInstance> = self
                .tracker
                .find_in_state(tenant_id, graph.id(), &state.id)
                .await?
                .into_iter()
                .filter(|i| rule.is_breached(now, i.state_entered_at, i.created_at))
                .collect();
            result.total_found += breached.len();

            let comment = format!("Auto-escalated from state {} due to SLA breach", state.code);
            for instance in breached {
                let request = TransitionRequest::new(
                    tenant_id,
                    &instance.entity_id,
                    ProcessRef::id(graph.id()),
                    &rule.action,
                    actor.clone(),
                )
                .with_comment(comment.clone())
                .expecting_state(&state.id);

                match self.engine.transition(&request).await {
                    Ok(outcome) => {
                        result.total_escalated += 1;
                        result.escalated_instances.push(outcome.instance);
                    }
                    Err(e) => {
                        warn!(
                            instance_id = %instance.id,
                            entity_id = %instance.entity_id,
                            action = %rule.action,
                            error = %e,
                            "Failed to escalate instance"
                        );
                        result
                            .errors
                            .push(format!("instance {}: {}", instance.id, e));
                    }
                }
            }
        }

        info!(
            tenant_id = %tenant_id,
            process = %process_code,
            found = result.total_found,
            escalated = result.total_escalated,
            errors = result.errors.len(),
            "Escalation sweep completed"
        );
        Ok(result)
    }

    pub async fn search_escalated(
        &self,
        tenant_id: &str,
        process_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ProcessInstance>> {
        let graph = self.definitions.get_process(tenant_id, process_id).await?;
        self.tracker
            .search_escalated(tenant_id, graph.id(), limit, offset)
            .await
    }
}
