//! Escalation Results

use serde::{Deserialize, Serialize};

use super::ProcessInstance;

/// Outcome of one escalation sweep over a process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationResult {
    /// Instances found past their SLA
    pub total_found: usize,
    pub total_escalated: usize,
    pub escalated_instances: Vec<ProcessInstance>,
    /// Per-instance failures; a failure never aborts the sweep
    #[serde(default)]
    pub errors: Vec<String>,
}

impl EscalationResult {
    pub fn merge(&mut self, other: EscalationResult) {
        self.total_found += other.total_found;
        self.total_escalated += other.total_escalated;
        self.escalated_instances.extend(other.escalated_instances);
        self.errors.extend(other.errors);
    }
}
