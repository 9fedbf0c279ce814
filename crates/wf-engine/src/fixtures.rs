//! Shared definitions for unit tests

use crate::domain::{ActionDefinition, ProcessDefinition, StateDefinition};

/// DRAFT(start) -> SUBMITTED -> {APPROVED, REJECTED}
pub fn permit_approval(tenant_id: &str) -> ProcessDefinition {
    ProcessDefinition::new(tenant_id, "permit-approval", "Permit Approval")
        .with_state(StateDefinition::start("DRAFT", "Draft"))
        .with_state(StateDefinition::new("SUBMITTED", "Submitted"))
        .with_state(StateDefinition::terminal("APPROVED", "Approved"))
        .with_state(StateDefinition::terminal("REJECTED", "Rejected"))
        .with_action(ActionDefinition::new("SUBMIT", "DRAFT", "SUBMITTED").with_role("APPLICANT"))
        .with_action(ActionDefinition::new("APPROVE", "SUBMITTED", "APPROVED").with_role("APPROVER"))
        .with_action(ActionDefinition::new("REJECT", "SUBMITTED", "REJECTED").with_role("APPROVER"))
}
