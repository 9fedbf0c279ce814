//! Transition Engine
//!
//! Applies one guarded action to an instance:
//!
//! 1. Resolve the process version
//! 2. Load the instance, creating it at the start state when policy allows.
//!    An entity already running another version of the process keeps that version.
//! 3. Resolve the action leaving the current state
//! 4. Ask the guard
//! 5. Compute the target state
//! 6. Write through the tracker's compare-and-swap
//! 7. On conflict re-read and retry from 3, up to `max_attempts`
//! 8. Return the updated instance with the appended entry
//!
//! No lock is held across any of this; the version check is the only serialization point.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use wf_config::EngineConfig;

use crate::domain::{Action, Actor, HistoryEntry, InstanceSeed, ProcessGraph, ProcessInstance, ProcessRef};
use crate::error::{Result, WorkflowError};
use crate::service::definition::DefinitionStore;
use crate::service::guard::{Guard, GuardContext};
use crate::service::tracker::InstanceTracker;

const MAX_COMMENT_LEN: usize = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRequest {
    pub tenant_id: String,
    pub entity_id: String,
    pub process: ProcessRef,
    pub action: String,
    pub actor: Actor,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Hand the instance to this actor as part of the transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    /// State (code or id) the caller believes the instance is in
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_state: Option<String>,
}

impl TransitionRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        entity_id: impl Into<String>,
        process: ProcessRef,
        action: impl Into<String>,
        actor: Actor,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            entity_id: entity_id.into(),
            process,
            action: action.into(),
            actor,
            comment: None,
            assignee: None,
            expected_state: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.assignee = Some(assignee.into());
        self
    }

    pub fn expecting_state(mut self, state: impl Into<String>) -> Self {
        self.expected_state = Some(state.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(WorkflowError::validation("tenantId is required"));
        }
        if self.entity_id.trim().is_empty() {
            return Err(WorkflowError::validation("entityId is required"));
        }
        if self.action.trim().is_empty() {
            return Err(WorkflowError::validation("action is required"));
        }
        if self.actor.id.trim().is_empty() {
            return Err(WorkflowError::validation("actorId is required"));
        }
        let process = match &self.process {
            ProcessRef::Id(v) | ProcessRef::Code(v) => v,
        };
        if process.trim().is_empty() {
            return Err(WorkflowError::validation("processId or processCode is required"));
        }
        if let Some(comment) = &self.comment {
            if comment.chars().count() > MAX_COMMENT_LEN {
                return Err(WorkflowError::validation(format!(
                    "comment must be at most {} characters",
                    MAX_COMMENT_LEN
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionOutcome {
    pub instance: ProcessInstance,
    pub entry: HistoryEntry,
    /// Actions leaving the new state
    pub next_actions: Vec<String>,
    /// Write attempts used, 1 when uncontended
    pub attempts: u32,
}

/// Whether an action/comment pair marks an escalation
pub fn is_escalation(action_name: &str, comment: Option<&str>) -> bool {
    action_name.to_lowercase().contains("escalat")
        || comment.map_or(false, |c| c.to_lowercase().contains("auto-escalat"))
}

pub struct TransitionEngine {
    definitions: Arc<DefinitionStore>,
    tracker: Arc<InstanceTracker>,
    guard: Arc<dyn Guard>,
    max_attempts: u32,
    implicit_create: bool,
}

impl TransitionEngine {
    pub fn new(
        definitions: Arc<DefinitionStore>,
        tracker: Arc<InstanceTracker>,
        guard: Arc<dyn Guard>,
    ) -> Self {
        Self::from_config(definitions, tracker, guard, &EngineConfig::default())
    }

    pub fn from_config(
        definitions: Arc<DefinitionStore>,
        tracker: Arc<InstanceTracker>,
        guard: Arc<dyn Guard>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            definitions,
            tracker,
            guard,
            max_attempts: config.max_attempts.max(1),
            implicit_create: config.implicit_create,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_implicit_create(mut self, enabled: bool) -> Self {
        self.implicit_create = enabled;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn transition(&self, request: &TransitionRequest) -> Result<TransitionOutcome> {
        request.validate()?;

        let (graph, mut instance) = self.load_instance(request).await?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.attempt(&graph, &instance, request).await {
                Ok((updated, entry)) => {
                    let process = graph.process();
                    info!(
                        tenant_id = %updated.tenant_id,
                        process = %process.code,
                        entity_id = %updated.entity_id,
                        action = %entry.action_name,
                        from = %process.state_code(&entry.from_state),
                        to = %process.state_code(&entry.to_state),
                        version = updated.version,
                        actor = %entry.actor_id,
                        escalated = entry.escalated,
                        attempts,
                        "Transition applied"
                    );
                    let next_actions = graph.next_action_names(&updated.current_state_id);
                    return Ok(TransitionOutcome {
                        instance: updated,
                        entry,
                        next_actions,
                        attempts,
                    });
                }
                Err(WorkflowError::Conflict { expected_version, .. }) if attempts < self.max_attempts => {
                    warn!(
                        instance_id = %instance.id,
                        expected_version,
                        attempt = attempts,
                        "Transition lost a concurrent write, retrying"
                    );
                    instance = self
                        .tracker
                        .get_instance_by_id(&request.tenant_id, &instance.id)
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Actions from the instance's current state that the guard would allow for `actor`
    pub async fn available_actions(
        &self,
        tenant_id: &str,
        entity_id: &str,
        process: &ProcessRef,
        actor: &Actor,
    ) -> Result<Vec<Action>> {
        let (graph, instance) = self.locate(tenant_id, entity_id, process).await?;
        let instance = instance.ok_or_else(|| {
            WorkflowError::not_found("ProcessInstance", format!("{}/{}", graph.id(), entity_id))
        })?;

        Ok(graph
            .outgoing(&instance.current_state_id)
            .filter(|action| {
                self.guard
                    .authorize(&GuardContext {
                        actor,
                        process: &graph,
                        from_state: &instance.current_state_id,
                        action: &action.name,
                        assignee: instance.assignee.as_deref(),
                    })
                    .is_allowed()
            })
            .cloned()
            .collect())
    }

    /// The process version and instance a request addresses. An entity runs one
    /// version of a process code: a code reference follows the entity's own
    /// version, an id naming a different version is rejected.
    async fn locate(
        &self,
        tenant_id: &str,
        entity_id: &str,
        process: &ProcessRef,
    ) -> Result<(Arc<ProcessGraph>, Option<ProcessInstance>)> {
        let graph = self.definitions.resolve(tenant_id, process).await?;
        if let Some(instance) = self.tracker.find_instance(tenant_id, entity_id, graph.id()).await? {
            return Ok((graph, Some(instance)));
        }

        let code = graph.process().code.clone();
        match self
            .tracker
            .find_instance_by_code(tenant_id, &code, entity_id)
            .await?
        {
            Some(instance) => self.pin_to_instance(graph, instance, process).await,
            None => Ok((graph, None)),
        }
    }

    async fn pin_to_instance(
        &self,
        requested: Arc<ProcessGraph>,
        instance: ProcessInstance,
        process: &ProcessRef,
    ) -> Result<(Arc<ProcessGraph>, Option<ProcessInstance>)> {
        if instance.process_id == requested.id() {
            return Ok((requested, Some(instance)));
        }
        if let ProcessRef::Id(_) = process {
            return Err(WorkflowError::duplicate_instance(
                &instance.tenant_id,
                &instance.process_id,
                &instance.entity_id,
            ));
        }

        debug!(
            entity_id = %instance.entity_id,
            process = %instance.process_code,
            instance_process_id = %instance.process_id,
            latest_process_id = %requested.id(),
            "Entity runs an earlier version, transitioning on it"
        );
        let graph = self
            .definitions
            .get_by_id(&instance.tenant_id, &instance.process_id)
            .await?;
        Ok((graph, Some(instance)))
    }

    async fn load_instance(&self, request: &TransitionRequest) -> Result<(Arc<ProcessGraph>, ProcessInstance)> {
        let (graph, instance) = self
            .locate(&request.tenant_id, &request.entity_id, &request.process)
            .await?;
        if let Some(instance) = instance {
            return Ok((graph, instance));
        }

        if !self.implicit_create {
            return Err(WorkflowError::not_found(
                "ProcessInstance",
                format!("{}/{}", graph.id(), request.entity_id),
            ));
        }

        match self
            .tracker
            .create_in(&graph, &request.entity_id, InstanceSeed::default())
            .await
        {
            Ok(instance) => Ok((graph, instance)),
            Err(WorkflowError::DuplicateInstance { .. }) => {
                debug!(entity_id = %request.entity_id, "Instance created concurrently, re-reading");
                let (graph, instance) = self
                    .locate(&request.tenant_id, &request.entity_id, &request.process)
                    .await?;
                let instance = instance.ok_or_else(|| {
                    WorkflowError::not_found("ProcessInstance", format!("{}/{}", graph.id(), request.entity_id))
                })?;
                Ok((graph, instance))
            }
            Err(e) => Err(e),
        }
    }

    /// Steps 3 to 6 against one snapshot of the instance
    async fn attempt(
        &self,
        graph: &ProcessGraph,
        instance: &ProcessInstance,
        request: &TransitionRequest,
    ) -> Result<(ProcessInstance, HistoryEntry)> {
        let process = graph.process();
        let current = instance.current_state_id.as_str();

        if let Some(expected) = &request.expected_state {
            let matches = process
                .resolve_state(expected)
                .map_or(false, |state| state.id == current);
            if !matches {
                return Err(WorkflowError::StateMismatch {
                    expected: expected.clone(),
                    actual: process.state_code(current).to_string(),
                });
            }
        }

        let action = graph
            .find_action(current, &request.action)
            .ok_or_else(|| WorkflowError::not_applicable(process.state_code(current), &request.action))?;

        let decision = self.guard.authorize(&GuardContext {
            actor: &request.actor,
            process: graph,
            from_state: current,
            action: &action.name,
            assignee: instance.assignee.as_deref(),
        });
        if !decision.is_allowed() {
            debug!(
                instance_id = %instance.id,
                actor = %request.actor.id,
                action = %action.name,
                decision = ?decision,
                "Transition denied"
            );
        }
        decision.into_result()?;

        let next_state = action.to_state.as_str();
        let entry = HistoryEntry::new(&request.actor.id, current, next_state, &action.name)
            .with_comment(request.comment.clone())
            .with_assignee(request.assignee.clone())
            .with_escalated(is_escalation(&action.name, request.comment.as_deref()));

        let updated = self
            .tracker
            .append_transition(&instance.id, instance.version, next_state, entry)
            .await?;

        let sequence = instance.version + 1;
        let stored = updated
            .history
            .iter()
            .find(|e| e.sequence == sequence)
            .cloned()
            .ok_or_else(|| {
                WorkflowError::internal(format!("instance {} has no entry {} after write", updated.id, sequence))
            })?;
        Ok((updated, stored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::permit_approval;
    use crate::repository::{InMemoryDefinitionRepository, InMemoryInstanceRepository};
    use crate::service::guard::RbacGuard;

    async fn engine() -> TransitionEngine {
        let definitions = Arc::new(DefinitionStore::new(Arc::new(InMemoryDefinitionRepository::new())));
        definitions.register_process(permit_approval("pb")).await.unwrap();
        let tracker = Arc::new(InstanceTracker::new(
            Arc::new(InMemoryInstanceRepository::new()),
            definitions.clone(),
        ));
        TransitionEngine::new(definitions, tracker, Arc::new(RbacGuard::new()))
    }

    fn submit(entity: &str) -> TransitionRequest {
        TransitionRequest::new(
            "pb",
            entity,
            ProcessRef::code("permit-approval"),
            "SUBMIT",
            Actor::new("alice").with_role("APPLICANT"),
        )
    }

    #[test]
    fn test_escalation_detection() {
        assert!(is_escalation("ESCALATE", None));
        assert!(is_escalation("auto_escalation", None));
        assert!(is_escalation("REASSIGN", Some("Auto-Escalated from state X due to SLA breach")));
        assert!(!is_escalation("APPROVE", Some("looks good")));
        assert!(!is_escalation("APPROVE", None));
    }

    #[test]
    fn test_request_validation() {
        assert!(submit("permit-1").validate().is_ok());

        let mut request = submit("");
        assert_eq!(request.validate().unwrap_err().code(), "VALIDATION_ERROR");

        request = submit("permit-1");
        request.actor = Actor::new(" ");
        assert!(request.validate().is_err());

        request = submit("permit-1").with_comment("x".repeat(MAX_COMMENT_LEN + 1));
        assert!(request.validate().is_err());
    }

    #[tokio::test]
    async fn test_implicit_create_and_submit() {
        let engine = engine().await;
        let outcome = engine.transition(&submit("permit-1")).await.unwrap();

        assert_eq!(outcome.instance.version, 1);
        assert_eq!(outcome.entry.sequence, 1);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.next_actions.len(), 2);
        assert!(outcome.next_actions.contains(&"APPROVE".to_string()));
        assert!(!outcome.entry.escalated);
    }

    #[tokio::test]
    async fn test_expected_state() {
        let engine = engine().await;
        engine.transition(&submit("permit-1")).await.unwrap();

        let request = TransitionRequest::new(
            "pb",
            "permit-1",
            ProcessRef::code("permit-approval"),
            "APPROVE",
            Actor::new("bob").with_role("APPROVER"),
        )
        .expecting_state("DRAFT");
        let err = engine.transition(&request).await.unwrap_err();
        assert_eq!(err.code(), "STATE_MISMATCH");

        let outcome = engine
            .transition(&request.expecting_state("SUBMITTED"))
            .await
            .unwrap();
        assert_eq!(outcome.instance.version, 2);
        assert!(outcome.next_actions.is_empty());
    }

    #[tokio::test]
    async fn test_available_actions_filtered_by_guard() {
        let engine = engine().await;
        engine.transition(&submit("permit-1")).await.unwrap();
        let process = ProcessRef::code("permit-approval");

        let applicant = Actor::new("alice").with_role("APPLICANT");
        let actions = engine.available_actions("pb", "permit-1", &process, &applicant).await.unwrap();
        assert!(actions.is_empty());

        let approver = Actor::new("bob").with_role("APPROVER");
        let mut names: Vec<String> = engine
            .available_actions("pb", "permit-1", &process, &approver)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["APPROVE", "REJECT"]);
    }
}
