//! Workflow Engine Integration Tests
//!
//! End-to-end behaviour over the in-memory store: registration, guarded
//! transitions, optimistic concurrency and escalation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::future::join_all;

use wf_config::WorkflowConfig;
use wf_engine::repository::{InMemoryDefinitionRepository, InMemoryInstanceRepository};
use wf_engine::{
    ActionDefinition, Actor, AllowAll, DefinitionErrorKind, DefinitionStore, DenyAll, EscalationRule,
    HistoryEntry, InstanceRepository, InstanceTracker, ProcessDefinition, ProcessInstance, ProcessRef,
    RbacGuard, Result, StateDefinition, TransitionEngine, TransitionRequest, WorkflowError,
    WorkflowServices,
};

const TENANT: &str = "city-permits";

fn permit_approval() -> ProcessDefinition {
    ProcessDefinition::new(TENANT, "permit-approval", "Permit Approval")
        .with_description("Building permit review")
        .with_state(StateDefinition::start("DRAFT", "Draft"))
        .with_state(StateDefinition::new("SUBMITTED", "Submitted"))
        .with_state(StateDefinition::terminal("APPROVED", "Approved"))
        .with_state(StateDefinition::terminal("REJECTED", "Rejected"))
        .with_action(ActionDefinition::new("SUBMIT", "DRAFT", "SUBMITTED").with_role("APPLICANT"))
        .with_action(ActionDefinition::new("APPROVE", "SUBMITTED", "APPROVED").with_role("APPROVER"))
        .with_action(ActionDefinition::new("REJECT", "SUBMITTED", "REJECTED").with_role("APPROVER"))
}

fn applicant() -> Actor {
    Actor::new("alice").with_role("APPLICANT")
}

fn approver() -> Actor {
    Actor::new("bob").with_role("APPROVER")
}

fn request(entity: &str, action: &str, actor: Actor) -> TransitionRequest {
    TransitionRequest::new(TENANT, entity, ProcessRef::code("permit-approval"), action, actor)
}

async fn services() -> WorkflowServices {
    let services = WorkflowServices::in_memory(&WorkflowConfig::default());
    services.definitions.register_process(permit_approval()).await.unwrap();
    services
}

/// Fails the first `conflicts` appends with `Conflict`, then delegates
struct ConflictingInstanceRepository {
    inner: InMemoryInstanceRepository,
    conflicts: usize,
    appends: AtomicUsize,
}

impl ConflictingInstanceRepository {
    fn new(conflicts: usize) -> Self {
        Self {
            inner: InMemoryInstanceRepository::new(),
            conflicts,
            appends: AtomicUsize::new(0),
        }
    }

    fn appends(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceRepository for ConflictingInstanceRepository {
    async fn insert(&self, instance: &ProcessInstance) -> Result<()> {
        self.inner.insert(instance).await
    }

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<ProcessInstance>> {
        self.inner.find_by_id(tenant_id, id).await
    }

    async fn find_by_entity(
        &self,
        tenant_id: &str,
        process_id: &str,
        entity_id: &str,
    ) -> Result<Option<ProcessInstance>> {
        self.inner.find_by_entity(tenant_id, process_id, entity_id).await
    }

    async fn find_by_process_code(
        &self,
        tenant_id: &str,
        process_code: &str,
        entity_id: &str,
    ) -> Result<Option<ProcessInstance>> {
        self.inner
            .find_by_process_code(tenant_id, process_code, entity_id)
            .await
    }

    async fn append_transition(
        &self,
        instance_id: &str,
        expected_version: u64,
        new_state: &str,
        entry: HistoryEntry,
    ) -> Result<ProcessInstance> {
        let n = self.appends.fetch_add(1, Ordering::SeqCst);
        if n < self.conflicts {
            return Err(WorkflowError::conflict(instance_id, expected_version));
        }
        self.inner
            .append_transition(instance_id, expected_version, new_state, entry)
            .await
    }

    async fn find_in_state(
        &self,
        tenant_id: &str,
        process_id: &str,
        state_id: &str,
    ) -> Result<Vec<ProcessInstance>> {
        self.inner.find_in_state(tenant_id, process_id, state_id).await
    }

    async fn find_escalated(
        &self,
        tenant_id: &str,
        process_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ProcessInstance>> {
        self.inner.find_escalated(tenant_id, process_id, limit, offset).await
    }
}

mod definition_tests {
    use super::*;

    #[tokio::test]
    async fn test_registered_process_is_well_formed() {
        let services = services().await;
        let graph = services.definitions.get_process(TENANT, "permit-approval").await.unwrap();
        let process = graph.process();

        assert_eq!(process.version, 1);
        assert_eq!(process.states.iter().filter(|s| s.is_start).count(), 1);
        for terminal in process.terminal_states() {
            assert!(process.actions.iter().all(|a| a.from_state != terminal.id));
        }

        let by_id = services.definitions.get_process(TENANT, &process.id).await.unwrap();
        assert_eq!(by_id.id(), process.id);
    }

    #[tokio::test]
    async fn test_new_version_leaves_old_one_intact() {
        let services = services().await;
        let v1 = services.definitions.get_process(TENANT, "permit-approval").await.unwrap();
        let v2 = services
            .definitions
            .register_process(permit_approval().with_description("Revised"))
            .await
            .unwrap();

        assert_eq!(v2.process().version, 2);
        assert_ne!(v1.id(), v2.id());

        let old = services.definitions.get_process(TENANT, v1.id()).await.unwrap();
        assert_eq!(old.process().version, 1);

        let latest = services.definitions.list_processes(TENANT).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, 2);
    }

    #[tokio::test]
    async fn test_invalid_graphs_rejected() {
        let services = services().await;

        let no_start = ProcessDefinition::new(TENANT, "broken", "Broken")
            .with_state(StateDefinition::new("A", "A"));
        let err = services.definitions.register_process(no_start).await.unwrap_err();
        assert_eq!(err.code(), DefinitionErrorKind::NoStartState.code());

        let dangling = ProcessDefinition::new(TENANT, "broken", "Broken")
            .with_state(StateDefinition::start("A", "A"))
            .with_action(ActionDefinition::new("GO", "A", "NOWHERE"));
        let err = services.definitions.register_process(dangling).await.unwrap_err();
        assert_eq!(err.code(), "DANGLING_ACTION");

        let unreachable = ProcessDefinition::new(TENANT, "broken", "Broken")
            .with_state(StateDefinition::start("A", "A"))
            .with_state(StateDefinition::new("ISLAND", "Island"));
        let err = services.definitions.register_process(unreachable).await.unwrap_err();
        assert_eq!(err.code(), "UNREACHABLE_STATE");

        let err = services.definitions.get_process(TENANT, "broken").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_unreachable_states_allowed_by_policy() {
        let mut config = WorkflowConfig::default();
        config.engine.allow_unreachable_states = true;
        let services = WorkflowServices::in_memory(&config);

        let def = ProcessDefinition::new(TENANT, "loose", "Loose")
            .with_state(StateDefinition::start("A", "A"))
            .with_state(StateDefinition::new("ISLAND", "Island"));
        let graph = services.definitions.register_process(def).await.unwrap();
        assert_eq!(graph.process().states.len(), 2);
    }

    #[tokio::test]
    async fn test_processes_are_tenant_scoped() {
        let services = services().await;
        let err = services
            .definitions
            .get_process("other-tenant", "permit-approval")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}

mod transition_tests {
    use super::*;

    #[tokio::test]
    async fn test_permit_approval_scenario() {
        let services = services().await;
        let graph = services.definitions.get_process(TENANT, "permit-approval").await.unwrap();

        let created = services
            .tracker
            .create_instance(TENANT, graph.id(), "permit-42")
            .await
            .unwrap();
        assert_eq!(graph.process().state_code(&created.current_state_id), "DRAFT");

        let submitted = services
            .engine
            .transition(&request("permit-42", "SUBMIT", applicant()).with_comment("ready"))
            .await
            .unwrap();
        assert_eq!(graph.process().state_code(&submitted.instance.current_state_id), "SUBMITTED");
        assert_eq!(submitted.instance.history.len(), 1);
        assert_eq!(submitted.entry.comment.as_deref(), Some("ready"));

        let approved = services
            .engine
            .transition(&request("permit-42", "APPROVE", approver()))
            .await
            .unwrap();
        assert_eq!(graph.process().state_code(&approved.instance.current_state_id), "APPROVED");
        assert_eq!(approved.instance.history.len(), 2);
        assert!(approved.next_actions.is_empty());

        let err = services
            .engine
            .transition(&request("permit-42", "APPROVE", approver()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ACTION_NOT_APPLICABLE");

        let after = services.tracker.get_instance(TENANT, "permit-42", graph.id()).await.unwrap();
        assert_eq!(after.current_state_id, approved.instance.current_state_id);
        assert_eq!(after.history.len(), 2);
        assert_eq!(after.version, 2);
        assert!(after.is_consistent());
    }

    #[tokio::test]
    async fn test_denial_leaves_state_unchanged() {
        let services = services().await;
        services
            .engine
            .transition(&request("permit-1", "SUBMIT", applicant()))
            .await
            .unwrap();

        let err = services
            .engine
            .transition(&request("permit-1", "APPROVE", applicant()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ROLE_NOT_PERMITTED");
        assert!(!err.is_retryable());

        let graph = services.definitions.get_process(TENANT, "permit-approval").await.unwrap();
        let instance = services.tracker.get_instance(TENANT, "permit-1", graph.id()).await.unwrap();
        assert_eq!(graph.process().state_code(&instance.current_state_id), "SUBMITTED");
        assert_eq!(instance.version, 1);
    }

    #[tokio::test]
    async fn test_new_version_keeps_running_instance() {
        let services = services().await;
        let v1 = services.definitions.get_process(TENANT, "permit-approval").await.unwrap();
        services
            .engine
            .transition(&request("permit-1", "SUBMIT", applicant()))
            .await
            .unwrap();

        let v2 = services
            .definitions
            .register_process(permit_approval().with_description("Revised"))
            .await
            .unwrap();

        let approved = services
            .engine
            .transition(&request("permit-1", "APPROVE", approver()))
            .await
            .unwrap();
        assert_eq!(approved.instance.process_id, v1.id());
        assert_eq!(approved.instance.version, 2);
        assert_eq!(v1.process().state_code(&approved.instance.current_state_id), "APPROVED");

        // Still one instance: a repeated SUBMIT must not restart the entity on v2
        let err = services
            .engine
            .transition(&request("permit-1", "SUBMIT", applicant()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ACTION_NOT_APPLICABLE");
        assert!(services
            .tracker
            .find_instance(TENANT, "permit-1", v2.id())
            .await
            .unwrap()
            .is_none());

        // Pinning the other version by id is refused
        let pinned = TransitionRequest::new(TENANT, "permit-1", ProcessRef::id(v2.id()), "SUBMIT", applicant());
        let err = services.engine.transition(&pinned).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_INSTANCE");

        let actions = services
            .engine
            .available_actions(TENANT, "permit-1", &ProcessRef::code("permit-approval"), &approver())
            .await
            .unwrap();
        assert!(actions.is_empty());

        // Entities entering after the new version start on it
        let fresh = services
            .engine
            .transition(&request("permit-2", "SUBMIT", applicant()))
            .await
            .unwrap();
        assert_eq!(fresh.instance.process_id, v2.id());
    }

    #[tokio::test]
    async fn test_denied_request_on_new_version_leaves_no_instance() {
        let services = services().await;
        services
            .engine
            .transition(&request("permit-1", "SUBMIT", applicant()))
            .await
            .unwrap();
        let v2 = services.definitions.register_process(permit_approval()).await.unwrap();

        let err = services
            .engine
            .transition(&request("permit-1", "APPROVE", applicant()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ROLE_NOT_PERMITTED");
        assert!(services
            .tracker
            .find_instance(TENANT, "permit-1", v2.id())
            .await
            .unwrap()
            .is_none());

        let err = services
            .tracker
            .create_instance(TENANT, v2.id(), "permit-1")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_INSTANCE");
    }

    #[tokio::test]
    async fn test_assignee_hand_off() {
        let services = WorkflowServices::in_memory(&WorkflowConfig::default());
        services
            .definitions
            .register_process(
                ProcessDefinition::new(TENANT, "inspection", "Inspection")
                    .with_state(StateDefinition::start("REQUESTED", "Requested"))
                    .with_state(StateDefinition::new("ASSIGNED", "Assigned"))
                    .with_state(StateDefinition::terminal("PASSED", "Passed"))
                    .with_action(ActionDefinition::new("ASSIGN", "REQUESTED", "ASSIGNED").with_role("DISPATCHER"))
                    .with_action(
                        ActionDefinition::new("PASS", "ASSIGNED", "PASSED")
                            .with_role("INSPECTOR")
                            .assignee_only(),
                    ),
            )
            .await
            .unwrap();
        let process = ProcessRef::code("inspection");

        let outcome = services
            .engine
            .transition(
                &TransitionRequest::new(TENANT, "site-9", process.clone(), "ASSIGN", Actor::new("dan").with_role("DISPATCHER"))
                    .with_assignee("ivy"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.instance.assignee.as_deref(), Some("ivy"));
        assert_eq!(outcome.entry.assignee.as_deref(), Some("ivy"));

        let err = services
            .engine
            .transition(&TransitionRequest::new(
                TENANT,
                "site-9",
                process.clone(),
                "PASS",
                Actor::new("jim").with_role("INSPECTOR"),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_ASSIGNEE");

        let outcome = services
            .engine
            .transition(&TransitionRequest::new(
                TENANT,
                "site-9",
                process,
                "PASS",
                Actor::new("ivy").with_role("INSPECTOR"),
            ))
            .await
            .unwrap();
        assert_eq!(outcome.instance.version, 2);
    }

    #[tokio::test]
    async fn test_attribute_checks_from_config() {
        let mut config = WorkflowConfig::default();
        config.guard.attribute_checks = vec!["jurisdiction".to_string()];
        let services = WorkflowServices::in_memory(&config);
        services
            .definitions
            .register_process(
                ProcessDefinition::new(TENANT, "zoning", "Zoning")
                    .with_state(StateDefinition::start("FILED", "Filed"))
                    .with_state(StateDefinition::terminal("RULED", "Ruled"))
                    .with_action(
                        ActionDefinition::new("RULE", "FILED", "RULED")
                            .with_role("BOARD")
                            .with_required_attribute("jurisdiction", ["downtown"]),
                    ),
            )
            .await
            .unwrap();

        let outsider = Actor::new("kim")
            .with_role("BOARD")
            .with_attribute("jurisdiction", ["harbor"]);
        let err = services
            .engine
            .transition(&TransitionRequest::new(TENANT, "lot-3", ProcessRef::code("zoning"), "RULE", outsider))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ATTRIBUTE_NOT_PERMITTED");

        let local = Actor::new("lee")
            .with_role("BOARD")
            .with_attribute("jurisdiction", ["downtown"]);
        let outcome = services
            .engine
            .transition(&TransitionRequest::new(TENANT, "lot-3", ProcessRef::code("zoning"), "RULE", local))
            .await
            .unwrap();
        assert_eq!(outcome.instance.version, 1);
    }

    #[tokio::test]
    async fn test_implicit_create_disabled() {
        let mut config = WorkflowConfig::default();
        config.engine.implicit_create = false;
        let services = WorkflowServices::in_memory(&config);
        services.definitions.register_process(permit_approval()).await.unwrap();

        let err = services
            .engine
            .transition(&request("permit-7", "SUBMIT", applicant()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        services
            .tracker
            .create_instance(TENANT, "permit-approval", "permit-7")
            .await
            .unwrap();
        services
            .engine
            .transition(&request("permit-7", "SUBMIT", applicant()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_process() {
        let services = services().await;
        let err = services
            .engine
            .transition(&TransitionRequest::new(TENANT, "x", ProcessRef::code("nope"), "SUBMIT", applicant()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_injected_guards() {
        let config = WorkflowConfig::default();

        let open = WorkflowServices::with_guard(
            Arc::new(InMemoryDefinitionRepository::new()),
            Arc::new(InMemoryInstanceRepository::new()),
            Arc::new(AllowAll),
            &config,
        );
        open.definitions.register_process(permit_approval()).await.unwrap();
        let outcome = open
            .engine
            .transition(&request("permit-1", "SUBMIT", Actor::new("anyone")))
            .await
            .unwrap();
        assert_eq!(outcome.instance.version, 1);

        let closed = WorkflowServices::with_guard(
            Arc::new(InMemoryDefinitionRepository::new()),
            Arc::new(InMemoryInstanceRepository::new()),
            Arc::new(DenyAll),
            &config,
        );
        closed.definitions.register_process(permit_approval()).await.unwrap();
        let err = closed
            .engine
            .transition(&request("permit-1", "SUBMIT", applicant()))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden { .. }));
    }
}

mod concurrency_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_one_winner() {
        let services = services().await;
        let graph = services.definitions.get_process(TENANT, "permit-approval").await.unwrap();
        let instance = services
            .tracker
            .create_instance(TENANT, graph.id(), "permit-race")
            .await
            .unwrap();
        let submitted = graph.process().state_by_code("SUBMITTED").unwrap().id.clone();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let tracker = services.tracker.clone();
                let id = instance.id.clone();
                let from = instance.current_state_id.clone();
                let to = submitted.clone();
                tokio::spawn(async move {
                    let entry = HistoryEntry::new(format!("actor-{}", i), from, to.clone(), "SUBMIT");
                    tracker.append_transition(&id, 0, &to, entry).await
                })
            })
            .collect();

        let results: Vec<_> = join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        for result in results.iter().filter_map(|r| r.as_ref().err()) {
            assert_eq!(result.code(), "CONFLICT");
        }

        let stored = services.tracker.get_instance_by_id(TENANT, &instance.id).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.history.len(), 1);
        assert!(stored.is_consistent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transitions_apply_once() {
        let services = services().await;
        services
            .engine
            .transition(&request("permit-9", "SUBMIT", applicant()))
            .await
            .unwrap();

        let handles: Vec<_> = (0..12)
            .map(|i| {
                let engine = services.engine.clone();
                let action = if i % 2 == 0 { "APPROVE" } else { "REJECT" };
                tokio::spawn(async move { engine.transition(&request("permit-9", action, approver())).await })
            })
            .collect();

        let results: Vec<_> = join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(matches!(err.code(), "CONFLICT" | "ACTION_NOT_APPLICABLE"));
        }

        let graph = services.definitions.get_process(TENANT, "permit-approval").await.unwrap();
        let instance = services.tracker.get_instance(TENANT, "permit-9", graph.id()).await.unwrap();
        assert_eq!(instance.version, 2);
        assert_eq!(instance.history.len(), 2);
        assert!(instance.is_consistent());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_implicit_create() {
        let services = services().await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = services.engine.clone();
                tokio::spawn(async move { engine.transition(&request("permit-new", "SUBMIT", applicant())).await })
            })
            .collect();

        let results: Vec<_> = join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);

        let graph = services.definitions.get_process(TENANT, "permit-approval").await.unwrap();
        let instance = services.tracker.get_instance(TENANT, "permit-new", graph.id()).await.unwrap();
        assert_eq!(instance.history.len(), 1);
    }

    async fn engine_over(repo: Arc<ConflictingInstanceRepository>, max_attempts: u32) -> (TransitionEngine, String) {
        let definitions = Arc::new(DefinitionStore::new(Arc::new(InMemoryDefinitionRepository::new())));
        let graph = definitions.register_process(permit_approval()).await.unwrap();
        let tracker = Arc::new(InstanceTracker::new(repo, definitions.clone()));
        let engine = TransitionEngine::new(definitions, tracker, Arc::new(RbacGuard::new()))
            .with_max_attempts(max_attempts);
        (engine, graph.id().to_string())
    }

    #[tokio::test]
    async fn test_conflicts_retried_within_bound() {
        let repo = Arc::new(ConflictingInstanceRepository::new(2));
        let (engine, _) = engine_over(repo.clone(), 3).await;

        let outcome = engine
            .transition(&request("permit-1", "SUBMIT", applicant()))
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.instance.version, 1);
        assert_eq!(repo.appends(), 3);
    }

    #[tokio::test]
    async fn test_conflict_surfaces_after_bound() {
        let repo = Arc::new(ConflictingInstanceRepository::new(10));
        let (engine, process_id) = engine_over(repo.clone(), 3).await;

        let err = engine
            .transition(&request("permit-1", "SUBMIT", applicant()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        assert!(err.is_retryable());
        assert_eq!(repo.appends(), 3);

        let instance = repo
            .find_by_entity(TENANT, &process_id, "permit-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instance.version, 0);
        assert!(instance.history.is_empty());
    }
}

mod escalation_tests {
    use super::*;

    fn complaint() -> ProcessDefinition {
        ProcessDefinition::new(TENANT, "complaint", "Complaint")
            .with_sla_minutes(24 * 60)
            .with_state(StateDefinition::start("RECEIVED", "Received").with_sla_minutes(60))
            .with_state(StateDefinition::new("SUPERVISOR", "Supervisor"))
            .with_state(StateDefinition::terminal("CLOSED", "Closed"))
            .with_action(ActionDefinition::new("ESCALATE", "RECEIVED", "SUPERVISOR").with_role("SYSTEM"))
            .with_action(ActionDefinition::new("CLOSE", "RECEIVED", "CLOSED").with_role("CLERK"))
            .with_action(ActionDefinition::new("CLOSE", "SUPERVISOR", "CLOSED").with_role("SUPERVISOR"))
            .with_escalation(
                EscalationRule::new("RECEIVED", "ESCALATE")
                    .with_state_sla(60)
                    .with_process_sla(120),
            )
    }

    #[tokio::test]
    async fn test_sweep_requires_every_sla_breached() {
        let repo = Arc::new(InMemoryInstanceRepository::new());
        let services = WorkflowServices::new(
            Arc::new(InMemoryDefinitionRepository::new()),
            repo.clone(),
            &WorkflowConfig::default(),
        );
        let graph = services.definitions.register_process(complaint()).await.unwrap();
        let received = graph.process().state_by_code("RECEIVED").unwrap().id.clone();
        let now = Utc::now();

        let mut both = ProcessInstance::new(TENANT, graph.id(), "complaint", "c-1", &received);
        both.state_entered_at = now - Duration::minutes(90);
        both.created_at = now - Duration::minutes(180);
        repo.insert(&both).await.unwrap();

        let mut state_only = ProcessInstance::new(TENANT, graph.id(), "complaint", "c-2", &received);
        state_only.state_entered_at = now - Duration::minutes(90);
        state_only.created_at = now - Duration::minutes(90);
        repo.insert(&state_only).await.unwrap();

        let system = Actor::new("system").with_role("SYSTEM");
        let result = services.escalation.escalate(TENANT, "complaint", &system).await.unwrap();
        assert_eq!(result.total_found, 1);
        assert_eq!(result.total_escalated, 1);
        assert_eq!(result.escalated_instances[0].entity_id, "c-1");

        let escalated = services
            .escalation
            .search_escalated(TENANT, "complaint", 50, 0)
            .await
            .unwrap();
        assert_eq!(escalated.len(), 1);
        let entry = escalated[0].last_entry().unwrap();
        assert!(entry.escalated);
        assert_eq!(entry.actor_id, "system");
        assert_eq!(graph.process().state_code(&escalated[0].current_state_id), "SUPERVISOR");

        let untouched = services.tracker.get_instance(TENANT, "c-2", graph.id()).await.unwrap();
        assert!(!untouched.escalated);
        assert_eq!(untouched.version, 0);
    }

    #[tokio::test]
    async fn test_manual_escalation_is_flagged() {
        let services = WorkflowServices::in_memory(&WorkflowConfig::default());
        services.definitions.register_process(complaint()).await.unwrap();

        let outcome = services
            .engine
            .transition(&TransitionRequest::new(
                TENANT,
                "c-9",
                ProcessRef::code("complaint"),
                "ESCALATE",
                Actor::new("ops").with_role("SYSTEM"),
            ))
            .await
            .unwrap();
        assert!(outcome.instance.escalated);
        assert!(outcome.entry.escalated);
    }
}
