//! Definition Store
//!
//! Validates process graphs at registration, assigns versions and ids, and serves
//! compiled [`ProcessGraph`]s. Registered versions are immutable, so compiled
//! graphs are cached by process id without invalidation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use wf_config::EngineConfig;

use crate::domain::{
    Action, Process, ProcessDefinition, ProcessGraph, ProcessRef, State,
};
use crate::error::{DefinitionErrorKind, Result, WorkflowError};
use crate::repository::DefinitionRepository;

const MAX_CODE_LEN: usize = 128;
const MAX_NAME_LEN: usize = 128;
const MAX_DESCRIPTION_LEN: usize = 512;
const MAX_STATE_CODE_LEN: usize = 64;
const MAX_ACTION_NAME_LEN: usize = 64;

/// Attempts to claim the next version when registrations of one code race
const MAX_REGISTER_ATTEMPTS: u32 = 3;

pub struct DefinitionStore {
    repo: Arc<dyn DefinitionRepository>,
    cache: DashMap<String, Arc<ProcessGraph>>,
    allow_unreachable_states: bool,
}

impl DefinitionStore {
    pub fn new(repo: Arc<dyn DefinitionRepository>) -> Self {
        Self {
            repo,
            cache: DashMap::new(),
            allow_unreachable_states: false,
        }
    }

    pub fn from_config(repo: Arc<dyn DefinitionRepository>, config: &EngineConfig) -> Self {
        Self::new(repo).with_unreachable_states(config.allow_unreachable_states)
    }

    pub fn with_unreachable_states(mut self, allow: bool) -> Self {
        self.allow_unreachable_states = allow;
        self
    }

    /// Validate and persist a definition as the next version of its code
    pub async fn register_process(&self, definition: ProcessDefinition) -> Result<Arc<ProcessGraph>> {
        validate_definition(&definition)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let latest = self
                .repo
                .find_latest_by_code(&definition.tenant_id, &definition.code)
                .await?
                .map(|p| p.version)
                .unwrap_or(0);

            let process = build_process(&definition, latest + 1, self.allow_unreachable_states)?;

            match self.repo.insert(&process).await {
                Ok(()) => {
                    info!(
                        tenant_id = %process.tenant_id,
                        code = %process.code,
                        version = process.version,
                        process_id = %process.id,
                        states = process.states.len(),
                        actions = process.actions.len(),
                        "Process registered"
                    );
                    let graph = Arc::new(ProcessGraph::new(process));
                    self.cache.insert(graph.id().to_string(), graph.clone());
                    return Ok(graph);
                }
                Err(WorkflowError::Duplicate { .. }) if attempt < MAX_REGISTER_ATTEMPTS => {
                    debug!(code = %definition.code, attempt, "Version taken by concurrent registration");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resolve by id first, then by code (latest version)
    pub async fn get_process(&self, tenant_id: &str, id_or_code: &str) -> Result<Arc<ProcessGraph>> {
        if let Some(graph) = self.find_by_id(tenant_id, id_or_code).await? {
            return Ok(graph);
        }
        self.get_latest(tenant_id, id_or_code).await
    }

    pub async fn resolve(&self, tenant_id: &str, process: &ProcessRef) -> Result<Arc<ProcessGraph>> {
        match process {
            ProcessRef::Id(id) => self.get_by_id(tenant_id, id).await,
            ProcessRef::Code(code) => self.get_latest(tenant_id, code).await,
        }
    }

    pub async fn get_by_id(&self, tenant_id: &str, id: &str) -> Result<Arc<ProcessGraph>> {
        self.find_by_id(tenant_id, id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Process", id))
    }

    pub async fn get_latest(&self, tenant_id: &str, code: &str) -> Result<Arc<ProcessGraph>> {
        let process = self
            .repo
            .find_latest_by_code(tenant_id, code)
            .await?
            .ok_or_else(|| WorkflowError::not_found("Process", code))?;
        Ok(self.cached(process))
    }

    /// Latest version of every process in the tenant
    pub async fn list_processes(&self, tenant_id: &str) -> Result<Vec<Process>> {
        self.repo.list_latest(tenant_id).await
    }

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Arc<ProcessGraph>>> {
        if let Some(graph) = self.cache.get(id) {
            if graph.process().tenant_id == tenant_id {
                return Ok(Some(graph.value().clone()));
            }
            return Ok(None);
        }

        Ok(self
            .repo
            .find_by_id(tenant_id, id)
            .await?
            .map(|process| self.cached(process)))
    }

    fn cached(&self, process: Process) -> Arc<ProcessGraph> {
        self.cache
            .entry(process.id.clone())
            .or_insert_with(|| Arc::new(ProcessGraph::new(process)))
            .value()
            .clone()
    }
}

fn check_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.trim().is_empty() {
        return Err(WorkflowError::validation(format!("{} is required", field)));
    }
    if value.chars().count() > max {
        return Err(WorkflowError::validation(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(())
}

/// Request-shape checks, before any graph validation
pub fn validate_definition(definition: &ProcessDefinition) -> Result<()> {
    if definition.tenant_id.trim().is_empty() {
        return Err(WorkflowError::validation("tenantId is required"));
    }
    check_len("code", &definition.code, MAX_CODE_LEN)?;
    check_len("name", &definition.name, MAX_NAME_LEN)?;
    if let Some(description) = &definition.description {
        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(WorkflowError::validation(format!(
                "description must be at most {} characters",
                MAX_DESCRIPTION_LEN
            )));
        }
    }
    if definition.states.is_empty() {
        return Err(WorkflowError::validation("at least one state is required"));
    }
    for state in &definition.states {
        check_len("state code", &state.code, MAX_STATE_CODE_LEN)?;
        check_len("state name", &state.name, MAX_NAME_LEN)?;
    }
    for action in &definition.actions {
        check_len("action name", &action.name, MAX_ACTION_NAME_LEN)?;
    }
    Ok(())
}

/// Validate the graph of `definition` and materialize it as `version` with fresh ids.
pub fn build_process(
    definition: &ProcessDefinition,
    version: u32,
    allow_unreachable_states: bool,
) -> Result<Process> {
    use DefinitionErrorKind::*;

    let mut state_ids: HashMap<&str, String> = HashMap::new();
    for state in &definition.states {
        if state_ids.insert(state.code.as_str(), Uuid::new_v4().to_string()).is_some() {
            return Err(WorkflowError::definition(
                DuplicateState,
                format!("state '{}' is declared more than once", state.code),
            ));
        }
    }

    let starts: Vec<&str> = definition
        .states
        .iter()
        .filter(|s| s.is_start)
        .map(|s| s.code.as_str())
        .collect();
    match starts.len() {
        0 => {
            return Err(WorkflowError::definition(NoStartState, "no state is marked as start"));
        }
        1 => {}
        _ => {
            return Err(WorkflowError::definition(
                MultipleStartStates,
                format!("multiple start states: {}", starts.join(", ")),
            ));
        }
    }

    let mut outgoing: HashSet<&str> = HashSet::new();
    let mut incoming: HashSet<&str> = HashSet::new();
    let mut seen_actions: HashSet<(&str, &str)> = HashSet::new();

    for action in &definition.actions {
        for endpoint in [&action.from_state, &action.to_state] {
            if !state_ids.contains_key(endpoint.as_str()) {
                return Err(WorkflowError::definition(
                    DanglingAction,
                    format!("action '{}' references unknown state '{}'", action.name, endpoint),
                ));
            }
        }
        if !seen_actions.insert((action.from_state.as_str(), action.name.as_str())) {
            return Err(WorkflowError::definition(
                DuplicateAction,
                format!("action '{}' is declared twice from state '{}'", action.name, action.from_state),
            ));
        }
        outgoing.insert(action.from_state.as_str());
        incoming.insert(action.to_state.as_str());
    }

    for state in &definition.states {
        if state.is_terminal && outgoing.contains(state.code.as_str()) {
            return Err(WorkflowError::definition(
                TerminalHasOutgoing,
                format!("terminal state '{}' has outgoing actions", state.code),
            ));
        }
        if !state.is_start && !incoming.contains(state.code.as_str()) {
            if !allow_unreachable_states {
                return Err(WorkflowError::definition(
                    UnreachableState,
                    format!("state '{}' has no incoming action", state.code),
                ));
            }
            warn!(
                code = %definition.code,
                state = %state.code,
                "Registering process with unreachable state"
            );
        }
    }

    for rule in &definition.escalations {
        if !state_ids.contains_key(rule.state.as_str()) {
            return Err(WorkflowError::definition(
                InvalidEscalation,
                format!("escalation references unknown state '{}'", rule.state),
            ));
        }
        if !seen_actions.contains(&(rule.state.as_str(), rule.action.as_str())) {
            return Err(WorkflowError::definition(
                InvalidEscalation,
                format!("action '{}' does not leave state '{}'", rule.action, rule.state),
            ));
        }
        let state_sla = definition
            .states
            .iter()
            .find(|s| s.code == rule.state)
            .and_then(|s| s.sla_minutes);
        if !rule.with_defaults(state_sla, definition.sla_minutes).has_sla() {
            return Err(WorkflowError::definition(
                InvalidEscalation,
                format!("escalation for state '{}' has no SLA from rule, state or process", rule.state),
            ));
        }
    }

    let process_id = Uuid::new_v4().to_string();
    let id_of = |code: &str| state_ids.get(code).cloned().unwrap_or_default();

    let states = definition
        .states
        .iter()
        .map(|s| State {
            id: id_of(&s.code),
            process_id: process_id.clone(),
            code: s.code.clone(),
            name: s.name.clone(),
            is_start: s.is_start,
            is_terminal: !outgoing.contains(s.code.as_str()),
            sla_minutes: s.sla_minutes,
        })
        .collect();

    let actions = definition
        .actions
        .iter()
        .map(|a| Action {
            id: Uuid::new_v4().to_string(),
            process_id: process_id.clone(),
            name: a.name.clone(),
            label: a.label.clone(),
            from_state: id_of(&a.from_state),
            to_state: id_of(&a.to_state),
            roles: a.roles.iter().map(|r| r.trim().to_string()).collect(),
            assignee_required: a.assignee_required,
            required_attributes: a.required_attributes.clone(),
        })
        .collect();

    Ok(Process {
        id: process_id,
        tenant_id: definition.tenant_id.clone(),
        code: definition.code.clone(),
        name: definition.name.clone(),
        description: definition.description.clone(),
        version,
        sla_minutes: definition.sla_minutes,
        states,
        actions,
        escalations: definition.escalations.clone(),
        created_at: Utc::now(),
    })
}
