//! Process Definition Entities
//!
//! A process is a tenant-scoped, versioned graph of states connected by named actions.
//! Registration input uses state codes; registered processes use generated ids.

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashSet};

/// How a caller names a process: by version id, or by code (latest version)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessRef {
    Id(String),
    Code(String),
}

impl ProcessRef {
    pub fn id(id: impl Into<String>) -> Self {
        Self::Id(id.into())
    }

    pub fn code(code: impl Into<String>) -> Self {
        Self::Code(code.into())
    }
}

impl std::fmt::Display for ProcessRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id:{}", id),
            Self::Code(code) => write!(f, "code:{}", code),
        }
    }
}

/// Registration request for a new process version
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDefinition {
    pub tenant_id: String,
    pub code: String,
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// SLA for the whole process, in minutes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_minutes: Option<u32>,

    #[serde(default)]
    pub states: Vec<StateDefinition>,

    #[serde(default)]
    pub actions: Vec<ActionDefinition>,

    #[serde(default)]
    pub escalations: Vec<EscalationRule>,
}

impl ProcessDefinition {
    pub fn new(
        tenant_id: impl Into<String>,
        code: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            code: code.into(),
            name: name.into(),
            description: None,
            sla_minutes: None,
            states: Vec::new(),
            actions: Vec::new(),
            escalations: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_sla_minutes(mut self, minutes: u32) -> Self {
        self.sla_minutes = Some(minutes);
        self
    }

    pub fn with_state(mut self, state: StateDefinition) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_action(mut self, action: ActionDefinition) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_escalation(mut self, rule: EscalationRule) -> Self {
        self.escalations.push(rule);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDefinition {
    pub code: String,
    pub name: String,

    #[serde(default)]
    pub is_start: bool,

    /// Declared terminal. Terminality is computed at registration; a declaration
    /// that contradicts the graph is rejected.
    #[serde(default)]
    pub is_terminal: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_minutes: Option<u32>,
}

impl StateDefinition {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            is_start: false,
            is_terminal: false,
            sla_minutes: None,
        }
    }

    pub fn start(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self { is_start: true, ..Self::new(code, name) }
    }

    pub fn terminal(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self { is_terminal: true, ..Self::new(code, name) }
    }

    pub fn with_sla_minutes(mut self, minutes: u32) -> Self {
        self.sla_minutes = Some(minutes);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Source state code
    pub from_state: String,

    /// Target state code
    pub to_state: String,

    #[serde(default)]
    pub roles: HashSet<String>,

    #[serde(default)]
    pub assignee_required: bool,

    /// Attribute name -> accepted values
    #[serde(default)]
    pub required_attributes: BTreeMap<String, Vec<String>>,
}

impl ActionDefinition {
    pub fn new(
        name: impl Into<String>,
        from_state: impl Into<String>,
        to_state: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            label: None,
            from_state: from_state.into(),
            to_state: to_state.into(),
            roles: HashSet::new(),
            assignee_required: false,
            required_attributes: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn assignee_only(mut self) -> Self {
        self.assignee_required = true;
        self
    }

    pub fn with_required_attribute<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_attributes
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }
}

/// Automatic escalation of instances that overstay a state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRule {
    /// State code the rule watches
    pub state: String,

    /// Action applied to breached instances; must leave `state`
    pub action: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_sla_minutes: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_sla_minutes: Option<u32>,
}

impl EscalationRule {
    pub fn new(state: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            action: action.into(),
            state_sla_minutes: None,
            process_sla_minutes: None,
        }
    }

    pub fn with_state_sla(mut self, minutes: u32) -> Self {
        self.state_sla_minutes = Some(minutes);
        self
    }

    pub fn with_process_sla(mut self, minutes: u32) -> Self {
        self.process_sla_minutes = Some(minutes);
        self
    }

    /// Copy with unset SLAs taken from the watched state and the process
    pub fn with_defaults(&self, state_sla: Option<u32>, process_sla: Option<u32>) -> Self {
        Self {
            state_sla_minutes: self.state_sla_minutes.or(state_sla),
            process_sla_minutes: self.process_sla_minutes.or(process_sla),
            ..self.clone()
        }
    }

    /// Whether an instance that entered its state at `state_entered_at` and was
    /// created at `created_at` is strictly past every SLA this rule sets.
    pub fn is_breached(
        &self,
        now: DateTime<Utc>,
        state_entered_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> bool {
        let past = |since: DateTime<Utc>, sla: Option<u32>| match sla {
            Some(m) if m > 0 => now - since > Duration::minutes(i64::from(m)),
            _ => true,
        };
        self.has_sla()
            && past(state_entered_at, self.state_sla_minutes)
            && past(created_at, self.process_sla_minutes)
    }

    pub fn has_sla(&self) -> bool {
        self.state_sla_minutes.map_or(false, |m| m > 0)
            || self.process_sla_minutes.map_or(false, |m| m > 0)
    }
}

/// A registered, immutable process version
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub id: String,
    pub tenant_id: String,
    pub code: String,
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Monotonic per (tenant, code), starting at 1
    pub version: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_minutes: Option<u32>,

    pub states: Vec<State>,
    pub actions: Vec<Action>,

    #[serde(default)]
    pub escalations: Vec<EscalationRule>,

    pub created_at: DateTime<Utc>,
}

impl Process {
    pub fn state(&self, id: &str) -> Option<&State> {
        self.states.iter().find(|s| s.id == id)
    }

    pub fn state_by_code(&self, code: &str) -> Option<&State> {
        self.states.iter().find(|s| s.code == code)
    }

    /// `rule` with SLAs it leaves unset filled from its state and the process
    pub fn effective_rule(&self, rule: &EscalationRule) -> EscalationRule {
        let state_sla = self.state_by_code(&rule.state).and_then(|s| s.sla_minutes);
        rule.with_defaults(state_sla, self.sla_minutes)
    }

    /// Look a state up by id, then by code
    pub fn resolve_state(&self, id_or_code: &str) -> Option<&State> {
        self.state(id_or_code).or_else(|| self.state_by_code(id_or_code))
    }

    pub fn start_state(&self) -> Option<&State> {
        self.states.iter().find(|s| s.is_start)
    }

    pub fn terminal_states(&self) -> impl Iterator<Item = &State> {
        self.states.iter().filter(|s| s.is_terminal)
    }

    /// Code of a state id, or the id itself when unknown
    pub fn state_code<'a>(&'a self, id: &'a str) -> &'a str {
        self.state(id).map(|s| s.code.as_str()).unwrap_or(id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub id: String,
    pub process_id: String,
    pub code: String,
    pub name: String,
    pub is_start: bool,
    pub is_terminal: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sla_minutes: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: String,
    pub process_id: String,
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Source state id
    pub from_state: String,

    /// Target state id
    pub to_state: String,

    /// Empty means any actor may perform the action
    #[serde(default)]
    pub roles: HashSet<String>,

    #[serde(default)]
    pub assignee_required: bool,

    #[serde(default)]
    pub required_attributes: BTreeMap<String, Vec<String>>,
}
