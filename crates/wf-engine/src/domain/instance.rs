//! Process Instance Entities
//!
//! Runtime binding of a business entity to a process version, with its
//! append-only transition history.

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

/// The caller performing a transition, as supplied by the identity source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,

    #[serde(default)]
    pub roles: HashSet<String>,

    /// Attribute name -> values held by the actor (e.g. jurisdiction)
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            roles: HashSet::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn with_attribute<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    /// True if any of the actor's roles appears in `allowed` (whitespace-insensitive)
    pub fn has_any_role(&self, allowed: &HashSet<String>) -> bool {
        self.roles
            .iter()
            .any(|r| allowed.iter().any(|a| a.trim() == r.trim()))
    }
}

/// One applied transition. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// 1-based; equals the instance version produced by this transition
    pub sequence: u64,
    pub actor_id: String,
    pub from_state: String,
    pub to_state: String,
    pub action_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Assignee handed the instance by this transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    #[serde(default)]
    pub escalated: bool,

    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(
        actor_id: impl Into<String>,
        from_state: impl Into<String>,
        to_state: impl Into<String>,
        action_name: impl Into<String>,
    ) -> Self {
        Self {
            sequence: 0,
            actor_id: actor_id.into(),
            from_state: from_state.into(),
            to_state: to_state.into(),
            action_name: action_name.into(),
            comment: None,
            assignee: None,
            escalated: false,
            timestamp: Utc::now(),
        }
    }

    pub fn with_comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment;
        self
    }

    pub fn with_assignee(mut self, assignee: Option<String>) -> Self {
        self.assignee = assignee;
        self
    }

    pub fn with_escalated(mut self, escalated: bool) -> Self {
        self.escalated = escalated;
        self
    }
}

/// Optional values applied when an instance is created
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSeed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInstance {
    pub id: String,
    pub tenant_id: String,
    pub process_id: String,
    pub process_code: String,

    /// The business object this instance tracks
    pub entity_id: String,

    pub current_state_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,

    /// Set once any escalation transition has been applied
    #[serde(default)]
    pub escalated: bool,

    /// Number of applied transitions
    pub version: u64,

    #[serde(default)]
    pub history: Vec<HistoryEntry>,

    pub state_entered_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessInstance {
    pub fn new(
        tenant_id: impl Into<String>,
        process_id: impl Into<String>,
        process_code: impl Into<String>,
        entity_id: impl Into<String>,
        start_state_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            process_id: process_id.into(),
            process_code: process_code.into(),
            entity_id: entity_id.into(),
            current_state_id: start_state_id.into(),
            assignee: None,
            attributes: BTreeMap::new(),
            escalated: false,
            version: 0,
            history: Vec::new(),
            state_entered_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_seed(mut self, seed: InstanceSeed) -> Self {
        self.assignee = seed.assignee;
        self.attributes = seed.attributes;
        self
    }

    /// Apply a transition in place: move state, bump version, append history.
    /// Returns the entry as stored.
    pub fn apply(&mut self, mut entry: HistoryEntry) -> HistoryEntry {
        self.version += 1;
        entry.sequence = self.version;
        self.current_state_id = entry.to_state.clone();
        if let Some(assignee) = &entry.assignee {
            self.assignee = Some(assignee.clone());
        }
        self.escalated |= entry.escalated;
        self.state_entered_at = entry.timestamp;
        self.updated_at = entry.timestamp;
        self.history.push(entry.clone());
        entry
    }

    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }

    /// History length matches version and the last entry ends in the current state
    pub fn is_consistent(&self) -> bool {
        if self.history.len() as u64 != self.version {
            return false;
        }
        match self.history.last() {
            Some(last) => last.to_state == self.current_state_id,
            None => true,
        }
    }
}
