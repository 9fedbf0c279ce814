//! Compiled Process Graph
//!
//! Data-driven dispatch for transitions: every action of a process is indexed by
//! `(process_id, state_id, action_name)`, and each state keeps its outgoing actions.

use std::collections::HashMap;

use super::{Action, Process};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionKey {
    pub process_id: String,
    pub state_id: String,
    pub action_name: String,
}

impl ActionKey {
    pub fn new(
        process_id: impl Into<String>,
        state_id: impl Into<String>,
        action_name: impl Into<String>,
    ) -> Self {
        Self {
            process_id: process_id.into(),
            state_id: state_id.into(),
            action_name: action_name.into(),
        }
    }
}

/// A registered process with its action lookup table
#[derive(Debug, Clone)]
pub struct ProcessGraph {
    process: Process,
    table: HashMap<ActionKey, usize>,
    outgoing: HashMap<String, Vec<usize>>,
}

impl ProcessGraph {
    pub fn new(process: Process) -> Self {
        let mut table = HashMap::with_capacity(process.actions.len());
        let mut outgoing: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, action) in process.actions.iter().enumerate() {
            table.insert(
                ActionKey::new(&process.id, &action.from_state, &action.name),
                idx,
            );
            outgoing.entry(action.from_state.clone()).or_default().push(idx);
        }

        Self { process, table, outgoing }
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn id(&self) -> &str {
        &self.process.id
    }

    pub fn lookup(&self, key: &ActionKey) -> Option<&Action> {
        self.table.get(key).map(|&idx| &self.process.actions[idx])
    }

    /// The action named `action_name` leaving `state_id`, if any
    pub fn find_action(&self, state_id: &str, action_name: &str) -> Option<&Action> {
        self.lookup(&ActionKey::new(&self.process.id, state_id, action_name))
    }

    pub fn outgoing(&self, state_id: &str) -> impl Iterator<Item = &Action> {
        self.outgoing
            .get(state_id)
            .into_iter()
            .flatten()
            .map(|&idx| &self.process.actions[idx])
    }

    pub fn next_action_names(&self, state_id: &str) -> Vec<String> {
        self.outgoing(state_id).map(|a| a.name.clone()).collect()
    }

    pub fn is_terminal(&self, state_id: &str) -> bool {
        self.outgoing(state_id).next().is_none()
    }
}

impl From<Process> for ProcessGraph {
    fn from(process: Process) -> Self {
        Self::new(process)
    }
}
