//! In-Memory Repositories
//!
//! Process-local storage backed by `DashMap`. Instance compare-and-swap runs
//! under the shard lock of the instance entry.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{DefinitionRepository, InstanceRepository};
use crate::domain::{HistoryEntry, Process, ProcessInstance};
use crate::error::{Result, WorkflowError};

type CodeKey = (String, String);
type EntityKey = (String, String, String);

#[derive(Default)]
pub struct InMemoryDefinitionRepository {
    processes: DashMap<String, Process>,
    /// (tenant, code) -> version -> process id
    versions: RwLock<HashMap<CodeKey, BTreeMap<u32, String>>>,
}

impl InMemoryDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionRepository for InMemoryDefinitionRepository {
    async fn insert(&self, process: &Process) -> Result<()> {
        let mut versions = self.versions.write();
        let by_version = versions
            .entry((process.tenant_id.clone(), process.code.clone()))
            .or_default();

        if by_version.contains_key(&process.version) {
            return Err(WorkflowError::duplicate(
                "Process",
                "version",
                format!("{}@{}", process.code, process.version),
            ));
        }

        self.processes.insert(process.id.clone(), process.clone());
        by_version.insert(process.version, process.id.clone());
        Ok(())
    }

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Process>> {
        Ok(self
            .processes
            .get(id)
            .filter(|p| p.tenant_id == tenant_id)
            .map(|p| p.value().clone()))
    }

    async fn find_latest_by_code(&self, tenant_id: &str, code: &str) -> Result<Option<Process>> {
        let latest_id = {
            let versions = self.versions.read();
            versions
                .get(&(tenant_id.to_string(), code.to_string()))
                .and_then(|by_version| by_version.values().next_back().cloned())
        };

        Ok(latest_id.and_then(|id| self.processes.get(&id).map(|p| p.value().clone())))
    }

    async fn list_latest(&self, tenant_id: &str) -> Result<Vec<Process>> {
        let ids: BTreeMap<String, String> = {
            let versions = self.versions.read();
            versions
                .iter()
                .filter(|((tenant, _), _)| tenant == tenant_id)
                .filter_map(|((_, code), by_version)| {
                    by_version.values().next_back().map(|id| (code.clone(), id.clone()))
                })
                .collect()
        };

        Ok(ids
            .values()
            .filter_map(|id| self.processes.get(id).map(|p| p.value().clone()))
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryInstanceRepository {
    instances: DashMap<String, ProcessInstance>,
    /// (tenant, process id, entity) -> instance id
    entities: DashMap<EntityKey, String>,
    /// (tenant, process code, entity) -> instance id; the uniqueness key
    codes: DashMap<EntityKey, String>,
}

impl InMemoryInstanceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn insert(&self, instance: &ProcessInstance) -> Result<()> {
        let key = (
            instance.tenant_id.clone(),
            instance.process_code.clone(),
            instance.entity_id.clone(),
        );

        match self.codes.entry(key) {
            Entry::Occupied(_) => Err(WorkflowError::duplicate_instance(
                &instance.tenant_id,
                &instance.process_id,
                &instance.entity_id,
            )),
            Entry::Vacant(slot) => {
                self.instances.insert(instance.id.clone(), instance.clone());
                self.entities.insert(
                    (
                        instance.tenant_id.clone(),
                        instance.process_id.clone(),
                        instance.entity_id.clone(),
                    ),
                    instance.id.clone(),
                );
                slot.insert(instance.id.clone());
                Ok(())
            }
        }
    }

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<ProcessInstance>> {
        Ok(self
            .instances
            .get(id)
            .filter(|i| i.tenant_id == tenant_id)
            .map(|i| i.value().clone()))
    }

    async fn find_by_entity(
        &self,
        tenant_id: &str,
        process_id: &str,
        entity_id: &str,
    ) -> Result<Option<ProcessInstance>> {
        let key = (tenant_id.to_string(), process_id.to_string(), entity_id.to_string());
        let id = match self.entities.get(&key) {
            Some(id) => id.value().clone(),
            None => return Ok(None),
        };
        Ok(self.instances.get(&id).map(|i| i.value().clone()))
    }

    async fn find_by_process_code(
        &self,
        tenant_id: &str,
        process_code: &str,
        entity_id: &str,
    ) -> Result<Option<ProcessInstance>> {
        let key = (tenant_id.to_string(), process_code.to_string(), entity_id.to_string());
        let id = match self.codes.get(&key) {
            Some(id) => id.value().clone(),
            None => return Ok(None),
        };
        Ok(self.instances.get(&id).map(|i| i.value().clone()))
    }

    async fn append_transition(
        &self,
        instance_id: &str,
        expected_version: u64,
        new_state: &str,
        mut entry: HistoryEntry,
    ) -> Result<ProcessInstance> {
        let mut instance = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| WorkflowError::not_found("ProcessInstance", instance_id))?;

        if instance.version != expected_version {
            return Err(WorkflowError::conflict(instance_id, expected_version));
        }

        entry.to_state = new_state.to_string();
        instance.apply(entry);
        Ok(instance.value().clone())
    }

    async fn find_in_state(
        &self,
        tenant_id: &str,
        process_id: &str,
        state_id: &str,
    ) -> Result<Vec<ProcessInstance>> {
        let mut found: Vec<ProcessInstance> = self
            .instances
            .iter()
            .filter(|i| {
                i.tenant_id == tenant_id
                    && i.process_id == process_id
                    && i.current_state_id == state_id
            })
            .map(|i| i.value().clone())
            .collect();
        found.sort_by_key(|i| i.state_entered_at);
        Ok(found)
    }

    async fn find_escalated(
        &self,
        tenant_id: &str,
        process_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ProcessInstance>> {
        let mut found: Vec<ProcessInstance> = self
            .instances
            .iter()
            .filter(|i| i.tenant_id == tenant_id && i.process_id == process_id && i.escalated)
            .map(|i| i.value().clone())
            .collect();
        found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(found
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}
