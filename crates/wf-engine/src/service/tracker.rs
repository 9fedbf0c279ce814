//! Instance Tracker
//!
//! Owns instance creation and the conditional write every transition goes through.

use std::sync::Arc;

use tracing::info;

use crate::domain::{HistoryEntry, InstanceSeed, ProcessGraph, ProcessInstance};
use crate::error::{DefinitionErrorKind, Result, WorkflowError};
use crate::repository::InstanceRepository;
use crate::service::definition::DefinitionStore;

const MAX_SEARCH_LIMIT: u32 = 1000;

pub struct InstanceTracker {
    repo: Arc<dyn InstanceRepository>,
    definitions: Arc<DefinitionStore>,
}

impl InstanceTracker {
    pub fn new(repo: Arc<dyn InstanceRepository>, definitions: Arc<DefinitionStore>) -> Self {
        Self { repo, definitions }
    }

    /// Start `entity_id` in the process at its start state
    pub async fn create_instance(
        &self,
        tenant_id: &str,
        process_id: &str,
        entity_id: &str,
    ) -> Result<ProcessInstance> {
        self.create_instance_with(tenant_id, process_id, entity_id, InstanceSeed::default())
            .await
    }

    pub async fn create_instance_with(
        &self,
        tenant_id: &str,
        process_id: &str,
        entity_id: &str,
        seed: InstanceSeed,
    ) -> Result<ProcessInstance> {
        let graph = self.definitions.get_process(tenant_id, process_id).await?;
        self.create_in(&graph, entity_id, seed).await
    }

    /// Create against an already resolved process version
    pub async fn create_in(
        &self,
        graph: &ProcessGraph,
        entity_id: &str,
        seed: InstanceSeed,
    ) -> Result<ProcessInstance> {
        if entity_id.trim().is_empty() {
            return Err(WorkflowError::validation("entityId is required"));
        }

        let process = graph.process();
        let start = process.start_state().ok_or_else(|| {
            WorkflowError::definition(
                DefinitionErrorKind::NoStartState,
                format!("process {} has no start state", process.code),
            )
        })?;

        let instance = ProcessInstance::new(
            &process.tenant_id,
            &process.id,
            &process.code,
            entity_id,
            &start.id,
        )
        .with_seed(seed);

        self.repo.insert(&instance).await?;

        info!(
            tenant_id = %instance.tenant_id,
            process = %instance.process_code,
            entity_id = %instance.entity_id,
            instance_id = %instance.id,
            state = %start.code,
            "Process instance created"
        );
        Ok(instance)
    }

    pub async fn get_instance(
        &self,
        tenant_id: &str,
        entity_id: &str,
        process_id: &str,
    ) -> Result<ProcessInstance> {
        self.find_instance(tenant_id, entity_id, process_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("ProcessInstance", format!("{}/{}", process_id, entity_id)))
    }

    pub async fn find_instance(
        &self,
        tenant_id: &str,
        entity_id: &str,
        process_id: &str,
    ) -> Result<Option<ProcessInstance>> {
        self.repo.find_by_entity(tenant_id, process_id, entity_id).await
    }

    /// The entity's instance of any version of `process_code`
    pub async fn find_instance_by_code(
        &self,
        tenant_id: &str,
        process_code: &str,
        entity_id: &str,
    ) -> Result<Option<ProcessInstance>> {
        self.repo
            .find_by_process_code(tenant_id, process_code, entity_id)
            .await
    }

    pub async fn get_instance_by_id(&self, tenant_id: &str, instance_id: &str) -> Result<ProcessInstance> {
        self.repo
            .find_by_id(tenant_id, instance_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found("ProcessInstance", instance_id))
    }

    /// Compare-and-swap on the instance version. See [`InstanceRepository::append_transition`].
    pub async fn append_transition(
        &self,
        instance_id: &str,
        expected_version: u64,
        new_state: &str,
        entry: HistoryEntry,
    ) -> Result<ProcessInstance> {
        self.repo
            .append_transition(instance_id, expected_version, new_state, entry)
            .await
    }

    pub async fn find_in_state(
        &self,
        tenant_id: &str,
        process_id: &str,
        state_id: &str,
    ) -> Result<Vec<ProcessInstance>> {
        self.repo.find_in_state(tenant_id, process_id, state_id).await
    }

    pub async fn search_escalated(
        &self,
        tenant_id: &str,
        process_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ProcessInstance>> {
        if limit == 0 || limit > MAX_SEARCH_LIMIT {
            return Err(WorkflowError::validation(format!(
                "limit must be between 1 and {}",
                MAX_SEARCH_LIMIT
            )));
        }
        self.repo.find_escalated(tenant_id, process_id, limit, offset).await
    }

    pub async fn history(&self, tenant_id: &str, instance_id: &str) -> Result<Vec<HistoryEntry>> {
        Ok(self.get_instance_by_id(tenant_id, instance_id).await?.history)
    }
}
