//! Repository Layer
//!
//! Storage contracts for process definitions and instances. The in-memory
//! implementation is always available; SQL and MongoDB backends sit behind the
//! `sqlite`, `postgres` and `mongo` features.

use async_trait::async_trait;

use crate::domain::{HistoryEntry, Process, ProcessInstance};
use crate::error::Result;

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "mongo")]
pub mod mongo;

pub use memory::{InMemoryDefinitionRepository, InMemoryInstanceRepository};

#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    /// Persist a new process version. Fails with `Duplicate` if the
    /// `(tenant, code, version)` triple is taken.
    async fn insert(&self, process: &Process) -> Result<()>;

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<Process>>;

    async fn find_latest_by_code(&self, tenant_id: &str, code: &str) -> Result<Option<Process>>;

    /// Latest version of every process code in the tenant, ordered by code
    async fn list_latest(&self, tenant_id: &str) -> Result<Vec<Process>>;
}

#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Fails with `DuplicateInstance` if the entity already has an instance of the
    /// process code, whichever version it runs on
    async fn insert(&self, instance: &ProcessInstance) -> Result<()>;

    async fn find_by_id(&self, tenant_id: &str, id: &str) -> Result<Option<ProcessInstance>>;

    async fn find_by_entity(
        &self,
        tenant_id: &str,
        process_id: &str,
        entity_id: &str,
    ) -> Result<Option<ProcessInstance>>;

    /// The entity's instance of any version of `process_code`
    async fn find_by_process_code(
        &self,
        tenant_id: &str,
        process_code: &str,
        entity_id: &str,
    ) -> Result<Option<ProcessInstance>>;

    /// Conditional write. Succeeds only while the stored version equals
    /// `expected_version`; then sets the state, increments the version and appends
    /// the entry as one atomic unit. A stale version yields `Conflict` and changes nothing.
    ///
    /// Returns the instance exactly as this write left it, never a later version.
    async fn append_transition(
        &self,
        instance_id: &str,
        expected_version: u64,
        new_state: &str,
        entry: HistoryEntry,
    ) -> Result<ProcessInstance>;

    async fn find_in_state(
        &self,
        tenant_id: &str,
        process_id: &str,
        state_id: &str,
    ) -> Result<Vec<ProcessInstance>>;

    /// Escalated instances, most recently updated first
    async fn find_escalated(
        &self,
        tenant_id: &str,
        process_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ProcessInstance>>;
}
