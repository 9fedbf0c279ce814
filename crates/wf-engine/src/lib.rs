//! Workflow Engine
//!
//! Tenant-scoped state machines over business entities: versioned process
//! definitions, a pluggable authorization guard, instance tracking with an
//! optimistic version check, and SLA-driven escalation.
//!
//! Storage backends:
//! - in-memory (always available)
//! - `sqlite` / `postgres` via sqlx
//! - `mongo` via the MongoDB driver

pub mod domain;
pub mod error;
pub mod repository;
pub mod scheduler;
pub mod service;

#[cfg(test)]
mod fixtures;

use std::sync::Arc;

use wf_config::WorkflowConfig;

pub use domain::*;
pub use error::{DefinitionErrorKind, Result, WorkflowError};
pub use repository::{DefinitionRepository, InstanceRepository};
pub use scheduler::{EscalationScheduler, EscalationSchedulerConfig};
pub use service::{
    AllowAll, Decision, DefinitionStore, DenyAll, DenyReason, EscalationService, Guard, GuardContext,
    InstanceTracker, RbacGuard, TransitionEngine, TransitionOutcome, TransitionRequest,
};

/// The services of one engine, wired over a pair of repositories
#[derive(Clone)]
pub struct WorkflowServices {
    pub definitions: Arc<DefinitionStore>,
    pub tracker: Arc<InstanceTracker>,
    pub engine: Arc<TransitionEngine>,
    pub escalation: Arc<EscalationService>,
}

impl WorkflowServices {
    /// Wire with the role-based guard configured by `config.guard`
    pub fn new(
        definitions: Arc<dyn DefinitionRepository>,
        instances: Arc<dyn InstanceRepository>,
        config: &WorkflowConfig,
    ) -> Self {
        let guard = Arc::new(RbacGuard::from_config(&config.guard));
        Self::with_guard(definitions, instances, guard, config)
    }

    pub fn with_guard(
        definitions: Arc<dyn DefinitionRepository>,
        instances: Arc<dyn InstanceRepository>,
        guard: Arc<dyn Guard>,
        config: &WorkflowConfig,
    ) -> Self {
        let definitions = Arc::new(DefinitionStore::from_config(definitions, &config.engine));
        let tracker = Arc::new(InstanceTracker::new(instances, definitions.clone()));
        let engine = Arc::new(TransitionEngine::from_config(
            definitions.clone(),
            tracker.clone(),
            guard,
            &config.engine,
        ));
        let escalation = Arc::new(EscalationService::new(
            definitions.clone(),
            tracker.clone(),
            engine.clone(),
        ));

        Self {
            definitions,
            tracker,
            engine,
            escalation,
        }
    }

    pub fn in_memory(config: &WorkflowConfig) -> Self {
        Self::new(
            Arc::new(repository::InMemoryDefinitionRepository::new()),
            Arc::new(repository::InMemoryInstanceRepository::new()),
            config,
        )
    }
}
