//! Workflow Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::service::guard::DenyReason;

/// Why a process definition was rejected at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DefinitionErrorKind {
    NoStartState,
    MultipleStartStates,
    DuplicateState,
    DuplicateAction,
    DanglingAction,
    TerminalHasOutgoing,
    UnreachableState,
    InvalidEscalation,
}

impl DefinitionErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoStartState => "NO_START_STATE",
            Self::MultipleStartStates => "MULTIPLE_START_STATES",
            Self::DuplicateState => "DUPLICATE_STATE",
            Self::DuplicateAction => "DUPLICATE_ACTION",
            Self::DanglingAction => "DANGLING_ACTION",
            Self::TerminalHasOutgoing => "TERMINAL_HAS_OUTGOING",
            Self::UnreachableState => "UNREACHABLE_STATE",
            Self::InvalidEscalation => "INVALID_ESCALATION",
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Invalid process definition ({}): {message}", .kind.code())]
    Definition { kind: DefinitionErrorKind, message: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Forbidden ({}): {message}", .reason.code())]
    Forbidden { reason: DenyReason, message: String },

    #[error("Action '{action}' is not applicable in state '{state}'")]
    ActionNotApplicable { state: String, action: String },

    #[error("Concurrent modification of instance {instance_id} (expected version {expected_version})")]
    Conflict { instance_id: String, expected_version: u64 },

    #[error("Instance already exists for entity {entity_id} in process {process_id} (tenant {tenant_id})")]
    DuplicateInstance { tenant_id: String, process_id: String, entity_id: String },

    #[error("Duplicate entity: {entity_type} with {field}={value}")]
    Duplicate { entity_type: String, field: String, value: String },

    #[error("Current state mismatch: expected {expected}, found {actual}")]
    StateMismatch { expected: String, actual: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("Database error: {0}")]
    Sql(#[from] sqlx::Error),

    #[cfg(feature = "mongo")]
    #[error("Database error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[cfg(feature = "mongo")]
    #[error("Serialization error: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl WorkflowError {
    pub fn definition(kind: DefinitionErrorKind, message: impl Into<String>) -> Self {
        Self::Definition { kind, message: message.into() }
    }

    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn forbidden(reason: DenyReason, message: impl Into<String>) -> Self {
        Self::Forbidden { reason, message: message.into() }
    }

    pub fn not_applicable(state: impl Into<String>, action: impl Into<String>) -> Self {
        Self::ActionNotApplicable {
            state: state.into(),
            action: action.into(),
        }
    }

    pub fn conflict(instance_id: impl Into<String>, expected_version: u64) -> Self {
        Self::Conflict {
            instance_id: instance_id.into(),
            expected_version,
        }
    }

    pub fn duplicate_instance(
        tenant_id: impl Into<String>,
        process_id: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self::DuplicateInstance {
            tenant_id: tenant_id.into(),
            process_id: process_id.into(),
            entity_id: entity_id.into(),
        }
    }

    pub fn duplicate(entity_type: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Duplicate {
            entity_type: entity_type.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Definition { kind, .. } => kind.code(),
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Forbidden { reason, .. } => reason.code(),
            Self::ActionNotApplicable { .. } => "ACTION_NOT_APPLICABLE",
            Self::Conflict { .. } => "CONFLICT",
            Self::DuplicateInstance { .. } => "DUPLICATE_INSTANCE",
            Self::Duplicate { .. } => "DUPLICATE",
            Self::StateMismatch { .. } => "STATE_MISMATCH",
            Self::Validation { .. } => "VALIDATION_ERROR",
            #[cfg(any(feature = "sqlite", feature = "postgres"))]
            Self::Sql(_) => "DATABASE_ERROR",
            #[cfg(feature = "mongo")]
            Self::Mongo(_) => "DATABASE_ERROR",
            #[cfg(feature = "mongo")]
            Self::Bson(_) => "SERIALIZATION_ERROR",
            Self::Json(_) => "SERIALIZATION_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Only version conflicts are retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
