//! Workflow Services
//!
//! Definition store, guard, instance tracker, transition engine and escalation,
//! each built over the repository traits.

pub mod definition;
pub mod escalation;
pub mod guard;
pub mod tracker;
pub mod transition;

pub use definition::{build_process, validate_definition, DefinitionStore};
pub use escalation::EscalationService;
pub use guard::{AllowAll, Decision, DenyAll, DenyReason, Guard, GuardContext, RbacGuard};
pub use tracker::InstanceTracker;
pub use transition::{is_escalation, TransitionEngine, TransitionOutcome, TransitionRequest};
