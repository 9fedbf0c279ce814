//! Transition Guard
//!
//! Authorization decision for a proposed action. Guards are pure: they read the
//! compiled graph and the actor, never storage, so they can run outside any lock.
//!
//! - [`RbacGuard`] checks roles, the assignee requirement and configured attributes
//! - [`AllowAll`] / [`DenyAll`] are fixed decisions for wiring and tests

use serde::{Deserialize, Serialize};
use tracing::debug;

use wf_config::GuardConfig;

use crate::domain::{Actor, ProcessGraph};
use crate::error::{Result, WorkflowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    /// Actor holds none of the action's allowed roles
    RoleNotPermitted,
    /// Action requires the instance assignee
    NotAssignee,
    /// Actor lacks an accepted value for a checked attribute
    AttributeNotPermitted,
    /// No such action from the given state
    ActionNotApplicable,
}

impl DenyReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RoleNotPermitted => "ROLE_NOT_PERMITTED",
            Self::NotAssignee => "NOT_ASSIGNEE",
            Self::AttributeNotPermitted => "ATTRIBUTE_NOT_PERMITTED",
            Self::ActionNotApplicable => "ACTION_NOT_APPLICABLE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { reason: DenyReason, message: String },
}

impl Decision {
    pub fn deny(reason: DenyReason, message: impl Into<String>) -> Self {
        Self::Deny { reason, message: message.into() }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Allow => Ok(()),
            Self::Deny { reason, message } => Err(WorkflowError::forbidden(reason, message)),
        }
    }
}

/// Everything a guard may look at
#[derive(Debug, Clone, Copy)]
pub struct GuardContext<'a> {
    pub actor: &'a Actor,
    pub process: &'a ProcessGraph,
    pub from_state: &'a str,
    pub action: &'a str,
    /// Current assignee of the instance
    pub assignee: Option<&'a str>,
}

pub trait Guard: Send + Sync {
    fn authorize(&self, ctx: &GuardContext<'_>) -> Decision;
}

/// Role-based guard with optional attribute checks
#[derive(Debug, Clone, Default)]
pub struct RbacGuard {
    attribute_checks: Vec<String>,
}

impl RbacGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &GuardConfig) -> Self {
        Self::new().with_attribute_checks(config.attribute_checks.iter().cloned())
    }

    pub fn with_attribute_checks<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attribute_checks = names.into_iter().map(Into::into).collect();
        self
    }
}

impl Guard for RbacGuard {
    fn authorize(&self, ctx: &GuardContext<'_>) -> Decision {
        let action = match ctx.process.find_action(ctx.from_state, ctx.action) {
            Some(action) => action,
            None => {
                return Decision::deny(
                    DenyReason::ActionNotApplicable,
                    format!(
                        "action '{}' is not available from state '{}'",
                        ctx.action,
                        ctx.process.process().state_code(ctx.from_state)
                    ),
                );
            }
        };

        if !action.roles.is_empty() && !ctx.actor.has_any_role(&action.roles) {
            debug!(actor = %ctx.actor.id, action = %action.name, "Role check failed");
            let mut allowed: Vec<&str> = action.roles.iter().map(String::as_str).collect();
            allowed.sort_unstable();
            return Decision::deny(
                DenyReason::RoleNotPermitted,
                format!("action '{}' requires one of roles [{}]", action.name, allowed.join(", ")),
            );
        }

        if action.assignee_required && ctx.assignee != Some(ctx.actor.id.as_str()) {
            debug!(actor = %ctx.actor.id, action = %action.name, "Assignee check failed");
            return Decision::deny(
                DenyReason::NotAssignee,
                format!("action '{}' may only be performed by the assignee", action.name),
            );
        }

        for name in &self.attribute_checks {
            let required = match action.required_attributes.get(name) {
                Some(values) if !values.is_empty() => values,
                _ => continue,
            };
            let held = ctx.actor.attributes.get(name).map(Vec::as_slice).unwrap_or(&[]);
            let matched = held
                .iter()
                .any(|h| required.iter().any(|r| r.trim() == h.trim()));
            if !matched {
                debug!(actor = %ctx.actor.id, attribute = %name, "Attribute check failed");
                return Decision::deny(
                    DenyReason::AttributeNotPermitted,
                    format!("actor {} {:?} not in allowed {:?}", name, held, required),
                );
            }
        }

        Decision::Allow
    }
}

/// Permits everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Guard for AllowAll {
    fn authorize(&self, _ctx: &GuardContext<'_>) -> Decision {
        Decision::Allow
    }
}

/// Refuses everything with `ROLE_NOT_PERMITTED`
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Guard for DenyAll {
    fn authorize(&self, ctx: &GuardContext<'_>) -> Decision {
        Decision::deny(
            DenyReason::RoleNotPermitted,
            format!("actor {} may not perform any action", ctx.actor.id),
        )
    }
}
