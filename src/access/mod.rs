//! # Access Guard
//!
//! Checks callers resolved by the identity collaborator against the
//! project a request targets.
//!
//! ## Rules
//! - A project outside the caller's accessible set is a hard deny,
//!   logged at ERROR
//! - Roles are ordered `viewer` < `editor` < `owner`
//! - There is no bypass role; every platform request is checked

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{TablesmithError, TablesmithResult};
use crate::observability::{log_event, Event, MetricsRegistry};

/// What a caller may do inside its projects
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Read tables and records
    Viewer,
    /// Write records and author schemas
    Editor,
    /// Everything, including project deletion
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
            Role::Owner => "owner",
        }
    }
}

/// Operation classes checked by the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    WriteRecords,
    AuthorSchema,
    /// Register or delete a project
    ManageProject,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::WriteRecords => "write_records",
            Action::AuthorSchema => "author_schema",
            Action::ManageProject => "manage_project",
        }
    }

    /// Lowest role allowed to perform the action
    pub fn required_role(&self) -> Role {
        match self {
            Action::Read => Role::Viewer,
            Action::WriteRecords | Action::AuthorSchema => Role::Editor,
            Action::ManageProject => Role::Owner,
        }
    }
}

/// A resolved caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub user_id: String,
    /// Projects the caller may touch
    pub project_ids: BTreeSet<String>,
    pub role: Role,
}

impl CallerIdentity {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            project_ids: BTreeSet::new(),
            role,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_ids.insert(project_id.into());
        self
    }

    pub fn can_access(&self, project_id: &str) -> bool {
        self.project_ids.contains(project_id)
    }
}

/// Identity/organization collaborator
pub trait IdentityProvider: Send + Sync {
    /// Resolves an opaque caller token
    fn resolve(&self, token: &str) -> TablesmithResult<CallerIdentity>;
}

/// Fixed token table, for tests and the CLI
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider {
    identities: HashMap<String, CallerIdentity>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: CallerIdentity) -> Self {
        self.identities.insert(token.into(), identity);
        self
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn resolve(&self, token: &str) -> TablesmithResult<CallerIdentity> {
        self.identities
            .get(token)
            .cloned()
            .ok_or_else(|| TablesmithError::permission_denied("caller token is not recognized"))
    }
}

/// Applies the access rules and records denials
#[derive(Debug, Clone)]
pub struct AccessGuard {
    metrics: Arc<MetricsRegistry>,
}

impl AccessGuard {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self { metrics }
    }

    /// Checks project membership first, then role
    pub fn authorize(&self, caller: &CallerIdentity, project_id: &str, action: Action) -> TablesmithResult<()> {
        if !caller.can_access(project_id) {
            self.metrics.increment_isolation_violations();
            log_event(
                Event::TenantIsolationViolation,
                &[
                    ("user_id", caller.user_id.as_str()),
                    ("project_id", project_id),
                    ("action", action.as_str()),
                ],
            );
            return Err(TablesmithError::isolation_violation(project_id));
        }

        let required = action.required_role();
        if caller.role < required {
            log_event(
                Event::PermissionDenied,
                &[
                    ("user_id", caller.user_id.as_str()),
                    ("project_id", project_id),
                    ("action", action.as_str()),
                    ("role", caller.role.as_str()),
                ],
            );
            return Err(TablesmithError::permission_denied(format!(
                "{} requires the {} role",
                action.as_str(),
                required.as_str()
            )));
        }
        Ok(())
    }
}
