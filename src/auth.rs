//! Caller identity supplied by the platform's identity layer.
//!
//! The upstream gateway authenticates the user and forwards `x-learner-id`,
//! `x-tenant-id` and `x-role`. This module only reads them and answers the
//! tenant/role questions each operation asks.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScormError;

pub const LEARNER_HEADER: &str = "x-learner-id";
pub const TENANT_HEADER: &str = "x-tenant-id";
pub const ROLE_HEADER: &str = "x-role";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Learner,
    Instructor,
    Admin,
    /// Platform operator, allowed across tenants.
    Operator,
}

impl Role {
    fn parse(v: &str) -> Option<Role> {
        match v.trim().to_ascii_lowercase().as_str() {
            "learner" | "student" => Some(Role::Learner),
            "instructor" | "trainer" => Some(Role::Instructor),
            "admin" => Some(Role::Admin),
            "operator" | "superadmin" => Some(Role::Operator),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub learner_id: String,
    pub tenant_id: Uuid,
    pub role: Role,
}

impl Caller {
    pub fn new(learner_id: impl Into<String>, tenant_id: Uuid, role: Role) -> Self {
        Self {
            learner_id: learner_id.into(),
            tenant_id,
            role,
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ScormError> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let learner_id = get(LEARNER_HEADER).ok_or(ScormError::AccessDenied)?;
        let tenant_id = get(TENANT_HEADER)
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or(ScormError::AccessDenied)?;
        let role = match get(ROLE_HEADER) {
            Some(v) => Role::parse(v).ok_or(ScormError::AccessDenied)?,
            None => Role::Learner,
        };
        Ok(Self::new(learner_id, tenant_id, role))
    }

    pub fn is_operator(&self) -> bool {
        self.role == Role::Operator
    }

    /// Instructors, admins, and operators may author and inspect packages.
    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Instructor | Role::Admin | Role::Operator)
    }

    pub fn require_tenant(&self, tenant_id: Uuid) -> Result<(), ScormError> {
        if self.tenant_id == tenant_id || self.is_operator() {
            return Ok(());
        }
        tracing::warn!(
            learner_id = %self.learner_id,
            caller_tenant = %self.tenant_id,
            resource_tenant = %tenant_id,
            "cross-tenant access denied"
        );
        Err(ScormError::AccessDenied)
    }

    pub fn require_staff(&self) -> Result<(), ScormError> {
        if self.is_staff() {
            return Ok(());
        }
        tracing::warn!(learner_id = %self.learner_id, role = ?self.role, "staff role required");
        Err(ScormError::AccessDenied)
    }

    /// Learners may only read their own records; staff may read anyone's.
    pub fn require_self_or_staff(&self, learner_id: &str) -> Result<(), ScormError> {
        if self.learner_id == learner_id {
            return Ok(());
        }
        self.require_staff()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ScormError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Caller::from_headers(&parts.headers)
    }
}
