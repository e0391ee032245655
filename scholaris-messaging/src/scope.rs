use uuid::Uuid;

use scholaris_shared::errors::{AppError, AppResult};
use scholaris_shared::types::auth::{AuthUser, Role};

/// Tenant-scoped handle passed to every store operation.
///
/// Only constructible from a verified caller, so a store call can never be
/// made without naming the tenant it runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantScope {
    tenant_id: Uuid,
    identity_id: Uuid,
    role: Role,
}

impl TenantScope {
    pub fn for_caller(caller: &AuthUser) -> Self {
        Self {
            tenant_id: caller.tenant_id,
            identity_id: caller.id,
            role: caller.role,
        }
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn identity_id(&self) -> Uuid {
        self.identity_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Fails with a logged `ScopeViolation` when `tenant_id` is not ours.
    pub fn ensure_tenant(&self, tenant_id: Uuid, resource: &str) -> AppResult<()> {
        if tenant_id == self.tenant_id {
            return Ok(());
        }
        tracing::error!(
            scope_tenant = %self.tenant_id,
            resource_tenant = %tenant_id,
            identity = %self.identity_id,
            resource = resource,
            "cross-tenant access attempt"
        );
        Err(AppError::scope_violation(format!("{resource} belongs to another tenant")))
    }
}

impl From<&AuthUser> for TenantScope {
    fn from(caller: &AuthUser) -> Self {
        Self::for_caller(caller)
    }
}
