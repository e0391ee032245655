use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Developer,
    SchoolAdmin,
    Teacher,
    Parent,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Developer => "developer",
            Role::SchoolAdmin => "school_admin",
            Role::Teacher => "teacher",
            Role::Parent => "parent",
            Role::Student => "student",
        }
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        match capability {
            Capability::CreateGroup => matches!(self, Role::SchoolAdmin | Role::Developer),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "developer" => Ok(Role::Developer),
            "school_admin" => Ok(Role::SchoolAdmin),
            "teacher" => Ok(Role::Teacher),
            "parent" => Ok(Role::Parent),
            "student" => Ok(Role::Student),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

/// Actions gated on the caller's role rather than on conversation membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    CreateGroup,
}

/// JWT claims issued by the school platform's auth service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub tenant_id: Uuid,
    pub iat: i64,
    pub exp: i64,
    pub jti: Uuid,
}

impl Claims {
    pub fn new(user_id: Uuid, role: Role, tenant_id: Uuid, duration_secs: i64) -> Self {
        let now = Utc::now().timestamp();
        Self {
            sub: user_id,
            role,
            tenant_id,
            iat: now,
            exp: now + duration_secs,
            jti: Uuid::now_v7(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// A verified caller: identity, role and tenant, as established by the
/// credential verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: Uuid,
    pub role: Role,
    pub tenant_id: Uuid,
    pub token_id: Uuid,
}

impl AuthUser {
    pub fn can(&self, capability: Capability) -> bool {
        self.role.has_capability(capability)
    }
}

impl From<Claims> for AuthUser {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.sub,
            role: claims.role,
            tenant_id: claims.tenant_id,
            token_id: claims.jti,
        }
    }
}
