// Shared data types and small helpers used across crates.
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("unknown entity kind: {0}")]
    UnknownEntityKind(String),
}

pub mod ids {
    // Strongly typed IDs to avoid mixing tenant, user and entity namespaces
    // at compile time.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            pub struct $name(Uuid);

            impl $name {
                // Generate a new random ID for this namespace.
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                // Wrap an existing UUID when decoding from storage.
                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                // Expose the underlying UUID for interoperability.
                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    // Preserve the original input for clearer error messages.
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    id_type!(TenantId);
    id_type!(UserId);
    id_type!(EntityId);
}

/// Kinds of tenant-scoped rows the access layer knows about.
///
/// The tenant itself is the `Organization`; everything else resolves to one
/// organization ancestor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Organization,
    Project,
    Task,
    Attachment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Organization => "organization",
            EntityKind::Project => "project",
            EntityKind::Task => "task",
            EntityKind::Attachment => "attachment",
        }
    }
}

impl std::str::FromStr for EntityKind {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        match input {
            "organization" => Ok(EntityKind::Organization),
            "project" => Ok(EntityKind::Project),
            "task" => Ok(EntityKind::Task),
            "attachment" => Ok(EntityKind::Attachment),
            other => Err(Error::UnknownEntityKind(other.to_string())),
        }
    }
}

/// Context entities a membership can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Organization,
    Project,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Organization => "organization",
            ContextKind::Project => "project",
        }
    }
}

/// Membership role, ordered by privilege so thresholds compare directly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
}

/// System-wide account role; `Admin` is the superuser escape hatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    User,
    Admin,
}

/// A user's relationship to a context entity.
///
/// At most one membership exists per (context_id, user_id) pair; the stores
/// enforce this as an upsert. `tenant_id` is the resolved tenant ancestor of
/// the context entity, so predicates never re-derive it per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: ids::UserId,
    pub context_id: ids::EntityId,
    pub context_kind: ContextKind,
    pub tenant_id: ids::TenantId,
    pub role: Role,
    pub archived: bool,
    pub muted: bool,
}

impl Membership {
    pub fn new(
        user_id: ids::UserId,
        context_id: ids::EntityId,
        context_kind: ContextKind,
        tenant_id: ids::TenantId,
        role: Role,
    ) -> Self {
        Self {
            user_id,
            context_id,
            context_kind,
            tenant_id,
            role,
            archived: false,
            muted: false,
        }
    }

    // An archived membership confers nothing.
    pub fn is_active(&self) -> bool {
        !self.archived
    }
}

/// Minimal authenticated account shape handed in by the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: ids::UserId,
    pub role: UserRole,
}

impl UserAccount {
    pub fn is_system_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

/// Reference to a tenant-scoped entity without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: ids::EntityId,
    pub kind: EntityKind,
    pub tenant_id: ids::TenantId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineLimits {
    pub log_capacity: usize,
    pub client_queue_capacity: usize,
    pub dispatch_batch_size: usize,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        // Defaults are conservative for local/dev usage.
        Self {
            log_capacity: 4096,
            client_queue_capacity: 1024,
            dispatch_batch_size: 64,
        }
    }
}
