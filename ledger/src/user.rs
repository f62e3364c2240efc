//! User rows.
//!
//! Users own accounts. Credentials are stored as an opaque hash produced by
//! the credential layer; nothing here hashes or verifies passwords.

use bank_common::{BankError, Result, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// User role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular account holder.
    #[default]
    Customer,
    /// Bank staff.
    Banker,
}

impl Role {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Banker => "banker",
        }
    }

    /// Parse the storage representation.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "customer" => Ok(Role::Customer),
            "banker" => Ok(Role::Banker),
            other => Err(BankError::InvalidArgument {
                field: "role",
                reason: format!("unknown role {other:?}"),
            }),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bank user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    pub role: Role,
    pub password_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Parameters for inserting a user row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUserParams {
    pub username: String,
    pub hashed_password: String,
    pub full_name: String,
    pub email: String,
    pub role: Role,
}

/// Partial update: only `Some` fields change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateUserParams {
    pub id: UserId,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub hashed_password: Option<String>,
    pub password_changed_at: Option<DateTime<Utc>>,
}

impl UpdateUserParams {
    /// Start an update that changes nothing.
    pub fn for_user(id: UserId) -> Self {
        Self {
            id,
            username: None,
            full_name: None,
            email: None,
            hashed_password: None,
            password_changed_at: None,
        }
    }
}
