//! Public contract of the users module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use appkit::EventPayload;

/// Service registry name of the [`UsersDirectory`] capability.
pub const USERS_DIRECTORY: &str = "users.directory";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub plan: String,
    pub created_at: DateTime<Utc>,
}

/// Published after a user row is committed.
#[derive(Debug, Clone)]
pub struct UserCreated {
    pub user: User,
}

impl EventPayload for UserCreated {
    const EVENT_TYPE: &'static str = "user.created";
}

/// Published after a user row is deleted.
#[derive(Debug, Clone)]
pub struct UserDeleted {
    pub id: Uuid,
    pub email: String,
    /// Subject of the principal that issued the delete.
    pub deleted_by: String,
}

impl EventPayload for UserDeleted {
    const EVENT_TYPE: &'static str = "user.deleted";
}

/// Read-only lookups for other modules.
#[async_trait]
pub trait UsersDirectory: Send + Sync {
    async fn find(&self, id: Uuid) -> anyhow::Result<Option<User>>;

    async fn count(&self) -> anyhow::Result<u64>;
}
