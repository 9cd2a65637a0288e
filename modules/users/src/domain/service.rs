use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use appkit::{Event, EventBus, EventPayload};

use crate::config::PlanConfig;
use crate::contract::{User, UserCreated, UserDeleted, UsersDirectory};
use crate::domain::error::DomainError;

pub const SOURCE: &str = "users";

/// Input for [`UsersService::create`].
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub display_name: String,
    pub plan: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub name: String,
    pub max_projects: i64,
}

/// User accounts over the shared SQL pool. Publishes lifecycle events on the bus.
#[derive(Clone)]
pub struct UsersService {
    pool: AnyPool,
    events: Arc<EventBus>,
    default_plan: String,
}

impl UsersService {
    pub fn new(pool: AnyPool, events: Arc<EventBus>, default_plan: impl Into<String>) -> Self {
        Self {
            pool,
            events,
            default_plan: default_plan.into(),
        }
    }

    /// Inserts missing plans; existing rows are left untouched.
    #[instrument(name = "users.service.seed_plans", skip_all, fields(plans = plans.len()))]
    pub async fn seed_plans(&self, plans: &[PlanConfig]) -> Result<usize, DomainError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for plan in plans {
            let result = sqlx::query(
                "INSERT INTO plans (name, max_projects) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
            )
            .bind(&plan.name)
            .bind(plan.max_projects)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        debug!(inserted, "Plans seeded");
        Ok(inserted)
    }

    pub async fn plans(&self) -> Result<Vec<Plan>, DomainError> {
        let rows = sqlx::query("SELECT name, max_projects FROM plans ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<Plan, DomainError> {
                Ok(Plan {
                    name: row.try_get("name")?,
                    max_projects: row.try_get("max_projects")?,
                })
            })
            .collect()
    }

    #[instrument(name = "users.service.list", skip(self))]
    pub async fn list(&self, limit: u32) -> Result<Vec<User>, DomainError> {
        let rows = sqlx::query(
            "SELECT id, email, display_name, plan, created_at FROM users \
             ORDER BY created_at, email LIMIT $1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| user_from_row(row).map_err(DomainError::from))
            .collect()
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<User>, DomainError> {
        let row = sqlx::query(
            "SELECT id, email, display_name, plan, created_at FROM users WHERE id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    pub async fn count_users(&self) -> Result<u64, DomainError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM users")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    #[instrument(name = "users.service.create", skip(self, new), fields(email = %new.email))]
    pub async fn create(&self, new: NewUser) -> Result<User, DomainError> {
        let email = new.email.trim().to_ascii_lowercase();
        if !is_valid_email(&email) {
            return Err(DomainError::InvalidEmail { email });
        }
        let display_name = new.display_name.trim().to_string();
        if display_name.is_empty() {
            return Err(DomainError::EmptyDisplayName);
        }
        let plan = new.plan.unwrap_or_else(|| self.default_plan.clone());

        let mut tx = self.pool.begin().await?;
        let known_plan = sqlx::query("SELECT name FROM plans WHERE name = $1")
            .bind(&plan)
            .fetch_optional(&mut *tx)
            .await?;
        if known_plan.is_none() {
            return Err(DomainError::UnknownPlan { plan });
        }
        let taken = sqlx::query("SELECT id FROM users WHERE email = $1")
            .bind(&email)
            .fetch_optional(&mut *tx)
            .await?;
        if taken.is_some() {
            return Err(DomainError::EmailTaken { email });
        }

        let user = User {
            id: Uuid::new_v4(),
            email,
            display_name,
            plan,
            created_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO users (id, email, display_name, plan, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(user.id.to_string())
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(&user.plan)
        .bind(user.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(user_id = %user.id, plan = %user.plan, "User created");
        self.emit(UserCreated { user: user.clone() });
        Ok(user)
    }

    #[instrument(name = "users.service.delete", skip(self))]
    pub async fn delete(&self, id: Uuid, deleted_by: &str) -> Result<User, DomainError> {
        let user = self.get(id).await?.ok_or(DomainError::NotFound { id })?;
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            // raced with another delete
            return Err(DomainError::NotFound { id });
        }

        info!(user_id = %id, "User deleted");
        self.emit(UserDeleted {
            id,
            email: user.email.clone(),
            deleted_by: deleted_by.to_string(),
        });
        Ok(user)
    }

    /// Fire-and-forget. A rejected event is logged; the write stands.
    fn emit<P: EventPayload>(&self, payload: P) {
        if let Err(e) = self
            .events
            .publish_async(Event::new(payload).with_source(SOURCE))
        {
            warn!(event_type = P::EVENT_TYPE, error = %e, "Failed to publish event");
        }
    }
}

#[async_trait]
impl UsersDirectory for UsersService {
    async fn find(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        Ok(self.get(id).await?)
    }

    async fn count(&self) -> anyhow::Result<u64> {
        Ok(self.count_users().await?)
    }
}

fn user_from_row(row: &AnyRow) -> Result<User, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(User {
        id: Uuid::parse_str(&id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        plan: row.try_get("plan")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?
            .with_timezone(&Utc),
    })
}

fn is_valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}
