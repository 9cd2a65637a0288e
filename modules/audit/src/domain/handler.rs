use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use appkit::{Event, EventHandler, EventPayload};
use users::{UserCreated, UserDeleted, UsersDirectory};

use super::trail::{AuditEntry, AuditTrail};

/// Records user lifecycle events into the trail.
pub struct UserEventsAuditor {
    trail: Arc<AuditTrail>,
    directory: Option<Arc<dyn UsersDirectory>>,
}

impl UserEventsAuditor {
    pub fn new(trail: Arc<AuditTrail>, directory: Option<Arc<dyn UsersDirectory>>) -> Self {
        Self { trail, directory }
    }

    async fn users_total(&self) -> Option<u64> {
        let directory = self.directory.as_ref()?;
        match directory.count().await {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "Users directory lookup failed, recording without it");
                None
            }
        }
    }
}

#[async_trait]
impl EventHandler for UserEventsAuditor {
    fn name(&self) -> &str {
        "audit.user_events"
    }

    fn event_types(&self) -> &[&'static str] {
        &[UserCreated::EVENT_TYPE, UserDeleted::EVENT_TYPE]
    }

    async fn handle(&self, _cancel: &CancellationToken, event: &Event) -> anyhow::Result<()> {
        let (subject, summary, actor) = match event.event_type() {
            UserCreated::EVENT_TYPE => {
                let p = event.payload::<UserCreated>()?;
                (
                    p.user.id,
                    format!("user {} created on plan {}", p.user.email, p.user.plan),
                    None,
                )
            }
            UserDeleted::EVENT_TYPE => {
                let p = event.payload::<UserDeleted>()?;
                (
                    p.id,
                    format!("user {} deleted", p.email),
                    Some(p.deleted_by.clone()),
                )
            }
            other => anyhow::bail!("unexpected event type '{other}'"),
        };

        let entry = AuditEntry {
            event_id: event.id(),
            event_type: event.event_type().to_string(),
            source: event.source().map(str::to_string),
            subject,
            summary,
            actor,
            users_total: self.users_total().await,
            occurred_at: event.occurred_at(),
            recorded_at: Utc::now(),
        };
        debug!(event_id = %entry.event_id, event_type = %entry.event_type, "Audit entry recorded");
        self.trail.record(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use users::User;
    use uuid::Uuid;

    struct FixedDirectory(u64);

    #[async_trait]
    impl UsersDirectory for FixedDirectory {
        async fn find(&self, _id: Uuid) -> anyhow::Result<Option<User>> {
            Ok(None)
        }

        async fn count(&self) -> anyhow::Result<u64> {
            Ok(self.0)
        }
    }

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "ada@example.com".to_string(),
            display_name: "Ada".to_string(),
            plan: "pro".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn records_created_with_directory_enrichment() {
        let trail = Arc::new(AuditTrail::new(10));
        let auditor = UserEventsAuditor::new(trail.clone(), Some(Arc::new(FixedDirectory(7))));
        let user = user();

        auditor
            .handle(
                &CancellationToken::new(),
                &Event::new(UserCreated { user: user.clone() }).with_source("users"),
            )
            .await
            .unwrap();

        let entry = &trail.recent(1)[0];
        assert_eq!(entry.subject, user.id);
        assert_eq!(entry.summary, "user ada@example.com created on plan pro");
        assert_eq!(entry.users_total, Some(7));
        assert_eq!(entry.source.as_deref(), Some("users"));
    }

    #[tokio::test]
    async fn records_deleted_without_directory() {
        let trail = Arc::new(AuditTrail::new(10));
        let auditor = UserEventsAuditor::new(trail.clone(), None);
        let id = Uuid::new_v4();

        auditor
            .handle(
                &CancellationToken::new(),
                &Event::new(UserDeleted {
                    id,
                    email: "ada@example.com".to_string(),
                    deleted_by: "admin".to_string(),
                }),
            )
            .await
            .unwrap();

        let entry = &trail.recent(1)[0];
        assert_eq!(entry.actor.as_deref(), Some("admin"));
        assert_eq!(entry.users_total, None);
    }
}
