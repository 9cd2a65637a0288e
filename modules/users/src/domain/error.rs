use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid email address: {email}")]
    InvalidEmail { email: String },

    #[error("display name must not be empty")]
    EmptyDisplayName,

    #[error("email already registered: {email}")]
    EmailTaken { email: String },

    #[error("unknown plan: {plan}")]
    UnknownPlan { plan: String },

    #[error("user not found: {id}")]
    NotFound { id: Uuid },

    #[error("storage error")]
    Storage(#[from] sqlx::Error),
}
