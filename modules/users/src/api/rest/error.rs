use appkit::Problem;

use crate::domain::error::DomainError;

/// Convert domain errors to HTTP Problem responses
pub fn domain_error_to_problem(err: DomainError) -> Problem {
    match err {
        DomainError::InvalidEmail { email } => {
            Problem::new(400, "Invalid Email", format!("Invalid email address: {email}"))
        }
        DomainError::EmptyDisplayName => Problem::bad_request("Display name must not be empty"),
        DomainError::EmailTaken { email } => {
            Problem::conflict(format!("Email already registered: {email}"))
        }
        DomainError::UnknownPlan { plan } => {
            Problem::new(422, "Unknown Plan", format!("Unknown plan: {plan}"))
        }
        DomainError::NotFound { id } => Problem::not_found(format!("User not found: {id}")),
        DomainError::Storage(e) => {
            tracing::error!(error = %e, "Users storage failure");
            Problem::internal("Internal storage error")
        }
    }
}

impl From<DomainError> for Problem {
    fn from(e: DomainError) -> Self {
        domain_error_to_problem(e)
    }
}
