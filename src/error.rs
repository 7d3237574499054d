// Error types shared by the store, the session cache and the task engine

use thiserror::Error;

use crate::models::TaskStatus;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // Credential or login failure. Terminal for the task.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    // Transient search/reserve failure. Retried on the next cycle.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Selected train {train_no} not found in search results")]
    NoMatch { train_no: String },

    #[error("No seat available on train {train_no}")]
    SeatUnavailable { train_no: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("{entity} with id {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Validation error: {0}")]
    Validation(String),

    // Anything a provider reports that fits none of the above
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    // Whether this error ends the task (FAILED) instead of scheduling a retry.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Error::ProviderUnavailable(_) | Error::NoMatch { .. } | Error::SeatUnavailable { .. }
        )
    }
}
