//! Error taxonomy for the billing engine.

use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Immutable state violation: {0}")]
    ImmutableStateViolation(String),

    #[error("Concurrency conflict: {entity} {id} was modified by another writer")]
    ConcurrencyConflict { entity: &'static str, id: Uuid },

    #[error("Database error: {0}")]
    Database(anyhow::Error),
}

impl BillingError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        BillingError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        BillingError::Validation(msg.into())
    }

    pub fn immutable(msg: impl Into<String>) -> Self {
        BillingError::ImmutableStateViolation(msg.into())
    }

    pub fn conflict(entity: &'static str, id: Uuid) -> Self {
        BillingError::ConcurrencyConflict { entity, id }
    }

    /// Only stale-version writes are worth retrying after a re-fetch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::ConcurrencyConflict { .. })
    }

    /// Short stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::NotFound { .. } => "not_found",
            BillingError::Validation(_) => "validation",
            BillingError::ImmutableStateViolation(_) => "immutable_state",
            BillingError::ConcurrencyConflict { .. } => "concurrency_conflict",
            BillingError::Database(_) => "database",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(anyhow::Error::new(err))
    }
}

impl From<validator::ValidationErrors> for BillingError {
    fn from(err: validator::ValidationErrors) -> Self {
        BillingError::Validation(err.to_string())
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotFound { .. } => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            BillingError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            BillingError::ImmutableStateViolation(_) | BillingError::ConcurrencyConflict { .. } => {
                AppError::Conflict(anyhow::anyhow!(err.to_string()))
            }
            BillingError::Database(e) => AppError::DatabaseError(e),
        }
    }
}
