use crate::store::StoreError;
use idempotency_guard::IdempotencyError;
use thiserror::Error;
use tracing::error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found")]
    NotFound,

    /// Carries the driver text for logs; clients only ever see [`AppError::public_message`].
    #[error("database error: {0}")]
    Database(String),

    #[error("internal server error")]
    Internal,
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotParticipant { .. } => AppError::NotFound,
            StoreError::Database(msg) => {
                error!(error = %msg, "Conversation store failure");
                AppError::Database(msg)
            }
            StoreError::Serialization(msg) => {
                error!(error = %msg, "Conversation store serialization failure");
                AppError::Internal
            }
        }
    }
}

impl From<IdempotencyError> for AppError {
    fn from(e: IdempotencyError) -> Self {
        match e {
            IdempotencyError::InvalidKey(msg) => AppError::BadRequest(msg),
            other => {
                error!(error = %other, "Idempotency guard failure");
                AppError::Internal
            }
        }
    }
}

impl AppError {
    /// Returns whether this error is retryable (e.g., database connection timeout)
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Database(msg) => {
                msg.contains("PoolTimedOut") || msg.contains("PoolClosed") || msg.contains("Io")
            }
            AppError::Internal => true,
            _ => false,
        }
    }

    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::Unauthorized => 401,
            AppError::NotFound => 404,
            AppError::Conflict(_) => 409,
            AppError::Database(_) | AppError::Internal => 500,
            AppError::Config(_) | AppError::StartServer(_) => 500,
        }
    }

    /// Canonical error code reported to clients.
    pub fn code(&self) -> &'static str {
        match self.status_code() {
            400 => "INVALID_ARGUMENT",
            401 => "UNAUTHENTICATED",
            404 => "NOT_FOUND",
            409 => "CONFLICT",
            _ => "INTERNAL",
        }
    }

    /// Message safe to return to a client.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Config(_) | AppError::StartServer(_) => {
                AppError::Internal.to_string()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_status_codes_and_canonical_names() {
        let cases = [
            (AppError::BadRequest("x".into()), 400, "INVALID_ARGUMENT"),
            (AppError::Unauthorized, 401, "UNAUTHENTICATED"),
            (AppError::Conflict("dup".into()), 409, "CONFLICT"),
            (AppError::NotFound, 404, "NOT_FOUND"),
            (AppError::Database("boom".into()), 500, "INTERNAL"),
            (AppError::Internal, 500, "INTERNAL"),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status_code(), status, "{err:?}");
            assert_eq!(err.code(), code, "{err:?}");
        }
    }

    #[test]
    fn test_database_details_are_not_public() {
        let err = AppError::Database("relation \"messages\" does not exist".into());
        assert_eq!(err.public_message(), "internal server error");
    }

    #[test]
    fn test_store_error_mapping() {
        let not_participant = StoreError::NotParticipant {
            conversation_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        };
        assert!(matches!(AppError::from(not_participant), AppError::NotFound));
        assert!(matches!(
            AppError::from(StoreError::Database("PoolTimedOut".into())),
            AppError::Database(_)
        ));
        assert!(AppError::from(StoreError::Database("PoolTimedOut".into())).is_retryable());
    }

    #[test]
    fn test_idempotency_error_mapping() {
        let invalid = IdempotencyError::InvalidKey("too long".into());
        assert_eq!(AppError::from(invalid).status_code(), 400);

        let other = IdempotencyError::Other(anyhow::anyhow!("redis unavailable"));
        assert!(matches!(AppError::from(other), AppError::Internal));
    }
}
