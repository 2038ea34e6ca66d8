//! Error taxonomy shared by every engine operation.

use uuid::Uuid;

pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
pub const RANGE_ERROR: &str = "RANGE_ERROR";
pub const CONFLICT: &str = "CONFLICT";
pub const NOT_FOUND: &str = "NOT_FOUND";
pub const FORBIDDEN: &str = "FORBIDDEN";
pub const RECORD_FROZEN: &str = "RECORD_FROZEN";
pub const WINDOW_CLOSED: &str = "WINDOW_CLOSED";
pub const STORE_ERROR: &str = "STORE_ERROR";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed input such as bad date ordering.
    #[error("{0}")]
    Validation(String),

    /// A raw score outside its component's scale.
    #[error("{0}")]
    Range(String),

    /// Overlapping window or duplicate assignment.
    #[error("{0}")]
    Conflict(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// Wrong evaluator or insufficient role.
    #[error("{0}")]
    Authorization(String),

    /// Attempted mutation of a published record.
    #[error("evaluation record {0} is published and can no longer be changed")]
    Frozen(Uuid),

    #[error("{0} window is not open")]
    WindowClosed(String),

    /// Transient failure of the backing store; callers may retry.
    #[error("store error: {0}")]
    Store(String),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Machine-readable code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => VALIDATION_ERROR,
            Self::Range(_) => RANGE_ERROR,
            Self::Conflict(_) => CONFLICT,
            Self::NotFound { .. } => NOT_FOUND,
            Self::Authorization(_) => FORBIDDEN,
            Self::Frozen(_) => RECORD_FROZEN,
            Self::WindowClosed(_) => WINDOW_CLOSED,
            Self::Store(_) => STORE_ERROR,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Range(_) => 400,
            Self::Authorization(_) | Self::WindowClosed(_) => 403,
            Self::NotFound { .. } => 404,
            Self::Conflict(_) | Self::Frozen(_) => 409,
            Self::Store(_) => 503,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.to_string())
    }
}
