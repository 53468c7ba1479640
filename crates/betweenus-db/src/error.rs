use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique constraint hit, or a pointer already set to something else
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Transient failure; callers may retry
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database lock poisoned")]
    Poisoned,

    #[error("corrupt value in {column}: {value}")]
    Corrupt { column: &'static str, value: String },

    #[error(transparent)]
    Sqlite(rusqlite::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn corrupt(column: &'static str, value: impl Into<String>) -> Self {
        Self::Corrupt {
            column,
            value: value.into(),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::ConstraintViolation) => Self::Conflict(e.to_string()),
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                Self::Unavailable(e.to_string())
            }
            _ => Self::Sqlite(e),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
