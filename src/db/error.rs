//! Error type for the persistence layer.
//!
//! | Variant | When to use |
//! |---------|-------------|
//! | `NotFound` | Resource must exist but doesn't (update/delete by ID) |
//! | `Conflict` | Unique constraint violation, concurrent modification |
//! | `Internal` | Data corruption, invalid stored data (e.g., unparseable UUID) |
//! | `Sqlx` | Unexpected database errors propagated via `?` |
//!
//! Lookups where absence is normal return `Result<Option<T>>` instead of
//! `NotFound`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("invalid stored data: {0}")]
    Internal(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// Map a sqlx error to `Conflict` when it is a unique-constraint
    /// violation, passing everything else through.
    pub fn on_conflict(err: sqlx::Error, msg: &str) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return Self::Conflict(msg.to_string());
            }
        }
        Self::Sqlx(err)
    }
}
