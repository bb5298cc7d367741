//! Store failure classes.

use thiserror::Error;

/// Errors raised by [`crate::db::EntryStore`].
///
/// A duplicate insert is not an error; it surfaces as
/// [`crate::models::InsertOutcome::AlreadyExisted`].
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be opened or migrated. Fatal for the hosting process.
    #[error("Failed to initialize entry store at {path}: {source}")]
    Initialization {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to write entry store: {0}")]
    Write(#[source] rusqlite::Error),

    #[error("Failed to read entry store: {0}")]
    Read(#[source] rusqlite::Error),

    #[error("Corrupt entry row: {0}")]
    Corrupt(String),

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),
}

impl StoreError {
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Initialization { .. })
    }

    pub(crate) fn from_read(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::FromSqlConversionFailure(column, _, cause) => {
                Self::Corrupt(format!("column {column}: {cause}"))
            }
            other => Self::Read(other),
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
