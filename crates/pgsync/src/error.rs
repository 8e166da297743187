//! Error types for the sync library.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad category of a failure, as reported in task results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Precondition,
    Connectivity,
    Database,
    Unexpected,
}

/// Main error type for sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid or conflicting configuration, unknown table or group.
    #[error("{0}")]
    Config(String),

    /// A SQL template still references variables nobody supplied.
    #[error("Missing variables: {}", .0.join(", "))]
    MissingVariable(Vec<String>),

    /// A strategy's requirements are not met by the table.
    #[error("{0}")]
    Precondition(String),

    /// Table has no primary key but the chosen strategy needs row identity.
    #[error("No primary key on {0}")]
    NoPrimaryKey(String),

    /// Connection could not be established or was lost.
    #[error("Connection failed: {0}")]
    Connection(#[source] tokio_postgres::Error),

    /// Error reported by the server (or the driver while talking to it).
    #[error("{}", database_message(.0))]
    Database(#[from] tokio_postgres::Error),

    /// Failure while piping COPY data between the two sides.
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// One or more tables failed during the run.
    #[error("Sync failed for {}: {}", table_count(.0), .0.join(", "))]
    SyncFailed(Vec<String>),

    /// IO error (config file, shell substitution).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A worker panicked or was aborted.
    #[error("{category:?}: {message}")]
    Unexpected {
        category: ErrorCategory,
        message: String,
    },

    /// Sync was cancelled (SIGINT, etc.)
    #[error("Sync cancelled")]
    Cancelled,
}

/// Strip the `ERROR:  ` severity prefix the server puts in front of messages.
fn database_message(err: &tokio_postgres::Error) -> String {
    match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string().trim_start_matches("ERROR:  ").to_string(),
    }
}

fn table_count(tables: &[String]) -> String {
    match tables.len() {
        1 => "1 table".to_string(),
        n => format!("{} tables", n),
    }
}

/// A driver error with no server response on a closed socket.
fn is_connection_loss(err: &tokio_postgres::Error) -> bool {
    err.as_db_error().is_none() && err.is_closed()
}

impl SyncError {
    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Create an Unexpected error preserving where it came from.
    pub fn unexpected(category: ErrorCategory, message: impl Into<String>) -> Self {
        SyncError::Unexpected {
            category,
            message: message.into(),
        }
    }

    /// Category used in task results and exit codes.
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Config(_)
            | SyncError::MissingVariable(_)
            | SyncError::Yaml(_)
            | SyncError::Json(_) => ErrorCategory::Configuration,
            SyncError::Precondition(_) | SyncError::NoPrimaryKey(_) => ErrorCategory::Precondition,
            SyncError::Connection(_) => ErrorCategory::Connectivity,
            SyncError::Database(err) if is_connection_loss(err) => ErrorCategory::Connectivity,
            SyncError::Database(_) | SyncError::Transfer { .. } => ErrorCategory::Database,
            SyncError::SyncFailed(_)
            | SyncError::Io(_)
            | SyncError::Unexpected { .. }
            | SyncError::Cancelled => ErrorCategory::Unexpected,
        }
    }

    /// Message shown for a failed task. Connection failures are simplified;
    /// the full diagnostic is shown when the run first connects.
    pub fn task_message(&self) -> String {
        match self.category() {
            ErrorCategory::Connectivity => "Connection failed".to_string(),
            _ => self.to_string(),
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Io(_) => 7,
            SyncError::Cancelled => 130,
            other => match other.category() {
                ErrorCategory::Configuration => 1,
                ErrorCategory::Precondition => 2,
                ErrorCategory::Connectivity => 3,
                ErrorCategory::Database => 4,
                ErrorCategory::Unexpected => 5,
            },
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_failed_pluralizes() {
        let one = SyncError::SyncFailed(vec!["posts".into()]);
        assert_eq!(one.to_string(), "Sync failed for 1 table: posts");

        let two = SyncError::SyncFailed(vec!["posts".into(), "comments".into()]);
        assert_eq!(two.to_string(), "Sync failed for 2 tables: posts, comments");
    }

    #[test]
    fn test_missing_variable_message() {
        let err = SyncError::MissingVariable(vec!["id".into(), "org".into()]);
        assert_eq!(err.to_string(), "Missing variables: id, org");
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_categories_and_exit_codes() {
        assert_eq!(
            SyncError::NoPrimaryKey("public.posts".into()).category(),
            ErrorCategory::Precondition
        );
        assert_eq!(SyncError::Config("x".into()).exit_code(), 1);
        assert_eq!(SyncError::Precondition("x".into()).exit_code(), 2);
        assert_eq!(SyncError::Cancelled.exit_code(), 130);
        let io = SyncError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(io.exit_code(), 7);
    }

    #[test]
    fn test_unexpected_keeps_category() {
        let err = SyncError::unexpected(ErrorCategory::Database, "worker panicked");
        assert_eq!(err.to_string(), "Database: worker panicked");
        assert_eq!(err.category(), ErrorCategory::Unexpected);
    }
}
