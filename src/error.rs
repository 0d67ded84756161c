//! Error taxonomy for backend and sync operations.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Backend unreachable or failed; the next operation retries implicitly.
    #[error("transient backend error: {0}")]
    TransientNetwork(String),
    /// Backend rejected part of the payload's schema.
    #[error("backend schema mismatch: {0}")]
    SchemaMismatch(String),
    /// Superseded by a newer request before completion.
    #[error("operation cancelled")]
    Cancelled,
    #[error("command {0} already processed")]
    DuplicateCommand(String),
    #[error("{0} is not initialized")]
    NotInitialized(&'static str),
    /// Optional backend capability is missing on this deployment.
    #[error("unsupported backend operation: {0}")]
    Unsupported(String),
    #[error("timed out after {0} ms")]
    Timeout(u64),
}

impl SyncError {
    /// Stable class name used to throttle repeated log lines.
    pub fn class(&self) -> &'static str {
        match self {
            SyncError::TransientNetwork(_) => "transient_network",
            SyncError::SchemaMismatch(_) => "schema_mismatch",
            SyncError::Cancelled => "cancelled",
            SyncError::DuplicateCommand(_) => "duplicate_command",
            SyncError::NotInitialized(_) => "not_initialized",
            SyncError::Unsupported(_) => "unsupported",
            SyncError::Timeout(_) => "timeout",
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(error: rusqlite::Error) -> Self {
        let text = error.to_string();
        if text.contains("no such column") || text.contains("has no column named") {
            SyncError::SchemaMismatch(text)
        } else if text.contains("no such table") {
            SyncError::Unsupported(text)
        } else {
            SyncError::TransientNetwork(text)
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        SyncError::SchemaMismatch(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::SyncError;
    use rusqlite::Connection;

    #[test]
    fn test_missing_column_maps_to_schema_mismatch() {
        let conn = Connection::open_in_memory().expect("in-memory sqlite");
        conn.execute("CREATE TABLE commands (id TEXT PRIMARY KEY, status TEXT)", [])
            .expect("create table");
        let error = conn
            .execute("UPDATE commands SET result = 'x' WHERE id = 'a'", [])
            .expect_err("missing column should fail");
        assert!(matches!(SyncError::from(error), SyncError::SchemaMismatch(_)));
    }

    #[test]
    fn test_missing_table_maps_to_unsupported() {
        let conn = Connection::open_in_memory().expect("in-memory sqlite");
        let error = conn
            .execute("DELETE FROM node_liveness", [])
            .expect_err("missing table should fail");
        let mapped = SyncError::from(error);
        assert!(matches!(mapped, SyncError::Unsupported(_)));
        assert_eq!(mapped.class(), "unsupported");
    }
}
