use std::io;

use thiserror::Error;

/// Error type for configuration, store, and run failures.
///
/// Malformed record content never surfaces here; it degrades to empty derived
/// values instead. A failed batch commit is reported in that batch's outcome.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Core backend is not configured")]
    NotConfigured,
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("record '{collection}/{id}' no longer exists")]
    StaleReference { collection: String, id: String },
    #[error("{context}: {source}")]
    Database {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("background task failed: {0}")]
    Task(String),
}

/// Wraps a rusqlite error with a human readable context line.
pub(crate) fn db_error(context: impl Into<String>) -> impl FnOnce(rusqlite::Error) -> CoreError {
    let context = context.into();
    move |source| CoreError::Database { context, source }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_errors_carry_their_context() {
        let error = db_error("Could not open store")(rusqlite::Error::InvalidQuery);
        let message = error.to_string();
        assert!(message.starts_with("Could not open store: "));
    }

    #[test]
    fn stale_reference_names_the_record() {
        let error = CoreError::StaleReference {
            collection: "courses".to_string(),
            id: "c-1".to_string(),
        };
        assert_eq!(error.to_string(), "record 'courses/c-1' no longer exists");
    }
}
