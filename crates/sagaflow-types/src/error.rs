use thiserror::Error;

/// Errors from repository operations (used by trait definitions in sagaflow-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from the durable job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(String),

    #[error("invalid job payload: {0}")]
    Payload(String),

    #[error("job {0} not found")]
    NotFound(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_repository_conflict_display() {
        let err = RepositoryError::Conflict("active workflow exists".to_string());
        assert_eq!(err.to_string(), "conflict: active workflow exists");
    }

    #[test]
    fn test_queue_error_display() {
        assert_eq!(QueueError::NotFound(42).to_string(), "job 42 not found");
        assert!(
            QueueError::Payload("missing step_name".to_string())
                .to_string()
                .contains("missing step_name")
        );
    }
}
