use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transfer to '{destination}' failed: {message}")]
    Transfer { destination: String, message: String },

    #[error("Incremental parent backup {0} not found")]
    ParentNotFound(u64),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Database restore failed at query {index}: {message}")]
    Query { index: usize, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    /// Short kind label used in job log entries.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Configuration(_) => "configuration",
            AppError::Io(_) => "io",
            AppError::Transfer { .. } => "transfer",
            AppError::ParentNotFound(_) => "parent_not_found",
            AppError::Validation(_) => "validation",
            AppError::Query { .. } => "query",
            AppError::NotFound(_) => "not_found",
            AppError::Sqlx(_) => "database",
            AppError::Http(_) => "http",
            AppError::SerdeJson(_) => "json",
            AppError::Walk(_) => "io",
            AppError::Join(_) => "internal",
            AppError::Anyhow(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_reports_statement_index() {
        let err = AppError::Query {
            index: 4,
            message: "syntax error".into(),
        };
        assert_eq!(
            err.to_string(),
            "Database restore failed at query 4: syntax error"
        );
        assert_eq!(err.kind(), "query");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: AppError = io.into();
        assert_eq!(err.kind(), "io");
    }
}
