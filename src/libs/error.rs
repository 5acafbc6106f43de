use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    CorruptUpload,
    StorageUnreadable,
    TableNotFound,
    InvalidOperation,
    NoActiveSession,
    Storage,
    Io,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::CorruptUpload => "corrupt_upload",
            ErrorCode::StorageUnreadable => "storage_unreadable",
            ErrorCode::TableNotFound => "table_not_found",
            ErrorCode::InvalidOperation => "invalid_operation",
            ErrorCode::NoActiveSession => "no_active_session",
            ErrorCode::Storage => "storage",
            ErrorCode::Io => "io",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TablesmithError {
    #[error("uploaded file is not a readable database: {0}")]
    CorruptUpload(String),
    #[error("database structure could not be read: {0}")]
    StorageUnreadable(String),
    #[error("table not found: {0}")]
    TableNotFound(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("no database has been uploaded")]
    NoActiveSession,
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TablesmithError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TablesmithError::CorruptUpload(_) => ErrorCode::CorruptUpload,
            TablesmithError::StorageUnreadable(_) => ErrorCode::StorageUnreadable,
            TablesmithError::TableNotFound(_) => ErrorCode::TableNotFound,
            TablesmithError::InvalidOperation(_) => ErrorCode::InvalidOperation,
            TablesmithError::NoActiveSession => ErrorCode::NoActiveSession,
            TablesmithError::Storage(_) => ErrorCode::Storage,
            TablesmithError::Io(_) => ErrorCode::Io,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        TablesmithError::InvalidOperation(message.into())
    }

    /// Maps a failed statement execution: rejections raised by the database
    /// itself (constraints, type checks) are the caller's fault, everything
    /// else is an infrastructure failure.
    pub(crate) fn from_execution(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => TablesmithError::InvalidOperation(db.message().to_string()),
            other => TablesmithError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, TablesmithError>;
