use thiserror::Error;

pub type RdsyncResult<T> = Result<T, RdsyncError>;

/// Boxed cause carried by the wrapping variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum RdsyncError {
    /// The signature comparator could not be built or a content stream was unreadable.
    #[error("signature error: {0}")]
    Signature(String),

    #[error("delta computation failed: {message}")]
    DeltaComputation {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("transfer failed: {message}")]
    Transfer {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("operation was canceled")]
    OperationCanceled,

    /// A Need carried a block type outside {FromSeed, FromSource}.
    #[error("unsupported need type: {0}")]
    UnsupportedNeedType(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file {0} is conflicted")]
    Conflicted(String),

    #[error("file {0} is not conflicted")]
    NotConflicted(String),

    #[error("file already exists: {0}")]
    AlreadyExists(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RdsyncError {
    pub fn delta(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        RdsyncError::DeltaComputation {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn transfer(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        RdsyncError::Transfer {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Render the error and its cause chain on one line, for reports.
    pub fn chain_message(&self) -> String {
        let mut out = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            out.push_str(": ");
            out.push_str(&err.to_string());
            cause = err.source();
        }
        out
    }
}
