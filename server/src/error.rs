use thiserror::Error;

/// Result alias used across the library.
pub type FormBuilderResult<T> = Result<T, FormBuilderError>;

/// Error taxonomy of the form builder.
///
/// `Configuration` errors come from registry misuse and are meant to abort
/// start-up. `NotFound` and `Validation` are recovered at the dispatch
/// boundary and turned into structured JSON responses.
#[derive(Error, Debug)]
pub enum FormBuilderError {
    #[error("Improperly configured: {0}")]
    Configuration(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// Raised by an action (or a handler) to reject a submission with a
    /// user-facing message.
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl FormBuilderError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
