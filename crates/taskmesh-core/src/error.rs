use thiserror::Error;

/// A convenience `Result` alias using [`TaskmeshError`].
pub type TaskmeshResult<T> = Result<T, TaskmeshError>;

/// Top-level error type for the taskmesh engine.
///
/// The first four variants are the engine's error taxonomy; the rest come
/// from configuration and I/O plumbing around it.
#[derive(Error, Debug)]
pub enum TaskmeshError {
    /// A caller passed something the engine cannot accept (bad priority,
    /// malformed workflow, unknown agent role, ...).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An id (task, agent, workflow) that the engine does not know.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A task handler reported failure.
    #[error("Handler error: {0}")]
    Handler(String),

    /// A task or wait exceeded its time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// The engine itself refused or could not complete an operation.
    #[error("Engine error: {0}")]
    Engine(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskmeshError {
    /// Shorthand for a [`TaskmeshError::Handler`] with the given message.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Shorthand for a [`TaskmeshError::NotFound`] naming the kind and id.
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{kind} {id}"))
    }

    /// Whether this is a [`TaskmeshError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
