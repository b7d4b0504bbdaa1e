use thiserror::Error;

/// Failures raised by the update dispatcher
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Inbound payload did not match the update schema
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A handler is already bound to this match key
    #[error("Handler already registered for '{0}'")]
    Conflict(String),

    /// No handler matched and no fallback is installed
    #[error("No handler for '{0}' and no fallback configured")]
    UnhandledUpdate(String),

    /// Dispatcher no longer accepts updates
    #[error("Dispatcher is shutting down")]
    ShuttingDown,
}

impl DispatchError {
    pub fn malformed(reason: impl std::fmt::Display) -> Self {
        Self::MalformedPayload(reason.to_string())
    }
}
