//! Error types for the fleet agent.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Settings errors
    #[error("Settings not found: {0}")]
    SettingsNotFound(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    // Task errors
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Generating task id: {0}")]
    IdGeneration(String),

    #[error("Task persistence failed: {0}")]
    Persistence(String),

    // Action errors
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Action cancelled: {0}")]
    Cancelled(String),

    // Host errors
    #[error("Running command '{command}': {message}")]
    Command { command: String, message: String },

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    // Infrastructure errors
    #[error("Message bus error: {0}")]
    MessageBus(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
