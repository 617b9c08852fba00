//! Errors raised while fetching settings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("MultiSettingsSource requires to have at least one source")]
    NoSources,

    #[error("Getting settings from all sources: {0}")]
    AllSourcesFailed(String),

    #[error("No metadata service is available")]
    NoServiceAvailable,

    #[error("Invalid settings source options: {0}")]
    InvalidOptions(String),

    #[error("Fetching {url}: {message}")]
    Http { url: String, message: String },

    #[error("Parsing {what}: {message}")]
    Parse { what: String, message: String },

    /// The source answered but did not provide the requested value.
    #[error("{0}")]
    Missing(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<SettingsError>,
    },

    #[error(transparent)]
    Core(#[from] fleet_core::Error),
}

impl SettingsError {
    pub fn context(self, context: impl Into<String>) -> Self {
        SettingsError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub(crate) fn parse(what: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SettingsError::Parse {
            what: what.into(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SettingsError>;
