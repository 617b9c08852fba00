//! Errors raised while resolving device paths.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The disk settings lack a field the strategy needs.
    #[error("Disk settings missing {0}")]
    MissingField(&'static str),

    /// A field is present but unusable.
    #[error("Invalid disk settings: {0}")]
    InvalidField(String),

    #[error("Timed out getting real device path for '{0}'")]
    TimedOut(String),

    #[error("More than one disk matched '{pattern}': {matches:?}")]
    Ambiguous {
        pattern: String,
        matches: Vec<String>,
    },

    #[error("Expected {expected} instance storage devices but discovered {discovered}: {devices:?}")]
    InstanceStorageMismatch {
        expected: usize,
        discovered: usize,
        devices: Vec<String>,
    },

    #[error("Resolving with fallback: primary: {primary}, secondary: {secondary}")]
    Fallback {
        primary: Box<ResolveError>,
        secondary: Box<ResolveError>,
    },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ResolveError>,
    },

    #[error(transparent)]
    Host(#[from] fleet_core::Error),
}

impl ResolveError {
    /// Whether the failure came from waiting on the kernel rather than from
    /// bad input. Ambiguity counts as timed out since waiting longer cannot
    /// fix it.
    pub fn timed_out(&self) -> bool {
        match self {
            ResolveError::TimedOut(_) | ResolveError::Ambiguous { .. } => true,
            ResolveError::Fallback { secondary, .. } => secondary.timed_out(),
            ResolveError::Context { source, .. } => source.timed_out(),
            _ => false,
        }
    }

    pub fn context(self, context: impl Into<String>) -> Self {
        ResolveError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, ResolveError>;
