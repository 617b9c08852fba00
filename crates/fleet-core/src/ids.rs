//! Identifiers for agent tasks.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Externally visible task identifier.
///
/// Generated for new tasks, or supplied by the caller when a persisted task
/// is resumed under its original id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Source of fresh unique identifiers.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> Result<String>;
}

/// Random v4 UUID generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> Result<String> {
        Ok(Uuid::new_v4().to_string())
    }
}

/// Generator that always fails; handy for exercising id-allocation errors.
#[derive(Debug, Clone)]
pub struct FailingIdGenerator(pub String);

impl IdGenerator for FailingIdGenerator {
    fn generate(&self) -> Result<String> {
        Err(Error::IdGeneration(self.0.clone()))
    }
}
