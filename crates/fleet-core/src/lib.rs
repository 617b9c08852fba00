//! Fleet Agent Core
//!
//! Core domain types, collaborator traits, and error handling for the fleet
//! agent. This crate defines the shared vocabulary used by the device,
//! settings, and agent crates.

pub mod error;
pub mod events;
pub mod host;
pub mod ids;
pub mod message;
pub mod ports;
pub mod settings;

#[cfg(any(test, feature = "testing"))]
pub mod fakes;

pub use error::{Error, Result};
pub use ids::*;
