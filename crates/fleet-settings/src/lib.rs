//! Settings resolution for the fleet agent.
//!
//! A prioritized chain of sources (files, CD-ROM, config drive, metadata
//! endpoints) produces the VM's [`Settings`](fleet_core::settings::Settings).
//! Whichever source answers first is kept for the rest of the process.

pub mod contents;
pub mod error;
pub mod factory;
pub mod metadata;
pub mod source;
pub mod sources;

pub use contents::{MetadataContents, UserDataContents};
pub use error::{Result, SettingsError};
pub use factory::{SettingsSourceFactory, SourceOptions, parse_source_options};
pub use metadata::MetadataService;
pub use source::{MultiSettingsSource, SettingsSource};
