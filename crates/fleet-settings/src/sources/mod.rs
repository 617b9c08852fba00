//! Concrete settings sources.

pub mod cdrom;
pub mod complex;
pub mod config_drive;
pub mod file;
pub mod instance_metadata;

pub use cdrom::CdromSettingsSource;
pub use complex::ComplexSettingsSource;
pub use config_drive::ConfigDriveSettingsSource;
pub use file::FileSettingsSource;
pub use instance_metadata::InstanceMetadataSettingsSource;
