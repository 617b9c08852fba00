//! Builds the settings source chain from declarative options.

use crate::error::{Result, SettingsError};
use crate::metadata::{
    CachingMetadataService, FileMetadataService, HttpMetadataService, MetadataClient,
    MetadataPaths, MetadataService, MultiSourceMetadataService, RetryPolicy,
};
use crate::source::{MultiSettingsSource, SettingsSource};
use crate::sources::{
    CdromSettingsSource, ComplexSettingsSource, ConfigDriveSettingsSource, FileSettingsSource,
    InstanceMetadataSettingsSource,
};
use fleet_core::ports::Platform;
use serde::de::{DeserializeOwned, Error as _};
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

const TYPE_FIELD: &str = "Type";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpSourceOptions {
    #[serde(rename = "URI")]
    pub uri: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub user_data_path: String,
    #[serde(default, rename = "InstanceIDPath")]
    pub instance_id_path: String,
    #[serde(default, rename = "SSHKeysPath")]
    pub ssh_keys_path: String,
    #[serde(default)]
    pub token_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfigDriveSourceOptions {
    #[serde(default)]
    pub disk_paths: Vec<PathBuf>,
    #[serde(default)]
    pub meta_data_path: String,
    #[serde(default)]
    pub settings_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileSourceOptions {
    #[serde(default)]
    pub meta_data_path: String,
    #[serde(default)]
    pub user_data_path: String,
    pub settings_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CdromSourceOptions {
    pub file_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceMetadataSourceOptions {
    #[serde(rename = "URI")]
    pub uri: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub settings_path: String,
}

/// One entry of the settings source list, discriminated by its `Type` key.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOptions {
    Http(HttpSourceOptions),
    ConfigDrive(ConfigDriveSourceOptions),
    File(FileSourceOptions),
    Cdrom(CdromSourceOptions),
    InstanceMetadata(InstanceMetadataSourceOptions),
}

impl SourceOptions {
    pub fn type_name(&self) -> &'static str {
        match self {
            SourceOptions::Http(_) => "HTTP",
            SourceOptions::ConfigDrive(_) => "ConfigDrive",
            SourceOptions::File(_) => "File",
            SourceOptions::Cdrom(_) => "CDROM",
            SourceOptions::InstanceMetadata(_) => "InstanceMetadata",
        }
    }
}

fn typed<T: DeserializeOwned, E: serde::de::Error>(kind: &str, value: Value) -> std::result::Result<T, E> {
    serde_json::from_value(value).map_err(|e| E::custom(format!("{} source options: {}", kind, e)))
}

impl<'de> Deserialize<'de> for SourceOptions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let kind = match value.get(TYPE_FIELD) {
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => {
                return Err(D::Error::custom(format!(
                    "Settings source type must be a string, got {}",
                    other
                )));
            }
            None => return Err(D::Error::custom("Missing settings source type")),
        };

        match kind.as_str() {
            "HTTP" => typed(&kind, value).map(SourceOptions::Http),
            "ConfigDrive" => typed(&kind, value).map(SourceOptions::ConfigDrive),
            "File" => typed(&kind, value).map(SourceOptions::File),
            "CDROM" => typed(&kind, value).map(SourceOptions::Cdrom),
            "InstanceMetadata" => typed(&kind, value).map(SourceOptions::InstanceMetadata),
            other => Err(D::Error::custom(format!(
                "Unknown settings source type '{}'",
                other
            ))),
        }
    }
}

impl Serialize for SourceOptions {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let value = match self {
            SourceOptions::Http(o) => serde_json::to_value(o),
            SourceOptions::ConfigDrive(o) => serde_json::to_value(o),
            SourceOptions::File(o) => serde_json::to_value(o),
            SourceOptions::Cdrom(o) => serde_json::to_value(o),
            SourceOptions::InstanceMetadata(o) => serde_json::to_value(o),
        }
        .map_err(S::Error::custom)?;

        let mut map = match value {
            Value::Object(map) => map,
            _ => return Err(S::Error::custom("Source options must serialize to an object")),
        };
        map.insert(TYPE_FIELD.to_string(), Value::String(self.type_name().to_string()));
        map.serialize(serializer)
    }
}

/// Parse a JSON or YAML list of source options.
pub fn parse_source_options(raw: &str) -> Result<Vec<SourceOptions>> {
    serde_yaml::from_str(raw).map_err(|e| SettingsError::InvalidOptions(e.to_string()))
}

/// Builds a [`MultiSettingsSource`] from source options, in order.
///
/// `HTTP` and metadata-backed `File` entries are pooled into one
/// metadata-backed source at the position of the first such entry, so the
/// agent sticks to whichever metadata service is available.
pub struct SettingsSourceFactory {
    options: Vec<SourceOptions>,
    platform: Arc<dyn Platform>,
    cache_dir: PathBuf,
    retry: RetryPolicy,
}

impl SettingsSourceFactory {
    pub fn new(options: Vec<SourceOptions>, platform: Arc<dyn Platform>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            options,
            platform,
            cache_dir: cache_dir.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn http_metadata(&self, opts: &HttpSourceOptions) -> Arc<dyn MetadataService> {
        let client = MetadataClient::new(&opts.uri, self.platform.clone())
            .with_headers(opts.headers.clone())
            .with_token_path(Some(opts.token_path.clone()))
            .with_retry(self.retry);

        let defaults = MetadataPaths::default();
        let or_default = |value: &str, default: String| {
            if value.is_empty() { default } else { value.to_string() }
        };
        let paths = MetadataPaths {
            user_data: or_default(&opts.user_data_path, defaults.user_data),
            instance_id: or_default(&opts.instance_id_path, defaults.instance_id),
            ssh_keys: or_default(&opts.ssh_keys_path, defaults.ssh_keys),
        };

        Arc::new(CachingMetadataService::new(
            Arc::new(HttpMetadataService::new(client, paths)),
            self.platform.fs(),
            self.cache_dir.clone(),
        ))
    }

    pub fn new_settings_source(&self) -> Result<Arc<dyn SettingsSource>> {
        let mut sources: Vec<Arc<dyn SettingsSource>> = Vec::new();
        let mut metadata_services: Vec<Arc<dyn MetadataService>> = Vec::new();
        let mut metadata_slot: Option<usize> = None;

        for options in &self.options {
            match options {
                SourceOptions::Http(opts) => {
                    metadata_slot.get_or_insert(sources.len());
                    metadata_services.push(self.http_metadata(opts));
                }
                SourceOptions::File(opts) if !opts.meta_data_path.is_empty() || !opts.user_data_path.is_empty() => {
                    metadata_slot.get_or_insert(sources.len());
                    metadata_services.push(Arc::new(FileMetadataService::new(
                        self.platform.fs(),
                        &opts.meta_data_path,
                        &opts.user_data_path,
                        &opts.settings_path,
                    )));
                }
                SourceOptions::File(opts) => {
                    sources.push(Arc::new(FileSettingsSource::new(self.platform.fs(), &opts.settings_path)));
                }
                SourceOptions::ConfigDrive(opts) => {
                    sources.push(Arc::new(ConfigDriveSettingsSource::new(
                        self.platform.clone(),
                        opts.disk_paths.clone(),
                        &opts.meta_data_path,
                        &opts.settings_path,
                    )));
                }
                SourceOptions::Cdrom(opts) => {
                    sources.push(Arc::new(CdromSettingsSource::new(self.platform.clone(), &opts.file_name)));
                }
                SourceOptions::InstanceMetadata(opts) => {
                    let client = MetadataClient::new(&opts.uri, self.platform.clone())
                        .with_headers(opts.headers.clone())
                        .with_retry(self.retry);
                    sources.push(Arc::new(InstanceMetadataSettingsSource::new(client, &opts.settings_path)));
                }
            }
        }

        if let Some(slot) = metadata_slot {
            let metadata = Arc::new(MultiSourceMetadataService::new(metadata_services));
            sources.insert(slot, Arc::new(ComplexSettingsSource::new(metadata)));
        }

        Ok(Arc::new(MultiSettingsSource::new(sources)?))
    }
}
