//! Payloads exposed by most cloud metadata channels.

use crate::error::{Result, SettingsError};
use fleet_core::settings::{Networks, Settings};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Deployment data supplied by the operator as instance user data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDataContents {
    #[serde(default)]
    pub registry: UserDataRegistry,
    #[serde(default)]
    pub server: UserDataServer,
    #[serde(default)]
    pub dns: UserDataDns,
    #[serde(default)]
    pub networks: Networks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Settings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDataRegistry {
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDataServer {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDataDns {
    #[serde(default)]
    pub nameserver: Vec<String>,
}

impl UserDataContents {
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| SettingsError::parse("user data", e))
    }

    /// Settings carried in the user data, provided they name an agent.
    pub fn resolved_settings(&self) -> Result<Settings> {
        match &self.settings {
            Some(settings) if settings.is_resolved() => Ok(settings.clone()),
            Some(_) => Err(SettingsError::Missing(
                "User data settings are missing an agent id".to_string(),
            )),
            None => Err(SettingsError::Missing(
                "User data does not contain settings".to_string(),
            )),
        }
    }
}

/// Instance metadata supplied by the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataContents {
    #[serde(default, rename = "public-keys")]
    pub public_keys: BTreeMap<String, PublicKey>,
    #[serde(default, rename = "instance-id")]
    pub instance_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublicKey {
    #[serde(default, rename = "openssh-key")]
    pub openssh_key: String,
}

impl MetadataContents {
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| SettingsError::parse("metadata", e))
    }

    /// The first key the provider lists, or an empty string.
    pub fn public_key(&self) -> String {
        self.public_keys
            .get("0")
            .or_else(|| self.public_keys.values().next())
            .map(|key| key.openssh_key.clone())
            .unwrap_or_default()
    }
}

/// Parse a settings document and require an agent id.
pub(crate) fn parse_settings(raw: &[u8], what: &str) -> Result<Settings> {
    let settings: Settings =
        serde_json::from_slice(raw).map_err(|e| SettingsError::parse(what, e))?;
    if !settings.is_resolved() {
        return Err(SettingsError::Missing(format!("{} is missing an agent id", what)));
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_public_key() {
        let raw = br#"{"public-keys":{"0":{"openssh-key":"ssh-rsa AAAA"}},"instance-id":"i-123"}"#;
        let metadata = MetadataContents::from_slice(raw).unwrap();
        assert_eq!(metadata.public_key(), "ssh-rsa AAAA");
        assert_eq!(metadata.instance_id, "i-123");
    }

    #[test]
    fn test_user_data_without_settings() {
        let raw = br#"{"server":{"name":"vm-1"},"registry":{"endpoint":"http://registry:25777"}}"#;
        let user_data = UserDataContents::from_slice(raw).unwrap();
        assert_eq!(user_data.server.name, "vm-1");
        assert!(user_data.resolved_settings().is_err());
    }

    #[test]
    fn test_parse_settings_requires_agent_id() {
        assert!(parse_settings(br#"{"agent_id":""}"#, "settings file").is_err());
        assert!(parse_settings(br#"{"agent_id":"a-1"}"#, "settings file").is_ok());
    }
}
