//! Resolved VM settings as delivered by the control plane.
//!
//! A [`Settings`] value is produced fresh by each settings fetch and is never
//! mutated in place. The JSON field names here match the control-plane wire
//! format, so renames are pinned with serde attributes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ROOT_USERNAME: &str = "root";
pub const VCAP_USERNAME: &str = "vcap";

/// Resolved identity and configuration for this VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub blobstore: Blobstore,
    #[serde(default)]
    pub disks: Disks,
    #[serde(default)]
    pub env: Env,
    #[serde(default)]
    pub networks: Networks,
    #[serde(default)]
    pub ntp: Vec<String>,
    #[serde(default)]
    pub mbus: String,
    #[serde(default)]
    pub vm: Vm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_certs: Option<String>,
}

impl Settings {
    /// A settings value only counts as resolved once it carries an agent id.
    pub fn is_resolved(&self) -> bool {
        !self.agent_id.is_empty()
    }

    /// Addressing metadata for the persistent disk with the given CID.
    pub fn persistent_disk_settings(&self, disk_id: &str) -> Option<DiskSettings> {
        self.disks
            .persistent
            .get(disk_id)
            .map(|hint| hint.to_disk_settings(disk_id))
    }

    /// All persistent disks, sorted by disk CID.
    pub fn persistent_disks(&self) -> Vec<DiskSettings> {
        self.disks
            .persistent
            .iter()
            .map(|(id, hint)| hint.to_disk_settings(id))
            .collect()
    }

    pub fn ephemeral_disk_settings(&self) -> DiskSettings {
        match &self.disks.ephemeral {
            Some(hint) => hint.to_disk_settings(""),
            None => DiskSettings::default(),
        }
    }

    pub fn raw_ephemeral_disk_settings(&self) -> Vec<DiskSettings> {
        self.disks
            .raw_ephemeral
            .iter()
            .map(|disk| DiskSettings {
                id: disk.id.clone(),
                path: disk.path.clone(),
                ..DiskSettings::default()
            })
            .collect()
    }

    pub fn password(&self) -> Option<&str> {
        self.env.agent.password.as_deref().filter(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blobstore {
    #[serde(default, rename = "provider")]
    pub kind: String,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Disks {
    /// Root device, e.g. `/dev/sda`.
    #[serde(default)]
    pub system: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<DiskHint>,
    #[serde(default)]
    pub raw_ephemeral: Vec<RawEphemeralDisk>,
    #[serde(default)]
    pub persistent: BTreeMap<String, DiskHint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEphemeralDisk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub path: String,
}

/// Provider-supplied addressing for one disk, either a bare device path or a
/// structured record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DiskHint {
    Path(String),
    Detailed(DiskHintDetails),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskHintDetails {
    #[serde(default)]
    pub volume_id: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub lun: String,
    #[serde(default)]
    pub host_device_id: String,
    #[serde(default)]
    pub iscsi_settings: IscsiSettings,
}

impl DiskHint {
    fn to_disk_settings(&self, disk_id: &str) -> DiskSettings {
        match self {
            DiskHint::Path(path) => DiskSettings {
                id: disk_id.to_string(),
                volume_id: path.clone(),
                path: path.clone(),
                ..DiskSettings::default()
            },
            DiskHint::Detailed(details) => DiskSettings {
                id: disk_id.to_string(),
                device_id: details.id.clone(),
                volume_id: details.volume_id.clone(),
                lun: details.lun.clone(),
                host_device_id: details.host_device_id.clone(),
                path: details.path.clone(),
                iscsi: details.iscsi_settings.clone(),
            },
        }
    }
}

/// One disk's cloud-provider addressing metadata.
///
/// Each device path resolver reads its own subset of these fields and
/// rejects the disk up front when a required field is empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSettings {
    pub id: String,
    pub device_id: String,
    pub volume_id: String,
    pub lun: String,
    pub host_device_id: String,
    pub path: String,
    pub iscsi: IscsiSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiSettings {
    #[serde(default)]
    pub initiator_name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub target: String,
}

impl IscsiSettings {
    pub fn is_empty(&self) -> bool {
        self.initiator_name.is_empty()
            && self.username.is_empty()
            && self.password.is_empty()
            && self.target.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Env {
    #[serde(default, rename = "bosh")]
    pub agent: AgentEnv,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentEnv {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub keep_root_password: bool,
    #[serde(default)]
    pub remove_dev_tools: bool,
    #[serde(default)]
    pub authorized_keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    #[default]
    Manual,
    Dynamic,
    Vip,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    #[serde(default, rename = "type")]
    pub kind: NetworkType,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub netmask: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub use_dhcp: bool,
    /// Categories this network is the default for (`dns`, `gateway`).
    #[serde(default)]
    pub default: Vec<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub preconfigured: bool,
}

impl Network {
    pub fn is_dhcp(&self) -> bool {
        self.kind == NetworkType::Dynamic || self.use_dhcp
    }

    pub fn is_default_for(&self, category: &str) -> bool {
        self.default.iter().any(|c| c == category)
    }

    /// DHCP network used when no interface is configured yet.
    pub fn default_dhcp() -> Self {
        Self {
            kind: NetworkType::Dynamic,
            default: vec!["dns".to_string(), "gateway".to_string()],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Networks(pub BTreeMap<String, Network>);

impl Networks {
    pub fn single(name: impl Into<String>, network: Network) -> Self {
        let mut map = BTreeMap::new();
        map.insert(name.into(), network);
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Network)> {
        self.0.iter()
    }

    /// The network that is the default for `category`, or the only network
    /// when there is exactly one.
    pub fn default_network_for(&self, category: &str) -> Option<&Network> {
        if self.0.len() == 1 {
            return self.0.values().next();
        }
        self.0.values().find(|n| n.is_default_for(category))
    }

    pub fn is_preconfigured(&self) -> bool {
        !self.0.is_empty() && self.0.values().all(|n| n.preconfigured)
    }
}
