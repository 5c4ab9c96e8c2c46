use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::vm_state::VmStatus;

/// `anka show <vm>` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmDescriptor {
    pub uuid: String,
    pub name: String,
    #[serde(default, alias = "vcpu_cores")]
    pub cpu_cores: u32,
    #[serde(default)]
    pub ram: String,
    #[serde(default)]
    pub image_id: String,
    #[serde(default)]
    pub status: VmStatus,
    /// Disk size in bytes.
    #[serde(default)]
    pub hard_drive: u64,
}

impl VmDescriptor {
    pub fn is_running(&self) -> bool {
        self.status == VmStatus::Running
    }

    pub fn is_stopped(&self) -> bool {
        self.status == VmStatus::Stopped
    }

    pub fn is_suspended(&self) -> bool {
        self.status == VmStatus::Suspended
    }
}

/// `anka describe <vm>` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtendedDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub cpu: CpuInfo,
    #[serde(default)]
    pub ram: String,
    #[serde(default)]
    pub network_cards: Vec<NetworkCard>,
    #[serde(default)]
    pub display: DisplayInfo,
    #[serde(default)]
    pub custom_variables: BTreeMap<String, String>,
}

impl ExtendedDescriptor {
    /// Host ports already claimed by forwarding rules on any card.
    pub fn bound_host_ports(&self) -> BTreeSet<u16> {
        self.network_cards
            .iter()
            .flat_map(|card| card.port_forwarding_rules.iter())
            .map(|rule| rule.host_port)
            .filter(|port| *port != 0)
            .collect()
    }

    /// Current display resolution as `WIDTHxHEIGHT`, if known.
    pub fn resolution(&self) -> Option<String> {
        let fb = self.display.frame_buffers.first()?;
        (fb.width > 0 && fb.height > 0).then(|| format!("{}x{}", fb.width, fb.height))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuInfo {
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub threads: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkCard {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub port_forwarding_rules: Vec<PortForwardingRule>,
}

/// An existing port-forwarding rule on a VM network card.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortForwardingRule {
    #[serde(default)]
    pub guest_port: u16,
    #[serde(default)]
    pub host_port: u16,
    #[serde(default)]
    pub rule_name: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub host_ip: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DisplayInfo {
    #[serde(default)]
    pub controller: String,
    #[serde(default)]
    pub headless: u8,
    #[serde(default, alias = "frame_buffer", deserialize_with = "one_or_many")]
    pub frame_buffers: Vec<FrameBuffer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrameBuffer {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub vnc_port: u16,
}

/// Older tool versions report a single object where newer ones use a list.
fn one_or_many<'de, D, T>(de: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }
    Ok(match Option::<OneOrMany<T>>::deserialize(de)? {
        Some(OneOrMany::Many(v)) => v,
        Some(OneOrMany::One(v)) => vec![v],
        None => Vec::new(),
    })
}

/// `anka create` body.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateResponse {
    pub uuid: String,
}

/// `anka version` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub build: String,
}

/// `anka license show` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LicenseInfo {
    #[serde(default)]
    pub license_type: String,
    #[serde(default)]
    pub status: String,
}

/// License type that cannot suspend VMs.
pub const DEVELOP_LICENSE: &str = "com.veertu.anka.develop";

/// One entry of `anka registry list`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryTemplate {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub latest: String,
}

/// One entry of `anka registry list-repos`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryRepo {
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub port: String,
}
