use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::anka::RegistryParams;
use crate::error::ProvisionError;
use crate::util::{self, NameSource, RandomNames};

pub const DEFAULT_BOOT_DELAY: &str = "10s";
pub const DEFAULT_TAG: &str = "latest";
const RULE_NAME_LEN: usize = 10;

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    /// `"create"` or `"clone"`; inferred from `[source]` when blank.
    #[facet(default)]
    pub builder: String,
    /// Delete same-named VMs (and registry tags) before building.
    #[facet(default)]
    pub force: bool,
    #[facet(default)]
    pub source: SourceConfig,
    #[facet(default)]
    pub vm: VmConfig,
    #[facet(default)]
    pub display: DisplayConfig,
    #[facet(default)]
    pub port_forwarding: Vec<PortForwardingConfig>,
    #[facet(default)]
    pub registry: RegistryConfig,
    pub push: Option<PushConfig>,
    #[facet(default)]
    pub provision: ProvisionConfig,
    #[facet(default)]
    pub advanced: AdvancedConfig,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct SourceConfig {
    /// Installer `.app`, `.ipsw`, or a version for the tool to download.
    #[facet(default)]
    pub installer: String,
    /// Existing VM or registry template to clone.
    #[facet(default)]
    pub vm_name: String,
    #[facet(default)]
    pub tag: String,
    /// Pull from the registry even when the source exists locally.
    #[facet(default)]
    pub always_fetch: bool,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct VmConfig {
    #[facet(default)]
    pub name: String,
    #[facet(default)]
    pub disk_size: String,
    #[facet(default)]
    pub ram_size: String,
    pub cpu_count: Option<u32>,
    #[facet(default)]
    pub hw_uuid: String,
    #[facet(default = "10s")]
    pub boot_delay: String,
    #[facet(default)]
    pub stop_vm: bool,
    #[facet(default)]
    pub update_addons: bool,
    #[facet(default)]
    pub use_anka_cp: bool,
    #[facet(default)]
    pub enable_htt: bool,
    #[facet(default)]
    pub disable_htt: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            disk_size: String::new(),
            ram_size: String::new(),
            cpu_count: None,
            hw_uuid: String::new(),
            boot_delay: DEFAULT_BOOT_DELAY.into(),
            stop_vm: false,
            update_addons: false,
            use_anka_cp: false,
            enable_htt: false,
            disable_htt: false,
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct DisplayConfig {
    #[facet(default)]
    pub controller: String,
    /// `WIDTHxHEIGHT`, e.g. `1920x1080`.
    #[facet(default)]
    pub resolution: String,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct PortForwardingConfig {
    pub guest_port: u16,
    /// 0 lets the tool pick a free port.
    #[facet(default)]
    pub host_port: u16,
    #[facet(default)]
    pub rule_name: String,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct RegistryConfig {
    #[facet(default)]
    pub remote: String,
    #[facet(default)]
    pub url: String,
    #[facet(default)]
    pub cert: String,
    #[facet(default)]
    pub key: String,
    #[facet(default)]
    pub cacert: String,
    #[facet(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct PushConfig {
    #[facet(default)]
    pub tag: String,
    #[facet(default)]
    pub description: String,
    /// Template name on the registry; defaults to the built VM name.
    #[facet(default)]
    pub remote_vm: String,
    #[facet(default)]
    pub local: bool,
    /// Revert an existing template of the same name before pushing.
    #[facet(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct ProvisionConfig {
    #[facet(default)]
    pub files: Vec<FileConfig>,
    /// Shell commands run inside the guest, in order.
    #[facet(default)]
    pub inline: Vec<String>,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct FileConfig {
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct AdvancedConfig {
    #[facet(default = "anka")]
    pub tool: String,
    /// Overrides the detected host architecture.
    #[facet(default)]
    pub host_arch: String,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            tool: "anka".into(),
            host_arch: String::new(),
        }
    }
}

// ── Resolved config ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderKind {
    /// Build a fresh VM from an installer.
    Create,
    /// Clone an existing (or registry-fetched) VM.
    Clone,
}

/// Desired sizing; `None` leaves the current value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceTarget {
    pub disk_size: Option<String>,
    pub ram_size: Option<String>,
    pub cpu_count: Option<u32>,
}

/// Desired port-forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRule {
    pub guest_port: u16,
    pub host_port: u16,
    pub rule_name: String,
}

/// Desired network, identity and display properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyTarget {
    pub port_rules: Vec<PortRule>,
    pub hw_uuid: Option<String>,
    pub display_controller: Option<String>,
    pub display_resolution: Option<String>,
}

impl PropertyTarget {
    pub fn is_empty(&self) -> bool {
        self.port_rules.is_empty()
            && self.hw_uuid.is_none()
            && self.display_controller.is_none()
            && self.display_resolution.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct PushSettings {
    pub tag: String,
    pub description: Option<String>,
    pub remote_vm: Option<String>,
    pub local: bool,
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct ProvisionFile {
    pub source: PathBuf,
    pub destination: String,
}

/// Everything a build needs, validated and typed.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub kind: BuilderKind,
    pub force: bool,
    pub installer: Option<String>,
    pub source_vm: Option<String>,
    pub source_tag: String,
    pub always_fetch: bool,
    pub vm_name: Option<String>,
    pub resources: ResourceTarget,
    pub properties: PropertyTarget,
    pub boot_delay: Duration,
    pub stop_vm: bool,
    pub update_addons: bool,
    pub use_anka_cp: bool,
    /// `Some(true)` enables hyper-threading, `Some(false)` disables it.
    pub hyperthreading: Option<bool>,
    pub registry: RegistryParams,
    pub push: Option<PushSettings>,
    pub provision_files: Vec<ProvisionFile>,
    pub provision_inline: Vec<String>,
    pub tool: String,
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn builder_kind(config: &Config) -> Result<BuilderKind, ProvisionError> {
    let installer = !config.source.installer.trim().is_empty();
    let source = !config.source.vm_name.trim().is_empty();

    match config.builder.trim() {
        "create" => {
            if !installer {
                return Err(ProvisionError::Validation {
                    message: "builder 'create' requires source.installer".into(),
                });
            }
            Ok(BuilderKind::Create)
        }
        "clone" => {
            if !source {
                return Err(ProvisionError::Validation {
                    message: "builder 'clone' requires source.vm_name".into(),
                });
            }
            if installer {
                return Err(ProvisionError::Validation {
                    message: "source.installer and source.vm_name are mutually exclusive for 'clone'"
                        .into(),
                });
            }
            Ok(BuilderKind::Clone)
        }
        "" => match (installer, source) {
            (true, false) => Ok(BuilderKind::Create),
            (false, true) => Ok(BuilderKind::Clone),
            (true, true) => Err(ProvisionError::Validation {
                message: "set either source.installer or source.vm_name, not both".into(),
            }),
            (false, false) => Err(ProvisionError::Validation {
                message: "source.installer or source.vm_name must be specified".into(),
            }),
        },
        other => Err(ProvisionError::Validation {
            message: format!("unknown builder '{other}' (expected 'create' or 'clone')"),
        }),
    }
}

pub fn validate_config(config: &Config) -> Result<(), ProvisionError> {
    builder_kind(config)?;

    if let Some(disk) = non_empty(&config.vm.disk_size) {
        util::disk_size_to_bytes(&disk)?;
    }
    if let Some(delay) = non_empty(&config.vm.boot_delay) {
        util::parse_duration(&delay)?;
    }

    if config.vm.enable_htt && config.vm.disable_htt {
        return Err(ProvisionError::Invariant {
            reason: "vm.enable_htt and vm.disable_htt cannot both be set".into(),
        });
    }

    for (idx, rule) in config.port_forwarding.iter().enumerate() {
        if rule.guest_port == 0 {
            return Err(ProvisionError::Validation {
                message: format!("port_forwarding[{idx}]: guest_port is required"),
            });
        }
    }

    if let Some(res) = non_empty(&config.display.resolution) {
        let valid = res
            .split_once('x')
            .is_some_and(|(w, h)| w.parse::<u32>().is_ok() && h.parse::<u32>().is_ok());
        if !valid {
            return Err(ProvisionError::Validation {
                message: format!("display.resolution must look like 1920x1080 (got '{res}')"),
            });
        }
    }

    for (idx, file) in config.provision.files.iter().enumerate() {
        if file.source.is_empty() || file.destination.is_empty() {
            return Err(ProvisionError::Validation {
                message: format!("provision.files[{idx}]: source and destination are required"),
            });
        }
    }

    if config.advanced.tool.trim().is_empty() {
        return Err(ProvisionError::Validation {
            message: "advanced.tool cannot be empty".into(),
        });
    }

    Ok(())
}

/// Turn a validated [`Config`] into a [`BuildConfig`].
///
/// `base_dir` anchors relative provisioning file paths.
pub fn resolve(
    config: Config,
    base_dir: &Path,
    names: &mut dyn NameSource,
) -> Result<BuildConfig, ProvisionError> {
    validate_config(&config)?;
    let kind = builder_kind(&config)?;

    let boot_delay = match non_empty(&config.vm.boot_delay) {
        Some(delay) => util::parse_duration(&delay)?,
        None => util::parse_duration(DEFAULT_BOOT_DELAY)?,
    };

    let port_rules = config
        .port_forwarding
        .iter()
        .map(|rule| PortRule {
            guest_port: rule.guest_port,
            host_port: rule.host_port,
            rule_name: non_empty(&rule.rule_name)
                .unwrap_or_else(|| names.random_seq(RULE_NAME_LEN)),
        })
        .collect();

    let hyperthreading = match (config.vm.enable_htt, config.vm.disable_htt) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    };

    let host_arch = non_empty(&config.advanced.host_arch)
        .unwrap_or_else(|| std::env::consts::ARCH.to_string());

    let registry = RegistryParams {
        remote: non_empty(&config.registry.remote),
        url: non_empty(&config.registry.url),
        cert: non_empty(&config.registry.cert),
        key: non_empty(&config.registry.key),
        cacert: non_empty(&config.registry.cacert),
        insecure: config.registry.insecure,
        host_arch,
    };

    let push = config.push.as_ref().map(|p| PushSettings {
        tag: non_empty(&p.tag).unwrap_or_else(|| DEFAULT_TAG.to_string()),
        description: non_empty(&p.description),
        remote_vm: non_empty(&p.remote_vm),
        local: p.local,
        force: p.force || config.force,
    });

    let provision_files = config
        .provision
        .files
        .iter()
        .map(|f| {
            let p = Path::new(&f.source);
            ProvisionFile {
                source: if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    base_dir.join(p)
                },
                destination: f.destination.clone(),
            }
        })
        .collect();

    Ok(BuildConfig {
        kind,
        force: config.force,
        installer: non_empty(&config.source.installer),
        source_vm: non_empty(&config.source.vm_name),
        source_tag: non_empty(&config.source.tag).unwrap_or_else(|| DEFAULT_TAG.to_string()),
        always_fetch: config.source.always_fetch,
        vm_name: non_empty(&config.vm.name),
        resources: ResourceTarget {
            disk_size: non_empty(&config.vm.disk_size),
            ram_size: non_empty(&config.vm.ram_size),
            cpu_count: config.vm.cpu_count,
        },
        properties: PropertyTarget {
            port_rules,
            hw_uuid: non_empty(&config.vm.hw_uuid),
            display_controller: non_empty(&config.display.controller),
            display_resolution: non_empty(&config.display.resolution),
        },
        boot_delay,
        stop_vm: config.vm.stop_vm,
        update_addons: config.vm.update_addons,
        use_anka_cp: config.vm.use_anka_cp,
        hyperthreading,
        registry,
        push,
        provision_files,
        provision_inline: config.provision.inline.clone(),
        tool: config.advanced.tool.trim().to_string(),
    })
}

pub fn parse_config(contents: &str, path: &Path) -> Result<Config, ProvisionError> {
    facet_toml::from_str(contents).map_err(|e| ProvisionError::ConfigParse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

pub fn load_config(path: &Path) -> Result<BuildConfig, ProvisionError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ProvisionError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config = parse_config(&contents, path)?;
    let base_dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    resolve(config, &base_dir, &mut RandomNames::new())
}

/// The anka binary named by the config at `path`, for commands that only
/// talk to the tool. The rest of the config is not validated, and a missing
/// file means the default tool.
pub fn load_tool(path: &Path) -> Result<String, ProvisionError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(AdvancedConfig::default().tool);
        }
        Err(source) => {
            return Err(ProvisionError::ConfigLoad {
                path: path.display().to_string(),
                source,
            });
        }
    };
    Ok(parse_config(&contents, path)?.advanced.tool)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::util::FixedNames;

    fn parse(toml: &str) -> Config {
        parse_config(toml, Path::new("anka.toml")).unwrap()
    }

    fn resolve_str(toml: &str) -> Result<BuildConfig, ProvisionError> {
        resolve(parse(toml), Path::new("/work"), &mut FixedNames("abc"))
    }

    #[test]
    fn clone_builder_inferred_from_source() {
        let cfg = resolve_str(
            r#"
[source]
vm_name = "macos-14-base"
"#,
        )
        .unwrap();
        assert_eq!(cfg.kind, BuilderKind::Clone);
        assert_eq!(cfg.source_vm.as_deref(), Some("macos-14-base"));
        assert_eq!(cfg.source_tag, "latest");
        assert_eq!(cfg.boot_delay, Duration::from_secs(10));
        assert_eq!(cfg.tool, "anka");
        assert!(cfg.push.is_none());
    }

    #[test]
    fn create_builder_with_resources() {
        let cfg = resolve_str(
            r#"
[source]
installer = "/Applications/Install macOS Sonoma.app"

[vm]
disk_size = "80G"
ram_size = "8G"
cpu_count = 4
boot_delay = "1m30s"
"#,
        )
        .unwrap();
        assert_eq!(cfg.kind, BuilderKind::Create);
        assert_eq!(
            cfg.resources,
            ResourceTarget {
                disk_size: Some("80G".into()),
                ram_size: Some("8G".into()),
                cpu_count: Some(4),
            }
        );
        assert_eq!(cfg.boot_delay, Duration::from_secs(90));
    }

    #[test]
    fn neither_installer_nor_source_rejected() {
        let err = resolve_str("force = true\n").unwrap_err();
        assert!(err.to_string().contains("must be specified"));
    }

    #[test]
    fn both_installer_and_source_rejected() {
        assert!(
            resolve_str(
                r#"
builder = "clone"
[source]
installer = "latest"
vm_name = "base"
"#
            )
            .is_err()
        );
        assert!(
            resolve_str(
                r#"
[source]
installer = "latest"
vm_name = "base"
"#
            )
            .is_err()
        );
    }

    #[test]
    fn explicit_create_requires_installer() {
        let err = resolve_str(
            r#"
builder = "create"
[source]
vm_name = "base"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("requires source.installer"));
    }

    #[test]
    fn unknown_builder_rejected() {
        let err = resolve_str(
            r#"
builder = "vagrant"
[source]
vm_name = "base"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown builder"));
    }

    #[test]
    fn malformed_disk_size_rejected() {
        let err = resolve_str(
            r#"
[source]
vm_name = "base"
[vm]
disk_size = "80GB"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProvisionError::Validation { .. }));
    }

    #[test]
    fn conflicting_htt_flags_rejected() {
        let err = resolve_str(
            r#"
[source]
vm_name = "base"
[vm]
enable_htt = true
disable_htt = true
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProvisionError::Invariant { .. }));
    }

    #[test]
    fn hyperthreading_flag_resolves() {
        let cfg = resolve_str(
            r#"
[source]
vm_name = "base"
[vm]
disable_htt = true
"#,
        )
        .unwrap();
        assert_eq!(cfg.hyperthreading, Some(false));
    }

    #[test]
    fn port_rules_get_generated_names() {
        let cfg = resolve_str(
            r#"
[source]
vm_name = "base"

[[port_forwarding]]
guest_port = 8080
host_port = 80
rule_name = "web"

[[port_forwarding]]
guest_port = 9090
"#,
        )
        .unwrap();
        assert_eq!(
            cfg.properties.port_rules,
            vec![
                PortRule {
                    guest_port: 8080,
                    host_port: 80,
                    rule_name: "web".into()
                },
                PortRule {
                    guest_port: 9090,
                    host_port: 0,
                    rule_name: "abcabcabca".into()
                },
            ]
        );
    }

    #[test]
    fn zero_guest_port_rejected() {
        let err = resolve_str(
            r#"
[source]
vm_name = "base"
[[port_forwarding]]
host_port = 80
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("guest_port is required"));
    }

    #[test]
    fn bad_resolution_rejected() {
        assert!(
            resolve_str(
                r#"
[source]
vm_name = "base"
[display]
resolution = "full-hd"
"#
            )
            .is_err()
        );
    }

    #[test]
    fn push_section_defaults_tag_and_inherits_force() {
        let cfg = resolve_str(
            r#"
force = true
[source]
vm_name = "base"
[push]
description = "nightly"
"#,
        )
        .unwrap();
        let push = cfg.push.unwrap();
        assert_eq!(push.tag, "latest");
        assert!(push.force);
        assert_eq!(push.description.as_deref(), Some("nightly"));
    }

    #[test]
    fn provision_files_resolve_relative_to_config() {
        let cfg = resolve_str(
            r#"
[source]
vm_name = "base"
[provision]
inline = ["brew --version"]

[[provision.files]]
source = "scripts/setup.sh"
destination = "/tmp/setup.sh"
"#,
        )
        .unwrap();
        assert_eq!(cfg.provision_files[0].source, PathBuf::from("/work/scripts/setup.sh"));
        assert_eq!(cfg.provision_inline, vec!["brew --version"]);
    }

    #[test]
    fn registry_connection_flags() {
        let cfg = resolve_str(
            r#"
[source]
vm_name = "base"
[registry]
url = "https://registry.local"
insecure = true
[advanced]
host_arch = "arm64"
"#,
        )
        .unwrap();
        assert_eq!(cfg.registry.url.as_deref(), Some("https://registry.local"));
        assert!(cfg.registry.insecure);
        assert_eq!(cfg.registry.host_arch, "arm64");
        assert!(cfg.registry.remote.is_none());
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/anka.toml")).unwrap_err();
        assert!(matches!(err, ProvisionError::ConfigLoad { .. }));
    }

    #[test]
    fn load_tool_skips_build_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anka.toml");
        std::fs::write(&path, "[advanced]\ntool = \"/opt/anka\"\n").unwrap();
        assert_eq!(load_tool(&path).unwrap(), "/opt/anka");
        assert_eq!(load_tool(&dir.path().join("missing.toml")).unwrap(), "anka");
    }
}
