//! Installer metadata used to derive stable VM template names.
//!
//! A macOS installer comes either as an `Install macOS *.app` bundle, as a
//! restore `.ipsw` archive, or as a bare version (`latest`, `14.4`) that the
//! tool downloads on its own. The first two carry a property list with the
//! OS version and build, which makes repeated builds land on the same name.

use std::collections::BTreeMap;
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::error::ProvisionError;

pub const BASE_NAME_PREFIX: &str = "anka-base";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallerKind {
    App,
    Ipsw,
    Version,
}

impl InstallerKind {
    pub fn of(installer: &str) -> Self {
        let trimmed = installer.trim_end_matches('/');
        if trimmed.ends_with(".app") {
            InstallerKind::App
        } else if trimmed.ends_with(".ipsw") {
            InstallerKind::Ipsw
        } else {
            InstallerKind::Version
        }
    }
}

/// OS version and build extracted from an installer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerInfo {
    pub os_version: String,
    pub build: String,
}

impl InstallerInfo {
    pub fn template_name(&self) -> String {
        format!("{BASE_NAME_PREFIX}-{}-{}", self.os_version, self.build)
    }
}

/// Derive the VM name for a create build from the installer.
pub async fn derive_vm_name(installer: &str) -> Result<String, ProvisionError> {
    match InstallerKind::of(installer) {
        InstallerKind::App => Ok(read_app_info(Path::new(installer)).await?.template_name()),
        InstallerKind::Ipsw => Ok(read_ipsw_info(Path::new(installer)).await?.template_name()),
        InstallerKind::Version => Ok(format!("{BASE_NAME_PREFIX}-{installer}")),
    }
}

/// Read `Contents/Info.plist` of an installer app bundle.
pub async fn read_app_info(app: &Path) -> Result<InstallerInfo, ProvisionError> {
    let plist_path = app.join("Contents").join("Info.plist");
    let xml = tokio::fs::read_to_string(&plist_path)
        .await
        .map_err(|e| ProvisionError::Io {
            context: format!("reading {}", plist_path.display()),
            source: e,
        })?;
    let dict = plist_strings(&xml)?;
    Ok(InstallerInfo {
        os_version: required(&dict, "DTPlatformVersion", &plist_path)?,
        build: required(&dict, "CFBundleShortVersionString", &plist_path)?,
    })
}

/// Extract `SystemVersion.plist` from a restore image with `unzip -p`.
pub async fn read_ipsw_info(ipsw: &Path) -> Result<InstallerInfo, ProvisionError> {
    let output = tokio::process::Command::new("unzip")
        .arg("-p")
        .arg(ipsw)
        .arg("SystemVersion.plist")
        .output()
        .await
        .map_err(|e| ProvisionError::Io {
            context: "running unzip".into(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(ProvisionError::Transport {
            command: format!("unzip -p {} SystemVersion.plist", ipsw.display()),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let xml = String::from_utf8_lossy(&output.stdout);
    let dict = plist_strings(&xml)?;
    let origin = ipsw.join("SystemVersion.plist");
    Ok(InstallerInfo {
        os_version: required(&dict, "ProductVersion", &origin)?,
        build: required(&dict, "ProductBuildVersion", &origin)?,
    })
}

fn required(
    dict: &BTreeMap<String, String>,
    key: &str,
    origin: &Path,
) -> Result<String, ProvisionError> {
    dict.get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| ProvisionError::Validation {
            message: format!("{} has no {key}", origin.display()),
        })
}

/// Collect `<key>` → `<string>` pairs of the top-level plist dictionary.
///
/// Values of any other type (and everything nested deeper) are skipped.
pub fn plist_strings(xml: &str) -> Result<BTreeMap<String, String>, ProvisionError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut out = BTreeMap::new();
    let mut depth = 0usize;
    let mut current_tag = Vec::new();
    let mut pending_key: Option<String> = None;

    loop {
        let event = reader.read_event().map_err(|e| ProvisionError::Validation {
            message: format!("invalid plist at byte {}: {e}", reader.buffer_position()),
        })?;
        match event {
            Event::Start(e) => {
                depth += 1;
                current_tag = e.name().as_ref().to_vec();
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                current_tag.clear();
            }
            Event::Empty(e) => {
                // `<true/>` and friends still consume the pending key
                if depth == 2 && e.name().as_ref() != b"key" {
                    pending_key = None;
                }
            }
            Event::Text(t) if depth == 3 => {
                let text = t
                    .unescape()
                    .map_err(|e| ProvisionError::Validation {
                        message: format!("invalid plist text: {e}"),
                    })?
                    .into_owned();
                match current_tag.as_slice() {
                    b"key" => pending_key = Some(text),
                    b"string" => {
                        if let Some(key) = pending_key.take() {
                            out.insert(key, text);
                        }
                    }
                    _ => pending_key = None,
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(out)
}
