use std::path::PathBuf;

/// Environment override for where per-build temp directories go.
pub const TMP_DIR_ENV: &str = "ANKA_PROVISION_TMP_DIR";

/// Data directory: `~/.local/share/anka-provision/`
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("anka-provision")
}

/// Build logs: `~/.local/share/anka-provision/logs/`
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Parent of per-build temp directories. `ANKA_PROVISION_TMP_DIR` wins,
/// then the system temp dir.
pub fn tmp_base() -> PathBuf {
    match std::env::var_os(TMP_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir(),
    }
}
