//! Command execution and file transfer in the guest, on top of `anka run`
//! and `anka cp`.
//!
//! Without `anka cp` files are staged in the build temp dir, which
//! `run --volume` mounts as the guest working directory, and moved with an
//! in-guest `cp`. That needs the shared-folder kernel extension in the guest;
//! when it is missing the communicator falls back to `anka cp`.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWrite;
use walkdir::WalkDir;

use crate::anka::{RunParams, Runner, VmClient};
use crate::error::ProvisionError;

const FUSE_CHECK: &str = "kextstat | grep -q com.veertu.filesystems.vtufs";

pub struct Communicator {
    vm_name: String,
    host_dir: PathBuf,
    use_cp: bool,
    fuse_checked: bool,
    staged: u32,
}

impl Communicator {
    pub fn new(vm_name: impl Into<String>, host_dir: impl Into<PathBuf>, use_cp: bool) -> Self {
        Self {
            vm_name: vm_name.into(),
            host_dir: host_dir.into(),
            use_cp,
            fuse_checked: false,
            staged: 0,
        }
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn uses_cp(&self) -> bool {
        self.use_cp
    }

    /// Run `command` through `bash -c` in the guest. Returns the exit code.
    pub async fn start<R: Runner>(
        &self,
        client: &VmClient<R>,
        command: &str,
        stdout: impl AsyncWrite + Send + Unpin + 'static,
        stderr: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Result<i32, ProvisionError> {
        tracing::info!(vm = %self.vm_name, command, "guest command");
        let params = RunParams::new(&self.vm_name, bash(command))
            .stdout(stdout)
            .stderr(stderr);
        client.run(params).await
    }

    pub async fn upload<R: Runner>(
        &mut self,
        client: &VmClient<R>,
        src: &Path,
        dst: &str,
    ) -> Result<(), ProvisionError> {
        tracing::info!(src = %src.display(), dst, "uploading file to vm");
        self.configure_cp(client).await?;

        if self.use_cp {
            return client.copy(&src.display().to_string(), &self.guest_path(dst)).await;
        }

        let staged = self.stage_name("upload");
        let host_path = self.host_dir.join(&staged);
        tokio::fs::copy(src, &host_path)
            .await
            .map_err(|source| ProvisionError::Io {
                context: format!("staging {}", src.display()),
                source,
            })?;

        let result = self
            .run_in_volume(client, vec!["cp".into(), staged.clone(), dst.into()])
            .await;
        let _ = tokio::fs::remove_file(&host_path).await;
        result
    }

    /// Upload a directory. Like `cp -R`, a `src` without a trailing slash
    /// lands in `dst/<basename>`.
    pub async fn upload_dir<R: Runner>(
        &mut self,
        client: &VmClient<R>,
        src: &Path,
        dst: &str,
    ) -> Result<(), ProvisionError> {
        tracing::info!(src = %src.display(), dst, "uploading directory to vm");
        self.configure_cp(client).await?;

        if self.use_cp {
            return client.copy(&src.display().to_string(), &self.guest_path(dst)).await;
        }

        let staged = self.stage_name("dirupload");
        let host_path = self.host_dir.join(&staged);
        let (from, to) = (src.to_path_buf(), host_path.clone());
        tokio::task::spawn_blocking(move || copy_tree(&from, &to))
            .await
            .map_err(|e| ProvisionError::Io {
                context: "staging directory".into(),
                source: std::io::Error::other(e),
            })?
            .map_err(|source| ProvisionError::Io {
                context: format!("staging {}", src.display()),
                source,
            })?;

        let target = guest_dir_target(src, dst);
        let target = shell_escape::escape(target.into());
        // `/.` copies dotfiles too
        let from = shell_escape::escape(format!("{staged}/.").into());
        let script = format!("set -e; mkdir -p {target}; command cp -R {from} {target}");
        let result = self.run_in_volume(client, bash(&script)).await;
        let _ = tokio::fs::remove_dir_all(&host_path).await;
        result
    }

    pub async fn download<R: Runner>(
        &mut self,
        client: &VmClient<R>,
        src: &str,
        dst: &Path,
    ) -> Result<(), ProvisionError> {
        tracing::info!(src, dst = %dst.display(), "downloading file from vm");
        self.configure_cp(client).await?;

        if self.use_cp {
            return client.copy(&self.guest_path(src), &dst.display().to_string()).await;
        }

        let staged = self.stage_name("download");
        let host_path = self.host_dir.join(&staged);
        self.run_in_volume(client, vec!["cp".into(), src.into(), format!("./{staged}")])
            .await?;
        let copied = tokio::fs::copy(&host_path, dst).await;
        let _ = tokio::fs::remove_file(&host_path).await;
        copied.map_err(|source| ProvisionError::Io {
            context: format!("copying download to {}", dst.display()),
            source,
        })?;
        Ok(())
    }

    /// Directory download is only available through `anka cp`.
    pub async fn download_dir<R: Runner>(
        &mut self,
        client: &VmClient<R>,
        src: &str,
        dst: &Path,
    ) -> Result<(), ProvisionError> {
        self.configure_cp(client).await?;
        if !self.use_cp {
            return Err(ProvisionError::Validation {
                message: "downloading directories requires vm.use_anka_cp".into(),
            });
        }
        client.copy(&self.guest_path(src), &dst.display().to_string()).await
    }

    async fn configure_cp<R: Runner>(&mut self, client: &VmClient<R>) -> Result<(), ProvisionError> {
        if self.use_cp || self.fuse_checked {
            return Ok(());
        }
        self.fuse_checked = true;

        let params = RunParams::new(&self.vm_name, bash(FUSE_CHECK))
            .stdout(tokio::io::sink())
            .stderr(tokio::io::sink());
        if client.run(params).await? != 0 {
            tracing::info!(vm = %self.vm_name, "shared folders unavailable, using anka cp");
            self.use_cp = true;
        }
        Ok(())
    }

    async fn run_in_volume<R: Runner>(
        &self,
        client: &VmClient<R>,
        command: Vec<String>,
    ) -> Result<(), ProvisionError> {
        let line = command.join(" ");
        let code = client
            .run(RunParams::new(&self.vm_name, command).volume(&self.host_dir))
            .await?;
        if code != 0 {
            return Err(ProvisionError::GuestCommand {
                command: line,
                exit_code: code,
            });
        }
        Ok(())
    }

    fn guest_path(&self, path: &str) -> String {
        format!("{}:{path}", self.vm_name)
    }

    fn stage_name(&mut self, prefix: &str) -> String {
        self.staged += 1;
        format!("{prefix}-{}", self.staged)
    }
}

fn bash(script: &str) -> Vec<String> {
    vec!["bash".into(), "-c".into(), script.into()]
}

fn guest_dir_target(src: &Path, dst: &str) -> String {
    let src_str = src.to_string_lossy();
    match src.file_name() {
        Some(base) if !src_str.ends_with('/') => {
            format!("{}/{}", dst.trim_end_matches('/'), base.to_string_lossy())
        }
        _ => dst.to_string(),
    }
}

/// Recursive copy preserving symlinks.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dst.join(relative);
        let kind = entry.file_type();
        if kind.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if kind.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(link, &target)?;
            #[cfg(not(unix))]
            {
                let _ = link;
                std::fs::copy(entry.path(), &target)?;
            }
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
