use std::path::PathBuf;

use tokio::sync::mpsc;

use super::protocol::Envelope;
use super::runner::{RunParams, Runner, SharedBuffer};
use super::types::{CreateResponse, ExtendedDescriptor, LicenseInfo, VersionInfo, VmDescriptor};
use crate::error::ProvisionError;
use crate::vm_state::StopPlan;

/// Parameters for `anka create`. Blank sizes are left to the tool, which
/// picks defaults from the host.
#[derive(Debug, Clone, Default)]
pub struct CreateParams {
    pub name: String,
    pub installer: String,
    pub disk_size: Option<String>,
    pub ram_size: Option<String>,
    pub cpu_count: Option<u32>,
}

impl CreateParams {
    fn args(&self) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--app".into(), self.installer.clone()];
        if let Some(disk) = &self.disk_size {
            args.extend(["--disk-size".into(), disk.clone()]);
        }
        if let Some(ram) = &self.ram_size {
            args.extend(["--ram-size".into(), ram.clone()]);
        }
        if let Some(cpu) = self.cpu_count {
            args.extend(["--cpu-count".into(), cpu.to_string()]);
        }
        args.push(self.name.clone());
        args
    }
}

/// Typed facade over the anka CLI. One method per subcommand.
pub struct VmClient<R> {
    runner: R,
}

impl<R: Runner> VmClient<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub(crate) async fn call<I, S>(&self, args: I) -> Result<Envelope, ProvisionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        self.runner.invoke(&args, None).await
    }

    pub async fn version(&self) -> Result<VersionInfo, ProvisionError> {
        self.call(["version"]).await?.body()
    }

    pub async fn license(&self) -> Result<LicenseInfo, ProvisionError> {
        self.call(["license", "show"]).await?.body()
    }

    /// Create a VM from an installer, streaming progress. Returns its UUID.
    pub async fn create(
        &self,
        params: &CreateParams,
        progress: &mpsc::Sender<String>,
    ) -> Result<String, ProvisionError> {
        let envelope = self
            .runner
            .invoke(&params.args(), Some(progress))
            .await
            .map_err(|e| e.classify(&params.name))?;
        let created: CreateResponse = envelope.body()?;
        tracing::info!(vm = %params.name, uuid = %created.uuid, "vm created");
        Ok(created.uuid)
    }

    pub async fn clone_vm(&self, source_uuid: &str, target: &str) -> Result<(), ProvisionError> {
        self.call(["clone", source_uuid, target])
            .await
            .map_err(|e| e.classify(target))?;
        Ok(())
    }

    pub async fn show(&self, name: &str) -> Result<VmDescriptor, ProvisionError> {
        self.call(["show", name])
            .await
            .map_err(|e| e.classify_not_found(name))?
            .body()
    }

    pub async fn describe(&self, name: &str) -> Result<ExtendedDescriptor, ProvisionError> {
        self.call(["describe", name])
            .await
            .map_err(|e| e.classify_not_found(name))?
            .body()
    }

    pub async fn exists(&self, name: &str) -> Result<bool, ProvisionError> {
        match self.show(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// `anka modify <vm> <command> <property> <flags...>`
    pub async fn modify(
        &self,
        name: &str,
        command: &str,
        property: &str,
        flags: &[&str],
    ) -> Result<(), ProvisionError> {
        let mut args = vec!["modify", name, command, property];
        args.extend_from_slice(flags);
        self.call(args).await?;
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<(), ProvisionError> {
        self.call(["start", name]).await?;
        Ok(())
    }

    pub async fn update_addons(&self, name: &str) -> Result<(), ProvisionError> {
        self.call(["start", "--update-addons", name]).await?;
        Ok(())
    }

    pub async fn suspend(&self, name: &str) -> Result<(), ProvisionError> {
        self.call(["suspend", name]).await?;
        Ok(())
    }

    /// Stop a VM. A graceful stop of a suspended VM starts it first and
    /// waits for network and clock sync inside the guest.
    pub async fn stop(&self, name: &str, force: bool) -> Result<(), ProvisionError> {
        let plan = if force {
            StopPlan::Force
        } else {
            self.show(name).await?.status.stop_plan(false)
        };

        match plan {
            StopPlan::Force => {
                self.call(["stop", "--force", name]).await?;
            }
            StopPlan::Nothing => {
                tracing::debug!(vm = %name, "already stopped");
            }
            StopPlan::WakeThenStop => {
                tracing::info!(vm = %name, "vm is suspended, starting it before a graceful stop");
                self.start(name).await?;
                let code = self
                    .run(RunParams::new(name, vec!["true".into()]).wait_for_network())
                    .await?;
                if code != 0 {
                    tracing::warn!(vm = %name, exit_code = code, "waiting for guest sync failed");
                }
                self.call(["stop", name]).await?;
            }
            StopPlan::Graceful => {
                self.call(["stop", name]).await?;
            }
        }
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<(), ProvisionError> {
        self.call(["delete", "--yes", name]).await?;
        tracing::info!(vm = %name, "vm deleted");
        Ok(())
    }

    /// `anka cp -af <src> <dst>`, where either side may be `<vm>:<path>`.
    pub async fn copy(&self, src: &str, dst: &str) -> Result<(), ProvisionError> {
        self.call(["cp", "-af", src, dst]).await?;
        Ok(())
    }

    pub async fn run(&self, params: RunParams) -> Result<i32, ProvisionError> {
        self.runner.run(params).await
    }

    /// Run a command and capture its stdout.
    pub async fn run_output(
        &self,
        name: &str,
        command: &[&str],
        volume: Option<PathBuf>,
    ) -> Result<(i32, String), ProvisionError> {
        let out = SharedBuffer::new();
        let mut params = RunParams::new(name, command.iter().map(|s| s.to_string()).collect())
            .stdout(out.clone());
        params.volume = volume;
        let code = self.run(params).await?;
        Ok((code, out.contents()))
    }
}
