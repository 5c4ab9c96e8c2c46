//! Build a fresh VM from an installer.

use tokio::sync::mpsc;

use super::converge::converge_properties;
use super::{BuildContext, Step, StepFuture, remove_failed_vm};
use crate::anka::{CreateParams, Runner};
use crate::error::ProvisionError;
use crate::installer;
use crate::vm_state::BuildState;

const NAME: &str = "create_vm";
const PROGRESS_BUFFER: usize = 32;

#[derive(Default)]
pub struct CreateVmStep {
    vm_name: Option<String>,
}

impl CreateVmStep {
    pub fn new() -> Self {
        Self::default()
    }

    async fn execute<R: Runner>(&mut self, ctx: &mut BuildContext<R>) -> Result<(), ProvisionError> {
        let installer = ctx
            .config
            .installer
            .clone()
            .ok_or_else(|| ProvisionError::Validation {
                message: "the create builder needs source.installer".into(),
            })?;

        // derived names are stable per installer so reruns hit the same VM
        let name = match &ctx.config.vm_name {
            Some(name) => name.clone(),
            None => {
                ctx.ui
                    .say(&format!("Extracting version from installer {installer}"));
                installer::derive_vm_name(&installer).await?
            }
        };
        self.vm_name = Some(name.clone());
        ctx.vm_name = Some(name.clone());

        if ctx.config.force && ctx.client.exists(&name).await? {
            ctx.ui
                .say(&format!("Deleting existing virtual machine {name}"));
            ctx.client.delete(&name).await?;
        }

        ctx.ui.say(&format!(
            "Creating a new VM {name} from installer, this will take a while"
        ));

        let params = CreateParams {
            name: name.clone(),
            installer,
            disk_size: ctx.config.resources.disk_size.clone(),
            ram_size: ctx.config.resources.ram_size.clone(),
            cpu_count: ctx.config.resources.cpu_count,
        };

        let (tx, mut rx) = mpsc::channel::<String>(PROGRESS_BUFFER);
        let client = &ctx.client;
        let ui = ctx.ui.clone();
        let create = async move {
            let result = client.create(&params, &tx).await;
            drop(tx);
            result
        };
        let relay = async {
            while let Some(line) = rx.recv().await {
                ui.progress(&line);
            }
        };
        let (created, ()) = tokio::join!(create, relay);
        let uuid = created?;

        ctx.ui.say(&format!("VM {name} was created ({uuid})"));
        ctx.advance(NAME, BuildState::Created)?;

        // sizes went to `create`, only properties are left
        let shown = ctx.client.show(&name).await?;
        tracing::debug!(vm = %name, hard_drive = shown.hard_drive, ram = %shown.ram, "created vm");
        converge_properties(ctx, &name).await?;
        ctx.advance(NAME, BuildState::PropertiesConverged)?;
        Ok(())
    }
}

impl<R: Runner> Step<R> for CreateVmStep {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext<R>) -> StepFuture<'a, Result<(), ProvisionError>> {
        Box::pin(self.execute(ctx))
    }

    fn cleanup<'a>(&'a mut self, ctx: &'a mut BuildContext<R>) -> StepFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!("cleaning up create vm step");
            if let Some(name) = self.vm_name.clone() {
                remove_failed_vm(ctx, &name).await;
            }
        })
    }
}
