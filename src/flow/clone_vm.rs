//! Clone an existing (or registry-fetched) VM and converge the clone.

use super::converge::{converge_properties, converge_resources};
use super::{BuildContext, Step, StepFuture, remove_failed_vm};
use crate::anka::{PullParams, Runner};
use crate::error::ProvisionError;
use crate::vm_state::BuildState;

const NAME: &str = "clone_vm";
const SUFFIX_LEN: usize = 10;

#[derive(Default)]
pub struct CloneVmStep {
    vm_name: Option<String>,
}

impl CloneVmStep {
    pub fn new() -> Self {
        Self::default()
    }

    async fn execute<R: Runner>(&mut self, ctx: &mut BuildContext<R>) -> Result<(), ProvisionError> {
        let source = ctx
            .config
            .source_vm
            .clone()
            .ok_or_else(|| ProvisionError::Validation {
                message: "the clone builder needs source.vm_name".into(),
            })?;
        ctx.source_vm = Some(source.clone());

        let name = match &ctx.config.vm_name {
            Some(name) => name.clone(),
            None => format!("{source}-{}", ctx.names.random_seq(SUFFIX_LEN)),
        };
        self.vm_name = Some(name.clone());
        ctx.vm_name = Some(name.clone());

        if ctx.config.force && ctx.client.exists(&name).await? {
            ctx.ui
                .say(&format!("Deleting existing virtual machine {name}"));
            ctx.client.delete(&name).await?;
        }

        self.resolve_source(ctx, &source).await?;
        ctx.advance(NAME, BuildState::SourceResolved)?;

        let source_vm = ctx.client.show(&source).await?;
        if source_vm.is_running() {
            ctx.ui.say(&format!("Suspending VM {source}"));
            ctx.client.suspend(&source).await?;
        }
        ctx.advance(NAME, BuildState::SourceReady)?;

        ctx.ui.say(&format!(
            "Cloning source VM {} into a new virtual machine: {name}",
            source_vm.name
        ));
        ctx.client.clone_vm(&source_vm.uuid, &name).await?;
        ctx.advance(NAME, BuildState::Cloned)?;

        let cloned = ctx.client.show(&name).await?;
        converge_resources(ctx, &cloned).await?;
        ctx.advance(NAME, BuildState::ResourcesConverged)?;

        converge_properties(ctx, &name).await?;
        ctx.advance(NAME, BuildState::PropertiesConverged)?;

        if ctx.config.update_addons {
            ctx.ui.say(&format!("Updating guest addons for {name}"));
            ctx.client.update_addons(&name).await?;
        }
        Ok(())
    }

    /// Pull the source when asked to, or when it is not present locally.
    async fn resolve_source<R: Runner>(
        &self,
        ctx: &BuildContext<R>,
        source: &str,
    ) -> Result<(), ProvisionError> {
        let mut pull = ctx.config.always_fetch;
        if !pull {
            tracing::debug!(source, "searching for source locally");
            if !ctx.client.exists(source).await? {
                tracing::info!(source, "source not found locally, looking in the registry");
                pull = true;
            }
        }
        if !pull {
            return Ok(());
        }

        let tag = &ctx.config.source_tag;
        ctx.ui.say(&format!(
            "Pulling source VM {source} with tag {tag} from Anka Registry"
        ));
        let params = PullParams {
            vm_id: source.to_string(),
            tag: Some(tag.clone()),
            local: false,
            shrink: false,
        };
        ctx.client
            .registry_pull(&ctx.config.registry, &params)
            .await
            .map_err(|e| ProvisionError::Registry {
                message: format!("failed to pull vm {source} with tag {tag} from registry: {e}"),
            })
    }
}

impl<R: Runner> Step<R> for CloneVmStep {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext<R>) -> StepFuture<'a, Result<(), ProvisionError>> {
        Box::pin(self.execute(ctx))
    }

    fn cleanup<'a>(&'a mut self, ctx: &'a mut BuildContext<R>) -> StepFuture<'a, ()> {
        Box::pin(async move {
            tracing::debug!("cleaning up clone vm step");
            if let Some(name) = self.vm_name.clone() {
                remove_failed_vm(ctx, &name).await;
            }
        })
    }
}
