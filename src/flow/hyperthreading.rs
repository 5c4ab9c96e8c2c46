use super::{BuildContext, Step, StepFuture};
use crate::anka::Runner;
use crate::error::ProvisionError;

#[derive(Default)]
pub struct HyperthreadingStep;

impl HyperthreadingStep {
    pub fn new() -> Self {
        Self
    }
}

/// Enable or disable hyper-threading. A running VM is stopped for the
/// change and started again afterwards.
async fn set_hyperthreading<R: Runner>(ctx: &mut BuildContext<R>) -> Result<(), ProvisionError> {
    let Some(enable) = ctx.config.hyperthreading else {
        tracing::debug!("hyper-threading not configured");
        return Ok(());
    };
    let name = ctx.vm_name()?.to_string();

    let described = ctx.client.describe(&name).await?;
    let enabled = described.cpu.threads > 0;
    if enabled == enable {
        tracing::info!(vm = %name, enabled, "hyper-threading already in desired state");
        return Ok(());
    }

    let shown = ctx.client.show(&name).await?;
    let restart = shown.is_running();
    if !shown.is_stopped() {
        ctx.client.stop(&name, true).await?;
    }

    let flag = if enable { "--htt" } else { "--no-htt" };
    ctx.ui.say(&format!(
        "{} hyper-threading on {name}",
        if enable { "Enabling" } else { "Disabling" }
    ));
    ctx.client.modify(&name, "set", "cpu", &[flag]).await?;

    if restart {
        ctx.client.start(&name).await?;
    }
    Ok(())
}

impl<R: Runner> Step<R> for HyperthreadingStep {
    fn name(&self) -> &'static str {
        "set_hyperthreading"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext<R>) -> StepFuture<'a, Result<(), ProvisionError>> {
        Box::pin(set_hyperthreading(ctx))
    }
}
