use super::{BuildContext, Step, StepFuture};
use crate::anka::Runner;
use crate::error::ProvisionError;
use crate::vm_state::BuildState;

const NAME: &str = "start_vm";

/// Start the target and wait out the boot delay. The guest gives no
/// readiness signal the host could poll.
#[derive(Default)]
pub struct StartVmStep;

impl StartVmStep {
    pub fn new() -> Self {
        Self
    }
}

async fn start<R: Runner>(ctx: &mut BuildContext<R>) -> Result<(), ProvisionError> {
    let name = ctx.vm_name()?.to_string();
    ctx.client.start(&name).await?;
    ctx.advance(NAME, BuildState::Started)?;

    let delay = ctx.config.boot_delay;
    if !delay.is_zero() {
        ctx.ui
            .say(&format!("Waiting for {delay:?} for clone to boot"));
        tokio::time::sleep(delay).await;
    }
    Ok(())
}

impl<R: Runner> Step<R> for StartVmStep {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext<R>) -> StepFuture<'a, Result<(), ProvisionError>> {
        Box::pin(start(ctx))
    }
}
