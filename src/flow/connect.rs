use super::{BuildContext, Step, StepFuture};
use crate::anka::Runner;
use crate::communicator::Communicator;
use crate::error::ProvisionError;

/// Attach a [`Communicator`] for the target VM, staging through the build
/// temp dir.
#[derive(Default)]
pub struct ConnectStep;

impl ConnectStep {
    pub fn new() -> Self {
        Self
    }
}

fn connect<R: Runner>(ctx: &mut BuildContext<R>) -> Result<(), ProvisionError> {
    let name = ctx.vm_name()?.to_string();
    let host_dir = ctx.temp_dir.clone().ok_or_else(|| ProvisionError::Invariant {
        reason: "no build temp dir to share with the guest".into(),
    })?;
    tracing::debug!(vm = %name, host_dir = %host_dir.display(), use_cp = ctx.config.use_anka_cp, "connecting");
    ctx.communicator = Some(Communicator::new(name, host_dir, ctx.config.use_anka_cp));
    Ok(())
}

impl<R: Runner> Step<R> for ConnectStep {
    fn name(&self) -> &'static str {
        "connect"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext<R>) -> StepFuture<'a, Result<(), ProvisionError>> {
        Box::pin(async move { connect(ctx) })
    }

    fn cleanup<'a>(&'a mut self, ctx: &'a mut BuildContext<R>) -> StepFuture<'a, ()> {
        Box::pin(async move {
            ctx.communicator = None;
        })
    }
}
