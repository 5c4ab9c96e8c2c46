//! Facts about the built guest, exposed on the artifact.

use super::{BuildContext, Step, StepFuture};
use crate::anka::Runner;
use crate::error::ProvisionError;

pub const VM_NAME: &str = "VMName";
pub const OS_VERSION: &str = "OSVersion";
pub const DARWIN_VERSION: &str = "DarwinVersion";

#[derive(Default)]
pub struct GeneratedDataStep;

impl GeneratedDataStep {
    pub fn new() -> Self {
        Self
    }
}

async fn guest_output<R: Runner>(
    ctx: &BuildContext<R>,
    name: &str,
    command: &[&str],
) -> Result<String, ProvisionError> {
    let (code, out) = ctx.client.run_output(name, command, None).await?;
    if code != 0 {
        return Err(ProvisionError::GuestCommand {
            command: command.join(" "),
            exit_code: code,
        });
    }
    Ok(out.trim().to_string())
}

async fn collect<R: Runner>(ctx: &mut BuildContext<R>) -> Result<(), ProvisionError> {
    let name = ctx.vm_name()?.to_string();

    let darwin = guest_output(ctx, &name, &["/usr/bin/uname", "-r"]).await?;
    let os = guest_output(ctx, &name, &["/usr/bin/sw_vers", "-productVersion"]).await?;
    tracing::info!(vm = %name, os = %os, darwin = %darwin, "guest versions");

    ctx.generated.insert(VM_NAME.into(), name);
    ctx.generated.insert(OS_VERSION.into(), os);
    ctx.generated.insert(DARWIN_VERSION.into(), darwin);
    Ok(())
}

impl<R: Runner> Step<R> for GeneratedDataStep {
    fn name(&self) -> &'static str {
        "generated_data"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext<R>) -> StepFuture<'a, Result<(), ProvisionError>> {
        Box::pin(collect(ctx))
    }
}
