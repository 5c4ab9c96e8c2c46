//! One complete build: the step pipeline for the configured builder kind,
//! then finalization of the VM into an [`Artifact`].

use tokio_util::sync::CancellationToken;

use crate::anka::types::DEVELOP_LICENSE;
use crate::anka::Runner;
use crate::artifact::Artifact;
use crate::config::BuilderKind;
use crate::error::ProvisionError;
use crate::flow::clone_vm::CloneVmStep;
use crate::flow::connect::ConnectStep;
use crate::flow::create_vm::CreateVmStep;
use crate::flow::generated_data::GeneratedDataStep;
use crate::flow::hyperthreading::HyperthreadingStep;
use crate::flow::provision::ProvisionStep;
use crate::flow::start_vm::StartVmStep;
use crate::flow::temp_dir::TempDirStep;
use crate::flow::{BuildContext, Step, run_steps};

/// Steps of a build, in execution order.
pub fn steps<R: Runner>(kind: BuilderKind, temp_dir: TempDirStep) -> Vec<Box<dyn Step<R>>> {
    let vm: Box<dyn Step<R>> = match kind {
        BuilderKind::Create => Box::new(CreateVmStep::new()),
        BuilderKind::Clone => Box::new(CloneVmStep::new()),
    };
    vec![
        Box::new(temp_dir),
        vm,
        Box::new(StartVmStep::new()),
        Box::new(HyperthreadingStep::new()),
        Box::new(ConnectStep::new()),
        Box::new(GeneratedDataStep::new()),
        Box::new(ProvisionStep::new()),
    ]
}

/// Run the pipeline and finalize.
pub async fn build<R: Runner>(
    ctx: &mut BuildContext<R>,
    cancel: &CancellationToken,
) -> Result<Artifact, ProvisionError> {
    build_with(ctx, steps(ctx.config.kind, TempDirStep::new()), cancel).await
}

pub async fn build_with<R: Runner>(
    ctx: &mut BuildContext<R>,
    mut steps: Vec<Box<dyn Step<R>>>,
    cancel: &CancellationToken,
) -> Result<Artifact, ProvisionError> {
    tracing::info!(kind = ?ctx.config.kind, steps = steps.len(), "build started");
    run_steps(&mut steps, ctx, cancel).await?;
    finalize(ctx).await
}

/// Park the VM and describe what was built. Develop licences cannot
/// suspend, so the VM is stopped instead.
async fn finalize<R: Runner>(ctx: &BuildContext<R>) -> Result<Artifact, ProvisionError> {
    let name = ctx.vm_name()?;
    let described = ctx.client.describe(name).await?;

    let mut stop_vm = ctx.config.stop_vm;
    let license = ctx.client.license().await?;
    if license.license_type == DEVELOP_LICENSE {
        tracing::info!(license = %license.license_type, "licence cannot suspend vms");
        stop_vm = true;
    }

    if stop_vm {
        ctx.ui.say(&format!("Stopping VM {name}"));
        ctx.client.stop(name, false).await?;
    } else {
        ctx.ui.say(&format!("Suspending VM {name}"));
        ctx.client.suspend(name).await?;
    }

    Ok(Artifact {
        vm_name: name.to_string(),
        uuid: described.uuid,
        generated: ctx.generated.clone(),
    })
}
