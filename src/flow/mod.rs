//! Step runner for one provisioning build.
//!
//! A build is an ordered list of [`Step`]s sharing a [`BuildContext`]. Steps
//! run strictly one after another. Cancellation is only observed between
//! steps. When a step halts, or the build is cancelled, no further step
//! runs, and the cleanup of every step that did run is called in reverse
//! order. Each cleanup decides for itself whether the halt matters.
//!
//! The context also tracks the [`BuildState`] machine; steps move it with
//! [`BuildContext::advance`], which rejects moves the graph does not allow.

pub mod clone_vm;
pub mod connect;
pub mod converge;
pub mod create_vm;
pub mod generated_data;
pub mod hyperthreading;
pub mod provision;
pub mod start_vm;
pub mod temp_dir;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::anka::{Runner, VmClient};
use crate::communicator::Communicator;
use crate::config::BuildConfig;
use crate::error::ProvisionError;
use crate::observer::{StepStatus, Transition, Ui};
use crate::util::NameSource;
use crate::vm_state::BuildState;

/// Boxed future returned by [`Step`] methods, so steps can be trait objects.
pub type StepFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    Halt,
}

pub trait Step<R: Runner> {
    fn name(&self) -> &'static str;

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext<R>)
    -> StepFuture<'a, Result<(), ProvisionError>>;

    /// Called after the build ends for every step whose `run` was entered.
    fn cleanup<'a>(&'a mut self, _ctx: &'a mut BuildContext<R>) -> StepFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// State shared by the steps of one build.
pub struct BuildContext<R> {
    pub config: BuildConfig,
    pub client: VmClient<R>,
    pub ui: Arc<dyn Ui>,
    pub names: Box<dyn NameSource + Send>,
    /// Where provisioning command logs go.
    pub logs_dir: Option<PathBuf>,
    /// Source template of a clone build.
    pub source_vm: Option<String>,
    /// Target VM. Recorded as soon as the name is known.
    pub vm_name: Option<String>,
    pub temp_dir: Option<PathBuf>,
    pub communicator: Option<Communicator>,
    /// Values exposed to the artifact (`VMName`, `OSVersion`, ...).
    pub generated: BTreeMap<String, String>,
    state: BuildState,
    transitions: Vec<Transition>,
    error: Option<ProvisionError>,
    halted: bool,
    cancelled: bool,
}

impl<R: Runner> BuildContext<R> {
    pub fn new(
        config: BuildConfig,
        client: VmClient<R>,
        ui: Arc<dyn Ui>,
        names: Box<dyn NameSource + Send>,
    ) -> Self {
        Self {
            config,
            client,
            ui,
            names,
            logs_dir: None,
            source_vm: None,
            vm_name: None,
            temp_dir: None,
            communicator: None,
            generated: BTreeMap::new(),
            state: BuildState::Init,
            transitions: Vec::new(),
            error: None,
            halted: false,
            cancelled: false,
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Error that halted the build, if any.
    pub fn error(&self) -> Option<&ProvisionError> {
        self.error.as_ref()
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }

    /// Whether cleanup should undo work: the build halted or was cancelled.
    pub fn should_roll_back(&self) -> bool {
        self.halted || self.cancelled
    }

    /// Target VM name, failing if no step recorded one yet.
    pub fn vm_name(&self) -> Result<&str, ProvisionError> {
        self.vm_name
            .as_deref()
            .ok_or_else(|| ProvisionError::Invariant {
                reason: "no target vm name recorded".into(),
            })
    }

    /// Move the build state machine, on behalf of `step`.
    pub fn advance(&mut self, step: &str, next: BuildState) -> Result<(), ProvisionError> {
        let from = self.state;
        if from == next {
            return Ok(());
        }
        if !from.can_transition_to(next) {
            return Err(ProvisionError::Invariant {
                reason: format!("illegal build state transition {from} -> {next}"),
            });
        }

        tracing::info!(step, from = %from, to = %next, "state transition");
        let transition = Transition {
            from,
            to: next,
            step: step.to_string(),
        };
        self.ui.on_transition(&transition);
        self.transitions.push(transition);
        self.state = next;
        Ok(())
    }

    /// Record a step failure and report it.
    pub fn halt(&mut self, step: &str, err: ProvisionError) -> StepAction {
        tracing::error!(step, error = %err, "step halted");
        self.ui.error(&err.to_string());
        self.error = Some(ProvisionError::Step {
            step: step.to_string(),
            source: Box::new(err),
        });
        self.halted = true;
        if let Err(e) = self.advance(step, BuildState::Failed) {
            tracing::warn!(error = %e, "could not record failure");
        }
        StepAction::Halt
    }

    fn cancel(&mut self) {
        tracing::warn!("build cancelled");
        self.ui.error("Build cancelled");
        self.cancelled = true;
        if let Err(e) = self.advance("runner", BuildState::Cancelled) {
            tracing::warn!(error = %e, "could not record cancellation");
        }
    }
}

/// Run `steps` in order, then the cleanup of each step that ran in reverse.
///
/// Returns the halting error (decorated with the step name), or
/// [`ProvisionError::Cancelled`].
pub async fn run_steps<R: Runner>(
    steps: &mut [Box<dyn Step<R>>],
    ctx: &mut BuildContext<R>,
    cancel: &CancellationToken,
) -> Result<(), ProvisionError> {
    ctx.ui.plan(steps.len());
    let mut ran = 0;

    for step in steps.iter_mut() {
        if cancel.is_cancelled() {
            ctx.cancel();
            break;
        }

        let name = step.name();
        tracing::info!(step = name, "step started");
        ctx.ui.step(name, StepStatus::Started);
        ran += 1;

        let action = match step.run(ctx).await {
            Ok(()) => StepAction::Continue,
            Err(e) => ctx.halt(name, e),
        };

        match action {
            StepAction::Continue => {
                tracing::info!(step = name, "step finished");
                ctx.ui.step(name, StepStatus::Finished);
            }
            StepAction::Halt => {
                ctx.ui.step(name, StepStatus::Halted);
                break;
            }
        }
    }

    if !ctx.should_roll_back() {
        if let Err(e) = ctx.advance("runner", BuildState::Done) {
            ctx.halt("runner", e);
        }
    }

    for step in steps[..ran].iter_mut().rev() {
        let name = step.name();
        tracing::debug!(step = name, "cleanup");
        ctx.ui.step(name, StepStatus::CleaningUp);
        step.cleanup(ctx).await;
    }

    if ctx.should_roll_back() {
        if let Err(e) = ctx.advance("runner", BuildState::Cleaned) {
            tracing::warn!(error = %e, "could not record cleanup");
        }
    }

    match ctx.error.take() {
        Some(err) => Err(err),
        None if ctx.cancelled => Err(ProvisionError::Cancelled),
        None => Ok(()),
    }
}

/// Delete the target VM during cleanup when the build created it and then
/// failed. Shared by the create and clone steps.
///
/// Nothing happens on success, when the halting error says the VM already
/// existed (it may belong to someone else), or when it says the VM was not
/// found. Existence is re-checked instead of trusting recorded state.
pub(crate) async fn remove_failed_vm<R: Runner>(ctx: &mut BuildContext<R>, name: &str) {
    if !ctx.should_roll_back() {
        return;
    }
    if let Some(err) = ctx.error() {
        if err.is_already_exists() || err.is_not_found() {
            tracing::info!(vm = %name, "leaving vm in place");
            return;
        }
    }

    match ctx.client.exists(name).await {
        Ok(false) => {
            tracing::debug!(vm = %name, "nothing to delete");
        }
        Ok(true) => {
            ctx.ui.say(&format!("Deleting VM {name}"));
            if let Err(e) = ctx.client.delete(name).await {
                tracing::warn!(vm = %name, error = %e, "cleanup delete failed");
                ctx.ui.error(&e.to_string());
            }
        }
        Err(e) => {
            tracing::warn!(vm = %name, error = %e, "cleanup existence check failed");
            ctx.ui.error(&e.to_string());
        }
    }
}
