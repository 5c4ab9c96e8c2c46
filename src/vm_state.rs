//! Shared vocabulary for VM and build lifecycle state.
//!
//! `VmStatus` is what the tool reports for a VM right now and is always
//! re-read before acting on it. `BuildState` is where a single provisioning
//! run is, tracked in memory by the step runner.

use serde::Deserialize;

/// Lifecycle status reported by `anka show`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Running,
    Stopped,
    Suspended,
    /// Anything else the tool reports, or no status at all.
    #[default]
    #[serde(other)]
    Unknown,
}

/// How a stop request is carried out for a VM in a given status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPlan {
    /// `stop --force`, whatever the status.
    Force,
    /// Plain graceful `stop`.
    Graceful,
    /// A suspended VM cannot be stopped gracefully. It is started, allowed
    /// to sync network and clock, and then stopped.
    WakeThenStop,
    /// Already stopped.
    Nothing,
}

impl VmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Suspended => "suspended",
            VmStatus::Unknown => "unknown",
        }
    }

    pub fn stop_plan(self, force: bool) -> StopPlan {
        match (force, self) {
            (true, _) => StopPlan::Force,
            (false, VmStatus::Stopped) => StopPlan::Nothing,
            (false, VmStatus::Suspended) => StopPlan::WakeThenStop,
            (false, _) => StopPlan::Graceful,
        }
    }
}

/// Progress of one provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// Nothing decided yet.
    Init,

    /// The source template name is known and present locally (pulled if
    /// necessary). Clone builds only.
    SourceResolved,

    /// The source is quiesced (suspended or stopped) and can be cloned.
    SourceReady,

    /// Target VM exists as a clone of the source.
    Cloned,

    /// Target VM was created from an installer.
    Created,

    /// Disk, RAM and vCPU match the configuration.
    ResourcesConverged,

    /// Port forwarding, identity variables and display match the configuration.
    PropertiesConverged,

    /// Target VM was started and the boot delay elapsed.
    Started,

    /// Every step finished.
    Done,

    /// A step halted the run.
    Failed,

    /// The run was cancelled between steps.
    Cancelled,

    /// Cleanup ran after a failure or cancellation.
    Cleaned,
}

impl BuildState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildState::Done | BuildState::Cleaned)
    }

    /// Whether the run can move from `self` to `next`.
    ///
    /// Failure and cancellation are reachable from every non-terminal state.
    /// A create build skips the source states and resource convergence.
    pub fn can_transition_to(self, next: BuildState) -> bool {
        use BuildState::*;

        if self == next {
            return true;
        }
        match (self, next) {
            (Done | Cleaned, _) => false,
            (Failed | Cancelled, Cleaned) => true,
            (Failed | Cancelled, _) => false,
            (_, Failed | Cancelled) => true,
            (Init, SourceResolved | Created) => true,
            (SourceResolved, SourceReady) => true,
            (SourceReady, Cloned) => true,
            (Cloned, ResourcesConverged) => true,
            (Created, PropertiesConverged) => true,
            (ResourcesConverged, PropertiesConverged) => true,
            (PropertiesConverged, Started) => true,
            (Started, Done) => true,
            // builds without a start step (e.g. only converging a template)
            (PropertiesConverged, Done) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildState::Init => "init",
            BuildState::SourceResolved => "source resolved",
            BuildState::SourceReady => "source ready",
            BuildState::Cloned => "cloned",
            BuildState::Created => "created",
            BuildState::ResourcesConverged => "resources converged",
            BuildState::PropertiesConverged => "properties converged",
            BuildState::Started => "started",
            BuildState::Done => "done",
            BuildState::Failed => "failed",
            BuildState::Cancelled => "cancelled",
            BuildState::Cleaned => "cleaned",
        };
        f.write_str(s)
    }
}
