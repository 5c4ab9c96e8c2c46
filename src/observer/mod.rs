//! User-facing output.
//!
//! Steps talk to a [`Ui`]; they never print. The binary picks one of the
//! implementations below from `--output`, and tests use [`memory::MemoryUi`].
//! Tracing covers the log file, this covers the terminal.

pub mod interactive;
pub mod json;
pub mod plain;

#[cfg(test)]
pub mod memory;

use crate::vm_state::BuildState;

/// Controls how much step output is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinners + ring-buffer of progress lines, cleared when a step ends.
    Normal,
    /// Like Normal but progress lines stay on screen.
    Verbose,
    /// Step lines only, no progress.
    Quiet,
    /// No ANSI, plain lines (piped / non-TTY).
    Plain,
}

/// A validated move of the build state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: BuildState,
    pub to: BuildState,
    /// Step that requested the move.
    pub step: String,
}

/// Where a step ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Started,
    Finished,
    Halted,
    /// Cleanup of a step is running.
    CleaningUp,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Started => "started",
            StepStatus::Finished => "finished",
            StepStatus::Halted => "halted",
            StepStatus::CleaningUp => "cleanup",
        }
    }
}

/// Output sink shared by every step of a build.
pub trait Ui: Send + Sync {
    /// Number of steps about to run; lets renderers print `[n/total]`.
    fn plan(&self, _total_steps: usize) {}

    /// Informational message.
    fn say(&self, message: &str);

    /// Non-fatal problem or the final failure report.
    fn error(&self, message: &str);

    /// One line of streamed tool output (e.g. `create`).
    fn progress(&self, line: &str);

    fn step(&self, name: &str, status: StepStatus);

    fn on_transition(&self, transition: &Transition);
}
