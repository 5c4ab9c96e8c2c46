//! Interactive TTY output: one spinner per step, checkmark on completion.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use super::{OutputMode, StepStatus, Transition, Ui};

const MAX_LOG_LINES: usize = 10;

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] {spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn done_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] \u{2713} {msg:.green}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn failed_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] \u{2717} {msg:.red}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// The step currently owning a spinner.
///
/// Progress lines are folded into the bar's message as extra lines rather
/// than separate bars, so indicatif keeps an accurate count of the lines it
/// owns and redraws do not eat completed steps.
struct ActiveStep {
    bar: ProgressBar,
    label: String,
    log_lines: VecDeque<String>,
}

struct State {
    step: usize,
    total: usize,
    active: Option<ActiveStep>,
}

pub struct InteractiveUi {
    multi: MultiProgress,
    mode: OutputMode,
    state: Mutex<State>,
}

impl InteractiveUi {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            multi: MultiProgress::new(),
            mode,
            state: Mutex::new(State {
                step: 0,
                total: 0,
                active: None,
            }),
        }
    }

    fn println(&self, text: String) {
        self.multi.println(text).ok();
    }

    fn start(&self, state: &mut State, label: &str) {
        state.step += 1;
        let prefix = if state.total > 0 {
            format!("{}/{}", state.step, state.total)
        } else {
            state.step.to_string()
        };

        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_prefix(prefix);
        bar.set_message(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));

        state.active = Some(ActiveStep {
            bar,
            label: label.to_string(),
            log_lines: VecDeque::new(),
        });
    }

    fn finish(&self, state: &mut State, ok: bool) {
        let Some(active) = state.active.take() else {
            return;
        };
        if self.mode == OutputMode::Verbose {
            for line in &active.log_lines {
                self.println(format!("        {line}"));
            }
        }
        // collapses the multi-line message back to the label
        active
            .bar
            .set_style(if ok { done_style() } else { failed_style() });
        active.bar.finish_with_message(active.label);
    }
}

impl Ui for InteractiveUi {
    fn plan(&self, total_steps: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.total = total_steps;
        }
    }

    fn say(&self, message: &str) {
        self.println(format!("      \u{2192} {message}"));
    }

    fn error(&self, message: &str) {
        self.println(format!("      {}", style(message).red()));
    }

    fn progress(&self, line: &str) {
        if self.mode == OutputMode::Quiet {
            return;
        }
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.active.is_none() {
            drop(state);
            self.println(format!("        {line}"));
            return;
        }
        let Some(active) = state.active.as_mut() else {
            return;
        };

        for sub in line.split('\n') {
            if active.log_lines.len() >= MAX_LOG_LINES {
                active.log_lines.pop_front();
            }
            active.log_lines.push_back(sub.to_string());
        }

        let mut msg = active.label.clone();
        for log_line in &active.log_lines {
            msg.push_str("\n        ");
            msg.push_str(log_line);
        }
        active.bar.set_message(msg);
    }

    fn step(&self, name: &str, status: StepStatus) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        match status {
            StepStatus::Started => {
                self.finish(&mut state, true);
                self.start(&mut state, name);
            }
            StepStatus::Finished => self.finish(&mut state, true),
            StepStatus::Halted => self.finish(&mut state, false),
            StepStatus::CleaningUp => {
                drop(state);
                if self.mode == OutputMode::Verbose {
                    self.println(format!("      {}", style(format!("cleanup: {name}")).dim()));
                }
            }
        }
    }

    fn on_transition(&self, transition: &Transition) {
        if self.mode == OutputMode::Verbose {
            self.println(format!(
                "      {}",
                style(format!("state: {} -> {}", transition.from, transition.to)).dim()
            ));
        }
    }
}
