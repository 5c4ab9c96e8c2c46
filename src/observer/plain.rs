//! Plain text output, no ANSI. Suitable for piped output and CI logs.

use std::sync::Mutex;

use super::{OutputMode, StepStatus, Transition, Ui};

struct Counter {
    step: usize,
    total: usize,
}

pub struct PlainUi {
    mode: OutputMode,
    counter: Mutex<Counter>,
}

impl PlainUi {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            counter: Mutex::new(Counter { step: 0, total: 0 }),
        }
    }

    fn prefix(&self, advance: bool) -> String {
        let Ok(mut c) = self.counter.lock() else {
            return "[?]".into();
        };
        if advance {
            c.step += 1;
        }
        if c.total > 0 {
            format!("[{}/{}]", c.step, c.total)
        } else {
            format!("[{}]", c.step)
        }
    }
}

impl Ui for PlainUi {
    fn plan(&self, total_steps: usize) {
        if let Ok(mut c) = self.counter.lock() {
            c.total = total_steps;
        }
    }

    fn say(&self, message: &str) {
        println!("      \u{2192} {message}");
    }

    fn error(&self, message: &str) {
        eprintln!("error: {message}");
    }

    fn progress(&self, line: &str) {
        if self.mode == OutputMode::Quiet {
            return;
        }
        for sub in line.split('\n') {
            println!("        {sub}");
        }
    }

    fn step(&self, name: &str, status: StepStatus) {
        match status {
            StepStatus::Started => println!("{} {name}", self.prefix(true)),
            StepStatus::Finished => println!("{} \u{2713} {name}", self.prefix(false)),
            StepStatus::Halted => println!("{} \u{2717} {name}", self.prefix(false)),
            StepStatus::CleaningUp => {
                if self.mode == OutputMode::Verbose {
                    println!("      cleanup: {name}");
                }
            }
        }
    }

    fn on_transition(&self, transition: &Transition) {
        if self.mode == OutputMode::Verbose {
            println!("      state: {} -> {}", transition.from, transition.to);
        }
    }
}
