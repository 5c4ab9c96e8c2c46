//! JSON-lines output for machine consumption. One object per line on stdout.

use super::{StepStatus, Transition, Ui};

#[derive(facet::Facet)]
struct MessageJson {
    event: String,
    message: String,
}

#[derive(facet::Facet)]
struct StepJson {
    event: String,
    step: String,
    status: String,
}

#[derive(facet::Facet)]
struct TransitionJson {
    event: String,
    step: String,
    from: String,
    to: String,
}

fn emit<'a, T: facet::Facet<'a>>(value: &T) {
    match facet_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "cannot serialize ui event"),
    }
}

#[derive(Default)]
pub struct JsonUi;

impl JsonUi {
    pub fn new() -> Self {
        Self
    }

    fn message(&self, event: &str, message: &str) {
        emit(&MessageJson {
            event: event.into(),
            message: message.into(),
        });
    }
}

impl Ui for JsonUi {
    fn say(&self, message: &str) {
        self.message("say", message);
    }

    fn error(&self, message: &str) {
        self.message("error", message);
    }

    fn progress(&self, line: &str) {
        self.message("progress", line);
    }

    fn step(&self, name: &str, status: StepStatus) {
        emit(&StepJson {
            event: "step".into(),
            step: name.into(),
            status: status.as_str().into(),
        });
    }

    fn on_transition(&self, transition: &Transition) {
        emit(&TransitionJson {
            event: "transition".into(),
            step: transition.step.clone(),
            from: transition.from.to_string(),
            to: transition.to.to_string(),
        });
    }
}
