//! Recording [`Ui`] for tests.

use std::sync::Mutex;

use super::{StepStatus, Transition, Ui};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Say(String),
    Error(String),
    Progress(String),
    Step(String, StepStatus),
    Transition(Transition),
}

#[derive(Default)]
pub struct MemoryUi {
    events: Mutex<Vec<UiEvent>>,
}

impl MemoryUi {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: UiEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn said(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::Say(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::Error(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn progress_lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                UiEvent::Progress(m) => Some(m),
                _ => None,
            })
            .collect()
    }
}

impl Ui for MemoryUi {
    fn say(&self, message: &str) {
        self.push(UiEvent::Say(message.into()));
    }

    fn error(&self, message: &str) {
        self.push(UiEvent::Error(message.into()));
    }

    fn progress(&self, line: &str) {
        self.push(UiEvent::Progress(line.into()));
    }

    fn step(&self, name: &str, status: StepStatus) {
        self.push(UiEvent::Step(name.into(), status));
    }

    fn on_transition(&self, transition: &Transition) {
        self.push(UiEvent::Transition(transition.clone()));
    }
}
