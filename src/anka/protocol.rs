//! Machine-readable output of the anka CLI.
//!
//! With `--machine-readable` every line the tool prints is free-form
//! progress text except the last one, which is a single JSON object:
//!
//! ```text
//! Downloading installer...
//! Creating disk...
//! {"status":"OK","body":{"uuid":"..."},"message":"","code":0}
//! ```
//!
//! [`LineScanner`] splits a raw byte stream into [`OutputEvent`]s: any
//! number of `Progress` lines followed by at most one `Terminal` payload.

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::ProvisionError;

pub const STATUS_OK: &str = "OK";

/// Terminal JSON result of one tool invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub status: String,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub exception_type: Option<String>,
}

impl Envelope {
    pub fn parse(payload: &str) -> Result<Self, ProvisionError> {
        serde_json::from_str(payload.trim()).map_err(|e| ProvisionError::Protocol {
            message: format!("{e}: {}", truncate(payload, 200)),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// The tool error carried by a non-OK envelope.
    pub fn error(&self) -> Option<ProvisionError> {
        if self.is_ok() {
            return None;
        }
        Some(ProvisionError::Tool {
            code: self.code.unwrap_or_default(),
            message: self
                .message
                .clone()
                .unwrap_or_else(|| format!("tool reported status {}", self.status)),
            exception_type: self.exception_type.clone().unwrap_or_default(),
        })
    }

    /// Turn a non-OK envelope into its error.
    pub fn into_result(self) -> Result<Self, ProvisionError> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }

    /// Decode the operation-specific body.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, ProvisionError> {
        T::deserialize(&self.body).map_err(|e| ProvisionError::Protocol {
            message: format!("unexpected body: {e}"),
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// One tagged chunk of subprocess output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Progress(String),
    Terminal(String),
}

/// Incremental splitter for machine-readable output.
///
/// The last non-blank line is held back until the next one arrives, so a
/// payload followed by a trailing newline is still recognised as terminal.
/// Blank lines seen while a line is held queue up behind it.
#[derive(Debug, Default)]
pub struct LineScanner {
    held: Option<String>,
    blanks: Vec<String>,
}

impl LineScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one newline-terminated line. Returns the events it releases, in
    /// output order.
    pub fn line(&mut self, raw: &[u8]) -> Vec<OutputEvent> {
        let text = decode_line(raw);
        if text.trim().is_empty() {
            if self.held.is_some() {
                self.blanks.push(text);
                return Vec::new();
            }
            return vec![OutputEvent::Progress(text)];
        }
        let mut events = Vec::with_capacity(1 + self.blanks.len());
        if let Some(held) = self.held.replace(text) {
            events.push(OutputEvent::Progress(held));
        }
        events.extend(self.blanks.drain(..).map(OutputEvent::Progress));
        events
    }

    /// End of stream, with whatever unterminated bytes remained.
    ///
    /// Blank lines after the payload are dropped.
    pub fn finish(mut self, tail: &[u8]) -> Vec<OutputEvent> {
        let tail = decode_line(tail);
        let mut events = Vec::with_capacity(2 + self.blanks.len());
        if tail.trim().is_empty() {
            if let Some(held) = self.held.take() {
                events.push(OutputEvent::Terminal(held));
            }
        } else {
            if let Some(held) = self.held.take() {
                events.push(OutputEvent::Progress(held));
            }
            events.extend(self.blanks.drain(..).map(OutputEvent::Progress));
            events.push(OutputEvent::Terminal(tail));
        }
        events
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Split a fully buffered output into progress lines and terminal payload.
pub fn scan(output: &[u8]) -> (Vec<String>, Option<String>) {
    let mut scanner = LineScanner::new();
    let mut progress = Vec::new();
    let mut terminal = None;

    let mut rest = output;
    let mut push = |event| match event {
        OutputEvent::Progress(line) => progress.push(line),
        OutputEvent::Terminal(payload) => terminal = Some(payload),
    };
    while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
        for event in scanner.line(&rest[..=pos]) {
            push(event);
        }
        rest = &rest[pos + 1..];
    }
    for event in scanner.finish(rest) {
        push(event);
    }

    (progress, terminal)
}

/// Parse a fully buffered output into its envelope.
pub fn parse_output(output: &[u8]) -> Result<Envelope, ProvisionError> {
    match scan(output).1 {
        Some(payload) => Envelope::parse(&payload),
        None => Err(ProvisionError::Protocol {
            message: "missing machine readable output".into(),
        }),
    }
}
