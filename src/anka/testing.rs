//! Recording fake of the anka CLI for unit tests.
//!
//! Replies are scripted per full command line (without the global
//! `--machine-readable`/`--debug` flags). Several replies for the same
//! command are handed out in order; the last one repeats.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::protocol::Envelope;
use super::runner::{RunParams, Runner};
use crate::error::ProvisionError;
use crate::vm_state::VmStatus;

#[derive(Clone)]
enum Reply {
    Ok(serde_json::Value),
    Fail { code: i64, message: String },
}

#[derive(Clone)]
struct GuestReply {
    exit_code: i32,
    stdout: String,
}

#[derive(Default)]
pub struct FakeRunner {
    commands: Mutex<Vec<String>>,
    streamed: Mutex<Vec<String>>,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    progress: Mutex<HashMap<String, Vec<String>>>,
    guest: Mutex<HashMap<String, GuestReply>>,
    stdin: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, command: &str, reply: Reply) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn reply(&self, command: &str, body: serde_json::Value) -> &Self {
        self.push(command, Reply::Ok(body))
    }

    pub fn fail(&self, command: &str, code: i64, message: &str) -> &Self {
        self.push(
            command,
            Reply::Fail {
                code,
                message: message.to_string(),
            },
        )
    }

    /// Script `show <name>`.
    pub fn show(&self, name: &str, status: VmStatus, hard_drive: u64) -> &Self {
        self.show_full(name, status, hard_drive, 2, "4G")
    }

    pub fn show_full(
        &self,
        name: &str,
        status: VmStatus,
        hard_drive: u64,
        cpu_cores: u32,
        ram: &str,
    ) -> &Self {
        self.reply(
            &format!("show {name}"),
            serde_json::json!({
                "uuid": format!("{name}-uuid"),
                "name": name,
                "cpu_cores": cpu_cores,
                "ram": ram,
                "status": status.as_str(),
                "hard_drive": hard_drive,
            }),
        )
    }

    /// Lines streamed for any command whose first word is `subcommand`.
    pub fn progress(&self, subcommand: &str, lines: &[&str]) -> &Self {
        self.progress.lock().unwrap().insert(
            subcommand.to_string(),
            lines.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    /// Script a guest command, keyed by its full `run ...` line.
    pub fn guest(&self, command: &str, exit_code: i32, stdout: &str) -> &Self {
        self.guest.lock().unwrap().insert(
            command.to_string(),
            GuestReply {
                exit_code,
                stdout: stdout.to_string(),
            },
        );
        self
    }

    /// Every command issued so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Commands starting with `prefix`.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn was_streamed(&self, subcommand: &str) -> bool {
        self.streamed
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.split(' ').next() == Some(subcommand))
    }

    /// Stdin contents fed to guest commands.
    pub fn guest_stdin(&self) -> Vec<String> {
        self.stdin.lock().unwrap().clone()
    }

    fn next_reply(&self, command: &str) -> Reply {
        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(command) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ if command.starts_with("show ") => {
                let name = &command["show ".len()..];
                Reply::Ok(serde_json::json!({
                    "uuid": format!("{name}-uuid"),
                    "name": name,
                    "status": "stopped",
                }))
            }
            // the VM name is the last argument of `create`
            _ if command.starts_with("create ") => {
                let name = command.rsplit(' ').next().unwrap_or_default();
                Reply::Ok(serde_json::json!({ "uuid": format!("{name}-uuid") }))
            }
            _ => Reply::Ok(serde_json::json!({})),
        }
    }
}

impl Runner for FakeRunner {
    async fn invoke(
        &self,
        args: &[String],
        progress: Option<&mpsc::Sender<String>>,
    ) -> Result<Envelope, ProvisionError> {
        let command = args.join(" ");
        self.commands.lock().unwrap().push(command.clone());

        if let Some(sink) = progress {
            self.streamed.lock().unwrap().push(command.clone());
            let first = args.first().cloned().unwrap_or_default();
            let lines = self.progress.lock().unwrap().get(&first).cloned();
            for line in lines.unwrap_or_default() {
                let _ = sink.send(line).await;
            }
        }

        let envelope = match self.next_reply(&command) {
            Reply::Ok(body) => Envelope {
                status: "OK".into(),
                body,
                message: None,
                code: None,
                exception_type: None,
            },
            Reply::Fail { code, message } => Envelope {
                status: "ERROR".into(),
                body: serde_json::Value::Null,
                message: Some(message),
                code: Some(code),
                exception_type: Some("AnkaException".into()),
            },
        };
        envelope.into_result()
    }

    async fn run(&self, mut params: RunParams) -> Result<i32, ProvisionError> {
        let command = params.args().join(" ");
        self.commands.lock().unwrap().push(command.clone());

        if let Some(mut stdin) = params.stdin.take() {
            let mut input = String::new();
            let _ = stdin.read_to_string(&mut input).await;
            self.stdin.lock().unwrap().push(input);
        }

        let reply = self.guest.lock().unwrap().get(&command).cloned();
        let reply = reply.unwrap_or(GuestReply {
            exit_code: 0,
            stdout: String::new(),
        });
        let _ = params.stdout.write_all(reply.stdout.as_bytes()).await;
        let _ = params.stdout.flush().await;
        Ok(reply.exit_code)
    }
}
