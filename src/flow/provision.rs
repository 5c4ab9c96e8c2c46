//! Upload provisioning files and run inline shell commands in the guest.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use super::{BuildContext, Step, StepFuture};
use crate::anka::Runner;
use crate::error::ProvisionError;
use crate::logging::CommandLog;

#[derive(Default)]
pub struct ProvisionStep;

impl ProvisionStep {
    pub fn new() -> Self {
        Self
    }
}

/// Forwards guest output chunks to the relay loop.
struct ChunkSink(mpsc::UnboundedSender<Vec<u8>>);

impl AsyncWrite for ChunkSink {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        // a closed receiver only means nobody is watching any more
        let _ = self.0.send(buf.to_vec());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

async fn provision<R: Runner>(ctx: &mut BuildContext<R>) -> Result<(), ProvisionError> {
    if ctx.config.provision_files.is_empty() && ctx.config.provision_inline.is_empty() {
        tracing::debug!("nothing to provision");
        return Ok(());
    }
    let client = &ctx.client;
    let ui = ctx.ui.clone();
    let comm = ctx
        .communicator
        .as_mut()
        .ok_or_else(|| ProvisionError::Invariant {
            reason: "provisioning needs a connected communicator".into(),
        })?;

    for file in &ctx.config.provision_files {
        let meta = tokio::fs::metadata(&file.source)
            .await
            .map_err(|source| ProvisionError::Io {
                context: format!("reading {}", file.source.display()),
                source,
            })?;
        ui.say(&format!(
            "Uploading {} => {}",
            file.source.display(),
            file.destination
        ));
        if meta.is_dir() {
            comm.upload_dir(client, &file.source, &file.destination).await?;
        } else {
            comm.upload(client, &file.source, &file.destination).await?;
        }
    }

    for (index, command) in ctx.config.provision_inline.iter().enumerate() {
        ui.say(&format!("Provisioning with shell command: {command}"));
        let mut log = match &ctx.logs_dir {
            Some(dir) => match CommandLog::create(dir, &format!("inline-{}", index + 1)) {
                Ok(log) => Some(log),
                Err(e) => {
                    tracing::warn!(error = %e, "cannot create provisioning log");
                    None
                }
            },
            None => None,
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let run = {
            let out = ChunkSink(tx.clone());
            let err = ChunkSink(tx);
            comm.start(client, command, out, err)
        };
        let relay = async {
            let mut pending = Vec::new();
            while let Some(chunk) = rx.recv().await {
                if let Some(log) = log.as_mut() {
                    log.write_all(&chunk);
                }
                pending.extend_from_slice(&chunk);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=pos).collect();
                    ui.progress(String::from_utf8_lossy(&line).trim_end());
                }
            }
            if !pending.is_empty() {
                ui.progress(String::from_utf8_lossy(&pending).trim_end());
            }
        };
        let (code, ()) = tokio::join!(run, relay);
        let code = code?;

        if let Some(log) = log {
            let path = log.finish(code == 0);
            tracing::info!(log = %path.display(), exit_code = code, "provisioning command finished");
        }
        if code != 0 {
            return Err(ProvisionError::GuestCommand {
                command: command.clone(),
                exit_code: code,
            });
        }
    }
    Ok(())
}

impl<R: Runner> Step<R> for ProvisionStep {
    fn name(&self) -> &'static str {
        "provision"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext<R>) -> StepFuture<'a, Result<(), ProvisionError>> {
        Box::pin(provision(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::Communicator;
    use crate::config::ProvisionFile;
    use crate::flow::testing::{clone_config, context, fake};

    fn connected(
        config: crate::config::BuildConfig,
        share: &std::path::Path,
    ) -> (
        BuildContext<crate::anka::testing::FakeRunner>,
        std::sync::Arc<crate::observer::memory::MemoryUi>,
    ) {
        let (mut ctx, ui) = context(config);
        ctx.vm_name = Some("foo".into());
        ctx.communicator = Some(Communicator::new("foo", share, true));
        (ctx, ui)
    }

    #[tokio::test]
    async fn inline_output_is_relayed_and_logged() {
        let share = tempfile::tempdir().unwrap();
        let logs = tempfile::tempdir().unwrap();
        let mut config = clone_config("base");
        config.provision_inline = vec!["brew install jq".into()];
        let (mut ctx, ui) = connected(config, share.path());
        ctx.logs_dir = Some(logs.path().to_path_buf());
        fake(&ctx).guest("run foo bash -c brew install jq", 0, "fetching\ninstalled\n");

        provision(&mut ctx).await.unwrap();

        assert_eq!(ui.progress_lines(), vec!["fetching", "installed"]);
        let names: Vec<String> = std::fs::read_dir(logs.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].ends_with("_inline-1_ok.log"));
    }

    #[tokio::test]
    async fn failing_command_stops_provisioning() {
        let share = tempfile::tempdir().unwrap();
        let mut config = clone_config("base");
        config.provision_inline = vec!["false".into(), "echo never".into()];
        let (mut ctx, _ui) = connected(config, share.path());
        fake(&ctx).guest("run foo bash -c false", 1, "");

        let err = provision(&mut ctx).await.unwrap_err();
        assert!(matches!(err, ProvisionError::GuestCommand { exit_code: 1, .. }));
        assert_eq!(fake(&ctx).matching("run"), vec!["run foo bash -c false"]);
    }

    #[tokio::test]
    async fn files_and_directories_are_uploaded() {
        let share = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let file = src.path().join("a.sh");
        std::fs::write(&file, "echo a").unwrap();
        let dir = src.path().join("assets");
        std::fs::create_dir(&dir).unwrap();

        let mut config = clone_config("base");
        config.provision_files = vec![
            ProvisionFile {
                source: file.clone(),
                destination: "/tmp/a.sh".into(),
            },
            ProvisionFile {
                source: dir.clone(),
                destination: "/opt".into(),
            },
        ];
        let (mut ctx, _ui) = connected(config, share.path());

        provision(&mut ctx).await.unwrap();
        assert_eq!(
            fake(&ctx).commands(),
            vec![
                format!("cp -af {} foo:/tmp/a.sh", file.display()),
                format!("cp -af {} foo:/opt", dir.display()),
            ]
        );
    }

    #[tokio::test]
    async fn missing_source_is_an_io_error() {
        let share = tempfile::tempdir().unwrap();
        let mut config = clone_config("base");
        config.provision_files = vec![ProvisionFile {
            source: share.path().join("nope"),
            destination: "/tmp/nope".into(),
        }];
        let (mut ctx, _ui) = connected(config, share.path());
        let err = provision(&mut ctx).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Io { .. }));
    }

    #[tokio::test]
    async fn nothing_configured_needs_no_communicator() {
        let (mut ctx, _ui) = context(clone_config("base"));
        provision(&mut ctx).await.unwrap();
    }
}
