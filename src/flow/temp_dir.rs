//! Host-side scratch directory shared with the guest for file transfer.

use std::path::PathBuf;

use super::{BuildContext, Step, StepFuture};
use crate::anka::Runner;
use crate::error::ProvisionError;
use crate::paths;

#[derive(Default)]
pub struct TempDirStep {
    /// Parent directory; [`paths::tmp_base`] when unset.
    base: Option<PathBuf>,
    dir: Option<PathBuf>,
}

impl TempDirStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_dir(base: impl Into<PathBuf>) -> Self {
        Self {
            base: Some(base.into()),
            dir: None,
        }
    }

    async fn create<R: Runner>(&mut self, ctx: &mut BuildContext<R>) -> Result<(), ProvisionError> {
        ctx.ui.say("Creating a temporary directory for sharing data...");

        let base = self.base.clone().unwrap_or_else(paths::tmp_base);
        let dir = base.join(format!("anka-{}", ctx.names.random_seq(10)));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ProvisionError::Io {
                context: format!("error making temp dir {}", dir.display()),
                source,
            })?;

        tracing::debug!(dir = %dir.display(), "temp dir created");
        self.dir = Some(dir.clone());
        ctx.temp_dir = Some(dir);
        Ok(())
    }
}

impl<R: Runner> Step<R> for TempDirStep {
    fn name(&self) -> &'static str {
        "temp_dir"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext<R>) -> StepFuture<'a, Result<(), ProvisionError>> {
        Box::pin(self.create(ctx))
    }

    /// Always removes the directory, success or not.
    fn cleanup<'a>(&'a mut self, _ctx: &'a mut BuildContext<R>) -> StepFuture<'a, ()> {
        Box::pin(async move {
            let Some(dir) = self.dir.take() else {
                return;
            };
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to remove temp dir");
            }
        })
    }
}
