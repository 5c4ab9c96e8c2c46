//! Registry push post-processor: upload the built VM as a template tag.

use crate::anka::registry::{RepoList, registry_revert};
use crate::anka::{PushParams, RegistryParams, Runner, VmClient};
use crate::artifact::Artifact;
use crate::config::PushSettings;
use crate::error::ProvisionError;
use crate::observer::Ui;

/// Push `artifact` to the registry. With `force`, the registry's latest tag
/// of a template with the same name is reverted first.
pub async fn push_artifact<R: Runner>(
    client: &VmClient<R>,
    registry: &RegistryParams,
    settings: &PushSettings,
    artifact: &Artifact,
    ui: &dyn Ui,
) -> Result<(), ProvisionError> {
    let remote_vm = settings
        .remote_vm
        .clone()
        .unwrap_or_else(|| artifact.vm_name.clone());

    if settings.force {
        revert_existing(client, registry, &remote_vm, ui).await?;
    }

    let params = PushParams {
        vm_id: artifact.id().to_string(),
        tag: Some(settings.tag.clone()),
        description: settings.description.clone(),
        remote_vm: Some(remote_vm.clone()),
        local: settings.local,
    };
    tracing::info!(vm = %artifact.vm_name, remote_vm = %remote_vm, tag = %settings.tag, "pushing to registry");
    ui.say(&format!(
        "Pushing {} to Anka Registry as {remote_vm} with tag {}",
        artifact.vm_name, settings.tag
    ));
    client
        .registry_push(registry, &params)
        .await
        .map_err(|e| ProvisionError::Registry {
            message: format!("failed to push vm {remote_vm} with tag {}: {e}", settings.tag),
        })
}

async fn revert_existing<R: Runner>(
    client: &VmClient<R>,
    registry: &RegistryParams,
    remote_vm: &str,
    ui: &dyn Ui,
) -> Result<(), ProvisionError> {
    let templates = client.registry_list(registry).await?;
    let Some(existing) = templates.iter().find(|t| t.name == remote_vm) else {
        tracing::debug!(remote_vm, "no existing template to revert");
        return Ok(());
    };

    let url = match &registry.url {
        Some(url) => url.clone(),
        None => {
            let repos = client.registry_list_repos(registry).await?;
            repo_url(&repos, registry.remote.as_deref())?
        }
    };

    ui.say(&format!(
        "Reverting the latest tag of {remote_vm} ({}) on the registry",
        existing.id
    ));
    registry_revert(&url, &existing.id).await
}

/// Base URL of the named remote, or of the default one.
fn repo_url(repos: &RepoList, remote: Option<&str>) -> Result<String, ProvisionError> {
    let name = remote
        .map(str::to_string)
        .or_else(|| repos.default.clone())
        .ok_or_else(|| ProvisionError::Registry {
            message: "no registry url configured and no default remote".into(),
        })?;
    let repo = repos.remotes.get(&name).ok_or_else(|| ProvisionError::Registry {
        message: format!("unknown registry remote {name}"),
    })?;

    let scheme = if repo.scheme.is_empty() { "http" } else { repo.scheme.as_str() };
    Ok(if repo.port.is_empty() {
        format!("{scheme}://{}", repo.host)
    } else {
        format!("{scheme}://{}:{}", repo.host, repo.port)
    })
}
