//! `anka registry ...` subcommands and the registry REST revert call.

use std::collections::BTreeMap;

use super::client::VmClient;
use super::protocol::{self, Envelope};
use super::runner::Runner;
use super::types::{RegistryRepo, RegistryTemplate};
use crate::error::ProvisionError;

/// Connection options shared by every registry subcommand.
#[derive(Debug, Clone, Default)]
pub struct RegistryParams {
    /// Name of a configured remote.
    pub remote: Option<String>,
    /// Registry URL.
    pub url: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub cacert: Option<String>,
    pub insecure: bool,
    /// Host architecture as reported by the OS (`aarch64`/`arm64` or `x86_64`).
    pub host_arch: String,
}

impl RegistryParams {
    fn is_arm(&self) -> bool {
        matches!(self.host_arch.as_str(), "arm64" | "aarch64")
    }

    /// `registry [connection flags]` prefix.
    fn args(&self) -> Vec<String> {
        let mut args = vec!["registry".to_string()];

        if self.is_arm() {
            // one flag taking either the remote name or the URL
            if let Some(remote) = self.remote.as_ref().or(self.url.as_ref()) {
                args.extend(["--remote".into(), remote.clone()]);
            }
        } else {
            if let Some(remote) = &self.remote {
                args.extend(["--remote".into(), remote.clone()]);
            }
            if let Some(url) = &self.url {
                args.extend(["--registry-path".into(), url.clone()]);
            }
        }

        for (flag, value) in [
            ("--cert", &self.cert),
            ("--key", &self.key),
            ("--cacert", &self.cacert),
        ] {
            if let Some(value) = value {
                args.extend([flag.into(), value.clone()]);
            }
        }
        if self.insecure {
            args.push("--insecure".into());
        }
        args
    }
}

#[derive(Debug, Clone, Default)]
pub struct PullParams {
    pub vm_id: String,
    pub tag: Option<String>,
    pub local: bool,
    pub shrink: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PushParams {
    pub vm_id: String,
    pub tag: Option<String>,
    pub description: Option<String>,
    pub remote_vm: Option<String>,
    pub local: bool,
}

/// Remotes from `registry list-repos`, plus which one is the default.
#[derive(Debug, Clone, Default)]
pub struct RepoList {
    pub default: Option<String>,
    pub remotes: BTreeMap<String, RegistryRepo>,
}

impl<R: Runner> VmClient<R> {
    async fn registry<I, S>(
        &self,
        params: &RegistryParams,
        sub: I,
    ) -> Result<Envelope, ProvisionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = params.args();
        args.extend(sub.into_iter().map(Into::into));
        self.call(args).await
    }

    pub async fn registry_list(
        &self,
        params: &RegistryParams,
    ) -> Result<Vec<RegistryTemplate>, ProvisionError> {
        self.registry(params, ["list"]).await?.body()
    }

    pub async fn registry_list_repos(
        &self,
        params: &RegistryParams,
    ) -> Result<RepoList, ProvisionError> {
        let remotes: BTreeMap<String, RegistryRepo> =
            self.registry(params, ["list-repos"]).await?.body()?;
        let default = remotes
            .iter()
            .find(|(_, repo)| repo.default)
            .map(|(name, _)| name.clone());
        Ok(RepoList { default, remotes })
    }

    pub async fn registry_pull(
        &self,
        params: &RegistryParams,
        pull: &PullParams,
    ) -> Result<(), ProvisionError> {
        let mut sub = vec!["pull".to_string()];
        if let Some(tag) = &pull.tag {
            sub.extend(["--tag".into(), tag.clone()]);
        }
        if pull.local {
            sub.push("--local".into());
            if pull.shrink {
                sub.push("--shrink".into());
            }
        }
        sub.push(pull.vm_id.clone());
        self.registry(params, sub).await?;
        Ok(())
    }

    pub async fn registry_push(
        &self,
        params: &RegistryParams,
        push: &PushParams,
    ) -> Result<(), ProvisionError> {
        let mut sub = vec!["push".to_string()];
        if let Some(tag) = &push.tag {
            sub.extend(["--tag".into(), tag.clone()]);
        }
        if let Some(description) = &push.description {
            sub.extend(["--description".into(), description.clone()]);
        }
        if let Some(remote_vm) = &push.remote_vm {
            sub.extend(["--remote-vm".into(), remote_vm.clone()]);
        }
        if push.local {
            sub.push("--local".into());
        }
        sub.push(push.vm_id.clone());
        self.registry(params, sub).await?;
        Ok(())
    }
}

/// `DELETE {url}/registry/revert?id={id}`: drop the latest tag of a template.
pub async fn registry_revert(url: &str, id: &str) -> Result<(), ProvisionError> {
    let endpoint = format!("{}/registry/revert?id={id}", url.trim_end_matches('/'));
    tracing::info!(url = %endpoint, "reverting registry template");

    let http = reqwest::Client::builder()
        .build()
        .map_err(|e| ProvisionError::Registry {
            message: format!("building http client: {e}"),
        })?;
    let resp = http
        .delete(&endpoint)
        .send()
        .await
        .map_err(|e| ProvisionError::Registry {
            message: format!("DELETE {endpoint}: {e}"),
        })?;

    let status = resp.status();
    if status != reqwest::StatusCode::OK {
        return Err(ProvisionError::Registry {
            message: format!("unsupported http response code: {}", status.as_u16()),
        });
    }

    let body = resp.bytes().await.map_err(|e| ProvisionError::Registry {
        message: format!("reading revert response: {e}"),
    })?;
    let envelope = protocol::parse_output(&body)?;
    if let Some(err) = envelope.error() {
        return Err(ProvisionError::Registry {
            message: format!("failed to revert VM on registry: {err}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anka::testing::FakeRunner;

    fn intel() -> RegistryParams {
        RegistryParams {
            remote: Some("office".into()),
            url: Some("https://registry.local:8089".into()),
            cert: Some("/etc/anka/node.pem".into()),
            key: Some("/etc/anka/node-key.pem".into()),
            host_arch: "x86_64".into(),
            ..Default::default()
        }
    }

    #[test]
    fn intel_uses_remote_and_registry_path() {
        assert_eq!(
            intel().args(),
            vec![
                "registry",
                "--remote",
                "office",
                "--registry-path",
                "https://registry.local:8089",
                "--cert",
                "/etc/anka/node.pem",
                "--key",
                "/etc/anka/node-key.pem"
            ]
        );
    }

    #[test]
    fn arm_prefers_remote_name_over_url() {
        let mut params = intel();
        params.host_arch = "aarch64".into();
        params.cert = None;
        params.key = None;
        params.insecure = true;
        assert_eq!(params.args(), vec!["registry", "--remote", "office", "--insecure"]);

        params.remote = None;
        assert_eq!(
            params.args(),
            vec!["registry", "--remote", "https://registry.local:8089", "--insecure"]
        );
    }

    #[tokio::test]
    async fn pull_and_push_argument_lists() {
        let client = VmClient::new(FakeRunner::new());
        let params = RegistryParams {
            host_arch: "arm64".into(),
            ..Default::default()
        };
        client
            .registry_pull(
                &params,
                &PullParams {
                    vm_id: "base".into(),
                    tag: Some("latest".into()),
                    local: true,
                    shrink: true,
                },
            )
            .await
            .unwrap();
        client
            .registry_push(
                &params,
                &PushParams {
                    vm_id: "built".into(),
                    tag: Some("v2".into()),
                    description: Some("nightly".into()),
                    remote_vm: Some("ci-template".into()),
                    local: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(
            client.runner().commands(),
            vec![
                "registry pull --tag latest --local --shrink base",
                "registry push --tag v2 --description nightly --remote-vm ci-template built"
            ]
        );
    }

    #[tokio::test]
    async fn list_repos_finds_default() {
        let client = VmClient::new(FakeRunner::new());
        client.runner().reply(
            "registry list-repos",
            serde_json::json!({
                "office": {"default": false, "host": "10.0.0.2", "scheme": "http", "port": "8089"},
                "cloud": {"default": true, "host": "reg.example.com", "scheme": "https", "port": "443"}
            }),
        );
        let repos = client
            .registry_list_repos(&RegistryParams::default())
            .await
            .unwrap();
        assert_eq!(repos.default.as_deref(), Some("cloud"));
        assert_eq!(repos.remotes.len(), 2);
    }

    #[tokio::test]
    async fn list_decodes_templates() {
        let client = VmClient::new(FakeRunner::new());
        client.runner().reply(
            "registry list",
            serde_json::json!([{"id": "t-1", "name": "ci-template", "latest": "v1"}]),
        );
        let templates = client.registry_list(&RegistryParams::default()).await.unwrap();
        assert_eq!(templates[0].id, "t-1");
    }
}
