//! Bring an existing VM in line with the configured resources and properties.
//!
//! Every change is preceded by a forced stop; the tool refuses most
//! modifications on a running VM. Changes are applied one by one and are
//! not rolled back when a later one fails.

use super::BuildContext;
use crate::anka::types::VmDescriptor;
use crate::anka::{RunParams, Runner};
use crate::error::ProvisionError;
use crate::util;

/// Guest command that lets the APFS container claim a grown disk.
const RESIZE_CONTAINER: [&str; 5] = ["diskutil", "apfs", "resizeContainer", "disk1", "0"];

const HW_UUID_VAR: &str = "hw.UUID";

/// Converge disk, RAM and vCPU. Returns whether anything was modified.
///
/// A smaller disk than the current one is an error raised before any call.
pub async fn converge_resources<R: Runner>(
    ctx: &BuildContext<R>,
    current: &VmDescriptor,
) -> Result<bool, ProvisionError> {
    let target = &ctx.config.resources;
    let name = current.name.as_str();
    let mut changed = false;

    let disk = match &target.disk_size {
        Some(size) => {
            let bytes = util::disk_size_to_bytes(size)?;
            if bytes < current.hard_drive {
                return Err(ProvisionError::Invariant {
                    reason: format!(
                        "shrinking VM disks is not allowed (current size {} bytes, requested {size})",
                        current.hard_drive
                    ),
                });
            }
            (bytes > current.hard_drive).then_some(size.as_str())
        }
        None => None,
    };

    if let Some(size) = disk {
        ctx.client.stop(name, true).await?;
        ctx.ui.say(&format!("Modifying VM {name} disk size to {size}"));
        ctx.client.modify(name, "set", "hard-drive", &["-s", size]).await?;

        let code = ctx
            .client
            .run(RunParams::new(
                name,
                RESIZE_CONTAINER.iter().map(|s| s.to_string()).collect(),
            ))
            .await?;
        if code != 0 {
            tracing::warn!(vm = %name, exit_code = code, "guest container resize failed");
            ctx.ui
                .error(&format!("Resizing the guest disk container exited with code {code}"));
        }

        // the resize starts the VM
        ctx.client.stop(name, true).await?;
        changed = true;
    }

    if let Some(ram) = &target.ram_size {
        if !ram.eq_ignore_ascii_case(&current.ram) {
            ctx.client.stop(name, true).await?;
            ctx.ui.say(&format!("Modifying VM {name} RAM to {ram}"));
            ctx.client.modify(name, "set", "ram", &[ram.as_str()]).await?;
            changed = true;
        }
    }

    if let Some(cpu) = target.cpu_count {
        if cpu != current.cpu_cores {
            ctx.client.stop(name, true).await?;
            ctx.ui
                .say(&format!("Modifying VM {name} VCPU core count to {cpu}"));
            let count = cpu.to_string();
            ctx.client.modify(name, "set", "cpu", &["-c", count.as_str()]).await?;
            changed = true;
        }
    }

    if !changed {
        tracing::debug!(vm = %name, "resources already converged");
    }
    Ok(changed)
}

/// Converge port forwarding, the hardware UUID and the display.
///
/// A rule whose host port is already bound is reported and skipped unless
/// the build forces. Host port 0 means "any free port" and never conflicts.
pub async fn converge_properties<R: Runner>(
    ctx: &BuildContext<R>,
    name: &str,
) -> Result<(), ProvisionError> {
    let target = &ctx.config.properties;
    if target.is_empty() {
        return Ok(());
    }

    let described = ctx.client.describe(name).await?;
    let mut bound = described.bound_host_ports();

    for rule in &target.port_rules {
        ctx.ui.say(&format!(
            "Ensuring {name} port-forwarding (Guest Port: {}, Host Port: {}, Rule Name: {})",
            rule.guest_port, rule.host_port, rule.rule_name
        ));
        let taken = rule.host_port != 0 && bound.contains(&rule.host_port);
        if taken && !ctx.config.force {
            ctx.ui.error(&format!(
                "Found an existing host port rule ({})! Skipping without setting...",
                rule.host_port
            ));
            continue;
        }

        ctx.client.stop(name, true).await?;
        let host = rule.host_port.to_string();
        let guest = rule.guest_port.to_string();
        ctx.client
            .modify(
                name,
                "add",
                "port-forwarding",
                &[
                    "--host-port",
                    host.as_str(),
                    "--guest-port",
                    guest.as_str(),
                    rule.rule_name.as_str(),
                ],
            )
            .await?;
        if rule.host_port != 0 {
            bound.insert(rule.host_port);
        }
    }

    if let Some(uuid) = &target.hw_uuid {
        let current = described
            .custom_variables
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(HW_UUID_VAR))
            .map(|(_, v)| v.as_str());
        if current != Some(uuid.as_str()) {
            ctx.client.stop(name, true).await?;
            ctx.ui
                .say(&format!("Modifying VM custom-variable {HW_UUID_VAR} to {uuid}"));
            ctx.client
                .modify(name, "set", "custom-variable", &[HW_UUID_VAR, uuid.as_str()])
                .await?;
        }
    }

    if let Some(controller) = &target.display_controller {
        if !controller.eq_ignore_ascii_case(&described.display.controller) {
            ctx.client.stop(name, true).await?;
            ctx.ui
                .say(&format!("Modifying VM {name} display controller to {controller}"));
            ctx.client
                .modify(name, "set", "display", &["-c", controller.as_str()])
                .await?;
        }
    }

    if let Some(resolution) = &target.display_resolution {
        if described.resolution().as_deref() != Some(resolution.as_str()) {
            ctx.client.stop(name, true).await?;
            ctx.ui
                .say(&format!("Modifying VM {name} display resolution to {resolution}"));
            ctx.client
                .modify(name, "set", "display", &["-r", resolution.as_str()])
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRule;
    use crate::flow::testing::{clone_config, context, fake};
    use crate::vm_state::VmStatus;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn descriptor(hard_drive: u64, cpu: u32, ram: &str) -> VmDescriptor {
        VmDescriptor {
            uuid: "foo-uuid".into(),
            name: "foo".into(),
            cpu_cores: cpu,
            ram: ram.into(),
            status: VmStatus::Stopped,
            hard_drive,
            ..Default::default()
        }
    }

    fn rule(guest: u16, host: u16, name: &str) -> PortRule {
        PortRule {
            guest_port: guest,
            host_port: host,
            rule_name: name.into(),
        }
    }

    // ── Resources ──

    #[tokio::test]
    async fn equal_values_issue_no_calls() {
        let mut config = clone_config("base");
        config.resources.disk_size = Some("40G".into());
        config.resources.ram_size = Some("8g".into());
        config.resources.cpu_count = Some(4);
        let (ctx, _ui) = context(config);

        let changed = converge_resources(&ctx, &descriptor(40 * GIB, 4, "8G"))
            .await
            .unwrap();
        assert!(!changed);
        assert!(fake(&ctx).commands().is_empty());
    }

    #[tokio::test]
    async fn shrink_fails_before_any_call() {
        let mut config = clone_config("base");
        config.resources.disk_size = Some("20G".into());
        config.resources.ram_size = Some("16G".into());
        let (ctx, _ui) = context(config);

        let err = converge_resources(&ctx, &descriptor(40 * GIB, 2, "4G"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Invariant { .. }));
        assert!(fake(&ctx).commands().is_empty());
    }

    #[tokio::test]
    async fn disk_growth_resizes_guest_and_stops_again() {
        let mut config = clone_config("base");
        config.resources.disk_size = Some("80G".into());
        let (ctx, _ui) = context(config);

        assert!(
            converge_resources(&ctx, &descriptor(40 * GIB, 2, "4G"))
                .await
                .unwrap()
        );
        assert_eq!(
            fake(&ctx).commands(),
            vec![
                "stop --force foo",
                "modify foo set hard-drive -s 80G",
                "run foo diskutil apfs resizeContainer disk1 0",
                "stop --force foo",
            ]
        );
    }

    #[tokio::test]
    async fn failed_guest_resize_only_warns() {
        let mut config = clone_config("base");
        config.resources.disk_size = Some("80G".into());
        let (ctx, ui) = context(config);
        fake(&ctx).guest("run foo diskutil apfs resizeContainer disk1 0", 1, "");

        converge_resources(&ctx, &descriptor(40 * GIB, 2, "4G"))
            .await
            .unwrap();
        assert_eq!(ui.errors().len(), 1);
        assert_eq!(fake(&ctx).matching("stop").len(), 2);
    }

    #[tokio::test]
    async fn ram_and_cpu_modified_independently() {
        let mut config = clone_config("base");
        config.resources.ram_size = Some("16G".into());
        config.resources.cpu_count = Some(8);
        let (ctx, _ui) = context(config);

        converge_resources(&ctx, &descriptor(40 * GIB, 4, "8G"))
            .await
            .unwrap();
        assert_eq!(
            fake(&ctx).commands(),
            vec![
                "stop --force foo",
                "modify foo set ram 16G",
                "stop --force foo",
                "modify foo set cpu -c 8",
            ]
        );
    }

    // ── Properties ──

    fn describe_with_port(ctx: &BuildContext<crate::anka::testing::FakeRunner>, host_port: u16) {
        fake(ctx).reply(
            "describe foo",
            serde_json::json!({
                "name": "foo",
                "network_cards": [{
                    "index": 0,
                    "mode": "shared",
                    "port_forwarding_rules": [
                        {"guest_port": 22, "host_port": host_port, "rule_name": "ssh", "protocol": "tcp"}
                    ]
                }],
                "display": {"controller": "pg", "frame_buffers": [{"width": 1024, "height": 768}]},
                "custom_variables": {"hw.uuid": "AAAA"}
            }),
        );
    }

    #[tokio::test]
    async fn nothing_configured_skips_describe() {
        let (ctx, _ui) = context(clone_config("base"));
        converge_properties(&ctx, "foo").await.unwrap();
        assert!(fake(&ctx).commands().is_empty());
    }

    #[tokio::test]
    async fn conflicting_port_is_skipped_with_error() {
        let mut config = clone_config("base");
        config.properties.port_rules = vec![rule(80, 8080, "web"), rule(443, 8443, "tls")];
        let (ctx, ui) = context(config);
        describe_with_port(&ctx, 8080);

        converge_properties(&ctx, "foo").await.unwrap();

        assert_eq!(
            fake(&ctx).matching("modify"),
            vec!["modify foo add port-forwarding --host-port 8443 --guest-port 443 tls"]
        );
        assert_eq!(
            ui.errors(),
            vec!["Found an existing host port rule (8080)! Skipping without setting..."]
        );
    }

    #[tokio::test]
    async fn force_applies_conflicting_port() {
        let mut config = clone_config("base");
        config.force = true;
        config.properties.port_rules = vec![rule(80, 8080, "web")];
        let (ctx, ui) = context(config);
        describe_with_port(&ctx, 8080);

        converge_properties(&ctx, "foo").await.unwrap();
        assert_eq!(fake(&ctx).matching("modify").len(), 1);
        assert!(ui.errors().is_empty());
    }

    #[tokio::test]
    async fn duplicate_desired_host_ports_conflict_with_each_other() {
        let mut config = clone_config("base");
        config.properties.port_rules = vec![rule(80, 9000, "a"), rule(81, 9000, "b"), rule(82, 0, "c"), rule(83, 0, "d")];
        let (ctx, ui) = context(config);
        describe_with_port(&ctx, 0);

        converge_properties(&ctx, "foo").await.unwrap();
        assert_eq!(fake(&ctx).matching("modify").len(), 3);
        assert_eq!(ui.errors().len(), 1);
    }

    #[tokio::test]
    async fn identity_and_display_only_change_when_different() {
        let mut config = clone_config("base");
        config.properties.hw_uuid = Some("AAAA".into());
        config.properties.display_controller = Some("fbuf".into());
        config.properties.display_resolution = Some("1024x768".into());
        let (ctx, _ui) = context(config);
        describe_with_port(&ctx, 2222);

        converge_properties(&ctx, "foo").await.unwrap();
        assert_eq!(
            fake(&ctx).commands(),
            vec![
                "describe foo",
                "stop --force foo",
                "modify foo set display -c fbuf"
            ]
        );
    }

    #[tokio::test]
    async fn modify_error_halts_and_keeps_earlier_changes() {
        let mut config = clone_config("base");
        config.properties.port_rules = vec![rule(80, 8080, "web")];
        config.properties.hw_uuid = Some("BBBB".into());
        let (ctx, _ui) = context(config);
        describe_with_port(&ctx, 0);
        fake(&ctx).fail("modify foo set custom-variable hw.UUID BBBB", 9, "denied");

        let err = converge_properties(&ctx, "foo").await.unwrap_err();
        assert!(matches!(err, ProvisionError::Tool { code: 9, .. }));
        // the port rule stays, nothing is reverted
        assert_eq!(fake(&ctx).matching("modify").len(), 2);
        assert!(fake(&ctx).matching("delete").is_empty());
    }
}
