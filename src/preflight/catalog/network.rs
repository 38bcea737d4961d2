//! Host network checks for Linux: NetworkManager, DNS integration, the
//! libvirt virtual network, and vsock access for user-mode networking.

use camino::Utf8PathBuf;

use super::{ensure, virsh_args};
use crate::command::{CommandError, CommandRunner, args};
use crate::config::NetworkMode;
use crate::host_fs;
use crate::multi_error::MultiError;
use crate::preflight::check::{Check, CheckError, CheckGroup};
use crate::preflight::context::{CheckContext, ResolverBackend, is_unit_active};
use crate::preflight::host::Host;

const NETWORK_NAME: &str = "crc";
const NETWORK_MANAGER: &str = "NetworkManager";
const NM_DISPATCHER_FILE: &str = "/etc/NetworkManager/dispatcher.d/99-crc.sh";
const NM_CONFIG_FILE: &str = "/etc/NetworkManager/conf.d/crc-nm-dnsmasq.conf";
const DNSMASQ_CONFIG_FILE: &str = "/etc/NetworkManager/dnsmasq.d/crc.conf";
const VSOCK_DEVICE: &str = "/dev/vsock";
const VSOCK_UDEV_RULE_FILE: &str = "/etc/udev/rules.d/99-crc-vsock.rules";
const VSOCK_MODULE_FILE: &str = "/etc/modules-load.d/vhost_vsock.conf";
const BIND_CAPABILITY: &str = "cap_net_bind_service";

const NM_CONFIG: &str = "[main]\ndns=dnsmasq\n";
const DNSMASQ_CONFIG: &str = "server=/apps-crc.testing/192.168.130.11\nserver=/crc.testing/192.168.130.11\n";
const NM_DISPATCHER_SCRIPT: &str = r#"#!/bin/sh
# Forward cluster domains to the VM on the crc bridge.
export LC_ALL=C

if [ "$1" = crc ]; then
    resolvectl domain "$1" ~testing
    resolvectl dns "$1" 192.168.130.11
    resolvectl default-route "$1" false
fi

exit 0
"#;
const VSOCK_UDEV_RULE: &str = "KERNEL==\"vsock\", MODE=\"0660\", OWNER=\"root\", GROUP=\"libvirt\"\n";
const VSOCK_MODULE: &str = "vhost_vsock\n";
const NETWORK_XML: &str = "<network>
  <name>crc</name>
  <forward mode='nat'>
    <nat>
      <port start='1024' end='65535'/>
    </nat>
  </forward>
  <bridge name='crc' stp='on' delay='0'/>
  <mac address='52:54:00:fd:be:d0'/>
  <ip family='ipv4' address='192.168.130.1' prefix='24'>
    <dhcp>
      <host mac='52:54:00:fd:be:d0' ip='192.168.130.11'/>
    </dhcp>
  </ip>
</network>
";

pub(super) fn linux_network_checks<'a, R: CommandRunner>(
    ctx: &CheckContext,
    host: &'a Host<R>,
) -> Vec<Check<'a>> {
    if ctx.network_mode == NetworkMode::User {
        return vsock_checks(host);
    }
    let mut checks = network_manager_checks(host);
    match ctx.resolver {
        ResolverBackend::SystemdResolved => checks.extend(resolved_checks(host)),
        ResolverBackend::Dnsmasq => checks.extend(dnsmasq_checks(host)),
    }
    checks.extend(libvirt_network_checks(host));
    checks
}

pub(super) fn network_manager_checks<R: CommandRunner>(host: &Host<R>) -> Vec<Check<'_>> {
    vec![
        Check::new(
            CheckGroup::Network,
            "check-network-manager-installed",
            "Checking if NetworkManager is installed",
            move || check_network_manager_installed(host),
        )
        .no_fix("NetworkManager is required and must be installed manually"),
        Check::new(
            CheckGroup::Network,
            "check-network-manager-running",
            "Checking if NetworkManager service is running",
            move || {
                ensure(
                    is_unit_active(host.runner(), NETWORK_MANAGER),
                    "NetworkManager.service is not running",
                )
            },
        )
        .no_fix("NetworkManager is required; make sure it is installed and running"),
    ]
}

pub(super) fn resolved_checks<R: CommandRunner>(host: &Host<R>) -> Vec<Check<'_>> {
    vec![
        Check::new(
            CheckGroup::Network,
            "check-systemd-resolved-running",
            "Checking if the systemd-resolved service is running",
            move || {
                ensure(
                    is_unit_active(host.runner(), "systemd-resolved"),
                    "systemd-resolved.service is not running",
                )
            },
        )
        .no_fix("systemd-resolved is required on this distribution; make sure it is installed and running"),
        Check::new(
            CheckGroup::Network,
            "check-crc-nm-dispatcher-file",
            "Checking if the NetworkManager dispatcher file for the cluster network exists",
            move || check_file(host, NM_DISPATCHER_FILE, NM_DISPATCHER_SCRIPT),
        )
        .with_fix(
            "Writing NetworkManager dispatcher file for the cluster network",
            move || fix_nm_dispatcher_file(host),
        ),
        Check::cleanup_only(
            CheckGroup::Network,
            "remove-crc-nm-dispatcher-file",
            "Removing the NetworkManager dispatcher file",
            move || cleanup_nm_dispatcher_file(host),
        ),
    ]
}

pub(super) fn dnsmasq_checks<R: CommandRunner>(host: &Host<R>) -> Vec<Check<'_>> {
    vec![
        Check::new(
            CheckGroup::Network,
            "check-crc-nm-config-file",
            "Checking if NetworkManager is configured to use dnsmasq",
            move || check_file(host, NM_CONFIG_FILE, NM_CONFIG),
        )
        .with_fix("Writing NetworkManager dnsmasq configuration", move || {
            write_nm_file(host, NM_CONFIG_FILE, NM_CONFIG)
        }),
        Check::new(
            CheckGroup::Network,
            "check-crc-dnsmasq-file",
            "Checking if dnsmasq forwards cluster domains to the VM",
            move || check_file(host, DNSMASQ_CONFIG_FILE, DNSMASQ_CONFIG),
        )
        .with_fix("Writing dnsmasq configuration for the cluster", move || {
            write_nm_file(host, DNSMASQ_CONFIG_FILE, DNSMASQ_CONFIG)
        }),
        Check::cleanup_only(
            CheckGroup::Network,
            "remove-crc-nm-dnsmasq-files",
            "Removing NetworkManager dnsmasq configuration",
            move || cleanup_dnsmasq_files(host),
        ),
    ]
}

pub(super) fn libvirt_network_checks<R: CommandRunner>(host: &Host<R>) -> Vec<Check<'_>> {
    vec![
        Check::new(
            CheckGroup::Network,
            "check-crc-network",
            "Checking if libvirt 'crc' network is available",
            move || check_network_defined(host),
        )
        .with_fix("Setting up libvirt 'crc' network", move || {
            fix_network_defined(host)
        }),
        Check::new(
            CheckGroup::Network,
            "check-crc-network-active",
            "Checking if libvirt 'crc' network is active",
            move || check_network_active(host),
        )
        .with_fix("Starting libvirt 'crc' network", move || {
            host.runner()
                .run_checked("virsh", &virsh_args(["net-start", NETWORK_NAME]))?;
            Ok(())
        }),
        Check::cleanup_only(
            CheckGroup::Network,
            "remove-crc-network",
            "Removing libvirt 'crc' network",
            move || cleanup_network(host),
        ),
    ]
}

pub(super) fn vsock_checks<R: CommandRunner>(host: &Host<R>) -> Vec<Check<'_>> {
    vec![
        Check::new(
            CheckGroup::Network,
            "check-vsock",
            "Checking if vsock is correctly configured",
            move || check_vsock(host),
        )
        .with_fix("Setting up vsock support", move || fix_vsock(host)),
        Check::cleanup_only(
            CheckGroup::Network,
            "remove-vsock-configuration",
            "Removing vsock configuration",
            move || cleanup_vsock(host),
        ),
    ]
}

fn check_network_manager_installed<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    match host.runner().run("nmcli", &args(["-v"])) {
        Ok(output) if output.is_success() => Ok(()),
        Ok(_) | Err(CommandError::Spawn { .. }) => {
            Err(CheckError::precondition("NetworkManager CLI nmcli was not found in PATH"))
        }
        Err(err) => Err(err.into()),
    }
}

fn check_file<R: CommandRunner>(host: &Host<R>, file: &str, expected: &str) -> Result<(), CheckError> {
    let path = host.path(file);
    ensure(
        host_fs::content_matches(&path, expected)?,
        format!("{path} is missing or has unexpected content"),
    )
}

fn reload_network_manager<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    host.runner().run_privileged_checked(
        "Reloading NetworkManager",
        "systemctl",
        &args(["reload", NETWORK_MANAGER]),
    )?;
    Ok(())
}

fn fix_nm_dispatcher_file<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    host_fs::write_file_as_root(
        host.runner(),
        "Writing NetworkManager dispatcher file",
        NM_DISPATCHER_SCRIPT,
        &host.path(NM_DISPATCHER_FILE),
        "0755",
    )?;
    reload_network_manager(host)
}

fn cleanup_nm_dispatcher_file<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let path = host.path(NM_DISPATCHER_FILE);
    if !host_fs::exists(&path)? {
        return Ok(());
    }
    host_fs::remove_file_as_root(host.runner(), "Removing NetworkManager dispatcher file", &path)?;
    reload_network_manager(host)
}

fn write_nm_file<R: CommandRunner>(host: &Host<R>, file: &str, contents: &str) -> Result<(), CheckError> {
    host_fs::write_file_as_root(
        host.runner(),
        "Writing NetworkManager configuration",
        contents,
        &host.path(file),
        "0644",
    )?;
    reload_network_manager(host)
}

fn cleanup_dnsmasq_files<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let paths: Vec<Utf8PathBuf> = [NM_CONFIG_FILE, DNSMASQ_CONFIG_FILE]
        .into_iter()
        .map(|file| host.path(file))
        .collect();
    let mut removed_any = false;
    let mut errors = MultiError::new();
    for path in &paths {
        match host_fs::exists(path) {
            Ok(false) => {}
            Ok(true) => {
                removed_any = true;
                if let Err(err) = host_fs::remove_file_as_root(
                    host.runner(),
                    "Removing NetworkManager configuration files",
                    path,
                ) {
                    errors.collect(err);
                }
            }
            Err(err) => errors.collect(err),
        }
    }
    if removed_any {
        reload_network_manager(host).unwrap_or_else(|err| errors.collect(err));
    }
    errors.into_result().map_err(CheckError::from)
}

fn network_info<R: CommandRunner>(host: &Host<R>) -> Result<Option<String>, CheckError> {
    match host
        .runner()
        .run("virsh", &virsh_args(["net-info", NETWORK_NAME]))
    {
        Ok(output) if output.is_success() => Ok(Some(output.stdout)),
        Ok(_) | Err(CommandError::Spawn { .. }) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn check_network_defined<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    ensure(
        network_info(host)?.is_some(),
        format!("libvirt network '{NETWORK_NAME}' is not defined"),
    )
}

fn fix_network_defined<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let definition = host.paths().cache_dir.join("crc-network.xml");
    host_fs::write_file(&definition, NETWORK_XML)?;
    host.runner()
        .run_checked("virsh", &virsh_args(["net-define", definition.as_str()]))?;
    host.runner()
        .run_checked("virsh", &virsh_args(["net-autostart", NETWORK_NAME]))?;
    Ok(())
}

/// Returns `true` when `net-info` output reports `Active: yes`.
pub(super) fn is_network_active(info: &str) -> bool {
    info.lines()
        .filter_map(|line| line.split_once(':'))
        .any(|(key, value)| key.trim() == "Active" && value.trim() == "yes")
}

fn check_network_active<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let info = network_info(host)?.unwrap_or_default();
    ensure(
        is_network_active(&info),
        format!("libvirt network '{NETWORK_NAME}' is not active"),
    )
}

fn cleanup_network<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let Some(info) = network_info(host)? else {
        return Ok(());
    };
    if is_network_active(&info) {
        host.runner()
            .run_checked("virsh", &virsh_args(["net-destroy", NETWORK_NAME]))?;
    }
    host.runner()
        .run_checked("virsh", &virsh_args(["net-undefine", NETWORK_NAME]))?;
    Ok(())
}

fn read_capabilities<R: CommandRunner>(host: &Host<R>) -> Result<String, CheckError> {
    let executable = host.paths().executable.as_str();
    match host.runner().run("getcap", &args([executable])) {
        Ok(output) if output.is_success() => Ok(output.stdout),
        Ok(_) | Err(CommandError::Spawn { .. }) => Ok(String::new()),
        Err(err) => Err(err.into()),
    }
}

/// Only an `eip` grant lets the binary bind low ports; a bare `=p` does not.
fn has_bind_capability<R: CommandRunner>(host: &Host<R>) -> Result<bool, CheckError> {
    let caps = read_capabilities(host)?;
    Ok(caps.contains(&format!("{BIND_CAPABILITY}=eip"))
        || caps.contains(&format!("{BIND_CAPABILITY}+eip")))
}

fn has_any_bind_capability<R: CommandRunner>(host: &Host<R>) -> Result<bool, CheckError> {
    Ok(read_capabilities(host)?.contains(BIND_CAPABILITY))
}

fn check_vsock<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    ensure(
        has_bind_capability(host)?,
        format!(
            "{} is missing the {BIND_CAPABILITY} capability",
            host.paths().executable
        ),
    )?;
    let rule = host.path(VSOCK_UDEV_RULE_FILE);
    ensure(
        host_fs::content_matches(&rule, VSOCK_UDEV_RULE)?,
        format!("{rule} is missing or has unexpected content"),
    )?;
    let device = host.path(VSOCK_DEVICE);
    ensure(
        host_fs::is_read_writable(&device),
        format!("{device} is not readable and writable by the current user"),
    )
}

fn fix_vsock<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let runner = host.runner();
    let executable = host.paths().executable.as_str();
    let capability = format!("{BIND_CAPABILITY}=+eip");
    runner.run_privileged_checked(
        "Granting the port binding capability to nodeprep",
        "setcap",
        &args([capability.as_str(), executable]),
    )?;
    host_fs::write_file_as_root(
        runner,
        "Writing vsock udev rule",
        VSOCK_UDEV_RULE,
        &host.path(VSOCK_UDEV_RULE_FILE),
        "0644",
    )?;
    runner.run_privileged_checked("Reloading udev rules", "udevadm", &args(["control", "--reload"]))?;
    let device = host.path(VSOCK_DEVICE);
    if host_fs::exists(&device)? {
        runner.run_privileged_checked(
            "Applying udev rules to the vsock device",
            "udevadm",
            &args(["trigger", device.as_str()]),
        )?;
    } else {
        runner.run_privileged_checked("Loading vhost_vsock module", "modprobe", &args(["vhost_vsock"]))?;
    }
    host_fs::write_file_as_root(
        runner,
        "Loading vhost_vsock module at boot",
        VSOCK_MODULE,
        &host.path(VSOCK_MODULE_FILE),
        "0644",
    )?;
    Ok(())
}

fn cleanup_vsock<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let runner = host.runner();
    let mut errors = MultiError::new();
    match has_any_bind_capability(host) {
        Ok(true) => {
            let executable = host.paths().executable.as_str();
            if let Err(err) = runner.run_privileged_checked(
                "Removing the port binding capability from nodeprep",
                "setcap",
                &args(["-r", executable]),
            ) {
                errors.collect(err);
            }
        }
        Ok(false) => {}
        Err(err) => errors.collect(err),
    }
    for file in [VSOCK_UDEV_RULE_FILE, VSOCK_MODULE_FILE] {
        if let Err(err) =
            host_fs::remove_file_as_root(runner, "Removing vsock configuration", &host.path(file))
        {
            errors.collect(err);
        }
    }
    errors.into_result().map_err(CheckError::from)
}
