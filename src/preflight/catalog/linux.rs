//! Virtualization and service checks for libvirt on Linux.

use std::time::Duration;

use tracing::debug;

use super::{ensure, virsh_args};
use crate::command::{CommandError, CommandRunner, args};
use crate::host_fs;
use crate::preflight::check::{Check, CheckError, CheckGroup};
use crate::preflight::context::{CheckContext, is_unit_active};
use crate::preflight::host::Host;
use crate::retry::{RetryError, RetryPolicy};

const LIBVIRT_GROUP: &str = "libvirt";
const LIBVIRT_DAEMON: &str = "libvirtd";
const MIN_LIBVIRT_VERSION: (u32, u32, u32) = (3, 4, 0);
const APPARMOR_TEMPLATE: &str = "/etc/apparmor.d/libvirt/TEMPLATE.qemu";
const LIBVIRT_START_POLICY: RetryPolicy = RetryPolicy::new(5, Duration::from_secs(1));

const DEBIAN_PACKAGES: [&str; 3] = ["libvirt-daemon-system", "libvirt-clients", "qemu-kvm"];
const FEDORA_PACKAGES: [&str; 3] = ["libvirt", "libvirt-daemon-kvm", "qemu-kvm"];

pub(super) fn virtualization_checks<'a, R: CommandRunner>(
    ctx: &CheckContext,
    host: &'a Host<R>,
) -> Vec<Check<'a>> {
    let debian = ctx.is_debian_like();
    let mut checks = vec![
        Check::new(
            CheckGroup::Virtualization,
            "check-virt-enabled",
            "Checking if Virtualization is enabled",
            move || check_virt_enabled(host),
        )
        .no_fix("You need to enable virtualization in BIOS"),
        Check::new(
            CheckGroup::Virtualization,
            "check-kvm-enabled",
            "Checking if KVM is enabled",
            move || check_kvm_enabled(host),
        )
        .with_fix("Setting up KVM", move || fix_kvm_enabled(host)),
        Check::new(
            CheckGroup::Virtualization,
            "check-libvirt-installed",
            "Checking if libvirt is installed",
            move || check_libvirt_installed(host),
        )
        .with_fix("Installing libvirt service and dependencies", move || {
            fix_libvirt_installed(host, debian)
        }),
        Check::new(
            CheckGroup::Virtualization,
            "check-user-in-libvirt-group",
            "Checking if user is part of libvirt group",
            move || check_user_in_libvirt_group(host),
        )
        .with_fix("Adding user to libvirt group", move || {
            fix_user_in_libvirt_group(host)
        }),
        Check::new(
            CheckGroup::Virtualization,
            "check-libvirt-group-active",
            "Checking if active user/process is currently part of the libvirt group",
            move || check_libvirt_group_active(host),
        )
        .no_fix("You need to log out, log in again, and run setup before the libvirt group membership takes effect"),
        Check::new(
            CheckGroup::Virtualization,
            "check-libvirt-version",
            "Checking if libvirt version is >=3.4.0",
            move || check_libvirt_version(host),
        )
        .no_fix("libvirt v3.4.0 or newer is required; upgrade it with your package manager"),
        Check::new(
            CheckGroup::Virtualization,
            "check-libvirt-driver",
            "Checking if libvirt machine driver is installed",
            move || host.driver_cache().is_cached().map_err(CheckError::from),
        )
        .with_fix("Installing libvirt machine driver", move || {
            host.driver_cache().ensure_cached().map_err(CheckError::from)
        }),
        Check::cleanup_only(
            CheckGroup::Virtualization,
            "remove-vm",
            "Removing the cluster VM if it exists",
            move || remove_vm(host),
        ),
    ];
    if ctx.is_ubuntu_like() {
        checks.extend(apparmor_checks(host));
    }
    checks
}

pub(super) fn apparmor_checks<R: CommandRunner>(host: &Host<R>) -> Vec<Check<'_>> {
    vec![
        Check::new(
            CheckGroup::Virtualization,
            "check-apparmor-profile-setup",
            "Checking AppArmor configuration",
            move || check_apparmor(host),
        )
        .with_fix("Updating AppArmor configuration", move || fix_apparmor(host)),
        Check::cleanup_only(
            CheckGroup::Virtualization,
            "remove-apparmor-profile-rule",
            "Restoring the AppArmor configuration",
            move || cleanup_apparmor(host),
        ),
    ]
}

pub(super) fn service_checks<R: CommandRunner>(host: &Host<R>) -> Vec<Check<'_>> {
    vec![
        Check::new(
            CheckGroup::Services,
            "check-libvirt-running",
            "Checking if libvirt daemon is running",
            move || check_libvirt_running(host),
        )
        .with_fix("Starting libvirt service", move || fix_libvirt_running(host)),
    ]
}

fn cpu_flags(cpuinfo: &str) -> impl Iterator<Item = &str> {
    cpuinfo
        .lines()
        .filter(|line| line.starts_with("flags"))
        .filter_map(|line| line.split_once(':'))
        .flat_map(|(_, flags)| flags.split_whitespace())
}

fn check_virt_enabled<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let cpuinfo = host_fs::read_to_string(&host.path("/proc/cpuinfo"))?;
    ensure(
        cpu_flags(&cpuinfo).any(|flag| flag == "vmx" || flag == "svm"),
        "Virtualization is not available for your CPU",
    )
}

fn check_kvm_enabled<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    ensure(
        host_fs::exists(&host.path("/dev/kvm"))?,
        "kvm kernel module is not loaded",
    )
}

fn fix_kvm_enabled<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let cpuinfo = host_fs::read_to_string(&host.path("/proc/cpuinfo")).unwrap_or_default();
    let module = kvm_module_for(&cpuinfo);
    host.runner()
        .run_privileged_checked("Loading kvm module", "modprobe", &args([module]))?;
    Ok(())
}

/// Vendor-specific KVM module; loading it pulls in `kvm` itself.
fn kvm_module_for(cpuinfo: &str) -> &'static str {
    if cpu_flags(cpuinfo).any(|flag| flag == "vmx") {
        "kvm_intel"
    } else if cpu_flags(cpuinfo).any(|flag| flag == "svm") {
        "kvm_amd"
    } else {
        "kvm"
    }
}

fn check_libvirt_installed<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    match host.runner().run("virsh", &args(["--version"])) {
        Ok(output) if output.is_success() => Ok(()),
        Ok(_) | Err(CommandError::Spawn { .. }) => {
            Err(CheckError::precondition("virsh was not found in PATH"))
        }
        Err(err) => Err(err.into()),
    }
}

fn fix_libvirt_installed<R: CommandRunner>(host: &Host<R>, debian: bool) -> Result<(), CheckError> {
    let (installer, packages) = if debian {
        ("apt-get", DEBIAN_PACKAGES)
    } else {
        ("dnf", FEDORA_PACKAGES)
    };
    let mut argv = args(["install", "-y"]);
    argv.extend(args(packages));
    host.runner()
        .run_privileged_checked("Installing virtualization packages", installer, &argv)?;
    Ok(())
}

fn group_names<R: CommandRunner>(host: &Host<R>, user: Option<&str>) -> Result<Vec<String>, CheckError> {
    let mut argv = args(["-Gn"]);
    argv.extend(args(user));
    let output = host.runner().run_checked("id", &argv)?;
    Ok(output.stdout.split_whitespace().map(str::to_owned).collect())
}

fn check_user_in_libvirt_group<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let groups = group_names(host, Some(host.user()))?;
    ensure(
        groups.iter().any(|group| group == LIBVIRT_GROUP),
        format!("{} is not part of the {LIBVIRT_GROUP} group", host.user()),
    )
}

fn fix_user_in_libvirt_group<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    host.runner().run_privileged_checked(
        "Adding user to the libvirt group",
        "usermod",
        &args(["-a", "-G", LIBVIRT_GROUP, host.user()]),
    )?;
    Ok(())
}

fn check_libvirt_group_active<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let groups = group_names(host, None)?;
    ensure(
        groups.iter().any(|group| group == LIBVIRT_GROUP),
        format!("the {LIBVIRT_GROUP} group is not active in the current session"),
    )
}

/// Parses `major[.minor[.patch]]`; missing components read as zero.
pub(super) fn parse_version(raw: &str) -> Option<(u32, u32, u32)> {
    let mut parts = raw.trim().split('.').map(str::parse::<u32>);
    let major = parts.next()?.ok()?;
    let minor = parts.next().transpose().ok()?.unwrap_or(0);
    let patch = parts.next().transpose().ok()?.unwrap_or(0);
    Some((major, minor, patch))
}

fn check_libvirt_version<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let output = host.runner().run_checked("virsh", &args(["--version"]))?;
    let raw = output.stdout.trim();
    let version = parse_version(raw)
        .ok_or_else(|| CheckError::precondition(format!("could not parse libvirt version '{raw}'")))?;
    ensure(
        version >= MIN_LIBVIRT_VERSION,
        format!("libvirt v3.4.0 or newer is required and {raw} is installed"),
    )
}

/// State reported by `virsh domstate`, or `None` when the domain is not
/// defined or libvirt is not installed.
fn domain_state<R: CommandRunner>(host: &Host<R>) -> Result<Option<String>, CheckError> {
    match host
        .runner()
        .run("virsh", &virsh_args(["domstate", host.vm_name()]))
    {
        Ok(output) if output.is_success() => Ok(Some(output.stdout.trim().to_owned())),
        Ok(_) | Err(CommandError::Spawn { .. }) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn remove_vm<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let name = host.vm_name();
    if let Some(state) = domain_state(host)? {
        if state == "running" {
            host.runner()
                .run_checked("virsh", &virsh_args(["destroy", name]))?;
        }
        host.runner()
            .run_checked("virsh", &virsh_args(["undefine", "--nvram", name]))?;
    } else {
        debug!(vm = name, "VM is not defined");
    }
    host_fs::remove_dir_all(&host.paths().machines_dir.join(name))?;
    Ok(())
}

fn apparmor_rule<R: CommandRunner>(host: &Host<R>) -> String {
    format!("  \"{}/**\" rk,", host.paths().cache_dir)
}

fn check_apparmor<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let path = host.path(APPARMOR_TEMPLATE);
    if !host_fs::exists(&path)? {
        debug!(%path, "AppArmor libvirt template not present");
        return Ok(());
    }
    let template = host_fs::read_to_string(&path)?;
    let rule = apparmor_rule(host);
    ensure(
        template.lines().any(|line| line.trim() == rule.trim()),
        format!("{path} does not allow access to the cache directory"),
    )
}

/// Adds `rule` as the last line of the profile body.
pub(super) fn insert_rule(template: &str, rule: &str) -> Option<String> {
    let (head, tail) = template.rsplit_once('}')?;
    let separator = if head.ends_with('\n') { "" } else { "\n" };
    Some(format!("{head}{separator}{rule}\n}}{tail}"))
}

/// Drops every line equal to `rule`, ignoring indentation.
pub(super) fn remove_rule(template: &str, rule: &str) -> String {
    let mut kept: String = template
        .lines()
        .filter(|line| line.trim() != rule.trim())
        .collect::<Vec<_>>()
        .join("\n");
    if template.ends_with('\n') {
        kept.push('\n');
    }
    kept
}

fn fix_apparmor<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let path = host.path(APPARMOR_TEMPLATE);
    let template = host_fs::read_to_string(&path)?;
    let updated = insert_rule(&template, &apparmor_rule(host))
        .ok_or_else(|| CheckError::precondition(format!("{path} has no profile body")))?;
    host_fs::write_file_as_root(
        host.runner(),
        "Updating AppArmor configuration",
        &updated,
        &path,
        "0644",
    )?;
    Ok(())
}

fn cleanup_apparmor<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let path = host.path(APPARMOR_TEMPLATE);
    if !host_fs::exists(&path)? {
        return Ok(());
    }
    let template = host_fs::read_to_string(&path)?;
    let restored = remove_rule(&template, &apparmor_rule(host));
    if restored == template {
        return Ok(());
    }
    host_fs::write_file_as_root(
        host.runner(),
        "Restoring AppArmor configuration",
        &restored,
        &path,
        "0644",
    )?;
    Ok(())
}

fn check_libvirt_running<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    ensure(
        is_unit_active(host.runner(), LIBVIRT_DAEMON),
        "libvirtd service is not running",
    )
}

fn fix_libvirt_running<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    host.runner().run_privileged_checked(
        "Starting libvirtd service",
        "systemctl",
        &args(["start", LIBVIRT_DAEMON]),
    )?;
    LIBVIRT_START_POLICY.run_with(host.sleeper(), || {
        check_libvirt_running(host).map_err(RetryError::Retriable)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const TEMPLATE: &str = "profile LIBVIRT_TEMPLATE flags=(attach_disconnected) {\n  #include <abstractions/libvirt-qemu>\n}\n";

    #[rstest]
    #[case("6.0.0", Some((6, 0, 0)))]
    #[case("3.4", Some((3, 4, 0)))]
    #[case("10\n", Some((10, 0, 0)))]
    #[case("unknown", None)]
    #[case("8.x.1", None)]
    fn parses_versions(#[case] raw: &str, #[case] expected: Option<(u32, u32, u32)>) {
        assert_eq!(parse_version(raw), expected);
    }

    #[test]
    fn old_versions_compare_below_minimum() {
        assert!(parse_version("3.3.9").is_some_and(|version| version < MIN_LIBVIRT_VERSION));
        assert!(parse_version("3.10.0").is_some_and(|version| version >= MIN_LIBVIRT_VERSION));
    }

    #[test]
    fn apparmor_rule_round_trips() {
        let rule = "  \"/home/dev/.nodeprep/cache/**\" rk,";
        let updated = insert_rule(TEMPLATE, rule).unwrap_or_else(|| panic!("profile body"));

        assert!(updated.contains("rk,\n}\n"));
        assert_eq!(remove_rule(&updated, rule), TEMPLATE);
    }

    #[rstest]
    #[case("flags\t\t: fpu vme vmx sse\n", "kvm_intel")]
    #[case("flags\t\t: fpu svm\n", "kvm_amd")]
    #[case("processor : 0\n", "kvm")]
    fn selects_kvm_module(#[case] cpuinfo: &str, #[case] module: &str) {
        assert_eq!(kvm_module_for(cpuinfo), module);
    }
}
