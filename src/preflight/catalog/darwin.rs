//! hyperkit checks for macOS.

use camino::Utf8PathBuf;

use super::ensure;
use crate::command::{CommandRunner, args};
use crate::host_fs;
use crate::preflight::check::{Check, CheckError, CheckGroup};
use crate::preflight::host::Host;

const HYPERKIT_BIN: &str = "hyperkit";
const RESOLVER_DIR: &str = "/etc/resolver";
const RESOLVER_FILE: &str = "/etc/resolver/testing";
const HOSTS_FILE: &str = "/etc/hosts";

pub(super) fn virtualization_checks<R: CommandRunner>(host: &Host<R>) -> Vec<Check<'_>> {
    vec![
        Check::new(
            CheckGroup::Virtualization,
            "check-hyperkit-installed",
            "Checking if hyperkit is installed with root setuid",
            move || check_hyperkit_installed(host),
        )
        .with_fix("Setting root setuid on hyperkit", move || {
            fix_hyperkit_installed(host)
        }),
        Check::new(
            CheckGroup::Virtualization,
            "check-hyperkit-driver",
            "Checking if the hyperkit machine driver is installed",
            move || host.driver_cache().is_cached().map_err(CheckError::from),
        )
        .with_fix("Installing the hyperkit machine driver", move || {
            host.driver_cache().ensure_cached().map_err(CheckError::from)
        }),
        Check::cleanup_only(
            CheckGroup::Virtualization,
            "remove-vm",
            "Removing the cluster VM if it exists",
            move || remove_machine_dir(host),
        ),
    ]
}

pub(super) fn network_checks<R: CommandRunner>(host: &Host<R>) -> Vec<Check<'_>> {
    vec![
        Check::new(
            CheckGroup::Network,
            "check-resolver-file-permissions",
            "Checking file permissions for /etc/resolver/testing",
            move || {
                let path = host.path(RESOLVER_FILE);
                ensure(
                    host_fs::is_writable(&path),
                    format!("{path} is not writable by the current user"),
                )
            },
        )
        .with_fix("Setting file permissions for /etc/resolver/testing", move || {
            fix_user_owned(host, RESOLVER_FILE)
        }),
        Check::cleanup_only(
            CheckGroup::Network,
            "remove-resolver-file",
            "Removing /etc/resolver/testing",
            move || {
                host_fs::remove_file_as_root(
                    host.runner(),
                    "Removing the cluster DNS resolver file",
                    &host.path(RESOLVER_FILE),
                )?;
                Ok(())
            },
        ),
        Check::new(
            CheckGroup::Network,
            "check-hosts-file-permissions",
            "Checking file permissions for /etc/hosts",
            move || {
                let path = host.path(HOSTS_FILE);
                ensure(
                    host_fs::is_writable(&path),
                    format!("{path} is not writable by the current user"),
                )
            },
        )
        .with_fix("Setting file permissions for /etc/hosts", move || {
            fix_user_owned(host, HOSTS_FILE)
        }),
    ]
}

fn hyperkit_path<R: CommandRunner>(host: &Host<R>) -> Utf8PathBuf {
    host.paths().bin_dir.join(HYPERKIT_BIN)
}

/// Returns `true` when `stat -f "%Su %Sp"` output shows a root-owned binary
/// with the setuid bit.
pub(super) fn is_setuid_root(stat: &str) -> bool {
    let mut fields = stat.split_whitespace();
    let owner = fields.next();
    let mode = fields.next().unwrap_or_default();
    owner == Some("root") && mode.chars().nth(3) == Some('s')
}

fn check_hyperkit_installed<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let path = hyperkit_path(host);
    ensure(host_fs::exists(&path)?, format!("{path} is missing"))?;
    let output = host
        .runner()
        .run_checked("stat", &args(["-f", "%Su %Sp", path.as_str()]))?;
    ensure(
        is_setuid_root(&output.stdout),
        format!("{path} does not have root setuid permissions"),
    )
}

fn fix_hyperkit_installed<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let path = hyperkit_path(host);
    if !host_fs::exists(&path)? {
        return Err(CheckError::precondition(format!(
            "{path} is missing; install hyperkit into {} and run setup again",
            host.paths().bin_dir
        )));
    }
    let runner = host.runner();
    runner.run_privileged_checked(
        "Changing ownership of hyperkit",
        "chown",
        &args(["root:wheel", path.as_str()]),
    )?;
    runner.run_privileged_checked(
        "Setting the setuid bit on hyperkit",
        "chmod",
        &args(["u+s,g+x", path.as_str()]),
    )?;
    Ok(())
}

fn remove_machine_dir<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    host_fs::remove_dir_all(&host.paths().machines_dir.join(host.vm_name()))?;
    Ok(())
}

fn fix_user_owned<R: CommandRunner>(host: &Host<R>, file: &str) -> Result<(), CheckError> {
    let runner = host.runner();
    let path = host.path(file);
    let reason = format!("Making {file} writable by {}", host.user());
    if file == RESOLVER_FILE {
        runner.run_privileged_checked(&reason, "mkdir", &args(["-p", host.path(RESOLVER_DIR).as_str()]))?;
        runner.run_privileged_checked(&reason, "touch", &args([path.as_str()]))?;
    }
    runner.run_privileged_checked(&reason, "chown", &args([host.user(), path.as_str()]))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("root -rwsr-x--x\n", true)]
    #[case("root -rwxr-xr-x\n", false)]
    #[case("dev -rwsr-xr-x\n", false)]
    #[case("", false)]
    fn detects_setuid_root(#[case] stat: &str, #[case] expected: bool) {
        assert_eq!(is_setuid_root(stat), expected);
    }
}
