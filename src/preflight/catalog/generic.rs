//! Checks shared across operating systems.

use super::ensure;
use super::windows;
use crate::command::{CommandRunner, args};
use crate::host_fs;
use crate::preflight::check::{Check, CheckError, CheckGroup};
use crate::preflight::context::{CheckContext, HostOs};
use crate::preflight::host::Host;

pub(super) fn identity_checks<'a, R: CommandRunner>(
    ctx: &CheckContext,
    host: &'a Host<R>,
) -> Vec<Check<'a>> {
    let mut checks = Vec::new();
    if ctx.os == HostOs::Windows {
        checks.push(windows::admin_group_check(host));
        return checks;
    }
    checks.push(
        Check::new(
            CheckGroup::Identity,
            "check-root-user",
            "Checking if running as non-root",
            move || check_not_root(host),
        )
        .no_fix("Run nodeprep as a normal user"),
    );
    if ctx.os == HostOs::Linux {
        checks.push(
            Check::new(
                CheckGroup::Identity,
                "check-wsl2",
                "Checking if running inside WSL2",
                move || check_not_wsl2(host),
            )
            .no_fix("nodeprep is not supported inside WSL2; run it on a Linux host or virtual machine"),
        );
    }
    checks
}

pub(super) fn artifact_checks<R: CommandRunner>(host: &Host<R>) -> Vec<Check<'_>> {
    vec![
        Check::new(
            CheckGroup::Artifacts,
            "check-bundle-extracted",
            "Checking if the cluster bundle is extracted in the cache",
            move || host.bundle_cache().is_cached().map_err(CheckError::from),
        )
        .with_fix("Installing the cluster bundle into the cache", move || {
            host.bundle_cache().ensure_cached().map_err(CheckError::from)
        })
        .setup_only(),
    ]
}

fn check_not_root<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let output = host.runner().run_checked("id", &args(["-u"]))?;
    ensure(
        output.stdout.trim() != "0",
        "nodeprep should not be run as root",
    )
}

fn check_not_wsl2<R: CommandRunner>(host: &Host<R>) -> Result<(), CheckError> {
    let path = host.path("/proc/version");
    if !host_fs::exists(&path)? {
        return Ok(());
    }
    let version = host_fs::read_to_string(&path)?.to_ascii_lowercase();
    ensure(
        !version.contains("microsoft"),
        "nodeprep does not support running inside WSL2",
    )
}
