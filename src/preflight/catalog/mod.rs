//! Ordered check catalogs per operating system and network mode.
//!
//! A catalog is the concatenation of the Identity, Virtualization,
//! Services, Network, and Artifacts groups, in that order. Which checks land
//! in each group depends on the [`CheckContext`].

mod darwin;
mod generic;
mod linux;
mod network;
mod windows;

use std::ffi::OsString;

use super::check::{Check, CheckError};
use super::context::{CheckContext, HostOs};
use super::host::Host;
use crate::command::{CommandRunner, args};
use crate::config::NetworkMode;

const LIBVIRT_URI: &str = "qemu:///system";

/// Builds the checks that apply to `ctx`, in execution order.
#[must_use]
pub fn preflight_checks<'a, R: CommandRunner>(ctx: &CheckContext, host: &'a Host<R>) -> Vec<Check<'a>> {
    let mut checks = generic::identity_checks(ctx, host);
    match ctx.os {
        HostOs::Linux => {
            checks.extend(linux::virtualization_checks(ctx, host));
            checks.extend(linux::service_checks(host));
            checks.extend(network::linux_network_checks(ctx, host));
        }
        HostOs::MacOs => {
            checks.extend(darwin::virtualization_checks(host));
            if ctx.network_mode == NetworkMode::System {
                checks.extend(darwin::network_checks(host));
            }
        }
        HostOs::Windows => {
            checks.extend(windows::virtualization_checks(host));
            checks.extend(windows::service_checks(host));
        }
    }
    checks.extend(generic::artifact_checks(host));
    checks
}

/// Builds every check that exists for the host's operating system,
/// regardless of network mode or distro-specific conditions. Used to
/// register the full set of `skip-`/`warn-` settings and for cleanup, which
/// must undo whatever any earlier setup created.
#[must_use]
pub fn all_preflight_checks<'a, R: CommandRunner>(os: HostOs, host: &'a Host<R>) -> Vec<Check<'a>> {
    if os != HostOs::Linux {
        return preflight_checks(&CheckContext::new(os, NetworkMode::System), host);
    }
    let ctx = CheckContext::new(os, NetworkMode::System);
    let mut checks = generic::identity_checks(&ctx, host);
    checks.extend(linux::virtualization_checks(&ctx, host));
    checks.extend(linux::apparmor_checks(host));
    checks.extend(linux::service_checks(host));
    checks.extend(network::network_manager_checks(host));
    checks.extend(network::resolved_checks(host));
    checks.extend(network::dnsmasq_checks(host));
    checks.extend(network::libvirt_network_checks(host));
    checks.extend(network::vsock_checks(host));
    checks.extend(generic::artifact_checks(host));
    checks
}

/// Names of every `skip-`/`warn-` setting the given checks recognise.
#[must_use]
pub fn setting_keys(checks: &[Check<'_>]) -> Vec<String> {
    checks
        .iter()
        .flat_map(|check| [check.skip_key(), check.warn_key()])
        .flatten()
        .collect()
}

/// Fails with [`CheckError::PreconditionNotMet`] unless `condition` holds.
fn ensure(condition: bool, message: impl Into<String>) -> Result<(), CheckError> {
    if condition {
        Ok(())
    } else {
        Err(CheckError::precondition(message))
    }
}

/// `virsh` arguments bound to the system libvirt instance.
fn virsh_args<'s>(items: impl IntoIterator<Item = &'s str>) -> Vec<OsString> {
    let mut argv = args(["--connect", LIBVIRT_URI]);
    argv.extend(items.into_iter().map(OsString::from));
    argv
}
