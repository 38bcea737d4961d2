//! Hyper-V checks for Windows. None of these can be fixed automatically.

use super::ensure;
use crate::command::{CommandRunner, args};
use crate::preflight::check::{Check, CheckError, CheckGroup};
use crate::preflight::host::Host;

const POWERSHELL: &str = "powershell.exe";
const HYPERV_ADMINS_SID: &str = "S-1-5-32-578";
const DEFAULT_SWITCH: &str = "Default Switch";

pub(super) fn admin_group_check<R: CommandRunner>(host: &Host<R>) -> Check<'_> {
    Check::new(
        CheckGroup::Identity,
        "check-hyperv-admin-group",
        "Checking if current user is in the Hyper-V Administrators group",
        move || {
            let output = host.runner().run_checked("whoami", &args(["/groups"]))?;
            ensure(
                output.stdout.contains(HYPERV_ADMINS_SID),
                "the current user is not a member of Hyper-V Administrators",
            )
        },
    )
    .no_fix("Add the current user to the Hyper-V Administrators group, then log out and log in again")
}

pub(super) fn virtualization_checks<R: CommandRunner>(host: &Host<R>) -> Vec<Check<'_>> {
    vec![
        Check::new(
            CheckGroup::Virtualization,
            "check-hyperv-installed",
            "Checking if Hyper-V is installed and operational",
            move || {
                let present = powershell(host, "@(Get-CimInstance Win32_ComputerSystem).HypervisorPresent")?;
                ensure(
                    present.eq_ignore_ascii_case("true"),
                    "Hyper-V is not installed or the hypervisor is not running",
                )
            },
        )
        .no_fix("Enable Hyper-V from 'Turn Windows features on or off' and reboot"),
        Check::new(
            CheckGroup::Virtualization,
            "check-hyperv-switch",
            "Checking if the Hyper-V virtual switch exists",
            move || {
                let name = powershell(
                    host,
                    &format!("Get-VMSwitch -Name '{DEFAULT_SWITCH}' | Select-Object -ExpandProperty Name"),
                )?;
                ensure(
                    name == DEFAULT_SWITCH,
                    format!("the Hyper-V virtual switch '{DEFAULT_SWITCH}' was not found"),
                )
            },
        )
        .no_fix("Create the 'Default Switch' virtual switch in Hyper-V Manager"),
    ]
}

pub(super) fn service_checks<R: CommandRunner>(host: &Host<R>) -> Vec<Check<'_>> {
    vec![
        Check::new(
            CheckGroup::Services,
            "check-hyperv-service-running",
            "Checking if the Hyper-V management service is running",
            move || {
                let status = powershell(host, "(Get-Service vmms).Status")?;
                ensure(
                    status.eq_ignore_ascii_case("running"),
                    "the Hyper-V Virtual Machine Management service is not running",
                )
            },
        )
        .no_fix("Start the Hyper-V Virtual Machine Management service"),
    ]
}

fn powershell<R: CommandRunner>(host: &Host<R>, script: &str) -> Result<String, CheckError> {
    let output = host.runner().run_checked(
        POWERSHELL,
        &args(["-NoProfile", "-NonInteractive", "-Command", script]),
    )?;
    Ok(output.stdout.trim().to_owned())
}
