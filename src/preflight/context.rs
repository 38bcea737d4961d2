//! Facts about the host that decide which checks apply.

use camino::Utf8Path;
use tracing::debug;

use crate::command::{CommandRunner, args};
use crate::config::NetworkMode;
use crate::host_fs;

/// Operating system family.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum HostOs {
    /// Linux with libvirt.
    Linux,
    /// macOS with hyperkit.
    MacOs,
    /// Windows with Hyper-V.
    Windows,
}

impl HostOs {
    /// Family of the running binary.
    #[must_use]
    pub const fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(target_os = "windows") {
            Self::Windows
        } else {
            Self::Linux
        }
    }
}

/// Fields of `/etc/os-release` the checks care about.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OsRelease {
    /// `ID`, lowercased.
    pub id: String,
    /// `ID_LIKE`, split on whitespace.
    pub id_like: Vec<String>,
    /// `VERSION_ID`.
    pub version_id: Option<String>,
}

impl OsRelease {
    /// Parses `os-release` contents. Unknown keys and malformed lines are
    /// ignored.
    #[must_use]
    pub fn parse(contents: &str) -> Self {
        let mut release = Self::default();
        for line in contents.lines() {
            let Some((key, raw)) = line.trim().split_once('=') else {
                continue;
            };
            let value = raw.trim().trim_matches(|c| c == '"' || c == '\'');
            match key.trim() {
                "ID" => release.id = value.to_ascii_lowercase(),
                "ID_LIKE" => {
                    release.id_like = value
                        .split_whitespace()
                        .map(str::to_ascii_lowercase)
                        .collect();
                }
                "VERSION_ID" => release.version_id = Some(value.to_owned()),
                _ => {}
            }
        }
        release
    }

    /// Returns `true` when the distro is `family` or derives from it.
    #[must_use]
    pub fn is_like(&self, family: &str) -> bool {
        self.id == family || self.id_like.iter().any(|like| like == family)
    }
}

/// DNS resolver the host network checks integrate with.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ResolverBackend {
    /// `systemd-resolved` is active; VM names are resolved through a
    /// NetworkManager dispatcher script.
    SystemdResolved,
    /// NetworkManager's bundled dnsmasq plugin.
    #[default]
    Dnsmasq,
}

/// Everything the catalog needs to decide which checks apply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckContext {
    /// Operating system family.
    pub os: HostOs,
    /// Linux distribution, when known.
    pub distro: Option<OsRelease>,
    /// Configured network mode.
    pub network_mode: NetworkMode,
    /// DNS resolver backend.
    pub resolver: ResolverBackend,
}

impl CheckContext {
    /// Context with no distro information and the dnsmasq resolver.
    #[must_use]
    pub const fn new(os: HostOs, network_mode: NetworkMode) -> Self {
        Self {
            os,
            distro: None,
            network_mode,
            resolver: ResolverBackend::Dnsmasq,
        }
    }

    /// Sets the distribution.
    #[must_use]
    pub fn with_distro(mut self, distro: OsRelease) -> Self {
        self.distro = Some(distro);
        self
    }

    /// Sets the resolver backend.
    #[must_use]
    pub const fn with_resolver(mut self, resolver: ResolverBackend) -> Self {
        self.resolver = resolver;
        self
    }

    /// Inspects the running host. `os_release` is usually
    /// `/etc/os-release`; a missing file leaves the distro unknown.
    #[must_use]
    pub fn inspect<R: CommandRunner>(runner: &R, os_release: &Utf8Path, network_mode: NetworkMode) -> Self {
        let context = Self::new(HostOs::current(), network_mode);
        if context.os != HostOs::Linux {
            return context;
        }
        let distro = host_fs::read_to_string(os_release)
            .map(|contents| OsRelease::parse(&contents))
            .ok();
        let resolver = if is_unit_active(runner, "systemd-resolved") {
            ResolverBackend::SystemdResolved
        } else {
            ResolverBackend::Dnsmasq
        };
        debug!(?distro, ?resolver, "inspected host");
        Self {
            distro,
            resolver,
            ..context
        }
    }

    /// Returns `true` for Ubuntu and its derivatives.
    #[must_use]
    pub fn is_ubuntu_like(&self) -> bool {
        self.distro.as_ref().is_some_and(|distro| distro.is_like("ubuntu"))
    }

    /// Returns `true` for Debian-family distributions, which install
    /// packages with `apt-get`.
    #[must_use]
    pub fn is_debian_like(&self) -> bool {
        self.distro
            .as_ref()
            .is_some_and(|distro| distro.is_like("debian") || distro.is_like("ubuntu"))
    }
}

/// Returns `true` when `systemctl is-active <unit>` succeeds.
pub(crate) fn is_unit_active<R: CommandRunner + ?Sized>(runner: &R, unit: &str) -> bool {
    runner
        .run("systemctl", &args(["is-active", "--quiet", unit]))
        .is_ok_and(|output| output.is_success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::rstest;

    const UBUNTU: &str = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"22.04\"\n";
    const MINT: &str = "ID=linuxmint\nID_LIKE=\"ubuntu debian\"\n";
    const FEDORA: &str = "ID=fedora\nVERSION_ID=39\n";

    #[test]
    fn parses_quoted_values() {
        let release = OsRelease::parse(UBUNTU);
        assert_eq!(release.id, "ubuntu");
        assert_eq!(release.id_like, vec![String::from("debian")]);
        assert_eq!(release.version_id.as_deref(), Some("22.04"));
    }

    #[rstest]
    #[case(UBUNTU, true, true)]
    #[case(MINT, true, true)]
    #[case(FEDORA, false, false)]
    fn classifies_distro_families(#[case] contents: &str, #[case] ubuntu: bool, #[case] debian: bool) {
        let context = CheckContext::new(HostOs::Linux, NetworkMode::System)
            .with_distro(OsRelease::parse(contents));
        assert_eq!(context.is_ubuntu_like(), ubuntu);
        assert_eq!(context.is_debian_like(), debian);
    }

    #[test]
    fn unknown_distro_is_not_ubuntu() {
        let context = CheckContext::new(HostOs::Linux, NetworkMode::User);
        assert!(!context.is_ubuntu_like());
        assert_eq!(context.resolver, ResolverBackend::Dnsmasq);
    }

    #[test]
    fn unit_activity_follows_exit_status() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        runner.push_failure(3);
        runner.push_spawn_error("systemctl");

        assert!(is_unit_active(&runner, "libvirtd"));
        assert!(!is_unit_active(&runner, "libvirtd"));
        assert!(!is_unit_active(&runner, "libvirtd"));
        assert_eq!(
            runner.command_strings().first().map(String::as_str),
            Some("systemctl is-active --quiet libvirtd")
        );
    }
}
