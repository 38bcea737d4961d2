//! Test support utilities shared across unit and integration tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::artifact::{ArtifactCache, ArtifactError};
use crate::command::{CommandError, CommandOutput, CommandRunner, SUDO_BIN};
use crate::config_store::{ConfigSource, SettingValue};
use crate::preflight::{Host, HostPaths};
use crate::remote::{ControlPlane, RemoteError, RemoteRunner};
use crate::retry::Sleeper;

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// Clones share the same queue and invocation log.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<Result<CommandOutput, CommandError>>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Escalation reason for privileged invocations.
    pub reason: Option<String>,
    /// Whether the invocation went through the unlogged path.
    pub private: bool,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Returns every invocation rendered with
    /// [`CommandInvocation::command_string`].
    #[must_use]
    pub fn command_strings(&self) -> Vec<String> {
        self.invocations
            .borrow()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Number of responses still queued.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.responses.borrow().len()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a successful exit status with stdout text.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(Ok(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Pushes a spawn failure, as if the program were not installed.
    pub fn push_spawn_error(&self, program: &str) {
        self.responses
            .borrow_mut()
            .push_back(Err(CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("No such file or directory (os error 2)"),
            }));
    }

    fn respond(
        &self,
        program: &str,
        args: &[OsString],
        reason: Option<&str>,
        private: bool,
    ) -> Result<CommandOutput, CommandError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            reason: reason.map(str::to_owned),
            private,
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| {
                Err(CommandError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                })
            })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.respond(program, args, None, false)
    }

    fn run_private(
        &self,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, CommandError> {
        self.respond(program, args, None, true)
    }

    fn run_privileged(
        &self,
        reason: &str,
        program: &str,
        args: &[OsString],
    ) -> Result<CommandOutput, CommandError> {
        let mut sudo_args = Vec::with_capacity(args.len() + 1);
        sudo_args.push(OsString::from(program));
        sudo_args.extend(args.iter().cloned());
        self.respond(SUDO_BIN, &sudo_args, Some(reason), false)
    }
}

/// Scripted remote transport implementing both [`RemoteRunner`] and
/// [`ControlPlane`].
///
/// Responses are consumed in FIFO order; an exhausted queue yields a
/// transport error. Control-plane commands are recorded as their arguments
/// joined by spaces.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRemote {
    responses: Rc<RefCell<VecDeque<Result<String, RemoteError>>>>,
    commands: Rc<RefCell<Vec<(String, bool)>>>,
}

impl ScriptedRemote {
    /// Creates a transport with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful response.
    pub fn push_ok(&self, stdout: impl Into<String>) {
        self.responses.borrow_mut().push_back(Ok(stdout.into()));
    }

    /// Queues a failed command with the given stderr.
    pub fn push_failure(&self, stderr: impl Into<String>) {
        self.responses
            .borrow_mut()
            .push_back(Err(RemoteError::Failure {
                command: String::from("scripted"),
                status: Some(1),
                status_text: String::from("1"),
                stderr: stderr.into(),
            }));
    }

    /// Commands received so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .borrow()
            .iter()
            .map(|(command, _)| command.clone())
            .collect()
    }

    /// Number of commands received through the private path.
    #[must_use]
    pub fn private_count(&self) -> usize {
        self.commands
            .borrow()
            .iter()
            .filter(|(_, private)| *private)
            .count()
    }

    fn respond(&self, command: String, private: bool) -> Result<String, RemoteError> {
        self.commands.borrow_mut().push((command, private));
        self.responses.borrow_mut().pop_front().unwrap_or_else(|| {
            Err(RemoteError::Command(CommandError::Spawn {
                program: String::from("ssh"),
                message: String::from("no scripted response available"),
            }))
        })
    }
}

impl RemoteRunner for ScriptedRemote {
    fn run(&self, command: &str) -> Result<String, RemoteError> {
        self.respond(command.to_owned(), false)
    }

    fn run_private(&self, command: &str) -> Result<String, RemoteError> {
        self.respond(command.to_owned(), true)
    }
}

impl ControlPlane for ScriptedRemote {
    fn run_command(&self, args: &[&str]) -> Result<String, RemoteError> {
        self.respond(args.join(" "), false)
    }

    fn run_command_private(&self, args: &[&str]) -> Result<String, RemoteError> {
        self.respond(args.join(" "), true)
    }
}

/// Sleeper that records requested durations instead of blocking.
#[derive(Clone, Debug, Default)]
pub struct RecordingSleeper {
    durations: Rc<RefCell<Vec<Duration>>>,
}

impl RecordingSleeper {
    /// Creates a sleeper with an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sleeps requested.
    #[must_use]
    pub fn count(&self) -> usize {
        self.durations.borrow().len()
    }

    /// Durations requested, in order.
    #[must_use]
    pub fn durations(&self) -> Vec<Duration> {
        self.durations.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.durations.borrow_mut().push(duration);
    }
}

/// Artifact cache whose presence is a shared flag.
///
/// Clones share state, so a test can keep a handle after boxing the cache
/// into a host.
#[derive(Clone, Debug, Default)]
pub struct FakeArtifactCache {
    present: Rc<Cell<bool>>,
    installable: bool,
    installs: Rc<Cell<usize>>,
}

impl FakeArtifactCache {
    /// Cache that already holds the artifact.
    #[must_use]
    pub fn cached() -> Self {
        Self {
            present: Rc::new(Cell::new(true)),
            installable: true,
            installs: Rc::default(),
        }
    }

    /// Empty cache that installs successfully.
    #[must_use]
    pub fn missing() -> Self {
        Self {
            present: Rc::default(),
            installable: true,
            installs: Rc::default(),
        }
    }

    /// Empty cache whose installation fails.
    #[must_use]
    pub fn broken() -> Self {
        Self::default()
    }

    /// Whether the artifact is currently present.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.present.get()
    }

    /// Number of installation attempts.
    #[must_use]
    pub fn install_count(&self) -> usize {
        self.installs.get()
    }
}

impl ArtifactCache for FakeArtifactCache {
    fn is_cached(&self) -> Result<(), ArtifactError> {
        if self.present.get() {
            Ok(())
        } else {
            Err(ArtifactError::NotCached {
                name: String::from("fake"),
                path: Utf8PathBuf::from("/cache/fake"),
            })
        }
    }

    fn ensure_cached(&self) -> Result<(), ArtifactError> {
        self.installs.set(self.installs.get() + 1);
        if self.installable {
            self.present.set(true);
            Ok(())
        } else {
            Err(ArtifactError::MissingSource {
                name: String::from("fake"),
                path: Utf8PathBuf::from("/cache/fake"),
            })
        }
    }
}

/// Builds a [`Host`] over `runner` whose system paths and tool directories
/// live below `root`. Sleeps are recorded, never slept.
#[must_use]
pub fn scripted_host(
    runner: ScriptedRunner,
    root: &Utf8Path,
    driver_cache: FakeArtifactCache,
    bundle_cache: FakeArtifactCache,
) -> Host<ScriptedRunner> {
    let state = root.join("home/dev/.nodeprep");
    Host::new(
        runner,
        HostPaths {
            cache_dir: state.join("cache"),
            bin_dir: state.join("bin"),
            machines_dir: state.join("machines"),
            executable: root.join("usr/local/bin/nodeprep"),
        },
        "crc",
        "dev",
        Box::new(driver_cache),
        Box::new(bundle_cache),
    )
    .with_fs_root(root)
    .with_sleeper(Box::new(RecordingSleeper::new()))
}

/// In-memory [`ConfigSource`].
#[derive(Clone, Debug, Default)]
pub struct MemoryConfig {
    values: BTreeMap<String, SettingValue>,
}

impl MemoryConfig {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a boolean setting.
    #[must_use]
    pub fn with_bool(mut self, key: &str, value: bool) -> Self {
        self.values.insert(key.to_owned(), SettingValue::Bool(value));
        self
    }

    /// Adds an arbitrary setting.
    #[must_use]
    pub fn with_value(mut self, key: &str, value: SettingValue) -> Self {
        self.values.insert(key.to_owned(), value);
        self
    }
}

impl ConfigSource for MemoryConfig {
    fn get_bool(&self, key: &str) -> bool {
        self.values
            .get(key)
            .and_then(SettingValue::as_bool)
            .unwrap_or(false)
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).map(ToString::to_string)
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(SettingValue::Int(number)) => Some(*number),
            _ => None,
        }
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    /// Empty values remove the variable for the guard's lifetime.
    #[must_use]
    pub fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                if value.is_empty() {
                    env::remove_var(key);
                } else {
                    env::set_var(key, value);
                }
            }
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
