//! File-system helpers used by host probes, fixes, and cleanups.
//!
//! Reads go through cap-std ambient directories so probes never mutate the
//! host. Root-owned files are written and removed via the privileged
//! [`CommandRunner`] path so the escalation reason is always announced.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::{Dir, OpenOptions};
use shell_escape::unix::escape;
use thiserror::Error;

use crate::command::{CommandError, CommandRunner, args};

/// Errors raised by host file helpers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FsError {
    /// Raised when a file or directory cannot be accessed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that was being accessed.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when a path has no usable file name or parent.
    #[error("invalid path {path}")]
    InvalidPath {
        /// The offending path.
        path: Utf8PathBuf,
    },
}

impl FsError {
    fn io(path: &Utf8Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

fn split(path: &Utf8Path) -> Result<(&Utf8Path, &str), FsError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let name = path.file_name().ok_or_else(|| FsError::InvalidPath {
        path: path.to_path_buf(),
    })?;
    Ok((parent, name))
}

fn open_parent(path: &Utf8Path) -> Result<(Dir, &str), FsError> {
    let (parent, name) = split(path)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| FsError::io(parent, &err))?;
    Ok((dir, name))
}

/// Returns `true` when `path` exists. A missing parent directory counts as
/// absence.
///
/// # Errors
///
/// Returns [`FsError`] when existence cannot be determined.
pub fn exists(path: &Utf8Path) -> Result<bool, FsError> {
    let (parent, name) = split(path)?;
    let parent_exists = Dir::open_ambient_dir(parent, ambient_authority());
    let Ok(dir) = parent_exists else {
        return Ok(false);
    };
    dir.try_exists(name).map_err(|err| FsError::io(path, &err))
}

/// Reads `path` into a string.
///
/// # Errors
///
/// Returns [`FsError`] when the file cannot be read.
pub fn read_to_string(path: &Utf8Path) -> Result<String, FsError> {
    let (dir, name) = open_parent(path)?;
    dir.read_to_string(name).map_err(|err| FsError::io(path, &err))
}

/// Returns `true` when `path` exists and its contents equal `expected`.
///
/// # Errors
///
/// Returns [`FsError`] when an existing file cannot be read.
pub fn content_matches(path: &Utf8Path, expected: &str) -> Result<bool, FsError> {
    if !exists(path)? {
        return Ok(false);
    }
    Ok(read_to_string(path)? == expected)
}

/// Returns `true` when the current user can open `path` for reading and
/// writing. The file is opened without truncation and closed immediately.
#[must_use]
pub fn is_read_writable(path: &Utf8Path) -> bool {
    let Ok((dir, name)) = open_parent(path) else {
        return false;
    };
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    dir.open_with(name, &options).is_ok()
}

/// Returns `true` when the current user can append to `path`.
#[must_use]
pub fn is_writable(path: &Utf8Path) -> bool {
    let Ok((dir, name)) = open_parent(path) else {
        return false;
    };
    let mut options = OpenOptions::new();
    options.append(true);
    dir.open_with(name, &options).is_ok()
}

/// Writes a user-owned file, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`FsError`] when the directory or file cannot be written.
pub fn write_file(path: &Utf8Path, contents: &str) -> Result<(), FsError> {
    let (parent, name) = split(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority())
        .map_err(|err| FsError::io(parent, &err))?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| FsError::io(parent, &err))?;
    dir.write(name, contents).map_err(|err| FsError::io(path, &err))
}

/// Removes a user-owned directory tree. Absence counts as success.
///
/// # Errors
///
/// Returns [`FsError`] when an existing directory cannot be removed.
pub fn remove_dir_all(path: &Utf8Path) -> Result<(), FsError> {
    if !exists(path)? {
        return Ok(());
    }
    let (dir, name) = open_parent(path)?;
    dir.remove_dir_all(name).map_err(|err| FsError::io(path, &err))
}

/// Writes a root-owned file through `sudo sh -c` and applies `mode`.
///
/// # Errors
///
/// Returns [`CommandError`] when escalation or the write fails.
pub fn write_file_as_root<R: CommandRunner + ?Sized>(
    runner: &R,
    reason: &str,
    contents: &str,
    path: &Utf8Path,
    mode: &str,
) -> Result<(), CommandError> {
    let quoted_path = escape(path.as_str().into());
    let script = format!(
        "mkdir -p {parent} && printf '%s' {contents} > {quoted_path} && chmod {mode} {quoted_path}",
        parent = escape(path.parent().map_or("/", Utf8Path::as_str).into()),
        contents = escape(contents.into()),
    );
    runner.run_privileged_checked(reason, "sh", &args(["-c", script.as_str()]))?;
    Ok(())
}

/// Removes a root-owned file with `sudo rm -f`. Absence counts as success and
/// no escalation happens when the file is already gone.
///
/// # Errors
///
/// Returns [`CommandError`] when escalation or removal fails.
pub fn remove_file_as_root<R: CommandRunner + ?Sized>(
    runner: &R,
    reason: &str,
    path: &Utf8Path,
) -> Result<(), CommandError> {
    if matches!(exists(path), Ok(false)) {
        return Ok(());
    }
    runner.run_privileged_checked(reason, "rm", &args(["-f", path.as_str()]))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    #[fixture]
    fn temp_root() -> (TempDir, Utf8PathBuf) {
        let dir = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp path");
        (dir, root)
    }

    #[rstest]
    fn write_then_read_round_trips_and_creates_parents(temp_root: (TempDir, Utf8PathBuf)) {
        let (_guard, root) = temp_root;
        let path = root.join("nested/dir/file.conf");

        write_file(&path, "hello\n").expect("write should succeed");

        assert!(exists(&path).expect("exists"));
        assert!(content_matches(&path, "hello\n").expect("compare"));
        assert!(!content_matches(&path, "other").expect("compare"));
    }

    #[rstest]
    fn missing_parent_counts_as_absent(temp_root: (TempDir, Utf8PathBuf)) {
        let (_guard, root) = temp_root;
        let path = root.join("absent/file");
        assert!(!exists(&path).expect("exists"));
        assert!(!content_matches(&path, "").expect("compare"));
        assert!(!is_read_writable(&path));
    }

    #[rstest]
    fn remove_file_as_root_skips_absent_files(temp_root: (TempDir, Utf8PathBuf)) {
        let (_guard, root) = temp_root;
        let runner = ScriptedRunner::new();

        remove_file_as_root(&runner, "Removing file", &root.join("gone")).expect("absent is ok");

        assert!(runner.invocations().is_empty());
    }

    #[rstest]
    fn write_file_as_root_escapes_contents(temp_root: (TempDir, Utf8PathBuf)) {
        let (_guard, root) = temp_root;
        let runner = ScriptedRunner::new();
        runner.push_success();
        let path = root.join("etc/crc.conf");

        write_file_as_root(&runner, "Writing config", "a='b'\n", &path, "0644")
            .expect("write should succeed");

        let invocations = runner.invocations();
        let invocation = invocations.first().expect("one invocation");
        assert_eq!(invocation.reason.as_deref(), Some("Writing config"));
        let command = invocation.command_string();
        assert!(command.starts_with("sudo sh -c mkdir -p "));
        assert!(command.contains("chmod 0644"));
        assert!(command.contains(r"'a='\''b'\''"));
    }
}
