/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::{
    os::unix::ffi::OsStrExt,
    path::Path,
    process::Command,
    time::{Duration, Instant},
};

use log::warn;
use thiserror::Error;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("'{command}' exited with status {status}: {stderr}")]
    NonZeroExit {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("'{command}' timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u32 },
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Abstract operations against a working tree rooted at `repo_root`
/// (spec §4.4). Each may fork a child process; failures are logged by
/// callers but never change a dispatch handler's POSIX-facing return
/// status; the POSIX syscall result is always authoritative for what
/// the caller sees (spec §7).
pub trait RepositoryDriver: Send + Sync {
    /// True iff the backing entry at `fp` is a git-annex placeholder
    /// symlink (present or not materialised locally).
    fn is_annexed(&self, fp: &Path) -> bool;
    /// True iff `fp` matches the repository's ignore rules.
    fn is_ignored(&self, fp: &Path) -> bool;
    /// Convert an annex placeholder into a writable regular file.
    /// Must be idempotent: calling it on an already-unlocked path is a
    /// no-op, since some handlers (`write`) call it unconditionally.
    fn annex_unlock(&self, fp: &Path) -> Result<()>;
    /// Stage `fp` into the annex (or plain git, for files the
    /// repository's annex patterns don't pick up).
    fn annex_add(&self, fp: &Path) -> Result<()>;
    /// Fetch the annexed body for `fp` onto local disk if missing.
    fn annex_get(&self, fp: &Path) -> Result<()>;
    /// Stage an addition (non-annex `git add`).
    fn add(&self, fp: &Path) -> Result<()>;
    /// Stage a removal.
    fn rm(&self, fp: &Path) -> Result<()>;
    /// Stage a rename/move.
    fn mv(&self, from: &Path, to: &Path) -> Result<()>;
    /// Commit whatever is currently staged.
    fn commit(&self, message: &str) -> Result<()>;
}

/// `RepositoryDriver` implementation that shells out to the real
/// `git`/`git-annex` binaries.
///
/// `is_annexed` is the one query answered without forking: it reads
/// the symlink target directly, since it otherwise runs on the
/// lock-free read path (`getattr`, `access`, `open`) where spawning a
/// subprocess per call would be prohibitively slow.
pub struct ProcessDriver {
    repo_root: std::path::PathBuf,
    git_binary: String,
    git_annex_binary: String,
    annex_get_timeout: Duration,
}

impl ProcessDriver {
    pub fn new(repo_root: std::path::PathBuf, config: &Config) -> Self {
        ProcessDriver {
            repo_root,
            git_binary: config.git_binary.clone(),
            git_annex_binary: config.git_annex_binary.clone(),
            annex_get_timeout: Duration::from_secs(config.annex_get_timeout_secs as u64),
        }
    }

    /// Run `cmd` to completion, killing it and returning
    /// `DriverError::Timeout` if it hasn't exited within `timeout`.
    /// `annex_get` is the one driver call the placeholder-materialise
    /// read path waits on (spec §4.3's `open` row), so it's the one
    /// bounded by `Config::annex_get_timeout_secs` rather than left to
    /// run indefinitely.
    fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Result<std::process::Output> {
        let command_repr = format!("{cmd:?}");
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        let mut child = cmd.spawn().map_err(|source| DriverError::Spawn {
            command: command_repr.clone(),
            source,
        })?;

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(DriverError::Timeout {
                        command: command_repr,
                        timeout_secs: timeout.as_secs() as u32,
                    });
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(source) => {
                    return Err(DriverError::Spawn {
                        command: command_repr,
                        source,
                    })
                }
            }
        }

        let output = child.wait_with_output().map_err(|source| DriverError::Spawn {
            command: command_repr.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(DriverError::NonZeroExit {
                command: command_repr,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output)
    }

    fn git(&self) -> Command {
        let mut cmd = Command::new(&self.git_binary);
        cmd.current_dir(&self.repo_root);
        cmd
    }

    fn git_annex(&self) -> Command {
        let mut cmd = Command::new(&self.git_annex_binary);
        cmd.current_dir(&self.repo_root);
        cmd
    }

    fn run(mut cmd: Command) -> Result<std::process::Output> {
        let command_repr = format!("{cmd:?}");
        let output = cmd.output().map_err(|source| DriverError::Spawn {
            command: command_repr.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(DriverError::NonZeroExit {
                command: command_repr,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output)
    }
}

impl RepositoryDriver for ProcessDriver {
    fn is_annexed(&self, fp: &Path) -> bool {
        match std::fs::symlink_metadata(fp) {
            Ok(meta) if meta.file_type().is_symlink() => match std::fs::read_link(fp) {
                Ok(target) => target.as_os_str().as_bytes().windows(".git/annex/objects".len())
                    .any(|w| w == b".git/annex/objects"),
                Err(_) => false,
            },
            _ => false,
        }
    }

    fn is_ignored(&self, fp: &Path) -> bool {
        let mut cmd = self.git();
        cmd.arg("check-ignore").arg("-q").arg(fp);
        match cmd.status() {
            Ok(status) => status.success(),
            Err(err) => {
                warn!("failed to run git check-ignore on '{}': {}", fp.display(), err);
                false
            }
        }
    }

    fn annex_unlock(&self, fp: &Path) -> Result<()> {
        let mut cmd = self.git_annex();
        cmd.arg("unlock").arg(fp);
        Self::run(cmd).map(|_| ())
    }

    fn annex_add(&self, fp: &Path) -> Result<()> {
        let mut cmd = self.git_annex();
        cmd.arg("add").arg(fp);
        Self::run(cmd).map(|_| ())
    }

    fn annex_get(&self, fp: &Path) -> Result<()> {
        let mut cmd = self.git_annex();
        cmd.arg("get").arg(fp);
        Self::run_with_timeout(cmd, self.annex_get_timeout).map(|_| ())
    }

    fn add(&self, fp: &Path) -> Result<()> {
        let mut cmd = self.git();
        cmd.arg("add").arg(fp);
        Self::run(cmd).map(|_| ())
    }

    fn rm(&self, fp: &Path) -> Result<()> {
        let mut cmd = self.git();
        cmd.arg("rm").arg("--cached").arg("--ignore-unmatch").arg(fp);
        Self::run(cmd).map(|_| ())
    }

    fn mv(&self, from: &Path, to: &Path) -> Result<()> {
        let mut cmd = self.git();
        cmd.arg("mv").arg(from).arg(to);
        Self::run(cmd).map(|_| ())
    }

    fn commit(&self, message: &str) -> Result<()> {
        let mut cmd = self.git();
        cmd.arg("commit").arg("--allow-empty-message").arg("-m").arg(message);
        Self::run(cmd).map(|_| ())
    }
}

/// Run a driver operation, logging (never propagating) failure: the
/// "repository-driver failure" class from spec §7: logged-or-swallowed,
/// doesn't alter the handler's return status.
pub fn log_failure(op: &str, fp: &Path, result: Result<()>) {
    if let Err(err) = result {
        warn!("repository driver '{op}' failed for '{}': {err}", fp.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_annexed_false_for_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"hi").unwrap();
        let config = Config::default();
        let driver = ProcessDriver::new(dir.path().to_path_buf(), &config);
        assert!(!driver.is_annexed(&file));
    }

    #[test]
    fn is_annexed_true_for_annex_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("annexed");
        std::os::unix::fs::symlink(
            "../.git/annex/objects/xx/yy/SHA256E-s3--abc/SHA256E-s3--abc",
            &link,
        )
        .unwrap();
        let config = Config::default();
        let driver = ProcessDriver::new(dir.path().to_path_buf(), &config);
        assert!(driver.is_annexed(&link));
    }

    #[test]
    fn is_annexed_false_for_ordinary_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("/etc/hostname", &link).unwrap();
        let config = Config::default();
        let driver = ProcessDriver::new(dir.path().to_path_buf(), &config);
        assert!(!driver.is_annexed(&link));
    }

    #[test]
    fn run_with_timeout_kills_and_errors_on_slow_command() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = ProcessDriver::run_with_timeout(cmd, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, DriverError::Timeout { .. }));
    }

    #[test]
    fn run_with_timeout_succeeds_within_budget() {
        let mut cmd = Command::new("true");
        cmd.arg("ignored");
        let result = ProcessDriver::run_with_timeout(cmd, Duration::from_secs(5));
        // `true` ignores its arguments and always exits 0.
        assert!(result.is_ok());
    }
}
