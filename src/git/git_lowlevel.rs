use super::git_types::{GitError, GitOutput};

use std::{
    env::current_dir,
    io,
    path::{Path, PathBuf},
    process::{self, Child, Stdio},
};

use anyhow::{anyhow, bail, Context, Result};
use itertools::Itertools;
use log::{debug, trace};

/// Min supported git version.
/// `GIT_SSH_COMMAND` (used by the deploy daemon to advertise forwarded
/// option variables) appeared in 2.3.0.
pub const EXPECTED_VERSION: (i32, i32, i32) = (2, 3, 0);

pub(crate) fn spawn_git_command(
    args: &[&str],
    working_dir: &Option<&Path>,
    stdin: Option<Stdio>,
) -> Result<Child, io::Error> {
    let working_dir = working_dir.map(PathBuf::from).unwrap_or(current_dir()?);
    // Disable git's automatic maintenance to prevent interference with
    // concurrent sessions against the same repository
    let default_pre_args = ["-c", "gc.auto=0", "-c", "maintenance.auto=0"];
    let stdin = stdin.unwrap_or(Stdio::null());
    let all_args: Vec<_> = default_pre_args.iter().chain(args.iter()).collect();
    debug!("execute: git {}", all_args.iter().join(" "));
    process::Command::new("git")
        .env("LANG", "C.UTF-8")
        .env("LC_ALL", "C.UTF-8")
        .env("LANGUAGE", "C.UTF-8")
        // Hooks inherit GIT_DIR from the pipeline; it must not leak into
        // commands that address a different repository via cwd or args.
        .env_remove("GIT_DIR")
        .env_remove("GIT_WORK_TREE")
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .current_dir(working_dir)
        .args(all_args)
        .spawn()
}

/// Runs git and captures both streams. Non-zero exit becomes `ExecError`.
pub(crate) fn capture_git_output(
    args: &[&str],
    working_dir: &Option<&Path>,
) -> Result<GitOutput, GitError> {
    let output = run_git_lenient(args, working_dir)?;
    if output.success() {
        Ok(output)
    } else {
        Err(GitError::ExecError {
            command: args.join(" "),
            output,
        })
    }
}

/// Runs git and captures both streams without treating a non-zero exit as
/// an error. The deploy daemon classifies failure text itself; errors here
/// only mean git could not be spawned at all.
pub(crate) fn run_git_lenient(
    args: &[&str],
    working_dir: &Option<&Path>,
) -> Result<GitOutput, GitError> {
    let child = spawn_git_command(args, working_dir, None)?;
    let output = child.wait_with_output()?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    trace!("stdout: {stdout}");

    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    trace!("stderr: {stderr}");

    Ok(GitOutput {
        stdout,
        stderr,
        status: output.status.code().unwrap_or(1),
    })
}

/// Runs an arbitrary helper tool (`ssh-keyscan`, `ssh-keygen`) capturing
/// both streams.
pub(crate) fn capture_tool_output(
    program: &str,
    args: &[&str],
) -> Result<GitOutput, GitError> {
    debug!("execute: {program} {}", args.iter().join(" "));
    let output = process::Command::new(program)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .args(args)
        .output()?;

    let git_output = GitOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        status: output.status.code().unwrap_or(1),
    };
    trace!("stdout: {}", git_output.stdout);
    trace!("stderr: {}", git_output.stderr);

    if git_output.success() {
        Ok(git_output)
    } else {
        Err(GitError::ExecError {
            command: format!("{program} {}", args.join(" ")),
            output: git_output,
        })
    }
}

/// `git rev-parse --git-dir`, absolutized against the current directory.
pub fn resolve_git_dir() -> Result<PathBuf> {
    let out = capture_git_output(&["rev-parse", "--git-dir"], &None)
        .context("Not inside a git repository")?;
    let dir = PathBuf::from(out.stdout.trim());
    if dir.is_absolute() {
        Ok(dir)
    } else {
        Ok(current_dir()?.join(dir))
    }
}

pub(crate) fn parse_git_version(version: &str) -> Result<(i32, i32, i32)> {
    let version = version
        .split_whitespace()
        .nth(2)
        .ok_or(anyhow!("Could not find git version in string {version}"))?;
    match version.split('.').collect_vec()[..] {
        [major, minor, patch] => Ok((major.parse()?, minor.parse()?, patch.parse()?)),
        _ => Err(anyhow!("Failed determine semantic version from {version}")),
    }
}

fn get_git_version() -> Result<(i32, i32, i32)> {
    let version = capture_git_output(&["--version"], &None)
        .context("Determine git version")?
        .stdout;
    parse_git_version(&version)
}

fn concat_version(version_tuple: (i32, i32, i32)) -> String {
    format!(
        "{}.{}.{}",
        version_tuple.0, version_tuple.1, version_tuple.2
    )
}

pub fn check_git_version() -> Result<()> {
    let version_tuple = get_git_version().context("Determining compatible git version")?;
    if version_tuple < EXPECTED_VERSION {
        bail!(
            "Version {} is smaller than {}",
            concat_version(version_tuple),
            concat_version(EXPECTED_VERSION)
        )
    }
    Ok(())
}
