//! Access gateway: the SSH entry point.
//!
//! Invoked either as a forced command (`command="git-warden KEY=alice"` in
//! authorized_keys, with the real request in `SSH_ORIGINAL_COMMAND`) or as
//! the account's login shell (`git-warden -c "git-upload-pack 'repo'"`).
//! Parses the request, resolves the repository to a bare `GIT_DIR`, and
//! hands off to the per-repo handler.

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use regex::Regex;

use crate::identity::ssh_context;
use crate::pipeline;

/// Standard mode: each argv token of form `KEY=VAL` becomes an environment
/// variable, then the command is taken from `SSH_ORIGINAL_COMMAND`.
pub fn run_standard(assignments: &[String]) -> Result<i32> {
    for token in assignments {
        if let Some((key, value)) = token.split_once('=') {
            env::set_var(key, value);
        }
    }
    if ssh_context().is_none() {
        bail!("Only SSH allowed");
    }
    let cmd = env::var("SSH_ORIGINAL_COMMAND").unwrap_or_default();
    dispatch(&cmd)
}

/// Advanced mode: the binary is the login shell and sshd passed the
/// original command via `-c`. The environment is not mutated.
pub fn run_advanced(command: &str) -> Result<i32> {
    if ssh_context().is_none() {
        bail!("Only SSH allowed");
    }
    dispatch(command)
}

fn dispatch(cmd: &str) -> Result<i32> {
    let (op, repo) = parse_command(cmd)?;
    let git_dir = resolve_repo(&repo)?;
    debug!("resolved repository {repo:?} to {git_dir:?}");
    env::set_var("GIT_DIR", &git_dir);
    run_handler(&op, &git_dir)
}

/// Validates the request against `^(git-[\w-]+) (.+)$` and normalizes the
/// repository argument (surrounding single quotes and a trailing `.git`
/// are stripped).
pub fn parse_command(cmd: &str) -> Result<(String, String)> {
    let re = Regex::new(r"^(git-[\w-]+) (.+)$").unwrap();
    let caps = re
        .captures(cmd.trim())
        .ok_or_else(|| anyhow!("shell access denied"))?;
    let op = caps[1].to_string();

    let mut repo = caps[2].trim();
    repo = repo
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .unwrap_or(repo);
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if repo.is_empty() {
        bail!("shell access denied");
    }
    Ok((op, repo.to_string()))
}

/// Resolves a repository argument to an existing bare directory under
/// `$HOME`, trying `<r>.git/.git`, `<r>/.git`, `<r>.git`, `<r>` in order.
pub fn resolve_repo(repo: &str) -> Result<PathBuf> {
    let home = dirs_next::home_dir().context("No home directory for repository resolution")?;
    let rel = repo
        .strip_prefix("~/")
        .unwrap_or_else(|| repo.trim_start_matches('/'));

    let candidates = [
        format!("{rel}.git/.git"),
        format!("{rel}/.git"),
        format!("{rel}.git"),
        rel.to_string(),
    ];
    for candidate in candidates {
        let path = home.join(&candidate);
        if path.is_dir() {
            return Ok(path);
        }
    }
    bail!("access denied: cannot resolve repository '{repo}'")
}

/// Handler priority: the repository's own `hooks/git-server` executable,
/// then the built-in pipeline. A `hooks/git-server` that resolves back to
/// this very binary is run in-process rather than re-spawned.
fn run_handler(op: &str, git_dir: &Path) -> Result<i32> {
    let cmd_line = format!("{op} '{}'", git_dir.display());
    let custom = git_dir.join("hooks").join("git-server");
    if is_executable(&custom) && !is_self(&custom) {
        debug!("delegating to {custom:?}");
        let status = Command::new(&custom)
            .arg("-c")
            .arg(&cmd_line)
            .status()
            .with_context(|| format!("Spawning handler {custom:?}"))?;
        return Ok(status.code().unwrap_or(1));
    }
    pipeline::run(&cmd_line)
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn is_self(path: &Path) -> bool {
    match (path.canonicalize(), env::current_exe().and_then(|e| e.canonicalize())) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
