//! Shared test utilities: hermetic git environments and repository
//! fixtures (bare server-side repos, working clones, hook scripts).

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tempfile::{tempdir, TempDir};

/// Environment variables isolating git from the user's real configuration.
pub fn hermetic_git_env_vars() -> [(&'static str, &'static str); 6] {
    [
        ("GIT_CONFIG_NOSYSTEM", "true"),
        ("GIT_CONFIG_GLOBAL", "/dev/null"),
        ("GIT_AUTHOR_NAME", "testuser"),
        ("GIT_AUTHOR_EMAIL", "testuser@example.com"),
        ("GIT_COMMITTER_NAME", "testuser"),
        ("GIT_COMMITTER_EMAIL", "testuser@example.com"),
    ]
}

/// Installs the hermetic git environment into this process.
pub fn hermetic_git_env() {
    for (key, value) in hermetic_git_env_vars() {
        env::set_var(key, value);
    }
}

/// Runs a git command in a hermetic environment, panicking on failure.
pub fn run_git_command(args: &[&str], dir: &Path) {
    assert!(
        Command::new("git")
            .args(args)
            .envs(hermetic_git_env_vars())
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .expect("Failed to spawn git command")
            .success(),
        "git {args:?} failed in {dir:?}"
    );
}

pub fn init_repo(dir: &Path) {
    run_git_command(&["init", "--initial-branch", "master"], dir);
    run_git_command(&["commit", "--allow-empty", "-m", "Initial commit"], dir);
}

pub fn dir_with_repo() -> TempDir {
    let tempdir = tempdir().unwrap();
    init_repo(tempdir.path());
    tempdir
}

/// A bare repository seeded with one commit on `master`, the shape the
/// server-side components operate on.
pub fn dir_with_bare_repo() -> TempDir {
    let tempdir = tempdir().unwrap();
    init_bare_repo_with_commit(tempdir.path());
    tempdir
}

/// Initializes `dir` as a bare repo and pushes a single commit into it
/// via a throwaway working clone.
pub fn init_bare_repo_with_commit(dir: &Path) {
    run_git_command(&["init", "--bare", "--initial-branch", "master", "."], dir);

    let seed = tempdir().unwrap();
    init_repo(seed.path());
    run_git_command(
        &["push", dir.to_str().unwrap(), "master:master"],
        seed.path(),
    );
}

/// Adds one more commit to a bare repo through a temporary clone and
/// returns the new tip's id.
pub fn push_new_commit(bare: &Path, branch: &str, message: &str) -> String {
    let work = tempdir().unwrap();
    run_git_command(
        &["clone", bare.to_str().unwrap(), work.path().to_str().unwrap()],
        work.path(),
    );
    run_git_command(&["checkout", branch], work.path());
    run_git_command(&["commit", "--allow-empty", "-m", message], work.path());
    run_git_command(&["push", "origin", branch], work.path());
    let out = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .envs(hermetic_git_env_vars())
        .current_dir(work.path())
        .output()
        .expect("Failed to spawn git command");
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Writes an executable script into the repo's hooks directory.
pub fn install_hook(git_dir: &Path, name: &str, body: &str) -> PathBuf {
    let hooks = git_dir.join("hooks");
    fs::create_dir_all(&hooks).unwrap();
    let path = hooks.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// RAII guard that restores the current directory when dropped.
pub struct DirGuard {
    original_dir: PathBuf,
}

impl DirGuard {
    pub fn new(new_dir: &Path) -> Self {
        let original_dir = env::current_dir().expect("Failed to get current directory");
        env::set_current_dir(new_dir).expect("Failed to change directory");
        DirGuard { original_dir }
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        let _ = env::set_current_dir(&self.original_dir);
    }
}

/// Runs `f` with `HOME` pointing at a fresh directory, restoring the
/// original environment afterwards.
pub fn with_isolated_home<F, R>(f: F) -> R
where
    F: FnOnce(&Path) -> R,
{
    let temp_dir = tempdir().unwrap();
    let original_home = env::var("HOME").ok();

    env::set_var("HOME", temp_dir.path());
    let result = f(temp_dir.path());

    match original_home {
        Some(home) => env::set_var("HOME", home),
        None => env::remove_var("HOME"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_repo_has_master_tip() {
        let repo = dir_with_bare_repo();
        let out = Command::new("git")
            .args(["rev-parse", "refs/heads/master"])
            .envs(hermetic_git_env_vars())
            .current_dir(repo.path())
            .output()
            .unwrap();
        assert!(out.status.success());
    }

    #[test]
    fn test_install_hook_is_executable() {
        let repo = dir_with_bare_repo();
        let path = install_hook(repo.path(), "pre-read", "exit 0");
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
