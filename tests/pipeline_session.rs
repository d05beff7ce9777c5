//! End-to-end pipeline sessions against fixture repositories with a stub
//! `git-shell` standing in for the real backend.

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serial_test::serial;
use tempfile::{tempdir, TempDir};

use git_warden::gateway;
use git_warden::pipeline;

fn run_git_command(args: &[&str], dir: &Path) {
    assert!(Command::new("git")
        .args(args)
        .envs([
            ("GIT_CONFIG_NOSYSTEM", "true"),
            ("GIT_CONFIG_GLOBAL", "/dev/null"),
            ("GIT_AUTHOR_NAME", "testuser"),
            ("GIT_AUTHOR_EMAIL", "testuser@example.com"),
            ("GIT_COMMITTER_NAME", "testuser"),
            ("GIT_COMMITTER_EMAIL", "testuser@example.com"),
        ])
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("Failed to spawn git command")
        .success());
}

fn bare_repo() -> TempDir {
    let dir = tempdir().unwrap();
    run_git_command(
        &["init", "--bare", "--initial-branch", "master", "."],
        dir.path(),
    );
    dir
}

fn install_hook(git_dir: &Path, name: &str, body: &str) -> PathBuf {
    let hooks = git_dir.join("hooks");
    fs::create_dir_all(&hooks).unwrap();
    let path = hooks.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Stub backend recording the command it was handed and exiting with the
/// given status.
fn install_stub_backend(git_dir: &Path, exit_status: i32) {
    install_hook(
        git_dir,
        "git-shell",
        &format!("echo \"$2\" > \"$GIT_DIR/backend.cmd\"\nexit {exit_status}"),
    );
}

fn set_repo_config(git_dir: &Path, key: &str, value: &str) {
    run_git_command(&["config", key, value], git_dir);
}

/// Inputs the gateway would normally provide.
fn reset_session_env(key: &str) {
    env::set_var("GIT_CONFIG_NOSYSTEM", "true");
    env::set_var("GIT_CONFIG_GLOBAL", "/dev/null");
    env::set_var("KEY", key);
    env::set_var("SSH_CLIENT", "192.0.2.7 50000 22");
    for var in [
        "DEBUG",
        "GIT_WARDEN_OPTIONS",
        "XMODIFIERS",
        "SSH_ORIGINAL_COMMAND",
        "GIT_DIR",
        "IPC",
        "GIT_PRE_EXIT_STATUS",
        "GIT_EXIT_STATUS",
    ] {
        env::remove_var(var);
    }
}

fn session_command(git_dir: &Path, op: &str) -> String {
    format!("{op} '{}'", git_dir.display())
}

fn env_file(git_dir: &Path, name: &str) -> String {
    fs::read_to_string(git_dir.join(name)).unwrap_or_default()
}

#[test]
#[serial]
fn read_session_runs_hooks_and_backend_in_order() {
    let repo = bare_repo();
    set_repo_config(repo.path(), "acl.readers", "carol");
    install_stub_backend(repo.path(), 0);
    install_hook(repo.path(), "pre-read", "env > \"$GIT_DIR/pre.env\"\nexit 0");
    install_hook(repo.path(), "post-read", "env > \"$GIT_DIR/post.env\"\nexit 0");

    reset_session_env("carol");
    let cmd = session_command(repo.path(), "git-upload-pack");
    let exit = pipeline::run(&cmd).unwrap();
    assert_eq!(exit, 0);

    // Backend saw the original command
    let backend_cmd = env_file(repo.path(), "backend.cmd");
    assert_eq!(backend_cmd.trim(), cmd);

    // Pre-hook ran with the session environment, before any exit status
    let pre_env = env_file(repo.path(), "pre.env");
    assert!(pre_env.contains("KEY=carol"));
    assert!(pre_env.contains("GIT_CONNECTED_EPOCH="));
    assert!(pre_env.contains(&format!("GIT_DIR={}", repo.path().display())));
    assert!(pre_env.contains("IPC="));
    assert!(pre_env.contains("current-read-"));
    assert!(!pre_env.contains("GIT_EXIT_STATUS="));

    // Post-hook saw both statuses
    let post_env = env_file(repo.path(), "post.env");
    assert!(post_env.contains("GIT_PRE_EXIT_STATUS=0"));
    assert!(post_env.contains("GIT_EXIT_STATUS=0"));

    // IPC scratch space is gone, including the tmp parent
    assert!(!repo.path().join("tmp").exists());
}

#[test]
#[serial]
fn acl_denial_skips_backend_and_fails_session() {
    let repo = bare_repo();
    set_repo_config(repo.path(), "acl.writers", "alice");
    install_stub_backend(repo.path(), 0);
    install_hook(repo.path(), "pre-read", "env > \"$GIT_DIR/pre.env\"\nexit 0");
    install_hook(repo.path(), "post-read", "env > \"$GIT_DIR/post.env\"\nexit 0");

    reset_session_env("bob");
    let exit = pipeline::run(&session_command(repo.path(), "git-upload-pack")).unwrap();
    assert_ne!(exit, 0);

    // Neither the backend nor the user pre-hook ran
    assert!(!repo.path().join("backend.cmd").exists());
    assert!(!repo.path().join("pre.env").exists());

    // The post-hook still observed the failing statuses
    let post_env = env_file(repo.path(), "post.env");
    assert!(post_env.contains("GIT_PRE_EXIT_STATUS=1"));
    assert!(post_env.contains("GIT_EXIT_STATUS=1"));
}

#[test]
#[serial]
fn write_session_requires_writer() {
    let repo = bare_repo();
    set_repo_config(repo.path(), "acl.readers", "carol");
    set_repo_config(repo.path(), "acl.writers", "alice");
    install_stub_backend(repo.path(), 0);

    // A reader cannot push
    reset_session_env("carol");
    let exit = pipeline::run(&session_command(repo.path(), "git-receive-pack")).unwrap();
    assert_ne!(exit, 0);
    assert!(!repo.path().join("backend.cmd").exists());

    // A writer can
    reset_session_env("alice");
    let exit = pipeline::run(&session_command(repo.path(), "git-receive-pack")).unwrap();
    assert_eq!(exit, 0);
    assert!(repo.path().join("backend.cmd").exists());
}

#[test]
#[serial]
fn pre_hook_veto_aborts_backend_and_sets_exit() {
    let repo = bare_repo();
    set_repo_config(repo.path(), "acl.readers", "carol");
    install_stub_backend(repo.path(), 0);
    install_hook(repo.path(), "pre-read", "exit 7");
    install_hook(repo.path(), "post-read", "env > \"$GIT_DIR/post.env\"\nexit 0");

    reset_session_env("carol");
    let exit = pipeline::run(&session_command(repo.path(), "git-upload-pack")).unwrap();
    assert_eq!(exit, 7);
    assert!(!repo.path().join("backend.cmd").exists());

    let post_env = env_file(repo.path(), "post.env");
    assert!(post_env.contains("GIT_PRE_EXIT_STATUS=7"));
    assert!(post_env.contains("GIT_EXIT_STATUS=7"));
}

#[test]
#[serial]
fn backend_exit_code_propagates_and_post_cannot_change_it() {
    let repo = bare_repo();
    set_repo_config(repo.path(), "acl.readers", "carol");
    install_stub_backend(repo.path(), 3);
    install_hook(repo.path(), "post-read", "env > \"$GIT_DIR/post.env\"\nexit 9");

    reset_session_env("carol");
    let exit = pipeline::run(&session_command(repo.path(), "git-upload-pack")).unwrap();
    assert_eq!(exit, 3);

    let post_env = env_file(repo.path(), "post.env");
    assert!(post_env.contains("GIT_EXIT_STATUS=3"));
}

#[test]
#[serial]
fn client_options_reach_hooks_in_order() {
    let repo = bare_repo();
    set_repo_config(repo.path(), "acl.readers", "carol");
    install_stub_backend(repo.path(), 0);
    install_hook(repo.path(), "pre-read", "env > \"$GIT_DIR/pre.env\"\nexit 0");

    reset_session_env("carol");
    env::set_var("GIT_WARDEN_OPTIONS", "feature=blue\ndeploy_patience=600");
    let exit = pipeline::run(&session_command(repo.path(), "git-upload-pack")).unwrap();
    assert_eq!(exit, 0);

    let pre_env = env_file(repo.path(), "pre.env");
    assert!(pre_env.contains("GIT_OPTION_COUNT=2"));
    assert!(pre_env.contains("GIT_OPTION_0=feature=blue"));
    assert!(pre_env.contains("GIT_OPTION_1=deploy_patience=600"));
    env::remove_var("GIT_WARDEN_OPTIONS");
}

#[test]
#[serial]
fn legacy_option_transport_still_works() {
    let repo = bare_repo();
    set_repo_config(repo.path(), "acl.readers", "carol");
    install_stub_backend(repo.path(), 0);
    install_hook(repo.path(), "pre-read", "env > \"$GIT_DIR/pre.env\"\nexit 0");

    reset_session_env("carol");
    env::set_var("XMODIFIERS", "legacy=1");
    let exit = pipeline::run(&session_command(repo.path(), "git-upload-pack")).unwrap();
    assert_eq!(exit, 0);

    let pre_env = env_file(repo.path(), "pre.env");
    assert!(pre_env.contains("GIT_OPTION_COUNT=1"));
    assert!(pre_env.contains("GIT_OPTION_0=legacy=1"));
    env::remove_var("XMODIFIERS");
}

#[test]
#[serial]
fn debug_option_keeps_ipc_dir() {
    let repo = bare_repo();
    set_repo_config(repo.path(), "acl.readers", "carol");
    install_stub_backend(repo.path(), 0);
    install_hook(
        repo.path(),
        "pre-read",
        "echo probe > \"$IPC/pushinfo.log\"\nexit 0",
    );

    reset_session_env("carol");
    env::set_var("GIT_WARDEN_OPTIONS", "DEBUG=1");
    let exit = pipeline::run(&session_command(repo.path(), "git-upload-pack")).unwrap();
    assert_eq!(exit, 0);
    env::remove_var("GIT_WARDEN_OPTIONS");
    env::remove_var("DEBUG");

    let tmp = repo.path().join("tmp");
    let kept: Vec<_> = fs::read_dir(&tmp).unwrap().flatten().collect();
    assert_eq!(kept.len(), 1);
    assert!(kept[0]
        .file_name()
        .to_string_lossy()
        .starts_with("current-read-"));
    assert!(kept[0].path().join("pushinfo.log").exists());
}

#[test]
#[serial]
fn blocked_ip_is_denied_before_hooks() {
    let repo = bare_repo();
    set_repo_config(repo.path(), "acl.readers", "carol");
    set_repo_config(repo.path(), "acl.restrictip", "10.0.0.0/8");
    install_stub_backend(repo.path(), 0);
    install_hook(repo.path(), "pre-read", "env > \"$GIT_DIR/pre.env\"\nexit 0");

    reset_session_env("carol");
    env::set_var("SSH_CLIENT", "192.0.2.7 50000 22");
    let exit = pipeline::run(&session_command(repo.path(), "git-upload-pack")).unwrap();
    assert_ne!(exit, 0);
    assert!(!repo.path().join("pre.env").exists());
    assert!(!repo.path().join("backend.cmd").exists());

    // The same key from inside the allowed range gets through
    reset_session_env("carol");
    env::set_var("SSH_CLIENT", "10.1.2.3 50000 22");
    let exit = pipeline::run(&session_command(repo.path(), "git-upload-pack")).unwrap();
    assert_eq!(exit, 0);
}

/// Runs `f` with HOME pointing at a fresh directory.
fn with_home<F: FnOnce(&Path)>(f: F) {
    let home = tempdir().unwrap();
    let original = env::var("HOME").ok();
    env::set_var("HOME", home.path());
    f(home.path());
    match original {
        Some(value) => env::set_var("HOME", value),
        None => env::remove_var("HOME"),
    }
}

#[test]
#[serial]
fn advanced_gateway_resolves_repo_and_runs_the_session() {
    with_home(|home| {
        let repo = home.join("project.git");
        fs::create_dir(&repo).unwrap();
        run_git_command(&["init", "--bare", "--initial-branch", "master", "."], &repo);
        set_repo_config(&repo, "acl.readers", "carol");
        install_stub_backend(&repo, 0);

        reset_session_env("carol");
        let exit = gateway::run_advanced("git-upload-pack 'project'").unwrap();
        assert_eq!(exit, 0);

        // The backend received the resolved absolute GIT_DIR, quoted
        let backend_cmd = env_file(&repo, "backend.cmd");
        assert_eq!(
            backend_cmd.trim(),
            format!("git-upload-pack '{}'", repo.display())
        );
    });
}

#[test]
#[serial]
fn gateway_delegates_to_custom_handler() {
    with_home(|home| {
        let repo = home.join("project.git");
        fs::create_dir(&repo).unwrap();
        run_git_command(&["init", "--bare", "--initial-branch", "master", "."], &repo);
        install_hook(
            &repo,
            "git-server",
            "echo \"$2\" > \"$GIT_DIR/handler.cmd\"\nexit 5",
        );

        reset_session_env("carol");
        let exit = gateway::run_advanced("git-upload-pack 'project'").unwrap();
        assert_eq!(exit, 5);
        assert!(repo.join("handler.cmd").exists());
    });
}

#[test]
#[serial]
fn gateway_rejects_non_git_and_unknown_repos() {
    with_home(|_| {
        reset_session_env("carol");
        let err = gateway::run_advanced("ls -la").unwrap_err();
        assert!(err.to_string().contains("shell access denied"));

        let err = gateway::run_advanced("git-upload-pack 'missing'").unwrap_err();
        assert!(err.to_string().contains("missing"));
    });
}

#[test]
#[serial]
fn gateway_requires_ssh_context() {
    reset_session_env("carol");
    env::remove_var("SSH_CLIENT");
    env::remove_var("SSH_CONNECTION");

    let err = gateway::run_standard(&["KEY=carol".to_string()]).unwrap_err();
    assert!(err.to_string().contains("Only SSH allowed"));

    let err = gateway::run_advanced("git-upload-pack 'x'").unwrap_err();
    assert!(err.to_string().contains("Only SSH allowed"));
}
