//! The hook pipeline: pre-hook, git backend, post-hook, in that order,
//! with exit statuses carried between stages through the environment.
//!
//! Runs in the repository's context after the gateway has resolved
//! `GIT_DIR`. Within one session the pipeline is strictly sequential;
//! concurrency across sessions is mediated by git's own locks.

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{self, Command};

use anyhow::{bail, Context, Result};
use defer::defer;
use log::{debug, warn};
use nix::libc;
use regex::Regex;

use crate::acl::{set_global_config, set_repo_config, RepoConfig};
use crate::defaults::{OPTIONS_ENV, OPTIONS_ENV_COMPAT};
use crate::identity::Identity;
use crate::restrict::{self, Verdict, BLOCKED_MESSAGE};

/// The two operations the pipeline fronts. Anything else is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitOp {
    UploadPack,
    ReceivePack,
}

impl GitOp {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "git-upload-pack" => Some(GitOp::UploadPack),
            "git-receive-pack" => Some(GitOp::ReceivePack),
            _ => None,
        }
    }

    /// Hook phase prefix: reads run `pre-read`/`post-read`, writes run
    /// `pre-write`/`post-write`.
    pub fn phase(&self) -> &'static str {
        match self {
            GitOp::UploadPack => "read",
            GitOp::ReceivePack => "write",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, GitOp::ReceivePack)
    }
}

/// Runs one full session for `<op> '<GIT_DIR>'` and returns the exit code
/// the SSH client should see.
pub fn run(command: &str) -> Result<i32> {
    install_sigpipe_exit();

    let (op, git_dir) = parse_session_command(command)?;
    let identity = Identity::from_env();

    maybe_self_install(&git_dir, &identity.key);

    let config = RepoConfig::load(&git_dir)?;

    env::set_var("GIT_DIR", &git_dir);
    env::set_var("KEY", &identity.key);
    env::set_var("GIT_CONNECTED_EPOCH", identity.connected_epoch.to_string());
    // Advanced-mode sessions have no SSH_ORIGINAL_COMMAND; give the hooks
    // the resolved command instead. Standard mode keeps the client's own.
    if env::var_os("SSH_ORIGINAL_COMMAND").is_none() {
        env::set_var("SSH_ORIGINAL_COMMAND", command);
    }

    let options = client_options();
    export_options(&op, &options)?;

    let ipc = create_ipc_dir(&git_dir, &op)?;
    env::set_var("IPC", &ipc);
    let cleanup_root = git_dir.join("tmp");
    defer!(if env::var_os("DEBUG").is_none() {
        cleanup_ipc(&cleanup_root, &ipc);
    });

    let allowed = access_allowed(&op, &config, &identity);

    let pre_status = if !allowed {
        1
    } else {
        match hook_path(&git_dir, &format!("pre-{}", op.phase())) {
            Some(hook) => run_hook(&hook)?,
            None => 0,
        }
    };
    env::set_var("GIT_PRE_EXIT_STATUS", pre_status.to_string());

    // The backend only runs on a clean pre phase; a veto becomes the
    // session's exit code.
    let git_status = if pre_status == 0 {
        run_backend(&git_dir, command)?
    } else {
        pre_status
    };
    env::set_var("GIT_EXIT_STATUS", git_status.to_string());

    if let Some(hook) = hook_path(&git_dir, &format!("post-{}", op.phase())) {
        // Post-hook failures are logged but never change the exit code.
        match run_hook(&hook) {
            Ok(0) => {}
            Ok(code) => warn!("post-{} hook exited with {code}", op.phase()),
            Err(err) => warn!("post-{} hook failed: {err:#}", op.phase()),
        }
    }

    Ok(git_status)
}

fn parse_session_command(command: &str) -> Result<(GitOp, PathBuf)> {
    let re = Regex::new(r"^(git-[\w-]+) '?([^']+)'?$").unwrap();
    let caps = re
        .captures(command.trim())
        .with_context(|| format!("Malformed session command {command:?}"))?;
    let op = GitOp::from_token(&caps[1])
        .with_context(|| format!("Unsupported operation {:?}", &caps[1]))?;
    let git_dir = PathBuf::from(&caps[2]);
    if !git_dir.is_dir() {
        bail!("Not a repository directory: {}", git_dir.display());
    }
    Ok((op, git_dir))
}

/// Client-supplied options: newline-separated list from the dedicated
/// variable, falling back to the legacy `XMODIFIERS` transport.
pub fn client_options() -> Vec<String> {
    let raw = env::var(OPTIONS_ENV)
        .or_else(|_| env::var(OPTIONS_ENV_COMPAT))
        .unwrap_or_default();
    raw.lines()
        .map(|l| l.trim_end_matches('\r').to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// `DEBUG=<v>` option mapping: `0|off|false|""` mean off, a pure decimal
/// selects that level, anything else means level 1.
pub fn parse_debug_option(value: &str) -> u32 {
    let v = value.trim();
    if v.is_empty() || v == "0" || v.eq_ignore_ascii_case("off") || v.eq_ignore_ascii_case("false")
    {
        0
    } else if v.chars().all(|c| c.is_ascii_digit()) {
        v.parse().unwrap_or(1)
    } else {
        1
    }
}

fn export_options(op: &GitOp, options: &[String]) -> Result<()> {
    if !options.is_empty() && op.is_write() {
        // Push options only reach the receive-pack hooks when advertised.
        set_global_config("receive.advertisePushOptions", "true")?;
    }

    for (i, option) in options.iter().enumerate() {
        env::set_var(format!("GIT_OPTION_{i}"), option);
    }
    env::set_var("GIT_OPTION_COUNT", options.len().to_string());

    if let Some(debug) = options
        .iter()
        .filter_map(|o| o.strip_prefix("DEBUG="))
        .last()
    {
        let level = parse_debug_option(debug);
        if level == 0 {
            env::remove_var("DEBUG");
        } else {
            env::set_var("DEBUG", level.to_string());
        }
    }
    Ok(())
}

/// Scratch directory hooks use to exchange data within one session:
/// `$GIT_DIR/tmp/current-<read|write>-<pid>-io/`, private to this pid.
fn create_ipc_dir(git_dir: &Path, op: &GitOp) -> Result<PathBuf> {
    let ipc = git_dir
        .join("tmp")
        .join(format!("current-{}-{}-io", op.phase(), process::id()));
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&ipc)
        .with_context(|| format!("Creating IPC directory {}", ipc.display()))?;
    Ok(ipc)
}

/// Removes everything matching `$IPC*`, then the `tmp` directory itself if
/// it ended up empty.
fn cleanup_ipc(tmp_root: &Path, ipc: &Path) {
    let Some(ipc_name) = ipc.file_name().and_then(OsStr::to_str) else {
        return;
    };
    if let Ok(entries) = fs::read_dir(tmp_root) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(ipc_name) {
                let path = entry.path();
                let removed = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                if let Err(err) = removed {
                    warn!("Could not remove {}: {err}", path.display());
                }
            }
        }
    }
    // Only succeeds when no other session holds scratch space here.
    let _ = fs::remove_dir(tmp_root);
}

fn access_allowed(op: &GitOp, config: &RepoConfig, identity: &Identity) -> bool {
    match restrict::check(config.restrict_ip.as_deref(), identity.client_addr()) {
        Ok(Verdict::Allowed) => {}
        Ok(Verdict::Blocked) => {
            eprintln!("{BLOCKED_MESSAGE}");
            return false;
        }
        Err(err) => {
            warn!("IP restriction unusable: {err:#}");
            eprintln!("{BLOCKED_MESSAGE}");
            return false;
        }
    }

    let allowed = match op {
        GitOp::UploadPack => config.may_read(&identity.key),
        GitOp::ReceivePack => config.may_write(&identity.key),
    };
    if !allowed {
        let what = match op {
            GitOp::UploadPack => "Blocked clone or pull attempt!",
            GitOp::ReceivePack => "Blocked push attempt!",
        };
        warn!("{what} key={}", identity.key);
        eprintln!("git-server: {what}");
    }
    allowed
}

fn hook_path(git_dir: &Path, name: &str) -> Option<PathBuf> {
    let path = git_dir.join("hooks").join(name);
    is_executable(&path).then_some(path)
}

fn run_hook(hook: &Path) -> Result<i32> {
    debug!("running hook {hook:?}");
    let status = Command::new(hook)
        .status()
        .with_context(|| format!("Spawning hook {hook:?}"))?;
    Ok(status.code().unwrap_or(1))
}

/// The git backend: the repository's own `hooks/git-shell` when present,
/// otherwise the system `git-shell`, run in the current working directory.
fn run_backend(git_dir: &Path, command: &str) -> Result<i32> {
    let custom = git_dir.join("hooks").join("git-shell");
    let shell: PathBuf = if is_executable(&custom) {
        custom
    } else {
        PathBuf::from("git-shell")
    };
    debug!("backend: {shell:?} -c {command:?}");
    let status = Command::new(&shell)
        .arg("-c")
        .arg(command)
        .status()
        .with_context(|| format!("Spawning git backend {shell:?}"))?;
    Ok(status.code().unwrap_or(1))
}

/// Self-install: when this binary lives in a central hooks directory and
/// the target repository still carries its stock `hooks/`, move the stock
/// directory aside and wire the central one in with a single symlink.
fn maybe_self_install(git_dir: &Path, key: &str) {
    if let Err(err) = try_self_install(git_dir, key) {
        warn!("hook self-install skipped: {err:#}");
    }
}

fn try_self_install(git_dir: &Path, key: &str) -> Result<()> {
    let exe = env::current_exe()?;
    let Some(exe_dir) = exe.parent() else {
        return Ok(());
    };
    if exe_dir.file_name() != Some(OsStr::new("hooks")) {
        return Ok(());
    }

    let repo_hooks = git_dir.join("hooks");
    let Ok(meta) = fs::symlink_metadata(&repo_hooks) else {
        return Ok(());
    };
    if meta.file_type().is_symlink() || !meta.is_dir() {
        // Already wired in, or not a stock hooks directory.
        return Ok(());
    }
    if let (Ok(a), Ok(b)) = (repo_hooks.canonicalize(), exe_dir.canonicalize()) {
        if a == b {
            return Ok(());
        }
    }

    let aside = git_dir.join(format!("hooks.{}.PLEASE_DELETE", process::id()));
    fs::rename(&repo_hooks, &aside)
        .with_context(|| format!("Moving stock hooks aside to {}", aside.display()))?;
    std::os::unix::fs::symlink(exe_dir, &repo_hooks)
        .with_context(|| format!("Linking {} as repo hooks", exe_dir.display()))?;
    warn!(
        "installed {} as {}; stock hooks kept at {}",
        exe_dir.display(),
        repo_hooks.display(),
        aside.display()
    );

    let config = RepoConfig::load(git_dir)?;
    if !config.has_writers() {
        set_repo_config(git_dir, "acl.writers", key)?;
    }
    Ok(())
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

extern "C" fn sigpipe_exit(_: libc::c_int) {
    unsafe { libc::_exit(1) }
}

/// A torn-down SSH connection must end the session immediately instead of
/// leaving half a pipeline running.
pub(crate) fn install_sigpipe_exit() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::Handler(sigpipe_exit));
    }
}
