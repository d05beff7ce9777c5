//! The deploy daemon: a long-lived pull/rebase/build loop on a deploy
//! host, driven by push notifications from the server side.
//!
//! Each iteration fetches (which blocks on the server's notification
//! hook), checks out the deploy branch, rebases onto its upstream, and
//! classifies the combined output against the pathology catalog. Most
//! recognized conditions resolve themselves with a sleep or a cleanup;
//! anything unrecognized stops the loop for an operator.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::net::ToSocketAddrs;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{self, Command};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use rand::{thread_rng, Rng};
use regex::Regex;

use crate::defaults::{
    CONTENTION_SLEEP_SECONDS, DEFAULT_MAX_DELAY_SECONDS, OPTIONS_ENV, OPTIONS_ENV_COMPAT,
    STALE_REBASE_AGE_SECONDS, UNSTAGED_SLEEP_SECONDS, UP_TO_DATE_JITTER_SECONDS,
    UP_TO_DATE_SLEEP_SECONDS,
};
use crate::git::git_lowlevel::{capture_git_output, capture_tool_output, run_git_lenient};
use crate::git::resolve_git_dir;
use crate::pathology::{ActionKind, Catalog, Classification, Diagnosis};
use crate::peers::{self, PeerState};
use crate::pipeline::install_sigpipe_exit;
use crate::proxy::append_known_hosts;

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub branch: Option<String>,
    pub chdir: Option<PathBuf>,
    pub umask: Option<String>,
    pub options: Vec<String>,
    pub build: Option<String>,
    pub fix_nasty: bool,
    pub background: bool,
    pub max_delay: Option<u64>,
    pub rules: Option<PathBuf>,
}

enum LoopControl {
    Continue,
    Stop,
}

pub fn run(opts: DeployOptions) -> Result<()> {
    install_sigpipe_exit();

    let started = SystemTime::now();
    let respawn_argv = recorded_argv(env::args().collect(), &opts.chdir);

    if let Some(dir) = &opts.chdir {
        env::set_current_dir(dir)
            .with_context(|| format!("Changing directory to {}", dir.display()))?;
    }
    if let Some(mask) = &opts.umask {
        apply_umask(mask)?;
    }

    let catalog = match &opts.rules {
        Some(path) => Catalog::from_toml_file(path)?,
        None => Catalog::default_catalog(),
    };

    let branch = resolve_branch(opts.branch.clone())?;
    export_option_transport(&opts);

    let git_dir = resolve_git_dir()?;

    // Initial checkout; give a racing first notification a moment to land.
    let _ = run_git_lenient(&["checkout", &branch], &None);
    thread::sleep(Duration::from_secs(1));
    rebuild(&git_dir, &opts.build);

    if opts.background {
        daemonize()?;
    }

    let slot_path = peers::slot_path(&git_dir);
    let mut slot_lock = peers::open_slot(&slot_path)?;
    let mut slot = slot_lock
        .try_write()
        .map_err(|_| anyhow!("peer slot {} is already locked", slot_path.display()))?;

    let daemon = Daemon {
        opts,
        branch,
        git_dir,
        catalog,
        respawn_argv,
        started,
        slot_path: slot_path.clone(),
    };
    let result = daemon.run_loop(&mut slot);

    drop(slot);
    let _ = fs::remove_file(&slot_path);
    result
}

struct Daemon {
    opts: DeployOptions,
    branch: String,
    git_dir: PathBuf,
    catalog: Catalog,
    respawn_argv: Vec<String>,
    started: SystemTime,
    slot_path: PathBuf,
}

impl Daemon {
    fn run_loop(&self, slot: &mut File) -> Result<()> {
        loop {
            if self_updated(self.started) {
                self.respawn()?;
            }

            peers::publish(slot, PeerState::Waiting)?;
            // The fetch blocks until the server's notification hook fires
            // or deploy_patience runs out.
            let combined = self.run_sequence();
            peers::publish(slot, PeerState::Working)?;

            if self.catalog.needs_rebase_abort(&combined) {
                let _ = run_git_lenient(&["rebase", "--abort"], &None);
            }

            let control = match self.catalog.classify(&combined) {
                Classification::Known(diagnosis) => self.handle(&diagnosis, &combined)?,
                Classification::Benign => LoopControl::Continue,
                Classification::Unrecognized => {
                    warn!("unrecognized git output; stopping for an operator:\n{combined}");
                    LoopControl::Stop
                }
            };
            if let LoopControl::Stop = control {
                return Ok(());
            }

            thread::sleep(Duration::from_secs(1));
            rebuild(&self.git_dir, &self.opts.build);
        }
    }

    fn run_sequence(&self) -> String {
        let upstream = format!("origin/{}", self.branch);
        let steps: [&[&str]; 3] = [
            &["fetch"],
            &["checkout", &self.branch],
            &["rebase", &upstream],
        ];
        let mut combined = String::new();
        for args in steps {
            match run_git_lenient(args, &None) {
                Ok(out) => combined.push_str(&out.combined()),
                Err(err) => combined.push_str(&format!("{err}\n")),
            }
            if !combined.ends_with('\n') {
                combined.push('\n');
            }
        }
        combined
    }

    fn handle(&self, diagnosis: &Diagnosis, combined: &str) -> Result<LoopControl> {
        match diagnosis.action {
            ActionKind::HostKeyChanged => {
                warn!("remote host key changed:\n{combined}");
                if self.opts.fix_nasty {
                    match extract_nasty_host(combined) {
                        Some(host) => {
                            if let Err(err) = fix_host_key(&host) {
                                warn!("could not refresh host key of {host}: {err:#}");
                            }
                        }
                        None => warn!("output names no host; nothing to fix"),
                    }
                }
                Ok(LoopControl::Stop)
            }
            ActionKind::Diverged => {
                let upstream = format!("origin/{}", self.branch);
                let _ = run_git_lenient(&["checkout", &self.branch], &None);
                let _ = run_git_lenient(&["reset", "--hard", &upstream], &None);
                if self.peer(PeerState::Waiting) {
                    info!("another deployer is waiting here; leaving the repo to it");
                    Ok(LoopControl::Stop)
                } else {
                    thread::sleep(Duration::from_secs(CONTENTION_SLEEP_SECONDS));
                    Ok(LoopControl::Continue)
                }
            }
            ActionKind::Unstaged => {
                if self.peer(PeerState::Waiting) {
                    info!("another deployer is waiting here; leaving the repo to it");
                    Ok(LoopControl::Stop)
                } else {
                    thread::sleep(Duration::from_secs(UNSTAGED_SLEEP_SECONDS));
                    Ok(LoopControl::Continue)
                }
            }
            ActionKind::LockFile => {
                if self.peer(PeerState::Working) {
                    // Somebody's rebase is live; the lock is real.
                    thread::sleep(Duration::from_secs(CONTENTION_SLEEP_SECONDS));
                } else if let Some(path) = &diagnosis.capture {
                    warn!("removing abandoned lock {path}");
                    let _ = fs::remove_file(path);
                }
                Ok(LoopControl::Continue)
            }
            ActionKind::StaleRebase => {
                let Some(path) = diagnosis.capture.as_deref() else {
                    return Ok(LoopControl::Continue);
                };
                if older_than(Path::new(path), STALE_REBASE_AGE_SECONDS)
                    && !self.peer(PeerState::Working)
                {
                    warn!("removing stale rebase state {path}");
                    let _ = fs::remove_dir_all(path);
                    Ok(LoopControl::Continue)
                } else if self.peer(PeerState::Working) {
                    thread::sleep(Duration::from_secs(CONTENTION_SLEEP_SECONDS));
                    Ok(LoopControl::Continue)
                } else {
                    // Fresh rebase-apply but no live rebase we can see:
                    // somebody outside our coordination owns it.
                    Ok(LoopControl::Stop)
                }
            }
            ActionKind::UpToDate => {
                let jitter = thread_rng().gen_range(0..UP_TO_DATE_JITTER_SECONDS);
                thread::sleep(Duration::from_secs(UP_TO_DATE_SLEEP_SECONDS + jitter));
                Ok(LoopControl::Continue)
            }
        }
    }

    fn peer(&self, state: PeerState) -> bool {
        peers::another_in_state(&self.git_dir, &self.slot_path, state)
    }

    fn respawn(&self) -> Result<()> {
        info!("binary updated on disk; re-executing");
        let err = Command::new(&self.respawn_argv[0])
            .args(&self.respawn_argv[1..])
            .exec();
        Err(err).context("Re-executing after self-update")
    }
}

/// The argv recorded for respawn. Immutable, except that a relative
/// `--chdir` is scrubbed: after the initial chdir it would resolve against
/// the wrong directory.
fn recorded_argv(argv: Vec<String>, chdir: &Option<PathBuf>) -> Vec<String> {
    let scrub = matches!(chdir, Some(dir) if dir.is_relative());
    if !scrub {
        return argv;
    }
    let mut recorded = Vec::with_capacity(argv.len());
    let mut skip_value = false;
    for arg in argv {
        if skip_value {
            skip_value = false;
            continue;
        }
        if arg == "--chdir" {
            skip_value = true;
            continue;
        }
        if arg.starts_with("--chdir=") {
            continue;
        }
        recorded.push(arg);
    }
    recorded
}

fn apply_umask(mask: &str) -> Result<()> {
    let bits = u32::from_str_radix(mask, 8)
        .with_context(|| format!("Invalid umask {mask:?}; expected octal"))?;
    let mode = nix::sys::stat::Mode::from_bits_truncate(bits);
    nix::sys::stat::umask(mode);
    Ok(())
}

/// Branch to deploy when none was given: the current branch from
/// `git branch -a`, falling back to a `--contains` query for a detached
/// HEAD.
pub fn resolve_branch(explicit: Option<String>) -> Result<String> {
    if let Some(branch) = explicit {
        return Ok(branch);
    }
    let listing = capture_git_output(&["branch", "-a"], &None)
        .context("Listing branches to pick a deploy branch")?;
    match parse_branch_listing(&listing.stdout) {
        BranchHead::Named(name) => Ok(name),
        BranchHead::Detached(hash) => {
            let containing = capture_git_output(&["branch", "-a", "--contains", &hash], &None)
                .context("Finding branches containing the detached HEAD")?;
            first_indented_ref(&containing.stdout)
                .context("Cannot determine a deploy branch for the detached HEAD")
        }
        BranchHead::Unknown => bail!("Cannot determine a deploy branch; use --branch"),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum BranchHead {
    Named(String),
    Detached(String),
    Unknown,
}

fn parse_branch_listing(listing: &str) -> BranchHead {
    let detached = Regex::new(r"\(HEAD detached (?:at|from) (\S+)\)").unwrap();
    for line in listing.lines() {
        let Some(rest) = line.strip_prefix("* ") else {
            continue;
        };
        if let Some(caps) = detached.captures(rest) {
            return BranchHead::Detached(caps[1].to_string());
        }
        if rest.starts_with('(') {
            return BranchHead::Unknown;
        }
        return BranchHead::Named(rest.trim().to_string());
    }
    BranchHead::Unknown
}

/// First indented (non-current) ref in a branch listing, reduced to a
/// plain branch name.
fn first_indented_ref(listing: &str) -> Option<String> {
    for line in listing.lines() {
        if line.starts_with('*') {
            continue;
        }
        let name = line.trim();
        if name.is_empty() || name.contains("->") {
            continue;
        }
        let name = match name.strip_prefix("remotes/") {
            Some(rest) => rest.split_once('/').map(|(_, b)| b).unwrap_or(rest),
            None => name,
        };
        return Some(name.to_string());
    }
    None
}

/// Ships the client options to the server. The dedicated variable and the
/// legacy `XMODIFIERS` both carry the newline-joined list, and ssh is told
/// to forward them.
fn export_option_transport(opts: &DeployOptions) {
    let patience = opts.max_delay.unwrap_or(DEFAULT_MAX_DELAY_SECONDS);
    let mut lines = vec![format!("deploy_patience={patience}")];
    lines.extend(opts.options.iter().cloned());
    let joined = lines.join("\n");
    env::set_var(OPTIONS_ENV, &joined);
    env::set_var(OPTIONS_ENV_COMPAT, &joined);
    env::set_var(
        "GIT_SSH_COMMAND",
        format!("ssh -o SendEnv={OPTIONS_ENV} -o SendEnv={OPTIONS_ENV_COMPAT}"),
    );
}

fn self_updated(started: SystemTime) -> bool {
    env::current_exe()
        .and_then(fs::metadata)
        .and_then(|meta| meta.modified())
        .map(|mtime| mtime > started)
        .unwrap_or(false)
}

fn older_than(path: &Path, seconds: u64) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    let Ok(mtime) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(mtime)
        .map(|age| age.as_secs() > seconds)
        .unwrap_or(false)
}

/// Serializes builds across deployers of the same repository by taking a
/// non-blocking exclusive lock on `$GIT_DIR/config`.
fn rebuild(git_dir: &Path, build: &Option<String>) {
    let Some(cmd) = build else {
        return;
    };
    let config = git_dir.join("config");
    let file = match OpenOptions::new().read(true).write(true).open(&config) {
        Ok(file) => file,
        Err(err) => {
            warn!("cannot open build lock {}: {err}", config.display());
            return;
        }
    };
    let mut lock = fd_lock::RwLock::new(file);
    let result = lock.try_write();
    match result {
        Ok(_guard) => {
            info!("running build: {cmd}");
            match Command::new("sh").arg("-c").arg(cmd).status() {
                Ok(status) if status.success() => info!("build succeeded"),
                Ok(status) => warn!("build exited with {status}"),
                Err(err) => warn!("build failed to start: {err}"),
            }
        }
        Err(_) => debug!("another deployer holds the build lock; skipping"),
    }
}

/// Host named by an SSH host-key warning, when there is one.
fn extract_nasty_host(output: &str) -> Option<String> {
    let re = Regex::new(r"[Hh]ost key for ([^\s']+) has changed").unwrap();
    re.captures(output).map(|caps| caps[1].to_string())
}

/// Drops the stale key and re-seeds known_hosts for the host and its
/// resolved IPv4 address.
fn fix_host_key(host: &str) -> Result<()> {
    info!("refreshing host key of {host}");
    let _ = capture_tool_output("ssh-keygen", &["-R", host]);

    let mut targets = vec![host.to_string()];
    if let Ok(addrs) = (host, 22).to_socket_addrs() {
        if let Some(v4) = addrs.into_iter().find(|a| a.is_ipv4()) {
            let ip = v4.ip().to_string();
            let _ = capture_tool_output("ssh-keygen", &["-R", &ip]);
            targets.push(ip);
        }
    }

    let target_refs: Vec<&str> = targets.iter().map(String::as_str).collect();
    let scanned = capture_tool_output("ssh-keyscan", &target_refs)
        .with_context(|| format!("Re-scanning host key of {host}"))?;
    append_known_hosts(&scanned.stdout)
}

fn daemonize() -> Result<()> {
    use nix::unistd::{dup2, fork, setsid, ForkResult};

    match unsafe { fork() }.context("First fork")? {
        ForkResult::Parent { .. } => process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("Detaching from the controlling terminal")?;
    match unsafe { fork() }.context("Second fork")? {
        ForkResult::Parent { .. } => process::exit(0),
        ForkResult::Child => {}
    }

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("Opening /dev/null")?;
    for target in 0..=2 {
        dup2(devnull.as_raw_fd(), target).context("Redirecting stdio")?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_helpers::{dir_with_repo, DirGuard};
    use serial_test::serial;

    #[test]
    fn test_recorded_argv_scrubs_relative_chdir() {
        let argv: Vec<String> = ["git-warden", "deploy", "--chdir", "sub/dir", "--build", "make"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let recorded = recorded_argv(argv, &Some(PathBuf::from("sub/dir")));
        assert_eq!(recorded, vec!["git-warden", "deploy", "--build", "make"]);
    }

    #[test]
    fn test_recorded_argv_scrubs_equals_form() {
        let argv: Vec<String> = ["git-warden", "deploy", "--chdir=sub", "main"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let recorded = recorded_argv(argv, &Some(PathBuf::from("sub")));
        assert_eq!(recorded, vec!["git-warden", "deploy", "main"]);
    }

    #[test]
    fn test_recorded_argv_keeps_absolute_chdir() {
        let argv: Vec<String> = ["git-warden", "deploy", "--chdir", "/srv/app"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let recorded = recorded_argv(argv.clone(), &Some(PathBuf::from("/srv/app")));
        assert_eq!(recorded, argv);
    }

    #[test]
    fn test_parse_branch_listing_current() {
        let listing = "  develop\n* main\n  remotes/origin/main\n";
        assert_eq!(
            parse_branch_listing(listing),
            BranchHead::Named("main".to_string())
        );
    }

    #[test]
    fn test_parse_branch_listing_detached() {
        let listing = "* (HEAD detached at abc1234)\n  main\n";
        assert_eq!(
            parse_branch_listing(listing),
            BranchHead::Detached("abc1234".to_string())
        );
    }

    #[test]
    fn test_parse_branch_listing_empty() {
        assert_eq!(parse_branch_listing(""), BranchHead::Unknown);
    }

    #[test]
    fn test_first_indented_ref() {
        let listing = "* (HEAD detached at abc1234)\n  main\n  remotes/origin/main\n";
        assert_eq!(first_indented_ref(listing), Some("main".to_string()));

        let remotes_only = "* (HEAD detached at abc1234)\n  remotes/origin/release\n";
        assert_eq!(first_indented_ref(remotes_only), Some("release".to_string()));

        let symref = "  remotes/origin/HEAD -> origin/main\n  remotes/origin/main\n";
        assert_eq!(first_indented_ref(symref), Some("main".to_string()));
    }

    #[test]
    #[serial]
    fn test_resolve_branch_explicit_wins() {
        assert_eq!(
            resolve_branch(Some("release".to_string())).unwrap(),
            "release"
        );
    }

    #[test]
    #[serial]
    fn test_resolve_branch_from_checkout() {
        let repo = dir_with_repo();
        let _guard = DirGuard::new(repo.path());
        assert_eq!(resolve_branch(None).unwrap(), "master");
    }

    #[test]
    #[serial]
    fn test_export_option_transport() {
        let opts = DeployOptions {
            options: vec!["feature=blue".to_string(), "DEBUG=1".to_string()],
            max_delay: Some(600),
            ..Default::default()
        };
        export_option_transport(&opts);
        let sent = env::var(OPTIONS_ENV).unwrap();
        assert_eq!(sent, "deploy_patience=600\nfeature=blue\nDEBUG=1");
        assert_eq!(env::var(OPTIONS_ENV_COMPAT).unwrap(), sent);
        assert!(env::var("GIT_SSH_COMMAND").unwrap().contains("SendEnv"));

        env::remove_var(OPTIONS_ENV);
        env::remove_var(OPTIONS_ENV_COMPAT);
        env::remove_var("GIT_SSH_COMMAND");
    }

    #[test]
    fn test_extract_nasty_host() {
        let output = "@ WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED! @\n\
                      IT IS POSSIBLE THAT SOMEONE IS DOING SOMETHING NASTY!\n\
                      Host key for up.example has changed and you have requested strict checking.\n";
        assert_eq!(extract_nasty_host(output), Some("up.example".to_string()));
        assert_eq!(extract_nasty_host("no host here"), None);
    }

    #[test]
    fn test_older_than() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh");
        fs::write(&path, "x").unwrap();
        assert!(!older_than(&path, 3600));
        assert!(!older_than(Path::new("/no/such/path"), 0));
    }

    #[test]
    fn test_self_updated_false_for_running_binary() {
        // The test binary was built before the process started.
        assert!(!self_updated(SystemTime::now()));
    }

    #[test]
    #[serial]
    fn test_rebuild_runs_under_lock() {
        let repo = dir_with_repo();
        let git_dir = repo.path().join(".git");
        let marker = repo.path().join("built");
        let cmd = format!("touch {}", marker.display());
        rebuild(&git_dir, &Some(cmd));
        assert!(marker.exists());

        // A held lock suppresses the build.
        let config = git_dir.join("config");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config)
            .unwrap();
        let mut lock = fd_lock::RwLock::new(file);
        let _guard = lock.try_write().unwrap();
        let marker2 = repo.path().join("built2");
        rebuild(&git_dir, &Some(format!("touch {}", marker2.display())));
        assert!(!marker2.exists());
    }
}
