//! Two-way sync between the local bare repository and a configured
//! upstream proxy.
//!
//! The reconciler maintains a sibling working clone (`<GIT_DIR>.workingdir`)
//! with two remotes: `here` for the local bare repo and `there` for
//! `proxy.url`. The `SYNCED` sentinel inside the clone's `.git` records the
//! ref listing both sides agreed on the last time a reconcile ran to
//! completion; its presence selects the directional policy.
//!
//! The whole component is advisory. It reports problems, drops the
//! sentinel, and lets the git operation proceed.

use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use crate::acl::RepoConfig;
use crate::defaults::{REMOTE_HERE, REMOTE_THERE, SYNC_SENTINEL, WORKINGDIR_SUFFIX};
use crate::git::git_lowlevel::{capture_git_output, capture_tool_output, run_git_lenient};
use crate::git::refs::{RefKind, RefListing};

/// What the invoking hook's name says about where we are in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyPhase {
    Pre,
    PostWrite,
    Quiet,
}

impl ProxyPhase {
    pub fn from_hook(hook: &str) -> Self {
        if hook.starts_with("pre-") {
            ProxyPhase::Pre
        } else if hook == "post-write" {
            ProxyPhase::PostWrite
        } else {
            ProxyPhase::Quiet
        }
    }
}

/// CLI entry. Never fails the calling hook: reconcile problems are logged,
/// the sentinel is dropped, and the session continues.
pub fn run(hook_name: &str) -> Result<()> {
    let phase = ProxyPhase::from_hook(hook_name);
    match Reconciler::from_env() {
        Ok(None) => debug!("no proxy.url configured; nothing to reconcile"),
        Ok(Some(reconciler)) => {
            if let Err(err) = reconciler.reconcile(phase) {
                warn!("proxy reconcile ({hook_name}): {err:#}");
                reconciler.clear_sentinel();
            }
        }
        Err(err) => warn!("proxy reconcile ({hook_name}): {err:#}"),
    }
    Ok(())
}

pub struct Reconciler {
    git_dir: PathBuf,
    workdir: PathBuf,
    proxy_url: String,
}

impl Reconciler {
    /// Builds a reconciler from the hook environment. `None` when the
    /// repository has no `proxy.url`.
    pub fn from_env() -> Result<Option<Self>> {
        let git_dir = PathBuf::from(
            env::var("GIT_DIR").context("GIT_DIR is not set; not running under the pipeline")?,
        );
        if !git_dir.is_dir() {
            bail!("GIT_DIR {} is not a directory", git_dir.display());
        }
        let config = RepoConfig::load(&git_dir)?;
        let Some(proxy_url) = config.proxy_url else {
            return Ok(None);
        };
        Ok(Some(Self::new(git_dir, proxy_url)))
    }

    pub fn new(git_dir: PathBuf, proxy_url: String) -> Self {
        let workdir = PathBuf::from(format!("{}{}", git_dir.display(), WORKINGDIR_SUFFIX));
        Reconciler {
            git_dir,
            workdir,
            proxy_url,
        }
    }

    pub fn reconcile(&self, phase: ProxyPhase) -> Result<()> {
        if phase == ProxyPhase::Quiet {
            return Ok(());
        }
        if !self.workdir.is_dir() {
            if phase == ProxyPhase::PostWrite {
                // The pre hook had its chance to bootstrap.
                return Ok(());
            }
            self.bootstrap()?;
        }
        self.check_remotes()?;

        let here = self.ls_remote(REMOTE_HERE)?;
        let there = self.ls_remote(REMOTE_THERE)?;
        if here == there {
            self.write_sentinel(&here.canonical())?;
            return Ok(());
        }

        let synced = self.sentinel_present();
        self.fetch_both();

        let diff = here.diff_names(&there);
        match (phase, synced) {
            (ProxyPhase::Pre, false) => self.heal(&here, &there, &diff),
            (ProxyPhase::Pre, true) => {
                self.directed(&there, REMOTE_THERE, REMOTE_HERE, &diff)
            }
            (ProxyPhase::PostWrite, true) => {
                self.directed(&here, REMOTE_HERE, REMOTE_THERE, &diff)
            }
            (ProxyPhase::PostWrite, false) => {
                debug!("post-write with no sync baseline; leaving refs alone")
            }
            (ProxyPhase::Quiet, _) => unreachable!(),
        }

        // Finalize: the sentinel only survives when both sides agree now.
        let here = self.ls_remote(REMOTE_HERE)?;
        let there = self.ls_remote(REMOTE_THERE)?;
        if here == there {
            self.write_sentinel(&here.canonical())?;
        } else {
            self.clear_sentinel();
        }
        Ok(())
    }

    /// Creates the working clone and verifies the upstream is reachable.
    fn bootstrap(&self) -> Result<()> {
        info!(
            "bootstrapping proxy working clone {}",
            self.workdir.display()
        );
        capture_git_output(
            &[
                "clone",
                "-o",
                REMOTE_HERE,
                &self.git_dir.display().to_string(),
                &self.workdir.display().to_string(),
            ],
            &None,
        )
        .context("Cloning local repository into working clone")?;
        self.git(&["remote", "add", REMOTE_THERE, &self.proxy_url])
            .context("Adding proxy remote")?;

        if let Some(host) = ssh_host(&self.proxy_url) {
            if let Err(err) = ensure_known_host(&host) {
                warn!("could not pre-seed known_hosts for {host}: {err:#}");
            }
        }

        let verified = self
            .git(&["fetch", REMOTE_THERE])
            .and_then(|_| self.git(&["ls-remote", REMOTE_THERE]));
        if let Err(err) = verified {
            let _ = fs::remove_dir_all(&self.workdir);
            if env::var_os("SSH_AUTH_SOCK").is_none() {
                warn!(
                    "SSH_AUTH_SOCK is not set; if the proxy requires your key, \
                     enable ForwardAgent for this host"
                );
            }
            return Err(err).context(format!("Proxy {} unreachable", self.proxy_url));
        }
        Ok(())
    }

    /// The working clone is disposable; when its remotes stop matching the
    /// configuration it is deleted rather than repaired.
    fn check_remotes(&self) -> Result<()> {
        let here_url = self.remote_url(REMOTE_HERE)?;
        let there_url = self.remote_url(REMOTE_THERE)?;
        let expected_here = self.git_dir.display().to_string();
        if here_url != expected_here || there_url != self.proxy_url {
            let _ = fs::remove_dir_all(&self.workdir);
            bail!(
                "Proxy mismatch: workdir remotes ({here_url}, {there_url}) \
                 no longer match ({expected_here}, {})",
                self.proxy_url
            );
        }
        Ok(())
    }

    fn remote_url(&self, remote: &str) -> Result<String> {
        let out = self
            .git(&["remote", "get-url", remote])
            .with_context(|| format!("Reading url of remote {remote}"))?;
        Ok(out.stdout.trim().to_string())
    }

    fn ls_remote(&self, remote: &str) -> Result<RefListing> {
        let out = self
            .git(&["ls-remote", remote])
            .with_context(|| format!("Listing refs of {remote}"))?;
        Ok(RefListing::parse(&out.stdout))
    }

    fn fetch_both(&self) {
        for remote in [REMOTE_HERE, REMOTE_THERE] {
            match run_git_lenient(&["fetch", "--tags", remote], &Some(self.workdir.as_path())) {
                Ok(out) if !out.success() => {
                    warn!("fetch --tags {remote} had failures:\n{}", out.stderr)
                }
                Ok(_) => {}
                Err(err) => warn!("fetch --tags {remote} failed: {err}"),
            }
        }
    }

    /// No sync baseline: repair in both directions. For each differing ref,
    /// the side that is an ancestor of the other is fast-forwarded; refs
    /// existing on one side only are created on the other; unrelated tips
    /// are left for an operator.
    fn heal(
        &self,
        here: &RefListing,
        there: &RefListing,
        diff: &std::collections::BTreeSet<(RefKind, String)>,
    ) {
        for (kind, name) in diff {
            let here_oid = here.get(*kind, name);
            let there_oid = there.get(*kind, name);
            let result = match (here_oid, there_oid) {
                (Some(h), Some(t)) => {
                    if self.is_ancestor(h, t) {
                        self.push_tip(REMOTE_HERE, *kind, name, t)
                    } else if self.is_ancestor(t, h) {
                        self.push_tip(REMOTE_THERE, *kind, name, h)
                    } else {
                        warn!("{kind} {name} too divergent; skipping");
                        continue;
                    }
                }
                (Some(h), None) => self.push_tip(REMOTE_THERE, *kind, name, h),
                (None, Some(t)) => self.push_tip(REMOTE_HERE, *kind, name, t),
                (None, None) => continue,
            };
            if let Err(err) = result {
                warn!("could not heal {kind} {name}: {err:#}");
            }
        }
    }

    /// One-directional sync for sessions with a sync baseline: the source
    /// side's view of every differing ref is imposed on the destination.
    fn directed(
        &self,
        src: &RefListing,
        src_remote: &str,
        dst_remote: &str,
        diff: &std::collections::BTreeSet<(RefKind, String)>,
    ) {
        for (kind, name) in diff {
            let result = match (kind, src.get(*kind, name)) {
                (_, None) => self.delete_ref(dst_remote, *kind, name),
                (RefKind::Tag, Some(oid)) => self.force_tag(dst_remote, name, oid),
                (RefKind::Branch, Some(_)) => {
                    self.rebase_branch(src_remote, dst_remote, name)
                }
            };
            if let Err(err) = result {
                warn!(
                    "skipping {kind} {name} ({src_remote} -> {dst_remote}): {err:#}"
                );
            }
        }
    }

    /// Fast-forwards (or creates) a ref on `remote` to `oid`. Tags are
    /// always forced.
    fn push_tip(&self, remote: &str, kind: RefKind, name: &str, oid: &str) -> Result<()> {
        let refspec = format!("{oid}:{}{name}", kind.prefix());
        match kind {
            RefKind::Tag => self.git(&["push", "--force", remote, &refspec])?,
            RefKind::Branch => self.git(&["push", remote, &refspec])?,
        };
        Ok(())
    }

    /// Removes a ref locally and on the destination remote.
    fn delete_ref(&self, remote: &str, kind: RefKind, name: &str) -> Result<()> {
        match kind {
            RefKind::Branch => {
                let _ = run_git_lenient(&["branch", "-D", name], &Some(self.workdir.as_path()));
            }
            RefKind::Tag => {
                let _ = run_git_lenient(&["tag", "-d", name], &Some(self.workdir.as_path()));
            }
        }
        let refspec = format!(":{}{name}", kind.prefix());
        self.git(&["push", remote, &refspec])?;
        Ok(())
    }

    /// Tag moves are forced on both the local clone and the destination.
    fn force_tag(&self, remote: &str, name: &str, oid: &str) -> Result<()> {
        self.git(&["tag", "-f", name, oid])?;
        let refspec = format!("refs/tags/{name}:refs/tags/{name}");
        self.git(&["push", "--force", remote, &refspec])?;
        Ok(())
    }

    /// Branch update: check the branch out (tracking the source remote when
    /// it is new here), rebase-pull from the source, push to the
    /// destination.
    fn rebase_branch(&self, src_remote: &str, dst_remote: &str, name: &str) -> Result<()> {
        let checked_out = run_git_lenient(&["checkout", name], &Some(self.workdir.as_path()))?;
        if !checked_out.success() {
            let track = format!("{src_remote}/{name}");
            self.git(&["checkout", "--track", &track])?;
        }
        self.git(&["pull", "--rebase", src_remote, name])?;
        self.git(&["push", dst_remote, name])?;
        Ok(())
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        run_git_lenient(
            &["merge-base", "--is-ancestor", ancestor, descendant],
            &Some(self.workdir.as_path()),
        )
        .map(|out| out.success())
        .unwrap_or(false)
    }

    fn git(&self, args: &[&str]) -> Result<crate::git::GitOutput, crate::git::GitError> {
        capture_git_output(args, &Some(self.workdir.as_path()))
    }

    fn sentinel_path(&self) -> PathBuf {
        self.workdir.join(".git").join(SYNC_SENTINEL)
    }

    /// Present means present with content: an empty sentinel is the same
    /// as no sentinel.
    pub fn sentinel_present(&self) -> bool {
        fs::read_to_string(self.sentinel_path())
            .map(|content| !content.trim().is_empty())
            .unwrap_or(false)
    }

    /// Single atomic write-temp-rename; the sentinel is never visible in a
    /// half-written state.
    fn write_sentinel(&self, content: &str) -> Result<()> {
        let dir = self.workdir.join(".git");
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("Creating sentinel temp file in {}", dir.display()))?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(self.sentinel_path())
            .context("Persisting sync sentinel")?;
        Ok(())
    }

    pub fn clear_sentinel(&self) {
        let _ = fs::remove_file(self.sentinel_path());
    }
}

/// Host part of an SSH-ish url (`ssh://user@host:port/path` or
/// `user@host:path`). Non-SSH urls yield `None`.
pub fn ssh_host(url: &str) -> Option<String> {
    if let Some(rest) = url.strip_prefix("ssh://") {
        let authority = rest.split('/').next()?;
        let host = authority.rsplit('@').next()?;
        let host = if let Some(stripped) = host.strip_prefix('[') {
            stripped.split(']').next()?
        } else {
            host.split(':').next()?
        };
        return (!host.is_empty()).then(|| host.to_string());
    }
    if url.contains("://") {
        return None;
    }
    // scp-like syntax only counts when a colon precedes the first slash
    let colon = url.find(':')?;
    if let Some(slash) = url.find('/') {
        if slash < colon {
            return None;
        }
    }
    let host = url[..colon].rsplit('@').next()?;
    (!host.is_empty()).then(|| host.to_string())
}

/// Appends `ssh-keyscan` output for `host` to `~/.ssh/known_hosts` when no
/// existing entry names it.
pub fn ensure_known_host(host: &str) -> Result<()> {
    let home = dirs_next::home_dir().context("No home directory")?;
    let ssh_dir = home.join(".ssh");
    let known_hosts = ssh_dir.join("known_hosts");

    if let Ok(content) = fs::read_to_string(&known_hosts) {
        if content
            .lines()
            .any(|line| known_hosts_line_matches(line, host))
        {
            return Ok(());
        }
    }

    let scanned = capture_tool_output("ssh-keyscan", &[host])
        .with_context(|| format!("Scanning host key of {host}"))?;
    if scanned.stdout.trim().is_empty() {
        bail!("ssh-keyscan returned nothing for {host}");
    }
    append_known_hosts(&scanned.stdout)?;
    info!("added {host} to known_hosts");
    Ok(())
}

/// Appends raw `ssh-keyscan` output to `~/.ssh/known_hosts`, creating the
/// directory and file as needed.
pub fn append_known_hosts(keys: &str) -> Result<()> {
    let home = dirs_next::home_dir().context("No home directory")?;
    let ssh_dir = home.join(".ssh");
    fs::create_dir_all(&ssh_dir)?;
    let known_hosts = ssh_dir.join("known_hosts");
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&known_hosts)
        .with_context(|| format!("Opening {}", known_hosts.display()))?;
    file.write_all(keys.as_bytes())?;
    Ok(())
}

fn known_hosts_line_matches(line: &str, host: &str) -> bool {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('|') {
        // Hashed entries cannot be matched textually.
        return false;
    }
    let Some(hosts_field) = line.split_whitespace().next() else {
        return false;
    };
    hosts_field
        .split(',')
        .any(|entry| entry == host || entry.starts_with(&format!("[{host}]")))
}
