//! Per-repository access configuration, read from `git config --list` of
//! the target bare repository.
//!
//! The namespaces consumed are `acl.readers`, `acl.writers`, `acl.deploy`,
//! `acl.restrictip`, `proxy.url`, and the `log.*` pass-through for the
//! optional logger hook. ACL keys hold comma-separated `KEY` values.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};

use crate::git::git_lowlevel::capture_git_output;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoConfig {
    pub readers: BTreeSet<String>,
    pub writers: BTreeSet<String>,
    pub deploy: BTreeSet<String>,
    pub restrict_ip: Option<String>,
    pub proxy_url: Option<String>,
    /// `log.*` settings, keyed by the part after `log.`.
    pub log_settings: BTreeMap<String, String>,
}

impl RepoConfig {
    pub fn load(git_dir: &Path) -> Result<Self> {
        let git_dir_arg = format!("--git-dir={}", git_dir.display());
        let out = capture_git_output(&[&git_dir_arg, "config", "--list"], &None)
            .with_context(|| format!("Reading config of {}", git_dir.display()))?;
        Ok(Self::parse(&out.stdout))
    }

    /// Parses `git config --list` output (`key=value` per line). Later
    /// occurrences win, matching git's own scoping order.
    pub fn parse(listing: &str) -> Self {
        let mut config = RepoConfig::default();
        for line in listing.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "acl.readers" => config.readers = split_principals(value),
                "acl.writers" => config.writers = split_principals(value),
                "acl.deploy" => config.deploy = split_principals(value),
                "acl.restrictip" => config.restrict_ip = Some(value.to_string()),
                "proxy.url" => config.proxy_url = Some(value.to_string()),
                _ => {
                    if let Some(name) = key.strip_prefix("log.") {
                        config
                            .log_settings
                            .insert(name.to_string(), value.to_string());
                    }
                }
            }
        }
        config
    }

    /// Write implies read, deploy implies read.
    pub fn may_read(&self, key: &str) -> bool {
        self.readers.contains(key) || self.writers.contains(key) || self.deploy.contains(key)
    }

    pub fn may_write(&self, key: &str) -> bool {
        self.writers.contains(key)
    }

    pub fn has_writers(&self) -> bool {
        !self.writers.is_empty()
    }
}

/// Sets a single config key in the target repository.
pub fn set_repo_config(git_dir: &Path, key: &str, value: &str) -> Result<()> {
    let git_dir_arg = format!("--git-dir={}", git_dir.display());
    capture_git_output(&[&git_dir_arg, "config", key, value], &None)
        .with_context(|| format!("Setting {key} in {}", git_dir.display()))?;
    Ok(())
}

/// Sets a key in the invoking user's global git config.
pub fn set_global_config(key: &str, value: &str) -> Result<()> {
    capture_git_output(&["config", "--global", key, value], &None)
        .with_context(|| format!("Setting global {key}"))?;
    Ok(())
}

fn split_principals(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
