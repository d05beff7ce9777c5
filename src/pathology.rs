//! The catalog of recognized git working-tree pathologies.
//!
//! The deploy daemon classifies the combined output of each
//! fetch/checkout/rebase iteration against an ordered table of
//! `regex -> action` rules. Git's phrasing changes across versions, so the
//! table is data: the built-in catalog can be replaced wholesale from a
//! TOML file without touching code.

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

/// What a matched rule tells the daemon to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    /// SSH warns the host key changed; possibly a MITM, possibly a
    /// reinstalled server.
    HostKeyChanged,
    /// Local branch and upstream diverged; hard reset is the cure.
    Diverged,
    /// Unstaged local edits block the rebase.
    Unstaged,
    /// A ref/index lock file was left behind.
    LockFile,
    /// A `rebase-apply` directory was left behind.
    StaleRebase,
    /// Nothing new; wait for the next push.
    UpToDate,
}

#[derive(Debug)]
pub struct PathologyRule {
    pub name: String,
    pub pattern: Regex,
    pub action: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    pub action: ActionKind,
    /// First capture group of the matching rule, when the rule has one
    /// (the lock file path, the stale rebase-apply directory).
    pub capture: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Classification {
    Known(Diagnosis),
    /// Ordinary rebase/fetch chatter; continue the loop.
    Benign,
    /// Output the catalog has never seen; stop and let an operator look.
    Unrecognized,
}

#[derive(Debug)]
pub struct Catalog {
    rules: Vec<PathologyRule>,
    benign: Vec<Regex>,
    conflict: Vec<Regex>,
}

/// On-disk rule file shape.
#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "rule")]
    rules: Vec<RuleSpec>,
    #[serde(default)]
    benign: Vec<String>,
    #[serde(default)]
    conflict: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    name: String,
    pattern: String,
    action: ActionKind,
}

impl Catalog {
    pub fn default_catalog() -> Self {
        let rule = |name: &str, pattern: &str, action: ActionKind| PathologyRule {
            name: name.to_string(),
            pattern: Regex::new(pattern).expect("built-in pattern must compile"),
            action,
        };
        Catalog {
            rules: vec![
                rule(
                    "host-key-changed",
                    r"(?s)POSSIBLE.*SOMEONE.*DOING.*NASTY",
                    ActionKind::HostKeyChanged,
                ),
                rule("diverged", r"Your branch.*diverged", ActionKind::Diverged),
                rule(
                    "unstaged",
                    r"You have unstaged changes",
                    ActionKind::Unstaged,
                ),
                rule(
                    "lock-file",
                    r"fatal: Unable to create '(.+)': File exists.",
                    ActionKind::LockFile,
                ),
                rule(
                    "stale-rebase-apply",
                    r#"(?s)cannot create.*rebase-apply.*please rm -fr "?(/.*\.git/rebase-apply)"?"#,
                    ActionKind::StaleRebase,
                ),
                rule(
                    "up-to-date",
                    r"Current branch.*is up to date",
                    ActionKind::UpToDate,
                ),
            ],
            benign: [
                "rewinding head to replay",
                "fast-forward",
                "but expected",
                "Unpacking objects",
                "Cannot rebase",
                // Deliberately loose: matches "Recent commit" and
                // "recent commit" across git versions.
                "ecent commit",
            ]
            .iter()
            .map(|p| Regex::new(p).expect("built-in pattern must compile"))
            .collect(),
            conflict: [
                "CONFLICT",
                "could not apply",
                "Cannot rebase",
                "Resolve all conflicts",
            ]
            .iter()
            .map(|p| Regex::new(p).expect("built-in pattern must compile"))
            .collect(),
        }
    }

    /// Replaces the catalog from a TOML rule file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Reading rule file {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content).context("Parsing rule file")?;
        let compile = |pattern: &str| {
            Regex::new(pattern).with_context(|| format!("Compiling pattern {pattern:?}"))
        };
        Ok(Catalog {
            rules: file
                .rules
                .into_iter()
                .map(|raw| {
                    Ok(PathologyRule {
                        pattern: compile(&raw.pattern)?,
                        name: raw.name,
                        action: raw.action,
                    })
                })
                .collect::<Result<_>>()?,
            benign: file
                .benign
                .iter()
                .map(|p| compile(p))
                .collect::<Result<_>>()?,
            conflict: file
                .conflict
                .iter()
                .map(|p| compile(p))
                .collect::<Result<_>>()?,
        })
    }

    /// First matching rule wins; rule order is part of the catalog.
    pub fn classify(&self, output: &str) -> Classification {
        for rule in &self.rules {
            if let Some(caps) = rule.pattern.captures(output) {
                return Classification::Known(Diagnosis {
                    action: rule.action,
                    capture: caps.get(1).map(|m| m.as_str().to_string()),
                });
            }
        }
        if self.benign.iter().any(|p| p.is_match(output)) {
            Classification::Benign
        } else {
            Classification::Unrecognized
        }
    }

    /// A stuck rebase must be aborted before the next iteration.
    pub fn needs_rebase_abort(&self, output: &str) -> bool {
        self.conflict.iter().any(|p| p.is_match(output))
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::default_catalog()
    }
}
