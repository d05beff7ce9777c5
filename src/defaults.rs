//! Centralized default values and well-known names.
//!
//! This module defines the constants used throughout the application to
//! avoid magic numbers and stringly-typed names scattered in the codebase.

// ============================================================================
// Option transport
// ============================================================================

/// Dedicated environment variable carrying newline-separated client options.
pub const OPTIONS_ENV: &str = "GIT_WARDEN_OPTIONS";

/// Legacy option transport variable. SSH installations commonly forward it
/// (`SendEnv=XMODIFIERS`), so it is still accepted and still advertised by
/// the deploy daemon for wire compatibility.
pub const OPTIONS_ENV_COMPAT: &str = "XMODIFIERS";

/// ACL principal used when the connection supplies no `KEY`.
pub const DEFAULT_KEY: &str = "UNKNOWN";

// ============================================================================
// Proxy reconciler
// ============================================================================

/// Remote name pointing at the local bare repository.
pub const REMOTE_HERE: &str = "here";

/// Remote name pointing at the configured upstream proxy.
pub const REMOTE_THERE: &str = "there";

/// Suffix appended to a bare repo path to derive its sync working clone.
pub const WORKINGDIR_SUFFIX: &str = ".workingdir";

/// Sentinel file (under the working clone's `.git`) whose non-empty content
/// is the ref listing both sides agreed on at the last completed reconcile.
pub const SYNC_SENTINEL: &str = "SYNCED";

// ============================================================================
// Deploy daemon
// ============================================================================

/// Default maximum time (seconds) the server side may block a fetch while
/// waiting for a push notification. Shipped as `deploy_patience=<secs>`.
pub const DEFAULT_MAX_DELAY_SECONDS: u64 = 7200;

/// Base sleep after an "already up to date" iteration.
pub const UP_TO_DATE_SLEEP_SECONDS: u64 = 5;

/// Upper bound (exclusive) of the random jitter added to the up-to-date
/// sleep, so a fleet of deployers does not thundering-herd the server.
pub const UP_TO_DATE_JITTER_SECONDS: u64 = 55;

/// Sleep before retrying after a diverged-branch hard reset or a lock
/// collision that could not be resolved.
pub const CONTENTION_SLEEP_SECONDS: u64 = 60;

/// Sleep before retrying when the working tree has unstaged changes.
pub const UNSTAGED_SLEEP_SECONDS: u64 = 10;

/// A `rebase-apply` directory older than this is considered abandoned.
pub const STALE_REBASE_AGE_SECONDS: u64 = 3600;

/// Directory (under `GIT_DIR`) where deploy daemons publish their state.
pub const PEERS_DIR: &str = "deploy-peers";
