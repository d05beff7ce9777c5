//! Coordination between deploy daemons sharing one repository.
//!
//! Each daemon claims `$GIT_DIR/deploy-peers/<pid>` by holding an exclusive
//! advisory lock on it for its whole lifetime and publishes its state
//! (`waiting` or `working`) as the file's content. Peers scan the
//! directory: a file whose lock can be taken belongs to a dead daemon and
//! is reaped; a locked file is a live peer whose state is its content.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::defaults::PEERS_DIR;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Waiting,
    Working,
}

impl PeerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerState::Waiting => "waiting",
            PeerState::Working => "working",
        }
    }
}

pub fn slot_path(git_dir: &Path) -> PathBuf {
    git_dir.join(PEERS_DIR).join(process::id().to_string())
}

/// Opens (creating as needed) this daemon's slot file. The caller takes
/// the exclusive lock and holds the guard for the process lifetime.
pub fn open_slot(path: &Path) -> Result<fd_lock::RwLock<File>> {
    let dir = path.parent().context("slot path has no parent")?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Creating peers directory {}", dir.display()))?;
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Opening peer slot {}", path.display()))?;
    Ok(fd_lock::RwLock::new(file))
}

/// Rewrites the slot content with the current state.
pub fn publish(slot: &mut File, state: PeerState) -> Result<()> {
    slot.set_len(0)?;
    slot.seek(SeekFrom::Start(0))?;
    slot.write_all(state.as_str().as_bytes())?;
    slot.flush()?;
    Ok(())
}

/// True when another live daemon on the same repository is in `state`.
/// Slots whose lock is free are leftovers of dead daemons and are removed
/// on the way.
pub fn another_in_state(git_dir: &Path, own_slot: &Path, state: PeerState) -> bool {
    let dir = git_dir.join(PEERS_DIR);
    let Ok(entries) = fs::read_dir(&dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path == own_slot {
            continue;
        }
        if slot_is_stale(&path) {
            debug!("reaping stale peer slot {}", path.display());
            if let Err(err) = fs::remove_file(&path) {
                warn!("could not remove stale slot {}: {err}", path.display());
            }
            continue;
        }
        let content = fs::read_to_string(&path).unwrap_or_default();
        if content.trim() == state.as_str() {
            return true;
        }
    }
    false
}

/// A slot is stale when its exclusive lock can be taken, meaning the
/// daemon that wrote it is gone.
fn slot_is_stale(path: &Path) -> bool {
    let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
        return false;
    };
    let mut probe = fd_lock::RwLock::new(file);
    let result = probe.try_write();
    result.is_ok()
}
