//! Discovery of the Discord IPC socket.
//!
//! Discord binds `discord-ipc-<n>` (n in 0..=9) inside what it considers
//! the user temp directory. Under app sandboxing our `$TMPDIR` and
//! Discord's frequently disagree, so the most reliable directory is the
//! one read out of the environment of the running Discord process itself;
//! the per-user runtime dir and our own temp dir cover the rest. Every
//! candidate is canonicalized because sandbox rules grant access by
//! canonical path, and a symlinked temp path would otherwise never match.

use std::env;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use sysinfo::{ProcessRefreshKind, System, UpdateKind};
use tracing::debug;

use crate::config::PresenceConfig;

/// File-name prefix of the remote endpoint sockets.
pub const SOCKET_PREFIX: &str = "discord-ipc-";

/// Socket slots probed per candidate directory. Discord binds the first
/// free slot, so a stale file in a low slot must not stop the probe.
pub const SOCKET_SLOTS: RangeInclusive<u8> = 0..=9;

const TEMP_DIR_VAR: &str = "TMPDIR";

/// Candidate socket directories in priority order, canonicalized and
/// deduplicated. Recomputed on every connect cycle so a Discord restart
/// with a fresh temp dir is picked up without restarting us. An empty
/// result means the remote is currently unavailable, not an error.
pub fn candidate_directories(config: &PresenceConfig) -> Vec<PathBuf> {
    if let Some(dir) = &config.socket_dir_override {
        return canonical_dedup(vec![dir.clone()]);
    }

    let mut raw = Vec::new();
    if let Some(dir) = remote_temp_dir() {
        raw.push(dir);
    }
    if let Some(dir) = dirs::runtime_dir() {
        raw.push(dir);
    }
    raw.push(env::temp_dir());
    canonical_dedup(raw)
}

/// Path of one socket slot inside a candidate directory.
pub fn socket_path(directory: &Path, slot: u8) -> PathBuf {
    directory.join(format!("{}{}", SOCKET_PREFIX, slot))
}

/// Reads `TMPDIR` out of the environment of a running Discord process.
/// Only same-user processes are considered; the platform exposes their
/// environment to us without extra privileges.
fn remote_temp_dir() -> Option<PathBuf> {
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessRefreshKind::new()
            .with_environ(UpdateKind::Always)
            .with_user(UpdateKind::Always),
    );

    let uid = unsafe { libc::getuid() };
    for process in sys.processes().values() {
        if !is_remote_process_name(process.name()) {
            continue;
        }
        if process.user_id().map(|id| **id) != Some(uid) {
            continue;
        }
        if let Some(dir) = temp_dir_from_environ(process.environ()) {
            debug!(
                pid = %process.pid(),
                dir = %dir.display(),
                "Resolved socket dir from remote process environment"
            );
            return Some(dir);
        }
    }
    None
}

/// Matches every Discord flavor: "Discord", "Discord PTB", "Discord
/// Canary", "Discord Development".
fn is_remote_process_name(name: &str) -> bool {
    name.to_ascii_lowercase().starts_with("discord")
}

/// Finds a non-empty `TMPDIR=` entry among `KEY=value` strings.
/// Malformed entries are skipped rather than trusted.
fn temp_dir_from_environ(entries: &[String]) -> Option<PathBuf> {
    entries.iter().find_map(|entry| {
        let (key, value) = entry.split_once('=')?;
        if key != TEMP_DIR_VAR || value.is_empty() {
            return None;
        }
        Some(PathBuf::from(value))
    })
}

/// Canonicalizes candidates and drops duplicates, preserving priority
/// order. Directories that fail to resolve are skipped; they cannot hold
/// a reachable socket.
fn canonical_dedup(raw: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut resolved: Vec<PathBuf> = Vec::new();
    for dir in raw {
        match fs_err::canonicalize(&dir) {
            Ok(canonical) => {
                if !resolved.contains(&canonical) {
                    resolved.push(canonical);
                }
            }
            Err(err) => {
                debug!(
                    dir = %dir.display(),
                    error = %err,
                    "Skipping unresolvable candidate directory"
                );
            }
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn socket_path_joins_prefix_and_slot() {
        let path = socket_path(Path::new("/tmp/sandbox"), 3);
        assert_eq!(path, PathBuf::from("/tmp/sandbox/discord-ipc-3"));
    }

    #[test]
    fn remote_process_names_match_all_flavors() {
        assert!(is_remote_process_name("Discord"));
        assert!(is_remote_process_name("Discord PTB"));
        assert!(is_remote_process_name("Discord Canary"));
        assert!(is_remote_process_name("Discord Development"));
        assert!(is_remote_process_name("discord"));
        assert!(!is_remote_process_name("NotDiscord"));
        assert!(!is_remote_process_name("slack"));
    }

    #[test]
    fn temp_dir_from_environ_picks_tmpdir() {
        let environ = vec![
            "HOME=/Users/someone".to_string(),
            "TMPDIR=/var/folders/ab/T/".to_string(),
            "PATH=/usr/bin".to_string(),
        ];
        assert_eq!(
            temp_dir_from_environ(&environ),
            Some(PathBuf::from("/var/folders/ab/T/"))
        );
    }

    #[test]
    fn temp_dir_from_environ_skips_malformed_and_empty() {
        let environ = vec![
            "JUNKENTRY".to_string(),
            "TMPDIR=".to_string(),
            "XTMPDIR=/nope".to_string(),
        ];
        assert_eq!(temp_dir_from_environ(&environ), None);
    }

    #[test]
    fn canonical_dedup_collapses_symlinked_duplicates() {
        let root = TempDir::new().unwrap();
        let target = root.path().join("real");
        std::fs::create_dir(&target).unwrap();
        let link = root.path().join("alias");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let dirs = canonical_dedup(vec![link, target.clone()]);
        assert_eq!(dirs, vec![fs_err::canonicalize(&target).unwrap()]);
    }

    #[test]
    fn canonical_dedup_drops_missing_directories() {
        let root = TempDir::new().unwrap();
        let missing = root.path().join("not-here");
        let dirs = canonical_dedup(vec![missing, root.path().to_path_buf()]);
        assert_eq!(dirs, vec![fs_err::canonicalize(root.path()).unwrap()]);
    }

    #[test]
    fn override_bypasses_discovery() {
        let root = TempDir::new().unwrap();
        let mut config = PresenceConfig::with_client_id("42");
        config.socket_dir_override = Some(root.path().to_path_buf());

        let dirs = candidate_directories(&config);
        assert_eq!(dirs, vec![fs_err::canonicalize(root.path()).unwrap()]);
    }

    #[test]
    fn discovery_always_includes_own_temp_dir() {
        let config = PresenceConfig::with_client_id("42");
        let dirs = candidate_directories(&config);
        let own = fs_err::canonicalize(env::temp_dir()).unwrap();
        assert!(dirs.contains(&own));
    }
}
