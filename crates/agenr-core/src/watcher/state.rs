//! Watcher State Files
//!
//! Three small JSON files keep the watcher crash-safe and observable:
//! - `watch-state.json`: per-file byte offsets and totals
//! - `watcher.pid`: single-writer lock (stale-PID aware)
//! - `watcher.health.json`: heartbeat for stall detection
//!
//! All writes go through temp-file + rename so a crash can never leave a
//! partially written state file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current watch-state format version
pub const WATCH_STATE_VERSION: u32 = 1;

/// A heartbeat older than this marks the watcher stalled
pub const HEARTBEAT_STALL_SECS: i64 = 300;

/// Atomic JSON write: temp file + rename
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ============================================================================
// WATCH STATE
// ============================================================================

/// Per-file progress
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileProgress {
    /// Bytes of the file already ingested
    pub byte_offset: u64,
    /// Last cycle that touched this file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Entries stored from this file so far
    #[serde(default)]
    pub entries_stored: u64,
}

/// `watch-state.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchState {
    /// Format version
    pub version: u32,
    /// Progress per tracked file path
    #[serde(default)]
    pub files: HashMap<String, FileProgress>,
}

impl Default for WatchState {
    fn default() -> Self {
        Self {
            version: WATCH_STATE_VERSION,
            files: HashMap::new(),
        }
    }
}

impl WatchState {
    /// Load state; a missing or unreadable file starts fresh
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("watch state at {} unreadable ({e}); starting fresh", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Persist atomically
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        write_atomic(path, self)
    }

    /// Progress record for a file, created on first touch
    pub fn progress_mut(&mut self, file: &Path) -> &mut FileProgress {
        self.files
            .entry(file.to_string_lossy().into_owned())
            .or_default()
    }

    /// Read-only progress for a file
    pub fn progress(&self, file: &Path) -> Option<&FileProgress> {
        self.files.get(file.to_string_lossy().as_ref())
    }
}

// ============================================================================
// PID LOCK
// ============================================================================

/// `watcher.pid`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidFile {
    /// Watcher process id
    pub pid: u32,
    /// When the watcher started
    pub started_at: DateTime<Utc>,
}

impl PidFile {
    /// Write the current process as the watcher
    pub fn write_current(path: &Path) -> std::io::Result<Self> {
        let pid_file = Self {
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        write_atomic(path, &pid_file)?;
        Ok(pid_file)
    }

    /// Read an existing PID file
    pub fn read(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Remove the lock
    pub fn remove(path: &Path) {
        let _ = std::fs::remove_file(path);
    }
}

/// Whether the recorded process still exists
#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> Option<bool> {
    Some(Path::new(&format!("/proc/{pid}")).exists())
}

/// Liveness is unknowable portably; callers fall back to heartbeat age
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> Option<bool> {
    None
}

/// Single-writer check: a live watcher holds the PID file. A dead PID or a
/// stalled heartbeat counts as not running.
pub fn is_watcher_running(pid_path: &Path, health_path: &Path) -> bool {
    let Some(pid_file) = PidFile::read(pid_path) else {
        return false;
    };

    if pid_file.pid == std::process::id() {
        return true;
    }

    match process_alive(pid_file.pid) {
        Some(alive) => alive,
        None => {
            // Heartbeat fallback: treat a fresh heartbeat as alive
            match Heartbeat::read(health_path) {
                Some(heartbeat) => !heartbeat.is_stalled(Utc::now()),
                None => false,
            }
        }
    }
}

// ============================================================================
// HEARTBEAT
// ============================================================================

/// `watcher.health.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Watcher process id
    pub pid: u32,
    /// When the watcher started
    pub started_at: DateTime<Utc>,
    /// Last cycle completion
    pub last_heartbeat: DateTime<Utc>,
    /// Session switches observed (directory mode)
    pub sessions_watched: u64,
    /// Entries stored across all files this run
    pub entries_stored: u64,
}

impl Heartbeat {
    /// Write atomically
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        write_atomic(path, self)
    }

    /// Read an existing heartbeat
    pub fn read(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Older than five minutes means stalled
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_heartbeat).num_seconds() > HEARTBEAT_STALL_SECS
    }
}

/// Most-recent `.jsonl` file in a sessions directory - the default
/// active-file rule when no platform adapter overrides it
pub fn most_recent_jsonl(dir: &Path) -> Option<PathBuf> {
    let mut best: Option<(std::time::SystemTime, PathBuf)> = None;
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if best.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
            best = Some((modified, path));
        }
    }
    best.map(|(_, path)| path)
}

// ============================================================================
// TESTS
// ============================================================================
