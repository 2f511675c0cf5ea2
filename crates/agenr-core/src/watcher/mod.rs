//! Watcher
//!
//! Crash-safe incremental reader over append-only transcript files. Each
//! cycle opens the tracked file at its last byte offset, reads whatever
//! new bytes exist, hands them to the ingest sink, and advances the offset
//! by the bytes actually read - partial reads during file growth never
//! cause duplicate ingestion, because the offset only moves after the sink
//! accepts the bytes.
//!
//! Directory mode watches a sessions directory and follows the "active"
//! file (most recent by default; platform adapters can override the rule).
//! A PID lock enforces one watcher per database; heartbeats make stalls
//! observable; WAL checkpoints run on an interval and once at shutdown.

pub mod state;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use crate::config::DataRoot;
use crate::storage::Storage;

pub use state::{
    is_watcher_running, most_recent_jsonl, FileProgress, Heartbeat, PidFile, WatchState,
    HEARTBEAT_STALL_SECS,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Watcher errors
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    /// Another watcher holds the PID lock
    #[error("a watcher is already running for this database (pid {pid})")]
    AlreadyRunning {
        /// The other watcher's pid
        pid: u32,
    },
    /// IO error on state files or transcripts
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Storage error during checkpointing
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}

/// Watcher result type
pub type Result<T> = std::result::Result<T, WatcherError>;

// ============================================================================
// SINK
// ============================================================================

/// Where newly appended transcript bytes go (the extraction scheduler in
/// production, a collector in tests). Returns entries stored.
#[async_trait]
pub trait IngestSink: Send + Sync {
    /// Handle `data` newly appended to `source`
    async fn ingest(&self, source: &Path, data: &[u8]) -> std::result::Result<u64, String>;
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// What to watch
#[derive(Debug, Clone)]
pub enum WatchTarget {
    /// A single transcript file
    File(PathBuf),
    /// A sessions directory; the active file is re-picked each cycle
    Directory(PathBuf),
}

/// Active-file rule for directory mode
pub type ActiveFilePicker = Arc<dyn Fn(&Path) -> Option<PathBuf> + Send + Sync>;

/// Watcher knobs
#[derive(Clone)]
pub struct WatcherConfig {
    /// Poll cadence
    pub poll_interval_ms: u64,
    /// WAL checkpoint cadence
    pub wal_checkpoint_interval_ms: u64,
    /// Active-file rule (directory mode); most-recent `.jsonl` by default
    pub active_file_picker: ActiveFilePicker,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            wal_checkpoint_interval_ms: 30_000,
            active_file_picker: Arc::new(|dir| most_recent_jsonl(dir)),
        }
    }
}

impl std::fmt::Debug for WatcherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherConfig")
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("wal_checkpoint_interval_ms", &self.wal_checkpoint_interval_ms)
            .finish()
    }
}

// ============================================================================
// SHUTDOWN HANDLE
// ============================================================================

/// Shared wake handle: signals and programmatic stops both land here so
/// long polls interrupt immediately
#[derive(Clone, Default)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
    requested: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Fresh handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every poll
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether shutdown was requested
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        if self.is_requested() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Wire SIGINT/SIGTERM to a shutdown handle, with a force-exit guard that
/// ends the process if graceful shutdown stalls past `force_exit_secs`
#[cfg(unix)]
pub fn install_signal_handlers(handle: ShutdownHandle, force_exit_secs: u64) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("sigint handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("shutdown signal received");
        handle.request();

        tokio::time::sleep(StdDuration::from_secs(force_exit_secs)).await;
        tracing::error!("graceful shutdown stalled; forcing exit");
        std::process::exit(1);
    });
}

// ============================================================================
// WATCHER
// ============================================================================

/// The transcript watcher
pub struct Watcher {
    root: DataRoot,
    storage: Arc<Storage>,
    sink: Arc<dyn IngestSink>,
    target: WatchTarget,
    config: WatcherConfig,
    shutdown: ShutdownHandle,

    state: WatchState,
    started_at: chrono::DateTime<Utc>,
    current_file: Option<PathBuf>,
    sessions_watched: u64,
    entries_stored: u64,
}

impl Watcher {
    /// Build a watcher; `run` acquires the PID lock
    pub fn new(
        root: DataRoot,
        storage: Arc<Storage>,
        sink: Arc<dyn IngestSink>,
        target: WatchTarget,
        config: WatcherConfig,
        shutdown: ShutdownHandle,
    ) -> Self {
        let state = WatchState::load(&root.watch_state_path());
        Self {
            root,
            storage,
            sink,
            target,
            config,
            shutdown,
            state,
            started_at: Utc::now(),
            current_file: None,
            sessions_watched: 0,
            entries_stored: 0,
        }
    }

    /// The shutdown handle driving this watcher
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run until shutdown; refuses to start when another watcher is live
    pub async fn run(&mut self) -> Result<()> {
        let pid_path = self.root.watcher_pid_path();
        let health_path = self.root.watcher_health_path();

        if is_watcher_running(&pid_path, &health_path) {
            let pid = PidFile::read(&pid_path).map(|p| p.pid).unwrap_or(0);
            return Err(WatcherError::AlreadyRunning { pid });
        }

        self.root.ensure()?;
        PidFile::write_current(&pid_path)?;
        self.started_at = Utc::now();
        self.write_heartbeat()?;
        tracing::info!("watcher started (pid {})", std::process::id());

        let mut last_checkpoint = tokio::time::Instant::now();
        let checkpoint_interval = StdDuration::from_millis(self.config.wal_checkpoint_interval_ms);
        let poll_interval = StdDuration::from_millis(self.config.poll_interval_ms);

        while !self.shutdown.is_requested() {
            self.cycle().await;

            if last_checkpoint.elapsed() >= checkpoint_interval {
                if let Err(e) = self.storage.wal_checkpoint() {
                    tracing::warn!("wal checkpoint failed: {e}");
                }
                last_checkpoint = tokio::time::Instant::now();
            }

            if let Err(e) = self.write_heartbeat() {
                tracing::warn!("heartbeat write failed: {e}");
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = self.shutdown.wait() => {}
            }
        }

        // One checkpoint at shutdown regardless of the interval
        if let Err(e) = self.storage.wal_checkpoint() {
            tracing::warn!("shutdown wal checkpoint failed: {e}");
        }
        PidFile::remove(&pid_path);
        tracing::info!("watcher stopped");
        Ok(())
    }

    /// One poll cycle; per-file errors are logged and swallowed
    async fn cycle(&mut self) {
        let Some(file) = self.resolve_active_file() else {
            return;
        };

        if self.current_file.as_deref() != Some(file.as_path()) {
            if self.current_file.is_some() {
                self.sessions_watched += 1;
                tracing::info!("session switch: now watching {}", file.display());
            }
            self.current_file = Some(file.clone());
        }

        match self.read_new_bytes(&file) {
            Ok(Some(data)) if !data.is_empty() => {
                let read_len = data.len() as u64;
                match self.sink.ingest(&file, &data).await {
                    Ok(stored) => {
                        let progress = self.state.progress_mut(&file);
                        progress.byte_offset += read_len;
                        progress.last_run_at = Some(Utc::now());
                        progress.entries_stored += stored;
                        self.entries_stored += stored;
                        if let Err(e) = self.state.save(&self.root.watch_state_path()) {
                            tracing::warn!("watch state save failed: {e}");
                        }
                    }
                    Err(e) => {
                        tracing::warn!("ingest failed for {} (will retry): {e}", file.display());
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("read failed for {}: {e}", file.display());
            }
        }
    }

    fn resolve_active_file(&self) -> Option<PathBuf> {
        match &self.target {
            WatchTarget::File(path) => path.exists().then(|| path.clone()),
            WatchTarget::Directory(dir) => (self.config.active_file_picker)(dir),
        }
    }

    /// Read from the stored offset to EOF; a truncated file (rotation)
    /// resets the offset to zero first
    fn read_new_bytes(&mut self, file: &Path) -> std::io::Result<Option<Vec<u8>>> {
        use std::io::{Read, Seek, SeekFrom};

        let offset = self
            .state
            .progress(file)
            .map(|p| p.byte_offset)
            .unwrap_or(0);

        let mut handle = std::fs::File::open(file)?;
        let len = handle.metadata()?.len();

        let offset = if offset > len {
            tracing::warn!(
                "{} shrank below its offset ({offset} > {len}); re-reading from the start",
                file.display()
            );
            self.state.progress_mut(file).byte_offset = 0;
            0
        } else {
            offset
        };

        if offset == len {
            return Ok(None);
        }

        handle.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::with_capacity((len - offset) as usize);
        handle.read_to_end(&mut data)?;
        Ok(Some(data))
    }

    fn write_heartbeat(&self) -> std::io::Result<()> {
        Heartbeat {
            pid: std::process::id(),
            started_at: self.started_at,
            last_heartbeat: Utc::now(),
            sessions_watched: self.sessions_watched,
            entries_stored: self.entries_stored,
        }
        .write(&self.root.watcher_health_path())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    /// Sink recording every handed chunk
    #[derive(Default)]
    struct CollectingSink {
        chunks: Mutex<Vec<(PathBuf, Vec<u8>)>>,
        fail_next: AtomicBool,
    }

    #[async_trait]
    impl IngestSink for CollectingSink {
        async fn ingest(&self, source: &Path, data: &[u8]) -> std::result::Result<u64, String> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err("sink offline".to_string());
            }
            self.chunks
                .lock()
                .unwrap()
                .push((source.to_path_buf(), data.to_vec()));
            Ok(1)
        }
    }

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            poll_interval_ms: 10,
            wal_checkpoint_interval_ms: 60_000,
            ..Default::default()
        }
    }

    async fn run_watcher_until<F>(
        root: &DataRoot,
        storage: Arc<Storage>,
        sink: Arc<CollectingSink>,
        target: WatchTarget,
        condition: F,
    ) -> Watcher
    where
        F: Fn(&CollectingSink) -> bool,
    {
        let shutdown = ShutdownHandle::new();
        let mut watcher = Watcher::new(
            root.clone(),
            storage,
            sink.clone(),
            target,
            fast_config(),
            shutdown.clone(),
        );

        let handle = tokio::spawn(async move {
            watcher.run().await.unwrap();
            watcher
        });

        for _ in 0..300 {
            if condition(&sink) {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }

        shutdown.request();
        handle.await.unwrap()
    }

    #[tokio::test]
    async fn test_byte_offset_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::at(dir.path());
        root.ensure().unwrap();
        let transcript = dir.path().join("session.jsonl");
        std::fs::write(&transcript, b"line one\n").unwrap();

        let storage = Arc::new(Storage::open_in_memory(4).unwrap());
        let sink = Arc::new(CollectingSink::default());

        let watcher = run_watcher_until(
            &root,
            storage,
            sink.clone(),
            WatchTarget::File(transcript.clone()),
            |s| !s.chunks.lock().unwrap().is_empty(),
        )
        .await;

        let chunks = sink.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].1, b"line one\n");

        // Offset advanced by exactly the bytes read, and persisted
        let state = WatchState::load(&root.watch_state_path());
        assert_eq!(state.progress(&transcript).unwrap().byte_offset, 9);
        assert_eq!(watcher.entries_stored, 1);

        // PID lock released on shutdown
        assert!(!root.watcher_pid_path().exists());
        // Heartbeat stays for post-mortem inspection
        assert!(Heartbeat::read(&root.watcher_health_path()).is_some());
    }

    #[tokio::test]
    async fn test_incremental_append_no_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::at(dir.path());
        root.ensure().unwrap();
        let transcript = dir.path().join("session.jsonl");
        std::fs::write(&transcript, b"first\n").unwrap();

        let storage = Arc::new(Storage::open_in_memory(4).unwrap());
        let sink = Arc::new(CollectingSink::default());
        let shutdown = ShutdownHandle::new();
        let mut watcher = Watcher::new(
            root.clone(),
            storage,
            sink.clone(),
            WatchTarget::File(transcript.clone()),
            fast_config(),
            shutdown.clone(),
        );
        let handle = tokio::spawn(async move {
            watcher.run().await.unwrap();
        });

        // Wait for the first chunk, then append and wait for the second
        for _ in 0..300 {
            if !sink.chunks.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        {
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&transcript)
                .unwrap();
            f.write_all(b"second\n").unwrap();
        }
        for _ in 0..300 {
            if sink.chunks.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }

        shutdown.request();
        handle.await.unwrap();

        let chunks = sink.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].1, b"first\n");
        assert_eq!(chunks[1].1, b"second\n");

        let state = WatchState::load(&root.watch_state_path());
        assert_eq!(
            state.progress(&transcript).unwrap().byte_offset,
            (b"first\nsecond\n").len() as u64
        );
    }

    #[tokio::test]
    async fn test_sink_error_does_not_advance_offset() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::at(dir.path());
        root.ensure().unwrap();
        let transcript = dir.path().join("session.jsonl");
        std::fs::write(&transcript, b"payload\n").unwrap();

        let storage = Arc::new(Storage::open_in_memory(4).unwrap());
        let sink = Arc::new(CollectingSink::default());
        sink.fail_next.store(true, Ordering::SeqCst);

        run_watcher_until(
            &root,
            storage,
            sink.clone(),
            WatchTarget::File(transcript.clone()),
            |s| !s.chunks.lock().unwrap().is_empty(),
        )
        .await;

        // First attempt failed, second succeeded with the same bytes
        let chunks = sink.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].1, b"payload\n");
    }

    #[tokio::test]
    async fn test_directory_mode_session_switch() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::at(dir.path());
        root.ensure().unwrap();
        let sessions = dir.path().join("sessions");
        std::fs::create_dir_all(&sessions).unwrap();
        std::fs::write(sessions.join("a.jsonl"), b"from a\n").unwrap();

        let storage = Arc::new(Storage::open_in_memory(4).unwrap());
        let sink = Arc::new(CollectingSink::default());
        let shutdown = ShutdownHandle::new();
        let mut watcher = Watcher::new(
            root.clone(),
            storage,
            sink.clone(),
            WatchTarget::Directory(sessions.clone()),
            fast_config(),
            shutdown.clone(),
        );
        let handle = tokio::spawn(async move {
            watcher.run().await.unwrap();
            watcher
        });

        for _ in 0..300 {
            if !sink.chunks.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }

        // A newer session file appears
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        std::fs::write(sessions.join("b.jsonl"), b"from b\n").unwrap();
        for _ in 0..300 {
            if sink.chunks.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }

        shutdown.request();
        let watcher = handle.await.unwrap();

        let chunks = sink.chunks.lock().unwrap();
        assert!(chunks.iter().any(|(p, _)| p.ends_with("a.jsonl")));
        assert!(chunks.iter().any(|(p, _)| p.ends_with("b.jsonl")));
        assert_eq!(watcher.sessions_watched, 1);
    }

    #[tokio::test]
    async fn test_second_watcher_refused() {
        let dir = tempfile::tempdir().unwrap();
        let root = DataRoot::at(dir.path());
        root.ensure().unwrap();
        PidFile::write_current(&root.watcher_pid_path()).unwrap();

        let storage = Arc::new(Storage::open_in_memory(4).unwrap());
        let sink = Arc::new(CollectingSink::default());
        let mut watcher = Watcher::new(
            root.clone(),
            storage,
            sink,
            WatchTarget::File(dir.path().join("missing.jsonl")),
            fast_config(),
            ShutdownHandle::new(),
        );

        match watcher.run().await {
            Err(WatcherError::AlreadyRunning { pid }) => {
                assert_eq!(pid, std::process::id());
            }
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }
}
