//! First-run bulk indexing.
//!
//! Discovers every transcript above the size floor, runs each through the
//! pipeline under a per-session deadline, and rewrites `setup_state.json`
//! after every session so any interruption resumes where it stopped.
//! Timeouts are recorded separately from failures and can be retried.

use crate::error::{IndexerError, Result};
use crate::pipeline::{IndexOutcome, SessionIndexer};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;

const MIN_FILE_BYTES: u64 = 100;
const PROGRESS_EVERY: usize = 1;
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SetupOptions {
    pub resume: bool,
    pub retry_timeouts: bool,
    pub workers: usize,
    pub timeout_per_session: Duration,
    pub batch_size: usize,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            resume: false,
            retry_timeouts: false,
            workers: 1,
            timeout_per_session: Duration::from_secs(30),
            batch_size: 5,
        }
    }
}

/// Resumable checkpoint, rewritten after every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupState {
    pub total_files: usize,
    #[serde(default)]
    pub processed_paths: Vec<String>,
    #[serde(default)]
    pub timed_out_paths: Vec<String>,
    #[serde(default)]
    pub failed_paths: Vec<String>,
    pub started_at: f64,
    pub last_updated: f64,
}

impl SetupState {
    fn new(total_files: usize) -> Self {
        let now = unix_now();
        Self {
            total_files,
            processed_paths: Vec::new(),
            timed_out_paths: Vec::new(),
            failed_paths: Vec::new(),
            started_at: now,
            last_updated: now,
        }
    }

    fn skip_set(&self) -> HashSet<String> {
        self.processed_paths
            .iter()
            .chain(&self.timed_out_paths)
            .chain(&self.failed_paths)
            .cloned()
            .collect()
    }
}

/// Advisory progress stream. The channel is bounded; slow subscribers lose
/// the oldest events.
#[derive(Debug, Clone)]
pub enum SetupEvent {
    Started {
        total: usize,
        remaining: usize,
    },
    Progress {
        processed: usize,
        total: usize,
        elapsed: Duration,
        eta: Option<Duration>,
        current_file: String,
    },
    Warning(String),
    Error(String),
    Done {
        stats: SetupStats,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SetupStats {
    pub files_processed: usize,
    pub chunks_indexed: usize,
    pub empty_files: usize,
    pub timeouts: usize,
    pub failures: usize,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone)]
pub enum SetupOutcome {
    Completed(SetupStats),
    Interrupted(SetupStats),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Everything processed; nothing left.
    AllDone,
    /// The batch finished but more files remain.
    MoreRemaining,
}

pub struct SetupOrchestrator {
    indexer: Arc<SessionIndexer>,
    producer_dir: PathBuf,
    state_path: PathBuf,
    events: broadcast::Sender<SetupEvent>,
    cancelled: Arc<AtomicBool>,
}

impl SetupOrchestrator {
    pub fn new(indexer: Arc<SessionIndexer>, producer_dir: &Path, storage_dir: &Path) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            indexer,
            producer_dir: producer_dir.to_path_buf(),
            state_path: storage_dir.join("setup_state.json"),
            events,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SetupEvent> {
        self.events.subscribe()
    }

    /// Request a graceful stop: the in-flight session finishes (within its
    /// deadline), state is saved, and `run` returns `Interrupted`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Run the full bulk setup.
    pub async fn run(&self, options: &SetupOptions) -> Result<SetupOutcome> {
        let all_files = discover_transcripts(&self.producer_dir)?;
        let mut state = self.load_or_create_state(options, all_files.len())?;

        let skip = state.skip_set();
        let pending: Vec<PathBuf> = all_files
            .iter()
            .filter(|path| !skip.contains(&path.to_string_lossy().into_owned()))
            .cloned()
            .collect();

        let _ = self.events.send(SetupEvent::Started {
            total: all_files.len(),
            remaining: pending.len(),
        });
        log::info!(
            "Bulk setup: {} of {} transcripts pending ({} workers)",
            pending.len(),
            all_files.len(),
            options.workers.max(1)
        );

        let started = Instant::now();
        let stats = if options.workers > 1 {
            self.process_parallel(&pending, &mut state, options, started)
                .await?
        } else {
            self.process_sequential(&pending, &mut state, options, started)
                .await?
        };

        if self.is_cancelled() {
            self.save_state(&state)?;
            let _ = self.events.send(SetupEvent::Warning(
                "setup interrupted; re-run with resume to continue".to_string(),
            ));
            return Ok(SetupOutcome::Interrupted(stats));
        }

        if let Err(err) = self.indexer.gateway().flush_cache() {
            log::warn!("Failed to flush embedding cache after setup: {err}");
        }
        // Keep the state file: it documents timeouts for retry_timeouts and
        // lets an immediate re-run prove idempotence.
        self.save_state(&state)?;
        let _ = self.events.send(SetupEvent::Done {
            stats: stats.clone(),
        });
        Ok(SetupOutcome::Completed(stats))
    }

    /// Process at most `batch_size` pending files and return whether more
    /// remain. Used by the batch-mode child process so the parent can
    /// restart a fresh process between batches.
    pub async fn run_single_batch(&self, options: &SetupOptions) -> Result<BatchOutcome> {
        let all_files = discover_transcripts(&self.producer_dir)?;
        let mut state = self.load_or_create_state(options, all_files.len())?;
        let skip = state.skip_set();
        let pending: Vec<PathBuf> = all_files
            .iter()
            .filter(|path| !skip.contains(&path.to_string_lossy().into_owned()))
            .take(options.batch_size.max(1))
            .cloned()
            .collect();

        if pending.is_empty() {
            return Ok(BatchOutcome::AllDone);
        }

        let started = Instant::now();
        self.process_sequential(&pending, &mut state, options, started)
            .await?;
        if let Err(err) = self.indexer.gateway().flush_cache() {
            log::warn!("Failed to flush embedding cache after batch: {err}");
        }

        let remaining = all_files.len() - state.skip_set().len();
        if remaining == 0 {
            Ok(BatchOutcome::AllDone)
        } else {
            Ok(BatchOutcome::MoreRemaining)
        }
    }

    async fn process_sequential(
        &self,
        pending: &[PathBuf],
        state: &mut SetupState,
        options: &SetupOptions,
        started: Instant,
    ) -> Result<SetupStats> {
        let mut stats = SetupStats::default();
        let total = state.total_files;

        for (i, path) in pending.iter().enumerate() {
            if self.is_cancelled() {
                break;
            }

            if i % PROGRESS_EVERY == 0 {
                self.emit_progress(state, total, started, path);
            }

            let result = self
                .indexer
                .index_file_with_deadline(path, options.timeout_per_session)
                .await;
            self.record_result(path, result, state, &mut stats);
            state.last_updated = unix_now();
            self.save_state(state)?;
        }

        stats.elapsed_secs = started.elapsed().as_secs_f64();
        Ok(stats)
    }

    async fn process_parallel(
        &self,
        pending: &[PathBuf],
        state: &mut SetupState,
        options: &SetupOptions,
        started: Instant,
    ) -> Result<SetupStats> {
        let semaphore = Arc::new(Semaphore::new(options.workers.max(1)));
        let shared_state = Arc::new(Mutex::new(std::mem::replace(
            state,
            SetupState::new(0),
        )));
        let mut stats = SetupStats::default();
        let mut join_set: JoinSet<(PathBuf, Result<IndexOutcome>)> = JoinSet::new();

        let mut queue = pending.iter().cloned();
        loop {
            // Keep the pool full while respecting cancellation.
            while join_set.len() < options.workers.max(1) {
                if self.is_cancelled() {
                    break;
                }
                let Some(path) = queue.next() else {
                    break;
                };
                let permit = semaphore.clone().acquire_owned().await.map_err(|_| {
                    IndexerError::Other("setup semaphore closed".to_string())
                })?;
                let indexer = self.indexer.clone();
                let deadline = options.timeout_per_session;
                join_set.spawn(async move {
                    let _permit = permit;
                    let result = indexer.index_file_with_deadline(&path, deadline).await;
                    (path, result)
                });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (path, result) = joined
                .map_err(|e| IndexerError::Other(format!("setup worker panicked: {e}")))?;

            {
                let mut guard = shared_state.lock().unwrap_or_else(|e| e.into_inner());
                self.record_result(&path, result, &mut guard, &mut stats);
                guard.last_updated = unix_now();
                self.save_state(&guard)?;
                self.emit_progress(&guard, guard.total_files, started, &path);
            }
        }

        *state = Arc::try_unwrap(shared_state)
            .map_err(|_| IndexerError::Other("setup state still shared".to_string()))?
            .into_inner()
            .unwrap_or_else(|e| e.into_inner());
        stats.elapsed_secs = started.elapsed().as_secs_f64();
        Ok(stats)
    }

    fn record_result(
        &self,
        path: &Path,
        result: Result<IndexOutcome>,
        state: &mut SetupState,
        stats: &mut SetupStats,
    ) {
        let path_str = path.to_string_lossy().into_owned();
        match result {
            Ok(IndexOutcome::Indexed { chunks, .. }) => {
                stats.files_processed += 1;
                stats.chunks_indexed += chunks;
                state.processed_paths.push(path_str);
            }
            Ok(IndexOutcome::Empty) => {
                stats.files_processed += 1;
                stats.empty_files += 1;
                state.processed_paths.push(path_str);
                let _ = self.events.send(SetupEvent::Warning(format!(
                    "{} contained no usable messages",
                    path.display()
                )));
            }
            Err(err) if err.is_timeout() => {
                stats.timeouts += 1;
                log::warn!("{err}");
                state.timed_out_paths.push(path_str);
                let _ = self.events.send(SetupEvent::Warning(err.to_string()));
            }
            Err(err) => {
                stats.failures += 1;
                log::error!("Failed to index {}: {err}", path.display());
                state.failed_paths.push(path_str);
                let _ = self.events.send(SetupEvent::Error(err.to_string()));
            }
        }
    }

    fn emit_progress(&self, state: &SetupState, total: usize, started: Instant, current: &Path) {
        let processed = state.skip_set().len();
        let elapsed = started.elapsed();
        let eta = if processed > 0 && total > processed {
            let per_file = elapsed.as_secs_f64() / processed as f64;
            Some(Duration::from_secs_f64(
                per_file * (total - processed) as f64,
            ))
        } else {
            None
        };
        let _ = self.events.send(SetupEvent::Progress {
            processed,
            total,
            elapsed,
            eta,
            current_file: current
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        });
    }

    fn load_or_create_state(
        &self,
        options: &SetupOptions,
        total_files: usize,
    ) -> Result<SetupState> {
        let mut state = if options.resume && self.state_path.exists() {
            let raw = std::fs::read_to_string(&self.state_path)?;
            match serde_json::from_str::<SetupState>(&raw) {
                Ok(mut state) => {
                    state.total_files = total_files;
                    log::info!(
                        "Resuming setup: {} processed, {} timed out, {} failed",
                        state.processed_paths.len(),
                        state.timed_out_paths.len(),
                        state.failed_paths.len()
                    );
                    state
                }
                Err(err) => {
                    log::warn!("Corrupt setup state, starting over: {err}");
                    SetupState::new(total_files)
                }
            }
        } else {
            SetupState::new(total_files)
        };

        if options.retry_timeouts && !state.timed_out_paths.is_empty() {
            log::info!(
                "Re-queueing {} timed-out sessions",
                state.timed_out_paths.len()
            );
            let retried: HashSet<String> = state.timed_out_paths.drain(..).collect();
            state.processed_paths.retain(|p| !retried.contains(p));
        }
        Ok(state)
    }

    fn save_state(&self, state: &SetupState) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(state)?;
        let tmp = self.state_path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        if let Err(err) = std::fs::rename(&tmp, &self.state_path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }
}

/// Candidate transcripts: every `.jsonl` above the size floor, sorted.
fn discover_transcripts(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !root.exists() {
        log::warn!("Producer directory not found: {}", root.display());
        return Ok(files);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("Cannot read {}: {err}", dir.display());
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(path);
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("jsonl"))
            {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                if size > MIN_FILE_BYTES {
                    files.push(path);
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn discovery_applies_size_floor_and_extension() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("projects/demo");
        std::fs::create_dir_all(&nested).unwrap();

        let big_line = format!(
            "{}\n",
            r#"{"role":"user","content":"a long enough line of transcript content to pass the size floor easily"}"#
        );
        std::fs::write(nested.join("real.jsonl"), big_line.repeat(3)).unwrap();
        std::fs::write(nested.join("tiny.jsonl"), "{}").unwrap();
        std::fs::write(nested.join("notes.txt"), big_line.repeat(3)).unwrap();

        let found = discover_transcripts(tmp.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("real.jsonl"));
    }

    #[test]
    fn missing_root_is_empty_not_error() {
        let found = discover_transcripts(Path::new("/definitely/not/here")).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn state_skip_set_covers_all_outcomes() {
        let mut state = SetupState::new(3);
        state.processed_paths.push("a".to_string());
        state.timed_out_paths.push("b".to_string());
        state.failed_paths.push("c".to_string());
        let skip = state.skip_set();
        assert_eq!(skip.len(), 3);
    }
}
