//! Background indexing: filesystem watch, per-path debounce, worker pool.
//!
//! Every event re-arms a per-path timer; when a timer expires the path is
//! offered to a bounded work queue (non-blocking, latest event wins per
//! path) consumed by a fixed pool of workers. Same-path work is serialized
//! by the pipeline's session locks; distinct paths run in parallel.

use crate::error::{IndexerError, Result};
use crate::pipeline::{session_id_for_path, IndexOutcome, SessionIndexer, SessionState};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use refork_transcript::count_lines;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    pub debounce: Duration,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(5),
            workers: 1,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexerHealth {
    pub pending_paths: usize,
    pub indexing: bool,
    pub files_indexed: usize,
    pub chunks_indexed: usize,
    pub empty_files: usize,
    pub last_error: Option<String>,
    pub failed_paths: Vec<(String, String)>,
    /// Last observed pipeline state per session, most recent 50.
    pub session_states: Vec<(String, SessionState)>,
}

enum Command {
    Trigger(PathBuf),
    Shutdown,
}

pub struct BackgroundIndexer {
    command_tx: mpsc::Sender<Command>,
    health_rx: watch::Receiver<IndexerHealth>,
    control_task: tokio::task::JoinHandle<()>,
    worker_tasks: Vec<tokio::task::JoinHandle<()>>,
    _watcher: Option<RecommendedWatcher>,
}

impl BackgroundIndexer {
    /// Watch `root` recursively and keep the index in sync.
    pub fn start(
        indexer: Arc<SessionIndexer>,
        root: &Path,
        config: WatcherConfig,
    ) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel::<PathBuf>(1024);
        let (command_tx, command_rx) = mpsc::channel::<Command>(16);
        let (work_tx, work_rx) = mpsc::channel::<PathBuf>(config.queue_capacity.max(1));
        let (health_tx, health_rx) = watch::channel(IndexerHealth::default());

        let watcher = match create_fs_watcher(root, event_tx) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                // Without a watcher the indexer still serves manual triggers.
                log::warn!("File watching unavailable for {}: {err}", root.display());
                None
            }
        };

        let control_task = tokio::spawn(control_loop(
            config.debounce,
            event_rx,
            command_rx,
            work_tx,
            health_tx.clone(),
        ));

        let work_rx = Arc::new(AsyncMutex::new(work_rx));
        let worker_tasks: Vec<_> = (0..config.workers.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    indexer.clone(),
                    work_rx.clone(),
                    health_tx.clone(),
                ))
            })
            .collect();

        log::info!(
            "Background indexer watching {} ({} workers, {:?} debounce)",
            root.display(),
            config.workers.max(1),
            config.debounce
        );
        Ok(Self {
            command_tx,
            health_rx,
            control_task,
            worker_tasks,
            _watcher: watcher,
        })
    }

    /// Queue a path for indexing without waiting for a filesystem event.
    pub async fn trigger(&self, path: &Path) -> Result<()> {
        self.command_tx
            .send(Command::Trigger(path.to_path_buf()))
            .await
            .map_err(|_| IndexerError::Other("indexer control channel closed".to_string()))
    }

    #[must_use]
    pub fn health(&self) -> IndexerHealth {
        self.health_rx.borrow().clone()
    }

    #[must_use]
    pub fn health_stream(&self) -> watch::Receiver<IndexerHealth> {
        self.health_rx.clone()
    }

    /// Flush the queue and join all tasks.
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(Command::Shutdown).await;
        let _ = self.control_task.await;
        for task in self.worker_tasks {
            let _ = task.await;
        }
        log::info!("Background indexer stopped");
    }
}

fn create_fs_watcher(root: &Path, event_tx: mpsc::Sender<PathBuf>) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<Event>| match result {
            Ok(event) => {
                for path in event.paths {
                    if is_transcript_path(&path) {
                        // Non-blocking offer; a full channel just drops the
                        // event, the next one re-arms the timer anyway.
                        let _ = event_tx.try_send(path);
                    }
                }
            }
            Err(err) => log::warn!("Watcher error: {err}"),
        },
        notify::Config::default(),
    )
    .map_err(|e| IndexerError::Other(format!("watcher init failed: {e}")))?;
    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| IndexerError::Other(format!("failed to watch {}: {e}", root.display())))?;
    Ok(watcher)
}

fn is_transcript_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"))
}

/// Debounce state: one timer per path, re-armed on every event.
struct DebounceMap {
    debounce: Duration,
    deadlines: HashMap<PathBuf, Instant>,
}

impl DebounceMap {
    fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            deadlines: HashMap::new(),
        }
    }

    fn record(&mut self, path: PathBuf, now: Instant) {
        self.deadlines.insert(path, now + self.debounce);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    fn take_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let due: Vec<PathBuf> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &due {
            self.deadlines.remove(path);
        }
        due
    }

    fn pending(&self) -> usize {
        self.deadlines.len()
    }
}

async fn control_loop(
    debounce: Duration,
    mut event_rx: mpsc::Receiver<PathBuf>,
    mut command_rx: mpsc::Receiver<Command>,
    work_tx: mpsc::Sender<PathBuf>,
    health_tx: watch::Sender<IndexerHealth>,
) {
    let mut map = DebounceMap::new(debounce);

    loop {
        let deadline = map.next_deadline();
        tokio::select! {
            maybe_path = event_rx.recv() => {
                match maybe_path {
                    Some(path) => {
                        map.record(path, Instant::now());
                        health_tx.send_modify(|h| h.pending_paths = map.pending());
                    }
                    None => break,
                }
            }
            maybe_cmd = command_rx.recv() => {
                match maybe_cmd {
                    Some(Command::Trigger(path)) => {
                        // Manual triggers skip the debounce window.
                        if work_tx.send(path).await.is_err() {
                            break;
                        }
                    }
                    Some(Command::Shutdown) | None => break,
                }
            }
            () = async {
                if let Some(deadline) = deadline {
                    tokio::time::sleep_until(deadline).await;
                }
            }, if deadline.is_some() => {
                for path in map.take_due(Instant::now()) {
                    // Non-blocking offer; a refused path re-arms with a
                    // fresh debounce window instead of blocking the loop.
                    if let Err(tokio::sync::mpsc::error::TrySendError::Full(path)) =
                        work_tx.try_send(path)
                    {
                        log::warn!("Index queue full, re-scheduling {}", path.display());
                        map.record(path, Instant::now());
                    }
                }
                health_tx.send_modify(|h| h.pending_paths = map.pending());
            }
        }
    }
    // Closing work_tx lets the workers drain and exit.
}

async fn worker_loop(
    worker_id: usize,
    indexer: Arc<SessionIndexer>,
    work_rx: Arc<AsyncMutex<mpsc::Receiver<PathBuf>>>,
    health_tx: watch::Sender<IndexerHealth>,
) {
    loop {
        let path = {
            let mut rx = work_rx.lock().await;
            rx.recv().await
        };
        let Some(path) = path else {
            break;
        };

        if !should_reindex(&indexer, &path) {
            log::debug!("{} unchanged, skipping", path.display());
            continue;
        }

        health_tx.send_modify(|h| h.indexing = true);
        let path_str = path.to_string_lossy().into_owned();
        let session_id = session_id_for_path(&path);
        let observe = {
            let health_tx = health_tx.clone();
            let session_id = session_id.clone();
            move |state: &SessionState| {
                let state = state.clone();
                health_tx.send_modify(|h| record_session_state(h, &session_id, state));
            }
        };
        match indexer.index_file_observed(&path, observe).await {
            Ok(IndexOutcome::Indexed { chunks, .. }) => {
                health_tx.send_modify(|h| {
                    h.indexing = false;
                    h.files_indexed += 1;
                    h.chunks_indexed += chunks;
                    h.last_error = None;
                    h.failed_paths.retain(|(p, _)| p != &path_str);
                });
            }
            Ok(IndexOutcome::Empty) => {
                health_tx.send_modify(|h| {
                    h.indexing = false;
                    h.empty_files += 1;
                });
            }
            Err(err) => {
                log::error!("Worker {worker_id} failed on {}: {err}", path.display());
                let reason = err.to_string();
                health_tx.send_modify(|h| {
                    h.indexing = false;
                    h.last_error = Some(reason.clone());
                    record_session_state(h, &session_id, SessionState::Failed(reason.clone()));
                    h.failed_paths.push((path_str.clone(), reason.clone()));
                    if h.failed_paths.len() > 50 {
                        h.failed_paths.remove(0);
                    }
                });
            }
        }
    }
}

fn record_session_state(health: &mut IndexerHealth, session_id: &str, state: SessionState) {
    if let Some(entry) = health
        .session_states
        .iter_mut()
        .find(|(id, _)| id == session_id)
    {
        entry.1 = state;
        return;
    }
    health.session_states.push((session_id.to_string(), state));
    if health.session_states.len() > 50 {
        health.session_states.remove(0);
    }
}

/// Cheap probe: skip a re-index when the line count matches what the
/// registry already recorded for the session.
fn should_reindex(indexer: &SessionIndexer, path: &Path) -> bool {
    let session_id = session_id_for_path(path);
    let Ok(Some(metadata)) = indexer.registry().get(&session_id) else {
        return true;
    };
    match count_lines(path) {
        Ok(lines) => lines != metadata.message_count,
        Err(_) => true,
    }
}
