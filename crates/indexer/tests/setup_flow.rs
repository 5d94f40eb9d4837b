//! Bulk setup: resume, timeout taxonomy, and interruption.

use refork_config::Config;
use refork_indexer::{
    BatchOutcome, SessionIndexer, SetupOptions, SetupOrchestrator, SetupOutcome, SetupState,
};
use refork_registry::SessionRegistry;
use refork_vector_store::{EmbeddingGateway, EmbeddingModel, GatewayLimits, VectorStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DIM: usize = 16;

struct Fixture {
    orchestrator: SetupOrchestrator,
    indexer: Arc<SessionIndexer>,
    storage: TempDir,
    producer: TempDir,
}

fn fixture() -> Fixture {
    std::env::set_var("REFORK_EMBEDDING_MODE", "stub");
    let storage = TempDir::new().unwrap();
    let producer = TempDir::new().unwrap();
    let config = Config::default();
    let store = Arc::new(VectorStore::open(storage.path(), DIM).unwrap());
    let registry = Arc::new(
        SessionRegistry::open(&storage.path().join("session-registry.json")).unwrap(),
    );
    let gateway = Arc::new(
        EmbeddingGateway::new(
            EmbeddingModel::new(DIM).unwrap(),
            &storage.path().join("embedding_cache"),
            GatewayLimits::default(),
        )
        .unwrap(),
    );
    let indexer = Arc::new(
        SessionIndexer::new(&config, storage.path(), gateway, store, registry).unwrap(),
    );
    let orchestrator = SetupOrchestrator::new(indexer.clone(), producer.path(), storage.path());
    Fixture {
        orchestrator,
        indexer,
        storage,
        producer,
    }
}

fn write_transcript(dir: &Path, name: &str, messages: usize) {
    let mut content = String::new();
    for i in 0..messages {
        content.push_str(&format!(
            r#"{{"role":"user","content":"message {i} in {name} talking about topic {i} in enough words to index"}}"#
        ));
        content.push('\n');
    }
    std::fs::write(dir.join(name), content).unwrap();
}

fn load_state(storage: &TempDir) -> SetupState {
    let raw = std::fs::read_to_string(storage.path().join("setup_state.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[tokio::test]
async fn full_run_indexes_every_transcript() {
    let fx = fixture();
    for i in 0..4 {
        write_transcript(fx.producer.path(), &format!("s{i}.jsonl"), 3);
    }

    let outcome = fx
        .orchestrator
        .run(&SetupOptions::default())
        .await
        .unwrap();
    let SetupOutcome::Completed(stats) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(stats.files_processed, 4);
    assert_eq!(stats.timeouts, 0);
    assert_eq!(stats.failures, 0);

    let registry_stats = fx.indexer.registry().stats().unwrap();
    assert_eq!(registry_stats.total_sessions, 4);
    assert!(registry_stats.total_chunks >= 4);
}

#[tokio::test]
async fn batch_then_resume_matches_uninterrupted_run() {
    // Interrupted-and-resumed setup must land in the same final state as a
    // single uninterrupted run.
    let interrupted = fixture();
    let straight = fixture();
    for fx in [&interrupted, &straight] {
        for i in 0..6 {
            write_transcript(fx.producer.path(), &format!("s{i}.jsonl"), 3);
        }
    }

    // Interrupted path: one small batch first, then a resumed full run.
    let options = SetupOptions {
        batch_size: 2,
        ..Default::default()
    };
    let batch = interrupted
        .orchestrator
        .run_single_batch(&options)
        .await
        .unwrap();
    assert_eq!(batch, BatchOutcome::MoreRemaining);
    let state = load_state(&interrupted.storage);
    assert_eq!(state.processed_paths.len(), 2);

    let resumed = interrupted
        .orchestrator
        .run(&SetupOptions {
            resume: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let SetupOutcome::Completed(stats) = resumed else {
        panic!("expected completion");
    };
    // Only the remaining four were processed in the resumed run.
    assert_eq!(stats.files_processed, 4);

    straight
        .orchestrator
        .run(&SetupOptions::default())
        .await
        .unwrap();

    let a = interrupted.indexer.registry().stats().unwrap();
    let b = straight.indexer.registry().stats().unwrap();
    assert_eq!(a.total_sessions, b.total_sessions);
    assert_eq!(a.total_chunks, b.total_chunks);
    assert_eq!(a.total_messages, b.total_messages);
}

#[tokio::test]
async fn timeouts_are_recorded_separately_and_retryable() {
    let fx = fixture();
    write_transcript(fx.producer.path(), "slow.jsonl", 400);

    // A sub-millisecond deadline cannot finish any real parse.
    let outcome = fx
        .orchestrator
        .run(&SetupOptions {
            timeout_per_session: Duration::from_nanos(1),
            ..Default::default()
        })
        .await
        .unwrap();
    let SetupOutcome::Completed(stats) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.failures, 0);
    let state = load_state(&fx.storage);
    assert_eq!(state.timed_out_paths.len(), 1);
    assert!(state.failed_paths.is_empty());

    // Retrying with a sane deadline succeeds and clears the timeout list.
    let retried = fx
        .orchestrator
        .run(&SetupOptions {
            resume: true,
            retry_timeouts: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let SetupOutcome::Completed(stats) = retried else {
        panic!("expected completion");
    };
    assert_eq!(stats.files_processed, 1);
    let state = load_state(&fx.storage);
    assert!(state.timed_out_paths.is_empty());
    assert!(fx.indexer.registry().get("slow").unwrap().is_some());
}

#[tokio::test]
async fn cancellation_saves_state_and_reports_interrupted() {
    let fx = fixture();
    for i in 0..3 {
        write_transcript(fx.producer.path(), &format!("s{i}.jsonl"), 3);
    }

    fx.orchestrator.cancel();
    let outcome = fx
        .orchestrator
        .run(&SetupOptions::default())
        .await
        .unwrap();
    assert!(matches!(outcome, SetupOutcome::Interrupted(_)));
    assert!(fx.storage.path().join("setup_state.json").exists());
}

#[tokio::test]
async fn parallel_workers_reach_the_same_state() {
    let fx = fixture();
    for i in 0..8 {
        write_transcript(fx.producer.path(), &format!("p{i}.jsonl"), 3);
    }

    let outcome = fx
        .orchestrator
        .run(&SetupOptions {
            workers: 4,
            ..Default::default()
        })
        .await
        .unwrap();
    let SetupOutcome::Completed(stats) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(stats.files_processed, 8);
    assert_eq!(fx.indexer.registry().stats().unwrap().total_sessions, 8);
    let state = load_state(&fx.storage);
    assert_eq!(state.processed_paths.len(), 8);
}
