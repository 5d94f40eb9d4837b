//! Background indexer: debounce coalescing and incremental re-index.

use refork_config::Config;
use refork_indexer::{BackgroundIndexer, SessionIndexer, WatcherConfig};
use refork_registry::SessionRegistry;
use refork_vector_store::{EmbeddingGateway, EmbeddingModel, GatewayLimits, VectorStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DIM: usize = 16;

fn build_indexer(storage: &Path) -> Arc<SessionIndexer> {
    std::env::set_var("REFORK_EMBEDDING_MODE", "stub");
    let config = Config::default();
    let store = Arc::new(VectorStore::open(storage, DIM).unwrap());
    let registry =
        Arc::new(SessionRegistry::open(&storage.join("session-registry.json")).unwrap());
    let gateway = Arc::new(
        EmbeddingGateway::new(
            EmbeddingModel::new(DIM).unwrap(),
            &storage.join("embedding_cache"),
            GatewayLimits::default(),
        )
        .unwrap(),
    );
    Arc::new(SessionIndexer::new(&config, storage, gateway, store, registry).unwrap())
}

fn write_lines(path: &Path, count: usize) {
    let mut content = String::new();
    for i in 0..count {
        content.push_str(&format!(
            r#"{{"role":"user","content":"watched message {i} with plenty of content to chunk"}}"#
        ));
        content.push('\n');
    }
    std::fs::write(path, content).unwrap();
}

async fn wait_for<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn burst_of_events_indexes_exactly_once() {
    let storage = TempDir::new().unwrap();
    let producer = TempDir::new().unwrap();
    let indexer = build_indexer(storage.path());

    let watcher = BackgroundIndexer::start(
        indexer.clone(),
        producer.path(),
        WatcherConfig {
            debounce: Duration::from_millis(300),
            workers: 1,
            queue_capacity: 16,
        },
    )
    .unwrap();

    // Three rapid modifications within the debounce window.
    let path = producer.path().join("burst.jsonl");
    for n in [2usize, 4, 6] {
        write_lines(&path, n);
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    let indexed = wait_for(Duration::from_secs(5), || {
        watcher.health().files_indexed >= 1
    })
    .await;
    assert!(indexed, "file never indexed: {:?}", watcher.health());

    // Let any stray timers fire; the burst must have coalesced.
    tokio::time::sleep(Duration::from_millis(800)).await;
    let health = watcher.health();
    assert_eq!(health.files_indexed, 1, "expected one coalesced index");

    let metadata = indexer.registry().get("burst").unwrap().unwrap();
    assert_eq!(metadata.message_count, 6);

    watcher.shutdown().await;
}

#[tokio::test]
async fn manual_trigger_bypasses_debounce() {
    let storage = TempDir::new().unwrap();
    let producer = TempDir::new().unwrap();
    let indexer = build_indexer(storage.path());

    let watcher = BackgroundIndexer::start(
        indexer.clone(),
        producer.path(),
        WatcherConfig {
            debounce: Duration::from_secs(60),
            workers: 1,
            queue_capacity: 16,
        },
    )
    .unwrap();

    let path = producer.path().join("manual.jsonl");
    write_lines(&path, 3);
    watcher.trigger(&path).await.unwrap();

    let indexed = wait_for(Duration::from_secs(5), || {
        indexer.registry().get("manual").unwrap().is_some()
    })
    .await;
    assert!(indexed);

    watcher.shutdown().await;
}

#[tokio::test]
async fn unchanged_file_is_not_reindexed() {
    let storage = TempDir::new().unwrap();
    let producer = TempDir::new().unwrap();
    let indexer = build_indexer(storage.path());

    let path = producer.path().join("same.jsonl");
    write_lines(&path, 3);
    indexer.index_file(&path).await.unwrap();

    let watcher = BackgroundIndexer::start(
        indexer.clone(),
        producer.path(),
        WatcherConfig {
            debounce: Duration::from_millis(200),
            workers: 1,
            queue_capacity: 16,
        },
    )
    .unwrap();

    // Trigger on a file whose line count matches the registry row.
    watcher.trigger(&path).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(watcher.health().files_indexed, 0);

    // Growing the file makes it eligible again.
    write_lines(&path, 5);
    watcher.trigger(&path).await.unwrap();
    let reindexed = wait_for(Duration::from_secs(5), || {
        indexer
            .registry()
            .get("same")
            .unwrap()
            .is_some_and(|m| m.message_count == 5)
    })
    .await;
    assert!(reindexed);

    watcher.shutdown().await;
}
