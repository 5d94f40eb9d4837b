//! Session tagging.
//!
//! Tags are lowercase-normalized and restricted to `[a-z0-9_-]`, 1–50
//! characters. Every mutation rewrites the session's chunk tag metadata in
//! the store so tag-filtered search stays correct.

use crate::error::{Result, SearchError};
use refork_registry::{SessionFilter, SessionRegistry, SessionUpdate};
use refork_vector_store::VectorStore;
use std::sync::Arc;

const MAX_TAG_LEN: usize = 50;

pub struct TagService {
    store: Arc<VectorStore>,
    registry: Arc<SessionRegistry>,
}

impl TagService {
    pub fn new(store: Arc<VectorStore>, registry: Arc<SessionRegistry>) -> Self {
        Self { store, registry }
    }

    /// Add a tag to a session. Returns the session's full tag set.
    pub fn add_tag(&self, session_id: &str, raw_tag: &str) -> Result<Vec<String>> {
        let tag = normalize_tag(raw_tag)?;
        let metadata = self
            .registry
            .get(session_id)?
            .ok_or_else(|| SearchError::NotFound(session_id.to_string()))?;

        let mut tags = metadata.tags;
        if !tags.contains(&tag) {
            tags.push(tag);
            tags.sort();
            self.apply(session_id, &tags)?;
        }
        Ok(tags)
    }

    /// Remove a tag from a session. Returns the remaining tag set.
    pub fn remove_tag(&self, session_id: &str, raw_tag: &str) -> Result<Vec<String>> {
        let tag = normalize_tag(raw_tag)?;
        let metadata = self
            .registry
            .get(session_id)?
            .ok_or_else(|| SearchError::NotFound(session_id.to_string()))?;

        let mut tags = metadata.tags;
        let before = tags.len();
        tags.retain(|t| t != &tag);
        if tags.len() != before {
            self.apply(session_id, &tags)?;
        }
        Ok(tags)
    }

    pub fn list_tags(&self, session_id: &str) -> Result<Vec<String>> {
        let metadata = self
            .registry
            .get(session_id)?
            .ok_or_else(|| SearchError::NotFound(session_id.to_string()))?;
        Ok(metadata.tags)
    }

    /// Session ids carrying `raw_tag`.
    pub fn find_by_tag(&self, raw_tag: &str) -> Result<Vec<String>> {
        let tag = normalize_tag(raw_tag)?;
        Ok(self
            .registry
            .list(&SessionFilter {
                tag: Some(tag),
                ..Default::default()
            })?
            .into_iter()
            .map(|session| session.session_id)
            .collect())
    }

    fn apply(&self, session_id: &str, tags: &[String]) -> Result<()> {
        self.registry.update(
            session_id,
            SessionUpdate {
                tags: Some(tags.to_vec()),
                ..Default::default()
            },
        )?;
        self.store.set_session_tags(session_id, tags)?;
        Ok(())
    }
}

fn normalize_tag(raw: &str) -> Result<String> {
    let tag = raw.trim().to_lowercase();
    if tag.is_empty() || tag.len() > MAX_TAG_LEN {
        return Err(SearchError::InvalidArgument(format!(
            "tag must be 1-{MAX_TAG_LEN} characters"
        )));
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(SearchError::InvalidArgument(format!(
            "tag '{tag}' may only contain a-z, 0-9, '-' and '_'"
        )));
    }
    Ok(tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use refork_registry::SessionMetadata;
    use refork_vector_store::{ChunkRecord, Partition, SearchFilter as StoreFilter};
    use tempfile::TempDir;

    fn fixture() -> (TagService, Arc<VectorStore>, Arc<SessionRegistry>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(VectorStore::open(tmp.path(), 4).unwrap());
        let registry = Arc::new(
            SessionRegistry::open(&tmp.path().join("session-registry.json")).unwrap(),
        );
        store
            .upsert_chunks(vec![(
                ChunkRecord {
                    session_id: "s".to_string(),
                    chunk_index: 0,
                    text: "tagged content".to_string(),
                    token_count: 2,
                    project: "demo".to_string(),
                    timestamp: None,
                    first_message: 0,
                    last_message: 0,
                    memory_types: Vec::new(),
                    tags: Vec::new(),
                    archived: false,
                },
                vec![1.0, 0.0, 0.0, 0.0],
            )])
            .unwrap();
        registry.add(SessionMetadata::new("s")).unwrap();
        (
            TagService::new(store.clone(), registry.clone()),
            store,
            registry,
            tmp,
        )
    }

    #[test]
    fn add_normalizes_and_updates_store_metadata() {
        let (service, store, registry, _tmp) = fixture();
        let tags = service.add_tag("s", "  OAuth ").unwrap();
        assert_eq!(tags, vec!["oauth".to_string()]);
        assert_eq!(registry.get("s").unwrap().unwrap().tags, vec!["oauth"]);

        // Tag-filtered chunk search must see the new tag.
        let hits = store
            .search(
                &[1.0, 0.0, 0.0, 0.0],
                10,
                &StoreFilter {
                    tags: Some(vec!["oauth".to_string()]),
                    ..Default::default()
                },
                &[Partition::Active],
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let (service, _store, _registry, _tmp) = fixture();
        service.add_tag("s", "rust").unwrap();
        let tags = service.add_tag("s", "RUST").unwrap();
        assert_eq!(tags, vec!["rust".to_string()]);
    }

    #[test]
    fn remove_clears_store_metadata() {
        let (service, store, _registry, _tmp) = fixture();
        service.add_tag("s", "temp").unwrap();
        let tags = service.remove_tag("s", "temp").unwrap();
        assert!(tags.is_empty());

        let hits = store
            .search(
                &[1.0, 0.0, 0.0, 0.0],
                10,
                &StoreFilter {
                    tags: Some(vec!["temp".to_string()]),
                    ..Default::default()
                },
                &[Partition::Active],
            )
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn rejects_invalid_tags() {
        let (service, _store, _registry, _tmp) = fixture();
        assert!(service.add_tag("s", "").is_err());
        assert!(service.add_tag("s", "has space").is_err());
        assert!(service.add_tag("s", &"x".repeat(60)).is_err());
        assert!(service.add_tag("s", "emoji💥").is_err());
    }

    #[test]
    fn find_by_tag_lists_sessions() {
        let (service, _store, registry, _tmp) = fixture();
        registry.add(SessionMetadata::new("other")).unwrap();
        service.add_tag("s", "findme").unwrap();

        assert_eq!(service.find_by_tag("FindMe").unwrap(), vec!["s".to_string()]);
        assert!(service.find_by_tag("absent").unwrap().is_empty());
    }

    #[test]
    fn unknown_session_is_not_found() {
        let (service, _store, _registry, _tmp) = fixture();
        assert!(matches!(
            service.list_tags("ghost"),
            Err(SearchError::NotFound(_))
        ));
    }
}
